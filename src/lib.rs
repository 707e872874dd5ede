// THEORY:
// This file is the main entry point for the `cloud_chamber` library crate.
// It exposes the detection-and-association engine that turns a forward-only
// stream of cloud chamber video frames into a finite list of `Particle`
// records.
//
// The public surface is deliberately small: `DetectionPipeline` (sequential)
// and `ParallelPipeline` (ordered, concurrent preprocessing) plus the data
// types they hand back (`Track`, `Particle`, `Config`). The algorithmic stages
// live in `core_modules`, one file per stage, in the order frames flow through
// them: preprocessing, background model, binarizer, contour detector,
// tracker, particle reducer.
//
// Video decoding, windows, CSV files and argument parsing are not part of this
// crate. They are provided by callers through the `FrameSource` trait.

pub mod config;
pub mod core_modules;
pub mod error;
pub mod parallel_pipeline;
pub mod pipeline;

pub use config::{AmbiguityPolicy, BgMethod, Config, CropBox, GateBoundary};
pub use error::{ChamberError, Result};
pub use parallel_pipeline::ParallelPipeline;
pub use pipeline::{DetectionPipeline, Particle, Track};
