// THEORY:
// `Config` is the single, immutable bag of tunables threaded through every
// stage of the engine. Nothing reads process-wide defaults at runtime: a
// pipeline is built from one `Config`, validates it once, and hands a shared
// reference to each stage.
//
// The struct is serde-enabled with `#[serde(default)]` so that a partial
// TOML file (or any other serde format) overrides only the fields it names.

use crate::error::{ChamberError, Result};
use serde::{Deserialize, Serialize};

/// Which background model feeds the binarizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BgMethod {
    /// Mean of every `bg_jump`-th frame of each `bg_batch_size` batch.
    BatchAverage,
    /// One running background, replaced by the first quiet frame after a signal run.
    ReplaceOnQuiescence,
    /// Per-pixel exponentially updated mean and variance.
    Adaptive,
}

/// How the Otsu threshold is compared against `min_threshold`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateBoundary {
    /// `threshold >= min_threshold` has signal.
    Inclusive,
    /// `threshold > min_threshold` has signal.
    Exclusive,
}

/// What the tracker does when one contour is close to several open tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmbiguityPolicy {
    /// Abort the run with `ChamberError::AmbiguousAssociation`.
    Fail,
    /// Drop the contour (it neither extends nor starts a track) and keep going.
    Ignore,
}

/// Pixels removed from each border after scaling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CropBox {
    pub top: u32,
    pub bottom: u32,
    pub left: u32,
    pub right: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // --- Preprocessing ---
    /// Side of the square smoothing kernel. Must be odd.
    pub blur_size: u32,
    /// Uniform scale applied to every frame before anything else.
    pub scale_factor: f64,
    pub crop_box: CropBox,

    // --- Background model ---
    pub bg_method: BgMethod,
    /// Sampling stride inside a batch for the batch-average background.
    pub bg_jump: usize,
    pub bg_batch_size: usize,
    /// Exponential update weight of the adaptive accumulator, in (0, 1].
    pub adaptive_learning_rate: f64,
    /// Distance from the running mean, in standard deviations, at which the
    /// adaptive accumulator reports a pixel as foreground.
    pub adaptive_sigma: f64,

    // --- Binarizer / gate ---
    /// Otsu threshold floor for "this frame has signal".
    pub min_threshold: f64,
    pub gate: GateBoundary,

    // --- Contours ---
    pub min_contour_size: f64,
    pub min_aspect_ratio: f64,
    pub max_contour_width: f64,
    /// Proximity radius used when joining contours.
    pub dist_close: f64,
    /// Only every Nth boundary point takes part in the proximity test.
    pub closeness_stride: usize,

    // --- Tracking ---
    /// Maximum centroid drift between two consecutive frames of one track.
    pub track_distance: f64,
    pub ambiguity: AmbiguityPolicy,
    /// Tracks spanning this many frames or fewer never become particles.
    pub min_track_length: u64,

    // --- Debug ---
    pub prints: bool,
    pub display: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            blur_size: 15,
            scale_factor: 0.6,
            crop_box: CropBox::default(),
            bg_method: BgMethod::BatchAverage,
            bg_jump: 5,
            bg_batch_size: 200,
            adaptive_learning_rate: 0.05,
            adaptive_sigma: 4.0,
            min_threshold: 3.0,
            gate: GateBoundary::Inclusive,
            min_contour_size: 500.0,
            min_aspect_ratio: 3.0,
            max_contour_width: 100.0,
            dist_close: 30.0,
            closeness_stride: 10,
            track_distance: 120.0,
            ambiguity: AmbiguityPolicy::Fail,
            min_track_length: 5,
            prints: true,
            display: false,
        }
    }
}

impl Config {
    /// Rejects configurations that could only fail later, mid-stream.
    pub fn validate(&self) -> Result<()> {
        if self.blur_size == 0 || self.blur_size % 2 == 0 {
            return Err(invalid(format!("blur_size must be odd, got {}", self.blur_size)));
        }
        if !self.scale_factor.is_finite() || self.scale_factor <= 0.0 {
            return Err(invalid(format!(
                "scale_factor must be positive, got {}",
                self.scale_factor
            )));
        }
        if self.bg_batch_size == 0 {
            return Err(invalid("bg_batch_size must be positive".to_string()));
        }
        if self.bg_jump == 0 {
            return Err(invalid("bg_jump must be positive".to_string()));
        }
        if !(self.adaptive_learning_rate > 0.0 && self.adaptive_learning_rate <= 1.0) {
            return Err(invalid(format!(
                "adaptive_learning_rate must lie in (0, 1], got {}",
                self.adaptive_learning_rate
            )));
        }
        if !(self.adaptive_sigma > 0.0) {
            return Err(invalid("adaptive_sigma must be positive".to_string()));
        }
        if self.closeness_stride == 0 {
            return Err(invalid("closeness_stride must be positive".to_string()));
        }
        for (name, value) in [
            ("min_threshold", self.min_threshold),
            ("min_contour_size", self.min_contour_size),
            ("min_aspect_ratio", self.min_aspect_ratio),
            ("max_contour_width", self.max_contour_width),
            ("dist_close", self.dist_close),
            ("track_distance", self.track_distance),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(format!("{name} must be a non-negative number, got {value}")));
            }
        }
        Ok(())
    }
}

fn invalid(reason: String) -> ChamberError {
    ChamberError::InvalidConfig(reason)
}
