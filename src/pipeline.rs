// THEORY:
// The `pipeline` module is the top-level API of the engine. It wires the
// stages together in the only order that makes sense for a cloud chamber
// recording and hides their state behind one object:
//
//   preprocess -> smooth -> background model (+ gate) -> contours -> tracker
//
// Frames are pushed one at a time, strictly in index order. The pipeline can
// be finished at any point; it then flushes the background model's buffered
// batch and hands back every track found so far. Particle reduction happens
// after that, over the complete set of tracks.

use crate::config::Config;
use crate::core_modules::background::BackgroundModel;
use crate::core_modules::contour_detector::contour_detector;
use crate::core_modules::preprocessing::{preprocess, smooth};
use crate::core_modules::track::TrackArena;
use crate::core_modules::tracker::Tracker;
use crate::error::Result;

// Re-export key data structures for the public API.
pub use crate::core_modules::frame::{Frame, FrameRef, FrameSource, GrayFrame, VecFrameSource};
pub use crate::core_modules::particle::{filter_tracks, reduce, Particle, ParticleRecord};
pub use crate::core_modules::track::{Snapshot, Track};

/// Counters describing a run so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Frames pushed into the background model.
    pub frames: u64,
    /// Frames that passed the gate and reached the tracker.
    pub frames_with_signal: u64,
    /// Track-like contours handed to the tracker.
    pub contours: u64,
}

/// The sequential detection-and-association engine.
pub struct DetectionPipeline {
    config: Config,
    background: BackgroundModel,
    tracker: Tracker,
    stats: PipelineStats,
}

impl DetectionPipeline {
    /// Builds a pipeline, rejecting a malformed configuration up front.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            background: BackgroundModel::new(&config),
            tracker: Tracker::new(),
            stats: PipelineStats::default(),
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    /// Every track created so far, open or not.
    pub fn tracks(&self) -> &TrackArena {
        self.tracker.tracks()
    }

    /// Runs one raw frame through the whole engine.
    pub fn push_frame(&mut self, frame: &Frame) -> Result<()> {
        let prepared = prepare_frame(frame, &self.config)?;
        self.push_prepared(prepared)
    }

    /// Entry point for frames already preprocessed and smoothed.
    pub fn push_prepared(&mut self, frame: GrayFrame) -> Result<()> {
        self.stats.frames += 1;
        for binary in self.background.push(frame, &self.config)? {
            self.associate(binary)?;
        }
        Ok(())
    }

    /// Flushes the background model and returns every track.
    pub fn finish(mut self) -> Result<Vec<Track>> {
        for binary in self.background.finish(&self.config) {
            self.associate(binary)?;
        }
        if self.config.prints {
            log::info!(
                "{} frames, {} with signal, {} contours, {} tracks",
                self.stats.frames,
                self.stats.frames_with_signal,
                self.stats.contours,
                self.tracker.tracks().len()
            );
        }
        Ok(self.tracker.into_tracks())
    }

    /// Consumes a whole frame stream. The first error stops the run.
    pub fn process<I>(mut self, frames: I) -> Result<Vec<Track>>
    where
        I: IntoIterator<Item = Result<Frame>>,
    {
        for frame in frames {
            self.push_frame(&frame?)?;
        }
        self.finish()
    }

    fn associate(&mut self, binary: GrayFrame) -> Result<()> {
        let contours = contour_detector::detect_track_contours(&binary.image, &self.config);
        self.stats.frames_with_signal += 1;
        self.stats.contours += contours.len() as u64;
        let summary = self.tracker.update(contours, &binary.reference, &self.config)?;
        if self.config.display {
            log::info!(
                "{binary}: {} extended, {} started, {} skipped",
                summary.extended,
                summary.started,
                summary.skipped
            );
        }
        Ok(())
    }
}

/// The pure per-frame part of the engine: preprocessing then smoothing.
pub fn prepare_frame(frame: &Frame, config: &Config) -> Result<GrayFrame> {
    let gray = preprocess(frame, config)?;
    Ok(smooth(&gray, config))
}

/// Re-reads each particle's best frame to measure its intensity.
pub fn measure_particles(
    particles: &mut [Particle],
    source: &mut dyn FrameSource,
    config: &Config,
) -> Result<()> {
    for particle in particles.iter_mut() {
        particle.measure_intensity(source, config)?;
    }
    Ok(())
}

/// Runs a frame source end to end: tracking, reduction and intensity measurement.
pub fn extract_particles(source: &mut dyn FrameSource, config: &Config) -> Result<Vec<Particle>> {
    let pipeline = DetectionPipeline::new(config.clone())?;
    let tracks = pipeline.process(source.frames())?;
    let mut particles = reduce(tracks, config);
    measure_particles(&mut particles, source, config)?;
    Ok(particles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChamberError;
    use image::{DynamicImage, GrayImage, Luma};
    use std::time::Duration;

    fn config() -> Config {
        Config {
            scale_factor: 1.0,
            blur_size: 1,
            bg_batch_size: 8,
            bg_jump: 8,
            min_threshold: 0.0,
            min_contour_size: 50.0,
            track_distance: 10.0,
            min_track_length: 1,
            prints: false,
            ..Config::default()
        }
    }

    fn streak_frame(index: u64, offset: u32) -> Frame {
        let image = GrayImage::from_fn(120, 60, |x, y| {
            if (10 + offset..60 + offset).contains(&x) && (20..26).contains(&y) {
                Luma([255])
            } else {
                Luma([0])
            }
        });
        Frame::new(
            DynamicImage::ImageLuma8(image),
            FrameRef::new(index, Duration::from_millis(index * 40), "t"),
        )
    }

    fn empty_frame(index: u64) -> Frame {
        Frame::new(
            DynamicImage::ImageLuma8(GrayImage::new(120, 60)),
            FrameRef::new(index, Duration::from_millis(index * 40), "t"),
        )
    }

    #[test]
    fn malformed_config_fails_at_construction() {
        let config = Config { bg_batch_size: 0, ..config() };
        assert!(matches!(
            DetectionPipeline::new(config),
            Err(ChamberError::InvalidConfig(_))
        ));
    }

    #[test]
    fn moving_streak_becomes_one_track() {
        let mut frames = vec![Ok(empty_frame(0))];
        frames.extend((1..8).map(|i| Ok(streak_frame(i, 3 * i as u32))));
        let tracks = DetectionPipeline::new(config()).unwrap().process(frames).unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].start().index(), 1);
        assert_eq!(tracks[0].end().index(), 7);
    }

    #[test]
    fn partial_run_can_be_finished() {
        let mut pipeline = DetectionPipeline::new(config()).unwrap();
        pipeline.push_frame(&empty_frame(0)).unwrap();
        pipeline.push_frame(&streak_frame(1, 0)).unwrap();
        // Still buffered in the background batch.
        assert!(pipeline.tracks().is_empty());
        assert_eq!(pipeline.stats().frames, 2);
        let tracks = pipeline.finish().unwrap();
        assert_eq!(tracks.len(), 1);
    }

    #[test]
    fn source_errors_are_propagated() {
        let frames = vec![
            Ok(empty_frame(0)),
            Err(ChamberError::source(std::io::Error::other("decoder died"))),
        ];
        let err = DetectionPipeline::new(config()).unwrap().process(frames).unwrap_err();
        assert!(matches!(err, ChamberError::FrameSource(_)));
    }

    #[test]
    fn extract_particles_measures_intensity() {
        let mut frames = vec![empty_frame(0)];
        frames.extend((1..8).map(|i| streak_frame(i, 2 * i as u32)));
        let mut source = VecFrameSource::new(frames);
        let particles = extract_particles(&mut source, &config()).unwrap();
        assert_eq!(particles.len(), 1);
        assert_eq!(particles[0].extent(), 6);
        assert_eq!(particles[0].intensity, Some(255.0));
    }
}
