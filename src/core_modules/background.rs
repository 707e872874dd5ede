// THEORY:
// The background model is the temporal layer of the engine. A cloud chamber
// image is dominated by static or slowly drifting structure (the chamber floor,
// reflections, uneven lighting); particle tracks are short-lived bright
// streaks on top of it. Each strategy estimates "the chamber with nothing in
// it" and removes it, so that only transient signal reaches the binarizer.
//
// Three strategies are available, selected by `Config::bg_method`:
// 1.  **Batch average**: frames are cut into fixed-size batches; every
//     `bg_jump`-th frame of a batch is averaged into that batch's background.
//     Nothing is emitted until a batch is complete, so this is the only stage
//     with bounded lookahead. Stateless from one batch to the next.
// 2.  **Replace on quiescence**: one running background, seeded with the first
//     frame. After a run of signal-bearing frames the first quiet frame becomes
//     the new background, which follows slow lighting changes without ever
//     absorbing a track.
// 3.  **Adaptive**: a per-pixel exponential estimate of mean and variance. A
//     pixel is foreground when it sits more than `adaptive_sigma` standard
//     deviations from its learned mean. Every frame produces a mask; there is
//     no gate.
//
// Whatever the strategy, the output is a stream of *binary* frames carrying
// the identity of the frame they were computed from, and frames found to hold
// no signal are already gone.

use crate::config::{BgMethod, Config};
use crate::core_modules::binarizer::{
    binarize_if_signal, has_tracks, threshold_otsu, BACKGROUND, FOREGROUND,
};
use crate::core_modules::frame::GrayFrame;
use crate::error::{ChamberError, Result};
use image::GrayImage;
use std::collections::VecDeque;

/// Variance floor of the adaptive model, in squared grey levels.
const MIN_ADAPTIVE_VARIANCE: f32 = 4.0;

/// The background strategy selected for a run, with its state.
#[derive(Debug)]
pub enum BackgroundModel {
    BatchAverage(BatchAverage),
    ReplaceOnQuiescence(QuiescenceBackground),
    Adaptive(AdaptiveBackground),
}

impl BackgroundModel {
    pub fn new(config: &Config) -> Self {
        match config.bg_method {
            BgMethod::BatchAverage => Self::BatchAverage(BatchAverage::default()),
            BgMethod::ReplaceOnQuiescence => {
                Self::ReplaceOnQuiescence(QuiescenceBackground::default())
            }
            BgMethod::Adaptive => Self::Adaptive(AdaptiveBackground::default()),
        }
    }

    /// Feeds one smoothed frame and returns the binary frames that became
    /// ready, in index order. May return nothing (buffering, or no signal).
    pub fn push(&mut self, frame: GrayFrame, config: &Config) -> Result<Vec<GrayFrame>> {
        match self {
            Self::BatchAverage(model) => model.push(frame, config),
            Self::ReplaceOnQuiescence(model) => Ok(model.push(frame, config)?.into_iter().collect()),
            Self::Adaptive(model) => Ok(vec![model.push(frame, config)?]),
        }
    }

    /// Flushes whatever is still buffered once the stream has ended.
    pub fn finish(&mut self, config: &Config) -> Vec<GrayFrame> {
        match self {
            Self::BatchAverage(model) => model.flush(config),
            Self::ReplaceOnQuiescence(_) | Self::Adaptive(_) => Vec::new(),
        }
    }
}

/// Runs a whole frame stream through the configured background model.
pub fn subtract<I>(frames: I, config: &Config) -> Subtracted<'_, I::IntoIter>
where
    I: IntoIterator<Item = Result<GrayFrame>>,
{
    Subtracted {
        frames: frames.into_iter(),
        model: BackgroundModel::new(config),
        config,
        ready: VecDeque::new(),
        exhausted: false,
    }
}

/// Iterator returned by [`subtract`]. Stops after the first error.
pub struct Subtracted<'c, I> {
    frames: I,
    model: BackgroundModel,
    config: &'c Config,
    ready: VecDeque<GrayFrame>,
    exhausted: bool,
}

impl<I> Iterator for Subtracted<'_, I>
where
    I: Iterator<Item = Result<GrayFrame>>,
{
    type Item = Result<GrayFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Some(Ok(frame));
            }
            if self.exhausted {
                return None;
            }
            match self.frames.next() {
                Some(Ok(frame)) => match self.model.push(frame, self.config) {
                    Ok(out) => self.ready.extend(out),
                    Err(e) => {
                        self.exhausted = true;
                        return Some(Err(e));
                    }
                },
                Some(Err(e)) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
                None => {
                    self.exhausted = true;
                    self.ready.extend(self.model.finish(self.config));
                }
            }
        }
    }
}

// --- Batch average ---

#[derive(Debug, Default)]
pub struct BatchAverage {
    batch: Vec<GrayFrame>,
    background: Option<GrayImage>,
}

impl BatchAverage {
    fn push(&mut self, frame: GrayFrame, config: &Config) -> Result<Vec<GrayFrame>> {
        if let Some(first) = self.batch.first() {
            ensure_same_size(&frame, &first.image)?;
        }
        self.batch.push(frame);
        if self.batch.len() >= config.bg_batch_size {
            Ok(self.flush(config))
        } else {
            Ok(Vec::new())
        }
    }

    fn flush(&mut self, config: &Config) -> Vec<GrayFrame> {
        let batch = std::mem::take(&mut self.batch);
        let (Some(first), Some(last)) = (batch.first(), batch.last()) else {
            return Vec::new();
        };
        if config.prints {
            log::info!("Computing BG for {}-{}", first.index(), last.index());
        }
        let Some(background) =
            average_images(batch.iter().step_by(config.bg_jump).map(|frame| &frame.image))
        else {
            return Vec::new();
        };

        let out = batch
            .iter()
            .filter_map(|frame| {
                let difference = frame.with_image(subtract_images(&frame.image, &background));
                binarize_if_signal(&difference, config)
            })
            .collect();
        self.background = Some(background);
        out
    }

    /// The background of the last completed batch.
    pub fn background(&self) -> Option<&GrayImage> {
        self.background.as_ref()
    }
}

// --- Replace on quiescence ---

#[derive(Debug, Default)]
pub struct QuiescenceBackground {
    background: Option<GrayImage>,
    had_tracks: bool,
}

impl QuiescenceBackground {
    /// The first frame only seeds the background and is never emitted.
    fn push(&mut self, frame: GrayFrame, config: &Config) -> Result<Option<GrayFrame>> {
        let Some(background) = &self.background else {
            self.background = Some(frame.image);
            return Ok(None);
        };
        ensure_same_size(&frame, background)?;

        let (threshold, binary) = threshold_otsu(&subtract_images(&frame.image, background));
        if has_tracks(threshold, config.min_threshold, config.gate) {
            log::debug!("{frame}: threshold {threshold} passes the gate");
            self.had_tracks = true;
            return Ok(Some(frame.with_image(binary)));
        }

        if self.had_tracks {
            if config.prints {
                log::info!("New BG is {frame}");
            }
            self.background = Some(frame.image);
        }
        self.had_tracks = false;
        Ok(None)
    }

    pub fn background(&self) -> Option<&GrayImage> {
        self.background.as_ref()
    }
}

// --- Adaptive ---

#[derive(Debug, Default)]
pub struct AdaptiveBackground {
    state: Option<AdaptiveState>,
}

#[derive(Debug)]
struct AdaptiveState {
    width: u32,
    height: u32,
    mean: Vec<f32>,
    variance: Vec<f32>,
}

impl AdaptiveBackground {
    /// Classifies every pixel against the model, then folds the frame into it.
    fn push(&mut self, frame: GrayFrame, config: &Config) -> Result<GrayFrame> {
        let (width, height) = frame.image.dimensions();
        let Some(state) = &mut self.state else {
            self.state = Some(AdaptiveState {
                width,
                height,
                mean: frame.image.as_raw().iter().map(|&v| f32::from(v)).collect(),
                variance: vec![MIN_ADAPTIVE_VARIANCE; frame.image.as_raw().len()],
            });
            return Ok(frame.with_image(GrayImage::new(width, height)));
        };
        if (state.width, state.height) != (width, height) {
            return Err(size_mismatch(&frame, state.width, state.height));
        }

        let rate = config.adaptive_learning_rate as f32;
        let sigma = config.adaptive_sigma as f32;
        let mut mask = GrayImage::new(width, height);
        for (((value, mean), variance), out) in frame
            .image
            .as_raw()
            .iter()
            .zip(state.mean.iter_mut())
            .zip(state.variance.iter_mut())
            .zip(mask.iter_mut())
        {
            let delta = f32::from(*value) - *mean;
            *out = if delta.abs() > sigma * variance.sqrt() {
                FOREGROUND
            } else {
                BACKGROUND
            };
            *mean += rate * delta;
            *variance = ((1.0 - rate) * (*variance + rate * delta * delta)).max(MIN_ADAPTIVE_VARIANCE);
        }
        Ok(frame.with_image(mask))
    }
}

// --- Pixel helpers ---

/// Saturating per-pixel `image - background`.
pub fn subtract_images(image: &GrayImage, background: &GrayImage) -> GrayImage {
    let mut out = image.clone();
    for (pixel, bg) in out.iter_mut().zip(background.as_raw()) {
        *pixel = pixel.saturating_sub(*bg);
    }
    out
}

/// Rounded per-pixel mean of equally sized images, `None` for no images.
pub fn average_images<'a>(images: impl IntoIterator<Item = &'a GrayImage>) -> Option<GrayImage> {
    let mut images = images.into_iter();
    let first = images.next()?;
    let mut sum: Vec<f32> = first.as_raw().iter().map(|&v| f32::from(v)).collect();
    let mut count = 1.0_f32;
    for image in images {
        for (acc, &v) in sum.iter_mut().zip(image.as_raw()) {
            *acc += f32::from(v);
        }
        count += 1.0;
    }
    let raw = sum.into_iter().map(|s| (s / count).round() as u8).collect();
    GrayImage::from_raw(first.width(), first.height(), raw)
}

fn ensure_same_size(frame: &GrayFrame, background: &GrayImage) -> Result<()> {
    let (width, height) = background.dimensions();
    if frame.image.dimensions() == (width, height) {
        Ok(())
    } else {
        Err(size_mismatch(frame, width, height))
    }
}

fn size_mismatch(frame: &GrayFrame, width: u32, height: u32) -> ChamberError {
    ChamberError::InvalidFrame {
        index: frame.index(),
        reason: format!(
            "frame is {}x{} but the background is {width}x{height}",
            frame.image.width(),
            frame.image.height()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::frame::{Frame, FrameRef};
    use image::Luma;
    use std::time::Duration;

    fn frame(index: u64, image: GrayImage) -> GrayFrame {
        Frame::new(image, FrameRef::new(index, Duration::from_millis(index * 40), "t"))
    }

    fn uniform(value: u8) -> GrayImage {
        GrayImage::from_pixel(40, 20, Luma([value]))
    }

    /// A uniform field with a bright horizontal streak.
    fn streak(base: u8, value: u8) -> GrayImage {
        GrayImage::from_fn(40, 20, |x, y| {
            if (8..12).contains(&y) && (5..35).contains(&x) {
                Luma([value])
            } else {
                Luma([base])
            }
        })
    }

    fn batch_config(size: usize, jump: usize) -> Config {
        Config { bg_batch_size: size, bg_jump: jump, ..Config::default() }
    }

    #[test]
    fn constant_batches_have_constant_background() {
        let config = batch_config(4, 2);
        let mut model = BatchAverage::default();
        for batch in 0..2u64 {
            for i in 0..4 {
                let out = model.push(frame(batch * 4 + i, uniform(50)), &config).unwrap();
                // Every frame equals its background, so nothing passes the gate.
                assert!(out.is_empty());
            }
            let background = model.background().unwrap();
            assert!(background.pixels().all(|p| p.0[0] == 50));
        }
    }

    #[test]
    fn background_uses_every_jth_frame() {
        let config = batch_config(4, 2);
        let mut model = BatchAverage::default();
        for (i, value) in [10, 200, 30, 200].into_iter().enumerate() {
            model.push(frame(i as u64, uniform(value)), &config).unwrap();
        }
        assert!(model.background().unwrap().pixels().all(|p| p.0[0] == 20));
    }

    #[test]
    fn batch_emits_only_frames_with_signal() {
        let config = batch_config(4, 4);
        let mut model = BatchAverage::default();
        let images = [uniform(10), uniform(15), streak(15, 200), uniform(15)];
        let mut out = Vec::new();
        for (i, image) in images.into_iter().enumerate() {
            out.extend(model.push(frame(i as u64, image), &config).unwrap());
        }
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].index(), 2);
        assert_eq!(out[0].image.get_pixel(10, 9).0[0], FOREGROUND);
        assert_eq!(out[0].image.get_pixel(0, 0).0[0], BACKGROUND);
    }

    #[test]
    fn finish_flushes_a_partial_batch() {
        let config = Config::default();
        let mut model = BackgroundModel::new(&config);
        assert!(model.push(frame(0, uniform(10)), &config).unwrap().is_empty());
        assert!(model.push(frame(1, streak(15, 200)), &config).unwrap().is_empty());
        let out = model.finish(&config);
        assert_eq!(out.iter().map(|f| f.index()).collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn quiet_frame_after_signal_replaces_background() {
        let config = Config { bg_method: BgMethod::ReplaceOnQuiescence, ..Config::default() };
        let mut model = QuiescenceBackground::default();
        assert!(model.push(frame(0, uniform(10)), &config).unwrap().is_none());

        let signal = model.push(frame(1, streak(15, 200)), &config).unwrap().unwrap();
        assert_eq!(signal.index(), 1);
        assert_eq!(model.background(), Some(&uniform(10)));

        assert!(model.push(frame(2, uniform(40)), &config).unwrap().is_none());
        assert_eq!(model.background(), Some(&uniform(40)));

        let signal = model.push(frame(3, streak(45, 220)), &config).unwrap().unwrap();
        assert_eq!(signal.index(), 3);
    }

    #[test]
    fn quiet_frames_without_prior_signal_keep_background() {
        let config = Config { bg_method: BgMethod::ReplaceOnQuiescence, ..Config::default() };
        let mut model = QuiescenceBackground::default();
        model.push(frame(0, uniform(10)), &config).unwrap();
        assert!(model.push(frame(1, uniform(12)), &config).unwrap().is_none());
        assert_eq!(model.background(), Some(&uniform(10)));
    }

    #[test]
    fn adaptive_marks_sudden_changes() {
        let config = Config { bg_method: BgMethod::Adaptive, ..Config::default() };
        let mut model = BackgroundModel::new(&config);
        for i in 0..5 {
            let out = model.push(frame(i, uniform(20)), &config).unwrap();
            assert_eq!(out.len(), 1);
            assert!(out[0].image.pixels().all(|p| p.0[0] == BACKGROUND));
        }
        let out = model.push(frame(5, streak(20, 200)), &config).unwrap();
        assert_eq!(out[0].index(), 5);
        assert_eq!(out[0].image.get_pixel(10, 9).0[0], FOREGROUND);
        assert_eq!(out[0].image.get_pixel(0, 0).0[0], BACKGROUND);
    }

    #[test]
    fn subtract_keeps_order_and_identity() {
        let config = batch_config(3, 3);
        let frames = vec![
            Ok(frame(0, uniform(10))),
            Ok(frame(1, streak(15, 200))),
            Ok(frame(2, uniform(15))),
            Ok(frame(3, uniform(10))),
            Ok(frame(4, streak(15, 180))),
        ];
        let out: Vec<_> = subtract(frames, &config).collect::<Result<_>>().unwrap();
        let indices: Vec<_> = out.iter().map(|f| f.index()).collect();
        assert_eq!(indices, vec![1, 4]);
        assert_eq!(out[1].timestamp(), Duration::from_millis(160));
    }

    #[test]
    fn mismatched_frame_sizes_are_rejected() {
        let config = batch_config(4, 1);
        let frames = vec![Ok(frame(0, uniform(10))), Ok(frame(1, GrayImage::new(8, 8)))];
        let mut out = subtract(frames, &config);
        assert!(matches!(out.next(), Some(Err(ChamberError::InvalidFrame { index: 1, .. }))));
        assert!(out.next().is_none());
    }
}
