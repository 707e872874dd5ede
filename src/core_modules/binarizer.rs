// THEORY:
// The binarizer is the gate between "a frame" and "a frame worth looking at".
// It computes an automatic Otsu threshold for the background-subtracted frame
// and splits the pixels into foreground and background. The threshold value
// itself doubles as a signal detector: a frame holding only sensor noise has
// a flat histogram and a near-zero threshold, so it is dropped here and never
// reaches the tracker. This keeps tracks alive across noisy frames while still
// ending them on genuinely empty gaps.

use crate::config::{Config, GateBoundary};
use crate::core_modules::frame::GrayFrame;
use image::GrayImage;
use imageproc::contrast::{otsu_level, threshold, ThresholdType};

pub const FOREGROUND: u8 = 255;
pub const BACKGROUND: u8 = 0;

/// Computes the Otsu threshold of `image` and the binary image it induces
/// (pixels strictly above the threshold become foreground).
pub fn threshold_otsu(image: &GrayImage) -> (f64, GrayImage) {
    let level = otsu_level(image);
    (f64::from(level), threshold(image, level, ThresholdType::Binary))
}

/// Whether an Otsu threshold indicates that the frame carries signal.
pub fn has_tracks(threshold: f64, min_threshold: f64, boundary: GateBoundary) -> bool {
    match boundary {
        GateBoundary::Inclusive => threshold >= min_threshold,
        GateBoundary::Exclusive => threshold > min_threshold,
    }
}

/// Binarizes a background-subtracted frame, or drops it if it has no signal.
pub fn binarize_if_signal(frame: &GrayFrame, config: &Config) -> Option<GrayFrame> {
    let (threshold, binary) = threshold_otsu(&frame.image);
    if has_tracks(threshold, config.min_threshold, config.gate) {
        log::debug!("{frame}: threshold {threshold} passes the gate");
        Some(frame.with_image(binary))
    } else {
        log::debug!("{frame}: threshold {threshold} below {}, dropped", config.min_threshold);
        None
    }
}
