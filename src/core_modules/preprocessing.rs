// THEORY:
// Preprocessing is the stateless front door of the engine. Each raw frame is
// scaled, cropped and collapsed to a single intensity channel, then smoothed.
// Both operations are pure: the same frame and the same `Config` always give
// the same output, which is what lets the parallel pipeline run them on any
// worker and in any order before funnelling the results back into sequence.

use crate::config::Config;
use crate::core_modules::frame::{Frame, GrayFrame};
use crate::error::{ChamberError, Result};
use image::imageops::FilterType;
use image::GenericImageView;
use imageproc::filter::gaussian_blur_f32;

const UNIT_SCALE_EPSILON: f64 = 1e-9;

/// Scales by `config.scale_factor`, removes `config.crop_box`, converts to grayscale.
pub fn preprocess(frame: &Frame, config: &Config) -> Result<GrayFrame> {
    let (width, height) = frame.image.dimensions();
    if width == 0 || height == 0 {
        return Err(malformed(frame, "image has no pixels".to_string()));
    }

    // --- 1. Scale ---
    let scaled = if (config.scale_factor - 1.0).abs() > UNIT_SCALE_EPSILON {
        let new_width = scaled_len(width, config.scale_factor);
        let new_height = scaled_len(height, config.scale_factor);
        frame
            .image
            .resize_exact(new_width, new_height, FilterType::Triangle)
    } else {
        frame.image.clone()
    };

    // --- 2. Crop ---
    let (width, height) = scaled.dimensions();
    let crop = config.crop_box;
    if crop.left + crop.right >= width || crop.top + crop.bottom >= height {
        return Err(malformed(
            frame,
            format!("crop box {crop:?} removes the whole {width}x{height} image"),
        ));
    }
    let cropped = scaled.crop_imm(
        crop.left,
        crop.top,
        width - crop.left - crop.right,
        height - crop.top - crop.bottom,
    );

    // --- 3. Grayscale ---
    Ok(frame.with_image(cropped.to_luma8()))
}

/// Applies a square blur of side `config.blur_size`.
pub fn smooth(frame: &GrayFrame, config: &Config) -> GrayFrame {
    if config.blur_size <= 1 {
        return frame.clone();
    }
    frame.with_image(gaussian_blur_f32(&frame.image, kernel_sigma(config.blur_size)))
}

/// Standard deviation matching a Gaussian kernel of the given side, using the
/// usual `0.3 * ((k - 1) / 2 - 1) + 0.8` rule.
fn kernel_sigma(kernel_size: u32) -> f32 {
    0.3 * ((kernel_size as f32 - 1.0) * 0.5 - 1.0) + 0.8
}

fn scaled_len(len: u32, factor: f64) -> u32 {
    ((len as f64 * factor).round() as u32).max(1)
}

fn malformed<I>(frame: &Frame<I>, reason: String) -> ChamberError {
    ChamberError::InvalidFrame {
        index: frame.index(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CropBox;
    use crate::core_modules::frame::FrameRef;
    use image::{DynamicImage, GrayImage, Luma, Rgb, RgbImage};
    use std::time::Duration;

    fn color_frame(width: u32, height: u32) -> Frame {
        let image = RgbImage::from_fn(width, height, |x, _| Rgb([(x * 10) as u8, 100, 50]));
        Frame::new(
            DynamicImage::ImageRgb8(image),
            FrameRef::new(3, Duration::from_millis(120), "test"),
        )
    }

    #[test]
    fn preprocess_scales_crops_and_grays() {
        let config = Config {
            scale_factor: 0.5,
            crop_box: CropBox { top: 1, bottom: 2, left: 3, right: 0 },
            ..Config::default()
        };
        let out = preprocess(&color_frame(20, 10), &config).unwrap();
        // 20x10 -> 10x5 -> crop 3 columns and 3 rows.
        assert_eq!(out.image.dimensions(), (7, 2));
        assert_eq!(out.reference.index, 3);
    }

    #[test]
    fn preprocess_is_deterministic() {
        let config = Config::default();
        let frame = color_frame(32, 16);
        assert_eq!(preprocess(&frame, &config).unwrap(), preprocess(&frame, &config).unwrap());
    }

    #[test]
    fn crop_larger_than_frame_is_rejected() {
        let config = Config {
            scale_factor: 1.0,
            crop_box: CropBox { top: 5, bottom: 5, left: 0, right: 0 },
            ..Config::default()
        };
        let err = preprocess(&color_frame(10, 10), &config).unwrap_err();
        assert!(matches!(err, ChamberError::InvalidFrame { index: 3, .. }));
    }

    #[test]
    fn smoothing_keeps_uniform_images_uniform() {
        let frame = Frame::new(
            GrayImage::from_pixel(16, 16, Luma([80])),
            FrameRef::new(0, Duration::ZERO, "test"),
        );
        let config = Config { blur_size: 5, ..Config::default() };
        let smoothed = smooth(&frame, &config);
        assert!(smoothed.image.pixels().all(|p| p.0[0].abs_diff(80) <= 1));
    }

    #[test]
    fn unit_kernel_is_identity() {
        let frame = Frame::new(
            GrayImage::from_fn(4, 4, |x, y| Luma([(x * 4 + y) as u8])),
            FrameRef::new(0, Duration::ZERO, "test"),
        );
        let config = Config { blur_size: 1, ..Config::default() };
        assert_eq!(smooth(&frame, &config), frame);
    }
}
