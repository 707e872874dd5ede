// THEORY:
// Frame decoding lives outside the engine. This module provides the two
// `FrameSource`s the runner knows about: a directory of still images, read
// in file-name order with a fixed frame rate, and (behind the `video`
// feature) a video file decoded through OpenCV.

use anyhow::{bail, Context};
use cloud_chamber::pipeline::{Frame, FrameRef, FrameSource};
use cloud_chamber::{ChamberError, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "tif", "tiff"];

/// Image files of one directory, sorted by name, taken as consecutive frames.
#[derive(Debug, Clone)]
pub struct ImageSequence {
    name: Arc<str>,
    paths: Vec<PathBuf>,
    fps: f64,
}

impl ImageSequence {
    pub fn open(dir: &Path, fps: f64) -> anyhow::Result<Self> {
        if !(fps.is_finite() && fps > 0.0) {
            bail!("frame rate must be positive, got {fps}");
        }
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
            let path = entry?.path();
            let is_image = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
            if path.is_file() && is_image {
                paths.push(path);
            }
        }
        if paths.is_empty() {
            bail!("no images found in {}", dir.display());
        }
        paths.sort();
        log::info!("{} images in {}", paths.len(), dir.display());
        Ok(Self {
            name: Arc::from(dir.display().to_string()),
            paths,
            fps,
        })
    }

    pub fn len(&self) -> u64 {
        self.paths.len() as u64
    }

    /// Reads any frame by index from any thread.
    pub fn loader(&self) -> impl Fn(u64) -> Result<Frame> + Send + Sync + 'static {
        let sequence = self.clone();
        move |index| sequence.load(index)
    }

    fn load(&self, index: u64) -> Result<Frame> {
        let path = usize::try_from(index)
            .ok()
            .and_then(|i| self.paths.get(i))
            .ok_or(ChamberError::FrameNotFound(index))?;
        let image = image::open(path).map_err(ChamberError::source)?;
        let reference = FrameRef {
            index,
            timestamp: Duration::from_secs_f64(index as f64 / self.fps),
            source: self.name.clone(),
        };
        Ok(Frame::new(image, reference))
    }
}

impl FrameSource for ImageSequence {
    fn frames(&mut self) -> Box<dyn Iterator<Item = Result<Frame>> + Send + '_> {
        let this = &*self;
        Box::new((0..this.len()).map(move |index| this.load(index)))
    }

    fn read_frame_at(&mut self, index: u64) -> Result<Frame> {
        self.load(index)
    }
}

#[cfg(feature = "video")]
pub use video::VideoFile;

#[cfg(feature = "video")]
mod video {
    use super::*;
    use image::{DynamicImage, RgbImage};
    use opencv::{
        core::Mat,
        imgproc,
        prelude::*,
        videoio::{self, VideoCapture},
    };

    /// A video file decoded with OpenCV.
    pub struct VideoFile {
        name: Arc<str>,
        capture: VideoCapture,
        fps: f64,
    }

    impl VideoFile {
        pub fn open(path: &Path) -> anyhow::Result<Self> {
            let name = path.display().to_string();
            let capture = VideoCapture::from_file(&name, videoio::CAP_ANY)?;
            if !capture.is_opened()? {
                bail!("could not open video {name}");
            }
            let fps = capture.get(videoio::CAP_PROP_FPS)?;
            if !(fps > 0.0) {
                bail!("video {name} reports no frame rate");
            }
            Ok(Self {
                name: Arc::from(name),
                capture,
                fps,
            })
        }

        fn seek(&mut self, index: u64) -> Result<()> {
            self.capture
                .set(videoio::CAP_PROP_POS_FRAMES, index as f64)
                .map_err(ChamberError::source)?;
            Ok(())
        }

        /// Decodes the frame under the read head, `None` at the end of the video.
        fn read_next(&mut self, index: u64) -> Result<Option<Frame>> {
            let mut bgr = Mat::default();
            if !self.capture.read(&mut bgr).map_err(ChamberError::source)? || bgr.empty() {
                return Ok(None);
            }
            let image = mat_to_image(&bgr).map_err(ChamberError::source)?;
            let reference = FrameRef {
                index,
                timestamp: Duration::from_secs_f64(index as f64 / self.fps),
                source: self.name.clone(),
            };
            Ok(Some(Frame::new(image, reference)))
        }
    }

    impl FrameSource for VideoFile {
        fn frames(&mut self) -> Box<dyn Iterator<Item = Result<Frame>> + Send + '_> {
            let mut index = 0;
            let mut failed = self.seek(0).err();
            Box::new(std::iter::from_fn(move || {
                if let Some(e) = failed.take() {
                    return Some(Err(e));
                }
                let next = self.read_next(index).transpose();
                index += 1;
                next
            }))
        }

        fn read_frame_at(&mut self, index: u64) -> Result<Frame> {
            self.seek(index)?;
            self.read_next(index)?.ok_or(ChamberError::FrameNotFound(index))
        }
    }

    fn mat_to_image(bgr: &Mat) -> anyhow::Result<DynamicImage> {
        let mut rgb = Mat::default();
        imgproc::cvt_color(bgr, &mut rgb, imgproc::COLOR_BGR2RGB, 0)?;
        let (width, height) = (rgb.cols() as u32, rgb.rows() as u32);
        let bytes = rgb.data_bytes()?.to_vec();
        let image = RgbImage::from_raw(width, height, bytes)
            .context("decoded frame has an unexpected buffer size")?;
        Ok(DynamicImage::ImageRgb8(image))
    }
}
