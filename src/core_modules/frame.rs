// THEORY:
// The `Frame` is the unit of data flowing through the engine: an image plus
// the identity of the moment it was captured (`FrameRef`). Every stage that
// transforms pixels produces a new `Frame` through `with_image`, so the index,
// timestamp and source identifier survive untouched from decoding to the
// final `Particle`.
//
// Frames are produced by an external `FrameSource`. The engine only asks two
// things of it: a forward-only stream of frames, and the ability to re-read a
// single frame by index (needed to measure particle intensity after tracking,
// since tracks keep contours but no pixels).

use crate::error::{ChamberError, Result};
use image::{DynamicImage, GrayImage};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// The identity of one captured frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameRef {
    /// Position of the frame in its source, strictly increasing along the stream.
    pub index: u64,
    /// Time since the start of the stream.
    pub timestamp: Duration,
    /// Identifier of the video or image sequence the frame came from.
    pub source: Arc<str>,
}

impl FrameRef {
    pub fn new(index: u64, timestamp: Duration, source: impl Into<Arc<str>>) -> Self {
        Self {
            index,
            timestamp,
            source: source.into(),
        }
    }
}

impl fmt::Display for FrameRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame {} at {:.3}s", self.index, self.timestamp.as_secs_f64())
    }
}

/// An image tagged with the frame it was derived from.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame<I = DynamicImage> {
    pub image: I,
    pub reference: FrameRef,
}

/// A single-channel frame, the shape every stage after preprocessing works on.
pub type GrayFrame = Frame<GrayImage>;

impl<I> Frame<I> {
    pub fn new(image: I, reference: FrameRef) -> Self {
        Self { image, reference }
    }

    /// Builds a new frame carrying `image` but the same identity as `self`.
    pub fn with_image<J>(&self, image: J) -> Frame<J> {
        Frame {
            image,
            reference: self.reference.clone(),
        }
    }

    pub fn index(&self) -> u64 {
        self.reference.index
    }

    pub fn timestamp(&self) -> Duration {
        self.reference.timestamp
    }
}

impl<I> fmt::Display for Frame<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.reference.fmt(f)
    }
}

/// The external collaborator that decodes frames.
pub trait FrameSource {
    /// A forward-only stream of frames in increasing index order.
    fn frames(&mut self) -> Box<dyn Iterator<Item = Result<Frame>> + Send + '_>;

    /// Re-reads the frame at `index`, independently of any running stream.
    fn read_frame_at(&mut self, index: u64) -> Result<Frame>;
}

/// An in-memory frame source, used for tests and for callers that already
/// hold their frames.
#[derive(Debug, Clone, Default)]
pub struct VecFrameSource {
    frames: Vec<Frame>,
}

impl VecFrameSource {
    pub fn new(frames: Vec<Frame>) -> Self {
        Self { frames }
    }

    /// Wraps grayscale images as frames `0..n` of `source`, spaced `1 / fps` apart.
    pub fn from_gray_images(source: &str, fps: f64, images: Vec<GrayImage>) -> Self {
        let source: Arc<str> = Arc::from(source);
        let frames = images
            .into_iter()
            .enumerate()
            .map(|(i, image)| {
                let reference = FrameRef {
                    index: i as u64,
                    timestamp: Duration::from_secs_f64(i as f64 / fps),
                    source: source.clone(),
                };
                Frame::new(DynamicImage::ImageLuma8(image), reference)
            })
            .collect();
        Self { frames }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl FrameSource for VecFrameSource {
    fn frames(&mut self) -> Box<dyn Iterator<Item = Result<Frame>> + Send + '_> {
        Box::new(self.frames.iter().cloned().map(Ok))
    }

    fn read_frame_at(&mut self, index: u64) -> Result<Frame> {
        self.frames
            .iter()
            .find(|frame| frame.index() == index)
            .cloned()
            .ok_or(ChamberError::FrameNotFound(index))
    }
}
