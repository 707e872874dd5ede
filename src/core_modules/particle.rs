// THEORY:
// The `particle` module is the reduction layer. It runs once, after the frame
// stream has ended, and condenses each finished `Track` into a `Particle`: a
// small, stable record of *what* crossed the chamber rather than *how* it was
// observed frame by frame.
//
// Key steps:
// 1.  **Filtering**: tracks spanning `min_track_length` frames or fewer are
//     noise that happened to survive the shape filter for a moment.
// 2.  **Representative choice**: the most elongated snapshot (highest
//     length/width ratio) is taken as the best view of the track. Ties keep
//     the earliest snapshot.
// 3.  **Features**: width, length, angle and curvature come straight from the
//     best contour. Intensity needs pixels the track no longer holds, so it is
//     measured separately by re-reading the frame from its `FrameSource`.

use crate::config::Config;
use crate::core_modules::contour::Contour;
use crate::core_modules::frame::{FrameRef, FrameSource};
use crate::core_modules::preprocessing::preprocess;
use crate::core_modules::track::{Snapshot, Track};
use crate::error::Result;
use image::{GrayImage, Luma};
use imageproc::drawing::draw_polygon_mut;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Keeps the tracks spanning more than `config.min_track_length` frames.
pub fn filter_tracks(tracks: impl IntoIterator<Item = Track>, config: &Config) -> Vec<Track> {
    tracks
        .into_iter()
        .filter(|track| track.extent() > config.min_track_length)
        .collect()
}

/// Filters the tracks and reduces each survivor to a particle.
pub fn reduce(tracks: impl IntoIterator<Item = Track>, config: &Config) -> Vec<Particle> {
    filter_tracks(tracks, config)
        .iter()
        .map(Particle::from_track)
        .collect()
}

/// The finalized record of one particle track.
#[derive(Debug, Clone, PartialEq)]
pub struct Particle {
    pub start: FrameRef,
    pub end: FrameRef,
    /// The most elongated observation of the track.
    pub snapshot: Snapshot,
    pub width: f64,
    pub length: f64,
    /// Direction of the long axis, in degrees from the image x axis, in `[0, 180)`.
    pub angle: f64,
    pub curvature: f64,
    /// Mean preprocessed brightness under the best contour. Set by `measure_intensity`.
    pub intensity: Option<f64>,
}

impl Particle {
    pub fn from_track(track: &Track) -> Self {
        let snapshot = best_snapshot(track).clone();
        let contour = &snapshot.contour;
        Self {
            start: track.start().reference.clone(),
            end: track.end().reference.clone(),
            width: contour.width(),
            length: contour.length(),
            angle: long_axis_angle(contour),
            curvature: contour.curvature(),
            intensity: None,
            snapshot,
        }
    }

    pub fn extent(&self) -> u64 {
        self.end.index - self.start.index
    }

    pub fn duration(&self) -> Duration {
        self.end.timestamp.saturating_sub(self.start.timestamp)
    }

    /// Re-reads the best snapshot's frame and averages its preprocessed pixels
    /// inside the contour. Frame source failures are propagated unchanged.
    pub fn measure_intensity(
        &mut self,
        source: &mut dyn FrameSource,
        config: &Config,
    ) -> Result<Option<f64>> {
        let frame = source.read_frame_at(self.snapshot.index())?;
        let gray = preprocess(&frame, config)?;
        self.intensity = mean_inside(&gray.image, &self.snapshot.contour);
        if self.intensity.is_none() {
            log::warn!("{}: contour covers no pixels, intensity unknown", self.snapshot);
        }
        Ok(self.intensity)
    }

    /// Flattens the particle for persistence.
    pub fn record(&self) -> ParticleRecord {
        ParticleRecord {
            source: self.start.source.to_string(),
            start_index: self.start.index,
            end_index: self.end.index,
            start_time: self.start.timestamp.as_secs_f64(),
            end_time: self.end.timestamp.as_secs_f64(),
            best_index: self.snapshot.index(),
            extent: self.extent(),
            duration: self.duration().as_secs_f64(),
            width: self.width,
            length: self.length,
            angle: self.angle,
            curvature: self.curvature,
            intensity: self.intensity,
        }
    }
}

impl fmt::Display for Particle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Particle {}-{}: length {:.1}, width {:.1}, angle {:.1}, curvature {:.4}",
            self.start.index, self.end.index, self.length, self.width, self.angle, self.curvature
        )?;
        if let Some(intensity) = self.intensity {
            write!(f, ", intensity {intensity:.1}")?;
        }
        Ok(())
    }
}

/// Flat, serializable view of a `Particle`. Times are seconds from stream start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticleRecord {
    pub source: String,
    pub start_index: u64,
    pub end_index: u64,
    pub start_time: f64,
    pub end_time: f64,
    pub best_index: u64,
    pub extent: u64,
    pub duration: f64,
    pub width: f64,
    pub length: f64,
    pub angle: f64,
    pub curvature: f64,
    pub intensity: Option<f64>,
}

fn best_snapshot(track: &Track) -> &Snapshot {
    let mut best = track.start();
    let mut best_ratio = best.contour.aspect_ratio();
    for snapshot in track.iter().skip(1) {
        let ratio = snapshot.contour.aspect_ratio();
        if ratio > best_ratio {
            best = snapshot;
            best_ratio = ratio;
        }
    }
    best
}

/// The rectangle angle, turned by 90 degrees when its first axis is the short one.
fn long_axis_angle(contour: &Contour) -> f64 {
    let rect = contour.min_area_rect();
    let angle = if rect.axes.0 >= rect.axes.1 {
        rect.angle
    } else {
        rect.angle + 90.0
    };
    angle % 180.0
}

/// Mean of `image` over the filled contour, `None` if the fill hits no pixel.
pub fn mean_inside(image: &GrayImage, contour: &Contour) -> Option<f64> {
    let mask = fill_mask(image.width(), image.height(), contour);
    let (sum, count) = image
        .pixels()
        .zip(mask.pixels())
        .filter(|(_, m)| m.0[0] > 0)
        .fold((0u64, 0u64), |(sum, count), (p, _)| (sum + u64::from(p.0[0]), count + 1));
    (count > 0).then(|| sum as f64 / count as f64)
}

fn fill_mask(width: u32, height: u32, contour: &Contour) -> GrayImage {
    let mut mask = GrayImage::new(width, height);
    let mut points = contour.points.clone();
    // The polygon filler rejects an explicitly closed outline.
    if points.len() > 1 && points.first() == points.last() {
        points.pop();
    }
    if points.len() >= 3 {
        draw_polygon_mut(&mut mask, &points, Luma([255]));
    } else {
        for p in &points {
            if p.x >= 0 && p.y >= 0 && (p.x as u32) < width && (p.y as u32) < height {
                mask.put_pixel(p.x as u32, p.y as u32, Luma([255]));
            }
        }
    }
    mask
}
