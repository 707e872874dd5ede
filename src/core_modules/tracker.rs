// THEORY:
// The `tracker` module is the heart of the engine. It adds memory to the
// otherwise stateless per-frame analysis: for every track-like contour found
// on a frame it decides whether the contour continues a particle seen on the
// previous frame or marks the birth of a new one.
//
// This module solves the "data association problem" under a deliberately
// strict rule set:
// 1.  **Adjacency**: a contour on frame `i` may only extend a track whose last
//     snapshot lies on frame `i - 1`. A track that misses a single frame stops
//     growing for good; it is never pruned, just left behind.
// 2.  **Proximity**: the centroids of the contour and of the track's last
//     contour must be closer than `track_distance`. There is no velocity
//     prediction, so a particle that jumps further than that between two
//     frames splits into two tracks.
// 3.  **Uniqueness**: exactly one candidate extends, zero candidates start a
//     new track, and several candidates are an ambiguity handled by the
//     configured `AmbiguityPolicy` (fail the run, or drop the contour).
// 4.  **Lifecycle**: tracks are born and extended, never merged, never closed
//     explicitly. They all live in a `TrackArena` until the stream ends; the
//     tracker only keeps handles to the ones touched on the last frame, which
//     are the only ones the adjacency rule lets grow.

use crate::config::{AmbiguityPolicy, Config};
use crate::core_modules::contour::{Contour, Position};
use crate::core_modules::frame::FrameRef;
use crate::core_modules::track::{Snapshot, Track, TrackArena, TrackId};
use crate::error::{ChamberError, Result};

/// What happened to the contours of one frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameAssociation {
    pub extended: usize,
    pub started: usize,
    /// Contours without a centroid, or ambiguous ones under `AmbiguityPolicy::Ignore`.
    pub skipped: usize,
}

/// Streaming frame-to-frame associator.
#[derive(Debug, Default)]
pub struct Tracker {
    /// Every track created so far.
    arena: TrackArena,
    /// Tracks extended or started on the last processed frame.
    open: Vec<TrackId>,
    last_frame: Option<u64>,
}

impl Tracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associates the contours found on one frame with the open tracks.
    pub fn update(
        &mut self,
        contours: Vec<Contour>,
        frame: &FrameRef,
        config: &Config,
    ) -> Result<FrameAssociation> {
        if let Some(last) = self.last_frame {
            if frame.index <= last {
                return Err(ChamberError::InvalidFrame {
                    index: frame.index,
                    reason: format!("frames must arrive in increasing order, previous was {last}"),
                });
            }
        }
        self.last_frame = Some(frame.index);

        let mut summary = FrameAssociation::default();
        let mut touched: Vec<TrackId> = Vec::with_capacity(contours.len());

        for contour in contours {
            let Some(centroid) = contour.centroid() else {
                log::debug!("{frame}: skipping a contour with no area");
                summary.skipped += 1;
                continue;
            };

            // --- 1. Matching ---
            let candidates = self.find_close_tracks(centroid, frame.index, config.track_distance);

            // --- 2. State Updating ---
            match candidates.as_slice() {
                [] => {
                    let id = self
                        .arena
                        .insert(Track::new(Snapshot::new(frame.clone(), contour)));
                    touched.push(id);
                    summary.started += 1;
                }
                [id] => {
                    self.arena
                        .get_mut(*id)
                        .record(Snapshot::new(frame.clone(), contour));
                    touched.push(*id);
                    summary.extended += 1;
                }
                many => match config.ambiguity {
                    AmbiguityPolicy::Fail => {
                        // Contours already recorded on this frame stay open.
                        self.open = touched;
                        return Err(ChamberError::AmbiguousAssociation {
                            frame: frame.index,
                            candidates: many.len(),
                        });
                    }
                    AmbiguityPolicy::Ignore => {
                        log::warn!(
                            "{frame}: contour at ({:.1}, {:.1}) matches {} tracks, ignored",
                            centroid.x,
                            centroid.y,
                            many.len()
                        );
                        summary.skipped += 1;
                    }
                },
            }
        }

        self.open = touched;
        log::debug!(
            "{frame}: {} extended, {} started, {} skipped, {} tracks total",
            summary.extended,
            summary.started,
            summary.skipped,
            self.arena.len()
        );
        Ok(summary)
    }

    /// Open tracks ending on the frame right before `index` whose last
    /// centroid lies within `max_distance` of `centroid`.
    fn find_close_tracks(&self, centroid: Position, index: u64, max_distance: f64) -> Vec<TrackId> {
        self.open
            .iter()
            .copied()
            .filter(|&id| {
                let end = self.arena[id].end();
                end.index() + 1 == index
                    && end
                        .contour
                        .centroid()
                        .is_some_and(|previous| previous.distance_to(&centroid) < max_distance)
            })
            .collect()
    }

    pub fn tracks(&self) -> &TrackArena {
        &self.arena
    }

    /// Tracks that may still grow on the next frame.
    pub fn open_tracks(&self) -> impl Iterator<Item = &Track> {
        self.open.iter().map(|&id| &self.arena[id])
    }

    pub fn into_tracks(self) -> Vec<Track> {
        self.arena.into_tracks()
    }
}
