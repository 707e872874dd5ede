// THEORY:
// A `Track` is the history of one candidate particle: a strictly time-ordered
// list of `Snapshot`s, each pairing a frame identity with the contour seen on
// that frame. Where a contour is a single observation, a track is the same
// object's existence *over time*.
//
// Tracks are owned by a `TrackArena` and referred to by opaque `TrackId`
// handles. The tracker only ever holds handles to the tracks that are still
// open, so no track, snapshot or frame ever points back at another.

use crate::core_modules::contour::Contour;
use crate::core_modules::frame::FrameRef;
use std::fmt;
use std::ops::Index;
use std::time::Duration;

/// One observation of a candidate particle.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub reference: FrameRef,
    pub contour: Contour,
}

impl Snapshot {
    pub fn new(reference: FrameRef, contour: Contour) -> Self {
        Self { reference, contour }
    }

    pub fn index(&self) -> u64 {
        self.reference.index
    }

    pub fn timestamp(&self) -> Duration {
        self.reference.timestamp
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Snapshot at {}, {:.3}s",
            self.reference.index,
            self.reference.timestamp.as_secs_f64()
        )
    }
}

/// A non-empty, time-ordered chain of snapshots.
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    snapshots: Vec<Snapshot>,
}

impl Track {
    /// Starts a track from its first observation.
    pub fn new(first: Snapshot) -> Self {
        Self {
            snapshots: vec![first],
        }
    }

    /// Appends an observation. Frame indices must keep increasing.
    pub fn record(&mut self, snapshot: Snapshot) {
        debug_assert!(snapshot.index() > self.end().index());
        self.snapshots.push(snapshot);
    }

    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Snapshot> {
        self.snapshots.iter()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn start(&self) -> &Snapshot {
        &self.snapshots[0]
    }

    pub fn end(&self) -> &Snapshot {
        &self.snapshots[self.snapshots.len() - 1]
    }

    /// Number of frames spanned, `end.index - start.index`.
    pub fn extent(&self) -> u64 {
        self.end().index() - self.start().index()
    }

    pub fn duration(&self) -> Duration {
        self.end().timestamp().saturating_sub(self.start().timestamp())
    }
}

impl<'a> IntoIterator for &'a Track {
    type Item = &'a Snapshot;
    type IntoIter = std::slice::Iter<'a, Snapshot>;

    fn into_iter(self) -> Self::IntoIter {
        self.snapshots.iter()
    }
}

/// Opaque handle to a track inside a `TrackArena`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackId(usize);

/// Owner of every track created during a run, in creation order.
#[derive(Debug, Clone, Default)]
pub struct TrackArena {
    tracks: Vec<Track>,
}

impl TrackArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, track: Track) -> TrackId {
        self.tracks.push(track);
        TrackId(self.tracks.len() - 1)
    }

    pub fn get(&self, id: TrackId) -> &Track {
        &self.tracks[id.0]
    }

    pub fn get_mut(&mut self, id: TrackId) -> &mut Track {
        &mut self.tracks[id.0]
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TrackId, &Track)> {
        self.tracks.iter().enumerate().map(|(i, track)| (TrackId(i), track))
    }

    pub fn into_tracks(self) -> Vec<Track> {
        self.tracks
    }
}

impl Index<TrackId> for TrackArena {
    type Output = Track;

    fn index(&self, id: TrackId) -> &Track {
        self.get(id)
    }
}
