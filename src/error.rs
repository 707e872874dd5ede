use thiserror::Error;

/// Boxed error produced by an external frame source (a video decoder, an
/// image directory reader, ...). It is carried through the pipeline untouched.
pub type SourceError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum ChamberError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("malformed frame {index}: {reason}")]
    InvalidFrame { index: u64, reason: String },

    #[error("frame source failed: {0}")]
    FrameSource(#[source] SourceError),

    #[error("frame {0} could not be re-read from its source")]
    FrameNotFound(u64),

    #[error("contour on frame {frame} matches {candidates} open tracks")]
    AmbiguousAssociation { frame: u64, candidates: usize },

    #[error("preprocessing worker failed: {0}")]
    Worker(String),
}

impl ChamberError {
    /// Wraps any source-side failure so it can travel through the frame stream.
    pub fn source<E>(error: E) -> Self
    where
        E: Into<SourceError>,
    {
        ChamberError::FrameSource(error.into())
    }
}

pub type Result<T> = std::result::Result<T, ChamberError>;
