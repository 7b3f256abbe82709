use chrono::{DateTime, Utc};
use thiserror::Error;

/// A single JPEG-encoded frame captured from a video source.
#[derive(Clone)]
pub struct Frame {
    pub jpeg: Vec<u8>,
    pub captured_at: DateTime<Utc>,
    /// Monotonic per-source counter, starting at 1.
    pub sequence_no: u64,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open frame source {uri:?}")]
    Open { uri: String },
    /// The source has no further frames (finite replay sources only).
    #[error("frame source exhausted")]
    EndOfStream,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CaptureError {
    /// Whether a retry against the same source can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, CaptureError::Other(_))
    }
}

/// Capability set of a camera: open the transport, pull frames, release it.
///
/// `next_frame` may block while the underlying device produces the next
/// frame. Implementations report recoverable I/O hiccups as
/// [`CaptureError::Other`]; the caller owns the retry policy.
pub trait FrameSource: Send {
    fn open(&mut self) -> Result<(), CaptureError>;
    fn next_frame(&mut self) -> Result<Frame, CaptureError>;
    fn close(&mut self);
}
