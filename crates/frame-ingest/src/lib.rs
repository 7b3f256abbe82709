//! Frame acquisition for the surveillance pipeline.
//!
//! A [`FrameSource`] hands out JPEG-encoded frames one at a time; the pipeline
//! paces the pulls, so sources never need their own timers. Two built-in
//! sources cover development and replay: a synthetic test-pattern generator
//! and a directory-of-JPEGs replayer. Real camera transports plug in behind
//! the same trait.

mod replay;
mod source;
mod synthetic;
mod types;

pub use replay::FramesDirSource;
pub use source::{build_source, probe_source, SourceKind};
pub use synthetic::SyntheticSource;
pub use types::{CaptureError, Frame, FrameSource};
