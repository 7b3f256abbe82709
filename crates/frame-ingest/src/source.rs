use std::path::Path;

use crate::{CaptureError, FrameSource, FramesDirSource, SyntheticSource};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Transport used to acquire frames.
pub enum SourceKind {
    /// Generated test pattern, no hardware required.
    Synthetic,
    /// Replay of a directory of JPEG files.
    FramesDir,
}

impl SourceKind {
    /// Infer the transport kind from a source URI.
    pub fn from_uri(uri: &str) -> Self {
        if uri.is_empty() || uri == "synthetic" || uri.starts_with("synthetic:") {
            SourceKind::Synthetic
        } else {
            SourceKind::FramesDir
        }
    }
}

/// Construct a frame source for the given URI.
///
/// Recognised forms: `synthetic:` (or empty) for the generated pattern,
/// `frames:<dir>` or a bare path for JPEG replay.
pub fn build_source(uri: &str) -> Box<dyn FrameSource> {
    match SourceKind::from_uri(uri) {
        SourceKind::Synthetic => Box::new(SyntheticSource::new()),
        SourceKind::FramesDir => {
            let path = uri.strip_prefix("frames:").unwrap_or(uri);
            Box::new(FramesDirSource::new(Path::new(path)))
        }
    }
}

/// Open-and-close a source once to validate the URI at configuration time.
pub fn probe_source(uri: &str) -> Result<(), CaptureError> {
    let mut source = build_source(uri);
    source.open()?;
    source.close();
    Ok(())
}
