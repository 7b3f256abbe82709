//! On-disk frame retention.
//!
//! Each captured frame is written once to
//! `<root>/camera{id}_<YYYYMMDD>_<HHMMSS>_<microseconds>.jpg`; the
//! microsecond timestamp plus camera id keeps names unique under concurrent
//! writers. Writes are best effort: a failed write degrades the alert to
//! carry only the base64 payload.

use std::fs;
use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use frame_ingest::Frame;
use tracing::warn;

/// Result of persisting one frame. `url` is absent when the disk write
/// failed; `base64` is always present.
#[derive(Clone, Debug)]
pub struct StoredFrame {
    pub url: Option<String>,
    pub base64: String,
}

pub struct FrameStore {
    root: PathBuf,
}

impl FrameStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Write the frame and compute its base64 encoding once.
    pub fn persist(&self, camera_id: u32, frame: &Frame) -> StoredFrame {
        let base64 = BASE64.encode(&frame.jpeg);
        let filename = format!(
            "camera{camera_id}_{}.jpg",
            frame.captured_at.format("%Y%m%d_%H%M%S_%6f")
        );
        let path = self.root.join(&filename);

        let written = fs::create_dir_all(&self.root)
            .and_then(|_| fs::write(&path, &frame.jpeg));

        match written {
            Ok(()) => StoredFrame {
                url: Some(path.display().to_string()),
                base64,
            },
            Err(err) => {
                warn!(
                    "failed to write frame {} for camera {camera_id}: {err}",
                    path.display()
                );
                StoredFrame { url: None, base64 }
            }
        }
    }
}
