use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;

use crate::{CaptureError, Frame, FrameSource};

/// Replays the JPEG files of a directory in filename order, looping forever.
///
/// This is the stand-in for recorded footage: drop captures into a directory
/// and point a camera at it. Files are listed once at `open`; frames added
/// later are picked up on the next reopen.
pub struct FramesDirSource {
    dir: PathBuf,
    files: Vec<PathBuf>,
    cursor: usize,
    sequence_no: u64,
}

impl FramesDirSource {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            files: Vec::new(),
            cursor: 0,
            sequence_no: 0,
        }
    }
}

impl FrameSource for FramesDirSource {
    fn open(&mut self) -> Result<(), CaptureError> {
        let entries = fs::read_dir(&self.dir).map_err(|_| CaptureError::Open {
            uri: self.dir.display().to_string(),
        })?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg"))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();

        if files.is_empty() {
            return Err(CaptureError::Open {
                uri: self.dir.display().to_string(),
            });
        }

        self.files = files;
        self.cursor = 0;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        if self.files.is_empty() {
            return Err(CaptureError::Open {
                uri: self.dir.display().to_string(),
            });
        }

        let path = &self.files[self.cursor];
        self.cursor = (self.cursor + 1) % self.files.len();

        let jpeg = fs::read(path)
            .with_context(|| format!("reading frame file {}", path.display()))?;

        self.sequence_no += 1;
        Ok(Frame {
            jpeg,
            captured_at: Utc::now(),
            sequence_no: self.sequence_no,
        })
    }

    fn close(&mut self) {
        self.files.clear();
        self.cursor = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_jpeg(dir: &Path, name: &str, payload: &[u8]) {
        let mut file = fs::File::create(dir.join(name)).unwrap();
        file.write_all(&[0xFF, 0xD8]).unwrap();
        file.write_all(payload).unwrap();
    }

    #[test]
    fn test_replays_in_name_order_and_wraps() {
        let dir = tempfile::tempdir().unwrap();
        write_jpeg(dir.path(), "b.jpg", b"second");
        write_jpeg(dir.path(), "a.jpg", b"first");

        let mut source = FramesDirSource::new(dir.path());
        source.open().unwrap();

        let one = source.next_frame().unwrap();
        let two = source.next_frame().unwrap();
        let three = source.next_frame().unwrap();

        assert!(one.jpeg.ends_with(b"first"));
        assert!(two.jpeg.ends_with(b"second"));
        assert!(three.jpeg.ends_with(b"first"));
        assert_eq!(three.sequence_no, 3);
    }

    #[test]
    fn test_empty_dir_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = FramesDirSource::new(dir.path());
        assert!(matches!(source.open(), Err(CaptureError::Open { .. })));
    }

    #[test]
    fn test_ignores_non_jpeg_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();
        write_jpeg(dir.path(), "cam.jpeg", b"frame");

        let mut source = FramesDirSource::new(dir.path());
        source.open().unwrap();
        let frame = source.next_frame().unwrap();
        assert!(frame.jpeg.ends_with(b"frame"));
    }
}
