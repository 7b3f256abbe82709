use std::io::Cursor;

use anyhow::Context;
use chrono::Utc;
use image::{ImageBuffer, Rgb, RgbImage};

use crate::{CaptureError, Frame, FrameSource};

const PATTERN_WIDTH: u32 = 320;
const PATTERN_HEIGHT: u32 = 240;
const JPEG_QUALITY: u8 = 80;

/// Generated test-pattern source. Each frame is a flat-colour card whose hue
/// advances with the sequence number, so consecutive frames are
/// distinguishable in a viewer and in saved captures.
pub struct SyntheticSource {
    sequence_no: u64,
    opened: bool,
}

impl SyntheticSource {
    pub fn new() -> Self {
        Self {
            sequence_no: 0,
            opened: false,
        }
    }
}

impl Default for SyntheticSource {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSource for SyntheticSource {
    fn open(&mut self) -> Result<(), CaptureError> {
        self.opened = true;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        if !self.opened {
            return Err(CaptureError::Open {
                uri: "synthetic:".into(),
            });
        }
        self.sequence_no += 1;
        let jpeg = render_pattern(self.sequence_no)?;
        Ok(Frame {
            jpeg,
            captured_at: Utc::now(),
            sequence_no: self.sequence_no,
        })
    }

    fn close(&mut self) {
        self.opened = false;
    }
}

fn render_pattern(sequence_no: u64) -> Result<Vec<u8>, CaptureError> {
    let phase = (sequence_no % 6) as u8;
    let base = 40u8.wrapping_add(phase.wrapping_mul(35));
    let image: RgbImage = ImageBuffer::from_pixel(
        PATTERN_WIDTH,
        PATTERN_HEIGHT,
        Rgb([base, 255 - base, 128]),
    );

    let mut buf = Cursor::new(Vec::new());
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY);
    image
        .write_with_encoder(encoder)
        .context("encoding synthetic frame")?;
    Ok(buf.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_open() {
        let mut source = SyntheticSource::new();
        assert!(matches!(
            source.next_frame(),
            Err(CaptureError::Open { .. })
        ));
    }

    #[test]
    fn test_produces_jpeg_with_monotonic_sequence() {
        let mut source = SyntheticSource::new();
        source.open().unwrap();

        let first = source.next_frame().unwrap();
        let second = source.next_frame().unwrap();

        assert_eq!(first.sequence_no, 1);
        assert_eq!(second.sequence_no, 2);
        // JPEG start-of-image marker.
        assert_eq!(&first.jpeg[..2], &[0xFF, 0xD8]);
    }
}
