// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Codec-aware stream splitting.
//!
//! A [`Framer`] consumes raw producer bytes and emits [`Refbuf`]s aligned to
//! frame boundaries so a freshly attached listener always starts on a
//! decodable sync point. Dispatch is by the producer's declared
//! `content-type`, resolved once to a [`FormatType`] at source activation
//! (`format.rs`), then to one of the codec-specific implementations below.

mod flv;
mod mpeg;
mod mpegts;
mod ogg;
mod text;
mod webm;

use crate::error::{CoreError, Result};
use crate::format::FormatType;
use crate::refbuf::Refbuf;

pub use flv::FlvFramer;
pub use mpeg::MpegFramer;
pub use mpegts::MpegTsFramer;
pub use ogg::OggFramer;
pub use text::TextFramer;
pub use webm::WebmFramer;

/// Codec-specific stream splitter.
///
/// `push` may be called with any split of the underlying byte stream;
/// incomplete frames are carried internally across calls.
pub trait Framer: Send {
    /// Feeds `bytes` to the framer, returning zero or more refbufs whose
    /// contents are one or more complete frames.
    fn push(&mut self, bytes: &[u8]) -> Result<Vec<Refbuf>>;

    fn format_type(&self) -> FormatType;

    fn sample_rate(&self) -> Option<u32> {
        None
    }

    fn channels(&self) -> Option<u8> {
        None
    }

    fn bitrate(&self) -> Option<u32> {
        None
    }
}

/// Builds the framer for `format`, given the mount's desync tolerance and
/// (for MP3/AAC) the number of consecutive frames required before sync is
/// first trusted.
#[must_use]
pub fn build_framer(
    format: FormatType,
    desync_tolerance_bytes: u64,
    mp3_sync_frames: u32,
) -> Box<dyn Framer> {
    match format {
        FormatType::Ogg => Box::new(OggFramer::new(desync_tolerance_bytes)),
        FormatType::Mp3 | FormatType::Aac => {
            Box::new(MpegFramer::new(format, desync_tolerance_bytes, mp3_sync_frames))
        }
        FormatType::Webm => Box::new(WebmFramer::new(desync_tolerance_bytes)),
        FormatType::MpegTs => Box::new(MpegTsFramer::new(desync_tolerance_bytes)),
        FormatType::Text => Box::new(TextFramer::new()),
        FormatType::Flv => Box::new(FlvFramer::new(desync_tolerance_bytes, mp3_sync_frames)),
    }
}

/// Shared bookkeeping for codecs that must skip bytes to resync and give up
/// past a configured tolerance.
pub(crate) struct DesyncGuard {
    tolerance: u64,
    skipped: u64,
}

impl DesyncGuard {
    pub(crate) const fn new(tolerance: u64) -> Self {
        Self { tolerance, skipped: 0 }
    }

    pub(crate) fn record_skip(&mut self, n: usize) -> Result<()> {
        self.skipped += n as u64;
        if self.skipped > self.tolerance {
            return Err(CoreError::FramerDesync(format!(
                "no sync point found within {} bytes",
                self.tolerance
            )));
        }
        Ok(())
    }

    pub(crate) fn resync(&mut self) {
        self.skipped = 0;
    }

    pub(crate) const fn tolerance(&self) -> u64 {
        self.tolerance
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_framer_dispatches_by_format() {
        assert_eq!(build_framer(FormatType::Ogg, 20000, 4).format_type(), FormatType::Ogg);
        assert_eq!(build_framer(FormatType::Mp3, 20000, 4).format_type(), FormatType::Mp3);
        assert_eq!(build_framer(FormatType::Text, 20000, 4).format_type(), FormatType::Text);
    }

    #[test]
    fn desync_guard_escalates_past_tolerance() {
        let mut g = DesyncGuard::new(10);
        assert!(g.record_skip(5).is_ok());
        assert!(g.record_skip(5).is_ok());
        assert!(g.record_skip(1).is_err());
    }
}
