// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! FLV container synthesis from an MP3/AAC elementary stream.
//!
//! Grounded on `flv.c`'s tag construction: a 9-byte FLV file header plus a
//! leading zero `PreviousTagSize`, then one audio tag per frame (11-byte tag
//! header + 1-byte `AudioTagHeader` + payload + 4-byte `PreviousTagSize`
//! trailer), all big-endian.

use super::mpeg::MpegFramer;
use crate::error::Result;
use crate::format::FormatType;
use crate::refbuf::Refbuf;
use bytes::{BufMut, Bytes, BytesMut};

fn flv_file_header() -> Bytes {
    let mut h = BytesMut::with_capacity(13);
    h.extend_from_slice(b"FLV");
    h.put_u8(1); // version
    h.put_u8(0x04); // flags: audio present
    h.put_u32(9); // header size
    h.put_u32(0); // PreviousTagSize0
    h.freeze()
}

fn sound_rate_index(samplerate: Option<u32>) -> u8 {
    match samplerate {
        Some(r) if r >= 44100 => 3,
        Some(r) if r >= 22050 => 2,
        Some(r) if r >= 11025 => 1,
        _ => 0,
    }
}

fn audio_tag_header_byte(format: FormatType, samplerate: Option<u32>, channels: Option<u8>) -> u8 {
    let sound_format: u8 = if format == FormatType::Aac { 10 } else { 2 };
    let sound_rate = sound_rate_index(samplerate);
    let sound_size: u8 = 1; // 16-bit
    let sound_type: u8 = if channels.unwrap_or(2) > 1 { 1 } else { 0 };
    (sound_format << 4) | (sound_rate << 2) | (sound_size << 1) | sound_type
}

fn flv_tag(payload: &[u8], timestamp_ms: u32, header_byte: u8, is_aac: bool) -> Bytes {
    let aac_extra = u32::from(is_aac);
    let data_size = 1 + aac_extra + payload.len() as u32;
    let mut tag = BytesMut::with_capacity(11 + data_size as usize + 4);
    tag.put_u8(8); // tag type: audio
    tag.put_uint(u64::from(data_size), 3);
    tag.put_uint(u64::from(timestamp_ms & 0x00FF_FFFF), 3);
    tag.put_u8(((timestamp_ms >> 24) & 0xFF) as u8); // timestamp extended
    tag.put_uint(0, 3); // stream id
    tag.put_u8(header_byte);
    if is_aac {
        tag.put_u8(1); // AACPacketType: raw (no sequence header available here)
    }
    tag.extend_from_slice(payload);
    tag.put_u32(11 + data_size);
    tag.freeze()
}

/// Synthesizes an FLV container around an MP3/AAC elementary stream.
pub struct FlvFramer {
    inner: MpegFramer,
    format: FormatType,
    header_sent: bool,
    timestamp_ms: u32,
}

impl FlvFramer {
    #[must_use]
    pub fn new(desync_tolerance_bytes: u64, mp3_sync_frames: u32) -> Self {
        Self {
            inner: MpegFramer::new(FormatType::Mp3, desync_tolerance_bytes, mp3_sync_frames),
            format: FormatType::Flv,
            header_sent: false,
            timestamp_ms: 0,
        }
    }
}

impl super::Framer for FlvFramer {
    fn push(&mut self, bytes: &[u8]) -> Result<Vec<Refbuf>> {
        let frames = self.inner.push(bytes)?;
        let mut out = Vec::with_capacity(frames.len() + 1);

        for frame in frames {
            let is_aac = self.inner.format_type() == FormatType::Aac;
            let header_byte =
                audio_tag_header_byte(self.inner.format_type(), self.inner.sample_rate(), self.inner.channels());
            let tag = flv_tag(frame.data(), self.timestamp_ms, header_byte, is_aac);

            let duration_ms = match (self.inner.bitrate(), self.inner.sample_rate()) {
                (Some(bitrate), _) if bitrate > 0 => (frame.len() as u64 * 8 * 1000 / u64::from(bitrate)) as u32,
                _ => 26,
            };
            self.timestamp_ms = self.timestamp_ms.wrapping_add(duration_ms.max(1));

            if !self.header_sent {
                let mut combined = BytesMut::with_capacity(13 + tag.len());
                combined.extend_from_slice(&flv_file_header());
                combined.extend_from_slice(&tag);
                self.header_sent = true;
                out.push(Refbuf::new(combined.freeze(), true, None));
            } else {
                out.push(Refbuf::new(tag, true, None));
            }
        }

        Ok(out)
    }

    fn format_type(&self) -> FormatType {
        self.format
    }

    fn sample_rate(&self) -> Option<u32> {
        self.inner.sample_rate()
    }

    fn channels(&self) -> Option<u8> {
        self.inner.channels()
    }

    fn bitrate(&self) -> Option<u32> {
        self.inner.bitrate()
    }
}

#[cfg(test)]
mod tests {
    use super::super::Framer;
    use super::*;

    fn mp3_frame() -> Vec<u8> {
        let mut f = vec![0xFF, 0xFB, 0x90, 0x00];
        f.resize(417, 0);
        f
    }

    #[test]
    fn first_emission_carries_flv_file_header() {
        let mut framer = FlvFramer::new(20000, 1);
        let out = framer.push(&mp3_frame()).unwrap();
        assert_eq!(out.len(), 1);
        assert!(out[0].data().starts_with(b"FLV"));
    }

    #[test]
    fn subsequent_tags_omit_file_header() {
        let mut framer = FlvFramer::new(20000, 1);
        let mut data = Vec::new();
        data.extend(mp3_frame());
        data.extend(mp3_frame());
        let out = framer.push(&data).unwrap();
        assert_eq!(out.len(), 2);
        assert!(out[0].data().starts_with(b"FLV"));
        assert!(!out[1].data().starts_with(b"FLV"));
        assert_eq!(out[1].data()[0], 8); // tag type: audio
    }
}
