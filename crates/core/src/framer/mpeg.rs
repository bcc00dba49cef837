// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! MP3/AAC byte-level frame sync.
//!
//! Grounded on `mpeg.c`'s `get_mpeg_frame_length`/`get_aac_frame_len`: the
//! frame header carries enough information (version, layer, bitrate index,
//! samplerate index, padding) to compute the next frame's length without
//! decoding, so resync after a dropped byte is just "scan for the next
//! `0xFF` and re-check the header".

use super::DesyncGuard;
use crate::error::Result;
use crate::format::FormatType;
use crate::refbuf::Refbuf;
use bytes::BytesMut;

const MPEG1_BITRATES: [[u32; 15]; 3] = [
    // Layer I, II, III (index 0 is "free", unsupported here)
    [0, 32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448],
    [0, 32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384],
    [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320],
];
const MPEG2_BITRATES: [[u32; 15]; 3] = [
    [0, 32, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 224, 256],
    [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160],
    [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160],
];
const MPEG1_SAMPLERATES: [u32; 3] = [44100, 48000, 32000];
const MPEG2_SAMPLERATES: [u32; 3] = [22050, 24000, 16000];
const MPEG25_SAMPLERATES: [u32; 3] = [11025, 12000, 8000];

const AAC_SAMPLERATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

struct MpegHeader {
    frame_len: usize,
    bitrate: u32,
    samplerate: u32,
    channels: u8,
}

fn parse_mp3_header(b: &[u8]) -> Option<MpegHeader> {
    if b.len() < 4 || b[0] != 0xFF || (b[1] & 0xE0) != 0xE0 {
        return None;
    }
    let version_bits = (b[1] >> 3) & 0x03;
    let layer_bits = (b[1] >> 1) & 0x03;
    if layer_bits == 0 {
        return None; // reserved
    }
    let layer_idx = match layer_bits {
        0b11 => 0, // layer I
        0b10 => 1, // layer II
        0b01 => 2, // layer III
        _ => return None,
    };
    let bitrate_idx = usize::from((b[2] >> 4) & 0x0F);
    let samplerate_idx = usize::from((b[2] >> 2) & 0x03);
    if bitrate_idx == 0 || bitrate_idx >= 15 || samplerate_idx >= 3 {
        return None;
    }
    let padding = u32::from((b[2] >> 1) & 0x01);
    let channel_mode = (b[3] >> 6) & 0x03;
    let channels = if channel_mode == 0b11 { 1 } else { 2 };

    let (bitrate_table, samplerate) = match version_bits {
        0b11 => (&MPEG1_BITRATES, MPEG1_SAMPLERATES[samplerate_idx]),
        0b10 => (&MPEG2_BITRATES, MPEG2_SAMPLERATES[samplerate_idx]),
        0b00 => (&MPEG2_BITRATES, MPEG25_SAMPLERATES[samplerate_idx]),
        _ => return None, // reserved version
    };
    let bitrate_kbps = bitrate_table[layer_idx][bitrate_idx];
    if bitrate_kbps == 0 || samplerate == 0 {
        return None;
    }
    let bitrate = bitrate_kbps * 1000;

    let frame_len = if layer_idx == 0 {
        (12 * bitrate / samplerate + padding) as usize * 4
    } else {
        let mul = if version_bits == 0b11 { 144 } else { 72 };
        (mul * bitrate / samplerate + padding) as usize
    };
    if frame_len < 4 {
        return None;
    }
    Some(MpegHeader { frame_len, bitrate, samplerate, channels })
}

fn parse_aac_header(b: &[u8]) -> Option<MpegHeader> {
    if b.len() < 7 || b[0] != 0xFF || (b[1] & 0xF0) != 0xF0 {
        return None;
    }
    let samplerate_idx = usize::from((b[2] >> 2) & 0x0F);
    if samplerate_idx >= AAC_SAMPLERATES.len() {
        return None;
    }
    let channel_config = ((b[2] & 0x01) << 2) | ((b[3] >> 6) & 0x03);
    let frame_len = usize::from(((b[3] & 0x03) as u16) << 11)
        | usize::from(b[4]) << 3
        | usize::from((b[5] >> 5) & 0x07);
    if frame_len < 7 {
        return None;
    }
    Some(MpegHeader {
        frame_len,
        bitrate: 0,
        samplerate: AAC_SAMPLERATES[samplerate_idx],
        channels: channel_config.max(1),
    })
}

/// Shared framer for `audio/mpeg` and `audio/aac`/`audio/aacp`.
pub struct MpegFramer {
    format: FormatType,
    carry: BytesMut,
    guard: DesyncGuard,
    synced: bool,
    required_consecutive: u32,
    sample_rate: Option<u32>,
    channels: Option<u8>,
    bitrate: Option<u32>,
}

impl MpegFramer {
    #[must_use]
    pub fn new(format: FormatType, desync_tolerance_bytes: u64, required_consecutive: u32) -> Self {
        Self {
            format,
            carry: BytesMut::new(),
            guard: DesyncGuard::new(desync_tolerance_bytes),
            synced: false,
            required_consecutive: required_consecutive.max(1),
            sample_rate: None,
            channels: None,
            bitrate: None,
        }
    }

    fn parse(&self, b: &[u8]) -> Option<MpegHeader> {
        match self.format {
            FormatType::Aac => parse_aac_header(b),
            _ => parse_mp3_header(b),
        }
    }

    /// Validates `self.required_consecutive` frames starting at `start`
    /// before accepting sync, as the header format alone is not a strong
    /// enough signature to rule out a false positive in arbitrary audio data.
    fn validate_sync(&self, buf: &[u8], start: usize) -> bool {
        let mut pos = start;
        for _ in 0..self.required_consecutive {
            let Some(hdr) = self.parse(&buf[pos..]) else { return false };
            let next = pos + hdr.frame_len;
            if next > buf.len() {
                // Not enough data buffered to validate further frames yet;
                // treat as tentatively valid rather than resyncing away.
                return true;
            }
            pos = next;
        }
        true
    }
}

impl super::Framer for MpegFramer {
    fn push(&mut self, bytes: &[u8]) -> Result<Vec<Refbuf>> {
        self.carry.extend_from_slice(bytes);
        let mut out = Vec::new();

        loop {
            let buf = self.carry.as_ref();
            if !self.synced {
                let mut found = None;
                for i in 0..buf.len().saturating_sub(1) {
                    if buf[i] == 0xFF && self.parse(&buf[i..]).is_some() && self.validate_sync(buf, i) {
                        found = Some(i);
                        break;
                    }
                }
                match found {
                    Some(0) => {
                        self.synced = true;
                        self.guard.resync();
                    }
                    Some(i) => {
                        self.guard.record_skip(i)?;
                        let _ = self.carry.split_to(i);
                        self.synced = true;
                        self.guard.resync();
                        continue;
                    }
                    None => {
                        // Keep the last 8 bytes (longest header we might be
                        // mid-way through) and discard the rest as skipped.
                        let keep = buf.len().min(8);
                        let skip = buf.len() - keep;
                        if skip > 0 {
                            self.guard.record_skip(skip)?;
                            let _ = self.carry.split_to(skip);
                        }
                        break;
                    }
                }
            }

            let buf = self.carry.as_ref();
            let Some(hdr) = self.parse(buf) else {
                self.synced = false;
                continue;
            };
            if buf.len() < hdr.frame_len {
                break;
            }
            self.sample_rate = Some(hdr.samplerate);
            self.channels = Some(hdr.channels);
            if hdr.bitrate > 0 {
                self.bitrate = Some(hdr.bitrate);
            }
            let frame = self.carry.split_to(hdr.frame_len).freeze();
            out.push(Refbuf::new(frame, true, None));
        }

        Ok(out)
    }

    fn format_type(&self) -> FormatType {
        self.format
    }

    fn sample_rate(&self) -> Option<u32> {
        self.sample_rate
    }

    fn channels(&self) -> Option<u8> {
        self.channels
    }

    fn bitrate(&self) -> Option<u32> {
        self.bitrate
    }
}

#[cfg(test)]
mod tests {
    use super::super::Framer;
    use super::*;

    // A minimal, well-formed MPEG1 Layer III frame header: 128 kbps, 44100 Hz,
    // stereo, no padding. Followed by silence payload bytes.
    fn mp3_frame(len: usize) -> Vec<u8> {
        let mut f = vec![0xFF, 0xFB, 0x90, 0x00];
        f.resize(len, 0);
        f
    }

    #[test]
    fn mp3_frame_syncs_after_required_consecutive() {
        let mut framer = MpegFramer::new(FormatType::Mp3, 20000, 2);
        let frame = mp3_frame(417); // 144*128000/44100 = 417 (padding 0)
        let mut data = Vec::new();
        data.extend_from_slice(&frame);
        data.extend_from_slice(&frame);
        data.extend_from_slice(&frame);
        let out = framer.push(&data).unwrap();
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|r| r.sync_point()));
        assert_eq!(framer.sample_rate(), Some(44100));
        assert_eq!(framer.channels(), Some(2));
    }

    #[test]
    fn mp3_framer_carries_partial_frame_across_calls() {
        let mut framer = MpegFramer::new(FormatType::Mp3, 20000, 1);
        let frame = mp3_frame(417);
        let out1 = framer.push(&frame[..200]).unwrap();
        assert!(out1.is_empty());
        let out2 = framer.push(&frame[200..]).unwrap();
        assert_eq!(out2.len(), 1);
    }

    #[test]
    fn garbage_prefix_is_skipped_until_sync() {
        let mut framer = MpegFramer::new(FormatType::Mp3, 20000, 1);
        let frame = mp3_frame(417);
        let mut data = vec![0u8; 10];
        data.extend_from_slice(&frame);
        data.extend_from_slice(&frame);
        let out = framer.push(&data).unwrap();
        assert_eq!(out.len(), 2);
    }
}
