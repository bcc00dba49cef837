// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Ogg page sync and header-chain collection.
//!
//! This does not decode Ogg packets (the `ogg` crate's packet model does not
//! fit: the queue needs raw page bytes, not reassembled packets, because a
//! listener replays the header chain byte-for-byte). Instead this scans for
//! the `OggS` capture pattern and reads the fixed page header directly, the
//! same level `format_ogg.c` operates at.

use super::DesyncGuard;
use crate::error::Result;
use crate::format::FormatType;
use crate::refbuf::Refbuf;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;

const CAPTURE_PATTERN: &[u8; 4] = b"OggS";

struct PageHeader {
    header_type: u8,
    granule_pos: i64,
    serial_no: u32,
    total_len: usize,
}

/// Reads one Ogg page header starting at offset 0 of `buf`, returning `None`
/// if there isn't enough data buffered yet to know the full page length.
fn parse_page(buf: &[u8]) -> Option<PageHeader> {
    if buf.len() < 27 || &buf[0..4] != CAPTURE_PATTERN {
        return None;
    }
    let header_type = buf[5];
    #[allow(clippy::unwrap_used)] // slice lengths are fixed by the range above
    let granule_pos = i64::from_le_bytes(buf[6..14].try_into().unwrap());
    #[allow(clippy::unwrap_used)]
    let serial_no = u32::from_le_bytes(buf[14..18].try_into().unwrap());
    let page_segments = buf[26] as usize;
    if buf.len() < 27 + page_segments {
        return None;
    }
    let body_len: usize = buf[27..27 + page_segments].iter().map(|&b| b as usize).sum();
    let total_len = 27 + page_segments + body_len;
    Some(PageHeader { header_type, granule_pos, serial_no, total_len })
}

#[derive(Default, Clone, Copy, PartialEq)]
enum Codec {
    #[default]
    Unknown,
    Theora,
    Kate,
}

fn sniff_codec(body: &[u8]) -> Codec {
    if body.len() >= 7 && body[0] == 0x80 && &body[1..7] == b"theora" {
        Codec::Theora
    } else if body.len() >= 8 && body[0] == 0x80 && &body[1..8] == b"kate\0\0\0" {
        Codec::Kate
    } else {
        Codec::Unknown
    }
}

/// Ogg page sync for `application/ogg`, `audio/ogg`, `video/ogg`.
pub struct OggFramer {
    carry: BytesMut,
    guard: DesyncGuard,
    header_chain_head: Option<Refbuf>,
    header_chain_tail: Option<Refbuf>,
    codecs: HashMap<u32, Codec>,
}

impl OggFramer {
    #[must_use]
    pub fn new(desync_tolerance_bytes: u64) -> Self {
        Self {
            carry: BytesMut::new(),
            guard: DesyncGuard::new(desync_tolerance_bytes),
            header_chain_head: None,
            header_chain_tail: None,
            codecs: HashMap::new(),
        }
    }

    fn append_header(&mut self, page: Refbuf) {
        if let Some(tail) = &self.header_chain_tail {
            tail.set_next(page.retain());
        } else {
            self.header_chain_head = Some(page.retain());
        }
        self.header_chain_tail = Some(page);
    }

    fn is_sync_point(&self, serial: u32, granule_pos: i64) -> bool {
        match self.codecs.get(&serial).copied().unwrap_or_default() {
            // Approximate: a granule position ending the current keyframe
            // interval at zero low bits is treated as a keyframe boundary.
            // Exact KFGSHIFT decoding needs the codec setup header, which
            // this framer deliberately does not parse.
            Codec::Theora | Codec::Kate => granule_pos == -1 || (granule_pos & 0xFF) == 0,
            Codec::Unknown => true, // Vorbis/Opus/FLAC: every audio page is a sync-point
        }
    }
}

impl super::Framer for OggFramer {
    fn push(&mut self, bytes: &[u8]) -> Result<Vec<Refbuf>> {
        self.carry.extend_from_slice(bytes);
        let mut out = Vec::new();

        loop {
            let buf = self.carry.as_ref();
            if buf.len() < 4 {
                break;
            }
            if &buf[0..4] != CAPTURE_PATTERN {
                let skip = buf
                    .windows(4)
                    .position(|w| w == CAPTURE_PATTERN)
                    .unwrap_or(buf.len().saturating_sub(3).max(0));
                if skip == 0 {
                    break;
                }
                self.guard.record_skip(skip)?;
                let _ = self.carry.split_to(skip);
                continue;
            }
            let Some(hdr) = parse_page(self.carry.as_ref()) else { break };
            if self.carry.len() < hdr.total_len {
                break;
            }
            self.guard.resync();
            let page_bytes: Bytes = self.carry.split_to(hdr.total_len).freeze();

            if hdr.header_type & 0x02 != 0 {
                let body_start = 27 + {
                    let b = page_bytes.as_ref();
                    b[26] as usize
                };
                self.codecs.entry(hdr.serial_no).or_insert_with(|| sniff_codec(&page_bytes[body_start..]));
            }

            // Every codec's header packets (identification, comment, setup)
            // carry granule_pos <= 0; the first page with a positive granule
            // position ends the header phase, matching `format_vorbis.c`'s
            // `ogg_page_granulepos(&state->og) <= 0` check. This holds for
            // non-BOS header pages (Vorbis/Opus comment and setup) just as
            // much as for the BOS identification page.
            if hdr.granule_pos <= 0 {
                let page = Refbuf::new(page_bytes, false, None);
                self.append_header(page);
                continue;
            }

            let sync = self.is_sync_point(hdr.serial_no, hdr.granule_pos);
            let associated = self.header_chain_head.as_ref().map(Refbuf::retain);
            out.push(Refbuf::new(page_bytes, sync, associated));
        }

        Ok(out)
    }

    fn format_type(&self) -> FormatType {
        FormatType::Ogg
    }
}
