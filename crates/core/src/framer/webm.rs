// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! WebM/EBML cluster-boundary framing.
//!
//! Grounded on `format_ebml.c`'s approach of tracking a cursor over the
//! byte stream and cutting at `Cluster` element boundaries rather than
//! performing a full recursive EBML parse: everything before the first
//! `Cluster` element is the header block (EBML header, Segment info,
//! Tracks), and each subsequent `Cluster` is a sync-point on its own.

use super::DesyncGuard;
use crate::error::Result;
use crate::format::FormatType;
use crate::refbuf::Refbuf;
use bytes::BytesMut;

const CLUSTER_ID: [u8; 4] = [0x1F, 0x43, 0xB6, 0x75];

fn find_from(buf: &[u8], needle: &[u8; 4], from: usize) -> Option<usize> {
    if buf.len() <= from {
        return None;
    }
    buf[from..].windows(4).position(|w| w == needle).map(|p| p + from)
}

/// Framer for `video/webm`, `audio/webm`.
pub struct WebmFramer {
    carry: BytesMut,
    guard: DesyncGuard,
    header_emitted: bool,
    header_chain: Option<Refbuf>,
}

impl WebmFramer {
    #[must_use]
    pub fn new(desync_tolerance_bytes: u64) -> Self {
        Self {
            carry: BytesMut::new(),
            guard: DesyncGuard::new(desync_tolerance_bytes),
            header_emitted: false,
            header_chain: None,
        }
    }
}

impl super::Framer for WebmFramer {
    fn push(&mut self, bytes: &[u8]) -> Result<Vec<Refbuf>> {
        self.carry.extend_from_slice(bytes);
        let mut out = Vec::new();

        if !self.header_emitted {
            match find_from(self.carry.as_ref(), &CLUSTER_ID, 0) {
                Some(pos) => {
                    if pos > 0 {
                        let header_bytes = self.carry.split_to(pos).freeze();
                        self.header_chain = Some(Refbuf::new(header_bytes, false, None));
                    }
                    self.header_emitted = true;
                    self.guard.resync();
                }
                None => {
                    if u64::try_from(self.carry.len()).unwrap_or(u64::MAX) > self.guard.tolerance() {
                        return Err(crate::error::CoreError::FramerDesync(
                            "no Cluster element found within tolerance".into(),
                        ));
                    }
                    return Ok(out);
                }
            }
        }

        loop {
            let buf = self.carry.as_ref();
            if buf.len() < 4 {
                break;
            }
            match find_from(buf, &CLUSTER_ID, 4) {
                Some(next_pos) => {
                    let cluster_bytes = self.carry.split_to(next_pos).freeze();
                    let assoc = self.header_chain.as_ref().map(Refbuf::retain);
                    out.push(Refbuf::new(cluster_bytes, true, assoc));
                }
                None => break,
            }
        }

        Ok(out)
    }

    fn format_type(&self) -> FormatType {
        FormatType::Webm
    }
}
