// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! MPEG transport stream packetization: fixed-size packets introduced by a
//! `0x47` sync byte, packet size auto-detected among the three sizes in
//! common use (188 bytes raw, 204 with Reed-Solomon FEC, 208 with an extra
//! timestamp prefix).

use super::DesyncGuard;
use crate::error::Result;
use crate::format::FormatType;
use crate::refbuf::Refbuf;
use bytes::BytesMut;

const CANDIDATE_SIZES: [usize; 3] = [188, 204, 208];

fn detect_packet_size(buf: &[u8]) -> Option<usize> {
    CANDIDATE_SIZES.into_iter().find(|&size| {
        let packets_available = buf.len() / size;
        if packets_available < 2 {
            return false;
        }
        (0..packets_available.min(4)).all(|i| buf[i * size] == 0x47)
    })
}

/// Framer for raw MPEG-TS (`video/mp2t`).
pub struct MpegTsFramer {
    carry: BytesMut,
    guard: DesyncGuard,
    packet_size: Option<usize>,
}

impl MpegTsFramer {
    #[must_use]
    pub fn new(desync_tolerance_bytes: u64) -> Self {
        Self { carry: BytesMut::new(), guard: DesyncGuard::new(desync_tolerance_bytes), packet_size: None }
    }
}

impl super::Framer for MpegTsFramer {
    fn push(&mut self, bytes: &[u8]) -> Result<Vec<Refbuf>> {
        self.carry.extend_from_slice(bytes);
        let mut out = Vec::new();

        if self.packet_size.is_none() {
            self.packet_size = detect_packet_size(self.carry.as_ref());
            if self.packet_size.is_none() {
                if u64::try_from(self.carry.len()).unwrap_or(u64::MAX) > self.guard.tolerance() {
                    return Err(crate::error::CoreError::FramerDesync(
                        "could not detect MPEG-TS packet size".into(),
                    ));
                }
                return Ok(out);
            }
        }

        #[allow(clippy::unwrap_used)] // just established to be Some above
        let size = self.packet_size.unwrap();
        loop {
            let buf = self.carry.as_ref();
            if buf.len() < size {
                break;
            }
            if buf[0] != 0x47 {
                // Lost sync mid-stream: scan for the next 0x47 at a
                // `size`-aligned offset rather than assuming byte 0.
                let Some(shift) = buf.iter().step_by(size).position(|&b| b == 0x47) else {
                    self.guard.record_skip(buf.len())?;
                    self.carry.clear();
                    break;
                };
                let skip = shift * size;
                self.guard.record_skip(skip)?;
                let _ = self.carry.split_to(skip);
                continue;
            }
            self.guard.resync();
            let packet = self.carry.split_to(size).freeze();
            out.push(Refbuf::new(packet, true, None));
        }

        Ok(out)
    }

    fn format_type(&self) -> FormatType {
        FormatType::MpegTs
    }
}

#[cfg(test)]
mod tests {
    use super::super::Framer;
    use super::*;

    fn ts_packet() -> Vec<u8> {
        let mut p = vec![0u8; 188];
        p[0] = 0x47;
        p
    }

    #[test]
    fn detects_188_and_emits_sync_packets() {
        let mut framer = MpegTsFramer::new(20000);
        let mut data = Vec::new();
        for _ in 0..4 {
            data.extend(ts_packet());
        }
        let out = framer.push(&data).unwrap();
        assert_eq!(out.len(), 4);
        assert!(out.iter().all(|r| r.sync_point() && r.len() == 188));
    }
}
