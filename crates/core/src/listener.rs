// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Per-listener state and the non-blocking write path.
//!
//! A [`Listener`] tracks a cursor into the source queue (`cur_refbuf`/`pos`)
//! plus whatever the codec adapter needs to remember between writes — for
//! Ogg/WebM, whether the header chain has already been streamed; for MP3
//! with ICY metadata, the byte countdown to the next metadata block.

use crate::refbuf::Refbuf;
use std::collections::VecDeque;
use std::io;

/// Non-blocking write sink for one listener connection. Implementations
/// never block; a write that would block returns
/// `Err(io::ErrorKind::WouldBlock)`.
pub trait ListenerSink: Send {
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize>;
}

/// Per-format listener-side behaviour, dispatched by tagged variant per the
/// capability set {attach_listener, write_one_chunk, detach_listener,
/// on_new_refbuf}. `Passthrough` covers Ogg, WebM, MPEG-TS, text and FLV —
/// none of those need per-listener state beyond the header-chain replay
/// that `Listener` already handles generically.
pub enum CodecAdapter {
    Passthrough,
    Mp3Icy(IcyState),
}

/// ICY metadata interleaving state for one MP3 listener.
pub struct IcyState {
    metaint: u32,
    countdown: u32,
    current_title: String,
}

impl IcyState {
    #[must_use]
    pub const fn new(metaint: u32) -> Self {
        Self { metaint, countdown: metaint, current_title: String::new() }
    }

    pub fn set_title(&mut self, title: String) {
        self.current_title = title;
    }

    /// Builds one ICY metadata block: a single length byte (block length /
    /// 16) followed by the `StreamTitle='...';` payload, zero-padded to a
    /// multiple of 16 bytes.
    fn build_metadata_block(&self) -> Vec<u8> {
        if self.current_title.is_empty() {
            return vec![0u8];
        }
        let payload = format!("StreamTitle='{}';", self.current_title.replace('\'', "\\'"));
        let padded_len = payload.len().div_ceil(16) * 16;
        let mut block = Vec::with_capacity(1 + padded_len);
        block.push((padded_len / 16) as u8);
        block.extend_from_slice(payload.as_bytes());
        block.resize(1 + padded_len, 0);
        block
    }
}

/// One downstream HTTP/ICY client attached to a source.
pub struct Listener<S: ListenerSink> {
    pub id: u64,
    sink: S,
    adapter: CodecAdapter,
    cur_refbuf: Option<Refbuf>,
    pos: usize,
    pending_headers: VecDeque<Refbuf>,
    header_pos: usize,
    pub bytes_sent: u64,
    pub errored: bool,
}

impl<S: ListenerSink> Listener<S> {
    #[must_use]
    pub fn new(id: u64, sink: S, adapter: CodecAdapter) -> Self {
        Self {
            id,
            sink,
            adapter,
            cur_refbuf: None,
            pos: 0,
            pending_headers: VecDeque::new(),
            header_pos: 0,
            bytes_sent: 0,
            errored: false,
        }
    }

    #[must_use]
    pub const fn cur_refbuf(&self) -> Option<&Refbuf> {
        self.cur_refbuf.as_ref()
    }

    #[must_use]
    pub const fn is_attached(&self) -> bool {
        self.cur_refbuf.is_some()
    }

    /// Attaches this listener to `start`, the current burst point (or
    /// tail, on a pure-migration attach). Also queues the associated header
    /// chain, if any, so it is written before `start`'s own bytes.
    pub fn attach(&mut self, start: &Refbuf) {
        self.pending_headers.clear();
        self.header_pos = 0;
        if let Some(associated) = start.associated() {
            self.pending_headers.extend(associated.chain_from());
        }
        self.cur_refbuf = Some(start.retain());
        self.pos = 0;
    }

    /// Resets cursor state ahead of a move-clients migration, forcing a
    /// fresh attach (and header re-emission) at the destination.
    pub fn reset_for_migration(&mut self) {
        self.cur_refbuf = None;
        self.pos = 0;
        self.pending_headers.clear();
        self.header_pos = 0;
        if let CodecAdapter::Mp3Icy(icy) = &mut self.adapter {
            icy.countdown = icy.metaint;
        }
    }

    /// Performs one bounded burst of non-blocking writes, advancing the
    /// cursor as buffers are exhausted. Caps at `max_bytes` or
    /// `max_iterations`, whichever comes first, to bound worst-case latency
    /// per listener within one scheduler iteration.
    pub fn service(&mut self, max_bytes: usize, max_iterations: u32) {
        let mut written = 0usize;
        let mut iterations = 0u32;

        while written < max_bytes && iterations < max_iterations {
            iterations += 1;

            if let Some(header) = self.pending_headers.front().cloned() {
                let remaining = header.data().slice(self.header_pos..);
                match self.write_chunk(&remaining) {
                    Ok(0) => break,
                    Ok(n) => {
                        written += n;
                        self.bytes_sent += n as u64;
                        self.header_pos += n;
                        if self.header_pos == header.len() {
                            self.pending_headers.pop_front();
                            self.header_pos = 0;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(_) => {
                        self.errored = true;
                        break;
                    }
                }
                continue;
            }

            let Some(cur) = self.cur_refbuf.clone() else { break };
            let remaining = &cur.data()[self.pos..];
            if remaining.is_empty() {
                self.cur_refbuf = cur.next();
                self.pos = 0;
                continue;
            }

            // A pending ICY metadata block is not part of cur_refbuf's data,
            // so its bytes must never advance `pos` — only audio bytes do.
            if let CodecAdapter::Mp3Icy(icy) = &self.adapter {
                if icy.countdown == 0 {
                    let block = icy.build_metadata_block();
                    match self.write_chunk(&block) {
                        Ok(0) => break,
                        Ok(n) if n == block.len() => {
                            written += n;
                            self.bytes_sent += n as u64;
                            if let CodecAdapter::Mp3Icy(icy) = &mut self.adapter {
                                icy.countdown = icy.metaint;
                            }
                            continue;
                        }
                        Ok(_) => break, // partial metadata write: retry whole block next time
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(_) => {
                            self.errored = true;
                            break;
                        }
                    }
                }
            }

            let cut = match &self.adapter {
                CodecAdapter::Mp3Icy(icy) => (icy.countdown as usize).min(remaining.len()),
                CodecAdapter::Passthrough => remaining.len(),
            };
            let to_send = &remaining[..cut];

            match self.write_chunk(to_send) {
                Ok(0) => break,
                Ok(n) => {
                    written += n;
                    self.bytes_sent += n as u64;
                    self.pos += n;
                    if let CodecAdapter::Mp3Icy(icy) = &mut self.adapter {
                        icy.countdown = icy.countdown.saturating_sub(n as u32);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => {
                    self.errored = true;
                    break;
                }
            }
        }
    }

    fn write_chunk(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sink.try_write(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::{Arc, Mutex};

    struct MemSink(Arc<Mutex<Vec<u8>>>);
    impl ListenerSink for MemSink {
        fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
            #[allow(clippy::unwrap_used)]
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
    }

    #[test]
    fn attach_and_drain_single_refbuf() {
        let out = Arc::new(Mutex::new(Vec::new()));
        let mut l = Listener::new(1, MemSink(out.clone()), CodecAdapter::Passthrough);
        let buf = Refbuf::new(Bytes::from_static(b"hello-world"), true, None);
        l.attach(&buf);
        l.service(20000, 10);
        assert_eq!(out.lock().unwrap().as_slice(), b"hello-world");
        assert_eq!(l.bytes_sent, 11);
    }

    #[test]
    fn header_chain_streamed_before_data() {
        let out = Arc::new(Mutex::new(Vec::new()));
        let mut l = Listener::new(1, MemSink(out.clone()), CodecAdapter::Passthrough);
        let header = Refbuf::new(Bytes::from_static(b"HEAD"), false, None);
        let data = Refbuf::new(Bytes::from_static(b"DATA"), true, Some(header));
        l.attach(&data);
        l.service(20000, 10);
        assert_eq!(out.lock().unwrap().as_slice(), b"HEADDATA");
    }

    #[test]
    fn cursor_advances_across_links() {
        let out = Arc::new(Mutex::new(Vec::new()));
        let mut l = Listener::new(1, MemSink(out.clone()), CodecAdapter::Passthrough);
        let a = Refbuf::new(Bytes::from_static(b"AA"), true, None);
        let b = Refbuf::new(Bytes::from_static(b"BB"), true, None);
        a.set_next(b.retain());
        l.attach(&a);
        l.service(20000, 10);
        assert_eq!(out.lock().unwrap().as_slice(), b"AABB");
    }
}
