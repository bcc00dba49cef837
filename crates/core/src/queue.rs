// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The per-source ring of [`Refbuf`]s: append, burst-window tracking and the
//! trim policy that reclaims buffers no listener still needs.
//!
//! Grounded in `source.c`'s `source_main` append/trim loop: a singly linked
//! list with `head`/`tail`/`burst_point` pointers, where `burst_point` tracks
//! a trailing window of `burst_size_bytes` so a newly attached listener can be
//! handed a short backlog instead of starting bone dry.

use crate::refbuf::Refbuf;

/// Owns the append-only chain of refbufs for one source.
///
/// Only the owning source task ever calls [`Self::append`] or [`Self::trim`];
/// no lock is needed here; listeners reach into the chain only through
/// `Refbuf::next`, which is safe to call concurrently.
pub struct SourceQueue {
    head: Option<Refbuf>,
    tail: Option<Refbuf>,
    burst_point: Option<Refbuf>,
    burst_offset: u64,
    queue_size: u64,
    burst_size_bytes: u64,
    queue_size_limit: u64,
}

impl SourceQueue {
    #[must_use]
    pub const fn new(burst_size_bytes: u64, queue_size_limit: u64) -> Self {
        Self {
            head: None,
            tail: None,
            burst_point: None,
            burst_offset: 0,
            queue_size: 0,
            burst_size_bytes,
            queue_size_limit,
        }
    }

    #[must_use]
    pub fn queue_size(&self) -> u64 {
        self.queue_size
    }

    #[must_use]
    pub fn is_over_limit(&self) -> bool {
        self.queue_size > self.queue_size_limit
    }

    #[must_use]
    pub fn head(&self) -> Option<&Refbuf> {
        self.head.as_ref()
    }

    #[must_use]
    pub fn tail(&self) -> Option<&Refbuf> {
        self.tail.as_ref()
    }

    /// The current start of the burst window. A newly attached listener
    /// begins here rather than at `tail`.
    #[must_use]
    pub fn burst_point(&self) -> Option<&Refbuf> {
        self.burst_point.as_ref()
    }

    /// Appends `buf` to the end of the chain, links it from the previous
    /// tail, and advances the burst window if it has grown past
    /// `burst_size_bytes`.
    pub fn append(&mut self, buf: Refbuf) {
        let len = u64::try_from(buf.len()).unwrap_or(u64::MAX);

        if let Some(old_tail) = &self.tail {
            old_tail.set_next(buf.retain());
        }
        if self.head.is_none() {
            self.head = Some(buf.retain());
        }

        self.queue_size += len;

        if self.burst_point.is_none() {
            self.burst_point = Some(buf.retain());
            self.burst_offset = 0;
        } else {
            self.burst_offset += len;
            while self.burst_offset > self.burst_size_bytes {
                let Some(current) = self.burst_point.clone() else { break };
                let Some(next) = current.next() else { break };
                self.burst_offset -= u64::try_from(current.len()).unwrap_or(u64::MAX);
                self.burst_point = Some(next);
            }
        }

        self.tail = Some(buf);
    }

    /// Releases refbufs from the head while they have no reader beyond the
    /// queue's own head reference and are not the burst point or tail.
    /// Returns the number of bytes reclaimed.
    pub fn trim(&mut self) -> u64 {
        let mut freed = 0u64;
        loop {
            let stop = match &self.head {
                None => true,
                Some(h) => {
                    let is_tail = self.tail.as_ref().is_some_and(|t| Refbuf::ptr_eq(h, t));
                    let is_burst = self.burst_point.as_ref().is_some_and(|b| Refbuf::ptr_eq(h, b));
                    h.strong_count() > 1 || is_tail || is_burst
                }
            };
            if stop {
                break;
            }
            let Some(h) = self.head.take() else { break };
            freed += u64::try_from(h.len()).unwrap_or(u64::MAX);
            self.head = h.next();
        }
        self.queue_size = self.queue_size.saturating_sub(freed);
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn rb(s: &'static str) -> Refbuf {
        Refbuf::new(Bytes::from_static(s.as_bytes()), true, None)
    }

    #[test]
    fn append_links_and_tracks_size() {
        let mut q = SourceQueue::new(1_000_000, 1_000_000);
        q.append(rb("aaaa"));
        q.append(rb("bb"));
        assert_eq!(q.queue_size(), 6);
        assert_eq!(q.head().unwrap().len(), 4);
        assert_eq!(q.tail().unwrap().len(), 2);
        assert!(Refbuf::ptr_eq(&q.head().unwrap().next().unwrap(), q.tail().unwrap()));
    }

    #[test]
    fn burst_point_slides_within_window() {
        let mut q = SourceQueue::new(5, 1_000_000);
        q.append(rb("aaaaa")); // 5 bytes, becomes burst point, offset 0
        q.append(rb("bbbbb")); // offset 5, not > 5, burst point stays at first
        assert_eq!(q.burst_point().unwrap().len(), 5);
        q.append(rb("c")); // offset 6 > 5 -> advance past first 5-byte buf
        assert_eq!(q.burst_point().unwrap().data().as_ref(), b"bbbbb");
    }

    #[test]
    fn trim_stops_at_burst_point_and_multiply_referenced() {
        let mut q = SourceQueue::new(0, 1_000_000);
        q.append(rb("a"));
        let held = q.tail().unwrap().retain();
        q.append(rb("b"));
        // burst_size_bytes=0 makes burst_point slide to tail immediately, so
        // everything before the held buffer should be trimmable except it.
        let freed = q.trim();
        assert!(freed <= 1);
        drop(held);
    }

    #[test]
    fn over_limit_detection() {
        let mut q = SourceQueue::new(1_000_000, 3);
        q.append(rb("aaaa"));
        assert!(q.is_over_limit());
    }
}
