// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Immutable, reference-counted byte buffers — the unit of queue membership
//! and listener consumption.
//!
//! A [`Refbuf`] is a thin, `Clone`-able handle around an `Arc`. `retain`/
//! `release` are just names for `Clone`/`Drop` that match the vocabulary the
//! rest of the core uses; the atomic strong count inside the `Arc` *is* the
//! refcount the design calls out, so there is nothing to hand-roll on top of
//! it. The singly linked `next` pointer needs interior mutability because a
//! buffer is constructed once and only later, when the next buffer arrives,
//! does its predecessor learn about it.

use bytes::Bytes;
use std::sync::{Arc, Mutex};

struct RefbufInner {
    data: Bytes,
    sync_point: bool,
    associated: Option<Refbuf>,
    next: Mutex<Option<Refbuf>>,
}

/// A reference-counted, immutable byte buffer.
///
/// Cloning a `Refbuf` is `retain`; dropping the last clone is `release` and
/// frees the bytes, which in turn releases each buffer in the `associated`
/// header chain.
#[derive(Clone)]
pub struct Refbuf(Arc<RefbufInner>);

impl Refbuf {
    /// Allocates a new refbuf with refcount 1.
    pub fn new(data: Bytes, sync_point: bool, associated: Option<Refbuf>) -> Self {
        Self(Arc::new(RefbufInner { data, sync_point, associated, next: Mutex::new(None) }))
    }

    /// Increments the refcount by producing another handle to the same buffer.
    #[must_use]
    pub fn retain(&self) -> Self {
        self.clone()
    }

    /// Decrements the refcount. Equivalent to dropping the handle; spelled
    /// out because callers model the spec's explicit release points.
    pub fn release(self) {
        drop(self);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.data.is_empty()
    }

    #[must_use]
    pub fn data(&self) -> &Bytes {
        &self.0.data
    }

    #[must_use]
    pub const fn sync_point(&self) -> bool {
        self.0.sync_point
    }

    #[must_use]
    pub fn associated(&self) -> Option<&Refbuf> {
        self.0.associated.as_ref()
    }

    /// The next refbuf in whichever singly linked chain this one belongs to
    /// (source queue or header chain).
    #[must_use]
    pub fn next(&self) -> Option<Refbuf> {
        #[allow(clippy::unwrap_used)] // poisoning here would mean a prior panic while linking
        self.0.next.lock().unwrap().clone()
    }

    /// Links `next` after `self`. Only the owning source task calls this,
    /// while appending to the queue.
    pub fn set_next(&self, next: Refbuf) {
        #[allow(clippy::unwrap_used)]
        let mut slot = self.0.next.lock().unwrap();
        *slot = Some(next);
    }

    /// Current strong reference count. Used to drive the trim policy and by
    /// tests asserting refcount conservation.
    #[must_use]
    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    #[must_use]
    pub fn ptr_eq(a: &Refbuf, b: &Refbuf) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    /// Walks the `associated` header chain starting at this buffer (inclusive),
    /// retaining each link. Used when a listener attaches mid-chain and must
    /// receive the whole header block before data.
    #[must_use]
    pub fn chain_from(&self) -> Vec<Refbuf> {
        let mut out = Vec::new();
        let mut cur = Some(self.retain());
        while let Some(buf) = cur {
            let next = buf.next();
            out.push(buf);
            cur = next;
        }
        out
    }
}

impl std::fmt::Debug for Refbuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Refbuf")
            .field("len", &self.len())
            .field("sync_point", &self.sync_point())
            .field("has_associated", &self.associated().is_some())
            .field("strong_count", &self.strong_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retain_release_tracks_strong_count() {
        let a = Refbuf::new(Bytes::from_static(b"abc"), true, None);
        assert_eq!(a.strong_count(), 1);
        let b = a.retain();
        assert_eq!(a.strong_count(), 2);
        b.release();
        assert_eq!(a.strong_count(), 1);
    }

    #[test]
    fn associated_chain_keeps_headers_alive() {
        let h1 = Refbuf::new(Bytes::from_static(b"head1"), false, None);
        let h2 = Refbuf::new(Bytes::from_static(b"head2"), false, None);
        h1.set_next(h2.retain());
        let data = Refbuf::new(Bytes::from_static(b"data"), true, Some(h1.retain()));

        assert_eq!(h1.strong_count(), 3); // original + set_next clone + data's associated clone
        let chain = data.associated().unwrap().chain_from();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].data().as_ref(), b"head1");
        assert_eq!(chain[1].data().as_ref(), b"head2");
    }

    #[test]
    fn next_links_form_queue() {
        let a = Refbuf::new(Bytes::from_static(b"a"), true, None);
        let b = Refbuf::new(Bytes::from_static(b"b"), true, None);
        a.set_next(b.retain());
        assert!(Refbuf::ptr_eq(&a.next().unwrap(), &b));
    }
}
