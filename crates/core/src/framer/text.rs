// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Pass-through framer for `text/*` content types: the whole stream is
//! forwarded verbatim, one refbuf per `push`, with only the first refbuf
//! marked as a sync-point.

use crate::error::Result;
use crate::format::FormatType;
use crate::refbuf::Refbuf;
use bytes::Bytes;

pub struct TextFramer {
    first_emitted: bool,
}

impl TextFramer {
    #[must_use]
    pub const fn new() -> Self {
        Self { first_emitted: false }
    }
}

impl Default for TextFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl super::Framer for TextFramer {
    fn push(&mut self, bytes: &[u8]) -> Result<Vec<Refbuf>> {
        if bytes.is_empty() {
            return Ok(Vec::new());
        }
        let sync = !self.first_emitted;
        self.first_emitted = true;
        Ok(vec![Refbuf::new(Bytes::copy_from_slice(bytes), sync, None)])
    }

    fn format_type(&self) -> FormatType {
        FormatType::Text
    }
}

#[cfg(test)]
mod tests {
    use super::super::Framer;
    use super::*;

    #[test]
    fn only_first_chunk_is_sync() {
        let mut framer = TextFramer::new();
        let a = framer.push(b"hello ").unwrap();
        let b = framer.push(b"world").unwrap();
        assert!(a[0].sync_point());
        assert!(!b[0].sync_point());
    }
}
