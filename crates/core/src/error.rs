// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Structured error types for the streaming core.
//!
//! Only the failures that cross a module boundary as an explicit result get a
//! variant here. Transient I/O (`EAGAIN`/`EWOULDBLOCK`) and listener-fatal
//! errors never reach this type — they are handled locally inside the
//! listener loop, exactly as the error taxonomy prescribes.

use thiserror::Error;

/// Main error type for the streaming core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A producer or listener was rejected before a `Source` entered `Running`.
    ///
    /// Examples:
    /// - Mount already reserved by another producer
    /// - Malformed mount path (doesn't start with `/`)
    /// - Unsupported or missing `content-type`
    /// - `max_sources` exceeded
    #[error("admission rejected: {0}")]
    Admission(String),

    /// The framer could not find a sync point within its tolerance and the
    /// source must be torn down.
    #[error("framer desync: {0}")]
    FramerDesync(String),

    /// The producer connection is gone or has stopped sending data within
    /// `source_timeout`. Triggers migration and teardown.
    #[error("source fatal: {0}")]
    SourceFatal(String),

    /// Bad or missing configuration for a mount or the server.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// I/O error talking to a producer or listener socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type alias for Results using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

impl From<CoreError> for String {
    fn from(err: CoreError) -> Self {
        err.to_string()
    }
}

impl From<String> for CoreError {
    fn from(s: String) -> Self {
        Self::SourceFatal(s)
    }
}

impl From<&str> for CoreError {
    fn from(s: &str) -> Self {
        Self::SourceFatal(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::Admission("mount already reserved".to_string());
        assert_eq!(err.to_string(), "admission rejected: mount already reserved");

        let err = CoreError::FramerDesync("no sync in 20000 bytes".to_string());
        assert_eq!(err.to_string(), "framer desync: no sync in 20000 bytes");
    }

    #[test]
    fn test_error_to_string_conversion() {
        let err = CoreError::SourceFatal("producer gone".to_string());
        let s: String = err.into();
        assert_eq!(s, "source fatal: producer gone");
    }

    #[test]
    fn test_string_to_error_conversion() {
        let err: CoreError = "something went wrong".into();
        assert_eq!(err.to_string(), "source fatal: something went wrong");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "not found");
        let err: CoreError = io_err.into();
        assert!(err.to_string().contains("I/O error"));
    }
}
