// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The stats sink: an external collaborator the core publishes key/value
//! pairs to. The core never blocks on a full sink and never reads anything
//! back except through [`StatsSink::get_listener_count`] /
//! [`StatsSink::get_current_artist_title`], which exist purely so an admin
//! surface can query without reaching into source internals directly.

/// Outbound/inbound interface to the stats subsystem. Implementations are
/// expected to be cheap and non-blocking; the core calls `publish` on every
/// ingest and every listener-count change.
pub trait StatsSink: Send + Sync {
    /// Publishes `key=value` for `mount`. Recognized keys include
    /// `listeners`, `listener_peak`, `connected`, `content-type`,
    /// `audio_bitrate`, `audio_samplerate`, `audio_channels`,
    /// `total_bytes_sent`, `total_bytes_read`.
    fn publish(&self, mount: &str, key: &str, value: &str);

    fn get_listener_count(&self, _mount: &str) -> Option<u32> {
        None
    }

    fn get_current_artist_title(&self, _mount: &str) -> Option<String> {
        None
    }
}

/// A [`StatsSink`] that discards everything. Useful for tests and for
/// standalone use of the core without the ambient stats subsystem wired up.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStatsSink;

impl StatsSink for NullStatsSink {
    fn publish(&self, _mount: &str, _key: &str, _value: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_sink_accepts_any_publish() {
        let sink = NullStatsSink;
        sink.publish("/live", "listeners", "3");
        assert_eq!(sink.get_listener_count("/live"), None);
    }
}
