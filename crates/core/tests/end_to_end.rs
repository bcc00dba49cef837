// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! End-to-end scenarios exercising the registry, source and listener stack
//! together through the public API only, the way `apps/server`'s handlers
//! do (minus the HTTP layer itself). Mirrors the teacher's integration test
//! placement: one `tests/` file per crate, unit tests in each module.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use castcore::format::{FormatType, MountRuntimeConfig};
use castcore::listener::{CodecAdapter, Listener, ListenerSink};
use castcore::registry::MountRegistry;
use castcore::source::{ProducerRead, Source};
use castcore::stats::{NullStatsSink, StatsSink};

/// Accumulates every byte handed to it; never blocks.
#[derive(Clone)]
struct MemSink(Arc<Mutex<Vec<u8>>>);

impl MemSink {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(Vec::new())))
    }

    fn bytes(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

impl ListenerSink for MemSink {
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
}

/// Never accepts a single byte; every write looks like a full socket buffer.
struct StalledSink;

impl ListenerSink for StalledSink {
    fn try_write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::WouldBlock, "stalled listener"))
    }
}

/// Feeds a fixed sequence of chunks, then reports `Ok(0)` forever — the same
/// shape `BodyProducer` presents once the producer body stream ends, which
/// `Source::run` only distinguishes from a live stall by `source_timeout`.
struct ChunkProducer {
    chunks: VecDeque<Bytes>,
}

impl ChunkProducer {
    fn new(chunks: Vec<Bytes>) -> Self {
        Self { chunks: chunks.into() }
    }
}

#[async_trait]
impl ProducerRead for ChunkProducer {
    async fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> io::Result<usize> {
        match self.chunks.pop_front() {
            Some(chunk) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                Ok(n)
            },
            None => Ok(0),
        }
    }
}

fn mp3_frame(len: usize) -> Vec<u8> {
    // MPEG1 Layer III, 128 kbps, 44100 Hz, stereo, no padding: 144*128000/44100 = 417 bytes.
    let mut f = vec![0xFFu8, 0xFB, 0x90, 0x00];
    f.resize(len.max(417), 0);
    f
}

fn ogg_page(serial: u32, seq: u32, header_type: u8, granule_pos: i64, body: &[u8]) -> Vec<u8> {
    let mut page = Vec::new();
    page.extend_from_slice(b"OggS");
    page.push(0); // version
    page.push(header_type);
    page.extend_from_slice(&granule_pos.to_le_bytes());
    page.extend_from_slice(&serial.to_le_bytes());
    page.extend_from_slice(&seq.to_le_bytes());
    page.extend_from_slice(&0u32.to_le_bytes()); // checksum, unchecked by the framer
    let segments = body.len().div_ceil(255).max(1);
    page.push(segments as u8);
    let mut remaining = body.len();
    for _ in 0..segments {
        let seg = remaining.min(255);
        page.push(seg as u8);
        remaining -= seg;
    }
    page.extend_from_slice(body);
    page
}

fn fast_config(overrides: impl FnOnce(&mut MountRuntimeConfig)) -> MountRuntimeConfig {
    let mut cfg = MountRuntimeConfig { source_timeout_secs: 0, ..MountRuntimeConfig::default() };
    overrides(&mut cfg);
    cfg
}

fn noop_stats() -> Arc<dyn StatsSink> {
    Arc::new(NullStatsSink)
}

/// Scenario 1: single MP3 listener receives every frame, byte-identically,
/// starting on a frame-header boundary.
#[tokio::test]
async fn single_listener_receives_full_mp3_stream() {
    let registry: Arc<MountRegistry<MemSink>> = Arc::new(MountRegistry::new());
    let config = fast_config(|_| {});
    let handle = registry.reserve("/live", FormatType::Mp3, config).unwrap();

    let sink = MemSink::new();
    assert!(handle.admit(Listener::new(1, sink.clone(), CodecAdapter::Passthrough)));

    let frame = mp3_frame(417);
    let mut stream = Vec::new();
    for _ in 0..50 {
        stream.extend_from_slice(&frame);
    }
    let producer = ChunkProducer::new(vec![Bytes::from(stream.clone())]);

    let source = Source::new(handle.clone());
    source.run(producer, registry.clone(), noop_stats()).await;

    let received = sink.bytes();
    assert_eq!(received.len(), stream.len());
    assert_eq!(received, stream);
    assert_eq!(&received[..2], &[0xFF, 0xFB]);
}

/// Scenario 2: two listeners attaching at different points both receive the
/// Ogg header chain byte-identically before their first data page.
#[tokio::test]
async fn ogg_header_chain_replays_for_every_listener() {
    let registry: Arc<MountRegistry<MemSink>> = Arc::new(MountRegistry::new());
    let config = fast_config(|_| {});
    let handle = registry.reserve("/live", FormatType::Ogg, config).unwrap();

    // Only the identification page is BOS; the comment page is an ordinary
    // page with granule_pos 0, same as a real Vorbis/Opus encoder emits.
    let ident = ogg_page(1, 0, 0x02, 0, b"vorbis-ident-header-data");
    let comment = ogg_page(1, 1, 0x00, 0, b"vorbis-comment-header-data");
    let data1 = ogg_page(1, 2, 0x00, 4096, b"audio-page-one");
    let data2 = ogg_page(1, 3, 0x00, 8192, b"audio-page-two");

    let listener_a = MemSink::new();
    let listener_b = MemSink::new();
    assert!(handle.admit(Listener::new(1, listener_a.clone(), CodecAdapter::Passthrough)));

    let mut stream = Vec::new();
    stream.extend_from_slice(&ident);
    stream.extend_from_slice(&comment);
    stream.extend_from_slice(&data1);

    // Listener B attaches mid-stream, after the headers have already gone by.
    assert!(handle.admit(Listener::new(2, listener_b.clone(), CodecAdapter::Passthrough)));
    stream.extend_from_slice(&data2);

    let producer = ChunkProducer::new(vec![Bytes::from(stream)]);
    let source = Source::new(handle.clone());
    source.run(producer, registry.clone(), noop_stats()).await;

    let mut expected_headers = Vec::new();
    expected_headers.extend_from_slice(&ident);
    expected_headers.extend_from_slice(&comment);

    for received in [listener_a.bytes(), listener_b.bytes()] {
        assert!(received.starts_with(&expected_headers));
    }
}

/// Scenario 3: a listener whose socket accepts zero bytes is evicted once
/// the queue outgrows `queue_size_limit`.
#[tokio::test]
async fn lagging_listener_is_evicted() {
    let registry: Arc<MountRegistry<StalledSink>> = Arc::new(MountRegistry::new());
    let config = fast_config(|c| {
        c.queue_size_limit = 65536;
        c.burst_size_bytes = 0;
    });
    let handle = registry.reserve("/live", FormatType::Text, config).unwrap();
    assert!(handle.admit(Listener::new(1, StalledSink, CodecAdapter::Passthrough)));

    let chunk = Bytes::from(vec![0u8; 4096]);
    // 20 chunks of 4096 bytes comfortably exceeds the 65536-byte limit
    // within ceil(65536/4096) = 16 iterations.
    let producer = ChunkProducer::new(vec![chunk; 20]);

    let source = Source::new(handle.clone());
    source.run(producer, registry.clone(), noop_stats()).await;

    assert_eq!(handle.listener_count(), 0);
}

/// Scenario 4: killing `/live`'s producer migrates both its listeners onto
/// its same-format fallback, and `/live` leaves the registry.
#[tokio::test]
async fn producer_disconnect_migrates_listeners_to_fallback() {
    let registry: Arc<MountRegistry<MemSink>> = Arc::new(MountRegistry::new());
    let backup_config = fast_config(|_| {});
    let backup = registry.reserve("/backup", FormatType::Mp3, backup_config).unwrap();

    let live_config =
        fast_config(|c| c.fallback_mount = Some("/backup".to_string()));
    let live = registry.reserve("/live", FormatType::Mp3, live_config).unwrap();
    assert!(live.admit(Listener::new(1, MemSink::new(), CodecAdapter::Passthrough)));
    assert!(live.admit(Listener::new(2, MemSink::new(), CodecAdapter::Passthrough)));

    let producer = ChunkProducer::new(vec![]); // immediate EOF, times out right away
    let source = Source::new(live.clone());
    source.run(producer, registry.clone(), noop_stats()).await;

    assert_eq!(live.listener_count(), 0);
    assert!(registry.find_raw("/live").is_none());
    assert_eq!(backup.shared.lock().unwrap().pending.len(), 2);
}

/// Scenario 5: a source coming online with `fallback_override` reclaims its
/// fallback's listeners immediately, without waiting for the fallback's
/// producer to go away.
#[tokio::test]
async fn fallback_override_reclaims_listeners_on_connect() {
    let registry: Arc<MountRegistry<MemSink>> = Arc::new(MountRegistry::new());
    let backup = registry.reserve("/backup", FormatType::Mp3, fast_config(|_| {})).unwrap();
    for id in 1..=3 {
        assert!(backup.admit(Listener::new(id, MemSink::new(), CodecAdapter::Passthrough)));
    }
    // Admission normally drains `pending` into `listeners` inside a running
    // source's iteration loop; reach in directly here since `/backup` has no
    // owning task in this scenario.
    {
        let mut shared = backup.shared.lock().unwrap();
        let pending: Vec<_> = shared.pending.drain(..).collect();
        for listener in pending {
            shared.listeners.insert(listener.id, listener);
        }
    }

    let live_config = fast_config(|c| {
        c.fallback_mount = Some("/backup".to_string());
        c.fallback_override = true;
    });
    let live = registry.reserve("/live", FormatType::Mp3, live_config).unwrap();
    let reclaimed = registry.apply_fallback_override(&live);

    assert_eq!(reclaimed, 3);
    assert_eq!(backup.listener_count(), 0);
    assert!(backup.is_running());
    assert_eq!(live.shared.lock().unwrap().pending.len(), 3);
}

/// Scenario 6: a format mismatch between a source and its configured
/// fallback drops that fallback's listeners at teardown instead of moving
/// them.
#[tokio::test]
async fn format_mismatch_drops_listeners_instead_of_migrating() {
    let registry: Arc<MountRegistry<MemSink>> = Arc::new(MountRegistry::new());
    let backup = registry.reserve("/backup", FormatType::Ogg, fast_config(|_| {})).unwrap();

    let live_config =
        fast_config(|c| c.fallback_mount = Some("/backup".to_string()));
    let live = registry.reserve("/live", FormatType::Mp3, live_config).unwrap();
    assert!(live.admit(Listener::new(1, MemSink::new(), CodecAdapter::Passthrough)));

    let producer = ChunkProducer::new(vec![]);
    let source = Source::new(live.clone());
    source.run(producer, registry.clone(), noop_stats()).await;

    assert_eq!(backup.shared.lock().unwrap().pending.len(), 0);
    assert!(registry.find_raw("/live").is_none());
}
