// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The per-source listener loop: one cooperative task per running source,
//! grounded on `source.c`'s `source_main` iteration (poll producer, frame,
//! append, walk listeners, evict, drain pending, trim, publish stats).

use crate::error::{CoreError, Result};
use crate::format::{FormatType, MountRuntimeConfig};
use crate::framer::{build_framer, Framer};
use crate::listener::{Listener, ListenerSink};
use crate::queue::SourceQueue;
use crate::refbuf::Refbuf;
use crate::registry::MountRegistry;
use crate::stats::StatsSink;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Caps used by the listener walk to bound worst-case per-listener latency
/// within one scheduler iteration.
const MAX_BYTES_PER_LISTENER_ITERATION: usize = 20_000;
const MAX_WRITE_ITERATIONS_PER_LISTENER: u32 = 10;
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(250);

/// Non-blocking, timeout-bounded read from the producer connection.
#[async_trait]
pub trait ProducerRead: Send {
    /// Reads into `buf`, returning the number of bytes read (`0` on EOF) or
    /// an error. Must not block past `timeout`.
    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize>;
}

/// State shared across the owning source task and whichever other task
/// performs a cross-source migration (override reclaim). Only this part of
/// a source needs a lock; the queue itself never does.
pub struct SourceShared<S: ListenerSink> {
    pub running: bool,
    pub listeners: HashMap<u64, Listener<S>>,
    pub pending: Vec<Listener<S>>,
    pub listener_count: u32,
    pub config: MountRuntimeConfig,
}

impl<S: ListenerSink> SourceShared<S> {
    #[must_use]
    pub fn new(config: MountRuntimeConfig) -> Self {
        Self { running: true, listeners: HashMap::new(), pending: Vec::new(), listener_count: 0, config }
    }
}

/// Cheap, cloneable handle to a source, held by the mount registry and by
/// the HTTP layer for listener admission. The heavy queue/framer state lives
/// only inside the owning task's [`Source`].
pub struct SourceHandle<S: ListenerSink> {
    pub mount: String,
    pub format_type: FormatType,
    pub shared: Mutex<SourceShared<S>>,
}

impl<S: ListenerSink> SourceHandle<S> {
    #[must_use]
    pub fn new(mount: String, format_type: FormatType, config: MountRuntimeConfig) -> Self {
        Self { mount, format_type, shared: Mutex::new(SourceShared::new(config)) }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        #[allow(clippy::unwrap_used)]
        self.shared.lock().unwrap().running
    }

    #[must_use]
    pub fn listener_count(&self) -> u32 {
        #[allow(clippy::unwrap_used)]
        self.shared.lock().unwrap().listener_count
    }

    /// Hands a freshly accepted listener to the source's pending set,
    /// subject to `max_listeners`. Returns `false` if rejected (the caller
    /// should close the connection with no further diagnostic).
    pub fn admit(&self, listener: Listener<S>) -> bool {
        #[allow(clippy::unwrap_used)]
        let mut shared = self.shared.lock().unwrap();
        if let Some(max) = shared.config.max_listeners {
            if shared.listener_count >= max {
                return false;
            }
        }
        shared.listener_count += 1;
        shared.pending.push(listener);
        true
    }

    /// Requests that the owning task stop at the top of its next iteration.
    pub fn stop(&self) {
        #[allow(clippy::unwrap_used)]
        self.shared.lock().unwrap().running = false;
    }
}

/// The heavy, task-exclusive half of a source: the queue and framer. Only
/// the owning task ever touches this.
pub struct Source<S: ListenerSink> {
    pub handle: Arc<SourceHandle<S>>,
    queue: SourceQueue,
    framer: Box<dyn Framer>,
    last_read: Instant,
    short_delay: bool,
    next_listener_id: u64,
}

impl<S: ListenerSink> Source<S> {
    #[must_use]
    pub fn new(handle: Arc<SourceHandle<S>>) -> Self {
        #[allow(clippy::unwrap_used)]
        let config = handle.shared.lock().unwrap().config.clone();
        let framer =
            build_framer(handle.format_type, config.desync_tolerance_bytes, config.mp3_sync_frames);
        Self {
            queue: SourceQueue::new(config.burst_size_bytes, config.queue_size_limit),
            framer,
            handle,
            last_read: Instant::now(),
            short_delay: false,
            next_listener_id: 1,
        }
    }

    #[must_use]
    pub fn next_listener_id(&mut self) -> u64 {
        let id = self.next_listener_id;
        self.next_listener_id += 1;
        id
    }

    /// Runs the listener loop until the source stops. Returns once the
    /// producer is gone, has timed out, or has been externally stopped
    /// (override reclaim does not stop this loop; it only drains listeners
    /// from elsewhere into this source's pending set).
    #[instrument(skip_all, fields(mount = %self.handle.mount))]
    pub async fn run(
        mut self,
        mut producer: impl ProducerRead,
        registry: Arc<MountRegistry<S>>,
        stats: Arc<dyn StatsSink>,
    ) {
        let mut read_buf = vec![0u8; 65536];
        let timeout = {
            #[allow(clippy::unwrap_used)]
            let shared = self.handle.shared.lock().unwrap();
            Duration::from_secs(shared.config.source_timeout_secs.max(1))
        };

        loop {
            #[allow(clippy::unwrap_used)]
            let running = self.handle.shared.lock().unwrap().running;
            if !running {
                break;
            }

            let poll_timeout = if self.short_delay { Duration::ZERO } else { DEFAULT_POLL_TIMEOUT };
            match producer.read(&mut read_buf, poll_timeout).await {
                Ok(0) => {
                    if self.last_read.elapsed() > timeout {
                        warn!(mount = %self.handle.mount, "producer timed out");
                        break;
                    }
                    self.short_delay = false;
                }
                Ok(n) => {
                    self.last_read = Instant::now();
                    self.short_delay = true;
                    if let Err(err) = self.ingest(&read_buf[..n], &stats) {
                        warn!(mount = %self.handle.mount, error = %err, "framer desync, tearing down source");
                        break;
                    }
                }
                Err(e) => {
                    if e.kind() != std::io::ErrorKind::WouldBlock {
                        warn!(mount = %self.handle.mount, error = %e, "producer read error");
                        break;
                    }
                    self.short_delay = false;
                }
            }

            self.service_listeners(&stats);
        }

        self.teardown(&registry, &stats).await;
    }

    fn ingest(&mut self, bytes: &[u8], stats: &Arc<dyn StatsSink>) -> Result<()> {
        let refbufs = self.framer.push(bytes)?;
        let read_len: u64 = bytes.len() as u64;
        for buf in refbufs {
            self.queue.append(buf);
        }
        stats.publish(&self.handle.mount, "total_bytes_read", &read_len.to_string());
        if let Some(rate) = self.framer.sample_rate() {
            stats.publish(&self.handle.mount, "audio_samplerate", &rate.to_string());
        }
        if let Some(ch) = self.framer.channels() {
            stats.publish(&self.handle.mount, "audio_channels", &ch.to_string());
        }
        if let Some(br) = self.framer.bitrate() {
            stats.publish(&self.handle.mount, "audio_bitrate", &br.to_string());
        }
        Ok(())
    }

    /// One full listener-walk iteration: attach pending/new listeners,
    /// service writes, evict, drain, trim, publish.
    fn service_listeners(&mut self, stats: &Arc<dyn StatsSink>) {
        let deletion_expected = self.queue.is_over_limit();
        let head_ptr = self.queue.head().cloned();

        #[allow(clippy::unwrap_used)]
        let mut shared = self.handle.shared.lock().unwrap();

        for listener in shared.listeners.values_mut() {
            if !listener.is_attached() {
                let Some(start) = self.queue.burst_point() else { continue };
                listener.attach(start);
            }
            listener.service(MAX_BYTES_PER_LISTENER_ITERATION, MAX_WRITE_ITERATIONS_PER_LISTENER);
        }

        let mut total_sent = 0u64;
        let before = shared.listeners.len();
        shared.listeners.retain(|_, listener| {
            total_sent += listener.bytes_sent;
            if listener.errored {
                return false;
            }
            if deletion_expected {
                if let (Some(head), Some(cur)) = (&head_ptr, listener.cur_refbuf()) {
                    if Refbuf::ptr_eq(head, cur) {
                        return false;
                    }
                }
            }
            true
        });
        let evicted = before - shared.listeners.len();
        if evicted > 0 {
            debug!(mount = %self.handle.mount, evicted, "evicted listeners");
        }

        if total_sent > 0 {
            stats.publish(&self.handle.mount, "total_bytes_sent", &total_sent.to_string());
        }

        let previous_count = shared.listener_count;
        for mut listener in shared.pending.drain(..) {
            let id = listener.id;
            if listener.errored {
                continue;
            }
            listener.id = id;
            shared.listeners.insert(id, listener);
        }
        shared.listener_count = u32::try_from(shared.listeners.len()).unwrap_or(u32::MAX);

        if shared.listener_count != previous_count {
            stats.publish(&self.handle.mount, "listeners", &shared.listener_count.to_string());
        }

        drop(shared);
        self.queue.trim();
    }

    /// Producer gone or timed out: mark not-running, migrate listeners to
    /// the fallback if one is configured and matches format, then report.
    async fn teardown(self, registry: &Arc<MountRegistry<S>>, stats: &Arc<dyn StatsSink>) {
        self.handle.stop();
        let mount = self.handle.mount.clone();

        let fallback = {
            #[allow(clippy::unwrap_used)]
            let shared = self.handle.shared.lock().unwrap();
            shared.config.fallback_mount.clone()
        };

        if let Some(fallback_mount) = fallback {
            if let Some(dest) = registry.find_with_fallback(&fallback_mount) {
                if dest.format_type == self.handle.format_type {
                    let moved = registry.migrate_listeners(&self.handle, &dest);
                    info!(mount = %mount, to = %dest.mount, moved, "migrated listeners to fallback");
                }
            }
        }

        registry.remove(&mount);
        stats.publish(&mount, "connected", "0");
        stats.publish(&mount, "listeners", "0");
        info!(mount = %mount, "source removed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::CodecAdapter;
    use bytes::Bytes;
    use std::io;

    struct NullSink;
    impl ListenerSink for NullSink {
        fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }
    }

    #[test]
    fn admit_respects_max_listeners() {
        let handle = SourceHandle::<NullSink>::new(
            "/live".into(),
            FormatType::Mp3,
            MountRuntimeConfig { max_listeners: Some(1), ..Default::default() },
        );
        assert!(handle.admit(Listener::new(1, NullSink, CodecAdapter::Passthrough)));
        assert!(!handle.admit(Listener::new(2, NullSink, CodecAdapter::Passthrough)));
    }

    #[test]
    fn service_listeners_attaches_and_advances() {
        let handle = Arc::new(SourceHandle::<NullSink>::new(
            "/live".into(),
            FormatType::Mp3,
            MountRuntimeConfig::default(),
        ));
        let mut source = Source::new(handle.clone());
        source.queue.append(Refbuf::new(Bytes::from_static(b"abc"), true, None));
        handle.admit(Listener::new(1, NullSink, CodecAdapter::Passthrough));

        struct NoopStats;
        impl StatsSink for NoopStats {
            fn publish(&self, _mount: &str, _key: &str, _value: &str) {}
        }
        let stats: Arc<dyn StatsSink> = Arc::new(NoopStats);
        source.service_listeners(&stats);
        #[allow(clippy::unwrap_used)]
        let shared = handle.shared.lock().unwrap();
        assert_eq!(shared.listener_count, 1);
        assert_eq!(shared.listeners.get(&1).unwrap().bytes_sent, 3);
    }
}
