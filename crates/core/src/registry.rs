// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The mountpoint registry: `path -> Source` with fallback resolution and
//! the move-clients migration protocol.
//!
//! Grounded on `source.c`'s `source_find_mount`/`source_find_mount_raw` and
//! `source_move_clients`: an ordered map behind a read-write lock, a global
//! mutex serializing migrations, and a fixed lock order (source being
//! drained first, fallback second) to avoid deadlocking a reverse migration
//! against a forward one.

use crate::error::{CoreError, Result};
use crate::format::{FormatType, MountRuntimeConfig};
use crate::listener::ListenerSink;
use crate::source::SourceHandle;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

/// Cycles and runaway chains in the fallback graph yield "no source" once
/// this many hops have been tried, per the fallback-depth invariant.
pub const MAX_FALLBACK_DEPTH: u32 = 10;

pub struct MountRegistry<S: ListenerSink> {
    mounts: RwLock<HashMap<String, Arc<SourceHandle<S>>>>,
    move_clients: Mutex<()>,
}

impl<S: ListenerSink> Default for MountRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: ListenerSink> MountRegistry<S> {
    #[must_use]
    pub fn new() -> Self {
        Self { mounts: RwLock::new(HashMap::new()), move_clients: Mutex::new(()) }
    }

    /// Inserts an empty reserved source at `path` if absent. Exactly one
    /// concurrent caller for the same path succeeds; this is the
    /// at-most-one-producer-per-mount guarantee.
    pub fn reserve(
        &self,
        path: &str,
        format_type: FormatType,
        config: MountRuntimeConfig,
    ) -> Result<Arc<SourceHandle<S>>> {
        if !path.starts_with('/') {
            return Err(CoreError::Admission(format!("malformed mount path: {path}")));
        }
        #[allow(clippy::unwrap_used)]
        let mut mounts = self.mounts.write().unwrap();
        if mounts.contains_key(path) {
            return Err(CoreError::Admission(format!("mount already reserved: {path}")));
        }
        let handle = Arc::new(SourceHandle::new(path.to_string(), format_type, config));
        mounts.insert(path.to_string(), handle.clone());
        Ok(handle)
    }

    #[must_use]
    pub fn find_raw(&self, path: &str) -> Option<Arc<SourceHandle<S>>> {
        #[allow(clippy::unwrap_used)]
        self.mounts.read().unwrap().get(path).cloned()
    }

    /// Walks the fallback chain from `path` until a running source is found
    /// or [`MAX_FALLBACK_DEPTH`] is reached, terminating on cycles the same
    /// way.
    #[must_use]
    pub fn find_with_fallback(&self, path: &str) -> Option<Arc<SourceHandle<S>>> {
        let mut current = path.to_string();
        for _ in 0..MAX_FALLBACK_DEPTH {
            let Some(handle) = self.find_raw(&current) else { return None };
            if handle.is_running() {
                return Some(handle);
            }
            #[allow(clippy::unwrap_used)]
            let next = handle.shared.lock().unwrap().config.fallback_mount.clone();
            match next {
                Some(next_mount) if next_mount != current => current = next_mount,
                _ => return None,
            }
        }
        None
    }

    pub fn remove(&self, path: &str) {
        #[allow(clippy::unwrap_used)]
        self.mounts.write().unwrap().remove(path);
    }

    #[must_use]
    pub fn iter(&self) -> Vec<Arc<SourceHandle<S>>> {
        #[allow(clippy::unwrap_used)]
        self.mounts.read().unwrap().values().cloned().collect()
    }

    /// Migrates every listener (active and pending) from `from` to `to`.
    /// Held across the global `move_clients` mutex so two concurrent
    /// migrations touching the same source cannot interleave; locks `from`
    /// before `to`, matching the documented fixed order.
    pub fn migrate_listeners(&self, from: &Arc<SourceHandle<S>>, to: &Arc<SourceHandle<S>>) -> usize {
        if Arc::ptr_eq(from, to) {
            // Migrating a source to itself is specified as a no-op on both
            // counts and membership; locking the same mutex twice here
            // would also deadlock.
            return 0;
        }

        #[allow(clippy::unwrap_used)]
        let _guard = self.move_clients.lock().unwrap();

        #[allow(clippy::unwrap_used)]
        let mut from_shared = from.shared.lock().unwrap();
        #[allow(clippy::unwrap_used)]
        let mut to_shared = to.shared.lock().unwrap();
        if !to_shared.running {
            return 0;
        }

        let mut moved = 0usize;
        let listener_ids: Vec<u64> = from_shared.listeners.keys().copied().collect();
        for id in listener_ids {
            if let Some(mut listener) = from_shared.listeners.remove(&id) {
                listener.reset_for_migration();
                to_shared.pending.push(listener);
                moved += 1;
            }
        }
        for mut listener in from_shared.pending.drain(..) {
            listener.reset_for_migration();
            to_shared.pending.push(listener);
            moved += 1;
        }
        from_shared.listener_count = 0;
        moved
    }

    /// Fallback override: when `new_source` comes online with
    /// `fallback_override=true` naming mount `M`, reclaim `M`'s listeners if
    /// `M` is running. `M` is looked up by exact path, not a fallback-chain
    /// walk, since the override names a specific source to reclaim from.
    pub fn apply_fallback_override(&self, new_source: &Arc<SourceHandle<S>>) -> usize {
        let (fallback_mount, override_enabled) = {
            #[allow(clippy::unwrap_used)]
            let shared = new_source.shared.lock().unwrap();
            (shared.config.fallback_mount.clone(), shared.config.fallback_override)
        };
        if !override_enabled {
            return 0;
        }
        let Some(m) = fallback_mount else { return 0 };
        let Some(existing) = self.find_raw(&m) else { return 0 };
        if !existing.is_running() || existing.format_type != new_source.format_type {
            return 0;
        }
        self.migrate_listeners(&existing, new_source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::Listener;
    use std::io;

    struct NullSink;
    impl ListenerSink for NullSink {
        fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }
    }

    #[test]
    fn at_most_one_reserve_succeeds() {
        let reg: MountRegistry<NullSink> = MountRegistry::new();
        assert!(reg.reserve("/live", FormatType::Mp3, MountRuntimeConfig::default()).is_ok());
        assert!(reg.reserve("/live", FormatType::Mp3, MountRuntimeConfig::default()).is_err());
    }

    #[test]
    fn malformed_path_rejected() {
        let reg: MountRegistry<NullSink> = MountRegistry::new();
        assert!(reg.reserve("live", FormatType::Mp3, MountRuntimeConfig::default()).is_err());
    }

    #[test]
    fn fallback_chain_terminates_on_cycle() {
        let reg: MountRegistry<NullSink> = MountRegistry::new();
        let cfg_a = MountRuntimeConfig { fallback_mount: Some("/b".into()), ..Default::default() };
        let cfg_b = MountRuntimeConfig { fallback_mount: Some("/a".into()), ..Default::default() };
        let a = reg.reserve("/a", FormatType::Mp3, cfg_a).unwrap();
        let b = reg.reserve("/b", FormatType::Mp3, cfg_b).unwrap();
        a.stop();
        b.stop();
        assert!(reg.find_with_fallback("/a").is_none());
    }

    #[test]
    fn migrate_listeners_moves_active_and_pending() {
        use crate::listener::CodecAdapter;
        let reg: MountRegistry<NullSink> = MountRegistry::new();
        let from = reg.reserve("/live", FormatType::Mp3, MountRuntimeConfig::default()).unwrap();
        let to = reg.reserve("/backup", FormatType::Mp3, MountRuntimeConfig::default()).unwrap();
        from.admit(Listener::new(1, NullSink, CodecAdapter::Passthrough));

        let moved = reg.migrate_listeners(&from, &to);
        assert_eq!(moved, 1);
        assert_eq!(from.listener_count(), 0);
        #[allow(clippy::unwrap_used)]
        let to_shared = to.shared.lock().unwrap();
        assert_eq!(to_shared.pending.len(), 1);
    }

    #[test]
    fn move_clients_idempotent_self_migration() {
        use crate::listener::CodecAdapter;
        let reg: MountRegistry<NullSink> = MountRegistry::new();
        let s = reg.reserve("/live", FormatType::Mp3, MountRuntimeConfig::default()).unwrap();
        let f = reg.reserve("/backup", FormatType::Mp3, MountRuntimeConfig::default()).unwrap();
        s.admit(Listener::new(1, NullSink, CodecAdapter::Passthrough));

        let first = reg.migrate_listeners(&s, &f);
        assert_eq!(first, 1);
        assert_eq!(s.listener_count(), 0);
        #[allow(clippy::unwrap_used)]
        let pending_after_first = f.shared.lock().unwrap().pending.len();
        assert_eq!(pending_after_first, 1);

        // F to F must be a no-op on both counts and membership.
        let second = reg.migrate_listeners(&f, &f);
        assert_eq!(second, 0);
        #[allow(clippy::unwrap_used)]
        let pending_after_second = f.shared.lock().unwrap().pending.len();
        assert_eq!(pending_after_second, 1);
    }
}
