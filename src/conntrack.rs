//! Session tracking contract
//!
//! The core does not own connection-tracking storage; it consumes a
//! lock/refcount/cleanup contract against it. `SessionTracker` is that
//! contract, and `SessionTable` is a small hash-map implementation so the
//! engine and its tests have a concrete collaborator.
//!
//! Lock discipline: an entry's state lock is held only across the
//! synchronous `process` phase of the layer that owns it, and never across
//! the pause barrier or a reassembler's internal lock.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::SessionConfig;
use crate::error::Result;
use crate::Timestamp;

/// Protocol-specific tuple, hashed by the owning decoder
pub type SessionKey = u64;

/// Mutable per-session state, guarded by the entry lock
#[derive(Default)]
pub struct SessionState {
    /// Decoder-owned state hanging off this session (fragment chains,
    /// streams); the core never interprets it
    pub private: Option<Box<dyn Any + Send>>,
    /// Expiry deadline in logical time, set by `delayed_cleanup`
    pub expires_at: Option<Timestamp>,
}

/// One tracked session
pub struct SessionEntry {
    key: SessionKey,
    state: Mutex<SessionState>,
    refcount: AtomicU32,
}

impl SessionEntry {
    pub fn key(&self) -> SessionKey {
        self.key
    }

    /// Lock the entry state. Hold only across the synchronous process phase.
    pub fn lock(&self) -> parking_lot::MutexGuard<'_, SessionState> {
        self.state.lock()
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Relaxed)
    }
}

/// Shared handle to a session entry
pub type SessionHandle = Arc<SessionEntry>;

/// The contract the dispatcher consumes against connection tracking.
///
/// `lookup_or_create` returns the entry with its reference count already
/// incremented; every acquired handle must be balanced by exactly one
/// `refcount_dec`, performed during stack unwind.
pub trait SessionTracker: Send + Sync {
    fn lookup_or_create(&self, key: SessionKey, now: Timestamp) -> Result<SessionHandle>;

    /// Arrange for the entry to expire `timeout_secs` after `now`
    fn delayed_cleanup(&self, entry: &SessionHandle, timeout_secs: u32, now: Timestamp);

    fn refcount_dec(&self, entry: &SessionHandle);

    /// Drop expired, unreferenced entries; returns how many were removed
    fn flush_expired(&self, now: Timestamp) -> usize;

    /// Drop everything, used on the Finishing -> Idle transition
    fn flush_all(&self) -> usize;

    fn session_count(&self) -> usize;
}

/// Table statistics
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    pub lookups: u64,
    pub hits: u64,
    pub created: u64,
    pub expired: u64,
}

/// Hash-map session table with logical-time expiry
pub struct SessionTable {
    config: SessionConfig,
    entries: Mutex<HashMap<SessionKey, SessionHandle>>,
    stats: Mutex<SessionStats>,
}

impl SessionTable {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::with_capacity(config.table_size.min(100_000))),
            config,
            stats: Mutex::new(SessionStats::default()),
        }
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.lock().clone()
    }
}

impl SessionTracker for SessionTable {
    fn lookup_or_create(&self, key: SessionKey, now: Timestamp) -> Result<SessionHandle> {
        let mut entries = self.entries.lock();
        let mut stats = self.stats.lock();
        stats.lookups += 1;

        if let Some(entry) = entries.get(&key) {
            stats.hits += 1;
            entry.refcount.fetch_add(1, Ordering::Relaxed);
            return Ok(entry.clone());
        }

        stats.created += 1;
        let entry = Arc::new(SessionEntry {
            key,
            state: Mutex::new(SessionState {
                private: None,
                expires_at: Some(now + chrono::Duration::seconds(self.config.timeout_secs as i64)),
            }),
            refcount: AtomicU32::new(1),
        });
        entries.insert(key, entry.clone());
        trace!(key, total = entries.len(), "session created");
        Ok(entry)
    }

    fn delayed_cleanup(&self, entry: &SessionHandle, timeout_secs: u32, now: Timestamp) {
        entry.lock().expires_at = Some(now + chrono::Duration::seconds(timeout_secs as i64));
    }

    fn refcount_dec(&self, entry: &SessionHandle) {
        let prev = entry.refcount.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "session refcount underflow");
    }

    fn flush_expired(&self, now: Timestamp) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| {
            if entry.refcount.load(Ordering::Relaxed) > 0 {
                return true;
            }
            match entry.lock().expires_at {
                Some(deadline) => deadline > now,
                None => true,
            }
        });
        let removed = before - entries.len();
        if removed > 0 {
            self.stats.lock().expired += removed as u64;
            debug!(removed, remaining = entries.len(), "expired sessions flushed");
        }
        removed
    }

    fn flush_all(&self) -> usize {
        let mut entries = self.entries.lock();
        let removed = entries.len();
        entries.clear();
        if removed > 0 {
            debug!(removed, "session table emptied");
        }
        removed
    }

    fn session_count(&self) -> usize {
        self.entries.lock().len()
    }
}
