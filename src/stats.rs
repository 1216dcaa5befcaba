//! Engine-wide counters
//!
//! Thread-safe counters shared between the scheduler, the dispatcher and the
//! reassembly engines. Nothing in the core drops data silently: every
//! eviction, duplicate and rejection shows up here.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Thread-safe statistics for the packet core
#[derive(Debug, Default)]
pub struct CoreStats {
    /// Packets admitted to the queue
    pub packets_queued: AtomicU64,
    /// Packets fully processed
    pub packets_processed: AtomicU64,
    /// Fragments received by multipart reassembly
    pub fragments_received: AtomicU64,
    /// Fragments dropped (timeout or failed chain)
    pub fragments_dropped: AtomicU64,
    /// Logical packets synthesized by reassembly
    pub reassembled_packets: AtomicU64,
    /// Stream segments delivered in order
    pub segments_delivered: AtomicU64,
    /// Stream segments buffered out of order
    pub segments_buffered: AtomicU64,
    /// Stream segments dropped as duplicates / overlaps
    pub segments_duplicate: AtomicU64,
    /// Stream segments rejected by the buffer cap
    pub segments_rejected: AtomicU64,
    /// Streams evicted on idle timeout
    pub streams_evicted: AtomicU64,
    /// Bytes discarded when an idle stream was evicted
    pub stream_bytes_discarded: AtomicU64,
}

impl CoreStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create shared stats
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    #[inline]
    pub fn inc(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Point-in-time copy of all counters
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets_queued: self.packets_queued.load(Ordering::Relaxed),
            packets_processed: self.packets_processed.load(Ordering::Relaxed),
            fragments_received: self.fragments_received.load(Ordering::Relaxed),
            fragments_dropped: self.fragments_dropped.load(Ordering::Relaxed),
            reassembled_packets: self.reassembled_packets.load(Ordering::Relaxed),
            segments_delivered: self.segments_delivered.load(Ordering::Relaxed),
            segments_buffered: self.segments_buffered.load(Ordering::Relaxed),
            segments_duplicate: self.segments_duplicate.load(Ordering::Relaxed),
            segments_rejected: self.segments_rejected.load(Ordering::Relaxed),
            streams_evicted: self.streams_evicted.load(Ordering::Relaxed),
            stream_bytes_discarded: self.stream_bytes_discarded.load(Ordering::Relaxed),
        }
    }
}

/// Serializable counter snapshot
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSnapshot {
    pub packets_queued: u64,
    pub packets_processed: u64,
    pub fragments_received: u64,
    pub fragments_dropped: u64,
    pub reassembled_packets: u64,
    pub segments_delivered: u64,
    pub segments_buffered: u64,
    pub segments_duplicate: u64,
    pub segments_rejected: u64,
    pub streams_evicted: u64,
    pub stream_bytes_discarded: u64,
}
