//! Engine configuration
//!
//! Nested configuration structs with sensible defaults. Every component of
//! the core takes its section by value at construction time.

use serde::{Deserialize, Serialize};

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of worker threads (0 = auto-detect CPU count)
    pub num_workers: usize,
    /// Capacity of the bounded global packet queue
    pub queue_capacity: usize,
    /// Maximum decoder layers in one protocol stack walk
    pub stack_depth: usize,
    /// Stream reassembly settings
    pub stream: StreamConfig,
    /// Fragment reassembly settings
    pub fragment: FragmentConfig,
    /// Session table settings
    pub session: SessionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_workers: 0, // Auto-detect
            queue_capacity: 2048,
            stack_depth: 16,
            stream: StreamConfig::default(),
            fragment: FragmentConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Get actual number of workers
    pub fn actual_workers(&self) -> usize {
        if self.num_workers == 0 {
            num_cpus::get().max(1)
        } else {
            self.num_workers
        }
    }

    /// Create a config with a fixed worker count
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.num_workers = workers;
        self
    }

    /// Create a config with a given queue capacity
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }
}

/// Stream (byte-sequence) reassembly configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Maximum buffered-but-undelivered bytes per stream
    pub max_buffered_bytes: usize,
    /// Idle timeout before an inactive stream is evicted (seconds)
    pub idle_timeout_secs: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_buffered_bytes: 256 * 1024,
            idle_timeout_secs: 120,
        }
    }
}

/// Datagram fragment reassembly configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FragmentConfig {
    /// Timeout for incomplete fragment chains (seconds)
    pub timeout_secs: u32,
}

impl Default for FragmentConfig {
    fn default() -> Self {
        Self { timeout_secs: 60 }
    }
}

/// Session table configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Maximum tracked sessions
    pub table_size: usize,
    /// Session expiry after last activity (seconds)
    pub timeout_secs: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            table_size: 65536,
            timeout_secs: 1800,
        }
    }
}
