//! flowtap: passive network traffic analysis core
//!
//! A multi-threaded engine that takes timestamped packets from any capture
//! source, runs each through a dynamic stack of protocol decoders, and gives
//! decoders the building blocks real traffic needs: pooled buffers, session
//! tracking, fragment reassembly, ordered stream reassembly and line
//! parsing. Time is logical throughout; timers fire against the clock of
//! the packets being processed, so live capture and replayed captures
//! behave identically.

pub mod config;
pub mod conntrack;
pub mod core;
pub mod engine;
pub mod error;
pub mod reassembly;
pub mod stats;
pub mod timer;

/// Packet and timer timestamps, UTC
pub type Timestamp = chrono::DateTime<chrono::Utc>;

pub use config::{EngineConfig, FragmentConfig, SessionConfig, StreamConfig};
pub use conntrack::{SessionHandle, SessionKey, SessionTable, SessionTracker};
pub use crate::core::decoder::{Decoder, DecoderRegistry};
pub use crate::core::dispatch::Dispatcher;
pub use crate::core::packet::{Packet, PacketPool, PacketSource};
pub use crate::core::stack::{PayloadView, ProcessStack};
pub use engine::{Engine, RunState};
pub use error::{CoreError, ProcessVerdict, Result};
pub use reassembly::{Direction, LineParser, Multipart, SegmentOutcome, Stream, StreamHandler};
pub use stats::{CoreStats, StatsSnapshot};
pub use timer::{TimerHandle, TimerQueue};
