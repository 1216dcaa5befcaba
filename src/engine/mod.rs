//! Engine facade
//!
//! Wires the registry, session table, timer queue, dispatcher and scheduler
//! together behind one handle. This is the surface embedders drive: register
//! decoders, start the pool, feed packets, stop.

pub mod scheduler;

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Sender};
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::conntrack::{SessionTable, SessionTracker};
use crate::core::decoder::{Decoder, DecoderRegistry};
use crate::core::dispatch::Dispatcher;
use crate::core::packet::{Packet, PacketPool, PacketSource};
use crate::error::Result;
use crate::stats::{CoreStats, StatsSnapshot};
use crate::timer::TimerQueue;
use crate::Timestamp;

pub use scheduler::{PauseGuard, RunState, Scheduler};

/// A queued packet plus its optional affinity key
pub type FeedItem = (Packet, Option<u64>);

/// The assembled packet engine
pub struct Engine {
    dispatcher: Arc<Dispatcher>,
    scheduler: Arc<Scheduler>,
}

impl Engine {
    /// Build an engine with its own session table
    pub fn new(config: EngineConfig) -> Self {
        let sessions = Arc::new(SessionTable::new(config.session.clone()));
        Self::with_sessions(config, sessions)
    }

    /// Build an engine around an external session tracker
    pub fn with_sessions(config: EngineConfig, sessions: Arc<dyn SessionTracker>) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(
            config,
            Arc::new(DecoderRegistry::new()),
            sessions,
            TimerQueue::shared(),
            CoreStats::shared(),
        ));
        let scheduler = Scheduler::new(dispatcher.clone());
        Self {
            dispatcher,
            scheduler,
        }
    }

    /// Spawn the worker pool
    pub fn start(&self) -> anyhow::Result<()> {
        self.scheduler.start()?;
        info!(decoders = self.dispatcher.registry().len(), "engine started");
        Ok(())
    }

    /// Drain the queue, flush sessions and join the workers
    pub fn stop(&self) {
        self.scheduler.stop();
    }

    /// Queue one packet; blocks while the queue is full. Packets sharing an
    /// affinity key keep their relative order.
    pub fn queue_packet(&self, pkt: Packet, affinity: Option<u64>) -> Result<()> {
        self.scheduler.enqueue(pkt, affinity)
    }

    /// Bounded hand-off channel for capture threads.
    ///
    /// A bridge thread drains the channel into the scheduler until every
    /// sender is dropped or the engine stops accepting packets.
    pub fn feeder(&self, capacity: usize) -> (Sender<FeedItem>, JoinHandle<()>) {
        let (tx, rx) = bounded::<FeedItem>(capacity);
        let scheduler = self.scheduler.clone();
        let handle = std::thread::spawn(move || {
            for (pkt, affinity) in rx {
                if let Err(e) = scheduler.enqueue(pkt, affinity) {
                    warn!(%e, "feed stopped");
                    break;
                }
            }
        });
        (tx, handle)
    }

    pub fn register_decoder(&self, decoder: Arc<dyn Decoder>) -> Result<()> {
        self.dispatcher.registry().register(decoder)
    }

    /// Remove a decoder with the workers paused, so no walk can reference it
    /// mid-removal
    pub fn unregister_decoder(&self, name: &str) -> Option<Arc<dyn Decoder>> {
        let _pause = self.scheduler.pause();
        self.dispatcher.registry().unregister(name)
    }

    /// Block all workers between packets until the guard drops
    pub fn pause(&self) -> PauseGuard<'_> {
        self.scheduler.pause()
    }

    /// Packet factory bound to this engine's buffer pool
    pub fn source(&self, name: &str) -> PacketSource {
        PacketSource::new(name, self.pool().clone())
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn pool(&self) -> &PacketPool {
        self.dispatcher.pool()
    }

    pub fn state(&self) -> RunState {
        self.scheduler.state()
    }

    pub fn halt_reason(&self) -> Option<String> {
        self.scheduler.halt_reason()
    }

    /// Logical clock the timer queue runs against
    pub fn clock(&self) -> Option<Timestamp> {
        self.scheduler.watermark()
    }

    /// Wall-clock time since the last start
    pub fn uptime(&self) -> Option<chrono::Duration> {
        self.scheduler.uptime()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.dispatcher.stats().snapshot()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}
