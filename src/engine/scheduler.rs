//! Multi-threaded packet scheduler
//!
//! A bounded queue feeding a pool of worker threads. Producers block when
//! the queue is full; packets with an affinity key go to one worker's
//! private queue so their relative order survives parallel processing.
//! Workers hold a shared read lock on the pause barrier for the duration of
//! each stack walk, advance their slot of the logical clock, and drive the
//! timer queue off the resulting watermark. A dispatch error halts the whole
//! engine rather than silently dropping the packet.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex, RwLock, RwLockWriteGuard};
use tracing::{debug, error, info};

use crate::core::dispatch::Dispatcher;
use crate::core::packet::Packet;
use crate::error::{CoreError, Result};
use crate::stats::CoreStats;
use crate::Timestamp;

/// Engine run state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// No workers running
    Idle,
    /// Accepting and processing packets
    Running,
    /// Queue draining, no new packets accepted
    Finishing,
}

struct QueueState {
    shared: VecDeque<Packet>,
    /// One private queue per worker for affinity-pinned packets
    private: Vec<VecDeque<Packet>>,
    /// Packets queued across all queues
    usage: usize,
    /// Workers currently inside a stack walk
    active: usize,
    state: RunState,
    accepting: bool,
    halt: Option<String>,
}

/// Holding this blocks every worker between packets; decoders can be
/// registered or removed safely while it lives
pub struct PauseGuard<'a> {
    _guard: RwLockWriteGuard<'a, ()>,
}

pub struct Scheduler {
    dispatcher: Arc<Dispatcher>,
    capacity: usize,
    num_workers: usize,
    queue: Mutex<QueueState>,
    /// Signals packet arrival, drain progress and state changes
    queue_cond: Condvar,
    /// Signals freed queue space to blocked producers
    space_cond: Condvar,
    barrier: RwLock<()>,
    /// Per-worker timestamp of the packet last picked up
    clocks: Mutex<Vec<Option<Timestamp>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Wall-clock start time, for uptime reporting
    started_at: Mutex<Option<Timestamp>>,
}

impl Scheduler {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Arc<Self> {
        let num_workers = dispatcher.config().actual_workers();
        let capacity = dispatcher.config().queue_capacity;
        Arc::new(Self {
            dispatcher,
            capacity,
            num_workers,
            queue: Mutex::new(QueueState {
                shared: VecDeque::new(),
                private: (0..num_workers).map(|_| VecDeque::new()).collect(),
                usage: 0,
                active: 0,
                state: RunState::Idle,
                accepting: false,
                halt: None,
            }),
            queue_cond: Condvar::new(),
            space_cond: Condvar::new(),
            barrier: RwLock::new(()),
            clocks: Mutex::new(vec![None; num_workers]),
            workers: Mutex::new(Vec::new()),
            started_at: Mutex::new(None),
        })
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    pub fn state(&self) -> RunState {
        self.queue.lock().state
    }

    /// Reason the engine halted, if it did
    pub fn halt_reason(&self) -> Option<String> {
        self.queue.lock().halt.clone()
    }

    /// Spawn the worker pool
    pub fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut q = self.queue.lock();
            if q.state != RunState::Idle {
                return Err(CoreError::State("scheduler already started"));
            }
            q.state = RunState::Running;
            q.accepting = true;
            q.halt = None;
        }
        *self.clocks.lock() = vec![None; self.num_workers];
        *self.started_at.lock() = Some(chrono::Utc::now());

        let mut workers = self.workers.lock();
        for idx in 0..self.num_workers {
            let scheduler = self.clone();
            let handle = std::thread::Builder::new()
                .name(format!("flowtap-worker-{idx}"))
                .spawn(move || scheduler.worker_run(idx))?;
            workers.push(handle);
        }
        info!(workers = self.num_workers, capacity = self.capacity, "scheduler started");
        Ok(())
    }

    /// Queue one packet, blocking while the queue is full.
    ///
    /// With an affinity key, all packets sharing that key land on the same
    /// worker and keep their arrival order.
    pub fn enqueue(&self, pkt: Packet, affinity: Option<u64>) -> Result<()> {
        let mut q = self.queue.lock();
        loop {
            if let Some(reason) = &q.halt {
                return Err(CoreError::Halted(reason.clone()));
            }
            if !q.accepting {
                return Err(CoreError::ShuttingDown);
            }
            if q.usage < self.capacity {
                break;
            }
            self.space_cond.wait(&mut q);
        }

        match affinity {
            Some(key) => {
                let idx = (key % self.num_workers as u64) as usize;
                q.private[idx].push_back(pkt);
            }
            None => q.shared.push_back(pkt),
        }
        q.usage += 1;
        CoreStats::inc(&self.dispatcher.stats().packets_queued, 1);
        // Affinity targets one specific worker, so every sleeper must look
        self.queue_cond.notify_all();
        Ok(())
    }

    /// Stop accepting packets, drain the queue, and join the workers
    pub fn stop(&self) {
        {
            let mut q = self.queue.lock();
            if q.state == RunState::Idle && q.halt.is_none() {
                return;
            }
            if q.state == RunState::Running {
                q.state = RunState::Finishing;
                q.accepting = false;
                debug!("scheduler finishing, draining queue");
            }
            self.queue_cond.notify_all();
            self.space_cond.notify_all();

            while q.state != RunState::Idle && q.halt.is_none() {
                self.queue_cond.wait(&mut q);
            }
            q.state = RunState::Idle;
        }

        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in workers {
            let _ = handle.join();
        }
        info!("scheduler stopped");
    }

    /// Block all workers between packets. Dropping the guard resumes them.
    pub fn pause(&self) -> PauseGuard<'_> {
        PauseGuard {
            _guard: self.barrier.write(),
        }
    }

    /// Oldest packet timestamp any worker is at; timers may fire up to here
    pub fn watermark(&self) -> Option<Timestamp> {
        self.clocks.lock().iter().flatten().min().copied()
    }

    /// Wall-clock time since the last start
    pub fn uptime(&self) -> Option<chrono::Duration> {
        self.started_at.lock().map(|t| chrono::Utc::now() - t)
    }

    fn worker_run(self: Arc<Self>, idx: usize) {
        debug!(worker = idx, "worker up");
        loop {
            let pkt = {
                let mut q = self.queue.lock();
                loop {
                    if q.halt.is_some() {
                        return;
                    }
                    let popped = match q.private[idx].pop_front() {
                        Some(pkt) => Some(pkt),
                        None => q.shared.pop_front(),
                    };
                    if let Some(pkt) = popped {
                        q.usage -= 1;
                        q.active += 1;
                        break pkt;
                    }
                    match q.state {
                        RunState::Idle => return,
                        RunState::Finishing if q.usage == 0 && q.active == 0 => {
                            // Last one out: every queue drained, nothing in
                            // flight. usage covers other workers' private
                            // queues, which this worker never pops.
                            q.state = RunState::Idle;
                            self.queue_cond.notify_all();
                            drop(q);
                            let flushed = self.dispatcher.sessions().flush_all();
                            debug!(worker = idx, flushed, "drain complete");
                            return;
                        }
                        _ => self.queue_cond.wait(&mut q),
                    }
                }
            };
            self.space_cond.notify_one();

            let res = {
                let _processing = self.barrier.read();
                self.clocks.lock()[idx] = Some(pkt.ts());
                let res = self.dispatcher.process_packet(&pkt);
                if res.is_ok() {
                    if let Some(watermark) = self.watermark() {
                        self.dispatcher.timers().run_expired(watermark);
                    }
                }
                res
            };
            drop(pkt);

            let mut q = self.queue.lock();
            q.active -= 1;
            match res {
                Ok(()) => {
                    if q.usage == 0 && q.active == 0 {
                        // Wake anyone waiting for the drain
                        self.queue_cond.notify_all();
                    }
                }
                Err(e) => {
                    error!(worker = idx, %e, "dispatch failed, halting engine");
                    q.halt = Some(e.to_string());
                    q.accepting = false;
                    self.queue_cond.notify_all();
                    self.space_cond.notify_all();
                    return;
                }
            }
        }
    }
}
