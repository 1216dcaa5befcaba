//! Ordered stream reassembly
//!
//! Re-orders segments of a bidirectional byte stream and delivers payloads
//! to the registered handler in sequence order, per direction. Sequence
//! arithmetic wraps at 2^32; out-of-order segments are buffered under a hard
//! byte cap, duplicates are trimmed or dropped, and idle streams are evicted
//! by a logical-time timer.
//!
//! The handler runs under the stream lock, so deliveries for one stream are
//! serialized even when segments arrive on different workers. A handler must
//! not call back into its own stream.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::StreamConfig;
use crate::core::dispatch::Dispatcher;
use crate::core::packet::Packet;
use crate::core::stack::{PayloadView, ProcessStack};
use crate::error::{CoreError, Result};
use crate::stats::CoreStats;
use crate::timer::{TimerHandle, TimerQueue};

/// Direction of a segment relative to the session originator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToServer = 0,
    ToClient = 1,
}

impl Direction {
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn flip(self) -> Direction {
        match self {
            Direction::ToServer => Direction::ToClient,
            Direction::ToClient => Direction::ToServer,
        }
    }
}

/// What happened to a processed segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentOutcome {
    /// Handed to the handler, possibly after a front trim
    Delivered,
    /// Out of order, held for a later gap close
    Buffered,
    /// Entirely behind the delivery point, dropped
    Duplicate,
    /// Would exceed the buffer cap, dropped
    Rejected,
}

/// Receives in-order payloads from a stream.
///
/// On the synchronous path `stack`/`index` are the caller's live process
/// stack; on a gap-close flush they are a fresh stack and the stack index
/// the segment was originally seen at, and the handler seeds whatever
/// continuation it needs.
pub trait StreamHandler: Send {
    fn deliver(
        &mut self,
        dispatcher: &Dispatcher,
        pkt: &Packet,
        view: PayloadView,
        dir: Direction,
        stack: &mut ProcessStack,
        index: usize,
    ) -> Result<()>;
}

// Wrap-safe sequence comparisons
fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

fn seq_le(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}

struct PendingSegment {
    pkt: Packet,
    view: PayloadView,
    stack_index: usize,
}

#[derive(Default)]
struct DirState {
    started: bool,
    /// Sequence number of the first byte ever seen; pending keys are wrapped
    /// distances from it, which keeps map order correct across a seq wrap
    base: u32,
    /// Next sequence number owed to the handler
    next_seq: u32,
    /// Highest ack seen from this direction (acknowledges the other side)
    last_ack: u32,
    pending: BTreeMap<u32, PendingSegment>,
}

impl DirState {
    fn first_pending_seq(&self) -> Option<u32> {
        self.pending
            .keys()
            .next()
            .map(|&dist| self.base.wrapping_add(dist))
    }
}

struct StreamInner {
    dirs: [DirState; 2],
    buffered_bytes: usize,
    handler: Box<dyn StreamHandler>,
    idle_timer: Option<TimerHandle>,
}

/// One bidirectional reassembled stream
pub struct Stream {
    inner: Mutex<StreamInner>,
    max_buffered: usize,
    idle_timeout: chrono::Duration,
    stats: Arc<CoreStats>,
}

impl Stream {
    pub fn new(
        config: &StreamConfig,
        stats: Arc<CoreStats>,
        handler: Box<dyn StreamHandler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(StreamInner {
                dirs: [DirState::default(), DirState::default()],
                buffered_bytes: 0,
                handler,
                idle_timer: None,
            }),
            max_buffered: config.max_buffered_bytes,
            idle_timeout: chrono::Duration::seconds(config.idle_timeout_secs as i64),
            stats,
        })
    }

    /// Bytes currently held for out-of-order segments, both directions
    pub fn buffered_bytes(&self) -> usize {
        self.inner.lock().buffered_bytes
    }

    /// Process one segment whose payload is the view at `stack[index]`.
    ///
    /// In-order payloads reach the handler before this returns; an arrival
    /// that closes a gap also flushes every buffered segment it unblocked.
    #[allow(clippy::too_many_arguments)]
    pub fn process_segment(
        self: &Arc<Self>,
        dispatcher: &Dispatcher,
        pkt: &Packet,
        stack: &mut ProcessStack,
        index: usize,
        dir: Direction,
        seq: u32,
        ack: u32,
    ) -> Result<SegmentOutcome> {
        let mut view = stack.slot(index).pload.ok_or(CoreError::Session(
            "segment slot has no payload".into(),
        ))?;
        view.slice(pkt)?;

        let mut inner = self.inner.lock();
        self.touch_idle_timer(&mut inner, dispatcher.timers(), pkt.ts());

        inner.dirs[dir.index()].last_ack = ack;
        // An ack proves the peer holds bytes we may never see; give up on
        // dead gaps in the acknowledged direction.
        self.skip_acked_gap(&mut inner, dispatcher, pkt, dir.flip(), ack)?;

        let state = &mut inner.dirs[dir.index()];
        if !state.started {
            state.started = true;
            state.base = seq;
            state.next_seq = seq;
        }

        let mut seq = seq;
        let end = seq.wrapping_add(view.len as u32);
        // A pure ack carries no bytes; its ack side effects already ran above
        if view.len == 0 || seq_le(end, state.next_seq) {
            trace!(packet = pkt.id(), seq, len = view.len, "segment carries no new bytes");
            CoreStats::inc(&self.stats.segments_duplicate, 1);
            return Ok(SegmentOutcome::Duplicate);
        }

        if seq_lt(seq, state.next_seq) {
            // Partial retransmit, trim the stale front
            let overlap = state.next_seq.wrapping_sub(seq) as usize;
            view = view.narrow(overlap, view.len - overlap)?;
            seq = state.next_seq;
        }

        if seq == state.next_seq {
            state.next_seq = seq.wrapping_add(view.len as u32);
            CoreStats::inc(&self.stats.segments_delivered, 1);
            inner.handler.deliver(dispatcher, pkt, view, dir, stack, index)?;
            self.flush_ready(&mut inner, dispatcher, dir)?;
            return Ok(SegmentOutcome::Delivered);
        }

        // Future segment, hold it for the gap close
        if inner.buffered_bytes + view.len > self.max_buffered {
            debug!(
                packet = pkt.id(),
                seq,
                len = view.len,
                buffered = inner.buffered_bytes,
                "segment rejected, buffer cap reached"
            );
            CoreStats::inc(&self.stats.segments_rejected, 1);
            return Ok(SegmentOutcome::Rejected);
        }

        let state = &mut inner.dirs[dir.index()];
        let dist = seq.wrapping_sub(state.base);
        if let Some(existing) = state.pending.get(&dist) {
            if existing.view.len >= view.len {
                CoreStats::inc(&self.stats.segments_duplicate, 1);
                return Ok(SegmentOutcome::Duplicate);
            }
        }
        let replaced = state
            .pending
            .insert(
                dist,
                PendingSegment {
                    pkt: pkt.clone_shared(),
                    view,
                    stack_index: index,
                },
            )
            .map(|old| old.view.len)
            .unwrap_or(0);
        inner.buffered_bytes += view.len - replaced;
        CoreStats::inc(&self.stats.segments_buffered, 1);
        Ok(SegmentOutcome::Buffered)
    }

    /// Deliver buffered segments the advancing delivery point has unblocked.
    /// Flushed segments get a fresh stack seeded by the handler.
    fn flush_ready(
        &self,
        inner: &mut StreamInner,
        dispatcher: &Dispatcher,
        dir: Direction,
    ) -> Result<()> {
        loop {
            let state = &mut inner.dirs[dir.index()];
            let Some((&dist, head)) = state.pending.iter().next() else {
                return Ok(());
            };
            let seq = state.base.wrapping_add(dist);
            let end = seq.wrapping_add(head.view.len as u32);

            if seq_le(end, state.next_seq) {
                // Became fully stale while it waited
                let seg = state.pending.remove(&dist).ok_or_else(pending_vanished)?;
                inner.buffered_bytes -= seg.view.len;
                CoreStats::inc(&self.stats.segments_duplicate, 1);
                continue;
            }
            if seq_lt(state.next_seq, seq) {
                // Gap still open
                return Ok(());
            }

            let seg = state.pending.remove(&dist).ok_or_else(pending_vanished)?;
            inner.buffered_bytes -= seg.view.len;

            let state = &mut inner.dirs[dir.index()];
            let overlap = state.next_seq.wrapping_sub(seq) as usize;
            let view = if overlap > 0 {
                seg.view.narrow(overlap, seg.view.len - overlap)?
            } else {
                seg.view
            };
            state.next_seq = state.next_seq.wrapping_add(view.len as u32);
            CoreStats::inc(&self.stats.segments_delivered, 1);

            let mut flush_stack = dispatcher.new_stack();
            inner.handler.deliver(
                dispatcher,
                &seg.pkt,
                view,
                dir,
                &mut flush_stack,
                seg.stack_index,
            )?;
        }
    }

    /// If the peer acknowledged bytes past an open gap on `dir`, those bytes
    /// will never arrive; advance the delivery point to the first buffered
    /// segment and flush from there.
    fn skip_acked_gap(
        &self,
        inner: &mut StreamInner,
        dispatcher: &Dispatcher,
        pkt: &Packet,
        dir: Direction,
        ack: u32,
    ) -> Result<()> {
        let state = &mut inner.dirs[dir.index()];
        if !state.started || !seq_lt(state.next_seq, ack) {
            return Ok(());
        }
        let Some(first_seq) = state.first_pending_seq() else {
            return Ok(());
        };
        if first_seq == state.next_seq || !seq_le(first_seq, ack) {
            return Ok(());
        }

        let lost = first_seq.wrapping_sub(state.next_seq);
        debug!(packet = pkt.id(), lost, "gap acknowledged by peer, advancing past lost bytes");
        CoreStats::inc(&self.stats.stream_bytes_discarded, lost as u64);
        state.next_seq = first_seq;
        self.flush_ready(inner, dispatcher, dir)
    }

    fn touch_idle_timer(
        self: &Arc<Self>,
        inner: &mut StreamInner,
        timers: &Arc<TimerQueue>,
        now: crate::Timestamp,
    ) {
        let deadline = now + self.idle_timeout;
        if let Some(handle) = inner.idle_timer {
            if timers.requeue(handle, deadline) {
                return;
            }
            // The timer already fired and was dropped; arm a fresh one
        }
        let weak: Weak<Stream> = Arc::downgrade(self);
        inner.idle_timer = Some(timers.schedule(deadline, move |_| {
            if let Some(stream) = weak.upgrade() {
                stream.evict();
            }
        }));
    }

    /// Discard all buffered data. Fired by the idle timer; also safe to call
    /// on teardown.
    pub fn evict(&self) {
        let mut inner = self.inner.lock();
        let discarded = inner.buffered_bytes;
        for state in &mut inner.dirs {
            state.pending.clear();
        }
        inner.buffered_bytes = 0;
        CoreStats::inc(&self.stats.streams_evicted, 1);
        CoreStats::inc(&self.stats.stream_bytes_discarded, discarded as u64);
        debug!(discarded, "idle stream evicted");
    }

    /// Cancel the idle timer; call before dropping the last reference
    pub fn shutdown(&self, timers: &TimerQueue) {
        if let Some(handle) = self.inner.lock().idle_timer.take() {
            timers.cancel(handle);
        }
    }
}

fn pending_vanished() -> CoreError {
    CoreError::Session("pending segment vanished".into())
}
