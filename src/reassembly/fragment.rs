//! Multipart fragment reassembly
//!
//! Collects fragments of one logical packet at arbitrary arrival order,
//! tracks coverage holes, and once complete synthesizes a packet from a
//! pooled buffer and re-injects it through the dispatcher at the layer above
//! the fragmenting one. The owning decoder keeps the chain in its session
//! state and arms a logical-time timer; a fired timer abandons the chain.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::core::decoder::Decoder;
use crate::core::dispatch::Dispatcher;
use crate::core::packet::Packet;
use crate::core::stack::PayloadView;
use crate::error::{CoreError, Result};
use crate::stats::CoreStats;

/// One stored fragment piece, non-overlapping with its neighbors
struct Fragment {
    /// Offset into the reassembled payload
    offset: usize,
    len: usize,
    /// Offset into the fragment packet's buffer
    data_offset: usize,
    pkt: Packet,
}

/// A logical packet under reassembly
pub struct Multipart {
    target: Arc<dyn Decoder>,
    /// Headroom reserved in front of the reassembled payload
    align_offset: usize,
    /// Sorted by offset, pairwise disjoint
    frags: Vec<Fragment>,
    /// Fragment arrivals that contributed at least one byte
    accepted: usize,
    got_last: bool,
    expected_len: usize,
}

impl Multipart {
    pub fn new(target: Arc<dyn Decoder>, align_offset: usize) -> Self {
        Self {
            target,
            align_offset,
            frags: Vec::new(),
            accepted: 0,
            got_last: false,
            expected_len: 0,
        }
    }

    /// Add one fragment covering `[offset, offset + view.len)` of the
    /// reassembled payload. Returns false when the range was already fully
    /// covered. The fragment packet's buffer is shared, not copied.
    pub fn add_fragment(
        &mut self,
        stats: &CoreStats,
        pkt: &Packet,
        view: PayloadView,
        offset: usize,
        last: bool,
    ) -> Result<bool> {
        view.slice(pkt)?;
        CoreStats::inc(&stats.fragments_received, 1);

        if last {
            self.got_last = true;
            self.expected_len = offset + view.len;
        }

        // Carve the incoming range into the holes it actually fills
        let end = offset + view.len;
        let mut cursor = offset;
        let mut pieces = Vec::new();
        for frag in &self.frags {
            if frag.offset >= end {
                break;
            }
            let frag_end = frag.offset + frag.len;
            if frag_end <= cursor {
                continue;
            }
            if frag.offset > cursor {
                pieces.push((cursor, frag.offset));
            }
            cursor = cursor.max(frag_end);
        }
        if cursor < end {
            pieces.push((cursor, end));
        }

        if pieces.is_empty() {
            trace!(packet = pkt.id(), offset, len = view.len, "duplicate fragment");
            CoreStats::inc(&stats.fragments_dropped, 1);
            return Ok(false);
        }

        for (start, stop) in pieces {
            self.frags.push(Fragment {
                offset: start,
                len: stop - start,
                data_offset: view.offset + (start - offset),
                pkt: pkt.clone_shared(),
            });
        }
        self.frags.sort_by_key(|f| f.offset);
        self.accepted += 1;
        Ok(true)
    }

    /// Coverage holes below the highest byte seen (plus one for a missing
    /// head)
    pub fn gaps(&self) -> usize {
        let mut gaps = 0;
        let mut cursor = 0;
        for frag in &self.frags {
            if frag.offset > cursor {
                gaps += 1;
            }
            cursor = frag.offset + frag.len;
        }
        gaps
    }

    pub fn fragment_count(&self) -> usize {
        self.accepted
    }

    pub fn is_complete(&self) -> bool {
        if !self.got_last || self.gaps() > 0 {
            return false;
        }
        self.frags.last().map(|f| f.offset + f.len) == Some(self.expected_len)
    }

    /// Synthesize the reassembled packet and run it through the stack,
    /// resuming at `resume_index` with the chain's target decoder.
    ///
    /// The synthesized packet carries the newest fragment's id and timestamp
    /// so downstream ordering follows last-fragment arrival.
    pub fn process(&mut self, dispatcher: &Dispatcher, resume_index: usize) -> Result<Packet> {
        if !self.is_complete() {
            return Err(CoreError::Decoder {
                decoder: self.target.name(),
                reason: format!("reassembly incomplete, {} gap(s)", self.gaps()),
            });
        }

        let mut buffer = dispatcher.pool().acquire(self.expected_len, self.align_offset);
        for frag in &self.frags {
            let src = &frag.pkt.data()[frag.data_offset..frag.data_offset + frag.len];
            buffer.bytes_mut()[frag.offset..frag.offset + frag.len].copy_from_slice(src);
        }

        let newest = self
            .frags
            .iter()
            .max_by_key(|f| f.pkt.ts())
            .ok_or(CoreError::Decoder {
                decoder: self.target.name(),
                reason: "empty fragment chain".into(),
            })?;
        let pkt = dispatcher.pool().packet_from_buffer(
            newest.pkt.id(),
            newest.pkt.ts(),
            self.target.clone(),
            newest.pkt.input(),
            buffer,
            true,
        );

        debug!(
            packet = pkt.id(),
            len = pkt.len(),
            fragments = self.accepted,
            "packet reassembled"
        );
        CoreStats::inc(&dispatcher.stats().reassembled_packets, 1);

        // Fragment buffers go back to the pool here
        self.reset();

        let mut stack = dispatcher.new_stack();
        stack.seed(resume_index, self.target.clone(), PayloadView::whole(&pkt))?;
        dispatcher.dispatch(&pkt, &mut stack, resume_index)?;
        Ok(pkt)
    }

    /// Drop an expired or dead chain, counting its fragments as lost.
    /// Takes bare stats so a timer callback can abandon without a dispatcher.
    pub fn abandon(&mut self, stats: &CoreStats) {
        if self.accepted > 0 {
            debug!(fragments = self.accepted, "fragment chain abandoned");
            CoreStats::inc(&stats.fragments_dropped, self.accepted as u64);
        }
        self.reset();
    }

    fn reset(&mut self) {
        self.frags.clear();
        self.accepted = 0;
        self.got_last = false;
        self.expected_len = 0;
    }
}
