//! Protocol process stack
//!
//! A fixed-capacity sequence of slots, one per decoder layer. Payload views
//! are `(offset, len)` ranges into the packet buffer rather than raw
//! pointers, so replacing the buffer at a reassembly boundary re-bases every
//! saved view by construction; `rebase` still validates each view against
//! the new buffer and detaches cached field containers, which belong to the
//! old packet instance.

use std::sync::Arc;

use crate::conntrack::SessionHandle;
use crate::core::decoder::{Decoder, DecoderRegistry};
use crate::core::fields::PacketInfo;
use crate::core::packet::Packet;
use crate::error::{CoreError, Result};

/// A byte range into a packet's buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadView {
    pub offset: usize,
    pub len: usize,
}

impl PayloadView {
    pub fn new(offset: usize, len: usize) -> Self {
        Self { offset, len }
    }

    /// The full buffer of a packet
    pub fn whole(pkt: &Packet) -> Self {
        Self {
            offset: 0,
            len: pkt.len(),
        }
    }

    /// Bounds-checked slice into the packet's buffer
    pub fn slice<'a>(&self, pkt: &'a Packet) -> Result<&'a [u8]> {
        let data = pkt.data();
        if self.offset + self.len > data.len() {
            return Err(CoreError::ViewOutOfBounds {
                offset: self.offset,
                len: self.len,
                buffer_len: data.len(),
            });
        }
        Ok(&data[self.offset..self.offset + self.len])
    }

    /// A sub-range of this view, relative to its start
    pub fn narrow(&self, offset: usize, len: usize) -> Result<PayloadView> {
        if offset + len > self.len {
            return Err(CoreError::ViewOutOfBounds {
                offset,
                len,
                buffer_len: self.len,
            });
        }
        Ok(PayloadView {
            offset: self.offset + offset,
            len,
        })
    }
}

/// One decoder layer's slot
#[derive(Default)]
pub struct StackSlot {
    pub decoder: Option<Arc<dyn Decoder>>,
    pub pload: Option<PayloadView>,
    pub pkt_info: Option<PacketInfo>,
    session: Option<SessionHandle>,
    committed: bool,
}

impl StackSlot {
    /// Store the session handle this layer acquired. The handle is released
    /// exactly once during unwind.
    pub fn set_session(&mut self, session: SessionHandle) {
        debug_assert!(self.session.is_none(), "slot already owns a session");
        self.session = Some(session);
    }

    pub fn session(&self) -> Option<&SessionHandle> {
        self.session.as_ref()
    }

    pub fn take_session(&mut self) -> Option<SessionHandle> {
        self.session.take()
    }

    pub fn committed(&self) -> bool {
        self.committed
    }

    pub(crate) fn set_committed(&mut self, committed: bool) {
        self.committed = committed;
    }

    fn clear(&mut self) {
        self.decoder = None;
        self.pload = None;
        self.pkt_info = None;
        self.session = None;
        self.committed = false;
    }
}

/// Fixed-capacity ordered sequence of decoder slots
pub struct ProcessStack {
    slots: Vec<StackSlot>,
}

impl ProcessStack {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, StackSlot::default);
        Self { slots }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, index: usize) -> &StackSlot {
        &self.slots[index]
    }

    pub fn slot_mut(&mut self, index: usize) -> &mut StackSlot {
        &mut self.slots[index]
    }

    /// Assign the decoder and payload view a walk continues into. Fails when
    /// the stack has no slot left at `index`.
    pub fn seed(
        &mut self,
        index: usize,
        decoder: Arc<dyn Decoder>,
        pload: PayloadView,
    ) -> Result<()> {
        let depth = self.slots.len();
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(CoreError::StackExhausted(depth))?;
        slot.decoder = Some(decoder);
        slot.pload = Some(pload);
        Ok(())
    }

    /// Reset every slot from `from` to the end, returning cached field
    /// containers to their decoders' pools
    pub fn clear_from(&mut self, from: usize, registry: &DecoderRegistry) {
        for slot in &mut self.slots[from..] {
            if let (Some(decoder), Some(info)) = (&slot.decoder, slot.pkt_info.take()) {
                if let Some(pool) = registry.info_pool(decoder.name()) {
                    pool.release(info);
                }
            }
            slot.clear();
        }
    }

    /// Re-base every saved payload view onto a replacement packet buffer.
    ///
    /// Views keep the byte offsets they held into the old buffer; each is
    /// validated against the new buffer's length, never recomputed. Cached
    /// field containers are detached since they belong to the old instance.
    pub fn rebase(&mut self, registry: &DecoderRegistry, new_pkt: &Packet) -> Result<()> {
        for slot in &self.slots {
            if let Some(view) = slot.pload {
                if view.offset + view.len > new_pkt.len() {
                    return Err(CoreError::ViewOutOfBounds {
                        offset: view.offset,
                        len: view.len,
                        buffer_len: new_pkt.len(),
                    });
                }
            }
        }
        for slot in &mut self.slots {
            if let (Some(decoder), Some(info)) = (&slot.decoder, slot.pkt_info.take()) {
                if let Some(pool) = registry.info_pool(decoder.name()) {
                    pool.release(info);
                }
            }
        }
        Ok(())
    }
}
