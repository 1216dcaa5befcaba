//! Decoder contract and registry
//!
//! A decoder occupies one protocol-stack slot and is driven through three
//! phases: `process` on the way down, `process_payload` when the layer below
//! it has a payload view to deliver, and `post_process` on the way back up.
//! The registry owns one field-container pool per decoder type, sized from
//! the decoder's declared descriptors.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::core::dispatch::Dispatcher;
use crate::core::fields::{FieldDescriptor, InfoPool};
use crate::core::packet::Packet;
use crate::core::stack::ProcessStack;
use crate::error::{CoreError, ProcessVerdict, Result};

/// A protocol decoder occupying one stack slot.
///
/// `process` classifies the slot's payload view and, on `Continue`, fills the
/// next slot's decoder and payload view. Returning `Stop` means the payload
/// was fully handed off (typically to a reassembler) and the walk must not
/// treat the next slot as this packet's synchronous continuation.
pub trait Decoder: Send + Sync {
    fn name(&self) -> &'static str;

    /// Per-packet fields this decoder declares; sizes its info pool
    fn fields(&self) -> &'static [FieldDescriptor] {
        &[]
    }

    fn process(
        &self,
        core: &Dispatcher,
        pkt: &Packet,
        stack: &mut ProcessStack,
        index: usize,
    ) -> Result<ProcessVerdict>;

    /// Deliver the payload view sitting at `index + 1` to listeners of this
    /// layer. Invoked once the view is known, and once more at the end of
    /// the forward walk to flush.
    fn process_payload(
        &self,
        _core: &Dispatcher,
        _pkt: &Packet,
        _stack: &mut ProcessStack,
        _index: usize,
    ) -> Result<()> {
        Ok(())
    }

    /// Best-effort completion phase, run during unwind for every committed
    /// layer while shallower layers' state is still valid and locked.
    fn post_process(
        &self,
        _core: &Dispatcher,
        _pkt: &Packet,
        _stack: &mut ProcessStack,
        _index: usize,
    ) -> Result<()> {
        Ok(())
    }

    /// Called when the decoder is unregistered
    fn cleanup(&self) {}
}

/// Registry entry: the decoder plus its field-container pool
#[derive(Clone)]
pub struct DecoderEntry {
    pub decoder: Arc<dyn Decoder>,
    pub info_pool: Arc<InfoPool>,
}

/// Decoder registry, keyed by decoder name
#[derive(Default)]
pub struct DecoderRegistry {
    entries: RwLock<HashMap<&'static str, DecoderEntry>>,
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a decoder and create its info pool
    pub fn register(&self, decoder: Arc<dyn Decoder>) -> Result<()> {
        let name = decoder.name();
        let mut entries = self.entries.write();
        if entries.contains_key(name) {
            return Err(CoreError::Decoder {
                decoder: name,
                reason: "already registered".into(),
            });
        }
        let info_pool = Arc::new(InfoPool::new(decoder.fields().len()));
        entries.insert(name, DecoderEntry { decoder, info_pool });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<DecoderEntry> {
        self.entries.read().get(name).cloned()
    }

    pub fn decoder(&self, name: &str) -> Option<Arc<dyn Decoder>> {
        self.get(name).map(|e| e.decoder)
    }

    pub fn info_pool(&self, name: &str) -> Option<Arc<InfoPool>> {
        self.get(name).map(|e| e.info_pool)
    }

    /// Remove a decoder.
    ///
    /// The caller must hold the scheduler's pause barrier: no walk may be in
    /// flight while a decoder disappears. `Engine::unregister_decoder` wraps
    /// this with the barrier held.
    pub fn unregister(&self, name: &str) -> Option<Arc<dyn Decoder>> {
        let removed = self.entries.write().remove(name);
        if let Some(entry) = &removed {
            entry.decoder.cleanup();
        }
        removed.map(|e| e.decoder)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
