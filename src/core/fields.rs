//! Decoded per-packet fields
//!
//! Decoders declare the fields they extract per packet; the values live in
//! pooled `PacketInfo` containers so a busy engine does not allocate one per
//! packet per layer. The typed-value storage itself is deliberately minimal:
//! the core only moves these containers around, it never interprets them.

use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

/// Opaque typed value a decoder writes into its field container
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Empty,
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    Bytes(Vec<u8>),
    Str(String),
    Ip(IpAddr),
}

impl Default for FieldValue {
    fn default() -> Self {
        FieldValue::Empty
    }
}

/// Description of one per-packet field a decoder declares
#[derive(Debug, Clone, Copy)]
pub struct FieldDescriptor {
    pub name: &'static str,
    pub description: &'static str,
}

/// Pool-allocated container for one decoder layer's decoded fields
#[derive(Debug, Default)]
pub struct PacketInfo {
    fields: Vec<FieldValue>,
}

impl PacketInfo {
    fn with_field_count(count: usize) -> Self {
        Self {
            fields: vec![FieldValue::Empty; count],
        }
    }

    /// Set a field by its declared index
    pub fn set(&mut self, index: usize, value: FieldValue) {
        if let Some(slot) = self.fields.get_mut(index) {
            *slot = value;
        }
    }

    /// Get a field by its declared index
    pub fn get(&self, index: usize) -> &FieldValue {
        self.fields.get(index).unwrap_or(&FieldValue::Empty)
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    fn reset(&mut self) {
        for f in &mut self.fields {
            *f = FieldValue::Empty;
        }
    }
}

/// Per-decoder free-list cache of field containers
///
/// The usage counter tracks outstanding containers; it must return to zero
/// when no stack slot references this decoder anymore.
#[derive(Debug)]
pub struct InfoPool {
    field_count: usize,
    free: Mutex<Vec<PacketInfo>>,
    usage: AtomicUsize,
    high_water: AtomicUsize,
}

impl InfoPool {
    pub fn new(field_count: usize) -> Self {
        Self {
            field_count,
            free: Mutex::new(Vec::new()),
            usage: AtomicUsize::new(0),
            high_water: AtomicUsize::new(0),
        }
    }

    /// Take a container from the free list, or allocate on a miss
    pub fn get(&self) -> PacketInfo {
        let info = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| PacketInfo::with_field_count(self.field_count));
        let usage = self.usage.fetch_add(1, Ordering::Relaxed) + 1;
        self.high_water.fetch_max(usage, Ordering::Relaxed);
        info
    }

    /// Return a container to the free list
    pub fn release(&self, mut info: PacketInfo) {
        info.reset();
        self.usage.fetch_sub(1, Ordering::Relaxed);
        self.free.lock().push(info);
    }

    /// Containers currently handed out
    pub fn usage(&self) -> usize {
        self.usage.load(Ordering::Relaxed)
    }

    /// Most containers ever handed out at once
    pub fn high_water(&self) -> usize {
        self.high_water.load(Ordering::Relaxed)
    }
}
