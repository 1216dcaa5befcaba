//! Pooled packet buffers and the packet handle
//!
//! Buffers are recycled through fixed size classes so steady-state traffic
//! does not hit the allocator. A `Packet` is an immutable-after-creation
//! handle; cloning it without a copy shares the buffer and bumps the
//! reference count, and the buffer returns to the pool exactly once when the
//! last handle is dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;

use crate::core::decoder::Decoder;
use crate::Timestamp;

/// Smallest allocation class handed out by the pool
const MIN_CLASS: usize = 64;

fn class_for(size: usize) -> usize {
    size.next_power_of_two().max(MIN_CLASS)
}

#[derive(Debug, Default)]
struct PoolCounters {
    acquired: AtomicU64,
    recycled: AtomicU64,
    returned: AtomicU64,
    grown: AtomicU64,
}

struct PoolShared {
    classes: Mutex<HashMap<usize, Vec<Vec<u8>>>>,
    counters: PoolCounters,
}

/// Recycling buffer pool, keyed by power-of-two allocation class
#[derive(Clone)]
pub struct PacketPool {
    shared: Arc<PoolShared>,
}

impl Default for PacketPool {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketPool {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(PoolShared {
                classes: Mutex::new(HashMap::new()),
                counters: PoolCounters::default(),
            }),
        }
    }

    /// Get a buffer of at least `size` usable bytes, with `headroom` bytes
    /// reserved before the payload start. A pool miss grows the pool, it
    /// never blocks.
    pub fn acquire(&self, size: usize, headroom: usize) -> PooledBuffer {
        let class = class_for(size + headroom);
        let counters = &self.shared.counters;
        counters.acquired.fetch_add(1, Ordering::Relaxed);

        let data = self.shared.classes.lock().get_mut(&class).and_then(Vec::pop);
        let data = match data {
            Some(buf) => {
                counters.recycled.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => {
                counters.grown.fetch_add(1, Ordering::Relaxed);
                vec![0u8; class]
            }
        };

        PooledBuffer {
            data,
            head: headroom,
            len: size,
            class,
            pool: Arc::downgrade(&self.shared),
        }
    }

    /// Build a packet by copying `bytes` into a fresh pooled buffer
    pub fn packet_from_slice(
        &self,
        id: u64,
        ts: Timestamp,
        datalink: Arc<dyn Decoder>,
        input: Option<Arc<str>>,
        bytes: &[u8],
    ) -> Packet {
        let mut buffer = self.acquire(bytes.len(), 0);
        buffer.bytes_mut().copy_from_slice(bytes);
        self.packet_from_buffer(id, ts, datalink, input, buffer, false)
    }

    /// Freeze a filled buffer into an immutable packet
    pub fn packet_from_buffer(
        &self,
        id: u64,
        ts: Timestamp,
        datalink: Arc<dyn Decoder>,
        input: Option<Arc<str>>,
        buffer: PooledBuffer,
        from_reassembly: bool,
    ) -> Packet {
        Packet {
            inner: Arc::new(PacketInner {
                id,
                ts,
                datalink,
                input,
                buffer,
                from_reassembly,
            }),
        }
    }

    /// Clone a packet.
    ///
    /// With `force_no_copy` the clone shares the source buffer (reference
    /// count only). Otherwise the bytes are copied into a fresh pooled
    /// buffer; a copy is mandatory whenever the source buffer's identity
    /// must later change underneath saved payload views.
    pub fn clone_packet(&self, src: &Packet, force_no_copy: bool) -> Packet {
        if force_no_copy {
            return src.clone_shared();
        }
        let mut buffer = self.acquire(src.len(), src.inner.buffer.head);
        buffer.bytes_mut().copy_from_slice(src.data());
        self.packet_from_buffer(
            src.id(),
            src.ts(),
            src.datalink(),
            src.input(),
            buffer,
            src.is_reassembled(),
        )
    }

    /// Point-in-time pool counters
    pub fn stats(&self) -> PoolStats {
        let c = &self.shared.counters;
        PoolStats {
            acquired: c.acquired.load(Ordering::Relaxed),
            recycled: c.recycled.load(Ordering::Relaxed),
            returned: c.returned.load(Ordering::Relaxed),
            grown: c.grown.load(Ordering::Relaxed),
        }
    }
}

/// Pool counter snapshot
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    /// Buffers handed out
    pub acquired: u64,
    /// Acquisitions served from a free list
    pub recycled: u64,
    /// Buffers returned to a free list
    pub returned: u64,
    /// Acquisitions that had to allocate
    pub grown: u64,
}

/// A buffer slot owned by the pool, returned to it on drop
pub struct PooledBuffer {
    data: Vec<u8>,
    head: usize,
    len: usize,
    class: usize,
    pool: Weak<PoolShared>,
}

impl PooledBuffer {
    /// Usable payload bytes (headroom excluded)
    pub fn bytes(&self) -> &[u8] {
        &self.data[self.head..self.head + self.len]
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.head..self.head + self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Stable identity of the underlying slab, used to detect buffer
    /// replacement across a reassembly boundary
    pub fn slab_id(&self) -> usize {
        self.data.as_ptr() as usize
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            let data = std::mem::take(&mut self.data);
            pool.classes.lock().entry(self.class).or_default().push(data);
            pool.counters.returned.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.len)
            .field("head", &self.head)
            .field("class", &self.class)
            .finish()
    }
}

struct PacketInner {
    id: u64,
    ts: Timestamp,
    datalink: Arc<dyn Decoder>,
    input: Option<Arc<str>>,
    buffer: PooledBuffer,
    from_reassembly: bool,
}

/// Immutable packet handle
///
/// The buffer stays valid for as long as any handle is alive; the reference
/// count is the number of live handles.
#[derive(Clone)]
pub struct Packet {
    inner: Arc<PacketInner>,
}

impl Packet {
    /// Monotonic per-input sequence id
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn ts(&self) -> Timestamp {
        self.inner.ts
    }

    /// Initial decoder (data-link type) for this packet
    pub fn datalink(&self) -> Arc<dyn Decoder> {
        self.inner.datalink.clone()
    }

    /// Input this packet originally came from
    pub fn input(&self) -> Option<Arc<str>> {
        self.inner.input.clone()
    }

    pub fn data(&self) -> &[u8] {
        self.inner.buffer.bytes()
    }

    pub fn len(&self) -> usize {
        self.inner.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.buffer.is_empty()
    }

    /// Whether this packet was synthesized by reassembly
    pub fn is_reassembled(&self) -> bool {
        self.inner.from_reassembly
    }

    /// Identity of the underlying buffer slab
    pub fn slab_id(&self) -> usize {
        self.inner.buffer.slab_id()
    }

    /// Number of live handles to this packet
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Share the buffer: bump the reference count, no copy
    pub fn clone_shared(&self) -> Packet {
        Packet {
            inner: self.inner.clone(),
        }
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("id", &self.inner.id)
            .field("ts", &self.inner.ts)
            .field("len", &self.len())
            .field("datalink", &self.inner.datalink.name())
            .field("reassembled", &self.inner.from_reassembly)
            .finish()
    }
}

/// Packet factory for one capture input
///
/// Hands out monotonically increasing packet ids and stamps each packet with
/// the input's name.
pub struct PacketSource {
    name: Arc<str>,
    next_id: AtomicU64,
    pool: PacketPool,
}

impl PacketSource {
    pub fn new(name: &str, pool: PacketPool) -> Self {
        Self {
            name: Arc::from(name),
            next_id: AtomicU64::new(1),
            pool,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Build the next packet for this input
    pub fn packet(&self, ts: Timestamp, datalink: Arc<dyn Decoder>, bytes: &[u8]) -> Packet {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.pool
            .packet_from_slice(id, ts, datalink, Some(self.name.clone()), bytes)
    }
}
