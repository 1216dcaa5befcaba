//! Packet core
//!
//! Packet and buffer pooling, the decoder contract, the per-packet process
//! stack, and the dispatcher that drives packets through it.

pub mod decoder;
pub mod dispatch;
pub mod fields;
pub mod packet;
pub mod stack;

pub use decoder::{Decoder, DecoderEntry, DecoderRegistry};
pub use dispatch::Dispatcher;
pub use fields::{FieldDescriptor, FieldValue, InfoPool, PacketInfo};
pub use packet::{Packet, PacketPool, PacketSource, PooledBuffer};
pub use stack::{PayloadView, ProcessStack, StackSlot};
