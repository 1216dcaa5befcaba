//! Reassembly engines
//!
//! Three building blocks decoders compose: multipart fragment reassembly for
//! split packets, ordered stream reassembly for byte streams, and a line
//! parser for text protocols on top of a reassembled stream.

pub mod fragment;
pub mod line;
pub mod stream;

pub use fragment::Multipart;
pub use line::LineParser;
pub use stream::{Direction, SegmentOutcome, Stream, StreamHandler};
