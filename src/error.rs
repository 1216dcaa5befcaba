use thiserror::Error;

/// Errors surfaced by the packet core.
///
/// A `CoreError` during a stack walk degrades that packet's result; one that
/// reaches the scheduler's top-level dispatch halts the whole engine.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("scheduler is shutting down")]
    ShuttingDown,

    #[error("engine halted: {0}")]
    Halted(String),

    #[error("decoder {decoder} failed: {reason}")]
    Decoder {
        decoder: &'static str,
        reason: String,
    },

    #[error("session tracking failure: {0}")]
    Session(String),

    #[error("stream buffer limit of {0} bytes exceeded")]
    StreamOverflow(usize),

    #[error("line exceeds maximum length of {0} bytes")]
    LineTooLong(usize),

    #[error("payload view [{offset}, {offset}+{len}) outside buffer of {buffer_len} bytes")]
    ViewOutOfBounds {
        offset: usize,
        len: usize,
        buffer_len: usize,
    },

    #[error("stack capacity of {0} slots reached")]
    StackExhausted(usize),

    #[error("invalid engine state: {0}")]
    State(&'static str),

    #[error("worker thread error: {0}")]
    Thread(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Verdict returned by a decoder's `process` phase.
///
/// `Invalid` and `Stop` are expected, purely local outcomes. An unexpected
/// internal failure is the `Err` arm of `Result<ProcessVerdict, CoreError>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessVerdict {
    /// Layer decoded; the walk may continue into the next slot.
    Continue,
    /// Payload fully handled elsewhere (handed to a reassembler); end the
    /// walk without treating the next slot as this packet's continuation.
    Stop,
    /// Malformed input for this layer; abort the walk, not fatal.
    Invalid,
}

impl ProcessVerdict {
    /// Whether the layer committed (post-process must run during unwind).
    pub fn committed(self) -> bool {
        !matches!(self, ProcessVerdict::Invalid)
    }
}
