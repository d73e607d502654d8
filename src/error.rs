//! Error taxonomy for the tunnel session core.
//!
//! Mirrors the split the rest of this crate uses: library modules return
//! `thiserror`-derived enums callers can match on; `anyhow` is reserved for
//! the process boundary (`main.rs`, the axum adapter's error responses).

use std::time::Duration;

use thiserror::Error;

/// Malformed-frame errors. Fatal to the agent socket: the session closes it
/// with WebSocket code 1002 and fails every in-flight stream.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    #[error("frame truncated: expected {expected} more bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("unknown envelope body tag: 0x{0:02x}")]
    UnknownBodyTag(u8),

    #[error("unknown HTTP frame variant: 0x{0:02x}")]
    UnknownHttpVariant(u8),

    #[error("unknown control frame variant: 0x{0:02x}")]
    UnknownControlVariant(u8),

    #[error("unknown WebSocket opcode: 0x{0:02x}")]
    UnknownWsOpcode(u8),

    #[error("out-of-order body chunk on stream {stream_id}: expected seq >= {expected}, got {actual}")]
    OutOfOrderChunk {
        stream_id: u32,
        expected: u32,
        actual: u32,
    },

    #[error("frame received on stream {stream_id} after its terminal frame")]
    FrameAfterTerminal { stream_id: u32 },

    #[error("invalid UTF-8 in frame text field")]
    InvalidUtf8,
}

/// Stream-local errors. Never escape the stream they affect; they convert
/// into `requestAbort`/`responseAbort` frames and the matching public-side
/// response.
#[derive(Debug, Error, Clone)]
pub enum StreamError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("public client cancelled the request")]
    Cancelled,

    #[error("agent reported abort: {0}")]
    AgentAborted(String),

    #[error("CLI disconnected")]
    AgentDisconnected,

    #[error("CLI reconnected")]
    AgentReconnected,
}
