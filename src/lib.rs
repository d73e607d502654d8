//! DOtunnel session core: multiplexes one agent control socket against many
//! public HTTP/WebSocket client connections for a single tunnel (spec §1–§9).
//!
//! The binary in `main.rs` is a thin `axum` host around [`session::Session`];
//! everything that matters — framing, stream bookkeeping, concurrency,
//! failure handling — lives in this library so it can be exercised directly
//! in tests without any real network I/O.

pub mod axum_adapter;
pub mod config;
pub mod control;
pub mod error;
pub mod frame;
pub mod hibernation;
pub mod http_stream;
pub mod logging;
pub mod manager;
pub mod registry;
pub mod session;
pub mod stream_table;
pub mod ws_stream;
