//! WebSocket stream machine (§4.4): upgrade promotion, bidirectional relay,
//! close propagation.
//!
//! The public-side socket is abstracted behind [`PublicWs`] so this module
//! never names `axum::extract::ws::WebSocket` directly — the axum adapter
//! supplies the concrete implementation, and tests can supply an in-memory
//! fake. Once promoted (§4.4), a dedicated task owns the `PublicWs` value
//! and relays in both directions; the slot itself only holds a handle to
//! feed that task outbound frames, matching the dedicated-writer-task shape
//! used for the agent socket (§5 **[ADDED]** Task topology).

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::error::StreamError;
use crate::frame::WsFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsStreamState {
    Open,
    Closing,
    Closed,
}

/// A message read off the public-side socket.
#[derive(Debug, Clone)]
pub enum PublicWsMessage {
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close(Option<(u16, String)>),
}

/// Abstraction over a public-facing WebSocket connection (§4.4 **[ADDED]**).
#[async_trait]
pub trait PublicWs: Send {
    async fn send_text(&mut self, text: String) -> Result<(), StreamError>;
    async fn send_binary(&mut self, data: Bytes) -> Result<(), StreamError>;
    async fn send_close(&mut self, code: u16, reason: String) -> Result<(), StreamError>;
    /// `None` means the connection is closed; no further calls are made.
    async fn recv(&mut self) -> Option<PublicWsMessage>;
}

/// One relayed frame queued for the public-facing relay task.
pub enum Outbound {
    Text(String),
    Binary(Bytes),
    Close { code: u16, reason: String },
}

/// The relay task can only start once the public-side socket exists, which
/// for a freshly-promoted stream is later than the promotion itself (the
/// axum adapter hands over the real socket from inside `on_upgrade`, after
/// the 101 response already went out). Until then the slot holds the
/// unconsumed receiver; agent-originated frames queue on it exactly like
/// they would against a running relay, so nothing is lost in the gap.
pub enum Relay {
    Pending(mpsc::Receiver<Outbound>),
    Running(AbortHandle),
    Taken,
}

pub struct WsStreamSlot {
    pub state: WsStreamState,
    /// Feeds the relay task frames originating from the agent.
    pub outbound_tx: mpsc::Sender<Outbound>,
    pub relay: Relay,
}

impl WsStreamSlot {
    pub fn pending(capacity: usize) -> Self {
        let (outbound_tx, rx) = mpsc::channel(capacity);
        Self {
            state: WsStreamState::Open,
            outbound_tx,
            relay: Relay::Pending(rx),
        }
    }

    /// Take the queued receiver once the relay task is ready to run. `None`
    /// if the relay is already running (or was already taken) — callers
    /// only invoke this once, from `complete_upgrade`.
    pub fn take_pending_receiver(&mut self) -> Option<mpsc::Receiver<Outbound>> {
        if matches!(self.relay, Relay::Pending(_)) {
            match std::mem::replace(&mut self.relay, Relay::Taken) {
                Relay::Pending(rx) => Some(rx),
                _ => unreachable!(),
            }
        } else {
            None
        }
    }

    pub fn start_relay(&mut self, handle: AbortHandle) {
        self.relay = Relay::Running(handle);
    }

    #[cfg(test)]
    pub fn new_for_test() -> Self {
        Self::pending(1)
    }
}

impl Drop for WsStreamSlot {
    fn drop(&mut self) {
        if let Relay::Running(handle) = &self.relay {
            handle.abort();
        }
    }
}

/// Translate a relayed agent-side `ws` frame into the [`Outbound`] queued
/// for the public relay task, or `None` for opcodes the session swallows.
/// `PONG` from the agent is ignored (§4.4); `PING` is auto-answered by the
/// session itself (see `Session::handle_ws_from_agent`) before it ever
/// reaches this function, so its arm here exists only to keep the match
/// exhaustive.
pub fn outbound_from_agent_frame(frame: &WsFrame) -> Option<Outbound> {
    use crate::frame::WsOpcode;
    match frame.opcode {
        WsOpcode::Text => String::from_utf8(frame.payload.to_vec())
            .ok()
            .map(Outbound::Text),
        WsOpcode::Binary => Some(Outbound::Binary(frame.payload.clone())),
        WsOpcode::Close => Some(Outbound::Close {
            code: frame.close_code.unwrap_or(1000),
            reason: String::from_utf8_lossy(&frame.payload).into_owned(),
        }),
        WsOpcode::Ping | WsOpcode::Pong | WsOpcode::Continuation => None,
    }
}

/// Wrap a message read from the public side as the `ws` frame emitted
/// toward the agent (§4.4: "wrapped as `ws` frames with `opcode` matching
/// the message kind, `fin=true`").
pub fn agent_frame_from_public_message(message: &PublicWsMessage) -> Option<WsFrame> {
    match message {
        PublicWsMessage::Text(text) => Some(WsFrame::text(Bytes::from(text.clone().into_bytes()))),
        PublicWsMessage::Binary(data) => Some(WsFrame::binary(data.clone())),
        PublicWsMessage::Close(close) => {
            let (code, reason) = close.clone().unwrap_or((1000, String::new()));
            Some(WsFrame::close(code, Bytes::from(reason.into_bytes())))
        }
        PublicWsMessage::Ping(_) | PublicWsMessage::Pong(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::WsOpcode;

    #[test]
    fn agent_pong_is_swallowed() {
        let frame = WsFrame {
            opcode: WsOpcode::Pong,
            fin: true,
            reserved: 0,
            mask: None,
            payload: Bytes::new(),
            close_code: None,
        };
        assert!(outbound_from_agent_frame(&frame).is_none());
    }

    #[test]
    fn agent_close_carries_code_and_detail() {
        let frame = WsFrame {
            opcode: WsOpcode::Close,
            fin: true,
            reserved: 0,
            mask: None,
            payload: Bytes::from_static(b"bye"),
            close_code: Some(1001),
        };
        match outbound_from_agent_frame(&frame) {
            Some(Outbound::Close { code, reason }) => {
                assert_eq!(code, 1001);
                assert_eq!(reason, "bye");
            }
            other => panic!("unexpected: {}", matches!(other, None)),
        }
    }

    #[test]
    fn public_text_becomes_text_ws_frame() {
        let msg = PublicWsMessage::Text("ping".into());
        let frame = agent_frame_from_public_message(&msg).unwrap();
        assert_eq!(frame.opcode, WsOpcode::Text);
        assert_eq!(&frame.payload[..], b"ping");
    }
}
