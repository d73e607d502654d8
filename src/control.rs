//! Control channel helpers (§4.5): ping/pong, error logging, go-away
//! draining state, and the one-shot JSON attach handshake.
//!
//! The wire encoding of control frames themselves lives in
//! [`crate::frame::control`]; this module holds the session-level policy
//! around them — what the supervisor (`session.rs`) does in response.

use serde::Serialize;
use tracing::warn;

use crate::frame::{ControlFrame, Envelope};

/// Text handshake sent once, immediately after a new agent socket is
/// adopted (§4.5, §6): `{type:"tunnel_ready", connectionId, tunnelUrl}`.
/// `connectionId` is serialized as a decimal string per §6.
#[derive(Debug, Serialize)]
pub struct TunnelReady {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(rename = "connectionId")]
    pub connection_id: String,
    #[serde(rename = "tunnelUrl")]
    pub tunnel_url: String,
}

impl TunnelReady {
    pub fn new(connection_id: u64, tunnel_url: String) -> Self {
        Self {
            kind: "tunnel_ready",
            connection_id: connection_id.to_string(),
            tunnel_url,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("TunnelReady always serializes")
    }
}

/// Draining state entered once a `goAway` has been sent or received. The
/// source is silent on whether new streams may still open in this window
/// (§9 Open Questions); this implementation takes the conservative reading
/// and refuses them immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct GoAwayState {
    pub draining: bool,
    pub last_msg_seq: Option<u64>,
}

impl GoAwayState {
    pub fn note_incoming(&mut self, last_msg_seq: u64) {
        self.draining = true;
        self.last_msg_seq = Some(last_msg_seq);
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Whether a frame carrying `msg_seq` should still be delivered while
    /// draining (§4.5: up to and including `lastMsgSeq`).
    pub fn admits(&self, msg_seq: u64) -> bool {
        match self.last_msg_seq {
            Some(limit) => msg_seq <= limit,
            None => true,
        }
    }
}

/// Build the reply to an incoming `ping` (§4.5: "must respond promptly").
pub fn pong_for(connection_id: u64, msg_seq: u64, data: bytes::Bytes) -> Envelope {
    Envelope::control(connection_id, msg_seq, ControlFrame::Pong { data })
}

/// Build the `goAway` emitted when displacing an older agent socket.
pub fn go_away(
    connection_id: u64,
    msg_seq: u64,
    last_msg_seq: u64,
    reason: impl Into<String>,
) -> Envelope {
    Envelope::control(
        connection_id,
        msg_seq,
        ControlFrame::GoAway {
            last_msg_seq,
            reason: reason.into(),
        },
    )
}

/// Log an incoming `control.error` (§4.5: "no stream is affected unless the
/// peer independently aborts it").
pub fn log_incoming_error(tunnel_id: &str, code: u32, message: &str) {
    warn!(tunnel_id, code, message, "agent reported control error");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_json_uses_camel_case_keys() {
        let ready = TunnelReady::new(42, "https://foo.tunnel.io".into());
        let json = ready.to_json();
        assert!(json.contains("\"type\":\"tunnel_ready\""));
        assert!(json.contains("\"connectionId\":\"42\""));
        assert!(json.contains("\"tunnelUrl\":\"https://foo.tunnel.io\""));
    }

    #[test]
    fn go_away_state_admits_up_to_last_seq_inclusive() {
        let mut state = GoAwayState::default();
        assert!(state.admits(1000));
        state.note_incoming(5);
        assert!(state.admits(5));
        assert!(!state.admits(6));
    }
}
