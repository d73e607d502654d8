//! Control body variant carried inside an [`super::Envelope`] (§4.1, §4.5).
//!
//! Control frames always use `stream_id = 0` and bypass the stream tables
//! entirely — they are handled directly by the session supervisor.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::ProtocolError;

use super::{get_str, put_str, require};

#[derive(Debug, Clone)]
pub enum ControlFrame {
    Ping { data: Bytes },
    Pong { data: Bytes },
    /// Reserved — decoded, never emitted (§9 Open Questions).
    FlowWindowUpdate { stream_id: u32, increment: u32 },
    Error { code: u32, message: String },
    GoAway { last_msg_seq: u64, reason: String },
}

const TAG_PING: u8 = 0x10;
const TAG_PONG: u8 = 0x11;
const TAG_FLOW_WINDOW_UPDATE: u8 = 0x12;
const TAG_ERROR: u8 = 0x13;
const TAG_GO_AWAY: u8 = 0x14;

impl ControlFrame {
    pub(crate) fn encode_body(&self, buf: &mut BytesMut) {
        match self {
            Self::Ping { data } => {
                buf.put_u8(TAG_PING);
                super::put_bytes(buf, data);
            }
            Self::Pong { data } => {
                buf.put_u8(TAG_PONG);
                super::put_bytes(buf, data);
            }
            Self::FlowWindowUpdate {
                stream_id,
                increment,
            } => {
                buf.put_u8(TAG_FLOW_WINDOW_UPDATE);
                buf.put_u32(*stream_id);
                buf.put_u32(*increment);
            }
            Self::Error { code, message } => {
                buf.put_u8(TAG_ERROR);
                buf.put_u32(*code);
                put_str(buf, message);
            }
            Self::GoAway {
                last_msg_seq,
                reason,
            } => {
                buf.put_u8(TAG_GO_AWAY);
                buf.put_u64(*last_msg_seq);
                put_str(buf, reason);
            }
        }
    }

    pub(crate) fn decode_body(data: &mut Bytes) -> Result<Self, ProtocolError> {
        require(data, 1)?;
        let tag = data.get_u8();
        Ok(match tag {
            TAG_PING => Self::Ping {
                data: super::get_bytes(data)?,
            },
            TAG_PONG => Self::Pong {
                data: super::get_bytes(data)?,
            },
            TAG_FLOW_WINDOW_UPDATE => {
                require(data, 8)?;
                let stream_id = data.get_u32();
                let increment = data.get_u32();
                Self::FlowWindowUpdate {
                    stream_id,
                    increment,
                }
            }
            TAG_ERROR => {
                require(data, 4)?;
                let code = data.get_u32();
                let message = get_str(data)?;
                Self::Error { code, message }
            }
            TAG_GO_AWAY => {
                require(data, 8)?;
                let last_msg_seq = data.get_u64();
                let reason = get_str(data)?;
                Self::GoAway {
                    last_msg_seq,
                    reason,
                }
            }
            other => return Err(ProtocolError::UnknownControlVariant(other)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;
    use crate::frame::{Body, Envelope};

    #[test]
    fn go_away_round_trips() {
        let env = Envelope::control(
            42,
            5,
            ControlFrame::GoAway {
                last_msg_seq: 17,
                reason: "Replaced by new connection".into(),
            },
        );
        let decoded = Envelope::decode(env.encode()).unwrap();
        match decoded.body {
            Body::Control(ControlFrame::GoAway {
                last_msg_seq,
                reason,
            }) => {
                assert_eq!(last_msg_seq, 17);
                assert_eq!(reason, "Replaced by new connection");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unknown_control_tag_is_protocol_error() {
        let mut buf = BytesMut::new();
        buf.put_u8(0xAB);
        let err = ControlFrame::decode_body(&mut buf.freeze()).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownControlVariant(0xAB)));
    }
}
