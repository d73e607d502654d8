//! Binary frame protocol for the agent <-> session control connection.
//!
//! Envelope layout (29-byte header + tagged body):
//! ```text
//! | timestamp_ms (8B) | connection_id (8B) | stream_id (4B) | msg_seq (8B) | body_tag (1B) | body (NB) |
//! ```
//!
//! `body_tag` selects which of the three frame families (§4.1) follows:
//! HTTP (0x00), WebSocket (0x01), or Control (0x02). Each family has its own
//! variant tag and encoding, implemented in the sibling modules.

pub mod control;
pub mod http;
pub mod ws;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

pub use control::ControlFrame;
pub use http::{AbortReason, HeaderList, HttpFrame};
pub use ws::{WsFrame, WsOpcode};

/// Fixed-size prefix before the tagged body.
pub const HEADER_LEN: usize = 8 + 8 + 4 + 8 + 1;

#[derive(Debug, Clone)]
pub struct Envelope {
    pub timestamp_ms: u64,
    pub connection_id: u64,
    pub stream_id: u32,
    pub msg_seq: u64,
    pub body: Body,
}

#[derive(Debug, Clone)]
pub enum Body {
    Http(HttpFrame),
    Ws(WsFrame),
    Control(ControlFrame),
}

impl Envelope {
    /// Construct an envelope. Callers are expected to fill `msg_seq` from
    /// the session's monotonic counter immediately before this is handed to
    /// the writer task (§5 — assignment happens under the serialization
    /// primitive so it reflects global emission order).
    pub fn new(connection_id: u64, stream_id: u32, msg_seq: u64, body: Body) -> Self {
        Self {
            timestamp_ms: now_ms(),
            connection_id,
            stream_id,
            msg_seq,
            body,
        }
    }

    pub fn control(connection_id: u64, msg_seq: u64, frame: ControlFrame) -> Self {
        Self::new(connection_id, 0, msg_seq, Body::Control(frame))
    }

    /// Encode into the packed wire form. Infallible given valid inputs,
    /// bounded only by the underlying socket message limit (§4.1).
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + 64);
        buf.put_u64(self.timestamp_ms);
        buf.put_u64(self.connection_id);
        buf.put_u32(self.stream_id);
        buf.put_u64(self.msg_seq);

        match &self.body {
            Body::Http(f) => {
                buf.put_u8(0x00);
                f.encode_body(&mut buf);
            }
            Body::Ws(f) => {
                buf.put_u8(0x01);
                f.encode_body(&mut buf);
            }
            Body::Control(f) => {
                buf.put_u8(0x02);
                f.encode_body(&mut buf);
            }
        }

        buf.freeze()
    }

    /// Decode from the packed wire form. Fails with `ProtocolError` when a
    /// required field is absent, the body tag is unknown, or an HTTP frame
    /// carries a variant tag outside the eleven defined in §4.1.
    pub fn decode(mut data: Bytes) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_LEN {
            return Err(ProtocolError::TooShort {
                expected: HEADER_LEN,
                actual: data.len(),
            });
        }

        let timestamp_ms = data.get_u64();
        let connection_id = data.get_u64();
        let stream_id = data.get_u32();
        let msg_seq = data.get_u64();
        let body_tag = data.get_u8();

        let body = match body_tag {
            0x00 => Body::Http(HttpFrame::decode_body(&mut data)?),
            0x01 => Body::Ws(WsFrame::decode_body(&mut data)?),
            0x02 => Body::Control(ControlFrame::decode_body(&mut data)?),
            other => return Err(ProtocolError::UnknownBodyTag(other)),
        };

        Ok(Self {
            timestamp_ms,
            connection_id,
            stream_id,
            msg_seq,
            body,
        })
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Shared wire helpers: length-prefixed bytes/strings and header lists.
// ---------------------------------------------------------------------------

pub(crate) fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

pub(crate) fn get_bytes(data: &mut Bytes) -> Result<Bytes, ProtocolError> {
    require(data, 4)?;
    let len = data.get_u32() as usize;
    require(data, len)?;
    Ok(data.split_to(len))
}

pub(crate) fn put_str(buf: &mut BytesMut, s: &str) {
    put_bytes(buf, s.as_bytes());
}

pub(crate) fn get_str(data: &mut Bytes) -> Result<String, ProtocolError> {
    let bytes = get_bytes(data)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
}

pub(crate) fn put_headers(buf: &mut BytesMut, headers: &HeaderList) {
    buf.put_u16(headers.len() as u16);
    for (name, value) in headers {
        put_str(buf, name);
        put_bytes(buf, value);
    }
}

pub(crate) fn get_headers(data: &mut Bytes) -> Result<HeaderList, ProtocolError> {
    require(data, 2)?;
    let count = data.get_u16() as usize;
    let mut headers = Vec::with_capacity(count);
    for _ in 0..count {
        let name = get_str(data)?;
        let value = get_bytes(data)?;
        headers.push((name, value));
    }
    Ok(headers)
}

pub(crate) fn require(data: &Bytes, n: usize) -> Result<(), ProtocolError> {
    if data.remaining() < n {
        Err(ProtocolError::Truncated {
            expected: n,
            actual: data.remaining(),
        })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_ping_round_trips() {
        let env = Envelope::control(
            7,
            3,
            ControlFrame::Ping {
                data: Bytes::from_static(b"hello"),
            },
        );
        let encoded = env.encode();
        let decoded = Envelope::decode(encoded).unwrap();
        assert_eq!(decoded.connection_id, 7);
        assert_eq!(decoded.stream_id, 0);
        assert_eq!(decoded.msg_seq, 3);
        match decoded.body {
            Body::Control(ControlFrame::Ping { data }) => assert_eq!(&data[..], b"hello"),
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_short_header() {
        let err = Envelope::decode(Bytes::from_static(b"short")).unwrap_err();
        assert!(matches!(err, ProtocolError::TooShort { .. }));
    }

    #[test]
    fn decode_rejects_unknown_body_tag() {
        let mut buf = BytesMut::new();
        buf.put_u64(0);
        buf.put_u64(0);
        buf.put_u32(1);
        buf.put_u64(0);
        buf.put_u8(0xFF);
        let err = Envelope::decode(buf.freeze()).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownBodyTag(0xFF)));
    }
}
