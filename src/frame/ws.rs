//! WebSocket body variant carried inside an [`super::Envelope`] (§4.1, §4.4).
//!
//! Wraps one relayed WebSocket frame: `opcode`, `fin`, reserved bits,
//! optional masking metadata, payload bytes, and — for close frames — a
//! `closeCode`.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::ProtocolError;

use super::{get_bytes, put_bytes, require};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WsOpcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xa,
}

impl WsOpcode {
    fn from_u8(v: u8) -> Result<Self, ProtocolError> {
        Ok(match v {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xa => Self::Pong,
            other => return Err(ProtocolError::UnknownWsOpcode(other)),
        })
    }
}

#[derive(Debug, Clone)]
pub struct WsFrame {
    pub opcode: WsOpcode,
    pub fin: bool,
    pub reserved: u8,
    /// Masking key, present only when relaying a masked client frame verbatim.
    pub mask: Option<u32>,
    pub payload: Bytes,
    /// Present only on `Close` frames.
    pub close_code: Option<u16>,
}

impl WsFrame {
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self {
            opcode: WsOpcode::Text,
            fin: true,
            reserved: 0,
            mask: None,
            payload: payload.into(),
            close_code: None,
        }
    }

    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self {
            opcode: WsOpcode::Binary,
            fin: true,
            reserved: 0,
            mask: None,
            payload: payload.into(),
            close_code: None,
        }
    }

    pub fn close(code: u16, detail: impl Into<Bytes>) -> Self {
        Self {
            opcode: WsOpcode::Close,
            fin: true,
            reserved: 0,
            mask: None,
            payload: detail.into(),
            close_code: Some(code),
        }
    }

    pub(crate) fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_u8(self.opcode as u8);
        let mut flags = self.reserved & 0x7;
        if self.fin {
            flags |= 0x80;
        }
        buf.put_u8(flags);
        match self.mask {
            Some(key) => {
                buf.put_u8(1);
                buf.put_u32(key);
            }
            None => buf.put_u8(0),
        }
        match self.close_code {
            Some(code) => {
                buf.put_u8(1);
                buf.put_u16(code);
            }
            None => buf.put_u8(0),
        }
        put_bytes(buf, &self.payload);
    }

    pub(crate) fn decode_body(data: &mut Bytes) -> Result<Self, ProtocolError> {
        require(data, 2)?;
        let opcode = WsOpcode::from_u8(data.get_u8())?;
        let flags = data.get_u8();
        let fin = flags & 0x80 != 0;
        let reserved = flags & 0x7;

        require(data, 1)?;
        let mask = if data.get_u8() != 0 {
            require(data, 4)?;
            Some(data.get_u32())
        } else {
            None
        };

        require(data, 1)?;
        let close_code = if data.get_u8() != 0 {
            require(data, 2)?;
            Some(data.get_u16())
        } else {
            None
        };

        let payload = get_bytes(data)?;

        Ok(Self {
            opcode,
            fin,
            reserved,
            mask,
            payload,
            close_code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Body, Envelope};

    #[test]
    fn close_frame_round_trips_with_code() {
        let env = Envelope::new(1, 9, 0, Body::Ws(WsFrame::close(1000, Bytes::new())));
        let decoded = Envelope::decode(env.encode()).unwrap();
        match decoded.body {
            Body::Ws(f) => {
                assert_eq!(f.opcode, WsOpcode::Close);
                assert_eq!(f.close_code, Some(1000));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn text_frame_round_trips() {
        let env = Envelope::new(1, 9, 0, Body::Ws(WsFrame::text(Bytes::from_static(b"ping"))));
        let decoded = Envelope::decode(env.encode()).unwrap();
        match decoded.body {
            Body::Ws(f) => {
                assert_eq!(f.opcode, WsOpcode::Text);
                assert!(f.fin);
                assert_eq!(&f.payload[..], b"ping");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
