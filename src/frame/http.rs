//! HTTP body variants carried inside an [`super::Envelope`] (§4.1).
//!
//! Eleven variants, matching the regex `init (chunk)* (end|abort)` in both
//! directions (§8 invariant 4). `requestTrailers`, `responseTrailers`, and
//! `responseInterim` are reserved: this implementation decodes them (so a
//! conforming peer is never protocol-errored for sending one) but never
//! emits them (§9 Open Questions).

use bytes::{Buf, Bytes, BytesMut};

use crate::error::ProtocolError;

use super::{get_bytes, get_headers, get_str, put_bytes, put_headers, put_str, require};

pub type HeaderList = Vec<(String, Bytes)>;

/// Reason carried by `requestAbort`/`responseAbort` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AbortReason {
    Unknown = 0,
    Timeout = 1,
    PeerClosed = 2,
    ResetByPeer = 3,
    ConnectionLost = 4,
    Cancelled = 5,
    ProtocolError = 6,
    FlowControl = 7,
    Overload = 8,
}

impl AbortReason {
    fn from_u8(v: u8) -> Result<Self, ProtocolError> {
        Ok(match v {
            0 => Self::Unknown,
            1 => Self::Timeout,
            2 => Self::PeerClosed,
            3 => Self::ResetByPeer,
            4 => Self::ConnectionLost,
            5 => Self::Cancelled,
            6 => Self::ProtocolError,
            7 => Self::FlowControl,
            8 => Self::Overload,
            other => return Err(ProtocolError::UnknownHttpVariant(other)),
        })
    }
}

#[derive(Debug, Clone)]
pub enum HttpFrame {
    RequestInit {
        method: String,
        uri: String,
        version: String,
        headers: HeaderList,
        has_body: bool,
    },
    RequestBodyChunk {
        seq: u32,
        data: Bytes,
        is_last: bool,
    },
    /// Reserved — decoded, never emitted (§9).
    RequestTrailers {
        headers: HeaderList,
    },
    RequestEnd,
    RequestAbort {
        reason: AbortReason,
        detail: String,
    },
    ResponseInit {
        status: u16,
        headers: HeaderList,
        has_body: bool,
        /// 0 means unknown (chunked).
        content_length: u64,
    },
    /// Reserved — decoded, never emitted (§9). 103 Early Hints.
    ResponseInterim {
        status: u16,
        headers: HeaderList,
    },
    ResponseBodyChunk {
        seq: u32,
        data: Bytes,
        is_last: bool,
    },
    /// Reserved — decoded, never emitted (§9).
    ResponseTrailers {
        headers: HeaderList,
    },
    ResponseEnd,
    ResponseAbort {
        reason: AbortReason,
        detail: String,
    },
}

const TAG_REQUEST_INIT: u8 = 0x01;
const TAG_REQUEST_BODY_CHUNK: u8 = 0x02;
const TAG_REQUEST_TRAILERS: u8 = 0x03;
const TAG_REQUEST_END: u8 = 0x04;
const TAG_REQUEST_ABORT: u8 = 0x05;
const TAG_RESPONSE_INIT: u8 = 0x06;
const TAG_RESPONSE_INTERIM: u8 = 0x07;
const TAG_RESPONSE_BODY_CHUNK: u8 = 0x08;
const TAG_RESPONSE_TRAILERS: u8 = 0x09;
const TAG_RESPONSE_END: u8 = 0x0a;
const TAG_RESPONSE_ABORT: u8 = 0x0b;

impl HttpFrame {
    pub(crate) fn encode_body(&self, buf: &mut BytesMut) {
        match self {
            Self::RequestInit {
                method,
                uri,
                version,
                headers,
                has_body,
            } => {
                buf.put_u8(TAG_REQUEST_INIT);
                put_str(buf, method);
                put_str(buf, uri);
                put_str(buf, version);
                put_headers(buf, headers);
                buf.put_u8(*has_body as u8);
            }
            Self::RequestBodyChunk { seq, data, is_last } => {
                buf.put_u8(TAG_REQUEST_BODY_CHUNK);
                buf.put_u32(*seq);
                buf.put_u8(*is_last as u8);
                put_bytes(buf, data);
            }
            Self::RequestTrailers { headers } => {
                buf.put_u8(TAG_REQUEST_TRAILERS);
                put_headers(buf, headers);
            }
            Self::RequestEnd => buf.put_u8(TAG_REQUEST_END),
            Self::RequestAbort { reason, detail } => {
                buf.put_u8(TAG_REQUEST_ABORT);
                buf.put_u8(*reason as u8);
                put_str(buf, detail);
            }
            Self::ResponseInit {
                status,
                headers,
                has_body,
                content_length,
            } => {
                buf.put_u8(TAG_RESPONSE_INIT);
                buf.put_u16(*status);
                put_headers(buf, headers);
                buf.put_u8(*has_body as u8);
                buf.put_u64(*content_length);
            }
            Self::ResponseInterim { status, headers } => {
                buf.put_u8(TAG_RESPONSE_INTERIM);
                buf.put_u16(*status);
                put_headers(buf, headers);
            }
            Self::ResponseBodyChunk { seq, data, is_last } => {
                buf.put_u8(TAG_RESPONSE_BODY_CHUNK);
                buf.put_u32(*seq);
                buf.put_u8(*is_last as u8);
                put_bytes(buf, data);
            }
            Self::ResponseTrailers { headers } => {
                buf.put_u8(TAG_RESPONSE_TRAILERS);
                put_headers(buf, headers);
            }
            Self::ResponseEnd => buf.put_u8(TAG_RESPONSE_END),
            Self::ResponseAbort { reason, detail } => {
                buf.put_u8(TAG_RESPONSE_ABORT);
                buf.put_u8(*reason as u8);
                put_str(buf, detail);
            }
        }
    }

    pub(crate) fn decode_body(data: &mut Bytes) -> Result<Self, ProtocolError> {
        require(data, 1)?;
        let tag = data.get_u8();
        Ok(match tag {
            TAG_REQUEST_INIT => {
                let method = get_str(data)?;
                let uri = get_str(data)?;
                let version = get_str(data)?;
                let headers = get_headers(data)?;
                require(data, 1)?;
                let has_body = data.get_u8() != 0;
                Self::RequestInit {
                    method,
                    uri,
                    version,
                    headers,
                    has_body,
                }
            }
            TAG_REQUEST_BODY_CHUNK => {
                require(data, 5)?;
                let seq = data.get_u32();
                let is_last = data.get_u8() != 0;
                let chunk = get_bytes(data)?;
                Self::RequestBodyChunk {
                    seq,
                    data: chunk,
                    is_last,
                }
            }
            TAG_REQUEST_TRAILERS => Self::RequestTrailers {
                headers: get_headers(data)?,
            },
            TAG_REQUEST_END => Self::RequestEnd,
            TAG_REQUEST_ABORT => {
                require(data, 1)?;
                let reason = AbortReason::from_u8(data.get_u8())?;
                let detail = get_str(data)?;
                Self::RequestAbort { reason, detail }
            }
            TAG_RESPONSE_INIT => {
                require(data, 2)?;
                let status = data.get_u16();
                let headers = get_headers(data)?;
                require(data, 9)?;
                let has_body = data.get_u8() != 0;
                let content_length = data.get_u64();
                Self::ResponseInit {
                    status,
                    headers,
                    has_body,
                    content_length,
                }
            }
            TAG_RESPONSE_INTERIM => {
                require(data, 2)?;
                let status = data.get_u16();
                let headers = get_headers(data)?;
                Self::ResponseInterim { status, headers }
            }
            TAG_RESPONSE_BODY_CHUNK => {
                require(data, 5)?;
                let seq = data.get_u32();
                let is_last = data.get_u8() != 0;
                let chunk = get_bytes(data)?;
                Self::ResponseBodyChunk {
                    seq,
                    data: chunk,
                    is_last,
                }
            }
            TAG_RESPONSE_TRAILERS => Self::ResponseTrailers {
                headers: get_headers(data)?,
            },
            TAG_RESPONSE_END => Self::ResponseEnd,
            TAG_RESPONSE_ABORT => {
                require(data, 1)?;
                let reason = AbortReason::from_u8(data.get_u8())?;
                let detail = get_str(data)?;
                Self::ResponseAbort { reason, detail }
            }
            other => return Err(ProtocolError::UnknownHttpVariant(other)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;
    use crate::frame::{Body, Envelope};

    fn round_trip(frame: HttpFrame) -> HttpFrame {
        let env = Envelope::new(1, 5, 0, Body::Http(frame));
        let encoded = env.encode();
        match Envelope::decode(encoded).unwrap().body {
            Body::Http(f) => f,
            other => panic!("expected http body, got {other:?}"),
        }
    }

    #[test]
    fn request_init_round_trips_with_headers() {
        let frame = HttpFrame::RequestInit {
            method: "GET".into(),
            uri: "/hello?x=1".into(),
            version: "HTTP/1.1".into(),
            headers: vec![("content-type".into(), Bytes::from_static(b"text/plain"))],
            has_body: false,
        };
        match round_trip(frame) {
            HttpFrame::RequestInit {
                method,
                uri,
                headers,
                has_body,
                ..
            } => {
                assert_eq!(method, "GET");
                assert_eq!(uri, "/hello?x=1");
                assert_eq!(headers.len(), 1);
                assert!(!has_body);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn zero_length_last_chunk_is_valid_terminator() {
        let frame = HttpFrame::ResponseBodyChunk {
            seq: 4,
            data: Bytes::new(),
            is_last: true,
        };
        match round_trip(frame) {
            HttpFrame::ResponseBodyChunk { data, is_last, .. } => {
                assert!(data.is_empty());
                assert!(is_last);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn content_length_zero_with_has_body_is_legal() {
        let frame = HttpFrame::ResponseInit {
            status: 200,
            headers: vec![],
            has_body: true,
            content_length: 0,
        };
        match round_trip(frame) {
            HttpFrame::ResponseInit {
                has_body,
                content_length,
                ..
            } => {
                assert!(has_body);
                assert_eq!(content_length, 0);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unknown_variant_tag_is_protocol_error() {
        let mut buf = BytesMut::new();
        buf.put_u8(0xEE);
        let err = HttpFrame::decode_body(&mut buf.freeze()).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownHttpVariant(0xEE)));
    }
}
