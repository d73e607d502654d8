//! HTTP stream machine (§4.3): lifecycle of one proxied HTTP exchange.
//!
//! A slot lives in the session's HTTP stream map from the moment a public
//! request is admitted until a terminal frame (`responseEnd`/`responseAbort`)
//! or the deadline fires. The session supervisor (`session.rs`) drives every
//! transition; this module holds the per-stream state, the channel pairs a
//! slot owns, and the synchronous rules for validating incoming frames
//! (§3 invariant 5, §4.3 ordering).

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

use crate::error::StreamError;
use crate::frame::{AbortReason, HeaderList};

/// Response-body channel depth. Bounded so a slow public-side consumer
/// applies real backpressure (§4.3: "the session does not drop chunks")
/// instead of buffering without limit.
const RESPONSE_BODY_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpStreamState {
    AwaitingInit,
    ResponseStreaming,
}

/// One chunk of response body, or the sink-closing error.
pub type BodyItem = Result<Bytes, StreamError>;
pub type ResponseBodyTx = mpsc::Sender<BodyItem>;
pub type ResponseBodyRx = mpsc::Receiver<BodyItem>;

/// What `responseInit` (or a failure before it arrives) hands to the public
/// side's single-shot "headers available" waiter (§9 Design Notes).
pub enum PendingOutcome {
    Response {
        status: u16,
        headers: HeaderList,
        body: Option<ResponseBodyRx>,
    },
    Failed(StreamError),
}

pub type HeadersTx = oneshot::Sender<PendingOutcome>;
pub type HeadersRx = oneshot::Receiver<PendingOutcome>;

/// Outcome of an agent `responseInit{status=101}` / non-101 / abort on a
/// pending-upgrade stream, or of its deadline (§4.4).
pub enum UpgradeOutcome {
    Promoted,
    Rejected { status: u16, detail: String },
    Failed(StreamError),
}

pub struct PendingUpgrade {
    pub result_tx: oneshot::Sender<UpgradeOutcome>,
}

pub struct HttpStreamSlot {
    pub state: HttpStreamState,
    pub headers_tx: Option<HeadersTx>,
    pub body_tx: ResponseBodyTx,
    /// Taken and handed to the public side once `responseInit{hasBody}`
    /// confirms a body is coming; otherwise dropped unused.
    pub body_rx: Option<ResponseBodyRx>,
    /// Next response-body `seq` expected; monotonically non-decreasing (§4.3).
    pub next_response_seq: u32,
    /// Next request-body `seq` this session will emit.
    pub next_request_seq: u32,
    /// `requestEnd`/`requestAbort` emitted exactly once; this latches it.
    pub request_terminated: bool,
    pub deadline: AbortHandle,
    pub pending_upgrade: Option<PendingUpgrade>,
}

impl HttpStreamSlot {
    pub fn new(deadline: AbortHandle) -> (Self, HeadersRx) {
        let (headers_tx, headers_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(RESPONSE_BODY_CAPACITY);
        let slot = Self {
            state: HttpStreamState::AwaitingInit,
            headers_tx: Some(headers_tx),
            body_tx,
            body_rx: Some(body_rx),
            next_response_seq: 0,
            next_request_seq: 0,
            request_terminated: false,
            deadline,
            pending_upgrade: None,
        };
        (slot, headers_rx)
    }

    /// A slot created for a deferred WebSocket upgrade (§4.4): same shape as
    /// an ordinary HTTP stream, plus the result channel the public side
    /// blocks on while the agent decides whether to accept the upgrade.
    pub fn for_upgrade(deadline: AbortHandle) -> (Self, oneshot::Receiver<UpgradeOutcome>) {
        let (mut slot, _headers_rx) = Self::new(deadline);
        let (result_tx, result_rx) = oneshot::channel();
        slot.pending_upgrade = Some(PendingUpgrade { result_tx });
        (slot, result_rx)
    }

    /// Validate and advance past `responseBodyChunk{seq}` (§4.3: "duplicates
    /// or regressions are protocolError").
    pub fn check_response_seq(&mut self, stream_id: u32, seq: u32) -> Result<(), crate::error::ProtocolError> {
        if seq < self.next_response_seq {
            return Err(crate::error::ProtocolError::OutOfOrderChunk {
                stream_id,
                expected: self.next_response_seq,
                actual: seq,
            });
        }
        self.next_response_seq = seq.saturating_add(1);
        Ok(())
    }

    /// Allocate the next request-body chunk sequence number.
    pub fn next_request_chunk_seq(&mut self) -> u32 {
        let seq = self.next_request_seq;
        self.next_request_seq += 1;
        seq
    }
}

/// Default reason mapping for the common abort triggers.
pub fn reason_for(error: &StreamError) -> AbortReason {
    match error {
        StreamError::Timeout(_) => AbortReason::Timeout,
        StreamError::Cancelled => AbortReason::Cancelled,
        StreamError::AgentAborted(_) => AbortReason::Unknown,
        StreamError::AgentDisconnected => AbortReason::ConnectionLost,
        StreamError::AgentReconnected => AbortReason::ConnectionLost,
    }
}

/// HTTP status code a waiting public client should see for a stream-local
/// failure (§4.7, §7 "User-visible behavior").
pub fn status_for(error: &StreamError) -> u16 {
    match error {
        StreamError::Timeout(_) => 504,
        StreamError::Cancelled => 499,
        StreamError::AgentAborted(_) => 502,
        StreamError::AgentDisconnected => 502,
        StreamError::AgentReconnected => 502,
    }
}

/// Concrete `http_body::Body` wrapping a response-body receiver, handed to
/// the axum adapter so it can return the body without copying (§4.3 **[ADDED]**).
pub type ResponseBody = http_body_util::StreamBody<
    futures_util::stream::Map<
        tokio_stream::wrappers::ReceiverStream<BodyItem>,
        fn(BodyItem) -> Result<http_body::Frame<Bytes>, StreamError>,
    >,
>;

fn to_frame(item: BodyItem) -> Result<http_body::Frame<Bytes>, StreamError> {
    item.map(http_body::Frame::data)
}

pub fn response_body(rx: ResponseBodyRx) -> ResponseBody {
    let stream = tokio_stream::wrappers::ReceiverStream::new(rx).map(to_frame as fn(_) -> _);
    http_body_util::StreamBody::new(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn abort_handle() -> AbortHandle {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(async {
                tokio::spawn(async { std::future::pending::<()>().await }).abort_handle()
            })
    }

    #[test]
    fn response_seq_rejects_regression() {
        let (mut slot, _rx) = HttpStreamSlot::new(abort_handle());
        assert!(slot.check_response_seq(1, 0).is_ok());
        assert!(slot.check_response_seq(1, 1).is_ok());
        assert!(slot.check_response_seq(1, 1).is_err());
    }

    #[test]
    fn request_chunk_seq_increments() {
        let (mut slot, _rx) = HttpStreamSlot::new(abort_handle());
        assert_eq!(slot.next_request_chunk_seq(), 0);
        assert_eq!(slot.next_request_chunk_seq(), 1);
        assert_eq!(slot.next_request_chunk_seq(), 2);
    }

    #[test]
    fn for_upgrade_carries_a_pending_upgrade_slot() {
        let (slot, _result_rx) = HttpStreamSlot::for_upgrade(abort_handle());
        assert!(slot.pending_upgrade.is_some());
        assert_eq!(slot.state, HttpStreamState::AwaitingInit);
    }

    #[test]
    fn status_for_maps_timeout_to_504() {
        assert_eq!(status_for(&StreamError::Timeout(std::time::Duration::from_secs(30))), 504);
        assert_eq!(status_for(&StreamError::AgentDisconnected), 502);
    }
}
