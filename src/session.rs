//! Session supervisor (§4.6): the one object per tunnel that owns the agent
//! socket, the stream table, and the public-facing entry points.
//!
//! Mirrors the teacher's split between a dedicated reader task driving a
//! `tokio::select!` dispatch loop and a dedicated writer task draining an
//! outbound channel (`tunnel/dispatcher.rs` + `tunnel/writer.rs`), and the
//! teacher's `futures_util::StreamExt::split()` pattern for handing each
//! task its own half of the socket (`tunnel/client.rs`). All mutable state
//! lives behind one `parking_lot::Mutex`; the lock is held only to update
//! in-memory state and clone a sender, never across an `.await` (§5).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::control::{self, GoAwayState};
use crate::error::{ProtocolError, StreamError};
use crate::frame::{Body, ControlFrame, Envelope, HeaderList, HttpFrame, WsFrame};
use crate::http_stream::{
    self, HttpStreamSlot, HttpStreamState, PendingOutcome, ResponseBodyRx, UpgradeOutcome,
};
use crate::registry::{TunnelRegistry, TunnelStatus};
use crate::stream_table::StreamTable;
use crate::ws_stream::{
    self, Outbound, PublicWs, PublicWsMessage, WsStreamSlot, WsStreamState,
};

/// Depth of the channel feeding the agent writer task. Deep enough to
/// absorb a burst across every concurrently open stream without the
/// request/response dispatch path blocking on it.
const AGENT_WRITER_CAPACITY: usize = 256;
/// Depth of a promoted WebSocket stream's outbound-to-public queue.
const WS_OUTBOUND_CAPACITY: usize = 32;

// ---------------------------------------------------------------------------
// Agent socket abstraction
// ---------------------------------------------------------------------------

/// What the reader task reads off the agent socket before it even attempts
/// to decode a frame envelope — a raw transport message.
pub enum AgentMessage {
    Binary(Bytes),
    Close,
}

/// Write half of an attached agent socket (§5 **[ADDED]** Task topology).
#[async_trait]
pub trait AgentSink: Send {
    async fn send_binary(&mut self, data: Bytes) -> Result<(), StreamError>;
    async fn send_text(&mut self, text: String) -> Result<(), StreamError>;
    async fn close(&mut self, code: u16, reason: String);
}

/// Read half of an attached agent socket.
#[async_trait]
pub trait AgentStream: Send {
    async fn recv(&mut self) -> Option<AgentMessage>;
}

enum OutboundFrame {
    Binary(Bytes),
    Text(String),
    Close(u16, String),
}

// ---------------------------------------------------------------------------
// Public-facing request/response shapes
// ---------------------------------------------------------------------------

/// The caller-agnostic parts of an incoming HTTP request (§4.3, §6).
#[derive(Debug, Clone)]
pub struct HttpRequestHead {
    pub method: String,
    pub uri: String,
    pub version: String,
    pub headers: HeaderList,
}

/// One item from the public request's body, fed in by the front door as it
/// reads the incoming body (§4.3).
pub enum RequestBodyItem {
    Chunk(Bytes),
    End,
    /// The public client disconnected before the body finished.
    Abort,
}

pub type RequestBodyRx = mpsc::Receiver<RequestBodyItem>;

/// Result of `Session::serve_http` (§4.3, §4.7).
pub enum HttpOutcome {
    /// A canned response the session produced itself — no agent round trip.
    Immediate { status: u16, body: String },
    /// The agent's actual response.
    Upstream {
        status: u16,
        headers: HeaderList,
        body: Option<ResponseBodyRx>,
    },
}

impl HttpOutcome {
    fn immediate(status: u16, body: impl Into<String>) -> Self {
        Self::Immediate {
            status,
            body: body.into(),
        }
    }
}

/// Result of `Session::serve_upgrade` (§4.4).
pub enum UpgradeDecision {
    Refuse,
    Accept {
        stream_id: u32,
        waiter: oneshot::Receiver<UpgradeOutcome>,
    },
}

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

struct AgentHandle {
    outbound_tx: mpsc::Sender<OutboundFrame>,
    reader_task: AbortHandle,
    writer_task: AbortHandle,
}

struct SessionState {
    agent: Option<AgentHandle>,
    connection_id: u64,
    global_msg_seq: u64,
    tunnel_url: String,
    go_away: GoAwayState,
    stream_table: StreamTable,
}

impl SessionState {
    fn allocate_msg_seq(&mut self) -> u64 {
        let seq = self.global_msg_seq;
        self.global_msg_seq += 1;
        seq
    }
}

/// One tunnel's multiplexing core: one agent socket, many public streams
/// (§3 Data model). Always held behind an `Arc` — every async task spawned
/// on its behalf needs to outlive the call that spawned it.
pub struct Session {
    tunnel_id: String,
    config: Config,
    registry: Arc<dyn TunnelRegistry>,
    next_connection_id: AtomicU64,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new(tunnel_id: impl Into<String>, config: Config, registry: Arc<dyn TunnelRegistry>) -> Arc<Self> {
        Arc::new(Self {
            tunnel_id: tunnel_id.into(),
            config,
            registry,
            next_connection_id: AtomicU64::new(1),
            state: Mutex::new(SessionState {
                agent: None,
                connection_id: 0,
                global_msg_seq: 0,
                tunnel_url: String::new(),
                go_away: GoAwayState::default(),
                stream_table: StreamTable::new(),
            }),
        })
    }

    pub fn tunnel_id(&self) -> &str {
        &self.tunnel_id
    }

    pub fn is_attached(&self) -> bool {
        self.state.lock().agent.is_some()
    }

    /// Number of in-flight HTTP + WebSocket streams (§3 invariant 3).
    pub fn stream_count(&self) -> usize {
        self.state.lock().stream_table.len()
    }

    /// The current attach's connection id, fixed for its lifetime (§6).
    pub fn connection_id(&self) -> u64 {
        self.state.lock().connection_id
    }

    // -----------------------------------------------------------------
    // Attach
    // -----------------------------------------------------------------

    /// Adopt a newly connected agent socket, displacing whatever was
    /// attached before (§4.6: "attaching while a socket is already present
    /// displaces it"). Rotates `connectionId` from the session's monotonic
    /// clock, resets the stream table, and spawns the reader/writer tasks.
    pub async fn attach_agent(
        self: &Arc<Self>,
        sink: Box<dyn AgentSink>,
        stream: Box<dyn AgentStream>,
        tunnel_url: String,
    ) -> Result<(), StreamError> {
        let new_connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);

        let displaced = {
            let mut state = self.state.lock();
            let previous = state.agent.take();
            let go_away_env = previous.as_ref().map(|_| {
                let msg_seq = state.allocate_msg_seq();
                control::go_away(
                    state.connection_id,
                    msg_seq,
                    state.global_msg_seq.saturating_sub(1),
                    "Replaced by new connection",
                )
            });
            let deferred = self.fail_all_streams(&mut state, StreamError::AgentReconnected);

            state.connection_id = new_connection_id;
            state.stream_table.reset();
            state.global_msg_seq = 0;
            state.go_away.reset();
            state.tunnel_url = tunnel_url.clone();

            previous.map(|agent| (agent, go_away_env.unwrap(), deferred))
        };

        if let Some((old_agent, go_away_env, deferred)) = displaced {
            let _ = old_agent
                .outbound_tx
                .send(OutboundFrame::Binary(go_away_env.encode()))
                .await;
            old_agent.reader_task.abort();
            old_agent.writer_task.abort();
            for action in deferred {
                action.run().await;
            }
        }

        let (outbound_tx, outbound_rx) = mpsc::channel(AGENT_WRITER_CAPACITY);

        let reader_session = Arc::clone(self);
        let reader_task = tokio::spawn(async move {
            run_agent_reader(reader_session, new_connection_id, stream).await;
        })
        .abort_handle();

        let writer_session = Arc::clone(self);
        let writer_task = tokio::spawn(async move {
            run_agent_writer(writer_session, new_connection_id, sink, outbound_rx).await;
        })
        .abort_handle();

        {
            let mut state = self.state.lock();
            state.agent = Some(AgentHandle {
                outbound_tx: outbound_tx.clone(),
                reader_task,
                writer_task,
            });
        }

        let handshake = control::TunnelReady::new(new_connection_id, tunnel_url);
        outbound_tx
            .send(OutboundFrame::Text(handshake.to_json()))
            .await
            .map_err(|_| StreamError::AgentDisconnected)?;

        self.registry
            .mark_status(&self.tunnel_id, TunnelStatus::Online, SystemTime::now())
            .await;
        info!(tunnel_id = %self.tunnel_id, connection_id = new_connection_id, "agent attached");
        Ok(())
    }

    // -----------------------------------------------------------------
    // Public HTTP entry point (§4.3)
    // -----------------------------------------------------------------

    pub async fn serve_http(
        self: &Arc<Self>,
        head: HttpRequestHead,
        has_body: bool,
        request_body: Option<RequestBodyRx>,
    ) -> HttpOutcome {
        let (connection_id, stream_id, headers_rx) = {
            let mut state = self.state.lock();
            if state.agent.is_none() {
                return HttpOutcome::immediate(502, "tunnel offline");
            }
            if state.go_away.draining {
                return HttpOutcome::immediate(502, "tunnel offline");
            }
            if state.stream_table.len() >= self.config.max_concurrent_streams {
                return HttpOutcome::immediate(503, "too many concurrent requests");
            }

            let connection_id = state.connection_id;
            let stream_id = state.stream_table.allocate_id();
            let deadline = self.spawn_deadline(connection_id, stream_id);
            let (slot, headers_rx) = HttpStreamSlot::new(deadline);
            state.stream_table.insert_http(stream_id, slot);
            (connection_id, stream_id, headers_rx)
        };

        self.emit_to_agent(
            connection_id,
            stream_id,
            Body::Http(HttpFrame::RequestInit {
                method: head.method,
                uri: head.uri,
                version: head.version,
                headers: head.headers,
                has_body,
            }),
        )
        .await;

        if let Some(body_rx) = request_body {
            let session = Arc::clone(self);
            tokio::spawn(async move {
                session.pump_request_body(connection_id, stream_id, body_rx).await;
            });
        }

        match headers_rx.await {
            Ok(PendingOutcome::Response { status, headers, body }) => {
                HttpOutcome::Upstream { status, headers, body }
            }
            Ok(PendingOutcome::Failed(err)) => {
                HttpOutcome::immediate(http_stream::status_for(&err), err.to_string())
            }
            Err(_) => HttpOutcome::immediate(502, "tunnel offline"),
        }
    }

    async fn pump_request_body(self: Arc<Self>, connection_id: u64, stream_id: u32, mut body_rx: RequestBodyRx) {
        let mut terminated_cleanly = false;
        while let Some(item) = body_rx.recv().await {
            let body = {
                let mut state = self.state.lock();
                if state.connection_id != connection_id {
                    return;
                }
                let Some(slot) = state.stream_table.http_mut(stream_id) else {
                    return;
                };
                if slot.request_terminated {
                    return;
                }
                match item {
                    RequestBodyItem::Chunk(data) => {
                        let seq = slot.next_request_chunk_seq();
                        Body::Http(HttpFrame::RequestBodyChunk { seq, data, is_last: false })
                    }
                    RequestBodyItem::End => {
                        slot.request_terminated = true;
                        Body::Http(HttpFrame::RequestEnd)
                    }
                    RequestBodyItem::Abort => {
                        slot.request_terminated = true;
                        Body::Http(HttpFrame::RequestAbort {
                            reason: http_stream::reason_for(&StreamError::Cancelled),
                            detail: "public client disconnected".into(),
                        })
                    }
                }
            };
            let is_terminal = matches!(body, Body::Http(HttpFrame::RequestEnd) | Body::Http(HttpFrame::RequestAbort { .. }));
            self.emit_to_agent(connection_id, stream_id, body).await;
            if is_terminal {
                terminated_cleanly = true;
                break;
            }
        }

        if !terminated_cleanly {
            let should_abort = {
                let mut state = self.state.lock();
                if state.connection_id != connection_id {
                    return;
                }
                match state.stream_table.http_mut(stream_id) {
                    Some(slot) if !slot.request_terminated => {
                        slot.request_terminated = true;
                        true
                    }
                    _ => false,
                }
            };
            if should_abort {
                self.emit_to_agent(
                    connection_id,
                    stream_id,
                    Body::Http(HttpFrame::RequestAbort {
                        reason: http_stream::reason_for(&StreamError::Cancelled),
                        detail: "request body stream closed".into(),
                    }),
                )
                .await;
            }
        }
    }

    // -----------------------------------------------------------------
    // Deferred WebSocket upgrade (§4.4)
    // -----------------------------------------------------------------

    pub async fn serve_upgrade(self: &Arc<Self>, head: HttpRequestHead) -> UpgradeDecision {
        let (connection_id, stream_id, waiter) = {
            let mut state = self.state.lock();
            if state.agent.is_none() || state.go_away.draining {
                return UpgradeDecision::Refuse;
            }
            if state.stream_table.len() >= self.config.max_concurrent_streams {
                return UpgradeDecision::Refuse;
            }
            let connection_id = state.connection_id;
            let stream_id = state.stream_table.allocate_id();
            let deadline = self.spawn_deadline(connection_id, stream_id);
            let (slot, waiter) = HttpStreamSlot::for_upgrade(deadline);
            state.stream_table.insert_http(stream_id, slot);
            (connection_id, stream_id, waiter)
        };

        self.emit_to_agent(
            connection_id,
            stream_id,
            Body::Http(HttpFrame::RequestInit {
                method: head.method,
                uri: head.uri,
                version: head.version,
                headers: head.headers,
                has_body: false,
            }),
        )
        .await;

        UpgradeDecision::Accept { stream_id, waiter }
    }

    /// Hand over the real public-side socket once the upgrade has been
    /// confirmed (`UpgradeOutcome::Promoted`). Spawns the relay task and
    /// flushes anything the agent sent while the socket was in flight.
    pub async fn complete_upgrade(self: &Arc<Self>, stream_id: u32, public: Box<dyn PublicWs>) {
        let connection_id = self.state.lock().connection_id;
        let pending_rx = {
            let mut state = self.state.lock();
            state
                .stream_table
                .ws_mut(stream_id)
                .and_then(|slot| slot.take_pending_receiver())
        };
        let Some(outbound_rx) = pending_rx else {
            return;
        };

        let session = Arc::clone(self);
        let handle = tokio::spawn(async move {
            run_ws_relay(session, connection_id, stream_id, public, outbound_rx).await;
        })
        .abort_handle();

        let mut state = self.state.lock();
        match state.stream_table.ws_mut(stream_id) {
            Some(slot) => slot.start_relay(handle),
            None => handle.abort(),
        }
    }

    // -----------------------------------------------------------------
    // Incoming agent frames
    // -----------------------------------------------------------------

    async fn on_agent_frame(self: &Arc<Self>, connection_id: u64, envelope: Envelope) {
        let outcome = {
            let mut state = self.state.lock();
            if state.connection_id != connection_id {
                return;
            }
            match envelope.body {
                Body::Control(frame) => {
                    self.handle_control(&mut state, frame);
                    Ok(None)
                }
                Body::Http(frame) => {
                    if state.go_away.draining && !state.go_away.admits(envelope.msg_seq) {
                        debug!(
                            tunnel_id = %self.tunnel_id,
                            msg_seq = envelope.msg_seq,
                            "dropping HTTP frame received past goAway's last admitted msgSeq"
                        );
                        Ok(None)
                    } else {
                        self.handle_http_from_agent(&mut state, envelope.stream_id, frame)
                    }
                }
                Body::Ws(frame) => {
                    if state.go_away.draining && !state.go_away.admits(envelope.msg_seq) {
                        debug!(
                            tunnel_id = %self.tunnel_id,
                            msg_seq = envelope.msg_seq,
                            "dropping ws frame received past goAway's last admitted msgSeq"
                        );
                        Ok(None)
                    } else {
                        Ok(self.handle_ws_from_agent(&mut state, envelope.stream_id, frame))
                    }
                }
            }
        };

        match outcome {
            Ok(Some(action)) => action.run().await,
            Ok(None) => {}
            Err(err) => {
                warn!(tunnel_id = %self.tunnel_id, error = %err, "protocol error from agent");
                self.disconnect_agent(
                    connection_id,
                    StreamError::AgentDisconnected,
                    Some((1002, "protocol error".into())),
                )
                .await;
            }
        }
    }

    fn handle_control(&self, state: &mut SessionState, frame: ControlFrame) {
        match frame {
            ControlFrame::Ping { data } => {
                if let Some(agent) = &state.agent {
                    let msg_seq = state.allocate_msg_seq();
                    let env = control::pong_for(state.connection_id, msg_seq, data);
                    let _ = agent.outbound_tx.try_send(OutboundFrame::Binary(env.encode()));
                }
            }
            ControlFrame::Pong { .. } => {}
            ControlFrame::Error { code, message } => {
                control::log_incoming_error(&self.tunnel_id, code, &message);
            }
            ControlFrame::GoAway { last_msg_seq, reason } => {
                info!(tunnel_id = %self.tunnel_id, %reason, last_msg_seq, "agent announced goAway");
                state.go_away.note_incoming(last_msg_seq);
            }
            ControlFrame::FlowWindowUpdate { .. } => {
                debug!(tunnel_id = %self.tunnel_id, "ignoring reserved flowWindowUpdate");
            }
        }
    }

    fn handle_http_from_agent(
        &self,
        state: &mut SessionState,
        stream_id: u32,
        frame: HttpFrame,
    ) -> Result<Option<Deferred>, ProtocolError> {
        match frame {
            HttpFrame::ResponseInit { status, headers, has_body, .. } => {
                let is_upgrade = match state.stream_table.http(stream_id) {
                    Some(slot) => slot.pending_upgrade.is_some(),
                    None if state.stream_table.is_http_terminated(stream_id) => {
                        return Err(ProtocolError::FrameAfterTerminal { stream_id });
                    }
                    None => return Ok(None),
                };

                if is_upgrade {
                    let mut slot = state.stream_table.remove_http(stream_id).expect("checked above");
                    let pending = slot.pending_upgrade.take().expect("checked above");
                    if status == 101 {
                        state
                            .stream_table
                            .promote_to_ws(stream_id, WsStreamSlot::pending(WS_OUTBOUND_CAPACITY));
                        Ok(Some(Deferred::ResolveUpgrade(pending.result_tx, UpgradeOutcome::Promoted)))
                    } else {
                        Ok(Some(Deferred::ResolveUpgrade(
                            pending.result_tx,
                            UpgradeOutcome::Rejected {
                                status,
                                detail: format!("upstream responded {status}"),
                            },
                        )))
                    }
                } else {
                    let Some(slot) = state.stream_table.http_mut(stream_id) else {
                        return Ok(None);
                    };
                    if slot.state != HttpStreamState::AwaitingInit {
                        return Ok(None);
                    }
                    slot.state = HttpStreamState::ResponseStreaming;
                    let Some(headers_tx) = slot.headers_tx.take() else {
                        return Ok(None);
                    };
                    let body = if has_body { slot.body_rx.take() } else { None };
                    Ok(Some(Deferred::ResolveHeaders(
                        headers_tx,
                        PendingOutcome::Response { status, headers, body },
                    )))
                }
            }

            HttpFrame::ResponseBodyChunk { seq, data, .. } => {
                let Some(slot) = state.stream_table.http_mut(stream_id) else {
                    if state.stream_table.is_http_terminated(stream_id) {
                        return Err(ProtocolError::FrameAfterTerminal { stream_id });
                    }
                    return Ok(None);
                };
                if slot.state != HttpStreamState::ResponseStreaming {
                    return Ok(None);
                }
                slot.check_response_seq(stream_id, seq)?;
                Ok(Some(Deferred::SendBody(slot.body_tx.clone(), Ok(data))))
            }

            HttpFrame::ResponseEnd => match state.stream_table.remove_http(stream_id) {
                None if state.stream_table.is_http_terminated(stream_id) => {
                    Err(ProtocolError::FrameAfterTerminal { stream_id })
                }
                None => Ok(None),
                Some(mut slot) => {
                    state.stream_table.mark_http_terminated(stream_id);
                    match slot.headers_tx.take() {
                        Some(headers_tx) => Ok(Some(Deferred::ResolveHeaders(
                            headers_tx,
                            PendingOutcome::Failed(StreamError::AgentAborted(
                                "responseEnd before responseInit".into(),
                            )),
                        ))),
                        // Dropping `slot` here closes `body_tx`; the body stream
                        // ends normally (no error) on the public side.
                        None => Ok(None),
                    }
                }
            },

            HttpFrame::ResponseAbort { reason, detail } => match state.stream_table.remove_http(stream_id) {
                None if state.stream_table.is_http_terminated(stream_id) => {
                    Err(ProtocolError::FrameAfterTerminal { stream_id })
                }
                None => Ok(None),
                Some(mut slot) => {
                    state.stream_table.mark_http_terminated(stream_id);
                    let err = StreamError::AgentAborted(format!("{detail} (reason={reason:?})"));
                    match slot.headers_tx.take() {
                        Some(headers_tx) => Ok(Some(Deferred::ResolveHeaders(
                            headers_tx,
                            PendingOutcome::Failed(err),
                        ))),
                        None => Ok(Some(Deferred::SendBody(slot.body_tx.clone(), Err(err)))),
                    }
                }
            },

            HttpFrame::ResponseInterim { .. } | HttpFrame::ResponseTrailers { .. } => {
                debug!(tunnel_id = %self.tunnel_id, stream_id, "dropping reserved response frame variant");
                Ok(None)
            }

            HttpFrame::RequestInit { .. }
            | HttpFrame::RequestBodyChunk { .. }
            | HttpFrame::RequestTrailers { .. }
            | HttpFrame::RequestEnd
            | HttpFrame::RequestAbort { .. } => {
                warn!(tunnel_id = %self.tunnel_id, stream_id, "agent sent a session-direction frame, dropping");
                Ok(None)
            }
        }
    }

    fn handle_ws_from_agent(&self, state: &mut SessionState, stream_id: u32, frame: WsFrame) -> Option<Deferred> {
        use crate::frame::WsOpcode;
        if frame.opcode == WsOpcode::Ping {
            // Auto-answered per the WebSocket spec (§4.4) rather than
            // forwarded to the public side, which never sees the agent's
            // raw ping traffic.
            if let Some(agent) = &state.agent {
                let msg_seq = state.allocate_msg_seq();
                let pong = WsFrame {
                    opcode: WsOpcode::Pong,
                    fin: true,
                    reserved: 0,
                    mask: None,
                    payload: frame.payload.clone(),
                    close_code: None,
                };
                let env = Envelope::new(state.connection_id, stream_id, msg_seq, Body::Ws(pong));
                let _ = agent.outbound_tx.try_send(OutboundFrame::Binary(env.encode()));
            }
            return None;
        }
        let slot = state.stream_table.ws_mut(stream_id)?;
        let out = ws_stream::outbound_from_agent_frame(&frame)?;
        if matches!(out, Outbound::Close { .. }) {
            slot.state = WsStreamState::Closing;
        }
        Some(Deferred::ForwardWs(slot.outbound_tx.clone(), out))
    }

    // -----------------------------------------------------------------
    // Agent disconnect / protocol errors
    // -----------------------------------------------------------------

    async fn disconnect_agent(
        self: &Arc<Self>,
        connection_id: u64,
        stream_reason: StreamError,
        close: Option<(u16, String)>,
    ) {
        let (old_agent, deferred) = {
            let mut state = self.state.lock();
            if state.connection_id != connection_id || state.agent.is_none() {
                return;
            }
            let agent = state.agent.take();
            let deferred = self.fail_all_streams(&mut state, stream_reason);
            (agent, deferred)
        };

        if let Some(agent) = old_agent {
            if let Some((code, reason)) = close {
                let _ = agent.outbound_tx.try_send(OutboundFrame::Close(code, reason));
            }
            agent.reader_task.abort();
            agent.writer_task.abort();
        }

        for action in deferred {
            action.run().await;
        }

        self.registry
            .mark_status(&self.tunnel_id, TunnelStatus::Offline, SystemTime::now())
            .await;
        info!(tunnel_id = %self.tunnel_id, connection_id, "agent detached");
    }

    /// Fail every in-flight stream with `reason`, returning the actions that
    /// must run outside the lock. Leaves the stream table empty.
    fn fail_all_streams(&self, state: &mut SessionState, reason: StreamError) -> Vec<Deferred> {
        let mut deferred = Vec::new();
        for (_, mut slot) in state.stream_table.drain_http() {
            if let Some(pending) = slot.pending_upgrade.take() {
                deferred.push(Deferred::ResolveUpgrade(
                    pending.result_tx,
                    UpgradeOutcome::Failed(reason.clone()),
                ));
            }
            match slot.headers_tx.take() {
                Some(headers_tx) => {
                    deferred.push(Deferred::ResolveHeaders(headers_tx, PendingOutcome::Failed(reason.clone())));
                }
                None => {
                    deferred.push(Deferred::SendBody(slot.body_tx.clone(), Err(reason.clone())));
                }
            }
        }
        for (_, mut slot) in state.stream_table.drain_ws() {
            let _ = slot.outbound_tx.try_send(Outbound::Close {
                code: 1001,
                reason: reason.to_string(),
            });
        }
        deferred
    }

    // -----------------------------------------------------------------
    // Shared helpers
    // -----------------------------------------------------------------

    /// Allocate a `msgSeq` and enqueue one frame to the attached agent.
    /// No-op if the connection has since rotated or no agent is attached.
    async fn emit_to_agent(&self, connection_id: u64, stream_id: u32, body: Body) -> bool {
        let (outbound, env) = {
            let mut state = self.state.lock();
            if state.connection_id != connection_id {
                return false;
            }
            let Some(agent) = &state.agent else {
                return false;
            };
            let outbound = agent.outbound_tx.clone();
            let msg_seq = state.allocate_msg_seq();
            (outbound, Envelope::new(connection_id, stream_id, msg_seq, body))
        };
        outbound.send(OutboundFrame::Binary(env.encode())).await.is_ok()
    }

    fn spawn_deadline(self: &Arc<Self>, connection_id: u64, stream_id: u32) -> AbortHandle {
        let session = Arc::clone(self);
        let timeout = self.config.request_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            session.on_deadline(connection_id, stream_id).await;
        })
        .abort_handle()
    }

    async fn on_deadline(self: Arc<Self>, connection_id: u64, stream_id: u32) {
        let timeout = self.config.request_timeout();
        let action = {
            let mut state = self.state.lock();
            if state.connection_id != connection_id {
                return;
            }
            let Some(mut slot) = state.stream_table.remove_http(stream_id) else {
                return;
            };
            if let Some(pending) = slot.pending_upgrade.take() {
                Deferred::ResolveUpgrade(pending.result_tx, UpgradeOutcome::Failed(StreamError::Timeout(timeout)))
            } else if let Some(headers_tx) = slot.headers_tx.take() {
                Deferred::ResolveHeaders(headers_tx, PendingOutcome::Failed(StreamError::Timeout(timeout)))
            } else {
                Deferred::SendBody(slot.body_tx.clone(), Err(StreamError::Timeout(timeout)))
            }
        };
        action.run().await;
        self.emit_to_agent(
            connection_id,
            stream_id,
            Body::Http(HttpFrame::RequestAbort {
                reason: http_stream::reason_for(&StreamError::Timeout(timeout)),
                detail: "request timeout".into(),
            }),
        )
        .await;
    }

    pub(crate) fn remove_ws_stream(self: &Arc<Self>, stream_id: u32) {
        self.state.lock().stream_table.remove_ws(stream_id);
    }

    // -----------------------------------------------------------------
    // Hibernation (§4.6, §9)
    // -----------------------------------------------------------------

    pub fn snapshot(&self) -> Option<crate::hibernation::SessionSnapshot> {
        let state = self.state.lock();
        state.agent.as_ref()?;
        Some(crate::hibernation::SessionSnapshot {
            connection_id: state.connection_id,
            open_ws_stream_ids: state.stream_table.ws_stream_ids(),
        })
    }

    /// Resume after a host suspend. HTTP streams are never restorable —
    /// anything in flight is resolved as `connectionLost`. A WebSocket
    /// stream survives only if its id is named in the snapshot and the
    /// session's `connectionId` still matches (the agent never reattached
    /// in between).
    pub fn restore(&self, snapshot: &crate::hibernation::SessionSnapshot) {
        let mut state = self.state.lock();
        if state.connection_id != snapshot.connection_id {
            return;
        }

        let stale: Vec<u32> = state
            .stream_table
            .ws_stream_ids()
            .into_iter()
            .filter(|id| !snapshot.open_ws_stream_ids.contains(id))
            .collect();
        for id in stale {
            state.stream_table.remove_ws(id);
        }

        for (_, mut slot) in state.stream_table.drain_http() {
            if let Some(headers_tx) = slot.headers_tx.take() {
                let _ = headers_tx.send(PendingOutcome::Failed(StreamError::AgentDisconnected));
            } else {
                let _ = slot.body_tx.try_send(Err(StreamError::AgentDisconnected));
            }
            if let Some(pending) = slot.pending_upgrade.take() {
                let _ = pending
                    .result_tx
                    .send(UpgradeOutcome::Failed(StreamError::AgentDisconnected));
            }
        }
    }
}

/// An action computed while holding the session lock but that must run
/// after releasing it, because it involves an `.await` (§5: never suspend
/// while holding the lock).
enum Deferred {
    ResolveHeaders(http_stream::HeadersTx, PendingOutcome),
    SendBody(crate::http_stream::ResponseBodyTx, crate::http_stream::BodyItem),
    ResolveUpgrade(oneshot::Sender<UpgradeOutcome>, UpgradeOutcome),
    ForwardWs(mpsc::Sender<Outbound>, Outbound),
}

impl Deferred {
    async fn run(self) {
        match self {
            Deferred::ResolveHeaders(tx, outcome) => {
                let _ = tx.send(outcome);
            }
            Deferred::SendBody(tx, item) => {
                let _ = tx.send(item).await;
            }
            Deferred::ResolveUpgrade(tx, outcome) => {
                let _ = tx.send(outcome);
            }
            Deferred::ForwardWs(tx, out) => {
                let _ = tx.send(out).await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Agent reader/writer tasks (grounded on tunnel/dispatcher.rs, tunnel/writer.rs)
// ---------------------------------------------------------------------------

async fn run_agent_reader(session: Arc<Session>, connection_id: u64, mut stream: Box<dyn AgentStream>) {
    loop {
        match stream.recv().await {
            Some(AgentMessage::Binary(data)) => match Envelope::decode(data) {
                Ok(envelope) => session.on_agent_frame(connection_id, envelope).await,
                Err(err) => {
                    warn!(tunnel_id = %session.tunnel_id, error = %err, "malformed frame from agent");
                    session
                        .disconnect_agent(connection_id, StreamError::AgentDisconnected, Some((1002, "protocol error".into())))
                        .await;
                    return;
                }
            },
            Some(AgentMessage::Close) | None => {
                session
                    .disconnect_agent(connection_id, StreamError::AgentDisconnected, None)
                    .await;
                return;
            }
        }
    }
}

async fn run_agent_writer(
    session: Arc<Session>,
    connection_id: u64,
    mut sink: Box<dyn AgentSink>,
    mut outbound_rx: mpsc::Receiver<OutboundFrame>,
) {
    while let Some(frame) = outbound_rx.recv().await {
        let result = match frame {
            OutboundFrame::Binary(data) => sink.send_binary(data).await,
            OutboundFrame::Text(text) => sink.send_text(text).await,
            OutboundFrame::Close(code, reason) => {
                sink.close(code, reason).await;
                Ok(())
            }
        };
        if result.is_err() {
            session
                .disconnect_agent(connection_id, StreamError::AgentDisconnected, None)
                .await;
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// WebSocket relay task (§4.4)
// ---------------------------------------------------------------------------

async fn run_ws_relay(
    session: Arc<Session>,
    connection_id: u64,
    stream_id: u32,
    mut public: Box<dyn PublicWs>,
    mut outbound_rx: mpsc::Receiver<Outbound>,
) {
    loop {
        tokio::select! {
            msg = public.recv() => {
                match msg {
                    Some(message) => {
                        let is_close = matches!(message, PublicWsMessage::Close(_));
                        if let Some(frame) = ws_stream::agent_frame_from_public_message(&message) {
                            session.emit_to_agent(connection_id, stream_id, Body::Ws(frame)).await;
                        }
                        if is_close {
                            break;
                        }
                    }
                    None => {
                        session
                            .emit_to_agent(connection_id, stream_id, Body::Ws(WsFrame::close(1006, Bytes::new())))
                            .await;
                        break;
                    }
                }
            }
            item = outbound_rx.recv() => {
                match item {
                    Some(Outbound::Text(text)) => { let _ = public.send_text(text).await; }
                    Some(Outbound::Binary(data)) => { let _ = public.send_binary(data).await; }
                    Some(Outbound::Close { code, reason }) => {
                        let _ = public.send_close(code, reason).await;
                        break;
                    }
                    None => break,
                }
            }
        }
    }
    session.remove_ws_stream(stream_id);
}
