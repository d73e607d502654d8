//! Public HTTP/WS surface and agent-attach binding (§6, §9 **[ADDED]**).
//!
//! This is the only module that names `axum` types directly — the library
//! core (`session.rs`, `http_stream.rs`, `ws_stream.rs`) is expressed purely
//! in terms of [`AgentSink`]/[`AgentStream`]/[`PublicWs`], so this adapter's
//! entire job is gluing those traits to a real `axum::extract::ws::WebSocket`
//! and translating `axum::http::Request`/`Response` at the HTTP boundary.
//! Host-based subdomain routing and the registry lookup it depends on are
//! the only pieces of the external front door (§1 Out of scope) this crate
//! implements, and only enough of them to run the standalone binary.

use std::sync::Arc;

use axum::body::Body as AxumBody;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http_body_util::BodyExt;
use tokio::sync::mpsc;
use tracing::warn;

use crate::config::Config;
use crate::error::StreamError;
use crate::frame::HeaderList;
use crate::http_stream::{self, UpgradeOutcome};
use crate::manager::SessionManager;
use crate::registry::TunnelRegistry;
use crate::session::{
    AgentMessage, AgentSink, AgentStream, HttpOutcome, HttpRequestHead, RequestBodyItem,
    RequestBodyRx, UpgradeDecision,
};
use crate::ws_stream::{PublicWs, PublicWsMessage};

/// Depth of the channel feeding a request body from the axum body stream
/// into the session (mirrors `AGENT_WRITER_CAPACITY`'s reasoning in
/// `session.rs`: deep enough to absorb a burst without stalling the reader).
const REQUEST_BODY_CAPACITY: usize = 32;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub registry: Arc<dyn TunnelRegistry>,
    pub manager: Arc<SessionManager>,
}

/// Build the axum router: the agent-attach endpoint plus a host-routed
/// fallback for every public HTTP/WS request (§6).
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/_api/tunnel/connect", get(agent_connect))
        .fallback(public_request)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Agent attach (§4.6, §6)
// ---------------------------------------------------------------------------

/// `GET /_api/tunnel/connect` with an upgrade header (§6). The front door is
/// responsible for authenticating the agent and resolving `tunnelId`; by the
/// time a request reaches the session it carries `X-Tunnel-Id` /
/// `X-Tunnel-Url` as plain headers (§4.6 "Attach").
async fn agent_connect(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(tunnel_id) = header_str(&headers, "x-tunnel-id") else {
        return (StatusCode::BAD_REQUEST, "missing X-Tunnel-Id").into_response();
    };
    let Some(tunnel_url) = header_str(&headers, "x-tunnel-url") else {
        return (StatusCode::BAD_REQUEST, "missing X-Tunnel-Url").into_response();
    };

    let session = state.manager.get_or_create(&tunnel_id);
    ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        let agent_sink: Box<dyn AgentSink> = Box::new(AxumAgentSink(sink));
        let agent_stream: Box<dyn AgentStream> = Box::new(AxumAgentStream(stream));
        if let Err(err) = session.attach_agent(agent_sink, agent_stream, tunnel_url).await {
            warn!(tunnel_id, error = %err, "agent attach failed");
        }
    })
}

struct AxumAgentSink(futures_util::stream::SplitSink<WebSocket, Message>);

#[async_trait]
impl AgentSink for AxumAgentSink {
    async fn send_binary(&mut self, data: Bytes) -> Result<(), StreamError> {
        self.0
            .send(Message::Binary(data))
            .await
            .map_err(|_| StreamError::AgentDisconnected)
    }

    async fn send_text(&mut self, text: String) -> Result<(), StreamError> {
        self.0
            .send(Message::Text(text.into()))
            .await
            .map_err(|_| StreamError::AgentDisconnected)
    }

    async fn close(&mut self, code: u16, reason: String) {
        let _ = self
            .0
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: reason.into(),
            })))
            .await;
    }
}

struct AxumAgentStream(futures_util::stream::SplitStream<WebSocket>);

#[async_trait]
impl AgentStream for AxumAgentStream {
    async fn recv(&mut self) -> Option<AgentMessage> {
        loop {
            match self.0.next().await? {
                Ok(Message::Binary(data)) => return Some(AgentMessage::Binary(data)),
                Ok(Message::Close(_)) => return Some(AgentMessage::Close),
                Ok(Message::Text(_) | Message::Ping(_) | Message::Pong(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Public HTTP / WebSocket surface (§4.3, §4.4, §6)
// ---------------------------------------------------------------------------

/// Single fallback handler for every public request. Host-based routing
/// picks the session (§6: "every request whose host matches the configured
/// tunnel host pattern is routed by subdomain"); an `Upgrade` header sends
/// the request into §4.4 instead of §4.3.
async fn public_request(
    State(state): State<AppState>,
    ws: Option<WebSocketUpgrade>,
    req: Request<AxumBody>,
) -> Response {
    let Some(host) = req
        .headers()
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
    else {
        return (StatusCode::BAD_REQUEST, "missing Host header").into_response();
    };

    let Some(subdomain) = subdomain_from_host(host, &state.config.tunnel_host_pattern) else {
        return (StatusCode::NOT_FOUND, "host does not match tunnel pattern").into_response();
    };

    let Some(record) = state.registry.find_by_subdomain(&subdomain).await else {
        return (StatusCode::NOT_FOUND, "unknown tunnel").into_response();
    };

    let Some(session) = state.manager.get(&record.public_id) else {
        return (StatusCode::BAD_GATEWAY, "tunnel offline").into_response();
    };

    let method = req.method().to_string();
    let uri = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let header_list = collect_headers(req.headers());
    let has_body = request_has_body(req.headers());

    match ws {
        Some(upgrade) => {
            let head = HttpRequestHead {
                method,
                uri,
                version: "HTTP/1.1".into(),
                headers: header_list,
            };
            match session.serve_upgrade(head).await {
                UpgradeDecision::Refuse => {
                    (StatusCode::BAD_GATEWAY, "tunnel offline").into_response()
                }
                UpgradeDecision::Accept { stream_id, waiter } => {
                    let session = Arc::clone(&session);
                    upgrade.on_upgrade(move |socket| async move {
                        finish_upgrade(session, stream_id, waiter, socket).await;
                    })
                }
            }
        }
        None => {
            let body_rx = if has_body {
                Some(spawn_request_body_pump(req.into_body()))
            } else {
                None
            };
            let head = HttpRequestHead {
                method,
                uri,
                version: "HTTP/1.1".into(),
                headers: header_list,
            };
            match session.serve_http(head, has_body, body_rx).await {
                HttpOutcome::Immediate { status, body } => plain_response(status, body),
                HttpOutcome::Upstream { status, headers, body } => {
                    upstream_response(status, headers, body)
                }
            }
        }
    }
}

/// Drive the public side of a deferred upgrade (§4.4) once the agent has
/// decided whether to accept it and axum has handed over the real socket.
async fn finish_upgrade(
    session: Arc<crate::session::Session>,
    stream_id: u32,
    waiter: tokio::sync::oneshot::Receiver<UpgradeOutcome>,
    mut socket: WebSocket,
) {
    match waiter.await {
        Ok(UpgradeOutcome::Promoted) => {
            session
                .complete_upgrade(stream_id, Box::new(AxumPublicWs(socket)))
                .await;
        }
        Ok(UpgradeOutcome::Rejected { status, detail }) => {
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: 1002,
                    reason: format!("upstream responded {status}: {detail}").into(),
                })))
                .await;
        }
        Ok(UpgradeOutcome::Failed(err)) => {
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: 1011,
                    reason: err.to_string().into(),
                })))
                .await;
        }
        Err(_) => {
            let _ = socket.close().await;
        }
    }
}

struct AxumPublicWs(WebSocket);

#[async_trait]
impl PublicWs for AxumPublicWs {
    async fn send_text(&mut self, text: String) -> Result<(), StreamError> {
        self.0
            .send(Message::Text(text.into()))
            .await
            .map_err(|_| StreamError::Cancelled)
    }

    async fn send_binary(&mut self, data: Bytes) -> Result<(), StreamError> {
        self.0
            .send(Message::Binary(data))
            .await
            .map_err(|_| StreamError::Cancelled)
    }

    async fn send_close(&mut self, code: u16, reason: String) -> Result<(), StreamError> {
        self.0
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: reason.into(),
            })))
            .await
            .map_err(|_| StreamError::Cancelled)
    }

    async fn recv(&mut self) -> Option<PublicWsMessage> {
        loop {
            match self.0.recv().await? {
                Ok(Message::Text(text)) => return Some(PublicWsMessage::Text(text.to_string())),
                Ok(Message::Binary(data)) => return Some(PublicWsMessage::Binary(data)),
                Ok(Message::Close(frame)) => {
                    return Some(PublicWsMessage::Close(
                        frame.map(|f| (f.code, f.reason.to_string())),
                    ))
                }
                Ok(Message::Ping(data)) => return Some(PublicWsMessage::Ping(data)),
                Ok(Message::Pong(data)) => return Some(PublicWsMessage::Pong(data)),
                Err(_) => return None,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Request/response plumbing
// ---------------------------------------------------------------------------

fn spawn_request_body_pump(body: AxumBody) -> RequestBodyRx {
    let (tx, rx) = mpsc::channel(REQUEST_BODY_CAPACITY);
    tokio::spawn(async move {
        let mut body = body;
        loop {
            match body.frame().await {
                Some(Ok(frame)) => {
                    if let Some(data) = frame.data_ref() {
                        if tx.send(RequestBodyItem::Chunk(data.clone())).await.is_err() {
                            return;
                        }
                    }
                }
                Some(Err(_)) => {
                    let _ = tx.send(RequestBodyItem::Abort).await;
                    return;
                }
                None => {
                    let _ = tx.send(RequestBodyItem::End).await;
                    return;
                }
            }
        }
    });
    rx
}

fn request_has_body(headers: &HeaderMap) -> bool {
    let has_content_length = headers
        .get(axum::http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(|len| len > 0)
        .unwrap_or(false);
    has_content_length || headers.contains_key(axum::http::header::TRANSFER_ENCODING)
}

fn collect_headers(headers: &HeaderMap) -> HeaderList {
    headers
        .iter()
        .map(|(name, value)| (name.as_str().to_string(), Bytes::copy_from_slice(value.as_bytes())))
        .collect()
}

fn plain_response(status: u16, body: String) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, body).into_response()
}

fn upstream_response(
    status: u16,
    headers: HeaderList,
    body: Option<crate::http_stream::ResponseBodyRx>,
) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    for (name, value) in headers {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_bytes(&value),
        ) else {
            continue;
        };
        builder = builder.header(name, value);
    }
    let body = match body {
        Some(rx) => AxumBody::new(http_stream::response_body(rx)),
        None => AxumBody::empty(),
    };
    match builder.body(body) {
        Ok(response) => response,
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "bad upstream response").into_response(),
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name)?.to_str().ok().map(str::to_string)
}

/// Extract the subdomain label from `host` given a `*.<domain>` pattern
/// (§6 `tunnelHostPattern`). `None` if `host` doesn't match the pattern at
/// all (e.g. a request to the apex domain or an unrelated host).
fn subdomain_from_host(host: &str, pattern: &str) -> Option<String> {
    let base = pattern.strip_prefix("*.")?;
    let host = host.split(':').next().unwrap_or(host);
    let suffix = format!(".{base}");
    let label = host.strip_suffix(&suffix)?;
    if label.is_empty() || label.contains('.') {
        return None;
    }
    Some(label.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subdomain_from_host_extracts_the_leading_label() {
        assert_eq!(
            subdomain_from_host("crimson-otter.tunnel.io", "*.tunnel.io"),
            Some("crimson-otter".to_string())
        );
    }

    #[test]
    fn subdomain_from_host_ignores_a_port_suffix() {
        assert_eq!(
            subdomain_from_host("crimson-otter.tunnel.io:8443", "*.tunnel.io"),
            Some("crimson-otter".to_string())
        );
    }

    #[test]
    fn subdomain_from_host_rejects_the_apex_domain() {
        assert_eq!(subdomain_from_host("tunnel.io", "*.tunnel.io"), None);
    }

    #[test]
    fn subdomain_from_host_rejects_nested_labels() {
        assert_eq!(
            subdomain_from_host("a.b.tunnel.io", "*.tunnel.io"),
            None
        );
    }

    #[test]
    fn subdomain_from_host_rejects_unrelated_hosts() {
        assert_eq!(subdomain_from_host("example.com", "*.tunnel.io"), None);
    }
}
