//! End-to-end scenario tests against the public `Session` API (spec §8's six
//! concrete scenarios), driven with an in-memory fake agent socket and fake
//! `PublicWs` so nothing here touches a real network socket.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use dotunnel_session::config::Config;
use dotunnel_session::error::StreamError;
use dotunnel_session::frame::{AbortReason, Body, ControlFrame, Envelope, HttpFrame, WsFrame, WsOpcode};
use dotunnel_session::http_stream::UpgradeOutcome;
use dotunnel_session::registry::NullRegistry;
use dotunnel_session::session::{
    AgentMessage, AgentSink, AgentStream, HttpOutcome, HttpRequestHead, RequestBodyItem, Session,
    UpgradeDecision,
};
use dotunnel_session::ws_stream::{PublicWs, PublicWsMessage};

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

enum AgentOut {
    Binary(Bytes),
    Text(String),
    Close(u16, String),
}

struct FakeAgentSink(mpsc::Sender<AgentOut>);

#[async_trait]
impl AgentSink for FakeAgentSink {
    async fn send_binary(&mut self, data: Bytes) -> Result<(), StreamError> {
        self.0
            .send(AgentOut::Binary(data))
            .await
            .map_err(|_| StreamError::AgentDisconnected)
    }

    async fn send_text(&mut self, text: String) -> Result<(), StreamError> {
        self.0
            .send(AgentOut::Text(text))
            .await
            .map_err(|_| StreamError::AgentDisconnected)
    }

    async fn close(&mut self, code: u16, reason: String) {
        let _ = self.0.send(AgentOut::Close(code, reason)).await;
    }
}

struct FakeAgentStream(mpsc::Receiver<AgentMessage>);

#[async_trait]
impl AgentStream for FakeAgentStream {
    async fn recv(&mut self) -> Option<AgentMessage> {
        self.0.recv().await
    }
}

enum PublicOutEvent {
    Text(String),
    #[allow(dead_code)]
    Binary(Bytes),
    Close(u16, #[allow(dead_code)] String),
}

struct FakePublicWs {
    incoming: mpsc::Receiver<PublicWsMessage>,
    outgoing: mpsc::Sender<PublicOutEvent>,
}

#[async_trait]
impl PublicWs for FakePublicWs {
    async fn send_text(&mut self, text: String) -> Result<(), StreamError> {
        let _ = self.outgoing.send(PublicOutEvent::Text(text)).await;
        Ok(())
    }

    async fn send_binary(&mut self, data: Bytes) -> Result<(), StreamError> {
        let _ = self.outgoing.send(PublicOutEvent::Binary(data)).await;
        Ok(())
    }

    async fn send_close(&mut self, code: u16, reason: String) -> Result<(), StreamError> {
        let _ = self.outgoing.send(PublicOutEvent::Close(code, reason)).await;
        Ok(())
    }

    async fn recv(&mut self) -> Option<PublicWsMessage> {
        self.incoming.recv().await
    }
}

struct AttachedAgent {
    out_rx: mpsc::Receiver<AgentOut>,
    in_tx: mpsc::Sender<AgentMessage>,
}

async fn attach(session: &Arc<Session>, tunnel_url: &str) -> AttachedAgent {
    let (out_tx, out_rx) = mpsc::channel(64);
    let (in_tx, in_rx) = mpsc::channel(64);
    session
        .attach_agent(
            Box::new(FakeAgentSink(out_tx)),
            Box::new(FakeAgentStream(in_rx)),
            tunnel_url.to_string(),
        )
        .await
        .unwrap();
    AttachedAgent { out_rx, in_tx }
}

async fn expect_handshake(out_rx: &mut mpsc::Receiver<AgentOut>) -> String {
    match out_rx.recv().await.expect("handshake frame") {
        AgentOut::Text(json) => json,
        _ => panic!("expected a text handshake frame"),
    }
}

async fn next_envelope(out_rx: &mut mpsc::Receiver<AgentOut>) -> Envelope {
    match out_rx.recv().await.expect("agent frame") {
        AgentOut::Binary(data) => Envelope::decode(data).expect("valid envelope"),
        _ => panic!("expected a binary envelope"),
    }
}

async fn send_agent_frame(in_tx: &mpsc::Sender<AgentMessage>, env: Envelope) {
    in_tx.send(AgentMessage::Binary(env.encode())).await.unwrap();
}

fn head(method: &str, uri: &str) -> HttpRequestHead {
    HttpRequestHead {
        method: method.into(),
        uri: uri.into(),
        version: "HTTP/1.1".into(),
        headers: vec![],
    }
}

fn test_session(tunnel_id: &str) -> Arc<Session> {
    Session::new(tunnel_id, Config::for_test(), Arc::new(NullRegistry))
}

// ---------------------------------------------------------------------------
// Scenario 1: happy HTTP (spec §8 scenario 1)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn happy_http_roundtrip() {
    let session = test_session("t-happy");
    let mut agent = attach(&session, "https://crimson-otter.tunnel.io").await;
    let _handshake = expect_handshake(&mut agent.out_rx).await;

    let session2 = Arc::clone(&session);
    let serve = tokio::spawn(async move { session2.serve_http(head("GET", "/hello"), false, None).await });

    let init = next_envelope(&mut agent.out_rx).await;
    let (connection_id, stream_id) = (init.connection_id, init.stream_id);
    match init.body {
        Body::Http(HttpFrame::RequestInit { has_body, method, .. }) => {
            assert!(!has_body);
            assert_eq!(method, "GET");
        }
        _ => panic!("expected requestInit"),
    }

    send_agent_frame(
        &agent.in_tx,
        Envelope::new(
            connection_id,
            stream_id,
            0,
            Body::Http(HttpFrame::ResponseInit {
                status: 200,
                headers: vec![("content-type".into(), Bytes::from_static(b"text/plain"))],
                has_body: true,
                content_length: 0,
            }),
        ),
    )
    .await;
    send_agent_frame(
        &agent.in_tx,
        Envelope::new(
            connection_id,
            stream_id,
            1,
            Body::Http(HttpFrame::ResponseBodyChunk {
                seq: 0,
                data: Bytes::from_static(b"Hi"),
                is_last: true,
            }),
        ),
    )
    .await;
    send_agent_frame(
        &agent.in_tx,
        Envelope::new(connection_id, stream_id, 2, Body::Http(HttpFrame::ResponseEnd)),
    )
    .await;

    match serve.await.unwrap() {
        HttpOutcome::Upstream { status, body, .. } => {
            assert_eq!(status, 200);
            let mut body = body.expect("response carries a body");
            let mut collected = Vec::new();
            while let Some(item) = body.recv().await {
                collected.extend_from_slice(&item.unwrap());
            }
            assert_eq!(collected, b"Hi");
        }
        _ => panic!("expected an upstream response"),
    }

    assert_eq!(session.stream_count(), 0);
}

// ---------------------------------------------------------------------------
// Scenario 2: streaming upload (spec §8 scenario 2)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn streaming_upload_emits_ordered_chunks_then_end() {
    let session = test_session("t-upload");
    let mut agent = attach(&session, "https://foo.tunnel.io").await;
    let _ = expect_handshake(&mut agent.out_rx).await;

    let (body_tx, body_rx) = mpsc::channel(8);
    let session2 = Arc::clone(&session);
    let serve = tokio::spawn(async move { session2.serve_http(head("POST", "/up"), true, Some(body_rx)).await });

    let init = next_envelope(&mut agent.out_rx).await;
    let (connection_id, stream_id) = (init.connection_id, init.stream_id);
    match init.body {
        Body::Http(HttpFrame::RequestInit { has_body, .. }) => assert!(has_body),
        _ => panic!("expected requestInit"),
    }

    body_tx.send(RequestBodyItem::Chunk(Bytes::from_static(b"ab"))).await.unwrap();
    body_tx.send(RequestBodyItem::Chunk(Bytes::from_static(b"cd"))).await.unwrap();
    body_tx.send(RequestBodyItem::Chunk(Bytes::from_static(b"ef"))).await.unwrap();
    body_tx.send(RequestBodyItem::End).await.unwrap();

    for expected_seq in 0..3u32 {
        let env = next_envelope(&mut agent.out_rx).await;
        match env.body {
            Body::Http(HttpFrame::RequestBodyChunk { seq, is_last, .. }) => {
                assert_eq!(seq, expected_seq);
                assert!(!is_last);
            }
            _ => panic!("expected requestBodyChunk"),
        }
    }
    let end = next_envelope(&mut agent.out_rx).await;
    assert!(matches!(end.body, Body::Http(HttpFrame::RequestEnd)));

    send_agent_frame(
        &agent.in_tx,
        Envelope::new(
            connection_id,
            stream_id,
            10,
            Body::Http(HttpFrame::ResponseInit {
                status: 204,
                headers: vec![],
                has_body: false,
                content_length: 0,
            }),
        ),
    )
    .await;
    send_agent_frame(
        &agent.in_tx,
        Envelope::new(connection_id, stream_id, 11, Body::Http(HttpFrame::ResponseEnd)),
    )
    .await;

    match serve.await.unwrap() {
        HttpOutcome::Upstream { status, .. } => assert_eq!(status, 204),
        _ => panic!("expected an upstream response"),
    }
    assert_eq!(session.stream_count(), 0);
}

// ---------------------------------------------------------------------------
// Scenario 3: deadline (spec §8 scenario 3)
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn deadline_aborts_request_and_drops_late_response() {
    let session = test_session("t-deadline");
    let mut agent = attach(&session, "https://foo.tunnel.io").await;
    let _ = expect_handshake(&mut agent.out_rx).await;

    let session2 = Arc::clone(&session);
    let serve = tokio::spawn(async move { session2.serve_http(head("GET", "/slow"), false, None).await });

    let init = next_envelope(&mut agent.out_rx).await;
    let (connection_id, stream_id) = (init.connection_id, init.stream_id);

    tokio::time::advance(Duration::from_secs(31)).await;

    let abort = next_envelope(&mut agent.out_rx).await;
    match abort.body {
        Body::Http(HttpFrame::RequestAbort { reason, .. }) => assert_eq!(reason, AbortReason::Timeout),
        _ => panic!("expected requestAbort(timeout)"),
    }

    match serve.await.unwrap() {
        HttpOutcome::Immediate { status, .. } => assert_eq!(status, 504),
        _ => panic!("expected an immediate timeout response"),
    }

    // A responseInit arriving after the deadline is dropped, not a crash.
    send_agent_frame(
        &agent.in_tx,
        Envelope::new(
            connection_id,
            stream_id,
            99,
            Body::Http(HttpFrame::ResponseInit {
                status: 200,
                headers: vec![],
                has_body: false,
                content_length: 0,
            }),
        ),
    )
    .await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(session.stream_count(), 0);
}

// ---------------------------------------------------------------------------
// Scenario 4: WebSocket upgrade accepted (spec §8 scenario 4)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn websocket_upgrade_accepted_relays_both_directions() {
    let session = test_session("t-ws-ok");
    let mut agent = attach(&session, "https://foo.tunnel.io").await;
    let _ = expect_handshake(&mut agent.out_rx).await;

    let decision = session.serve_upgrade(head("GET", "/ws")).await;
    let (stream_id, waiter) = match decision {
        UpgradeDecision::Accept { stream_id, waiter } => (stream_id, waiter),
        UpgradeDecision::Refuse => panic!("expected the upgrade to be accepted"),
    };

    let init = next_envelope(&mut agent.out_rx).await;
    let connection_id = init.connection_id;
    match init.body {
        Body::Http(HttpFrame::RequestInit { has_body, .. }) => assert!(!has_body),
        _ => panic!("expected requestInit"),
    }

    send_agent_frame(
        &agent.in_tx,
        Envelope::new(
            connection_id,
            stream_id,
            1,
            Body::Http(HttpFrame::ResponseInit {
                status: 101,
                headers: vec![],
                has_body: false,
                content_length: 0,
            }),
        ),
    )
    .await;

    match waiter.await.unwrap() {
        UpgradeOutcome::Promoted => {}
        _ => panic!("expected the stream to promote"),
    }

    let (pub_in_tx, pub_in_rx) = mpsc::channel(8);
    let (pub_out_tx, mut pub_out_rx) = mpsc::channel(8);
    session
        .complete_upgrade(
            stream_id,
            Box::new(FakePublicWs {
                incoming: pub_in_rx,
                outgoing: pub_out_tx,
            }),
        )
        .await;

    pub_in_tx.send(PublicWsMessage::Text("ping".into())).await.unwrap();
    let forwarded = next_envelope(&mut agent.out_rx).await;
    match forwarded.body {
        Body::Ws(frame) => {
            assert_eq!(frame.opcode, WsOpcode::Text);
            assert_eq!(&frame.payload[..], b"ping");
        }
        _ => panic!("expected a ws text frame toward the agent"),
    }

    send_agent_frame(
        &agent.in_tx,
        Envelope::new(
            connection_id,
            stream_id,
            2,
            Body::Ws(WsFrame::text(Bytes::from_static(b"pong"))),
        ),
    )
    .await;
    match pub_out_rx.recv().await.unwrap() {
        PublicOutEvent::Text(text) => assert_eq!(text, "pong"),
        _ => panic!("expected a text event toward the public client"),
    }

    pub_in_tx
        .send(PublicWsMessage::Close(Some((1000, "bye".into()))))
        .await
        .unwrap();
    let close_env = next_envelope(&mut agent.out_rx).await;
    match close_env.body {
        Body::Ws(frame) => {
            assert_eq!(frame.opcode, WsOpcode::Close);
            assert_eq!(frame.close_code, Some(1000));
        }
        _ => panic!("expected a ws close frame toward the agent"),
    }

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(session.stream_count(), 0);
}

// ---------------------------------------------------------------------------
// Scenario 5: WebSocket upgrade rejected (spec §8 scenario 5)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn websocket_upgrade_rejected_reports_upstream_status() {
    let session = test_session("t-ws-reject");
    let mut agent = attach(&session, "https://foo.tunnel.io").await;
    let _ = expect_handshake(&mut agent.out_rx).await;

    let decision = session.serve_upgrade(head("GET", "/ws")).await;
    let (stream_id, waiter) = match decision {
        UpgradeDecision::Accept { stream_id, waiter } => (stream_id, waiter),
        UpgradeDecision::Refuse => panic!("expected the upgrade to be accepted"),
    };
    let init = next_envelope(&mut agent.out_rx).await;
    let connection_id = init.connection_id;

    send_agent_frame(
        &agent.in_tx,
        Envelope::new(
            connection_id,
            stream_id,
            1,
            Body::Http(HttpFrame::ResponseInit {
                status: 403,
                headers: vec![],
                has_body: false,
                content_length: 0,
            }),
        ),
    )
    .await;

    match waiter.await.unwrap() {
        UpgradeOutcome::Rejected { status, detail } => {
            assert_eq!(status, 403);
            assert!(detail.contains("403"));
        }
        _ => panic!("expected the upgrade to be rejected"),
    }
    assert_eq!(session.stream_count(), 0);
}

// ---------------------------------------------------------------------------
// Scenario 6: agent reconnect during traffic (spec §8 scenario 6)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn agent_reconnect_fails_in_flight_streams_and_resets_counters() {
    let session = test_session("t-reconnect");
    let mut agent1 = attach(&session, "https://foo.tunnel.io").await;
    let _ = expect_handshake(&mut agent1.out_rx).await;
    let first_connection_id = session.connection_id();

    let s1 = Arc::clone(&session);
    let s2 = Arc::clone(&session);
    let serve_a = tokio::spawn(async move { s1.serve_http(head("GET", "/a"), false, None).await });
    let serve_b = tokio::spawn(async move { s2.serve_http(head("GET", "/b"), false, None).await });

    let _init_a = next_envelope(&mut agent1.out_rx).await;
    let _init_b = next_envelope(&mut agent1.out_rx).await;

    // A new agent attach displaces the old socket mid-flight.
    let mut agent2 = attach(&session, "https://foo.tunnel.io").await;

    let go_away = next_envelope(&mut agent1.out_rx).await;
    match go_away.body {
        Body::Control(ControlFrame::GoAway { reason, .. }) => {
            assert_eq!(reason, "Replaced by new connection");
        }
        _ => panic!("expected a goAway frame on the displaced socket"),
    }

    for serve in [serve_a, serve_b] {
        match serve.await.unwrap() {
            HttpOutcome::Immediate { status, body } => {
                assert_eq!(status, 502);
                assert!(body.contains("reconnected"));
            }
            _ => panic!("expected both in-flight requests to be displaced"),
        }
    }

    let handshake_json = expect_handshake(&mut agent2.out_rx).await;
    assert!(handshake_json.contains("tunnel_ready"));
    assert_eq!(session.stream_count(), 0);

    let s3 = Arc::clone(&session);
    let serve_c = tokio::spawn(async move { s3.serve_http(head("GET", "/c"), false, None).await });
    let init_c = next_envelope(&mut agent2.out_rx).await;
    assert_eq!(init_c.stream_id, 1);
    assert_eq!(init_c.msg_seq, 0);
    assert_ne!(init_c.connection_id, first_connection_id);

    send_agent_frame(
        &agent2.in_tx,
        Envelope::new(
            init_c.connection_id,
            init_c.stream_id,
            1,
            Body::Http(HttpFrame::ResponseInit {
                status: 200,
                headers: vec![],
                has_body: false,
                content_length: 0,
            }),
        ),
    )
    .await;
    send_agent_frame(
        &agent2.in_tx,
        Envelope::new(init_c.connection_id, init_c.stream_id, 2, Body::Http(HttpFrame::ResponseEnd)),
    )
    .await;
    match serve_c.await.unwrap() {
        HttpOutcome::Upstream { status, .. } => assert_eq!(status, 200),
        _ => panic!("expected the new agent's request to complete"),
    }
}

// ---------------------------------------------------------------------------
// Control channel: agent ping is answered promptly (spec §4.5)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn agent_ping_is_answered_with_pong() {
    let session = test_session("t-ping");
    let mut agent = attach(&session, "https://foo.tunnel.io").await;
    let _ = expect_handshake(&mut agent.out_rx).await;
    let connection_id = session.connection_id();

    send_agent_frame(
        &agent.in_tx,
        Envelope::control(connection_id, 0, ControlFrame::Ping { data: Bytes::from_static(b"abc") }),
    )
    .await;

    let pong = next_envelope(&mut agent.out_rx).await;
    match pong.body {
        Body::Control(ControlFrame::Pong { data }) => assert_eq!(&data[..], b"abc"),
        _ => panic!("expected a pong reply"),
    }
}

// ---------------------------------------------------------------------------
// §4.3: a frame arriving after responseEnd/responseAbort is a protocol error
// ---------------------------------------------------------------------------

#[tokio::test]
async fn response_frame_after_response_end_closes_agent_with_protocol_error() {
    let session = test_session("t-after-terminal");
    let mut agent = attach(&session, "https://violet-heron.tunnel.io").await;
    let _handshake = expect_handshake(&mut agent.out_rx).await;

    let session2 = Arc::clone(&session);
    let serve = tokio::spawn(async move { session2.serve_http(head("GET", "/hello"), false, None).await });

    let init = next_envelope(&mut agent.out_rx).await;
    let (connection_id, stream_id) = (init.connection_id, init.stream_id);

    send_agent_frame(
        &agent.in_tx,
        Envelope::new(
            connection_id,
            stream_id,
            0,
            Body::Http(HttpFrame::ResponseInit {
                status: 200,
                headers: vec![],
                has_body: true,
                content_length: 0,
            }),
        ),
    )
    .await;
    send_agent_frame(
        &agent.in_tx,
        Envelope::new(connection_id, stream_id, 1, Body::Http(HttpFrame::ResponseEnd)),
    )
    .await;

    match serve.await.unwrap() {
        HttpOutcome::Upstream { status, .. } => assert_eq!(status, 200),
        _ => panic!("expected an upstream response"),
    }

    // A late chunk for the same, now-terminated stream must be rejected as a
    // protocol error rather than silently dropped (§4.3), closing the agent
    // socket.
    send_agent_frame(
        &agent.in_tx,
        Envelope::new(
            connection_id,
            stream_id,
            2,
            Body::Http(HttpFrame::ResponseBodyChunk {
                seq: 0,
                data: Bytes::from_static(b"late"),
                is_last: true,
            }),
        ),
    )
    .await;

    loop {
        match agent.out_rx.recv().await.expect("agent socket closed") {
            AgentOut::Close(code, _) => {
                assert_eq!(code, 1002);
                break;
            }
            AgentOut::Binary(_) | AgentOut::Text(_) => continue,
        }
    }
}
