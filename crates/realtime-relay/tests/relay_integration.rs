//! End-to-end tests: browser client ↔ relay ↔ fake upstream.
//!
//! Every test runs the real accept loop on an ephemeral port and points it at
//! an in-process upstream built on tokio-tungstenite.  The fake upstream
//! records what it observes (connections, frames, pings, closes) on a channel
//! so tests can assert on exact upstream traffic.
//!
//! Timings are shortened through `RelayConfig` (settle delay, reconnect
//! backoff) so the suite runs in a few seconds of wall-clock time.

use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{accept_hdr_async, connect_async, MaybeTlsStream, WebSocketStream};

use realtime_relay::domain::{Credential, RelayConfig, UpstreamConfig};
use realtime_relay::infrastructure::{serve, StaticCredentialProvider};

const STEP: Duration = Duration::from_secs(5);

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ── Fake upstream ─────────────────────────────────────────────────────────────

#[derive(Debug)]
enum Observed {
    Connected { conn: usize, api_key: Option<String> },
    Frame { conn: usize, value: Value },
    Ping { conn: usize },
    Closed { conn: usize, code: Option<u16> },
}

#[derive(Clone, Default)]
struct Script {
    /// Close connection `.0` with code `.2` this long (`.1`) after it opens.
    close_after: Option<(usize, Duration, u16)>,
    /// Frames sent back whenever a `session.update` arrives.
    on_session_update: Vec<String>,
}

struct FakeUpstream {
    addr: SocketAddr,
    observed: mpsc::UnboundedReceiver<Observed>,
}

impl FakeUpstream {
    async fn next(&mut self) -> Observed {
        timeout(STEP, self.observed.recv())
            .await
            .expect("fake upstream observed nothing in time")
            .expect("fake upstream stopped")
    }

    /// Collects frame types of connection `conn` until one of type `last`.
    async fn frames_until(&mut self, conn: usize, last: &str) -> Vec<Value> {
        let mut frames = Vec::new();
        loop {
            if let Observed::Frame { conn: c, value } = self.next().await {
                if c == conn {
                    let done = value["type"] == last;
                    frames.push(value);
                    if done {
                        return frames;
                    }
                }
            }
        }
    }

    /// Whether a connection with index `conn` shows up within `window`.
    async fn sees_connection_within(&mut self, conn: usize, window: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + window;
        while let Ok(Some(observed)) =
            tokio::time::timeout_at(deadline, self.observed.recv()).await
        {
            if matches!(observed, Observed::Connected { conn: c, .. } if c == conn) {
                return true;
            }
        }
        false
    }
}

async fn spawn_fake_upstream(script: Script) -> FakeUpstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, observed) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut next_conn = 0;
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_upstream_connection(
                stream,
                next_conn,
                script.clone(),
                tx.clone(),
            ));
            next_conn += 1;
        }
    });

    FakeUpstream { addr, observed }
}

async fn serve_upstream_connection(
    stream: TcpStream,
    conn: usize,
    script: Script,
    tx: mpsc::UnboundedSender<Observed>,
) {
    let mut api_key = None;
    let handshake = accept_hdr_async(
        stream,
        |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            api_key = request
                .headers()
                .get("api-key")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            Ok(response)
        },
    )
    .await;
    let Ok(ws) = handshake else {
        return;
    };
    let _ = tx.send(Observed::Connected { conn, api_key });

    let (mut write, mut read) = ws.split();
    let close_at = script
        .close_after
        .filter(|(target, _, _)| *target == conn)
        .map(|(_, after, code)| (tokio::time::Instant::now() + after, code));

    loop {
        tokio::select! {
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let value: Value = serde_json::from_str(&text).unwrap();
                    if value["type"] == "session.update" {
                        for reply in &script.on_session_update {
                            let _ = write.send(Message::Text(reply.clone())).await;
                        }
                    }
                    let _ = tx.send(Observed::Frame { conn, value });
                }
                Some(Ok(Message::Ping(_))) => {
                    let _ = tx.send(Observed::Ping { conn });
                }
                Some(Ok(Message::Close(frame))) => {
                    let code = frame.map(|f| u16::from(f.code));
                    let _ = tx.send(Observed::Closed { conn, code });
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => {
                    let _ = tx.send(Observed::Closed { conn, code: None });
                    return;
                }
            },
            () = sleep_until(close_at.map(|(at, _)| at)) => {
                let code = close_at.map_or(1000, |(_, code)| code);
                let frame = CloseFrame {
                    code: CloseCode::from(code),
                    reason: "server closing".into(),
                };
                let _ = write.send(Message::Close(Some(frame))).await;
                return;
            }
        }
    }
}

async fn sleep_until(at: Option<tokio::time::Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

// ── Relay and client helpers ──────────────────────────────────────────────────

fn relay_config(upstream_addr: SocketAddr) -> RelayConfig {
    let upstream = UpstreamConfig::from_parts(
        &format!("ws://{upstream_addr}/openai/realtime"),
        "2024-10-01-preview",
        "gpt-4o-realtime-preview",
        Credential::new("test-key"),
    )
    .unwrap();
    let mut config = RelayConfig::new(upstream);
    config.link.settle_delay = Duration::from_millis(100);
    config.link.reconnect_delay = Duration::from_millis(50);
    config.link.connect_timeout = Duration::from_secs(2);
    config
}

async fn spawn_relay(config: RelayConfig) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let credentials = Arc::new(StaticCredentialProvider::new(
        config.upstream.credential.clone(),
    ));
    let running = Arc::new(AtomicBool::new(true));
    tokio::spawn(serve(listener, Arc::new(config), credentials, running));
    addr
}

async fn connect_client(relay: SocketAddr) -> Client {
    let (client, _) = connect_async(format!("ws://{relay}/api/ws-proxy"))
        .await
        .unwrap();
    client
}

async fn send_json(client: &mut Client, value: Value) {
    client.send(Message::Text(value.to_string())).await.unwrap();
}

/// Next text frame from the relay, as JSON.  Panics on close or timeout.
async fn next_json(client: &mut Client) -> Value {
    timeout(STEP, async {
        loop {
            match client.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(Message::Close(frame))) => panic!("relay closed the client: {frame:?}"),
                Some(Ok(_)) => {}
                other => panic!("client socket ended: {other:?}"),
            }
        }
    })
    .await
    .expect("no frame from relay in time")
}

/// Reads everything until the relay closes the client socket.
async fn frames_until_close(client: &mut Client) -> (Vec<Value>, Option<u16>) {
    timeout(STEP, async {
        let mut frames = Vec::new();
        loop {
            match client.next().await {
                Some(Ok(Message::Text(text))) => frames.push(serde_json::from_str(&text).unwrap()),
                Some(Ok(Message::Close(frame))) => {
                    return (frames, frame.map(|f| u16::from(f.code)))
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => return (frames, None),
            }
        }
    })
    .await
    .expect("relay never closed the client")
}

fn types(frames: &[Value]) -> Vec<String> {
    frames
        .iter()
        .map(|f| f["type"].as_str().unwrap_or_default().to_string())
        .collect()
}

fn unreachable_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_audio_sent_before_ready_is_delivered_in_order_after_setup() {
    // Arrange
    let mut upstream = spawn_fake_upstream(Script::default()).await;
    let mut config = relay_config(upstream.addr);
    config.link.settle_delay = Duration::from_millis(300);
    let relay = spawn_relay(config).await;
    let mut client = connect_client(relay).await;

    // Act: the whole recording arrives before the link can be ready.
    send_json(&mut client, json!({"type": "audio", "data": "AA==", "format": "webm"})).await;
    send_json(&mut client, json!({"type": "audio", "data": "BB==", "format": "webm"})).await;
    send_json(&mut client, json!({"type": "end_of_audio"})).await;

    // Assert: the client hears "connected" first.
    assert_eq!(
        next_json(&mut client).await,
        json!({"type": "status", "status": "connected"})
    );

    // Assert: the upstream saw the credential on the upgrade request ...
    match upstream.next().await {
        Observed::Connected { conn, api_key } => {
            assert_eq!(conn, 0);
            assert_eq!(api_key.as_deref(), Some("test-key"));
        }
        other => panic!("expected a connection, got {other:?}"),
    }

    // ... then authentication, setup, and the recording in order.
    let frames = upstream.frames_until(0, "response.create").await;
    assert_eq!(
        types(&frames),
        vec![
            "authentication",
            "session.update",
            "conversation.item.create",
            "input_audio_buffer.append",
            "input_audio_buffer.append",
            "input_audio_buffer.commit",
            "response.create",
        ]
    );
    assert_eq!(frames[0]["apiKey"], "test-key");
    assert_eq!(frames[3]["audio"], "AA==");
    assert_eq!(frames[4]["audio"], "BB==");
}

#[tokio::test]
async fn test_upstream_frames_are_forwarded_and_bare_errors_get_a_message() {
    // Arrange
    let script = Script {
        on_session_update: vec![
            r#"{"type":"session.updated","session":{"voice":"alloy"}}"#.to_string(),
            r#"{"type":"error"}"#.to_string(),
        ],
        ..Script::default()
    };
    let upstream = spawn_fake_upstream(script).await;
    let relay = spawn_relay(relay_config(upstream.addr)).await;

    // Act
    let mut client = connect_client(relay).await;

    // Assert
    let mut frames = Vec::new();
    while frames.len() < 3 {
        frames.push(next_json(&mut client).await);
    }
    assert_eq!(frames[0], json!({"type": "status", "status": "connected"}));
    assert_eq!(
        frames[1],
        json!({"type": "session.updated", "session": {"voice": "alloy"}})
    );
    assert_eq!(frames[2]["type"], "error");
    let message = frames[2]["message"].as_str().unwrap();
    assert!(!message.is_empty());
    assert_ne!(message, "undefined");
}

#[tokio::test]
async fn test_unreachable_upstream_gives_exactly_one_error_then_1011() {
    // Arrange
    let mut config = relay_config(unreachable_addr());
    config.link.max_reconnect_attempts = 3;
    config.link.reconnect_delay = Duration::from_millis(20);
    let relay = spawn_relay(config).await;

    // Act
    let mut client = connect_client(relay).await;
    let (frames, close_code) = frames_until_close(&mut client).await;

    // Assert
    let reconnecting = frames
        .iter()
        .filter(|f| f["status"] == "reconnecting")
        .count();
    let errors = frames.iter().filter(|f| f["type"] == "error").count();
    assert_eq!(reconnecting, 2);
    assert_eq!(errors, 1);
    assert!(!frames.iter().any(|f| f["status"] == "connected"));
    assert_eq!(close_code, Some(1011));
}

#[tokio::test]
async fn test_fast_normal_close_reconnects() {
    // Arrange: the first upstream connection closes with 1000 after 300 ms.
    let script = Script {
        close_after: Some((0, Duration::from_millis(300), 1000)),
        ..Script::default()
    };
    let mut upstream = spawn_fake_upstream(script).await;
    let relay = spawn_relay(relay_config(upstream.addr)).await;

    // Act
    let mut client = connect_client(relay).await;
    let mut statuses = Vec::new();
    while statuses.len() < 4 {
        statuses.push(next_json(&mut client).await);
    }

    // Assert
    assert_eq!(statuses[0]["status"], "connected");
    assert_eq!(statuses[1]["status"], "disconnected");
    assert_eq!(statuses[1]["code"], 1000);
    assert_eq!(statuses[2]["status"], "reconnecting");
    assert_eq!(statuses[3]["status"], "connected");
    assert!(upstream.sees_connection_within(1, STEP).await);
}

#[tokio::test]
async fn test_stable_normal_close_ends_session_without_reconnect() {
    // Arrange: a "stable" connection is anything older than 100 ms here.
    let script = Script {
        close_after: Some((0, Duration::from_millis(400), 1000)),
        ..Script::default()
    };
    let mut upstream = spawn_fake_upstream(script).await;
    let mut config = relay_config(upstream.addr);
    config.link.stable_after = Duration::from_millis(100);
    let relay = spawn_relay(config).await;

    // Act
    let mut client = connect_client(relay).await;
    let (frames, close_code) = frames_until_close(&mut client).await;

    // Assert
    assert_eq!(frames[0]["status"], "connected");
    assert_eq!(frames[1]["status"], "disconnected");
    assert_eq!(frames[1]["code"], 1000);
    assert!(!frames.iter().any(|f| f["status"] == "reconnecting"));
    assert_eq!(close_code, Some(1000));
    assert!(!upstream.sees_connection_within(1, Duration::from_millis(300)).await);
}

#[tokio::test]
async fn test_unknown_client_types_send_nothing_upstream() {
    // Arrange
    let mut upstream = spawn_fake_upstream(Script::default()).await;
    let relay = spawn_relay(relay_config(upstream.addr)).await;
    let mut client = connect_client(relay).await;
    assert_eq!(next_json(&mut client).await["status"], "connected");

    // Act
    send_json(&mut client, json!({"type": "text", "text": "hello"})).await;
    client
        .send(Message::Binary(vec![0xde, 0xad]))
        .await
        .unwrap();
    send_json(&mut client, json!({"type": "end_of_audio"})).await;

    // Assert
    let frames = upstream.frames_until(0, "response.create").await;
    let after_setup: Vec<String> = types(&frames)
        .into_iter()
        .skip_while(|t| t != "conversation.item.create")
        .skip(1)
        .collect();
    assert_eq!(
        after_setup,
        vec!["input_audio_buffer.commit", "response.create"]
    );
}

#[tokio::test]
async fn test_client_disconnect_closes_upstream_without_reconnect() {
    // Arrange
    let mut upstream = spawn_fake_upstream(Script::default()).await;
    let relay = spawn_relay(relay_config(upstream.addr)).await;
    let mut client = connect_client(relay).await;
    assert_eq!(next_json(&mut client).await["status"], "connected");

    // Act
    client.close(None).await.unwrap();

    // Assert
    let closed_code = loop {
        if let Observed::Closed { conn: 0, code } = upstream.next().await {
            break code;
        }
    };
    assert_eq!(closed_code, Some(1000));
    assert!(!upstream.sees_connection_within(1, Duration::from_millis(300)).await);
}

#[tokio::test]
async fn test_idle_ready_link_sends_keepalive_ping() {
    // Arrange
    let mut upstream = spawn_fake_upstream(Script::default()).await;
    let mut config = relay_config(upstream.addr);
    config.link.keepalive_idle = Duration::from_millis(300);
    let relay = spawn_relay(config).await;

    // Act
    let mut client = connect_client(relay).await;
    assert_eq!(next_json(&mut client).await["status"], "connected");

    // Assert
    let pinged = loop {
        if let Observed::Ping { conn } = upstream.next().await {
            break conn;
        }
    };
    assert_eq!(pinged, 0);
}

#[tokio::test]
async fn test_other_paths_are_refused_with_404() {
    // Arrange
    let upstream = spawn_fake_upstream(Script::default()).await;
    let relay = spawn_relay(relay_config(upstream.addr)).await;

    // Act
    let result = connect_async(format!("ws://{relay}/somewhere-else")).await;

    // Assert
    match result {
        Err(WsError::Http(response)) => assert_eq!(response.status().as_u16(), 404),
        Err(other) => panic!("expected HTTP 404, got {other}"),
        Ok(_) => panic!("upgrade on the wrong path must fail"),
    }
}
