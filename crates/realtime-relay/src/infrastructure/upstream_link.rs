//! I/O driver for one session's upstream WebSocket link.
//!
//! [`UpstreamLink`] executes the commands produced by the
//! [`LinkMachine`](crate::application::LinkMachine) and feeds it transport
//! events and clock readings.  It owns:
//!
//! - the write half of the current upstream socket,
//! - a **connect task** per transport-open attempt (bounded by the connect
//!   timeout), and
//! - a **reader task** per open socket that forwards inbound frames.
//!
//! Both tasks report back over one channel.  Every event is tagged with the
//! generation of the transport it belongs to; events from a torn-down
//! transport are discarded, so a late frame or close from an old socket can
//! never disturb the current one.
//!
//! The session task is the only caller, so there is no locking: all state
//! changes happen on that task between `await` points.

use std::borrow::Cow;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use realtime_core::{encode_upstream_command, UpstreamCommand};

use crate::application::{
    authentication_command, link_setup_commands, LinkCommand, LinkError, LinkEvent, LinkMachine,
    LinkState, TransportLoss, UpstreamSink,
};
use crate::domain::{Credential, LinkPolicy, SessionId, UpstreamConfig};

/// Buffered transport events before the reader task waits for the session.
const EVENT_CHANNEL_CAPACITY: usize = 128;

/// How long a deliberate close may spend sending the close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Header carrying the credential on the upgrade request.
const API_KEY_HEADER: &str = "api-key";

type UpstreamStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type UpstreamWriter = SplitSink<UpstreamStream, WsMessage>;
type UpstreamReader = SplitStream<UpstreamStream>;

// ── Events ────────────────────────────────────────────────────────────────────

/// Something that happened on a transport, reported by a connect or reader
/// task.  Hand it back to [`UpstreamLink::handle`].
pub struct TransportEvent {
    generation: u64,
    kind: TransportEventKind,
}

enum TransportEventKind {
    Opened(Box<UpstreamStream>),
    Frame(String),
    /// Ping or pong from the upstream; counts as traffic.
    Heartbeat,
    Lost(TransportLoss),
}

/// What the session has to act on after the link processed an input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkNotice {
    /// A lifecycle transition to report to the client.
    Lifecycle(LinkEvent),
    /// An inbound upstream text frame, untouched.
    Inbound(String),
}

// ── UpstreamLink ──────────────────────────────────────────────────────────────

/// One upstream link, owned by exactly one session.
pub struct UpstreamLink {
    session: SessionId,
    upstream: UpstreamConfig,
    credential: Credential,
    connect_timeout: Duration,
    machine: LinkMachine,
    generation: u64,
    writer: Option<UpstreamWriter>,
    reader: Option<JoinHandle<()>>,
    connector: Option<JoinHandle<()>>,
    events_tx: mpsc::Sender<TransportEvent>,
    events_rx: mpsc::Receiver<TransportEvent>,
}

impl UpstreamLink {
    pub fn new(
        session: SessionId,
        upstream: UpstreamConfig,
        policy: LinkPolicy,
        credential: Credential,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            session,
            upstream,
            credential,
            connect_timeout: policy.connect_timeout,
            machine: LinkMachine::new(policy),
            generation: 0,
            writer: None,
            reader: None,
            connector: None,
            events_tx,
            events_rx,
        }
    }

    pub fn state(&self) -> LinkState {
        self.machine.state()
    }

    /// Begins the first transport-open attempt.
    pub async fn start(&mut self) -> Result<Vec<LinkNotice>, LinkError> {
        let commands = self.machine.connect()?;
        Ok(self.execute(commands).await)
    }

    /// Waits for the next event from a connect or reader task.
    ///
    /// Cancel-safe; intended for use in `tokio::select!`.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events_rx.recv().await
    }

    /// When [`Self::on_timer`] should next be called, if at all.
    pub fn next_deadline(&self) -> Option<tokio::time::Instant> {
        self.machine
            .next_deadline()
            .map(tokio::time::Instant::from_std)
    }

    /// Fires due timers: settle delay, keepalive, reconnect backoff.
    pub async fn on_timer(&mut self) -> Vec<LinkNotice> {
        let commands = self.machine.on_deadline(Instant::now());
        self.execute(commands).await
    }

    /// Applies one transport event.
    pub async fn handle(&mut self, event: TransportEvent) -> Vec<LinkNotice> {
        if event.generation != self.generation {
            debug!(
                "session {}: ignoring event from stale upstream transport (generation {}, current {})",
                self.session, event.generation, self.generation
            );
            return Vec::new();
        }

        let now = Instant::now();
        match event.kind {
            TransportEventKind::Opened(stream) => {
                self.connector = None;
                let (writer, reader) = (*stream).split();
                self.writer = Some(writer);
                self.reader = Some(spawn_reader(
                    self.session,
                    reader,
                    self.generation,
                    self.events_tx.clone(),
                ));
                info!("session {}: upstream transport open", self.session);
                let commands = self.machine.on_transport_open(now);
                self.execute(commands).await
            }
            TransportEventKind::Frame(text) => {
                self.machine.on_activity(now);
                vec![LinkNotice::Inbound(text)]
            }
            TransportEventKind::Heartbeat => {
                self.machine.on_activity(now);
                Vec::new()
            }
            TransportEventKind::Lost(loss) => {
                self.connector = None;
                self.reader = None;
                self.writer = None;
                debug!("session {}: upstream transport lost: {loss:?}", self.session);
                let commands = self.machine.on_transport_lost(now, loss);
                self.execute(commands).await
            }
        }
    }

    /// Deliberately closes the link.  Idempotent; never reconnects.
    pub async fn shutdown(&mut self) {
        let commands = self.machine.close();
        if !commands.is_empty() {
            info!("session {}: closing upstream link", self.session);
        }
        self.execute(commands).await;
        self.machine.on_close_complete();
    }

    // ── Command execution ─────────────────────────────────────────────────────

    async fn execute(&mut self, commands: Vec<LinkCommand>) -> Vec<LinkNotice> {
        let mut notices = Vec::new();
        for command in commands {
            match command {
                LinkCommand::OpenTransport => self.open_transport(),
                LinkCommand::Authenticate => {
                    let auth = authentication_command(&self.credential);
                    if let Err(e) = self.write_command(&auth).await {
                        warn!("session {}: failed to authenticate upstream: {e}", self.session);
                    }
                }
                LinkCommand::Configure => {
                    for setup in link_setup_commands(&self.upstream) {
                        if let Err(e) = self.write_command(&setup).await {
                            warn!(
                                "session {}: failed to send {}: {e}",
                                self.session,
                                setup.kind()
                            );
                            break;
                        }
                    }
                }
                LinkCommand::Ping => self.send_keepalive().await,
                LinkCommand::CloseTransport => self.close_transport().await,
                LinkCommand::Notify(event) => {
                    self.log_event(&event);
                    notices.push(LinkNotice::Lifecycle(event));
                }
            }
        }
        notices
    }

    fn open_transport(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        let session = self.session;
        let url = self.upstream.url.clone();
        let credential = self.credential.clone();
        let limit = self.connect_timeout;
        let tx = self.events_tx.clone();

        debug!("session {session}: opening upstream transport (generation {generation})");
        self.connector = Some(tokio::spawn(async move {
            let kind = match open_upstream(&url, &credential, limit).await {
                Ok(stream) => TransportEventKind::Opened(Box::new(stream)),
                Err(reason) => {
                    warn!("session {session}: upstream connect failed: {reason}");
                    TransportEventKind::Lost(TransportLoss::ConnectFailed(reason))
                }
            };
            // The link may already be gone; nothing to report to then.
            let _ = tx.send(TransportEvent { generation, kind }).await;
        }));
    }

    async fn write_command(&mut self, command: &UpstreamCommand) -> Result<(), LinkError> {
        let state = self.machine.state();
        let writer = self
            .writer
            .as_mut()
            .ok_or(LinkError::NotReady(state))?;
        let text =
            encode_upstream_command(command).map_err(|e| LinkError::Transport(e.to_string()))?;
        writer
            .send(WsMessage::Text(text))
            .await
            .map_err(|e| LinkError::Transport(e.to_string()))?;
        debug!("session {}: relay → upstream: {}", self.session, command.kind());
        self.machine.on_activity(Instant::now());
        Ok(())
    }

    async fn send_keepalive(&mut self) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        match writer.send(WsMessage::Ping(Vec::new())).await {
            Ok(()) => debug!("session {}: keepalive ping sent", self.session),
            Err(e) => warn!("session {}: keepalive ping failed: {e}", self.session),
        }
    }

    async fn close_transport(&mut self) {
        // Anything the old tasks still report belongs to a dead generation.
        self.generation += 1;
        if let Some(connector) = self.connector.take() {
            connector.abort();
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        let Some(mut writer) = self.writer.take() else {
            return;
        };
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: Cow::Borrowed("client session ended"),
        };
        match timeout(CLOSE_GRACE, writer.send(WsMessage::Close(Some(frame)))).await {
            Ok(Ok(())) => debug!("session {}: upstream close frame sent", self.session),
            Ok(Err(e)) => debug!("session {}: upstream close failed: {e}", self.session),
            Err(_) => debug!("session {}: upstream close timed out", self.session),
        }
    }

    fn log_event(&self, event: &LinkEvent) {
        let id = self.session;
        match event {
            LinkEvent::Ready => info!("session {id}: upstream link ready"),
            LinkEvent::Disconnected { code, reason } => {
                warn!("session {id}: upstream disconnected (code {code:?}): {reason}")
            }
            LinkEvent::Reconnecting { attempt, delay } => info!(
                "session {id}: reconnecting to upstream in {delay:?} (attempt {attempt})"
            ),
            LinkEvent::Ended { code, reason } => {
                info!("session {id}: upstream ended the session (code {code}): {reason}")
            }
            LinkEvent::Exhausted { attempts } => info!(
                "session {id}: giving up on upstream after {attempts} consecutive failures"
            ),
        }
    }
}

#[async_trait]
impl UpstreamSink for UpstreamLink {
    fn is_ready(&self) -> bool {
        self.machine.is_ready() && self.writer.is_some()
    }

    async fn send(&mut self, command: &UpstreamCommand) -> Result<(), LinkError> {
        self.machine.ensure_ready()?;
        self.write_command(command).await
    }
}

impl Drop for UpstreamLink {
    fn drop(&mut self) {
        if let Some(connector) = self.connector.take() {
            connector.abort();
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

// ── Transport tasks ───────────────────────────────────────────────────────────

/// Opens the upstream socket with the credential in the `api-key` header.
async fn open_upstream(
    url: &Url,
    credential: &Credential,
    limit: Duration,
) -> Result<UpstreamStream, String> {
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| format!("invalid upstream request: {e}"))?;
    let key = HeaderValue::from_str(credential.expose())
        .map_err(|_| "credential is not a valid header value".to_string())?;
    request.headers_mut().insert(API_KEY_HEADER, key);

    match timeout(limit, connect_async(request)).await {
        Ok(Ok((stream, _response))) => Ok(stream),
        Ok(Err(WsError::Http(response))) => Err(format!(
            "upstream rejected the handshake with HTTP {}",
            response.status()
        )),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("connect timed out after {limit:?}")),
    }
}

/// Forwards inbound frames until the socket closes, then reports the loss.
fn spawn_reader(
    session: SessionId,
    mut reader: UpstreamReader,
    generation: u64,
    tx: mpsc::Sender<TransportEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let loss = loop {
            let kind = match reader.next().await {
                Some(Ok(WsMessage::Text(text))) => TransportEventKind::Frame(text),
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => TransportEventKind::Heartbeat,
                Some(Ok(WsMessage::Binary(bytes))) => {
                    warn!(
                        "session {session}: dropping {} byte binary frame from upstream",
                        bytes.len()
                    );
                    continue;
                }
                Some(Ok(WsMessage::Frame(_))) => continue,
                Some(Ok(WsMessage::Close(frame))) => {
                    break match frame {
                        Some(frame) => TransportLoss::Closed {
                            code: Some(u16::from(frame.code)),
                            reason: frame.reason.into_owned(),
                        },
                        None => TransportLoss::Closed {
                            code: None,
                            reason: String::new(),
                        },
                    };
                }
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                    break TransportLoss::Closed {
                        code: None,
                        reason: "connection closed".to_string(),
                    };
                }
                Some(Err(e)) => break TransportLoss::Errored(e.to_string()),
            };
            if tx.send(TransportEvent { generation, kind }).await.is_err() {
                return;
            }
        };
        let _ = tx
            .send(TransportEvent {
                generation,
                kind: TransportEventKind::Lost(loss),
            })
            .await;
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
