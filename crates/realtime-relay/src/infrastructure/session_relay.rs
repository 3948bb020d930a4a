//! Per-client session: one client socket, one upstream link, one queue.
//!
//! A session is a single task running a `tokio::select!` loop over three
//! inputs:
//!
//! ```text
//!   client socket ──▶ decode ─▶ translate ─▶ OutboundQueue ─▶ UpstreamLink
//!   link events   ──▶ status frames / verbatim upstream frames ─▶ client
//!   link deadline ──▶ settle delay, keepalive ping, reconnect backoff
//! ```
//!
//! Because the loop handles one input at a time, client frames are submitted
//! in arrival order and upstream frames are forwarded in arrival order with
//! no extra synchronisation.
//!
//! # How a session ends
//!
//! | Cause                            | Client sees                            |
//! |----------------------------------|----------------------------------------|
//! | client closes                    | nothing further                        |
//! | retries exhausted                | one `error` frame, then close 1011     |
//! | stable normal upstream close     | `disconnected` status, then close 1000 |
//! | credential unavailable           | one `error` frame, then close 1011     |
//!
//! In every case the upstream link is shut down before the task returns.

use std::borrow::Cow;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use realtime_core::{
    decode_client_frame, encode_relay_frame, prepare_upstream_frame_for_client, ClientMessage,
    RelayFrame, UpstreamCommand, UpstreamEvent, DEFAULT_UPSTREAM_ERROR_MESSAGE,
};

use crate::application::{
    status_frame_for, translate_client_message, DrainReport, LinkEvent, OutboundQueue,
};
use crate::domain::{RelayConfig, RelayError, SessionId};
use crate::infrastructure::credentials::CredentialProvider;
use crate::infrastructure::upstream_link::{LinkNotice, TransportEvent, UpstreamLink};

type ClientSink<S> = SplitSink<WebSocketStream<S>, WsMessage>;
type ClientStream<S> = SplitStream<WebSocketStream<S>>;

/// Why a session finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The client closed its socket or it failed.
    ClientClosed,
    /// A stable upstream connection was closed normally.
    UpstreamEnded,
    /// The upstream link gave up reconnecting.
    RetriesExhausted,
}

/// Runs one client session to completion.
///
/// # Errors
///
/// Returns [`RelayError::Credential`] when no credential could be obtained
/// (the client has already been told and disconnected), or a transport error
/// when the client socket fails mid-session.
pub async fn run_session<S>(
    id: SessionId,
    ws: WebSocketStream<S>,
    config: &RelayConfig,
    credentials: &dyn CredentialProvider,
) -> Result<SessionEnd, RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_tx, client_rx) = ws.split();

    let credential = match credentials.credential().await {
        Ok(credential) => credential,
        Err(e) => {
            if let Err(send_err) = send_frame(&mut client_tx, &RelayFrame::error(e.to_string())).await
            {
                debug!("session {id}: could not report credential failure: {send_err}");
            }
            close_client(id, &mut client_tx, CloseCode::Error, "upstream credential unavailable")
                .await;
            return Err(e);
        }
    };

    let link = UpstreamLink::new(id, config.upstream.clone(), config.link, credential);
    let mut relay = SessionRelay {
        id,
        client_tx,
        client_rx,
        link,
        queue: OutboundQueue::new(config.queue_capacity),
    };

    let outcome = relay.run().await;
    relay.finish(outcome.as_ref().ok().copied()).await;
    outcome
}

// ── SessionRelay ──────────────────────────────────────────────────────────────

struct SessionRelay<S> {
    id: SessionId,
    client_tx: ClientSink<S>,
    client_rx: ClientStream<S>,
    link: UpstreamLink,
    queue: OutboundQueue,
}

/// The input the select loop woke up for.
enum Step {
    Client(Option<Result<WsMessage, WsError>>),
    Upstream(TransportEvent),
    Timer,
}

impl<S> SessionRelay<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    async fn run(&mut self) -> Result<SessionEnd, RelayError> {
        let notices = self.link.start().await?;
        if let Some(end) = self.apply(notices).await? {
            return Ok(end);
        }

        loop {
            let deadline = self.link.next_deadline();
            let step = tokio::select! {
                incoming = self.client_rx.next() => Step::Client(incoming),
                Some(event) = self.link.next_event() => Step::Upstream(event),
                () = wait_until(deadline) => Step::Timer,
            };

            let notices = match step {
                Step::Client(incoming) => {
                    if let Some(end) = self.on_client(incoming).await? {
                        return Ok(end);
                    }
                    continue;
                }
                Step::Upstream(event) => self.link.handle(event).await,
                Step::Timer => self.link.on_timer().await,
            };
            if let Some(end) = self.apply(notices).await? {
                return Ok(end);
            }
        }
    }

    // ── Client → Upstream ─────────────────────────────────────────────────────

    async fn on_client(
        &mut self,
        incoming: Option<Result<WsMessage, WsError>>,
    ) -> Result<Option<SessionEnd>, RelayError> {
        match incoming {
            Some(Ok(WsMessage::Text(text))) => {
                self.on_client_text(&text).await?;
                Ok(None)
            }
            Some(Ok(WsMessage::Binary(bytes))) => {
                warn!(
                    "session {}: dropping {} byte binary frame; the client protocol is JSON text",
                    self.id,
                    bytes.len()
                );
                Ok(None)
            }
            Some(Ok(WsMessage::Close(_))) | None => {
                debug!("session {}: client closed the connection", self.id);
                Ok(Some(SessionEnd::ClientClosed))
            }
            Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => Ok(None),
            Some(Err(e)) => {
                debug!("session {}: client socket error: {e}", self.id);
                Ok(Some(SessionEnd::ClientClosed))
            }
        }
    }

    async fn on_client_text(&mut self, text: &str) -> Result<(), RelayError> {
        let message = match decode_client_frame(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    "session {}: dropping client frame: {}",
                    self.id,
                    RelayError::from(e)
                );
                return Ok(());
            }
        };

        if let ClientMessage::Other { kind } = &message {
            warn!("session {}: ignoring client frame of unknown type {kind:?}", self.id);
            return Ok(());
        }

        debug!("session {}: client → relay: {}", self.id, message.kind());
        for command in translate_client_message(message) {
            self.submit(command).await?;
        }
        Ok(())
    }

    async fn submit(&mut self, command: UpstreamCommand) -> Result<(), RelayError> {
        let kind = command.kind();
        match self.queue.submit(command, &mut self.link).await {
            Ok(report) => {
                self.log_stall(&report);
                Ok(())
            }
            Err(e) => {
                warn!("session {}: rejected {kind}: {e}", self.id);
                let frame = RelayFrame::error(format!(
                    "The relay is not keeping up with the audio stream ({e}); a {kind} message was dropped"
                ));
                send_frame(&mut self.client_tx, &frame).await
            }
        }
    }

    // ── Link → Client ─────────────────────────────────────────────────────────

    async fn apply(&mut self, notices: Vec<LinkNotice>) -> Result<Option<SessionEnd>, RelayError> {
        for notice in notices {
            match notice {
                LinkNotice::Inbound(text) => self.forward_upstream_frame(&text).await?,
                LinkNotice::Lifecycle(event) => {
                    if let Some(frame) = status_frame_for(&event) {
                        send_frame(&mut self.client_tx, &frame).await?;
                    }
                    match event {
                        LinkEvent::Ready => {
                            let report = self.queue.drain(&mut self.link).await;
                            if report.sent > 0 {
                                info!(
                                    "session {}: delivered {} queued message(s)",
                                    self.id, report.sent
                                );
                            }
                            self.log_stall(&report);
                        }
                        LinkEvent::Ended { .. } => return Ok(Some(SessionEnd::UpstreamEnded)),
                        LinkEvent::Exhausted { .. } => {
                            return Ok(Some(SessionEnd::RetriesExhausted))
                        }
                        LinkEvent::Disconnected { .. } | LinkEvent::Reconnecting { .. } => {}
                    }
                }
            }
        }
        Ok(None)
    }

    async fn forward_upstream_frame(&mut self, text: &str) -> Result<(), RelayError> {
        let (event, outgoing) = match prepare_upstream_frame_for_client(text) {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(
                    "session {}: dropping upstream frame: {}",
                    self.id,
                    RelayError::from(e)
                );
                return Ok(());
            }
        };

        match &event {
            UpstreamEvent::Error { message } => {
                let message = message
                    .clone()
                    .unwrap_or_else(|| DEFAULT_UPSTREAM_ERROR_MESSAGE.to_string());
                warn!("session {}: {}", self.id, RelayError::UpstreamRejection(message));
            }
            other => debug!("session {}: upstream → client: {}", self.id, other.kind()),
        }

        self.client_tx
            .send(WsMessage::Text(outgoing))
            .await
            .map_err(|e| RelayError::Transport(format!("client socket: {e}")))
    }

    fn log_stall(&self, report: &DrainReport) {
        if let Some(e) = &report.stalled {
            debug!(
                "session {}: drain stopped with {} message(s) pending: {e}",
                self.id,
                self.queue.len()
            );
        }
    }

    // ── Teardown ──────────────────────────────────────────────────────────────

    async fn finish(&mut self, end: Option<SessionEnd>) {
        self.link.shutdown().await;
        match end {
            Some(SessionEnd::RetriesExhausted) => {
                close_client(self.id, &mut self.client_tx, CloseCode::Error, "upstream unavailable")
                    .await
            }
            Some(SessionEnd::UpstreamEnded) => {
                close_client(
                    self.id,
                    &mut self.client_tx,
                    CloseCode::Normal,
                    "upstream session ended",
                )
                .await
            }
            Some(SessionEnd::ClientClosed) | None => {
                if let Err(e) = self.client_tx.close().await {
                    debug!("session {}: client close: {e}", self.id);
                }
            }
        }
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

async fn wait_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

async fn send_frame<S>(tx: &mut ClientSink<S>, frame: &RelayFrame) -> Result<(), RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let text = encode_relay_frame(frame)?;
    tx.send(WsMessage::Text(text))
        .await
        .map_err(|e| RelayError::Transport(format!("client socket: {e}")))
}

async fn close_client<S>(
    id: SessionId,
    tx: &mut ClientSink<S>,
    code: CloseCode,
    reason: &'static str,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = CloseFrame {
        code,
        reason: Cow::Borrowed(reason),
    };
    if let Err(e) = tx.send(WsMessage::Close(Some(frame))).await {
        debug!("session {id}: client close failed: {e}");
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
