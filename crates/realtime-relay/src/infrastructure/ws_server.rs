//! Client listener: accept loop and upgrade dispatch.
//!
//! This module is responsible for:
//!
//! 1. Binding a TCP listener on the configured address.
//! 2. Accepting incoming TCP connections from browsers.
//! 3. Upgrading connections whose request path matches the configured
//!    WebSocket path, and refusing all others with HTTP 404.
//! 4. Spawning one session task per upgraded connection.
//! 5. Stopping the accept loop when the `running` flag is cleared.
//!
//! Sessions never block each other: the accept loop hands every connection
//! to its own Tokio task before accepting the next one.

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{error, info, warn};

use crate::domain::{RelayConfig, SessionId};
use crate::infrastructure::credentials::CredentialProvider;
use crate::infrastructure::session_relay::{run_session, SessionEnd};

/// How often the accept loop re-checks the `running` flag.
const ACCEPT_POLL: Duration = Duration::from_millis(200);

// ── Public API ────────────────────────────────────────────────────────────────

/// Binds `config.bind_addr` and serves clients until `running` is cleared.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound (port in use, missing
/// permission).
pub async fn run_server(
    config: RelayConfig,
    credentials: Arc<dyn CredentialProvider>,
    running: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind client listener on {}", config.bind_addr))?;

    serve(listener, Arc::new(config), credentials, running).await
}

/// Runs the accept loop on an already bound listener.
///
/// Split from [`run_server`] so tests can bind an ephemeral port first.
pub async fn serve(
    listener: TcpListener,
    config: Arc<RelayConfig>,
    credentials: Arc<dyn CredentialProvider>,
    running: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let local = listener
        .local_addr()
        .context("failed to read listener address")?;
    info!("relay listening on {local} (WebSocket path {})", config.ws_path);

    loop {
        if !running.load(Ordering::Relaxed) {
            info!("shutdown flag set; stopping accept loop");
            break;
        }

        match timeout(ACCEPT_POLL, listener.accept()).await {
            Ok(Ok((stream, peer_addr))) => {
                let config = Arc::clone(&config);
                let credentials = Arc::clone(&credentials);
                tokio::spawn(async move {
                    handle_client_connection(stream, peer_addr, config, credentials).await;
                });
            }
            Ok(Err(e)) => {
                // Transient (e.g. out of file descriptors); keep serving.
                error!("accept error: {e}");
            }
            Err(_) => {
                // No connection within the poll window.
            }
        }
    }

    Ok(())
}

// ── Per-connection handler ────────────────────────────────────────────────────

/// Upgrades one connection and runs its session, logging the outcome.
async fn handle_client_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    config: Arc<RelayConfig>,
    credentials: Arc<dyn CredentialProvider>,
) {
    let ws = match accept_on_path(stream, &config.ws_path).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("rejected connection from {peer_addr}: {e:#}");
            return;
        }
    };

    let id = SessionId::new();
    info!("session {id}: client {peer_addr} connected");

    match run_session(id, ws, &config, credentials.as_ref()).await {
        Ok(SessionEnd::ClientClosed) => info!("session {id}: closed by client"),
        Ok(SessionEnd::UpstreamEnded) => info!("session {id}: closed after upstream ended"),
        Ok(SessionEnd::RetriesExhausted) => {
            warn!("session {id}: closed after the upstream link gave up")
        }
        Err(e) => warn!("session {id}: closed with error: {e}"),
    }
}

/// Completes the WebSocket handshake if the request targets `path`.
async fn accept_on_path(
    stream: TcpStream,
    path: &str,
) -> anyhow::Result<WebSocketStream<TcpStream>> {
    let expected = path.to_string();
    let mut requested = String::new();
    let requested_ref = &mut requested;

    let result = accept_hdr_async(stream, |request: &Request, response: Response| {
        let actual = request.uri().path();
        *requested_ref = actual.to_string();
        if is_upgrade_path(actual, &expected) {
            Ok(response)
        } else {
            let mut refusal = ErrorResponse::new(Some(format!("no WebSocket endpoint at {actual}")));
            *refusal.status_mut() = StatusCode::NOT_FOUND;
            Err(refusal)
        }
    })
    .await;

    result.with_context(|| format!("WebSocket handshake failed for path {requested:?}"))
}

/// Whether a request for `requested` should be upgraded.  A single trailing
/// slash is tolerated.
fn is_upgrade_path(requested: &str, expected: &str) -> bool {
    requested == expected
        || requested
            .strip_suffix('/')
            .is_some_and(|trimmed| trimmed == expected)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
