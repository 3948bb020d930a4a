//! realtime-relay library crate.
//!
//! A WebSocket relay that gives each browser voice client its own session on
//! an upstream realtime conversational API, without exposing the upstream
//! credential to the browser.
//!
//! # Architecture
//!
//! ```text
//! Browser (JSON over WebSocket, /api/ws-proxy)
//!         ↕
//! [realtime-relay]
//!   ├── domain/             RelayConfig, RelayError, SessionId
//!   ├── application/
//!   │     ├── link_state    Upstream link lifecycle (pure state machine)
//!   │     ├── outbound_queue FIFO buffer until the link is ready
//!   │     └── translate     Client frames → upstream commands
//!   └── infrastructure/
//!         ├── ws_server     Accept loop and upgrade dispatch
//!         ├── session_relay Per-client select loop
//!         ├── upstream_link Upstream socket driver (tokio-tungstenite)
//!         └── credentials   Credential provider seam
//!         ↕
//! Upstream realtime API (JSON over WebSocket)
//! ```
//!
//! # Layer rules
//!
//! - `domain` does no I/O.
//! - `application` depends on `domain` and `realtime-core`; it never touches
//!   a socket and reads time only through arguments.
//! - `infrastructure` depends on all other layers plus `tokio` and
//!   `tokio-tungstenite`.

/// Domain layer: configuration, errors and identifiers.
pub mod domain;

/// Application layer: link lifecycle, outbound queue and translation.
pub mod application;

/// Infrastructure layer: listener, sessions and upstream sockets.
pub mod infrastructure;
