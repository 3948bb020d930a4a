//! Infrastructure layer for the relay.
//!
//! Handles all I/O: the client listener, per-session tasks and the upstream
//! WebSocket links.
//!
//! # What does NOT belong here?
//!
//! - Lifecycle decisions of the upstream link (application layer)
//! - Frame translation (application layer)
//! - Configuration parsing (done in `main.rs`)

pub mod credentials;
pub mod session_relay;
pub mod upstream_link;
pub mod ws_server;

pub use credentials::{CredentialProvider, StaticCredentialProvider};
pub use session_relay::{run_session, SessionEnd};
pub use ws_server::{run_server, serve};
