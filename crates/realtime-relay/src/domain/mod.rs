//! Domain layer for the realtime relay.
//!
//! Contains pure types with no I/O: runtime configuration, the relay error
//! taxonomy and session identifiers.

pub mod config;
pub mod error;
pub mod session;

pub use config::{Credential, LinkPolicy, RelayConfig, UpstreamConfig, DEFAULT_INSTRUCTIONS};
pub use error::RelayError;
pub use session::SessionId;
