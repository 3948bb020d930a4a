//! Error taxonomy for the relay.

use realtime_core::CodecError;
use thiserror::Error;

/// Everything that can go wrong while relaying a session.
///
/// Most variants are recovered from locally and only logged.  `Config` is
/// fatal at startup; `ExhaustedRetries` and `Credential` end a session and are
/// reported to the client as a single `error` frame.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Required configuration is missing or malformed.
    #[error("configuration error: {0}")]
    Config(String),

    /// The credential provider could not supply a credential.
    #[error("upstream credential unavailable: {0}")]
    Credential(String),

    /// Socket failure on either side (connect, write, unexpected close).
    #[error("transport error: {0}")]
    Transport(String),

    /// A frame could not be decoded or was of the wrong kind.
    #[error("protocol error: {0}")]
    Protocol(#[from] CodecError),

    /// The upstream sent an error frame.
    #[error("upstream reported an error: {0}")]
    UpstreamRejection(String),

    /// The upstream link gave up after too many consecutive failures.
    #[error("upstream unavailable after {attempts} consecutive failed connection attempts")]
    ExhaustedRetries { attempts: u32 },
}

impl RelayError {
    /// Returns `true` when the error ends the session it occurred in.
    pub fn ends_session(&self) -> bool {
        matches!(
            self,
            RelayError::Config(_) | RelayError::Credential(_) | RelayError::ExhaustedRetries { .. }
        )
    }
}
