//! Relay configuration types.
//!
//! [`RelayConfig`] is the single source of truth for all runtime settings.
//! The binary populates it from CLI flags and environment variables; tests
//! build it directly.  Nothing in this module reads the environment.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use url::Url;

use super::error::RelayError;

/// Default upgrade path for client WebSocket connections.
pub const DEFAULT_WS_PATH: &str = "/api/ws-proxy";

/// System prompt used when none is configured.
pub const DEFAULT_INSTRUCTIONS: &str =
    "You are a helpful voice assistant. Keep your answers short and conversational.";

/// All runtime configuration for the relay.
///
/// Build once at startup and share behind an `Arc` across session tasks.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address the client listener binds to.
    pub bind_addr: SocketAddr,

    /// The only path on which WebSocket upgrades are accepted.
    pub ws_path: String,

    /// Where and how to reach the upstream realtime API.
    pub upstream: UpstreamConfig,

    /// Timing and retry policy of each session's upstream link.
    pub link: LinkPolicy,

    /// Maximum number of client messages held while the link is not ready.
    pub queue_capacity: usize,
}

impl RelayConfig {
    /// Creates a configuration with default listener, policy and queue
    /// settings for the given upstream.
    pub fn new(upstream: UpstreamConfig) -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            ws_path: DEFAULT_WS_PATH.to_string(),
            upstream,
            link: LinkPolicy::default(),
            queue_capacity: 4096,
        }
    }

    /// Checks the invariants the rest of the relay relies on.
    pub fn validate(&self) -> Result<(), RelayError> {
        if !self.ws_path.starts_with('/') {
            return Err(RelayError::Config(format!(
                "WebSocket path must start with '/': {:?}",
                self.ws_path
            )));
        }
        if self.queue_capacity == 0 {
            return Err(RelayError::Config(
                "queue capacity must be at least 1".to_string(),
            ));
        }
        self.link.validate()
    }
}

/// Upstream endpoint, credential and per-link session settings.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Full upstream URL including the `api-version` and `deployment` query.
    pub url: Url,

    /// Shared credential sent with every upstream connection.
    pub credential: Credential,

    /// Voice requested in `session.update`.
    pub voice: String,

    /// System instructions sent once per link.
    pub instructions: String,
}

impl UpstreamConfig {
    /// Builds the upstream configuration from its raw parts.
    ///
    /// `http`/`https` endpoints are rewritten to `ws`/`wss`; any other scheme
    /// is rejected.  Existing query parameters on the endpoint are kept.
    pub fn from_parts(
        endpoint: &str,
        api_version: &str,
        deployment: &str,
        credential: Credential,
    ) -> Result<Self, RelayError> {
        let url = build_upstream_url(endpoint, api_version, deployment)?;
        if credential.is_empty() {
            return Err(RelayError::Config("upstream API key is empty".to_string()));
        }
        Ok(Self {
            url,
            credential,
            voice: "alloy".to_string(),
            instructions: DEFAULT_INSTRUCTIONS.to_string(),
        })
    }
}

/// Composes `{endpoint}?api-version={v}&deployment={d}`.
pub fn build_upstream_url(
    endpoint: &str,
    api_version: &str,
    deployment: &str,
) -> Result<Url, RelayError> {
    if api_version.trim().is_empty() {
        return Err(RelayError::Config("api-version is empty".to_string()));
    }
    if deployment.trim().is_empty() {
        return Err(RelayError::Config("deployment is empty".to_string()));
    }

    let mut url = Url::parse(endpoint.trim())
        .map_err(|e| RelayError::Config(format!("invalid upstream endpoint {endpoint:?}: {e}")))?;

    let ws_scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(RelayError::Config(format!(
                "upstream endpoint must be a ws:// or wss:// URL, got scheme {other:?}"
            )))
        }
    };
    if url.scheme() != ws_scheme && url.set_scheme(ws_scheme).is_err() {
        return Err(RelayError::Config(format!(
            "cannot use {endpoint:?} as a WebSocket endpoint"
        )));
    }

    url.query_pairs_mut()
        .append_pair("api-version", api_version.trim())
        .append_pair("deployment", deployment.trim());
    Ok(url)
}

/// The shared upstream API key.
///
/// `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Returns the secret for placing on the wire.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Timing and retry policy of an upstream link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkPolicy {
    /// Delay between transport-open and readiness.
    pub settle_delay: Duration,

    /// A ready link with no traffic for this long sends a keepalive ping.
    pub keepalive_idle: Duration,

    /// Fixed delay before each reconnect attempt.
    pub reconnect_delay: Duration,

    /// Consecutive failures after which the link gives up.
    pub max_reconnect_attempts: u32,

    /// A connection that lived at least this long counts as stable.
    pub stable_after: Duration,

    /// Upper bound on one transport-open attempt.
    pub connect_timeout: Duration,
}

impl LinkPolicy {
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.max_reconnect_attempts == 0 {
            return Err(RelayError::Config(
                "max reconnect attempts must be at least 1".to_string(),
            ));
        }
        if self.keepalive_idle.is_zero() {
            return Err(RelayError::Config(
                "keepalive interval must be non-zero".to_string(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(RelayError::Config(
                "connect timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for LinkPolicy {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(1000),
            keepalive_idle: Duration::from_secs(15),
            reconnect_delay: Duration::from_millis(2000),
            max_reconnect_attempts: 15,
            stable_after: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
        }
    }
}
