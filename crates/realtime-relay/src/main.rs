//! Realtime relay: entry point.
//!
//! This binary accepts WebSocket connections from browser voice clients and
//! relays each one to its own session on an upstream realtime conversational
//! API.  Browser audio chunks become `input_audio_buffer.append` commands,
//! the end of a recording becomes a commit plus a response request, and
//! everything the upstream says is passed straight back to the browser.
//!
//! # Usage
//!
//! ```text
//! realtime-relay --endpoint wss://<resource>.openai.azure.com/openai/realtime \
//!                --api-version 2024-10-01-preview \
//!                --deployment gpt-4o-realtime-preview \
//!                --api-key <key> [OPTIONS]
//! ```
//!
//! # Environment variable overrides
//!
//! Every flag can also be set through the environment; `.env.local` and then
//! `.env` are loaded first when present.  CLI args take precedence.
//!
//! | Variable                       | Default          | Description                   |
//! |--------------------------------|------------------|-------------------------------|
//! | `PORT`                         | `3000`           | Listener port                 |
//! | `RELAY_BIND`                   | `0.0.0.0`        | Listener IP                   |
//! | `RELAY_WS_PATH`                | `/api/ws-proxy`  | WebSocket upgrade path        |
//! | `AZURE_OPENAI_ENDPOINT`        | required         | Upstream WebSocket endpoint   |
//! | `AZURE_OPENAI_API_VERSION`     | required         | `api-version` query parameter |
//! | `AZURE_OPENAI_DEPLOYMENT`      | required         | `deployment` query parameter  |
//! | `AZURE_OPENAI_API_KEY`         | required         | Upstream credential           |
//! | `RELAY_VOICE`                  | `alloy`          | Assistant voice               |
//! | `RELAY_INSTRUCTIONS`           | built-in prompt  | System instructions           |
//! | `RELAY_SETTLE_DELAY_MS`        | `1000`           | Open → ready delay            |
//! | `RELAY_KEEPALIVE_SECS`         | `15`             | Idle time before a ping       |
//! | `RELAY_RECONNECT_DELAY_MS`     | `2000`           | Fixed reconnect backoff       |
//! | `RELAY_MAX_RECONNECT_ATTEMPTS` | `15`             | Consecutive failure cap       |
//! | `RELAY_STABLE_AFTER_SECS`      | `60`             | Fast/stable close threshold   |
//! | `RELAY_CONNECT_TIMEOUT_SECS`   | `10`             | Transport-open timeout        |
//! | `RELAY_QUEUE_CAPACITY`         | `4096`           | Outbound queue bound          |

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use realtime_relay::domain::{
    Credential, LinkPolicy, RelayConfig, RelayError, UpstreamConfig, DEFAULT_INSTRUCTIONS,
};
use realtime_relay::infrastructure::{run_server, StaticCredentialProvider};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// WebSocket relay between browser voice clients and a realtime API.
#[derive(Debug, Parser)]
#[command(
    name = "realtime-relay",
    about = "Relays browser voice sessions to a realtime conversational API",
    version
)]
struct Cli {
    /// IP address the client listener binds to.
    #[arg(long, default_value = "0.0.0.0", env = "RELAY_BIND")]
    bind: String,

    /// TCP port the client listener binds to.
    #[arg(long, default_value_t = 3000, env = "PORT")]
    port: u16,

    /// The only path on which WebSocket upgrades are accepted.
    #[arg(long, default_value = "/api/ws-proxy", env = "RELAY_WS_PATH")]
    ws_path: String,

    /// Upstream realtime endpoint (`wss://…`; `https://` is rewritten).
    #[arg(long, env = "AZURE_OPENAI_ENDPOINT")]
    endpoint: Option<String>,

    /// Value of the `api-version` query parameter.
    #[arg(long, env = "AZURE_OPENAI_API_VERSION")]
    api_version: Option<String>,

    /// Value of the `deployment` query parameter.
    #[arg(long, env = "AZURE_OPENAI_DEPLOYMENT")]
    deployment: Option<String>,

    /// Upstream API key.
    #[arg(long, env = "AZURE_OPENAI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Assistant voice requested in `session.update`.
    #[arg(long, default_value = "alloy", env = "RELAY_VOICE")]
    voice: String,

    /// System instructions sent on every link.
    #[arg(long, env = "RELAY_INSTRUCTIONS")]
    instructions: Option<String>,

    /// Delay between upstream transport-open and readiness, in milliseconds.
    #[arg(long, default_value_t = 1000, env = "RELAY_SETTLE_DELAY_MS")]
    settle_delay_ms: u64,

    /// Idle seconds on a ready link before a keepalive ping.
    #[arg(long, default_value_t = 15, env = "RELAY_KEEPALIVE_SECS")]
    keepalive_secs: u64,

    /// Fixed delay before each reconnect attempt, in milliseconds.
    #[arg(long, default_value_t = 2000, env = "RELAY_RECONNECT_DELAY_MS")]
    reconnect_delay_ms: u64,

    /// Consecutive failed connections after which a session gives up.
    #[arg(long, default_value_t = 15, env = "RELAY_MAX_RECONNECT_ATTEMPTS")]
    max_reconnect_attempts: u32,

    /// Seconds a connection must live to count as stable.
    #[arg(long, default_value_t = 60, env = "RELAY_STABLE_AFTER_SECS")]
    stable_after_secs: u64,

    /// Seconds allowed for one upstream transport-open attempt.
    #[arg(long, default_value_t = 10, env = "RELAY_CONNECT_TIMEOUT_SECS")]
    connect_timeout_secs: u64,

    /// Maximum client messages held while the upstream is not ready.
    #[arg(long, default_value_t = 4096, env = "RELAY_QUEUE_CAPACITY")]
    queue_capacity: usize,
}

impl Cli {
    /// Converts the parsed arguments into a validated [`RelayConfig`].
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Config`] when a required upstream setting is
    /// missing, the endpoint is not a WebSocket URL, or the bind address is
    /// invalid.
    fn into_relay_config(self) -> Result<RelayConfig, RelayError> {
        let bind_addr: SocketAddr = format!("{}:{}", self.bind, self.port)
            .parse()
            .map_err(|e| {
                RelayError::Config(format!(
                    "invalid bind address '{}:{}': {e}",
                    self.bind, self.port
                ))
            })?;

        let endpoint = required(self.endpoint, "--endpoint", "AZURE_OPENAI_ENDPOINT")?;
        let api_version = required(self.api_version, "--api-version", "AZURE_OPENAI_API_VERSION")?;
        let deployment = required(self.deployment, "--deployment", "AZURE_OPENAI_DEPLOYMENT")?;
        let api_key = required(self.api_key, "--api-key", "AZURE_OPENAI_API_KEY")?;

        let mut upstream = UpstreamConfig::from_parts(
            &endpoint,
            &api_version,
            &deployment,
            Credential::new(api_key),
        )?;
        upstream.voice = self.voice;
        upstream.instructions = self
            .instructions
            .filter(|text| !text.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_INSTRUCTIONS.to_string());

        let config = RelayConfig {
            bind_addr,
            ws_path: self.ws_path,
            upstream,
            link: LinkPolicy {
                settle_delay: Duration::from_millis(self.settle_delay_ms),
                keepalive_idle: Duration::from_secs(self.keepalive_secs),
                reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
                max_reconnect_attempts: self.max_reconnect_attempts,
                stable_after: Duration::from_secs(self.stable_after_secs),
                connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            },
            queue_capacity: self.queue_capacity,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Returns the trimmed value of a required setting.
fn required(value: Option<String>, flag: &str, env: &str) -> Result<String, RelayError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| RelayError::Config(format!("missing {flag} (or {env})")))
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // `.env.local` wins over `.env`; neither overrides the real environment.
    dotenv::from_filename(".env.local").ok();
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match cli.into_relay_config() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return Err(e.into());
        }
    };

    info!(
        "realtime relay starting: listen={}{} upstream={}://{}{}",
        config.bind_addr,
        config.ws_path,
        config.upstream.url.scheme(),
        config.upstream.url.host_str().unwrap_or("?"),
        config.upstream.url.path()
    );

    let credentials = Arc::new(StaticCredentialProvider::new(
        config.upstream.credential.clone(),
    ));

    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C; shutting down");
                running_clone.store(false, Ordering::Relaxed);
            }
            Err(e) => error!("failed to listen for Ctrl+C signal: {e}"),
        }
    });

    run_server(config, credentials, running).await?;

    info!("realtime relay stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
