//! Frame types for the client-facing WebSocket protocol.
//!
//! The browser speaks a deliberately small JSON vocabulary.  Every frame is a
//! JSON object with a `"type"` field identifying the variant:
//!
//! ```text
//! Client → Relay:  {"type":"audio","data":"<base64>","format":"webm;codecs=opus"}
//!                  {"type":"end_of_audio"}
//! Relay  → Client: {"type":"status","status":"connected"}
//!                  {"type":"status","status":"disconnected","code":1006,"reason":"..."}
//!                  {"type":"status","status":"reconnecting"}
//!                  {"type":"error","message":"..."}
//! ```
//!
//! Upstream content frames are forwarded to the client verbatim and therefore
//! have no type in this module.

use serde::{Deserialize, Serialize};

// ── Client → Relay ────────────────────────────────────────────────────────────

/// A decoded frame received from the client.
///
/// Produced by [`crate::decode_client_frame`].  Unknown `type` tags do not
/// fail decoding; they surface as [`ClientMessage::Other`] so the relay can
/// log and ignore them without treating them as protocol violations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// One chunk of recorded audio.
    Audio {
        /// Base64-encoded audio payload.  Passed through untouched.
        data: String,
        /// Declared container/codec, e.g. `webm;codecs=opus`.
        format: Option<String>,
    },

    /// The user stopped recording; the upstream should answer now.
    EndOfAudio,

    /// Any frame whose `type` tag the relay does not understand.
    Other {
        /// The unrecognised `type` value.
        kind: String,
    },
}

impl ClientMessage {
    /// Returns a short, log-safe name for the variant.
    ///
    /// Never includes payload data.
    pub fn kind(&self) -> &str {
        match self {
            ClientMessage::Audio { .. } => "audio",
            ClientMessage::EndOfAudio => "end_of_audio",
            ClientMessage::Other { kind } => kind,
        }
    }
}

// ── Relay → Client ────────────────────────────────────────────────────────────

/// Connection status reported to the client in a `status` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientStatus {
    /// The upstream link is ready; audio will be delivered immediately.
    Connected,
    /// The upstream link dropped.
    Disconnected,
    /// A reconnect attempt has been scheduled.
    Reconnecting,
}

/// A frame generated by the relay itself and sent to the client.
///
/// # Serde representation
///
/// ```json
/// {"type":"status","status":"disconnected","code":1006,"reason":"reset"}
/// {"type":"error","message":"upstream unavailable"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayFrame {
    /// A lifecycle transition of the upstream link.
    Status {
        status: ClientStatus,
        /// WebSocket close code, present on `disconnected` when one was received.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<u16>,
        /// Human-readable close reason, present on `disconnected`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// An error the client should display.
    Error { message: String },
}

impl RelayFrame {
    /// `{"type":"status","status":"connected"}`
    pub fn connected() -> Self {
        RelayFrame::Status {
            status: ClientStatus::Connected,
            code: None,
            reason: None,
        }
    }

    /// `{"type":"status","status":"disconnected", ...}`
    pub fn disconnected(code: Option<u16>, reason: impl Into<String>) -> Self {
        RelayFrame::Status {
            status: ClientStatus::Disconnected,
            code,
            reason: Some(reason.into()),
        }
    }

    /// `{"type":"status","status":"reconnecting"}`
    pub fn reconnecting() -> Self {
        RelayFrame::Status {
            status: ClientStatus::Reconnecting,
            code: None,
            reason: None,
        }
    }

    /// `{"type":"error","message":...}`
    pub fn error(message: impl Into<String>) -> Self {
        RelayFrame::Error {
            message: message.into(),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
