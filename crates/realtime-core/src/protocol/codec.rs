//! JSON codec for client and upstream frames.
//!
//! Every frame on both sockets is a single JSON object carried in one
//! WebSocket text message, discriminated by its `"type"` field.
//!
//! Decoding is lenient where the relay must be lenient: an unknown client
//! `type` is not an error (see [`ClientMessage::Other`]), and upstream frames
//! are only inspected, never rebuilt, except for the one patch documented on
//! [`prepare_upstream_frame_for_client`].

use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::protocol::client::{ClientMessage, RelayFrame};
use crate::protocol::upstream::{UpstreamCommand, UpstreamEvent};

/// Message delivered to the client when an upstream error frame carries no
/// usable text of its own.
pub const DEFAULT_UPSTREAM_ERROR_MESSAGE: &str =
    "The realtime service reported an error without details";

/// Errors that can occur while decoding or encoding a frame.
#[derive(Debug, Error, PartialEq)]
pub enum CodecError {
    /// The text is not valid JSON.
    #[error("malformed JSON: {0}")]
    MalformedJson(String),

    /// The JSON value is not an object.
    #[error("frame is not a JSON object")]
    NotAnObject,

    /// The object has no string `type` field.
    #[error("frame has no string \"type\" field")]
    MissingType,

    /// A known frame type is missing a field or has one of the wrong shape.
    #[error("invalid {kind} frame: {reason}")]
    InvalidField { kind: String, reason: String },

    /// A value could not be serialized.
    #[error("serialization failed: {0}")]
    Serialize(String),
}

// ── Client frames ─────────────────────────────────────────────────────────────

/// Field set of a client `audio` frame.
#[derive(Deserialize)]
struct AudioFields {
    data: String,
    #[serde(default)]
    format: Option<String>,
}

/// Decodes one text frame received from the client.
///
/// # Errors
///
/// - [`CodecError::MalformedJson`] / [`CodecError::NotAnObject`] /
///   [`CodecError::MissingType`] when the frame has no usable envelope.
/// - [`CodecError::InvalidField`] when an `audio` frame has no string `data`.
///
/// Unknown `type` values decode successfully as [`ClientMessage::Other`].
///
/// # Example
///
/// ```rust
/// use realtime_core::{decode_client_frame, ClientMessage};
///
/// let msg = decode_client_frame(r#"{"type":"end_of_audio"}"#).unwrap();
/// assert_eq!(msg, ClientMessage::EndOfAudio);
/// ```
pub fn decode_client_frame(text: &str) -> Result<ClientMessage, CodecError> {
    let (kind, value) = parse_envelope(text)?;

    match kind.as_str() {
        "audio" => {
            let fields: AudioFields =
                serde_json::from_value(value).map_err(|e| CodecError::InvalidField {
                    kind: kind.clone(),
                    reason: e.to_string(),
                })?;
            Ok(ClientMessage::Audio {
                data: fields.data,
                format: fields.format,
            })
        }
        "end_of_audio" => Ok(ClientMessage::EndOfAudio),
        _ => Ok(ClientMessage::Other { kind }),
    }
}

/// Encodes a relay-generated frame for the client.
///
/// # Errors
///
/// Returns [`CodecError::Serialize`] if serialization fails.
pub fn encode_relay_frame(frame: &RelayFrame) -> Result<String, CodecError> {
    serde_json::to_string(frame).map_err(|e| CodecError::Serialize(e.to_string()))
}

// ── Upstream frames ───────────────────────────────────────────────────────────

/// Encodes a command for the upstream socket.
///
/// # Errors
///
/// Returns [`CodecError::Serialize`] if serialization fails.
pub fn encode_upstream_command(command: &UpstreamCommand) -> Result<String, CodecError> {
    serde_json::to_string(command).map_err(|e| CodecError::Serialize(e.to_string()))
}

/// Classifies an inbound upstream frame without modifying it.
///
/// # Errors
///
/// Returns an envelope error when the frame is not a JSON object with a
/// string `type`.
pub fn inspect_upstream_frame(text: &str) -> Result<UpstreamEvent, CodecError> {
    let (kind, value) = parse_envelope(text)?;
    let message = match &value {
        Value::Object(map) => error_message_of(map),
        _ => None,
    };
    Ok(UpstreamEvent::classify(&kind, message))
}

/// Prepares an upstream frame for delivery to the client.
///
/// Frames are returned byte-for-byte unchanged, with one exception: an
/// `error` frame whose top-level `message` is absent, `null`, empty, or not a
/// string gets a `message` field inserted.  The inserted text is the nested
/// `error.message` when the upstream provided one, otherwise
/// [`DEFAULT_UPSTREAM_ERROR_MESSAGE`].  All other fields are kept.
///
/// # Errors
///
/// Returns an envelope error when the frame is not a JSON object with a
/// string `type`; such frames are not forwarded.
///
/// # Example
///
/// ```rust
/// use realtime_core::prepare_upstream_frame_for_client;
///
/// let (_, text) = prepare_upstream_frame_for_client(r#"{"type":"error"}"#).unwrap();
/// let value: serde_json::Value = serde_json::from_str(&text).unwrap();
/// assert!(!value["message"].as_str().unwrap().is_empty());
/// ```
pub fn prepare_upstream_frame_for_client(
    text: &str,
) -> Result<(UpstreamEvent, String), CodecError> {
    let (kind, value) = parse_envelope(text)?;
    let Value::Object(mut map) = value else {
        return Err(CodecError::NotAnObject);
    };

    if kind != "error" {
        let event = UpstreamEvent::classify(&kind, None);
        return Ok((event, text.to_string()));
    }

    if let Some(top_level) = non_empty_str(map.get("message")) {
        let event = UpstreamEvent::Error {
            message: Some(top_level.to_string()),
        };
        return Ok((event, text.to_string()));
    }

    let nested = map
        .get("error")
        .and_then(Value::as_object)
        .and_then(|inner| non_empty_str(inner.get("message")))
        .map(str::to_string);
    let event = UpstreamEvent::Error {
        message: nested.clone(),
    };
    let message = nested.unwrap_or_else(|| DEFAULT_UPSTREAM_ERROR_MESSAGE.to_string());
    map.insert("message".to_string(), Value::String(message));

    let patched =
        serde_json::to_string(&map).map_err(|e| CodecError::Serialize(e.to_string()))?;
    Ok((event, patched))
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Parses `text` and returns its `type` tag alongside the full value.
fn parse_envelope(text: &str) -> Result<(String, Value), CodecError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| CodecError::MalformedJson(e.to_string()))?;
    let kind = match &value {
        Value::Object(map) => map
            .get("type")
            .and_then(Value::as_str)
            .ok_or(CodecError::MissingType)?
            .to_string(),
        _ => return Err(CodecError::NotAnObject),
    };
    Ok((kind, value))
}

/// Best available error text: top-level `message`, then `error.message`.
fn error_message_of(map: &Map<String, Value>) -> Option<String> {
    non_empty_str(map.get("message"))
        .or_else(|| {
            map.get("error")
                .and_then(Value::as_object)
                .and_then(|inner| non_empty_str(inner.get("message")))
        })
        .map(str::to_string)
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
