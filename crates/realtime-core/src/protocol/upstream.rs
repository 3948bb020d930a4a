//! Frame types for the upstream realtime session protocol.
//!
//! The relay produces a handful of commands and otherwise treats upstream
//! output as opaque JSON that is forwarded to the client.  The only inbound
//! inspection is classification ([`UpstreamEvent`]) for logging and for
//! patching error frames that lack a message.
//!
//! ```text
//! Relay → Upstream:  {"type":"authentication","apiKey":"..."}
//!                    {"type":"session.update","session":{...}}
//!                    {"type":"conversation.item.create","item":{...}}
//!                    {"type":"input_audio_buffer.append","audio":"<base64>","encoding":"webm"}
//!                    {"type":"input_audio_buffer.commit"}
//!                    {"type":"response.create"}
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

// ── Relay → Upstream ──────────────────────────────────────────────────────────

/// A command the relay sends to the upstream session.
///
/// `Debug` is implemented by hand so the credential carried by
/// [`UpstreamCommand::Authentication`] never reaches a log line.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum UpstreamCommand {
    /// First frame after transport-open.
    #[serde(rename = "authentication")]
    Authentication {
        #[serde(rename = "apiKey")]
        api_key: String,
    },

    /// Voice and session configuration, sent once per link after readiness.
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionSettings },

    /// Adds an item to the conversation; used for the system prompt.
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },

    /// Appends one audio chunk to the upstream input buffer.
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend {
        audio: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        encoding: Option<String>,
    },

    /// Closes the current input buffer as one user turn.
    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit,

    /// Asks the upstream to generate a response for the committed turn.
    #[serde(rename = "response.create")]
    ResponseCreate,
}

impl UpstreamCommand {
    /// Returns the wire `type` of the command.  Safe to log.
    pub fn kind(&self) -> &'static str {
        match self {
            UpstreamCommand::Authentication { .. } => "authentication",
            UpstreamCommand::SessionUpdate { .. } => "session.update",
            UpstreamCommand::ConversationItemCreate { .. } => "conversation.item.create",
            UpstreamCommand::InputAudioBufferAppend { .. } => "input_audio_buffer.append",
            UpstreamCommand::InputAudioBufferCommit => "input_audio_buffer.commit",
            UpstreamCommand::ResponseCreate => "response.create",
        }
    }
}

impl fmt::Debug for UpstreamCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamCommand::Authentication { .. } => f
                .debug_struct("Authentication")
                .field("api_key", &"<redacted>")
                .finish(),
            UpstreamCommand::SessionUpdate { session } => f
                .debug_struct("SessionUpdate")
                .field("session", session)
                .finish(),
            UpstreamCommand::ConversationItemCreate { item } => f
                .debug_struct("ConversationItemCreate")
                .field("item", item)
                .finish(),
            UpstreamCommand::InputAudioBufferAppend { audio, encoding } => f
                .debug_struct("InputAudioBufferAppend")
                .field("audio_len", &audio.len())
                .field("encoding", encoding)
                .finish(),
            UpstreamCommand::InputAudioBufferCommit => f.write_str("InputAudioBufferCommit"),
            UpstreamCommand::ResponseCreate => f.write_str("ResponseCreate"),
        }
    }
}

/// Body of a `session.update` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Output modalities, normally `["text", "audio"]`.
    pub modalities: Vec<String>,
    /// Assistant voice name.
    pub voice: String,
    /// System instructions for the assistant.
    pub instructions: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_audio_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_audio_format: Option<String>,
}

impl SessionSettings {
    /// Settings for a text + audio session with the given voice and prompt.
    pub fn new(voice: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            modalities: vec!["text".to_string(), "audio".to_string()],
            voice: voice.into(),
            instructions: instructions.into(),
            input_audio_format: None,
            output_audio_format: None,
        }
    }
}

/// A conversation item as accepted by `conversation.item.create`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationItem {
    #[serde(rename = "type")]
    pub kind: String,
    pub role: String,
    pub content: Vec<ItemContent>,
}

impl ConversationItem {
    /// A `system` role message holding one text part.
    pub fn system_message(text: impl Into<String>) -> Self {
        Self {
            kind: "message".to_string(),
            role: "system".to_string(),
            content: vec![ItemContent {
                kind: "input_text".to_string(),
                text: text.into(),
            }],
        }
    }
}

/// One content part of a [`ConversationItem`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemContent {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

// ── Upstream → Relay ──────────────────────────────────────────────────────────

/// Classification of an inbound upstream frame.
///
/// The relay never reshapes upstream content; this type exists so the relay
/// can log what passed through and recognise error frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamEvent {
    /// Session and buffer bookkeeping (`session.*`, `input_audio_buffer.*`,
    /// `rate_limits.*`).
    Status { kind: String },
    /// Assistant output (`response.*`, `conversation.*`).
    Content { kind: String },
    /// An upstream error frame.  `message` is `None` when the upstream sent
    /// no usable message text.
    Error { message: Option<String> },
    /// Anything else.
    Other { kind: String },
}

impl UpstreamEvent {
    /// Classifies a frame by its `type` tag.
    pub fn classify(kind: &str, message: Option<String>) -> Self {
        if kind == "error" {
            return UpstreamEvent::Error { message };
        }
        let kind_owned = kind.to_string();
        if kind.starts_with("session.")
            || kind.starts_with("input_audio_buffer.")
            || kind.starts_with("rate_limits.")
        {
            UpstreamEvent::Status { kind: kind_owned }
        } else if kind.starts_with("response.") || kind.starts_with("conversation.") {
            UpstreamEvent::Content { kind: kind_owned }
        } else {
            UpstreamEvent::Other { kind: kind_owned }
        }
    }

    /// Returns the frame's `type` tag.
    pub fn kind(&self) -> &str {
        match self {
            UpstreamEvent::Status { kind }
            | UpstreamEvent::Content { kind }
            | UpstreamEvent::Other { kind } => kind,
            UpstreamEvent::Error { .. } => "error",
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
