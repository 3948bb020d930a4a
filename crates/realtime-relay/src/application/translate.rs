//! Translation between the client protocol and the upstream protocol.
//!
//! All functions here are pure.  The session relay calls
//! [`translate_client_message`] for every decoded client frame and
//! [`status_frame_for`] for every link lifecycle event.

use realtime_core::{ClientMessage, ConversationItem, RelayFrame, SessionSettings, UpstreamCommand};

use crate::domain::{Credential, RelayError, UpstreamConfig};

use super::link_state::LinkEvent;

// ── Client → Upstream ─────────────────────────────────────────────────────────

/// Maps one client message to the upstream commands it stands for.
///
/// | Client frame      | Upstream commands                                   |
/// |-------------------|-----------------------------------------------------|
/// | `audio`           | `input_audio_buffer.append`                         |
/// | `end_of_audio`    | `input_audio_buffer.commit`, then `response.create` |
/// | anything else     | none                                                |
///
/// The audio payload is moved through untouched.
pub fn translate_client_message(message: ClientMessage) -> Vec<UpstreamCommand> {
    match message {
        ClientMessage::Audio { data, format } => vec![UpstreamCommand::InputAudioBufferAppend {
            audio: data,
            encoding: format,
        }],
        ClientMessage::EndOfAudio => vec![
            UpstreamCommand::InputAudioBufferCommit,
            UpstreamCommand::ResponseCreate,
        ],
        ClientMessage::Other { .. } => Vec::new(),
    }
}

// ── Per-link setup ────────────────────────────────────────────────────────────

/// The first frame on every freshly opened upstream transport.
pub fn authentication_command(credential: &Credential) -> UpstreamCommand {
    UpstreamCommand::Authentication {
        api_key: credential.expose().to_string(),
    }
}

/// Session configuration sent once the link becomes ready, before any queued
/// client content.
pub fn link_setup_commands(upstream: &UpstreamConfig) -> Vec<UpstreamCommand> {
    vec![
        UpstreamCommand::SessionUpdate {
            session: SessionSettings::new(upstream.voice.clone(), upstream.instructions.clone()),
        },
        UpstreamCommand::ConversationItemCreate {
            item: ConversationItem::system_message(upstream.instructions.clone()),
        },
    ]
}

// ── Link events → Client ──────────────────────────────────────────────────────

/// The relay-generated frame reporting a link event to the client, if any.
///
/// `Ended` has no frame of its own: the preceding `Disconnected` already told
/// the client, and the session closes the client socket right after.
pub fn status_frame_for(event: &LinkEvent) -> Option<RelayFrame> {
    match event {
        LinkEvent::Ready => Some(RelayFrame::connected()),
        LinkEvent::Disconnected { code, reason } => {
            Some(RelayFrame::disconnected(*code, reason.clone()))
        }
        LinkEvent::Reconnecting { .. } => Some(RelayFrame::reconnecting()),
        LinkEvent::Ended { .. } => None,
        LinkEvent::Exhausted { attempts } => Some(RelayFrame::error(
            RelayError::ExhaustedRetries {
                attempts: *attempts,
            }
            .to_string(),
        )),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
