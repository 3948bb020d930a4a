//! # realtime-core
//!
//! Shared frame types and the JSON codec for the realtime voice relay.
//!
//! The relay sits between a browser ("the client") and a remote realtime
//! conversational API ("upstream").  Both sides speak JSON text frames over
//! WebSocket, but with different vocabularies:
//!
//! - **Client side** – a deliberately small schema: audio chunks, an
//!   end-of-audio marker, and status / error frames coming back.
//! - **Upstream side** – the richer session protocol: authentication,
//!   `session.update`, `input_audio_buffer.*`, `response.create`, and the
//!   stream of content events the upstream emits.
//!
//! This crate defines both vocabularies and the pure functions that move
//! frames between text and typed values.  It performs no I/O and has no
//! async runtime dependency, so every rule here is unit-testable in isolation.
//!
//! - **`protocol::client`** – [`ClientMessage`] (client → relay) and
//!   [`RelayFrame`] (relay → client).
//! - **`protocol::upstream`** – [`UpstreamCommand`] (relay → upstream) and
//!   [`UpstreamEvent`] (upstream → relay, classified for logging only).
//! - **`protocol::codec`** – decode / encode entry points and [`CodecError`].

pub mod protocol;

pub use protocol::client::{ClientMessage, ClientStatus, RelayFrame};
pub use protocol::codec::{
    decode_client_frame, encode_relay_frame, encode_upstream_command, inspect_upstream_frame,
    prepare_upstream_frame_for_client, CodecError, DEFAULT_UPSTREAM_ERROR_MESSAGE,
};
pub use protocol::upstream::{
    ConversationItem, ItemContent, SessionSettings, UpstreamCommand, UpstreamEvent,
};
