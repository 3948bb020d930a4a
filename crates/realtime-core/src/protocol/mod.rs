//! Protocol module containing the two frame vocabularies and the JSON codec.

pub mod client;
pub mod codec;
pub mod upstream;

pub use client::*;
pub use codec::{
    decode_client_frame, encode_relay_frame, encode_upstream_command, inspect_upstream_frame,
    prepare_upstream_frame_for_client, CodecError,
};
pub use upstream::*;
