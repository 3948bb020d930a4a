//! Application layer: link lifecycle, outbound buffering and translation.
//!
//! Everything here is free of sockets.  The infrastructure layer feeds
//! transport events and clock readings in and carries the resulting commands
//! out.

pub mod link_state;
pub mod outbound_queue;
pub mod translate;

pub use link_state::{
    LinkCommand, LinkError, LinkEvent, LinkMachine, LinkState, TransportLoss, NORMAL_CLOSE_CODE,
};
pub use outbound_queue::{DrainReport, OutboundQueue, QueueError, UpstreamSink};
pub use translate::{
    authentication_command, link_setup_commands, status_frame_for, translate_client_message,
};
