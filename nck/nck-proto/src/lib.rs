//! Client/server protocol of the unit construction kit.
//!
//! Eleven client messages and five server messages, carried as binary
//! frames over an ordered reliable channel per peer. Message identifiers
//! are positional within the plugin; a handshake assigns each side a
//! concrete message base which is added to the positional id on the wire.
//! Large blobs (saved state) never travel in frames: they go through the
//! host runtime's bulk-stream facility and are referenced by stream id.

#![warn(missing_docs)]

mod message;
mod transport;

pub use message::{ClientMessage, ProtocolError, ServerMessage, SessionUpdate};
pub use transport::{
    BulkStreamError, ClientBulkStreams, ClientId, FrameChannel, ServerBulkStreams,
    ServerTransport, StreamId,
};

/// Name under which the protocol registers with the host runtime.
pub const PROTOCOL_NAME: &str = "NCK";

/// Protocol version; major number in the upper 16 bits.
pub const PROTOCOL_VERSION: u32 = 2 << 16;
