//! Transport abstractions the plugins are written against.
//!
//! The host runtime supplies an ordered reliable frame channel per peer
//! and a bulk-stream facility for large blobs; the plugins only ever see
//! these traits. Test harnesses implement them in memory.

use std::io::{Read, Write};

use thiserror::Error;

/// Identifier the host runtime assigns to a connected client.
pub type ClientId = u32;

/// Identifier of a bulk stream between two peers.
pub type StreamId = u32;

/// Error obtaining or attaching a bulk stream.
#[derive(Debug, Error)]
pub enum BulkStreamError {
    /// The referenced stream id is unknown to the facility.
    #[error("unknown bulk stream {stream}")]
    UnknownStream {
        /// The offending stream id.
        stream: StreamId,
    },

    /// The underlying transport failed.
    #[error("bulk stream transport failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Ordered reliable frame channel to a single peer.
pub trait FrameChannel: Send + Sync {
    /// Queue one frame for delivery. Delivery order is send order.
    fn send(&self, frame: &[u8]);
}

/// Server-side sending surface over all connected clients.
pub trait ServerTransport: Send + Sync {
    /// Queue a frame to one client.
    fn send(&self, client: ClientId, frame: &[u8]);

    /// Queue a frame to every connected client, optionally excluding one
    /// (typically the request's originator).
    fn broadcast(&self, except: Option<ClientId>, frame: &[u8]);
}

/// Server-side bulk stream facility.
pub trait ServerBulkStreams: Send + Sync {
    /// Create an outbound stream whose contents are forwarded to the given
    /// client; returns the stream id announced to that client and the sink
    /// the engine writes into.
    ///
    /// # Errors
    ///
    /// Returns [`BulkStreamError`] if the stream cannot be established.
    fn forward_out_stream(
        &self,
        client: ClientId,
    ) -> Result<(StreamId, Box<dyn Write + Send>), BulkStreamError>;

    /// Attach to an inbound stream previously announced by the given
    /// client.
    ///
    /// # Errors
    ///
    /// Returns [`BulkStreamError::UnknownStream`] for ids the facility has
    /// not seen.
    fn accept_in_stream(
        &self,
        client: ClientId,
        stream: StreamId,
    ) -> Result<Box<dyn Read + Send>, BulkStreamError>;
}

/// Client-side bulk stream facility.
pub trait ClientBulkStreams: Send + Sync {
    /// Create an outbound stream to the server; returns the id to announce
    /// and the sink to write.
    ///
    /// # Errors
    ///
    /// Returns [`BulkStreamError`] if the stream cannot be established.
    fn create_out_stream(&self) -> Result<(StreamId, Box<dyn Write + Send>), BulkStreamError>;

    /// Attach to an inbound stream announced by the server.
    ///
    /// # Errors
    ///
    /// Returns [`BulkStreamError::UnknownStream`] for ids the facility has
    /// not seen.
    fn accept_in_stream(&self, stream: StreamId) -> Result<Box<dyn Read + Send>, BulkStreamError>;
}
