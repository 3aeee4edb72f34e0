//! Snapshot synchronisation primitives.
//!
//! One writer, many reader cursors, no blocking on either side beyond a
//! brief slot lock: the versioned triple buffer here is the only vehicle by
//! which non-writer threads observe a simulation, both server-side (the
//! engine publishing full states) and client-side (the network mirror
//! publishing reduced states).

#![warn(missing_docs)]

mod triple;

pub use triple::{SnapshotBuffer, SnapshotReader};
