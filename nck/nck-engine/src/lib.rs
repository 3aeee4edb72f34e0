//! Authoritative simulation engine for the unit construction kit.
//!
//! A cloud of rigid structural units interacts through short-range central
//! repulsion and directed site-to-site bond attraction inside a periodic
//! domain. One thread owns all writes; everyone else talks to it through a
//! bounded request queue and reads it through versioned snapshot buffers.
//!
//! # Architecture
//!
//! ```text
//! UI / protocol threads          Simulation thread            Readers
//!        |                            |                          |
//!        |--SimulationHandle--------->| drain requests           |
//!        |   (bounded request queue)  | two-pass midpoint step   |
//!        |                            | apply requests           |
//!        |                            | update bonds             |
//!        |                            | publish snapshot ------->| lock_newest()
//!        |                            | sleep / pause            |
//! ```
//!
//! The engine's spatial structure is a uniform periodic grid sized to the
//! largest interaction radius, so all force and bond queries are
//! 27-neighbour sweeps. Bonds live in a symmetric hash map with one
//! directed entry per end. Picks override dynamics kinematically and are
//! tracked both in a ledger and on the unit states themselves.

#![warn(missing_docs)]

pub mod bonds;
pub mod config;
pub mod grid;
mod kernel;
pub mod persist;
pub mod picks;
pub mod queue;
pub mod request;
mod runner;
mod sim;

pub use nck_sync::{SnapshotBuffer, SnapshotReader};

pub use config::{ConfigError, EngineConfig, UnitTypeSection};
pub use persist::{FormatError, SavedState, FILE_TAG};
pub use queue::EnqueueError;
pub use request::{EngineEvent, LoadSource, SaveCompleteCallback, SaveSink, UiRequest};
pub use runner::SimulationRunner;
pub use sim::{SessionInfo, Simulation, SimulationHandle};
