//! Requests from front ends to the simulation thread.

use std::fmt;
use std::io::{Read, Write};

use nck_types::{PickId, Point, Rotation, Scalar, SessionId, UnitTypeId, Vector};

/// Callback invoked on the simulation thread once a save request has been
/// written to its sink.
pub type SaveCompleteCallback = Box<dyn FnOnce() + Send>;

/// A byte sink for save requests, released on the simulation thread when
/// the request completes.
pub type SaveSink = Box<dyn Write + Send>;

/// A byte source for load requests, released on the simulation thread when
/// the request completes.
pub type LoadSource = Box<dyn Read + Send>;

/// One queued UI request.
///
/// Requests are value-typed; the only owned resources are the I/O handles
/// and completion callbacks of save/load, which travel into the simulation
/// thread and die there.
pub enum UiRequest {
    /// Pick the unit nearest a query sphere, optionally with everything
    /// bonded to it.
    PickPoint {
        /// Pick id allocated by the requesting peer.
        pick_id: PickId,
        /// Centre of the query sphere.
        position: Point,
        /// Radius of the query sphere.
        radius: Scalar,
        /// Orientation of the pick frame.
        orientation: Rotation,
        /// Whether to flood-fill across bonds.
        connected: bool,
    },
    /// Ray pick. Carried for protocol completeness; the engine drops it.
    PickRay {
        /// Pick id allocated by the requesting peer.
        pick_id: PickId,
        /// Ray origin.
        origin: Point,
        /// Ray direction.
        direction: Vector,
        /// Orientation of the pick frame.
        orientation: Rotation,
        /// Whether to flood-fill across bonds.
        connected: bool,
    },
    /// Instantiate the copy buffer at a pose, picked under `pick_id`.
    Paste {
        /// Pick id that will own the pasted units.
        pick_id: PickId,
        /// Target position of the paste frame.
        position: Point,
        /// Target orientation of the paste frame.
        orientation: Rotation,
        /// Initial linear velocity, in real-time units.
        linear_velocity: Vector,
        /// Initial angular velocity, in real-time units.
        angular_velocity: Vector,
    },
    /// Create one new unit if `pick_id` has no ledger entry.
    Create {
        /// Pick id that will own the created unit.
        pick_id: PickId,
        /// Type of the new unit.
        unit_type: UnitTypeId,
        /// Initial position.
        position: Point,
        /// Initial orientation.
        orientation: Rotation,
        /// Initial linear velocity, in real-time units.
        linear_velocity: Vector,
        /// Initial angular velocity, in real-time units.
        angular_velocity: Vector,
    },
    /// Drive every unit of a pick to a new pose kinematically.
    SetState {
        /// The pick to drive.
        pick_id: PickId,
        /// New position of the pick frame.
        position: Point,
        /// New orientation of the pick frame.
        orientation: Rotation,
        /// Pick-frame linear velocity, in real-time units.
        linear_velocity: Vector,
        /// Pick-frame angular velocity, in real-time units.
        angular_velocity: Vector,
    },
    /// Snapshot the picked set into the copy buffer.
    Copy {
        /// The pick to copy.
        pick_id: PickId,
    },
    /// Destroy every unit of a pick and compact the state array.
    Destroy {
        /// The pick to destroy.
        pick_id: PickId,
    },
    /// Release a pick, returning its units to free dynamics.
    Release {
        /// The pick to release.
        pick_id: PickId,
    },
    /// Serialise the current state to the given sink.
    SaveState {
        /// Destination of the serialised state.
        sink: SaveSink,
        /// Invoked after the sink has been written and flushed.
        on_complete: Option<SaveCompleteCallback>,
    },
    /// Replace the whole session from the given source.
    LoadState {
        /// Source of the serialised state.
        source: LoadSource,
        /// Session id that becomes current if the load succeeds.
        session_id: SessionId,
    },
}

impl fmt::Debug for UiRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PickPoint { pick_id, .. } => write!(f, "PickPoint({pick_id})"),
            Self::PickRay { pick_id, .. } => write!(f, "PickRay({pick_id})"),
            Self::Paste { pick_id, .. } => write!(f, "Paste({pick_id})"),
            Self::Create { pick_id, unit_type, .. } => {
                write!(f, "Create({pick_id}, {unit_type})")
            }
            Self::SetState { pick_id, .. } => write!(f, "SetState({pick_id})"),
            Self::Copy { pick_id } => write!(f, "Copy({pick_id})"),
            Self::Destroy { pick_id } => write!(f, "Destroy({pick_id})"),
            Self::Release { pick_id } => write!(f, "Release({pick_id})"),
            Self::SaveState { .. } => write!(f, "SaveState"),
            Self::LoadState { session_id, .. } => write!(f, "LoadState({session_id})"),
        }
    }
}

/// Event raised by the engine on its own thread and observed by front ends
/// through a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    /// A load completed and the given session became current.
    SessionChanged(SessionId),
}
