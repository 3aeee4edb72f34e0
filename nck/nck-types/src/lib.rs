//! Shared data model for the unit construction kit.
//!
//! This is the leaf crate of the workspace: identifier newtypes, geometry
//! aliases, the immutable unit-type registry records, per-unit dynamic
//! state, snapshot arrays, and the little-endian wire primitives used by
//! both the persisted state format and the network protocol.
//!
//! All scalar quantities are `f32`: that is the width of the persisted and
//! broadcast formats, and the simulation state keeps the same width so that
//! a save/load round trip is bit-exact.

#![warn(missing_docs)]

pub mod domain;
pub mod id;
pub mod params;
pub mod unit;
pub mod wire;

pub use domain::Domain;
pub use id::{PickId, SessionId, UnitTypeId};
pub use params::Parameters;
pub use unit::{
    BondSite, ReducedUnitState, ReducedUnitStateArray, StateArray, UnitState, UnitStateArray,
    UnitType, UnitTypeError,
};
pub use wire::Wire;

/// Scalar type used throughout the simulation, file format, and protocol.
pub type Scalar = f32;

/// A position in the simulation domain.
pub type Point = nalgebra::Point3<Scalar>;

/// A displacement, velocity, force, or torque.
pub type Vector = nalgebra::Vector3<Scalar>;

/// An orientation, stored as a unit quaternion.
pub type Rotation = nalgebra::UnitQuaternion<Scalar>;

/// A 3x3 tensor (moment of inertia and its inverse).
pub type Tensor = nalgebra::Matrix3<Scalar>;

/// Dense index into the unit state array.
pub type UnitIndex = u32;
