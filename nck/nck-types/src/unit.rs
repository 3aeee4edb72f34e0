//! Unit-type registry records and per-unit dynamic state.

use thiserror::Error;

use crate::{PickId, Point, Rotation, Scalar, SessionId, Tensor, UnitTypeId, Vector};

/// Error validating a unit-type definition.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum UnitTypeError {
    /// Mass must be positive and finite.
    #[error("unit type {name:?} has invalid mass {mass}")]
    InvalidMass {
        /// Name of the offending type.
        name: String,
        /// The rejected mass value.
        mass: Scalar,
    },

    /// The moment-of-inertia tensor must be invertible.
    #[error("unit type {name:?} has a singular moment-of-inertia tensor")]
    SingularInertia {
        /// Name of the offending type.
        name: String,
    },
}

/// A potential bonding site on a unit, as a body-frame offset from the
/// unit's centre of gravity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BondSite {
    /// Site offset in the unit's local coordinate system.
    pub offset: Vector,
}

impl BondSite {
    /// Create a bond site from its body-frame offset.
    #[must_use]
    pub const fn new(offset: Vector) -> Self {
        Self { offset }
    }

    /// The site's offset rotated into world space for the given orientation.
    #[must_use]
    pub fn world_offset(&self, orientation: &Rotation) -> Vector {
        orientation * self.offset
    }
}

/// Immutable definition of a kind of structural unit.
///
/// Unit types are read-only after session start; the inverse mass and
/// inverse inertia tensor are precomputed once so the integrator's hot path
/// never divides or inverts.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitType {
    /// Human-readable type name.
    pub name: String,
    /// Radius of the central repelling force.
    pub radius: Scalar,
    /// Total mass.
    pub mass: Scalar,
    /// Precomputed `1 / mass`.
    pub inv_mass: Scalar,
    /// Moment of inertia about the centre of gravity.
    pub moment_of_inertia: Tensor,
    /// Precomputed inverse of the moment of inertia.
    pub inv_moment_of_inertia: Tensor,
    /// Potential bonding sites in body-frame coordinates.
    pub bond_sites: Vec<BondSite>,
    /// Render mesh vertices; opaque to the engine, carried in the session.
    pub mesh_vertices: Vec<Point>,
    /// Render mesh triangles as index triplets into `mesh_vertices`.
    pub mesh_triangles: Vec<u32>,
}

impl UnitType {
    /// Create a unit type, validating the mass and inverting the inertia
    /// tensor.
    ///
    /// # Errors
    ///
    /// Returns [`UnitTypeError`] if the mass is not positive and finite or
    /// the inertia tensor is singular.
    pub fn new(
        name: impl Into<String>,
        radius: Scalar,
        mass: Scalar,
        moment_of_inertia: Tensor,
        bond_sites: Vec<BondSite>,
        mesh_vertices: Vec<Point>,
        mesh_triangles: Vec<u32>,
    ) -> Result<Self, UnitTypeError> {
        let name = name.into();
        if !(mass.is_finite() && mass > 0.0) {
            return Err(UnitTypeError::InvalidMass { name, mass });
        }
        let inv_moment_of_inertia = moment_of_inertia
            .try_inverse()
            .ok_or_else(|| UnitTypeError::SingularInertia { name: name.clone() })?;
        Ok(Self {
            name,
            radius,
            mass,
            inv_mass: 1.0 / mass,
            moment_of_inertia,
            inv_moment_of_inertia,
            bond_sites,
            mesh_vertices,
            mesh_triangles,
        })
    }

    /// The largest interaction radius this type can participate in, given
    /// the global force parameters. Used to size acceleration grid cells.
    #[must_use]
    pub fn max_interaction_radius(
        &self,
        central_force_overshoot: Scalar,
        vertex_force_radius: Scalar,
    ) -> Scalar {
        let mut r = self.radius * 2.0 + central_force_overshoot;
        for site in &self.bond_sites {
            r = r.max(site.offset.norm() * 2.0 + vertex_force_radius);
        }
        r
    }
}

/// Authoritative dynamic state of one structural unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitState {
    /// The unit's type, indexing the session's registry.
    pub unit_type: UnitTypeId,
    /// Pick currently locking this unit, or [`PickId::NONE`].
    pub pick_id: PickId,
    /// Position of the centre of gravity.
    pub position: Point,
    /// Orientation as a unit quaternion.
    pub orientation: Rotation,
    /// Linear velocity.
    pub linear_velocity: Vector,
    /// Angular velocity.
    pub angular_velocity: Vector,
}

impl UnitState {
    /// A unit of the given type at rest at the given pose.
    #[must_use]
    pub fn at_rest(unit_type: UnitTypeId, position: Point, orientation: Rotation) -> Self {
        Self {
            unit_type,
            pick_id: PickId::NONE,
            position,
            orientation,
            linear_velocity: Vector::zeros(),
            angular_velocity: Vector::zeros(),
        }
    }

    /// World-space position of the `site`-th bond site of a unit of type
    /// `ty` in this state.
    #[must_use]
    pub fn site_position(&self, ty: &UnitType, site: usize) -> Point {
        self.position + ty.bond_sites[site].world_offset(&self.orientation)
    }
}

impl Default for UnitState {
    fn default() -> Self {
        Self::at_rest(UnitTypeId(0), Point::origin(), Rotation::identity())
    }
}

/// Broadcast form of a unit state: type and pose only, no velocities and no
/// pick ownership.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReducedUnitState {
    /// The unit's type.
    pub unit_type: UnitTypeId,
    /// Position of the centre of gravity.
    pub position: Point,
    /// Orientation as a unit quaternion.
    pub orientation: Rotation,
}

impl From<&UnitState> for ReducedUnitState {
    fn from(state: &UnitState) -> Self {
        Self {
            unit_type: state.unit_type,
            position: state.position,
            orientation: state.orientation,
        }
    }
}

/// A point-in-time copy of the dense unit state sequence.
///
/// The session id ties the array to the registry and domain it was produced
/// under; a reader holding a snapshot whose session id differs from the
/// engine's current one must treat it as stale. Time stamps increase
/// strictly within a session.
#[derive(Debug, Clone, PartialEq)]
pub struct StateArray<S> {
    /// Session that produced this array; [`SessionId::INVALID`] before the
    /// first session is established.
    pub session_id: SessionId,
    /// Simulation step for which the entries are valid.
    pub time_stamp: u32,
    /// Dense unit states, indexed by `UnitIndex`.
    pub states: Vec<S>,
}

impl<S> StateArray<S> {
    /// An empty, invalid state array.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            session_id: SessionId::INVALID,
            time_stamp: 0,
            states: Vec::new(),
        }
    }
}

impl<S> Default for StateArray<S> {
    fn default() -> Self {
        Self::empty()
    }
}

/// Snapshot of full unit states (engine-side).
pub type UnitStateArray = StateArray<UnitState>;

/// Snapshot of reduced unit states (broadcast / client-side).
pub type ReducedUnitStateArray = StateArray<ReducedUnitState>;

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn unit_type_precomputes_inverses() {
        let ty = UnitType::new(
            "tetrahedron",
            1.0,
            4.0,
            Tensor::identity() * 2.0,
            vec![BondSite::new(Vector::new(1.0, 0.0, 0.0))],
            Vec::new(),
            Vec::new(),
        )
        .unwrap();
        assert_relative_eq!(ty.inv_mass, 0.25);
        assert_relative_eq!(ty.inv_moment_of_inertia[(0, 0)], 0.5);
    }

    #[test]
    fn unit_type_rejects_bad_mass_and_singular_inertia() {
        assert!(matches!(
            UnitType::new("x", 1.0, 0.0, Tensor::identity(), vec![], vec![], vec![]),
            Err(UnitTypeError::InvalidMass { .. })
        ));
        assert!(matches!(
            UnitType::new("x", 1.0, 1.0, Tensor::zeros(), vec![], vec![], vec![]),
            Err(UnitTypeError::SingularInertia { .. })
        ));
    }

    #[test]
    fn site_position_follows_orientation() {
        let ty = UnitType::new(
            "probe",
            1.0,
            1.0,
            Tensor::identity(),
            vec![BondSite::new(Vector::new(1.0, 0.0, 0.0))],
            Vec::new(),
            Vec::new(),
        )
        .unwrap();
        let half_turn = Rotation::from_scaled_axis(Vector::new(0.0, 0.0, std::f32::consts::PI));
        let state = UnitState::at_rest(UnitTypeId(0), Point::new(5.0, 0.0, 0.0), half_turn);
        let site = state.site_position(&ty, 0);
        assert_relative_eq!(site.x, 4.0, epsilon = 1.0e-5);
        assert_relative_eq!(site.y, 0.0, epsilon = 1.0e-5);
    }
}
