//! User-adjustable simulation parameters.

use serde::{Deserialize, Serialize};

use crate::Scalar;

/// The four parameters users may change while the simulation runs.
///
/// Parameters travel as a unit: over the wire in `SetParameters` messages
/// and into the engine through a versioned buffer the integrator reads once
/// per step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Parameters {
    /// Damping factor applied to relative bond-site velocities.
    pub linear_damp: Scalar,
    /// Damping factor applied to relative angular velocities across bonds.
    pub angular_damp: Scalar,
    /// Per-second velocity attenuation factor (1 = no attenuation).
    pub attenuation: Scalar,
    /// Speed-up factor from real time to simulation time.
    pub time_factor: Scalar,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            linear_damp: 0.0,
            angular_damp: 0.0,
            attenuation: 1.0,
            time_factor: 1.0,
        }
    }
}
