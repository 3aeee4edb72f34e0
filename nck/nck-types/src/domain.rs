//! The periodic simulation domain.

use serde::{Deserialize, Serialize};

use crate::{Point, Scalar, Vector};

/// Axis-aligned box bounding all unit positions, periodic along every axis.
///
/// Positions live in the half-open interval `[min, max)` per axis; the
/// domain behaves as a torus, so displacements are compared through their
/// minimum-image representative.
///
/// # Example
///
/// ```
/// use nck_types::{Domain, Point, Vector};
///
/// let domain = Domain::new(Point::new(-1.0, -1.0, -1.0), Point::new(1.0, 1.0, 1.0));
/// // Two units near opposite faces are close on the torus:
/// let d = domain.wrap_distance(Point::new(-0.9, 0.0, 0.0) - Point::new(0.9, 0.0, 0.0));
/// assert!((d.norm() - 0.2).abs() < 1.0e-6);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Domain {
    /// Minimum corner (inclusive).
    pub min: Point,
    /// Maximum corner (exclusive).
    pub max: Point,
}

impl Domain {
    /// Create a domain from its corners.
    #[must_use]
    pub const fn new(min: Point, max: Point) -> Self {
        Self { min, max }
    }

    /// Extent of the domain along the given axis.
    #[must_use]
    pub fn size(&self, axis: usize) -> Scalar {
        self.max[axis] - self.min[axis]
    }

    /// Extents of the domain along all three axes.
    #[must_use]
    pub fn extents(&self) -> Vector {
        self.max - self.min
    }

    /// Whether the given position lies inside `[min, max)` on every axis.
    #[must_use]
    pub fn contains(&self, p: &Point) -> bool {
        (0..3).all(|i| p[i] >= self.min[i] && p[i] < self.max[i])
    }

    /// The minimum-image representative of a displacement on the torus.
    ///
    /// Each component is shifted by a whole domain extent until it lies in
    /// `[-size/2, size/2]`.
    #[must_use]
    pub fn wrap_distance(&self, distance: Vector) -> Vector {
        let mut result = distance;
        for i in 0..3 {
            let ds = self.size(i);
            if result[i] > ds * 0.5 {
                result[i] -= ds;
            } else if result[i] < -ds * 0.5 {
                result[i] += ds;
            }
        }
        result
    }

    /// The unique representative of a position inside `[min, max)`.
    #[must_use]
    pub fn wrap_position(&self, position: Point) -> Point {
        let mut result = position;
        for i in 0..3 {
            let ds = self.size(i);
            while result[i] < self.min[i] {
                result[i] += ds;
            }
            while result[i] >= self.max[i] {
                result[i] -= ds;
            }
        }
        result
    }
}

impl Default for Domain {
    fn default() -> Self {
        Self::new(Point::origin(), Point::new(100.0, 100.0, 100.0))
    }
}
