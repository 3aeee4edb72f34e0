//! Engine configuration.
//!
//! A hierarchical JSON document: global force coefficients, the default
//! simulation parameters, the domain box, and one section per unit type.
//! Unit-type sections that fail validation are skipped with a warning so a
//! single bad section does not take down the whole configuration, matching
//! the engine's per-type error tolerance.

use std::io::Read;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use nck_types::{BondSite, Domain, Parameters, Point, Scalar, Tensor, UnitType, Vector};

/// Error reading a configuration document.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The document is not valid JSON or does not match the schema.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// One unit-type section of the configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitTypeSection {
    /// Type name.
    pub name: String,
    /// Radius of the central repelling force.
    pub radius: Scalar,
    /// Total mass.
    pub mass: Scalar,
    /// Moment of inertia, row-major.
    pub moment_of_inertia: [[Scalar; 3]; 3],
    /// Bond site offsets in body-frame coordinates.
    #[serde(default)]
    pub bond_sites: Vec<[Scalar; 3]>,
    /// Render mesh vertices.
    #[serde(default)]
    pub mesh_vertices: Vec<[Scalar; 3]>,
    /// Render mesh triangle indices.
    #[serde(default)]
    pub mesh_triangles: Vec<u32>,
}

impl UnitTypeSection {
    /// Build the registry record, validating mass and inertia.
    ///
    /// # Errors
    ///
    /// Propagates [`nck_types::UnitTypeError`] from validation.
    pub fn build(&self) -> Result<UnitType, nck_types::UnitTypeError> {
        let m = &self.moment_of_inertia;
        let tensor = Tensor::new(
            m[0][0], m[0][1], m[0][2],
            m[1][0], m[1][1], m[1][2],
            m[2][0], m[2][1], m[2][2],
        );
        UnitType::new(
            self.name.clone(),
            self.radius,
            self.mass,
            tensor,
            self.bond_sites
                .iter()
                .map(|o| BondSite::new(Vector::new(o[0], o[1], o[2])))
                .collect(),
            self.mesh_vertices
                .iter()
                .map(|v| Point::new(v[0], v[1], v[2]))
                .collect(),
            self.mesh_triangles.clone(),
        )
    }
}

/// The engine's configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Initial user-adjustable parameters.
    pub parameters: Parameters,
    /// Cutoff radius of the bond attraction force.
    pub vertex_force_radius: Scalar,
    /// Strength of the bond attraction force.
    pub vertex_force_strength: Scalar,
    /// How far the central repulsion reaches past the summed radii.
    pub central_force_overshoot: Scalar,
    /// Strength of the central repulsion force.
    pub central_force_strength: Scalar,
    /// Simulation domain.
    pub domain: Domain,
    /// Unit-type sections, in registry order.
    pub unit_types: Vec<UnitTypeSection>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parameters: Parameters {
                linear_damp: 0.0,
                angular_damp: 0.0,
                attenuation: 0.9,
                time_factor: 10.0,
            },
            vertex_force_radius: 0.5,
            vertex_force_strength: 50.0,
            central_force_overshoot: 0.25,
            central_force_strength: 50.0,
            domain: Domain::default(),
            unit_types: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Parse a configuration document from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on malformed JSON.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Parse a configuration document from a reader.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on malformed JSON or read failure.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self, ConfigError> {
        Ok(serde_json::from_reader(reader)?)
    }

    /// Build the unit-type registry, skipping sections that fail
    /// validation.
    #[must_use]
    pub fn build_unit_types(&self) -> Vec<UnitType> {
        let mut types = Vec::with_capacity(self.unit_types.len());
        for section in &self.unit_types {
            match section.build() {
                Ok(ty) => types.push(ty),
                Err(err) => {
                    warn!(name = %section.name, %err, "ignoring invalid unit type section");
                }
            }
        }
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "parameters": { "attenuation": 0.95, "time_factor": 8.0 },
        "vertex_force_radius": 0.75,
        "domain": { "min": [-5.0, -5.0, -5.0], "max": [5.0, 5.0, 5.0] },
        "unit_types": [
            {
                "name": "triangle",
                "radius": 1.0,
                "mass": 3.0,
                "moment_of_inertia": [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 2.0]],
                "bond_sites": [[1.0, 0.0, 0.0], [-0.5, 0.866, 0.0], [-0.5, -0.866, 0.0]]
            },
            {
                "name": "broken",
                "radius": 1.0,
                "mass": 0.0,
                "moment_of_inertia": [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]
            }
        ]
    }"#;

    #[test]
    fn parses_sections_and_defaults() {
        let config = EngineConfig::from_json(SAMPLE).unwrap();
        assert_eq!(config.parameters.time_factor, 8.0);
        // Unspecified fields fall back to defaults.
        assert_eq!(config.parameters.linear_damp, 0.0);
        assert_eq!(config.vertex_force_radius, 0.75);
        assert_eq!(config.vertex_force_strength, 50.0);
        assert_eq!(config.domain.min, Point::new(-5.0, -5.0, -5.0));
    }

    #[test]
    fn invalid_sections_are_skipped() {
        let config = EngineConfig::from_json(SAMPLE).unwrap();
        let types = config.build_unit_types();
        assert_eq!(types.len(), 1);
        assert_eq!(types[0].name, "triangle");
        assert_eq!(types[0].bond_sites.len(), 3);
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(EngineConfig::from_json("{ not json").is_err());
    }
}
