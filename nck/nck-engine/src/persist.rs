//! Persisted state file format.
//!
//! Layout (little-endian throughout, `u32` length prefixes):
//!
//! ```text
//! tag           32 bytes ASCII, NUL padded
//! unit_types    length-prefixed UnitType records
//! domain        min point, max point
//! vfr, vfs      vertex force radius / strength
//! cfo, cfs      central force overshoot / strength
//! unit_states   length-prefixed UnitState records (no header)
//! bonds         length-prefixed canonical bonds (u0, s0, u1, s1)
//! ```

use std::io::{Read, Write};

use thiserror::Error;

use nck_types::wire::read_state_array;
use nck_types::{Domain, Scalar, UnitState, UnitStateArray, UnitType, Wire};

use crate::bonds::BondKey;

/// Identification tag at the start of every state file.
pub const FILE_TAG: &str = "NanotechConstructionKit 2.0\r\n";

const TAG_LEN: usize = 32;

/// Error reading a persisted state file.
///
/// A failed load aborts before any engine state is touched, so the previous
/// session survives intact.
#[derive(Debug, Error)]
pub enum FormatError {
    /// The identification tag did not match.
    #[error("input is not a unit state file (bad identification tag)")]
    BadTag,

    /// A unit state references a type index beyond the file's registry.
    #[error("unit {index} references unknown unit type {unit_type} (of {num_types})")]
    UnknownUnitType {
        /// Index of the offending unit state.
        index: usize,
        /// The out-of-range type index.
        unit_type: u16,
        /// Number of types the file declared.
        num_types: usize,
    },

    /// A bond references a unit or site that does not exist.
    #[error("bond {index} references unit {unit} site {site} out of range")]
    BondOutOfRange {
        /// Index of the offending bond record.
        index: usize,
        /// The referenced unit index.
        unit: u32,
        /// The referenced site index.
        site: u32,
    },

    /// Truncated or unreadable input.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A complete decoded state file.
#[derive(Debug, Clone)]
pub struct SavedState {
    /// Unit type registry of the saved session.
    pub unit_types: Vec<UnitType>,
    /// Simulation domain of the saved session.
    pub domain: Domain,
    /// Vertex (bond) force cutoff radius.
    pub vertex_force_radius: Scalar,
    /// Vertex force strength.
    pub vertex_force_strength: Scalar,
    /// Central force overshoot.
    pub central_force_overshoot: Scalar,
    /// Central force strength.
    pub central_force_strength: Scalar,
    /// Unit states; pick ids are cleared on read.
    pub states: Vec<UnitState>,
    /// Canonical bonds between the saved units.
    pub bonds: Vec<(BondKey, BondKey)>,
}

impl SavedState {
    /// Write the state file to the given sink.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors from the sink.
    pub fn write<W: Write + ?Sized>(&self, sink: &mut W) -> Result<(), FormatError> {
        let mut tag = [0u8; TAG_LEN];
        tag[..FILE_TAG.len()].copy_from_slice(FILE_TAG.as_bytes());
        sink.write_all(&tag)?;

        self.unit_types.write_to(sink)?;
        self.domain.write_to(sink)?;
        self.vertex_force_radius.write_to(sink)?;
        self.vertex_force_strength.write_to(sink)?;
        self.central_force_overshoot.write_to(sink)?;
        self.central_force_strength.write_to(sink)?;

        (self.states.len() as u32).write_to(sink)?;
        for state in &self.states {
            state.write_to(sink)?;
        }

        (self.bonds.len() as u32).write_to(sink)?;
        for (a, b) in &self.bonds {
            a.unit.write_to(sink)?;
            a.site.write_to(sink)?;
            b.unit.write_to(sink)?;
            b.site.write_to(sink)?;
        }
        sink.flush()?;
        Ok(())
    }

    /// Read and validate a state file from the given source.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError`] on a bad tag, truncated input, or
    /// out-of-range unit-type and bond references.
    pub fn read<R: Read + ?Sized>(source: &mut R) -> Result<Self, FormatError> {
        let mut tag = [0u8; TAG_LEN];
        source.read_exact(&mut tag)?;
        if &tag[..FILE_TAG.len()] != FILE_TAG.as_bytes()
            || tag[FILE_TAG.len()..].iter().any(|&b| b != 0)
        {
            return Err(FormatError::BadTag);
        }

        let unit_types: Vec<UnitType> = Vec::read_from(source)?;
        let domain = Domain::read_from(source)?;
        let vertex_force_radius = Scalar::read_from(source)?;
        let vertex_force_strength = Scalar::read_from(source)?;
        let central_force_overshoot = Scalar::read_from(source)?;
        let central_force_strength = Scalar::read_from(source)?;

        let mut array = UnitStateArray::empty();
        read_state_array(source, &mut array, false)?;
        let states = array.states;
        for (index, state) in states.iter().enumerate() {
            if state.unit_type.raw() as usize >= unit_types.len() {
                return Err(FormatError::UnknownUnitType {
                    index,
                    unit_type: state.unit_type.raw(),
                    num_types: unit_types.len(),
                });
            }
        }

        let num_bonds = u32::read_from(source)? as usize;
        let mut bonds = Vec::with_capacity(num_bonds.min(1024));
        for index in 0..num_bonds {
            let a = BondKey::new(u32::read_from(source)?, u32::read_from(source)?);
            let b = BondKey::new(u32::read_from(source)?, u32::read_from(source)?);
            for key in [a, b] {
                let sites = states
                    .get(key.unit as usize)
                    .map(|s| unit_types[s.unit_type.raw() as usize].bond_sites.len());
                if sites.map_or(true, |n| key.site as usize >= n) {
                    return Err(FormatError::BondOutOfRange {
                        index,
                        unit: key.unit,
                        site: key.site,
                    });
                }
            }
            bonds.push((a, b));
        }

        Ok(Self {
            unit_types,
            domain,
            vertex_force_radius,
            vertex_force_strength,
            central_force_overshoot,
            central_force_strength,
            states,
            bonds,
        })
    }
}

#[cfg(test)]
mod tests {
    use nck_types::{Point, Rotation, Tensor, UnitTypeId, Vector};

    use super::*;

    fn sample() -> SavedState {
        let ty = UnitType::new(
            "triangle",
            1.0,
            2.0,
            Tensor::identity(),
            vec![nck_types::BondSite::new(Vector::new(1.0, 0.0, 0.0))],
            vec![Point::new(0.0, 0.0, 0.0)],
            vec![0, 0, 0],
        )
        .unwrap();
        let mut u0 = UnitState::at_rest(UnitTypeId(0), Point::new(1.0, 2.0, 3.0), Rotation::identity());
        u0.linear_velocity = Vector::new(0.5, -0.25, 0.125);
        let u1 = UnitState::at_rest(
            UnitTypeId(0),
            Point::new(4.0, 5.0, 6.0),
            Rotation::from_scaled_axis(Vector::new(0.0, 0.0, 1.0)),
        );
        SavedState {
            unit_types: vec![ty],
            domain: Domain::new(Point::new(0.0, 0.0, 0.0), Point::new(10.0, 10.0, 10.0)),
            vertex_force_radius: 0.5,
            vertex_force_strength: 50.0,
            central_force_overshoot: 0.25,
            central_force_strength: 40.0,
            states: vec![u0, u1],
            bonds: vec![(BondKey::new(0, 0), BondKey::new(1, 0))],
        }
    }

    #[test]
    fn round_trip_is_bit_exact() {
        let saved = sample();
        let mut buf = Vec::new();
        saved.write(&mut buf).unwrap();
        let back = SavedState::read(&mut buf.as_slice()).unwrap();
        assert_eq!(back.states, saved.states);
        assert_eq!(back.bonds, saved.bonds);
        assert_eq!(back.unit_types, saved.unit_types);
        assert_eq!(back.domain, saved.domain);
        assert_eq!(back.vertex_force_radius.to_bits(), saved.vertex_force_radius.to_bits());
    }

    #[test]
    fn bad_tag_is_rejected() {
        let mut buf = Vec::new();
        sample().write(&mut buf).unwrap();
        buf[0] ^= 0xff;
        assert!(matches!(
            SavedState::read(&mut buf.as_slice()),
            Err(FormatError::BadTag)
        ));
    }

    #[test]
    fn truncation_is_reported() {
        let mut buf = Vec::new();
        sample().write(&mut buf).unwrap();
        buf.truncate(buf.len() - 3);
        assert!(matches!(
            SavedState::read(&mut buf.as_slice()),
            Err(FormatError::Io(_))
        ));
    }

    #[test]
    fn out_of_range_bond_is_rejected() {
        let mut saved = sample();
        saved.bonds = vec![(BondKey::new(0, 0), BondKey::new(9, 0))];
        let mut buf = Vec::new();
        saved.write(&mut buf).unwrap();
        assert!(matches!(
            SavedState::read(&mut buf.as_slice()),
            Err(FormatError::BondOutOfRange { unit: 9, .. })
        ));
    }
}
