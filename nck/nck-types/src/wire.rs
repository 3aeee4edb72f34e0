//! Little-endian wire primitives.
//!
//! Both the persisted state file and the network protocol fix the same byte
//! layout: little-endian scalars, `u32` length prefixes on sequences,
//! quaternions as four consecutive scalars (x, y, z, w), tensors row-major.
//! [`Wire`] implementations read and write exactly that layout over any
//! `std::io` stream; structural validation (tags, ranges) lives with the
//! callers.

use std::io::{self, Read, Write};

use nalgebra::Quaternion;

use crate::{
    BondSite, Domain, Parameters, PickId, Point, ReducedUnitState, Rotation, Scalar, SessionId,
    StateArray, Tensor, UnitState, UnitType, UnitTypeId, Vector,
};

/// A value with a fixed little-endian wire representation.
pub trait Wire: Sized {
    /// Write the value to the given sink.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors from the sink.
    fn write_to<W: Write + ?Sized>(&self, sink: &mut W) -> io::Result<()>;

    /// Read a value from the given source.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors; a short read surfaces as
    /// `ErrorKind::UnexpectedEof`, invalid payloads as
    /// `ErrorKind::InvalidData`.
    fn read_from<R: Read + ?Sized>(source: &mut R) -> io::Result<Self>;
}

macro_rules! impl_wire_primitive {
    ($($ty:ty),*) => {
        $(impl Wire for $ty {
            fn write_to<W: Write + ?Sized>(&self, sink: &mut W) -> io::Result<()> {
                sink.write_all(&self.to_le_bytes())
            }

            fn read_from<R: Read + ?Sized>(source: &mut R) -> io::Result<Self> {
                let mut buf = [0u8; std::mem::size_of::<$ty>()];
                source.read_exact(&mut buf)?;
                Ok(<$ty>::from_le_bytes(buf))
            }
        })*
    };
}

impl_wire_primitive!(u8, u16, u32, f32);

impl Wire for bool {
    fn write_to<W: Write + ?Sized>(&self, sink: &mut W) -> io::Result<()> {
        u8::from(*self).write_to(sink)
    }

    fn read_from<R: Read + ?Sized>(source: &mut R) -> io::Result<Self> {
        Ok(u8::read_from(source)? != 0)
    }
}

impl Wire for String {
    fn write_to<W: Write + ?Sized>(&self, sink: &mut W) -> io::Result<()> {
        write_len(self.len(), sink)?;
        sink.write_all(self.as_bytes())
    }

    fn read_from<R: Read + ?Sized>(source: &mut R) -> io::Result<Self> {
        let len = u32::read_from(source)? as usize;
        let mut bytes = vec![0u8; len];
        source.read_exact(&mut bytes)?;
        String::from_utf8(bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl<T: Wire> Wire for Vec<T> {
    fn write_to<W: Write + ?Sized>(&self, sink: &mut W) -> io::Result<()> {
        write_len(self.len(), sink)?;
        for item in self {
            item.write_to(sink)?;
        }
        Ok(())
    }

    fn read_from<R: Read + ?Sized>(source: &mut R) -> io::Result<Self> {
        let len = u32::read_from(source)? as usize;
        // The count comes off the wire; cap the speculative reservation so
        // a corrupt prefix cannot demand gigabytes up front.
        let mut items = Vec::with_capacity(len.min(1024));
        for _ in 0..len {
            items.push(T::read_from(source)?);
        }
        Ok(items)
    }
}

impl Wire for UnitTypeId {
    fn write_to<W: Write + ?Sized>(&self, sink: &mut W) -> io::Result<()> {
        self.0.write_to(sink)
    }

    fn read_from<R: Read + ?Sized>(source: &mut R) -> io::Result<Self> {
        Ok(Self(u16::read_from(source)?))
    }
}

impl Wire for SessionId {
    fn write_to<W: Write + ?Sized>(&self, sink: &mut W) -> io::Result<()> {
        self.0.write_to(sink)
    }

    fn read_from<R: Read + ?Sized>(source: &mut R) -> io::Result<Self> {
        Ok(Self(u16::read_from(source)?))
    }
}

impl Wire for PickId {
    fn write_to<W: Write + ?Sized>(&self, sink: &mut W) -> io::Result<()> {
        self.0.write_to(sink)
    }

    fn read_from<R: Read + ?Sized>(source: &mut R) -> io::Result<Self> {
        Ok(Self(u16::read_from(source)?))
    }
}

impl Wire for Point {
    fn write_to<W: Write + ?Sized>(&self, sink: &mut W) -> io::Result<()> {
        self.coords.write_to(sink)
    }

    fn read_from<R: Read + ?Sized>(source: &mut R) -> io::Result<Self> {
        Ok(Point::from(Vector::read_from(source)?))
    }
}

impl Wire for Vector {
    fn write_to<W: Write + ?Sized>(&self, sink: &mut W) -> io::Result<()> {
        for i in 0..3 {
            self[i].write_to(sink)?;
        }
        Ok(())
    }

    fn read_from<R: Read + ?Sized>(source: &mut R) -> io::Result<Self> {
        let x = Scalar::read_from(source)?;
        let y = Scalar::read_from(source)?;
        let z = Scalar::read_from(source)?;
        Ok(Vector::new(x, y, z))
    }
}

impl Wire for Rotation {
    fn write_to<W: Write + ?Sized>(&self, sink: &mut W) -> io::Result<()> {
        // x, y, z, w: nalgebra's coordinate order.
        for c in self.coords.iter() {
            c.write_to(sink)?;
        }
        Ok(())
    }

    fn read_from<R: Read + ?Sized>(source: &mut R) -> io::Result<Self> {
        let x = Scalar::read_from(source)?;
        let y = Scalar::read_from(source)?;
        let z = Scalar::read_from(source)?;
        let w = Scalar::read_from(source)?;
        // The value was unit when written; renormalising here would perturb
        // bits and break save/load bit-equality.
        Ok(Rotation::new_unchecked(Quaternion::new(w, x, y, z)))
    }
}

impl Wire for Tensor {
    fn write_to<W: Write + ?Sized>(&self, sink: &mut W) -> io::Result<()> {
        for row in 0..3 {
            for col in 0..3 {
                self[(row, col)].write_to(sink)?;
            }
        }
        Ok(())
    }

    fn read_from<R: Read + ?Sized>(source: &mut R) -> io::Result<Self> {
        let mut t = Tensor::zeros();
        for row in 0..3 {
            for col in 0..3 {
                t[(row, col)] = Scalar::read_from(source)?;
            }
        }
        Ok(t)
    }
}

impl Wire for Domain {
    fn write_to<W: Write + ?Sized>(&self, sink: &mut W) -> io::Result<()> {
        self.min.write_to(sink)?;
        self.max.write_to(sink)
    }

    fn read_from<R: Read + ?Sized>(source: &mut R) -> io::Result<Self> {
        let min = Point::read_from(source)?;
        let max = Point::read_from(source)?;
        Ok(Self { min, max })
    }
}

impl Wire for BondSite {
    fn write_to<W: Write + ?Sized>(&self, sink: &mut W) -> io::Result<()> {
        self.offset.write_to(sink)
    }

    fn read_from<R: Read + ?Sized>(source: &mut R) -> io::Result<Self> {
        Ok(Self::new(Vector::read_from(source)?))
    }
}

impl Wire for UnitType {
    fn write_to<W: Write + ?Sized>(&self, sink: &mut W) -> io::Result<()> {
        self.name.write_to(sink)?;
        self.radius.write_to(sink)?;
        self.mass.write_to(sink)?;
        self.moment_of_inertia.write_to(sink)?;
        self.bond_sites.write_to(sink)?;
        self.mesh_vertices.write_to(sink)?;
        self.mesh_triangles.write_to(sink)
    }

    fn read_from<R: Read + ?Sized>(source: &mut R) -> io::Result<Self> {
        let name = String::read_from(source)?;
        let radius = Scalar::read_from(source)?;
        let mass = Scalar::read_from(source)?;
        let moment_of_inertia = Tensor::read_from(source)?;
        let bond_sites = Vec::read_from(source)?;
        let mesh_vertices = Vec::read_from(source)?;
        let mesh_triangles = Vec::read_from(source)?;
        UnitType::new(
            name,
            radius,
            mass,
            moment_of_inertia,
            bond_sites,
            mesh_vertices,
            mesh_triangles,
        )
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl Wire for UnitState {
    fn write_to<W: Write + ?Sized>(&self, sink: &mut W) -> io::Result<()> {
        // Pick ownership is transient and never persisted.
        self.unit_type.write_to(sink)?;
        self.position.write_to(sink)?;
        self.orientation.write_to(sink)?;
        self.linear_velocity.write_to(sink)?;
        self.angular_velocity.write_to(sink)
    }

    fn read_from<R: Read + ?Sized>(source: &mut R) -> io::Result<Self> {
        let unit_type = UnitTypeId::read_from(source)?;
        let position = Point::read_from(source)?;
        let orientation = Rotation::read_from(source)?;
        let linear_velocity = Vector::read_from(source)?;
        let angular_velocity = Vector::read_from(source)?;
        Ok(Self {
            unit_type,
            pick_id: PickId::NONE,
            position,
            orientation,
            linear_velocity,
            angular_velocity,
        })
    }
}

impl Wire for ReducedUnitState {
    fn write_to<W: Write + ?Sized>(&self, sink: &mut W) -> io::Result<()> {
        self.unit_type.write_to(sink)?;
        self.position.write_to(sink)?;
        self.orientation.write_to(sink)
    }

    fn read_from<R: Read + ?Sized>(source: &mut R) -> io::Result<Self> {
        let unit_type = UnitTypeId::read_from(source)?;
        let position = Point::read_from(source)?;
        let orientation = Rotation::read_from(source)?;
        Ok(Self {
            unit_type,
            position,
            orientation,
        })
    }
}

impl Wire for Parameters {
    fn write_to<W: Write + ?Sized>(&self, sink: &mut W) -> io::Result<()> {
        self.linear_damp.write_to(sink)?;
        self.angular_damp.write_to(sink)?;
        self.attenuation.write_to(sink)?;
        self.time_factor.write_to(sink)
    }

    fn read_from<R: Read + ?Sized>(source: &mut R) -> io::Result<Self> {
        let linear_damp = Scalar::read_from(source)?;
        let angular_damp = Scalar::read_from(source)?;
        let attenuation = Scalar::read_from(source)?;
        let time_factor = Scalar::read_from(source)?;
        Ok(Self {
            linear_damp,
            angular_damp,
            attenuation,
            time_factor,
        })
    }
}

/// Write a sequence length as the `u32` prefix the formats fix.
fn write_len<W: Write + ?Sized>(len: usize, sink: &mut W) -> io::Result<()> {
    let len = u32::try_from(len)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "sequence too long for wire"))?;
    len.write_to(sink)
}

/// Write a state array: optional `(session_id, time_stamp)` header, then the
/// length-prefixed states.
///
/// # Errors
///
/// Propagates I/O errors from the sink.
pub fn write_state_array<S: Wire, W: Write + ?Sized>(
    array: &StateArray<S>,
    sink: &mut W,
    with_header: bool,
) -> io::Result<()> {
    if with_header {
        array.session_id.write_to(sink)?;
        array.time_stamp.write_to(sink)?;
    }
    array.states.write_to(sink)
}

/// Read a state array previously written by [`write_state_array`].
///
/// Without a header the session id and time stamp are left untouched in the
/// passed-in array, so callers can stamp them from context.
///
/// # Errors
///
/// Propagates I/O and decode errors from the source.
pub fn read_state_array<S: Wire, R: Read + ?Sized>(
    source: &mut R,
    array: &mut StateArray<S>,
    with_header: bool,
) -> io::Result<()> {
    if with_header {
        array.session_id = SessionId::read_from(source)?;
        array.time_stamp = u32::read_from(source)?;
    }
    array.states = Vec::read_from(source)?;
    Ok(())
}

/// Reduce a full state array on the fly and write the reduced form.
///
/// # Errors
///
/// Propagates I/O errors from the sink.
pub fn reduce_and_write_state_array<W: Write + ?Sized>(
    array: &StateArray<UnitState>,
    sink: &mut W,
    with_header: bool,
) -> io::Result<()> {
    if with_header {
        array.session_id.write_to(sink)?;
        array.time_stamp.write_to(sink)?;
    }
    write_len(array.states.len(), sink)?;
    for state in &array.states {
        ReducedUnitState::from(state).write_to(sink)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quaternion_round_trip_is_bit_exact() {
        let r = Rotation::from_scaled_axis(Vector::new(0.3, -1.2, 0.07));
        let mut buf = Vec::new();
        r.write_to(&mut buf).unwrap();
        let back = Rotation::read_from(&mut buf.as_slice()).unwrap();
        assert_eq!(r.coords, back.coords);
    }

    #[test]
    fn unit_state_read_clears_pick() {
        let mut state = UnitState::default();
        state.pick_id = PickId(7);
        state.position = Point::new(1.0, 2.0, 3.0);
        let mut buf = Vec::new();
        state.write_to(&mut buf).unwrap();
        let back = UnitState::read_from(&mut buf.as_slice()).unwrap();
        assert_eq!(back.pick_id, PickId::NONE);
        assert_eq!(back.position, state.position);
    }

    #[test]
    fn truncated_input_reports_eof() {
        let mut buf = Vec::new();
        Point::new(1.0, 2.0, 3.0).write_to(&mut buf).unwrap();
        buf.truncate(5);
        let err = Point::read_from(&mut buf.as_slice()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
