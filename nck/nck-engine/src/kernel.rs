//! Force computation and the integration half/full step.
//!
//! Free functions over state slices, shared by both passes of the midpoint
//! scheme in [`Simulation::advance`](crate::Simulation::advance).

use nck_types::{Domain, Rotation, Scalar, UnitState, UnitType, Vector};

use crate::bonds::BondMap;
use crate::grid::Grid;

/// Force-law coefficients, fixed per session plus the per-step damping
/// parameters.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ForceParams {
    pub vertex_force_radius: Scalar,
    pub vertex_force_radius2: Scalar,
    pub vertex_force_strength: Scalar,
    pub central_force_overshoot: Scalar,
    pub central_force_strength: Scalar,
    pub linear_damp: Scalar,
    pub angular_damp: Scalar,
}

/// Accumulate forces and torques for every unit of `states`.
///
/// Central repulsion pairs come from the grid's 27-neighbour sweep with the
/// `j > i` filter so each pair is visited once; bond attraction iterates the
/// canonical half of the bond map. All displacements go through the
/// minimum-image wrap.
pub(crate) fn calc_forces(
    params: &ForceParams,
    unit_types: &[UnitType],
    domain: &Domain,
    grid: &Grid,
    bonds: &BondMap,
    states: &[UnitState],
    forces: &mut [Vector],
    torques: &mut [Vector],
) {
    for i in 0..states.len() {
        forces[i] = Vector::zeros();
        torques[i] = Vector::zeros();
    }

    // Central repelling forces between all close pairs.
    for (ui0, u0) in states.iter().enumerate() {
        let r0 = unit_types[u0.unit_type.raw() as usize].radius;
        for neighbor in grid.neighbors_of(grid.cell_of_unit(ui0 as u32)) {
            for &ui1 in grid.cell_units(neighbor) {
                let ui1 = ui1 as usize;
                if ui1 <= ui0 {
                    continue;
                }
                let u1 = &states[ui1];
                let r1 = unit_types[u1.unit_type.raw() as usize].radius;

                let dist = domain.wrap_distance(u1.position - u0.position);
                let dist_len2 = dist.norm_squared();

                let central_radius = r0 + r1 + params.central_force_overshoot;
                let central_radius2 = central_radius * central_radius;
                if dist_len2 < central_radius2 {
                    // |d| - R < 0 in the active region, so the force points
                    // from u1 towards u0: repulsive.
                    let force = dist
                        * (params.central_force_strength * (dist_len2.sqrt() - central_radius)
                            / central_radius2);
                    forces[ui0] += force;
                    forces[ui1] -= force;
                }
            }
        }
    }

    // Attracting forces and torques across all bonds.
    for (a, b) in bonds.iter_canonical() {
        let ui0 = a.unit as usize;
        let ui1 = b.unit as usize;
        let u0 = &states[ui0];
        let u1 = &states[ui1];
        let ut0 = &unit_types[u0.unit_type.raw() as usize];
        let ut1 = &unit_types[u1.unit_type.raw() as usize];

        let bs0 = ut0.bond_sites[a.site as usize].world_offset(&u0.orientation);
        let bs1 = ut1.bond_sites[b.site as usize].world_offset(&u1.orientation);
        let dist = domain.wrap_distance(u1.position - u0.position) - bs0 + bs1;

        let dist_len2 = dist.norm_squared();
        if dist_len2 <= params.vertex_force_radius2 {
            let mut force = dist
                * (params.vertex_force_strength
                    * (params.vertex_force_radius - dist_len2.sqrt())
                    / params.vertex_force_radius2);

            // Damp the relative velocity of the two bond sites.
            let dv = u1.linear_velocity + u1.angular_velocity.cross(&bs1)
                - u0.linear_velocity
                - u0.angular_velocity.cross(&bs0);
            force += dv * params.linear_damp;

            forces[ui0] += force;
            forces[ui1] -= force;
            torques[ui0] += bs0.cross(&force);
            torques[ui1] -= bs1.cross(&force);

            // Damp the relative angular velocity across the bond.
            let domega = u1.angular_velocity - u0.angular_velocity;
            let torque = domega * params.angular_damp;
            torques[ui0] += torque;
            torques[ui1] -= torque;
        }
    }
}

/// Integrate `source` into `dest` over `dt` under the given forces.
///
/// Picked units keep their velocities untouched (they are driven
/// kinematically by set-state requests) but their poses still advance, so a
/// dragged complex moves with the velocity its pick imposed. Unpicked units
/// receive the accelerations and the per-step attenuation.
pub(crate) fn apply_forces(
    unit_types: &[UnitType],
    domain: &Domain,
    source: &[UnitState],
    dest: &mut [UnitState],
    forces: &[Vector],
    torques: &[Vector],
    attenuation: Scalar,
    dt: Scalar,
) {
    let att = attenuation.powf(dt);
    for (ui, (src, dst)) in source.iter().zip(dest.iter_mut()).enumerate() {
        dst.unit_type = src.unit_type;
        dst.pick_id = src.pick_id;
        let ty = &unit_types[src.unit_type.raw() as usize];

        dst.linear_velocity = src.linear_velocity;
        dst.angular_velocity = src.angular_velocity;
        if src.pick_id.is_none() {
            dst.linear_velocity += forces[ui] * (ty.inv_mass * dt);
            dst.angular_velocity += (ty.inv_moment_of_inertia * torques[ui]) * dt;
        }

        dst.position = domain.wrap_position(src.position + dst.linear_velocity * dt);
        dst.orientation =
            Rotation::from_scaled_axis(dst.angular_velocity * dt) * src.orientation;
        dst.orientation.renormalize();

        if src.pick_id.is_none() {
            dst.linear_velocity *= att;
            dst.angular_velocity *= att;
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use nck_types::{Point, Tensor, UnitTypeId};

    use super::*;
    use crate::bonds::BondKey;

    fn probe_type(radius: Scalar, sites: Vec<Vector>) -> UnitType {
        UnitType::new(
            "probe",
            radius,
            1.0,
            Tensor::identity(),
            sites.into_iter().map(nck_types::BondSite::new).collect(),
            Vec::new(),
            Vec::new(),
        )
        .unwrap()
    }

    fn params() -> ForceParams {
        ForceParams {
            vertex_force_radius: 0.5,
            vertex_force_radius2: 0.25,
            vertex_force_strength: 10.0,
            central_force_overshoot: 0.25,
            central_force_strength: 10.0,
            linear_damp: 0.0,
            angular_damp: 0.0,
        }
    }

    fn world(
        types: &[UnitType],
        states: &[UnitState],
    ) -> (Domain, Grid) {
        let domain = Domain::new(Point::new(-10.0, -10.0, -10.0), Point::new(10.0, 10.0, 10.0));
        let mut grid = Grid::create(&domain, types, 0.25, 0.5);
        grid.reserve(states.len());
        for (i, s) in states.iter().enumerate() {
            grid.insert_unit(i as u32, s);
        }
        (domain, grid)
    }

    #[test]
    fn overlapping_units_repel_along_their_axis() {
        let types = [probe_type(1.0, Vec::new())];
        let states = [
            UnitState::at_rest(UnitTypeId(0), Point::new(-0.5, 0.0, 0.0), Rotation::identity()),
            UnitState::at_rest(UnitTypeId(0), Point::new(0.5, 0.0, 0.0), Rotation::identity()),
        ];
        let (domain, grid) = world(&types, &states);
        let bonds = BondMap::new();
        let mut forces = vec![Vector::zeros(); 2];
        let mut torques = vec![Vector::zeros(); 2];
        calc_forces(&params(), &types, &domain, &grid, &bonds, &states, &mut forces, &mut torques);

        assert!(forces[0].x < 0.0, "left unit pushed further left");
        assert!(forces[1].x > 0.0, "right unit pushed further right");
        assert_relative_eq!((forces[0] + forces[1]).norm(), 0.0, epsilon = 1.0e-5);
        assert_relative_eq!(torques[0].norm(), 0.0);
    }

    #[test]
    fn bonded_sites_attract_and_torque() {
        let types = [probe_type(1.0, vec![Vector::new(0.0, 1.0, 0.0)])];
        let states = [
            UnitState::at_rest(UnitTypeId(0), Point::new(-1.5, 0.0, 0.0), Rotation::identity()),
            UnitState::at_rest(UnitTypeId(0), Point::new(1.5, 0.0, 0.0), Rotation::identity()),
        ];
        let (domain, grid) = world(&types, &states);
        let mut bonds = BondMap::new();
        bonds.insert_pair(BondKey::new(0, 0), BondKey::new(1, 0));

        let mut p = params();
        // Keep the stretched bond in range.
        p.vertex_force_radius = 4.0;
        p.vertex_force_radius2 = 16.0;
        let mut forces = vec![Vector::zeros(); 2];
        let mut torques = vec![Vector::zeros(); 2];
        calc_forces(&p, &types, &domain, &grid, &bonds, &states, &mut forces, &mut torques);

        assert!(forces[0].x > 0.0, "left unit pulled right");
        assert!(forces[1].x < 0.0, "right unit pulled left");
        // Off-centre sites produce opposing torques about z.
        assert!(torques[0].z.abs() > 0.0);
        assert_relative_eq!(torques[0].z, -torques[1].z, epsilon = 1.0e-5);
    }

    #[test]
    fn picked_units_keep_velocity_but_move() {
        let types = [probe_type(1.0, Vec::new())];
        let domain = Domain::new(Point::new(-10.0, -10.0, -10.0), Point::new(10.0, 10.0, 10.0));
        let mut src = UnitState::at_rest(UnitTypeId(0), Point::origin(), Rotation::identity());
        src.pick_id = nck_types::PickId(5);
        src.linear_velocity = Vector::new(1.0, 0.0, 0.0);
        let source = [src];
        let mut dest = [UnitState::default()];
        let forces = [Vector::new(100.0, 0.0, 0.0)];
        let torques = [Vector::zeros()];
        apply_forces(&types, &domain, &source, &mut dest, &forces, &torques, 0.5, 0.1);

        // Velocity unchanged by the force and unattenuated; pose advanced.
        assert_relative_eq!(dest[0].linear_velocity.x, 1.0);
        assert_relative_eq!(dest[0].position.x, 0.1, epsilon = 1.0e-6);
        assert_eq!(dest[0].pick_id, nck_types::PickId(5));
    }

    #[test]
    fn attenuation_decays_free_velocities() {
        let types = [probe_type(1.0, Vec::new())];
        let domain = Domain::new(Point::new(-10.0, -10.0, -10.0), Point::new(10.0, 10.0, 10.0));
        let mut src = UnitState::at_rest(UnitTypeId(0), Point::origin(), Rotation::identity());
        src.linear_velocity = Vector::new(1.0, 0.0, 0.0);
        let source = [src];
        let mut dest = [UnitState::default()];
        let forces = [Vector::zeros()];
        let torques = [Vector::zeros()];
        apply_forces(&types, &domain, &source, &mut dest, &forces, &torques, 0.25, 2.0);

        // attenuation^dt = 0.25^2 = 0.0625
        assert_relative_eq!(dest[0].linear_velocity.x, 0.0625, epsilon = 1.0e-6);
    }
}
