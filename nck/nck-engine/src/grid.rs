//! Uniform spatial acceleration grid over the periodic domain.
//!
//! Cells are sized so that any pair of units within interaction range of
//! each other lies in the same or adjacent cells, which makes the
//! 27-neighbour sweep exhaustive for both the central repulsion and the
//! bond search. Every cell caches the indices of its 26 neighbours and
//! itself with periodic wrap-around, so the force kernel iterates
//! neighbourhoods without branching on domain faces.

use smallvec::SmallVec;

use nck_types::{Domain, Point, Scalar, UnitIndex, UnitState, UnitType};

/// Index of a grid cell in the flattened cell array.
pub type CellIndex = u32;

/// Sentinel for "unit not in the grid".
const NO_CELL: CellIndex = CellIndex::MAX;

/// One grid cell: its cached neighbourhood and the units it contains.
#[derive(Debug, Clone)]
struct Cell {
    /// This cell and its 26 periodic neighbours.
    neighbors: [CellIndex; 27],
    /// Units whose positions fall inside this cell.
    units: SmallVec<[UnitIndex; 8]>,
}

/// The acceleration grid.
///
/// The grid indexes units by position only; unit state stays in the dense
/// state array. Callers keep the grid consistent by reporting every
/// insertion, movement, removal, and index change.
#[derive(Debug, Default)]
pub struct Grid {
    num_cells: [u32; 3],
    cell_size: [Scalar; 3],
    origin: [Scalar; 3],
    cells: Vec<Cell>,
    /// Cell currently containing each unit, indexed by unit index.
    unit_cells: Vec<CellIndex>,
}

/// The next representable value above a positive finite `f32`.
fn next_up(value: Scalar) -> Scalar {
    Scalar::from_bits(value.to_bits() + 1)
}

impl Grid {
    /// Create an empty grid for the given domain, unit types, and force
    /// parameters.
    ///
    /// The cell edge along each axis is the domain size divided by the
    /// largest cell count that keeps cells at least as big as the widest
    /// interaction radius of any unit type. The edge is then nudged up by
    /// ULP steps until the rounded index of the domain's top corner is
    /// strictly below the cell count, so `cell_index_of` stays in range for
    /// every in-domain position despite rounding.
    #[must_use]
    pub fn create(
        domain: &Domain,
        unit_types: &[UnitType],
        central_force_overshoot: Scalar,
        vertex_force_radius: Scalar,
    ) -> Self {
        let mut min_cell_size: Scalar = 0.0;
        for ty in unit_types {
            min_cell_size = min_cell_size
                .max(ty.max_interaction_radius(central_force_overshoot, vertex_force_radius));
        }

        let mut num_cells = [1u32; 3];
        let mut cell_size = [0.0; 3];
        let mut origin = [0.0; 3];
        for i in 0..3 {
            let size = domain.size(i);
            num_cells[i] = if min_cell_size > 0.0 {
                ((size / min_cell_size).floor() as u32).max(1)
            } else {
                1
            };
            cell_size[i] = size / num_cells[i] as Scalar;
            while ((domain.max[i] - domain.min[i]) / cell_size[i]) as u32 >= num_cells[i] {
                cell_size[i] = next_up(cell_size[i]);
            }
            origin[i] = domain.min[i];
        }

        let total = (num_cells[0] * num_cells[1] * num_cells[2]) as usize;
        let mut cells = Vec::with_capacity(total);
        for z in 0..num_cells[2] {
            for y in 0..num_cells[1] {
                for x in 0..num_cells[0] {
                    let mut neighbors = [0; 27];
                    let mut n = 0;
                    for dz in -1i64..=1 {
                        for dy in -1i64..=1 {
                            for dx in -1i64..=1 {
                                let wx = wrap_coord(i64::from(x) + dx, num_cells[0]);
                                let wy = wrap_coord(i64::from(y) + dy, num_cells[1]);
                                let wz = wrap_coord(i64::from(z) + dz, num_cells[2]);
                                neighbors[n] =
                                    (wz * num_cells[1] + wy) * num_cells[0] + wx;
                                n += 1;
                            }
                        }
                    }
                    cells.push(Cell {
                        neighbors,
                        units: SmallVec::new(),
                    });
                }
            }
        }

        Self {
            num_cells,
            cell_size,
            origin,
            cells,
            unit_cells: Vec::new(),
        }
    }

    /// Numbers of cells along each axis.
    #[must_use]
    pub fn num_cells(&self) -> [u32; 3] {
        self.num_cells
    }

    /// Cell edge lengths along each axis.
    #[must_use]
    pub fn cell_size(&self) -> [Scalar; 3] {
        self.cell_size
    }

    /// Make room for bookkeeping of at least `num_units` units.
    pub fn reserve(&mut self, num_units: usize) {
        if self.unit_cells.len() < num_units {
            self.unit_cells.resize(num_units, NO_CELL);
        }
    }

    /// Triple index of the cell containing the given in-domain position.
    #[must_use]
    pub fn cell_coords_of(&self, position: &Point) -> [u32; 3] {
        let mut coords = [0u32; 3];
        for i in 0..3 {
            coords[i] = ((position[i] - self.origin[i]) / self.cell_size[i]) as u32;
        }
        coords
    }

    /// Linear index of the cell containing the given in-domain position.
    #[must_use]
    pub fn cell_index_of(&self, position: &Point) -> CellIndex {
        let [x, y, z] = self.cell_coords_of(position);
        (z * self.num_cells[1] + y) * self.num_cells[0] + x
    }

    /// Linear index of the cell at the given triple index, wrapped to the
    /// grid's extent along each axis.
    #[must_use]
    pub fn wrapped_cell_index(&self, coords: [i64; 3]) -> CellIndex {
        let x = wrap_coord(coords[0], self.num_cells[0]);
        let y = wrap_coord(coords[1], self.num_cells[1]);
        let z = wrap_coord(coords[2], self.num_cells[2]);
        (z * self.num_cells[1] + y) * self.num_cells[0] + x
    }

    /// The cell currently containing the given unit.
    #[must_use]
    pub fn cell_of_unit(&self, unit: UnitIndex) -> CellIndex {
        self.unit_cells[unit as usize]
    }

    /// The 27-cell neighbourhood (including itself) of the given cell.
    #[must_use]
    pub fn neighbors_of(&self, cell: CellIndex) -> [CellIndex; 27] {
        self.cells[cell as usize].neighbors
    }

    /// Units currently in the given cell.
    #[must_use]
    pub fn cell_units(&self, cell: CellIndex) -> &[UnitIndex] {
        &self.cells[cell as usize].units
    }

    /// Add a new unit to the cell containing its position.
    pub fn insert_unit(&mut self, unit: UnitIndex, state: &UnitState) {
        let cell = self.cell_index_of(&state.position);
        self.cells[cell as usize].units.push(unit);
        self.reserve(unit as usize + 1);
        self.unit_cells[unit as usize] = cell;
    }

    /// Update the grid after the given unit moved.
    pub fn move_unit(&mut self, unit: UnitIndex, state: &UnitState) {
        let cell = self.cell_index_of(&state.position);
        let old = self.unit_cells[unit as usize];
        if old != cell {
            remove_from_cell(&mut self.cells[old as usize], unit);
            self.cells[cell as usize].units.push(unit);
            self.unit_cells[unit as usize] = cell;
        }
    }

    /// Update the grid after an integration pass moved every unit.
    pub fn move_units(&mut self, states: &[UnitState]) {
        for (unit, state) in states.iter().enumerate() {
            self.move_unit(unit as UnitIndex, state);
        }
    }

    /// Remove the given unit from its cell.
    ///
    /// The caller is responsible for repairing the hole this leaves in the
    /// dense index space (see destroy compaction).
    pub fn remove_unit(&mut self, unit: UnitIndex) {
        let cell = self.unit_cells[unit as usize];
        remove_from_cell(&mut self.cells[cell as usize], unit);
        self.unit_cells[unit as usize] = NO_CELL;
    }

    /// Rewrite the index of a unit that compaction moved from `old` to
    /// `new`, without moving the unit between cells.
    pub fn change_unit_index(&mut self, old: UnitIndex, new: UnitIndex) {
        let cell = self.unit_cells[old as usize];
        self.unit_cells[new as usize] = cell;
        self.unit_cells[old as usize] = NO_CELL;
        if let Some(slot) = self.cells[cell as usize]
            .units
            .iter()
            .position(|&u| u == old)
        {
            self.cells[cell as usize].units[slot] = new;
        }
    }

    /// Debug consistency walk: every unit is listed exactly once, in the
    /// cell containing its position.
    pub fn check(&self, states: &[UnitState]) {
        for (cell_index, cell) in self.cells.iter().enumerate() {
            for &unit in &cell.units {
                debug_assert_eq!(
                    self.unit_cells[unit as usize], cell_index as CellIndex,
                    "unit {unit} listed in cell {cell_index} but registered elsewhere"
                );
            }
        }
        for (unit, state) in states.iter().enumerate() {
            let expected = self.cell_index_of(&state.position);
            debug_assert_eq!(
                self.unit_cells[unit], expected,
                "unit {unit} registered in the wrong cell"
            );
            let instances = self.cells[expected as usize]
                .units
                .iter()
                .filter(|&&u| u == unit as UnitIndex)
                .count();
            debug_assert_eq!(instances, 1, "unit {unit} listed {instances} times");
        }
    }
}

/// Wrap a possibly-negative cell coordinate into `[0, n)`.
fn wrap_coord(c: i64, n: u32) -> u32 {
    c.rem_euclid(i64::from(n)) as u32
}

fn remove_from_cell(cell: &mut Cell, unit: UnitIndex) {
    if let Some(slot) = cell.units.iter().position(|&u| u == unit) {
        cell.units.swap_remove(slot);
    }
}

#[cfg(test)]
mod tests {
    use nck_types::{Rotation, Tensor, UnitTypeId};

    use super::*;

    fn one_type(radius: Scalar) -> Vec<UnitType> {
        vec![UnitType::new(
            "probe",
            radius,
            1.0,
            Tensor::identity(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
        )
        .unwrap()]
    }

    fn domain() -> Domain {
        Domain::new(Point::new(0.0, 0.0, 0.0), Point::new(10.0, 10.0, 10.0))
    }

    #[test]
    fn cell_size_covers_interaction_radius() {
        let grid = Grid::create(&domain(), &one_type(1.0), 0.5, 0.0);
        // Interaction radius 2.5 -> 4 cells of edge 2.5 per axis.
        assert_eq!(grid.num_cells(), [4, 4, 4]);
        for i in 0..3 {
            assert!(grid.cell_size()[i] >= 2.5);
        }
    }

    #[test]
    fn top_corner_rounds_inside_the_grid() {
        let grid = Grid::create(&domain(), &one_type(0.35), 0.0, 0.0);
        let [nx, ny, nz] = grid.num_cells();
        let just_inside = Point::new(
            next_down(10.0),
            next_down(10.0),
            next_down(10.0),
        );
        let [x, y, z] = grid.cell_coords_of(&just_inside);
        assert!(x < nx && y < ny && z < nz);
    }

    fn next_down(value: Scalar) -> Scalar {
        Scalar::from_bits(value.to_bits() - 1)
    }

    #[test]
    fn insert_move_remove_reindex() {
        let mut grid = Grid::create(&domain(), &one_type(1.0), 0.5, 0.0);
        let mut state = UnitState::at_rest(
            UnitTypeId(0),
            Point::new(1.0, 1.0, 1.0),
            Rotation::identity(),
        );
        grid.reserve(2);
        grid.insert_unit(0, &state);
        assert_eq!(grid.cell_units(grid.cell_of_unit(0)), &[0]);

        state.position = Point::new(9.0, 1.0, 1.0);
        grid.move_unit(0, &state);
        assert_eq!(grid.cell_index_of(&state.position), grid.cell_of_unit(0));
        grid.check(std::slice::from_ref(&state));

        grid.insert_unit(1, &state);
        grid.remove_unit(0);
        grid.change_unit_index(1, 0);
        assert_eq!(grid.cell_units(grid.cell_of_unit(0)), &[0]);
    }

    #[test]
    fn neighborhood_wraps_around_faces() {
        let grid = Grid::create(&domain(), &one_type(1.0), 0.5, 0.0);
        let corner = grid.cell_index_of(&Point::new(0.1, 0.1, 0.1));
        let neighbors = grid.neighbors_of(corner);
        // All 27 entries are valid cells and the far corner cell is among
        // them via periodic wrap.
        let far = grid.cell_index_of(&Point::new(9.9, 9.9, 9.9));
        assert!(neighbors.contains(&far));
        assert!(neighbors.contains(&corner));
    }

    #[test]
    fn wrapped_cell_index_handles_negative_coords() {
        let grid = Grid::create(&domain(), &one_type(1.0), 0.5, 0.0);
        let [nx, ny, nz] = grid.num_cells();
        assert_eq!(
            grid.wrapped_cell_index([-1, 0, 0]),
            grid.wrapped_cell_index([i64::from(nx) - 1, 0, 0])
        );
        assert_eq!(
            grid.wrapped_cell_index([0, i64::from(ny), i64::from(nz)]),
            grid.wrapped_cell_index([0, 0, 0])
        );
    }
}
