//! The authoritative simulation.
//!
//! [`Simulation`] owns all mutable simulation state and is driven from a
//! single thread; [`SimulationHandle`] is the cloneable front end through
//! which every other thread enqueues requests and reads snapshots. Each
//! call to [`Simulation::advance`] drains the request queue, runs the
//! two-stage midpoint integrator, applies the requests in FIFO order,
//! updates the bond graph, and publishes the new state through the
//! snapshot triple buffer.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};

use crossbeam_channel::{unbounded, Receiver, Sender};
use hashbrown::{HashMap, HashSet};
use tracing::{debug, info, warn};

use nck_types::{
    Domain, Parameters, PickId, Point, Rotation, Scalar, SessionId, UnitIndex, UnitState,
    UnitStateArray, UnitType, UnitTypeId, Vector,
};

use crate::bonds::{BondKey, BondMap};
use crate::config::EngineConfig;
use crate::grid::Grid;
use crate::kernel::{apply_forces, calc_forces, ForceParams};
use crate::persist::SavedState;
use crate::picks::{PickIdAllocator, PickLedger, PickRecord};
use crate::queue::{EnqueueError, RequestQueue};
use crate::request::{EngineEvent, LoadSource, SaveCompleteCallback, SaveSink, UiRequest};
use nck_sync::{SnapshotBuffer, SnapshotReader};

/// Hard upper bound on the simulation time step, for stability.
const MAX_TIME_STEP: Scalar = 0.06;

/// Session-scoped data shared with front ends: the id, the domain, and the
/// immutable unit-type registry.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Current session id; [`SessionId::INVALID`] before the first load.
    pub session_id: SessionId,
    /// Simulation domain of the session.
    pub domain: Domain,
    /// Unit-type registry of the session.
    pub unit_types: Arc<Vec<UnitType>>,
}

/// State shared between the simulation thread and all front ends.
pub(crate) struct SimShared {
    requests: RequestQueue,
    states: Arc<SnapshotBuffer<UnitStateArray>>,
    parameters: Arc<SnapshotBuffer<Parameters>>,
    session: RwLock<SessionInfo>,
    /// Session id of the most recently issued load or initialisation; the
    /// session is valid when the engine has caught up to it.
    load_session_id: Mutex<SessionId>,
    pick_ids: Mutex<PickIdAllocator>,
    events_tx: Sender<EngineEvent>,
    events_rx: Receiver<EngineEvent>,
}

/// Cloneable front end to a [`Simulation`].
///
/// All methods are safe to call from any thread. Request methods enqueue
/// and return immediately; their effects become visible in a later
/// snapshot.
#[derive(Clone)]
pub struct SimulationHandle {
    shared: Arc<SimShared>,
}

impl SimulationHandle {
    /// The current session id.
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.shared.session.read().expect("session lock poisoned").session_id
    }

    /// The current session's id, domain, and unit types, atomically.
    #[must_use]
    pub fn session(&self) -> SessionInfo {
        self.shared.session.read().expect("session lock poisoned").clone()
    }

    /// Whether the engine has an established session and no load is
    /// pending.
    #[must_use]
    pub fn is_session_valid(&self) -> bool {
        let session_id = self.session_id();
        session_id.is_valid()
            && session_id
                == *self
                    .shared
                    .load_session_id
                    .lock()
                    .expect("load session lock poisoned")
    }

    /// The most recently posted simulation parameters.
    #[must_use]
    pub fn parameters(&self) -> Parameters {
        self.shared
            .parameters
            .latest()
            .map_or_else(Parameters::default, |p| *p)
    }

    /// Post new simulation parameters; the engine reads them at its next
    /// step.
    pub fn set_parameters(&self, parameters: Parameters) {
        self.shared.parameters.publish(Arc::new(parameters));
    }

    /// Create a new snapshot reader cursor.
    #[must_use]
    pub fn state_reader(&self) -> SnapshotReader<UnitStateArray> {
        self.shared.states.reader()
    }

    /// The channel on which the engine raises [`EngineEvent`]s.
    #[must_use]
    pub fn events(&self) -> Receiver<EngineEvent> {
        self.shared.events_rx.clone()
    }

    fn allocate_pick_id(&self) -> PickId {
        self.shared
            .pick_ids
            .lock()
            .expect("pick id lock poisoned")
            .allocate()
    }

    fn push(&self, request: UiRequest) -> Result<(), EnqueueError> {
        self.shared.requests.push(request)
    }

    fn push_with_pick(&self, pick_id: PickId, request: UiRequest) -> Result<PickId, EnqueueError> {
        match self.push(request) {
            Ok(()) => Ok(pick_id),
            Err(err) => {
                self.shared
                    .pick_ids
                    .lock()
                    .expect("pick id lock poisoned")
                    .release(pick_id);
                Err(err)
            }
        }
    }

    /// Pick the unit nearest `position` within `radius`, optionally with
    /// its whole bonded complex. Returns the pick id that will own the
    /// result.
    ///
    /// # Errors
    ///
    /// Returns [`EnqueueError`] when the request queue is full.
    pub fn pick_point(
        &self,
        position: Point,
        radius: Scalar,
        orientation: Rotation,
        connected: bool,
    ) -> Result<PickId, EnqueueError> {
        let pick_id = self.allocate_pick_id();
        self.push_with_pick(
            pick_id,
            UiRequest::PickPoint {
                pick_id,
                position,
                radius,
                orientation,
                connected,
            },
        )
    }

    /// Ray pick. Accepted for interface completeness; the engine drops it,
    /// so the returned pick id never owns any unit.
    ///
    /// # Errors
    ///
    /// Returns [`EnqueueError`] when the request queue is full.
    pub fn pick_ray(
        &self,
        origin: Point,
        direction: Vector,
        orientation: Rotation,
        connected: bool,
    ) -> Result<PickId, EnqueueError> {
        let pick_id = self.allocate_pick_id();
        self.push_with_pick(
            pick_id,
            UiRequest::PickRay {
                pick_id,
                origin,
                direction,
                orientation,
                connected,
            },
        )
    }

    /// Instantiate the copy buffer at the given pose with the given
    /// real-time velocities; the new units are owned by the returned pick.
    ///
    /// # Errors
    ///
    /// Returns [`EnqueueError`] when the request queue is full.
    pub fn paste(
        &self,
        position: Point,
        orientation: Rotation,
        linear_velocity: Vector,
        angular_velocity: Vector,
    ) -> Result<PickId, EnqueueError> {
        let pick_id = self.allocate_pick_id();
        self.push_with_pick(
            pick_id,
            UiRequest::Paste {
                pick_id,
                position,
                orientation,
                linear_velocity,
                angular_velocity,
            },
        )
    }

    /// Create a new unit of `unit_type` owned by `pick_id`, if that pick
    /// does not already own units.
    ///
    /// # Errors
    ///
    /// Returns [`EnqueueError`] when the request queue is full.
    pub fn create(
        &self,
        pick_id: PickId,
        unit_type: UnitTypeId,
        position: Point,
        orientation: Rotation,
        linear_velocity: Vector,
        angular_velocity: Vector,
    ) -> Result<(), EnqueueError> {
        self.push(UiRequest::Create {
            pick_id,
            unit_type,
            position,
            orientation,
            linear_velocity,
            angular_velocity,
        })
    }

    /// Drive the picked units to a new pose with the given real-time
    /// velocities.
    ///
    /// # Errors
    ///
    /// Returns [`EnqueueError`] when the request queue is full.
    pub fn set_state(
        &self,
        pick_id: PickId,
        position: Point,
        orientation: Rotation,
        linear_velocity: Vector,
        angular_velocity: Vector,
    ) -> Result<(), EnqueueError> {
        self.push(UiRequest::SetState {
            pick_id,
            position,
            orientation,
            linear_velocity,
            angular_velocity,
        })
    }

    /// Replace the copy buffer with the picked set.
    ///
    /// # Errors
    ///
    /// Returns [`EnqueueError`] when the request queue is full.
    pub fn copy(&self, pick_id: PickId) -> Result<(), EnqueueError> {
        self.push(UiRequest::Copy { pick_id })
    }

    /// Destroy every unit owned by the pick.
    ///
    /// # Errors
    ///
    /// Returns [`EnqueueError`] when the request queue is full.
    pub fn destroy(&self, pick_id: PickId) -> Result<(), EnqueueError> {
        self.push(UiRequest::Destroy { pick_id })
    }

    /// Release the pick, returning its units to free dynamics.
    ///
    /// # Errors
    ///
    /// Returns [`EnqueueError`] when the request queue is full.
    pub fn release(&self, pick_id: PickId) -> Result<(), EnqueueError> {
        self.push(UiRequest::Release { pick_id })
    }

    /// Serialise the state to `sink` on the simulation thread; `on_complete`
    /// runs there once the sink is written.
    ///
    /// # Errors
    ///
    /// Returns [`EnqueueError`] when the request queue is full.
    pub fn save_state(
        &self,
        sink: SaveSink,
        on_complete: Option<SaveCompleteCallback>,
    ) -> Result<(), EnqueueError> {
        self.push(UiRequest::SaveState { sink, on_complete })
    }

    /// Replace the whole session from `source`.
    ///
    /// The new session id is reserved up front, so the current session
    /// reads as invalid until the load applies. A failed load keeps the old
    /// state but leaves the session invalid, exactly like the original's
    /// load path.
    ///
    /// # Errors
    ///
    /// Returns [`EnqueueError`] when the request queue is full.
    pub fn load_state(&self, source: LoadSource) -> Result<(), EnqueueError> {
        let mut load_session = self
            .shared
            .load_session_id
            .lock()
            .expect("load session lock poisoned");
        let next = load_session.next();
        self.push(UiRequest::LoadState {
            source,
            session_id: next,
        })?;
        *load_session = next;
        Ok(())
    }
}

/// A unit stored in the copy buffer.
#[derive(Debug, Clone, Copy)]
struct CopiedUnit {
    unit_type: UnitTypeId,
    position_offset: Vector,
    orientation_offset: Rotation,
}

/// The authoritative simulation state machine.
pub struct Simulation {
    shared: Arc<SimShared>,

    // Session-scoped configuration.
    unit_types: Arc<Vec<UnitType>>,
    domain: Domain,
    vertex_force_radius: Scalar,
    vertex_force_radius2: Scalar,
    vertex_force_strength: Scalar,
    central_force_overshoot: Scalar,
    central_force_strength: Scalar,
    session_id: SessionId,

    // Simulation state.
    grid: Grid,
    bonds: BondMap,
    picks: PickLedger,
    copied_units: Vec<CopiedUnit>,
    copied_bonds: Vec<(BondKey, BondKey)>,

    /// The most recently published state; the source of the next step.
    current: Arc<UnitStateArray>,
    /// Reclaimed staging buffer for the next step, when the triple buffer
    /// evicted an unshared slot.
    scratch: Option<UnitStateArray>,

    // Step scratch storage, grown geometrically and reused.
    forces: Vec<Vector>,
    torques: Vec<Vector>,
    drained: Vec<UiRequest>,
}

impl Simulation {
    /// Create an empty simulation from a configuration document.
    ///
    /// The session is valid immediately; the state array starts empty.
    #[must_use]
    pub fn new(config: &EngineConfig) -> (Self, SimulationHandle) {
        let unit_types = Arc::new(config.build_unit_types());
        let sim = Self::build(config, unit_types, SessionId(1));
        let handle = sim.handle();
        (sim, handle)
    }

    /// Create a simulation whose first act is loading the given state
    /// file.
    ///
    /// The session reads as invalid until the queued load applies; the
    /// configuration supplies only the initial parameters.
    #[must_use]
    pub fn with_initial_load(config: &EngineConfig, source: LoadSource) -> (Self, SimulationHandle) {
        let sim = Self::build(config, Arc::new(Vec::new()), SessionId::INVALID);
        let handle = sim.handle();
        handle
            .load_state(source)
            .expect("fresh request queue cannot be full");
        (sim, handle)
    }

    fn build(config: &EngineConfig, unit_types: Arc<Vec<UnitType>>, session_id: SessionId) -> Self {
        let (events_tx, events_rx) = unbounded();
        let parameters = Arc::new(SnapshotBuffer::new());
        parameters.publish(Arc::new(config.parameters));

        let current = Arc::new(UnitStateArray {
            session_id,
            time_stamp: 1,
            states: Vec::new(),
        });
        let states = Arc::new(SnapshotBuffer::new());
        states.publish(Arc::clone(&current));

        let shared = Arc::new(SimShared {
            requests: RequestQueue::new(),
            states,
            parameters,
            session: RwLock::new(SessionInfo {
                session_id,
                domain: config.domain,
                unit_types: Arc::clone(&unit_types),
            }),
            load_session_id: Mutex::new(session_id),
            pick_ids: Mutex::new(PickIdAllocator::new()),
            events_tx,
            events_rx,
        });

        // A valid (if typeless) grid from the start, so request application
        // never sees an uninitialised one even if an initial load fails.
        let grid = Grid::create(
            &config.domain,
            &unit_types,
            config.central_force_overshoot,
            config.vertex_force_radius,
        );

        Self {
            shared,
            unit_types,
            domain: config.domain,
            vertex_force_radius: config.vertex_force_radius,
            vertex_force_radius2: config.vertex_force_radius * config.vertex_force_radius,
            vertex_force_strength: config.vertex_force_strength,
            central_force_overshoot: config.central_force_overshoot,
            central_force_strength: config.central_force_strength,
            session_id,
            grid,
            bonds: BondMap::new(),
            picks: PickLedger::new(),
            copied_units: Vec::new(),
            copied_bonds: Vec::new(),
            current,
            scratch: None,
            forces: Vec::new(),
            torques: Vec::new(),
            drained: Vec::new(),
        }
    }

    /// A new front-end handle to this simulation.
    #[must_use]
    pub fn handle(&self) -> SimulationHandle {
        SimulationHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Number of units in the most recent state.
    #[must_use]
    pub fn num_units(&self) -> usize {
        self.current.states.len()
    }

    /// Number of live bonds.
    #[must_use]
    pub fn num_bonds(&self) -> usize {
        self.bonds.len()
    }

    /// The live bond map.
    #[must_use]
    pub fn bonds(&self) -> &BondMap {
        &self.bonds
    }

    /// The live pick ledger.
    #[must_use]
    pub fn picks(&self) -> &PickLedger {
        &self.picks
    }

    /// The current session's domain.
    #[must_use]
    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    /// The current session's unit-type registry.
    #[must_use]
    pub fn unit_types(&self) -> &[UnitType] {
        &self.unit_types
    }

    fn force_params(&self, parameters: &Parameters) -> ForceParams {
        ForceParams {
            vertex_force_radius: self.vertex_force_radius,
            vertex_force_radius2: self.vertex_force_radius2,
            vertex_force_strength: self.vertex_force_strength,
            central_force_overshoot: self.central_force_overshoot,
            central_force_strength: self.central_force_strength,
            linear_damp: parameters.linear_damp,
            angular_damp: parameters.angular_damp,
        }
    }

    /// Advance the simulation by the given real-time step.
    ///
    /// The step is scaled by the current time factor and clamped to the
    /// stability limit; then: forces on the current state, half-step
    /// integration, forces on the midpoint, full-step integration, request
    /// application, bond update, snapshot publication.
    pub fn advance(&mut self, time_step: Scalar) {
        let parameters = self.shared.parameters.latest().map_or_else(Parameters::default, |p| *p);
        let time_factor = parameters.time_factor;
        let dt = (time_step * time_factor).min(MAX_TIME_STEP);

        let mut requests = std::mem::take(&mut self.drained);
        self.shared.requests.drain_into(&mut requests);

        let num_units = self.current.states.len();
        if self.forces.len() < num_units {
            let mut capacity = self.forces.len();
            while capacity < num_units {
                capacity = capacity * 5 / 4 + 1;
            }
            self.forces.resize(capacity, Vector::zeros());
            self.torques.resize(capacity, Vector::zeros());
        }

        // Stage the next state, reusing a reclaimed slot when available.
        let mut next = self.scratch.take().unwrap_or_default();
        next.time_stamp = self.current.time_stamp.wrapping_add(1);
        let mut num_new = 0;
        for request in &requests {
            match request {
                UiRequest::Paste { .. } => num_new += self.copied_units.len(),
                UiRequest::Create { .. } => num_new += 1,
                _ => {}
            }
        }
        next.states.clear();
        next.states.reserve(num_units + num_new);
        next.states.resize(num_units, UnitState::default());
        self.grid.reserve(num_units + num_new);

        // Two-stage midpoint integration.
        let force_params = self.force_params(&parameters);
        calc_forces(
            &force_params,
            &self.unit_types,
            &self.domain,
            &self.grid,
            &self.bonds,
            &self.current.states,
            &mut self.forces[..num_units],
            &mut self.torques[..num_units],
        );
        apply_forces(
            &self.unit_types,
            &self.domain,
            &self.current.states,
            &mut next.states,
            &self.forces,
            &self.torques,
            parameters.attenuation,
            dt * 0.5,
        );
        self.grid.move_units(&next.states);
        calc_forces(
            &force_params,
            &self.unit_types,
            &self.domain,
            &self.grid,
            &self.bonds,
            &next.states,
            &mut self.forces[..num_units],
            &mut self.torques[..num_units],
        );
        apply_forces(
            &self.unit_types,
            &self.domain,
            &self.current.states,
            &mut next.states,
            &self.forces,
            &self.torques,
            parameters.attenuation,
            dt,
        );
        self.grid.move_units(&next.states);

        // Requests observe the integrated state, in FIFO order.
        for request in requests.drain(..) {
            self.apply_request(request, &mut next, time_factor);
        }

        self.update_bonds(&next.states);

        #[cfg(debug_assertions)]
        self.grid.check(&next.states);

        next.session_id = self.session_id;
        let next = Arc::new(next);
        self.current = Arc::clone(&next);
        let evicted = self.shared.states.publish(next);
        self.scratch = evicted.and_then(|arc| Arc::try_unwrap(arc).ok());
        self.drained = requests;
    }

    fn apply_request(&mut self, request: UiRequest, next: &mut UnitStateArray, time_factor: Scalar) {
        match request {
            UiRequest::PickPoint {
                pick_id,
                position,
                radius,
                orientation,
                connected,
            } => self.apply_pick_point(next, pick_id, position, radius, orientation, connected),

            UiRequest::PickRay { pick_id, .. } => {
                // Present in the protocol, unimplemented in the back end:
                // the pick id never acquires a ledger entry.
                debug!(%pick_id, "ray pick request dropped");
                self.release_pick_id(pick_id);
            }

            UiRequest::Paste {
                pick_id,
                position,
                orientation,
                linear_velocity,
                angular_velocity,
            } => self.apply_paste(
                next,
                pick_id,
                position,
                orientation,
                linear_velocity,
                angular_velocity,
                time_factor,
            ),

            UiRequest::Create {
                pick_id,
                unit_type,
                position,
                orientation,
                linear_velocity,
                angular_velocity,
            } => self.apply_create(
                next,
                pick_id,
                unit_type,
                position,
                orientation,
                linear_velocity,
                angular_velocity,
                time_factor,
            ),

            UiRequest::SetState {
                pick_id,
                position,
                orientation,
                linear_velocity,
                angular_velocity,
            } => self.apply_set_state(
                next,
                pick_id,
                position,
                orientation,
                linear_velocity,
                angular_velocity,
                time_factor,
            ),

            UiRequest::Copy { pick_id } => self.apply_copy(next, pick_id),

            UiRequest::Destroy { pick_id } => self.apply_destroy(next, pick_id),

            UiRequest::Release { pick_id } => {
                if let Some(records) = self.picks.remove(pick_id) {
                    for record in &records {
                        next.states[record.unit as usize].pick_id = PickId::NONE;
                    }
                }
                self.release_pick_id(pick_id);
            }

            UiRequest::SaveState { mut sink, on_complete } => {
                let saved = SavedState {
                    unit_types: (*self.unit_types).clone(),
                    domain: self.domain,
                    vertex_force_radius: self.vertex_force_radius,
                    vertex_force_strength: self.vertex_force_strength,
                    central_force_overshoot: self.central_force_overshoot,
                    central_force_strength: self.central_force_strength,
                    states: next.states.clone(),
                    bonds: self.bonds.iter_canonical().collect(),
                };
                match saved.write(&mut *sink) {
                    Ok(()) => {
                        info!(units = saved.states.len(), bonds = saved.bonds.len(), "saved state");
                    }
                    Err(err) => warn!(%err, "state save failed"),
                }
                if let Some(on_complete) = on_complete {
                    on_complete();
                }
            }

            UiRequest::LoadState { mut source, session_id } => {
                match SavedState::read(&mut *source) {
                    Ok(loaded) => self.apply_load(next, loaded, session_id),
                    Err(err) => {
                        warn!(%err, "state load failed; keeping previous state");
                    }
                }
            }
        }
    }

    fn release_pick_id(&self, pick_id: PickId) {
        self.shared
            .pick_ids
            .lock()
            .expect("pick id lock poisoned")
            .release(pick_id);
    }

    fn apply_pick_point(
        &mut self,
        next: &mut UnitStateArray,
        pick_id: PickId,
        position: Point,
        radius: Scalar,
        orientation: Rotation,
        connected: bool,
    ) {
        let pick_position = self.domain.wrap_position(position);
        let center = self.grid.cell_coords_of(&pick_position);
        let cell_size = self.grid.cell_size();

        // Region of cells whose contents may intersect the query sphere.
        let mut reach = [0i64; 3];
        for i in 0..3 {
            reach[i] = (radius / cell_size[i]).ceil() as i64 + 1;
        }

        let mut picked: Option<UnitIndex> = None;
        let mut best_dist2 = Scalar::MAX;
        for x in -reach[0]..=reach[0] {
            for y in -reach[1]..=reach[1] {
                for z in -reach[2]..=reach[2] {
                    let cell = self.grid.wrapped_cell_index([
                        i64::from(center[0]) + x,
                        i64::from(center[1]) + y,
                        i64::from(center[2]) + z,
                    ]);
                    for &unit in self.grid.cell_units(cell) {
                        let state = &next.states[unit as usize];
                        let unit_radius = self.unit_types[state.unit_type.raw() as usize].radius;
                        let dist2 = self
                            .domain
                            .wrap_distance(state.position - pick_position)
                            .norm_squared();
                        let reach2 = (unit_radius + radius) * (unit_radius + radius);
                        if dist2 <= reach2 && dist2 < best_dist2 {
                            picked = Some(unit);
                            best_dist2 = dist2;
                        }
                    }
                }
            }
        }

        if let Some(unit) = picked {
            self.pick_units(next, unit, pick_position, orientation, connected, pick_id);
        } else {
            debug!(%pick_id, "point pick found no unit");
            self.release_pick_id(pick_id);
        }
    }

    /// Create pick records for `unit` and, if `connected`, everything
    /// reachable from it across bonds.
    fn pick_units(
        &mut self,
        next: &mut UnitStateArray,
        unit: UnitIndex,
        pick_position: Point,
        pick_orientation: Rotation,
        connected: bool,
        pick_id: PickId,
    ) {
        let inverse = pick_orientation.inverse();
        let mut queue = VecDeque::with_capacity(8);
        let mut seen = HashSet::new();
        queue.push_back(unit);
        seen.insert(unit);

        while let Some(unit) = queue.pop_front() {
            let state = &mut next.states[unit as usize];

            // A unit changing hands leaves its old pick's record list.
            if state.pick_id.is_some() {
                self.picks.unpick_unit(state.pick_id, unit);
            }
            state.pick_id = pick_id;
            let record = PickRecord {
                unit,
                position_offset: inverse
                    * self.domain.wrap_distance(state.position - pick_position),
                orientation_offset: inverse * state.orientation,
            };
            self.picks.entry(pick_id).push(record);

            if connected {
                let num_sites = self.unit_types[next.states[unit as usize].unit_type.raw() as usize]
                    .bond_sites
                    .len();
                for site in 0..num_sites {
                    if let Some(partner) = self.bonds.lookup(BondKey::new(unit, site as u32)) {
                        if seen.insert(partner.unit) {
                            queue.push_back(partner.unit);
                        }
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_paste(
        &mut self,
        next: &mut UnitStateArray,
        pick_id: PickId,
        position: Point,
        orientation: Rotation,
        linear_velocity: Vector,
        angular_velocity: Vector,
        time_factor: Scalar,
    ) {
        if self.copied_units.is_empty() {
            self.release_pick_id(pick_id);
            return;
        }

        // User-visible velocities are in real time.
        let lv = linear_velocity / time_factor;
        let av = angular_velocity / time_factor;

        let first_index = next.states.len() as UnitIndex;
        let records = self.picks.entry(pick_id);
        records.reserve(self.copied_units.len());
        for copied in &self.copied_units {
            let offset = orientation * copied.position_offset;
            let mut orientation_new = orientation * copied.orientation_offset;
            orientation_new.renormalize();
            let state = UnitState {
                unit_type: copied.unit_type,
                pick_id,
                position: self.domain.wrap_position(position + offset),
                orientation: orientation_new,
                linear_velocity: lv + av.cross(&offset),
                angular_velocity: av,
            };

            let index = next.states.len() as UnitIndex;
            self.grid.insert_unit(index, &state);
            records.push(PickRecord {
                unit: index,
                position_offset: copied.position_offset,
                orientation_offset: copied.orientation_offset,
            });
            next.states.push(state);
        }

        // Re-create the buffered bonds, remapped into state index space.
        for (a, b) in &self.copied_bonds {
            self.bonds.insert_pair(
                BondKey::new(a.unit + first_index, a.site),
                BondKey::new(b.unit + first_index, b.site),
            );
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_create(
        &mut self,
        next: &mut UnitStateArray,
        pick_id: PickId,
        unit_type: UnitTypeId,
        position: Point,
        orientation: Rotation,
        linear_velocity: Vector,
        angular_velocity: Vector,
        time_factor: Scalar,
    ) {
        // Only create when the pick did not land on an existing unit.
        if self.picks.contains(pick_id) {
            return;
        }
        if unit_type.raw() as usize >= self.unit_types.len() {
            debug!(%unit_type, "create request with unknown unit type ignored");
            return;
        }

        let state = UnitState {
            unit_type,
            pick_id,
            position: self.domain.wrap_position(position),
            orientation,
            linear_velocity: linear_velocity / time_factor,
            angular_velocity: angular_velocity / time_factor,
        };

        let index = next.states.len() as UnitIndex;
        self.grid.insert_unit(index, &state);
        self.picks.entry(pick_id).push(PickRecord {
            unit: index,
            position_offset: Vector::zeros(),
            orientation_offset: Rotation::identity(),
        });
        // The id now owns a unit; keep the allocator from reissuing it.
        self.shared
            .pick_ids
            .lock()
            .expect("pick id lock poisoned")
            .mark(pick_id);
        next.states.push(state);
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_set_state(
        &mut self,
        next: &mut UnitStateArray,
        pick_id: PickId,
        position: Point,
        orientation: Rotation,
        linear_velocity: Vector,
        angular_velocity: Vector,
        time_factor: Scalar,
    ) {
        let Some(records) = self.picks.get(pick_id) else {
            return;
        };

        let lv = linear_velocity / time_factor;
        let av = angular_velocity / time_factor;
        for record in records {
            let state = &mut next.states[record.unit as usize];
            let offset = orientation * record.position_offset;
            state.position = self.domain.wrap_position(position + offset);
            state.orientation = orientation * record.orientation_offset;
            state.orientation.renormalize();
            state.linear_velocity = lv + av.cross(&offset);
            state.angular_velocity = av;
            self.grid.move_unit(record.unit, state);
        }
    }

    fn apply_copy(&mut self, next: &mut UnitStateArray, pick_id: PickId) {
        let Some(records) = self.picks.get(pick_id) else {
            return;
        };

        let mut copied_units = Vec::with_capacity(records.len());
        let mut index_map: HashMap<UnitIndex, UnitIndex> = HashMap::with_capacity(records.len());
        for (copied_index, record) in records.iter().enumerate() {
            let state = &next.states[record.unit as usize];
            copied_units.push(CopiedUnit {
                unit_type: state.unit_type,
                position_offset: record.position_offset,
                orientation_offset: record.orientation_offset,
            });
            index_map.insert(record.unit, copied_index as UnitIndex);
        }

        // Keep every bond internal to the picked set, in copy-buffer index
        // space.
        let mut copied_bonds = Vec::new();
        for record in records {
            let state = &next.states[record.unit as usize];
            let num_sites = self.unit_types[state.unit_type.raw() as usize].bond_sites.len();
            for site in 0..num_sites {
                let Some(partner) = self.bonds.lookup(BondKey::new(record.unit, site as u32))
                else {
                    continue;
                };
                if partner.unit > record.unit
                    && next.states[partner.unit as usize].pick_id == pick_id
                {
                    copied_bonds.push((
                        BondKey::new(index_map[&record.unit], site as u32),
                        BondKey::new(index_map[&partner.unit], partner.site),
                    ));
                }
            }
        }

        self.copied_units = copied_units;
        self.copied_bonds = copied_bonds;
    }

    fn apply_destroy(&mut self, next: &mut UnitStateArray, pick_id: PickId) {
        if let Some(records) = self.picks.remove(pick_id) {
            // Phase 1: detach every doomed unit, leaving holes in the dense
            // index space.
            let mut holes: Vec<UnitIndex> = Vec::with_capacity(records.len());
            for record in &records {
                let state = &next.states[record.unit as usize];
                let num_sites =
                    self.unit_types[state.unit_type.raw() as usize].bond_sites.len();
                for site in 0..num_sites {
                    self.bonds.remove_at(BondKey::new(record.unit, site as u32));
                }
                self.grid.remove_unit(record.unit);
                holes.push(record.unit);
            }

            // Phase 2: compact by moving the last live unit into the lowest
            // hole, lowest holes first.
            holes.sort_unstable();
            let mut first = 0;
            let mut end = holes.len();
            loop {
                // Holes at the very end just shrink the array.
                while end != first && holes[end - 1] as usize == next.states.len() - 1 {
                    end -= 1;
                    next.states.pop();
                }
                if first == end {
                    break;
                }

                let hole = holes[first];
                let old_index = (next.states.len() - 1) as UnitIndex;
                let moved = next.states[old_index as usize];
                next.states[hole as usize] = moved;
                next.states.pop();

                // Rewrite the moved unit's bond endpoints.
                let num_sites =
                    self.unit_types[moved.unit_type.raw() as usize].bond_sites.len();
                for site in 0..num_sites {
                    if let Some(partner) = self.bonds.remove_at(BondKey::new(old_index, site as u32))
                    {
                        self.bonds
                            .insert_pair(BondKey::new(hole, site as u32), partner);
                    }
                }

                self.grid.change_unit_index(old_index, hole);

                if moved.pick_id.is_some() {
                    self.picks.reindex_unit(moved.pick_id, old_index, hole);
                }

                first += 1;
            }
        }
        self.release_pick_id(pick_id);
    }

    fn apply_load(&mut self, next: &mut UnitStateArray, loaded: SavedState, session_id: SessionId) {
        let num_units = loaded.states.len();
        let num_bonds = loaded.bonds.len();

        self.unit_types = Arc::new(loaded.unit_types);
        self.domain = loaded.domain;
        self.vertex_force_radius = loaded.vertex_force_radius;
        self.vertex_force_radius2 = loaded.vertex_force_radius * loaded.vertex_force_radius;
        self.vertex_force_strength = loaded.vertex_force_strength;
        self.central_force_overshoot = loaded.central_force_overshoot;
        self.central_force_strength = loaded.central_force_strength;

        self.grid = Grid::create(
            &self.domain,
            &self.unit_types,
            self.central_force_overshoot,
            self.vertex_force_radius,
        );
        next.states = loaded.states;
        self.grid.reserve(next.states.len());
        for (index, state) in next.states.iter().enumerate() {
            self.grid.insert_unit(index as UnitIndex, state);
        }

        self.bonds.clear();
        for (a, b) in loaded.bonds {
            self.bonds.insert_pair(a, b);
        }

        // Every previously issued pick dies with the old session.
        self.picks.clear();
        self.shared
            .pick_ids
            .lock()
            .expect("pick id lock poisoned")
            .clear();

        self.session_id = session_id;
        {
            let mut session = self.shared.session.write().expect("session lock poisoned");
            *session = SessionInfo {
                session_id,
                domain: self.domain,
                unit_types: Arc::clone(&self.unit_types),
            };
        }
        let _ = self.shared.events_tx.send(EngineEvent::SessionChanged(session_id));

        info!(units = num_units, bonds = num_bonds, %session_id, "loaded state");
    }

    /// Break bonds stretched past the cutoff, then greedily bond free
    /// sites to the first free partner site in range.
    fn update_bonds(&mut self, states: &[UnitState]) {
        for (ui0, u0) in states.iter().enumerate() {
            let ui0 = ui0 as UnitIndex;
            let ut0 = &self.unit_types[u0.unit_type.raw() as usize];

            'sites: for (site0, bond_site) in ut0.bond_sites.iter().enumerate() {
                let bs0 = bond_site.world_offset(&u0.orientation);
                let key0 = BondKey::new(ui0, site0 as u32);

                if let Some(partner) = self.bonds.lookup(key0) {
                    // Only the canonical direction tests for breakage.
                    if partner.unit > ui0 {
                        let u1 = &states[partner.unit as usize];
                        let ut1 = &self.unit_types[u1.unit_type.raw() as usize];
                        let bs1 =
                            ut1.bond_sites[partner.site as usize].world_offset(&u1.orientation);
                        let dist = self.domain.wrap_distance(u1.position - u0.position) - bs0 + bs1;
                        if dist.norm_squared() > self.vertex_force_radius2 {
                            self.bonds.remove_pair(key0, partner);
                        }
                    }
                    continue 'sites;
                }

                // Free site: search the neighbourhood for a free partner.
                for neighbor in self.grid.neighbors_of(self.grid.cell_of_unit(ui0)) {
                    for &ui1 in self.grid.cell_units(neighbor) {
                        if ui1 <= ui0 {
                            continue;
                        }
                        let u1 = &states[ui1 as usize];
                        let ut1 = &self.unit_types[u1.unit_type.raw() as usize];

                        let dist = self.domain.wrap_distance(u1.position - u0.position) - bs0;
                        let reach = ut1.radius + self.vertex_force_radius;
                        if dist.norm_squared() > reach * reach {
                            continue;
                        }

                        for (site1, partner_site) in ut1.bond_sites.iter().enumerate() {
                            let key1 = BondKey::new(ui1, site1 as u32);
                            if self.bonds.is_bonded(key1) {
                                continue;
                            }
                            let bond_dist = dist + partner_site.world_offset(&u1.orientation);
                            if bond_dist.norm_squared() <= self.vertex_force_radius2 {
                                self.bonds.insert_pair(key0, key1);
                                continue 'sites;
                            }
                        }
                    }
                }
            }
        }

        #[cfg(debug_assertions)]
        self.bonds.check_symmetry();
    }
}
