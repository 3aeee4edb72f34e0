//! Multi-user server plugin.
//!
//! Owns the authoritative [`Simulation`] and its thread, accepts client
//! sessions over the host runtime's transport, translates per-client pick
//! ids into engine pick ids, broadcasts parameter and session
//! notifications, reduces and broadcasts the newest snapshot on a periodic
//! tick, and orchestrates streamed save/load through the bulk-stream
//! facility.
//!
//! Threading contract: every method of [`Server`] is called from the host
//! runtime's single I/O thread. The simulation runs on its own thread and
//! is reached exclusively through the engine's request queue and snapshot
//! buffer, so no method here ever blocks on the simulation.

#![warn(missing_docs)]

use std::io;
use std::sync::Arc;

use hashbrown::HashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

use nck_engine::{
    EngineConfig, EngineEvent, EnqueueError, Simulation, SimulationHandle, SimulationRunner,
    SnapshotReader,
};
use nck_proto::{
    BulkStreamError, ClientId, ClientMessage, ProtocolError, ServerBulkStreams, ServerMessage,
    ServerTransport, SessionUpdate,
};
use nck_types::{PickId, ReducedUnitState, ReducedUnitStateArray, UnitStateArray};

use crossbeam_channel::Receiver;

/// Error handling a client's message.
///
/// Any error returned from [`Server::handle_message`] means the offending
/// peer must be dropped by the host; the engine and all other peers are
/// unaffected.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The frame failed to decode.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The engine's request queue rejected the request.
    #[error(transparent)]
    Enqueue(#[from] EnqueueError),

    /// The bulk-stream facility failed.
    #[error(transparent)]
    Stream(#[from] BulkStreamError),

    /// A message referenced a client the server does not know.
    #[error("unknown client {client}")]
    UnknownClient {
        /// The offending client id.
        client: ClientId,
    },
}

/// Error executing a host (operator) command.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The requested update rate is not positive.
    #[error("invalid simulation update rate {rate}")]
    InvalidUpdateRate {
        /// The rejected rate.
        rate: f64,
    },

    /// The state file could not be opened.
    #[error("state file error: {0}")]
    Io(#[from] io::Error),

    /// The engine's request queue rejected the request.
    #[error(transparent)]
    Enqueue(#[from] EnqueueError),
}

/// Server construction parameters.
#[derive(Debug, Clone, Copy)]
pub struct ServerConfig {
    /// Rate of the reduced-state broadcast, in Hz.
    pub update_rate: f64,
    /// Message base the handshake assigned to client messages.
    pub client_message_base: u16,
    /// Message base the handshake assigned to server messages.
    pub server_message_base: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            update_rate: 60.0,
            client_message_base: 0,
            server_message_base: 0,
        }
    }
}

/// Per-client state: the mapping from the client's pick-id space into the
/// engine's.
#[derive(Debug, Default)]
struct ClientRecord {
    pick_id_map: HashMap<PickId, PickId>,
}

/// The server plugin.
pub struct Server {
    handle: SimulationHandle,
    runner: SimulationRunner,
    transport: Arc<dyn ServerTransport>,
    streams: Arc<dyn ServerBulkStreams>,
    clients: HashMap<ClientId, ClientRecord>,
    events: Receiver<EngineEvent>,
    state_reader: SnapshotReader<UnitStateArray>,
    /// Scratch for the reduced broadcast form, reused across ticks.
    reduced: ReducedUnitStateArray,
    update_rate: f64,
    client_message_base: u16,
    server_message_base: u16,
}

impl Server {
    /// Create a server around an already-constructed simulation.
    ///
    /// The simulation thread starts paused; the first client connection
    /// unpauses it.
    #[must_use]
    pub fn new(
        sim: Simulation,
        transport: Arc<dyn ServerTransport>,
        streams: Arc<dyn ServerBulkStreams>,
        config: ServerConfig,
    ) -> Self {
        let handle = sim.handle();
        let events = handle.events();
        let state_reader = handle.state_reader();
        let runner = SimulationRunner::spawn(sim);
        Self {
            handle,
            runner,
            transport,
            streams,
            clients: HashMap::new(),
            events,
            state_reader,
            reduced: ReducedUnitStateArray::empty(),
            update_rate: config.update_rate,
            client_message_base: config.client_message_base,
            server_message_base: config.server_message_base,
        }
    }

    /// Convenience constructor: build the simulation from a configuration
    /// document.
    #[must_use]
    pub fn from_config(
        engine_config: &EngineConfig,
        transport: Arc<dyn ServerTransport>,
        streams: Arc<dyn ServerBulkStreams>,
        config: ServerConfig,
    ) -> Self {
        let (sim, _) = Simulation::new(engine_config);
        Self::new(sim, transport, streams, config)
    }

    /// The front-end handle to the simulation.
    #[must_use]
    pub fn simulation(&self) -> &SimulationHandle {
        &self.handle
    }

    /// Current broadcast rate in Hz. The host times
    /// [`broadcast_tick`](Self::broadcast_tick) off this.
    #[must_use]
    pub fn update_rate(&self) -> f64 {
        self.update_rate
    }

    /// Whether any client is connected (and hence the broadcast timer
    /// should be armed).
    #[must_use]
    pub fn has_clients(&self) -> bool {
        !self.clients.is_empty()
    }

    fn send(&self, client: ClientId, message: &ServerMessage) {
        self.transport
            .send(client, &message.encode(self.server_message_base));
    }

    fn broadcast(&self, except: Option<ClientId>, message: &ServerMessage) {
        self.transport
            .broadcast(except, &message.encode(self.server_message_base));
    }

    fn session_update(&self) -> ServerMessage {
        let session = self.handle.session();
        ServerMessage::SessionUpdate(SessionUpdate {
            session_id: session.session_id,
            domain: session.domain,
            unit_types: (*session.unit_types).clone(),
        })
    }

    /// A client finished the protocol handshake.
    ///
    /// The first client unpauses the simulation thread. The new client
    /// receives the current parameters and, if a session is established,
    /// a session update.
    pub fn client_connected(&mut self, client: ClientId) {
        if self.clients.is_empty() {
            self.runner.unpause();
        }
        info!(client, "client connected");
        self.clients.insert(client, ClientRecord::default());

        self.send(client, &ServerMessage::SetParameters(self.handle.parameters()));
        if self.handle.is_session_valid() {
            self.send(client, &self.session_update());
        }
    }

    /// A client's connection went away.
    ///
    /// Every pick the client still holds is released on its behalf; the
    /// last client pauses the simulation thread.
    pub fn client_disconnected(&mut self, client: ClientId) {
        info!(client, "client disconnected");
        if let Some(record) = self.clients.remove(&client) {
            for (_, server_pick) in record.pick_id_map {
                if let Err(err) = self.handle.release(server_pick) {
                    warn!(client, %server_pick, %err, "failed to release pick of departing client");
                }
            }
        }
        if self.clients.is_empty() {
            self.runner.pause();
        }
    }

    /// Handle one frame from a client.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError`] when the frame is malformed, references an
    /// unknown stream, or overruns the engine's request queue; the caller
    /// must drop the peer in every error case.
    pub fn handle_message(&mut self, client: ClientId, frame: &[u8]) -> Result<(), ServerError> {
        let message = ClientMessage::decode(self.client_message_base, frame)?;
        if !self.clients.contains_key(&client) {
            return Err(ServerError::UnknownClient { client });
        }

        match message {
            ClientMessage::SetParameters(parameters) => {
                self.handle.set_parameters(parameters);
                // Everyone but the sender learns about the change.
                self.broadcast(Some(client), &ServerMessage::SetParameters(parameters));
            }

            ClientMessage::PointPick {
                pick_id,
                position,
                radius,
                orientation,
                connected,
            } => {
                let server_pick = self.handle.pick_point(position, radius, orientation, connected)?;
                self.record_mut(client)?.pick_id_map.insert(pick_id, server_pick);
            }

            ClientMessage::RayPick {
                pick_id,
                position,
                direction,
                orientation,
                connected,
            } => {
                let server_pick = self.handle.pick_ray(position, direction, orientation, connected)?;
                self.record_mut(client)?.pick_id_map.insert(pick_id, server_pick);
            }

            ClientMessage::PasteUnit {
                pick_id,
                position,
                orientation,
                linear_velocity,
                angular_velocity,
            } => {
                let server_pick =
                    self.handle
                        .paste(position, orientation, linear_velocity, angular_velocity)?;
                self.record_mut(client)?.pick_id_map.insert(pick_id, server_pick);
            }

            ClientMessage::CreateUnit {
                pick_id,
                unit_type,
                position,
                orientation,
                linear_velocity,
                angular_velocity,
            } => {
                if let Some(server_pick) = self.translate(client, pick_id)? {
                    self.handle.create(
                        server_pick,
                        unit_type,
                        position,
                        orientation,
                        linear_velocity,
                        angular_velocity,
                    )?;
                }
            }

            ClientMessage::SetUnitState {
                pick_id,
                position,
                orientation,
                linear_velocity,
                angular_velocity,
            } => {
                if let Some(server_pick) = self.translate(client, pick_id)? {
                    self.handle.set_state(
                        server_pick,
                        position,
                        orientation,
                        linear_velocity,
                        angular_velocity,
                    )?;
                }
            }

            ClientMessage::CopyUnit { pick_id } => {
                if let Some(server_pick) = self.translate(client, pick_id)? {
                    self.handle.copy(server_pick)?;
                }
            }

            ClientMessage::DestroyUnit { pick_id } => {
                if let Some(server_pick) = self.translate(client, pick_id)? {
                    self.handle.destroy(server_pick)?;
                }
            }

            ClientMessage::Release { pick_id } => {
                if let Some(server_pick) =
                    self.record_mut(client)?.pick_id_map.remove(&pick_id)
                {
                    self.handle.release(server_pick)?;
                } else {
                    debug!(client, %pick_id, "release for unknown pick id ignored");
                }
            }

            ClientMessage::LoadState { stream } => {
                let source = self.streams.accept_in_stream(client, stream)?;
                self.handle.load_state(source)?;
                // A paused engine still has to perform the queued I/O.
                self.runner.wake_for_io();
            }

            ClientMessage::SaveState => {
                let (stream, sink) = self.streams.forward_out_stream(client)?;
                self.send(client, &ServerMessage::SaveStateReply { stream });
                self.handle.save_state(sink, None)?;
                self.runner.wake_for_io();
            }
        }
        Ok(())
    }

    fn record_mut(&mut self, client: ClientId) -> Result<&mut ClientRecord, ServerError> {
        self.clients
            .get_mut(&client)
            .ok_or(ServerError::UnknownClient { client })
    }

    /// Translate a client pick id to the engine's id; unknown ids are a
    /// semantic no-op (client/server skew makes them routine).
    fn translate(
        &mut self,
        client: ClientId,
        pick_id: PickId,
    ) -> Result<Option<PickId>, ServerError> {
        let record = self.record_mut(client)?;
        let translated = record.pick_id_map.get(&pick_id).copied();
        if translated.is_none() {
            debug!(client, %pick_id, "request references unknown pick id, ignored");
        }
        Ok(translated)
    }

    /// Periodic broadcast: called by the host at [`update_rate`] while
    /// clients are connected.
    ///
    /// Drains engine events (session changes become session-update
    /// broadcasts), then, if the engine published a new valid snapshot
    /// since the last tick, reduces it and broadcasts a simulation update.
    ///
    /// [`update_rate`]: Self::update_rate
    pub fn broadcast_tick(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            match event {
                EngineEvent::SessionChanged(session_id) => {
                    info!(%session_id, "session changed, broadcasting update");
                    let update = self.session_update();
                    self.broadcast(None, &update);
                }
            }
        }

        if self.clients.is_empty() {
            return;
        }
        if !self.state_reader.lock_newest() {
            return;
        }
        let states = self
            .state_reader
            .locked()
            .expect("lock_newest returned true");
        if states.session_id != self.handle.session_id() {
            // Stale snapshot straddling a reload; skip it.
            return;
        }

        self.reduced.session_id = states.session_id;
        self.reduced.time_stamp = states.time_stamp;
        self.reduced.states.clear();
        self.reduced.states.reserve(states.states.len());
        self.reduced
            .states
            .extend(states.states.iter().map(ReducedUnitState::from));

        let frame =
            ServerMessage::encode_simulation_update(self.server_message_base, &self.reduced);
        self.transport.broadcast(None, &frame);
    }

    /// Host command: change the broadcast rate.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::InvalidUpdateRate`] for non-positive rates.
    pub fn set_update_rate(&mut self, rate: f64) -> Result<(), CommandError> {
        if !(rate.is_finite() && rate > 0.0) {
            return Err(CommandError::InvalidUpdateRate { rate });
        }
        self.update_rate = rate;
        info!(rate, "simulation update rate changed");
        Ok(())
    }

    /// Host command: load a state file from the server's file system.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] if the file cannot be opened or the request
    /// queue is full.
    pub fn load_file(&mut self, path: &std::path::Path) -> Result<(), CommandError> {
        let file = std::fs::File::open(path)?;
        self.handle.load_state(Box::new(io::BufReader::new(file)))?;
        self.runner.wake_for_io();
        Ok(())
    }

    /// Host command: save the current state to the server's file system.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] if the file cannot be created or the
    /// request queue is full.
    pub fn save_file(&mut self, path: &std::path::Path) -> Result<(), CommandError> {
        let file = std::fs::File::create(path)?;
        self.handle
            .save_state(Box::new(io::BufWriter::new(file)), None)?;
        self.runner.wake_for_io();
        Ok(())
    }

    /// Stop the simulation thread and recover the simulation.
    #[must_use]
    pub fn shutdown(self) -> Simulation {
        self.runner.shutdown()
    }
}
