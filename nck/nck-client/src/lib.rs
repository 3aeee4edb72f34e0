//! Client plugin: a mirror of a remote simulation.
//!
//! Holds the current session (id, domain, unit types) and parameter set,
//! feeds every `SimulationUpdateNotification` into a local snapshot triple
//! buffer for the renderer, and turns local UI calls into protocol
//! requests. Pick ids are allocated from the client's own 16-bit space
//! (skipping zero); the server translates them.
//!
//! Threading contract: all methods are called from the host runtime's I/O
//! thread for this connection. Renderers read through
//! [`Client::state_reader`] cursors from any thread. The only work the
//! client spawns itself is the background copy of an incoming save stream
//! into its destination file.

#![warn(missing_docs)]

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::thread;

use thiserror::Error;
use tracing::{debug, info, warn};

use nck_proto::{
    BulkStreamError, ClientBulkStreams, ClientMessage, FrameChannel, ProtocolError, ServerMessage,
};
use nck_sync::{SnapshotBuffer, SnapshotReader};
use nck_types::{
    Domain, Parameters, PickId, Point, ReducedUnitStateArray, Rotation, Scalar, SessionId,
    UnitType, UnitTypeId, Vector,
};

/// Callback invoked when an asynchronous server notification changes local
/// state.
pub type NotifyCallback = Box<dyn FnMut() + Send>;

/// Callback invoked when a new session is established.
pub type SessionChangedCallback = Box<dyn FnMut(SessionId) + Send>;

/// Callback invoked once a streamed save has been written to its sink.
pub type SaveCompleteCallback = Box<dyn FnOnce() + Send>;

/// Error handling a server message or issuing a request.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The frame failed to decode; the connection must be dropped.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The bulk-stream facility failed.
    #[error(transparent)]
    Stream(#[from] BulkStreamError),

    /// A save was requested while a previous one is still streaming.
    #[error("a save operation is already in progress")]
    SaveInProgress,

    /// Reading the local state file for a load failed.
    #[error("state upload failed: {0}")]
    Io(#[from] io::Error),
}

struct PendingSave {
    sink: Box<dyn Write + Send>,
    on_complete: Option<SaveCompleteCallback>,
}

/// The client plugin.
pub struct Client {
    channel: Arc<dyn FrameChannel>,
    streams: Arc<dyn ClientBulkStreams>,
    client_message_base: u16,
    server_message_base: u16,

    session_id: SessionId,
    domain: Domain,
    unit_types: Arc<Vec<UnitType>>,
    parameters: Parameters,
    states: Arc<SnapshotBuffer<ReducedUnitStateArray>>,

    last_pick_id: u16,
    pending_save: Option<PendingSave>,

    new_data: Option<NotifyCallback>,
    parameters_changed: Option<NotifyCallback>,
    session_changed: Option<SessionChangedCallback>,
}

impl Client {
    /// Create a client over the given channel and bulk-stream facility,
    /// with handshake-assigned message bases.
    #[must_use]
    pub fn new(
        channel: Arc<dyn FrameChannel>,
        streams: Arc<dyn ClientBulkStreams>,
        client_message_base: u16,
        server_message_base: u16,
    ) -> Self {
        Self {
            channel,
            streams,
            client_message_base,
            server_message_base,
            session_id: SessionId::INVALID,
            domain: Domain::default(),
            unit_types: Arc::new(Vec::new()),
            parameters: Parameters::default(),
            states: Arc::new(SnapshotBuffer::new()),
            last_pick_id: 0,
            pending_save: None,
            new_data: None,
            parameters_changed: None,
            session_changed: None,
        }
    }

    /// Register a callback fired after each ingested simulation update.
    pub fn set_new_data_callback(&mut self, callback: NotifyCallback) {
        self.new_data = Some(callback);
    }

    /// Register a callback fired when the parameter set changes
    /// asynchronously.
    pub fn set_parameters_changed_callback(&mut self, callback: NotifyCallback) {
        self.parameters_changed = Some(callback);
    }

    /// Register a callback fired when a new session is established.
    pub fn set_session_changed_callback(&mut self, callback: SessionChangedCallback) {
        self.session_changed = Some(callback);
    }

    /// The current session id; invalid while no session is established.
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Whether a session is currently established.
    #[must_use]
    pub fn is_session_valid(&self) -> bool {
        self.session_id.is_valid()
    }

    /// The current session's domain.
    #[must_use]
    pub fn domain(&self) -> Domain {
        self.domain
    }

    /// The current session's unit-type registry.
    #[must_use]
    pub fn unit_types(&self) -> Arc<Vec<UnitType>> {
        Arc::clone(&self.unit_types)
    }

    /// The current simulation parameters.
    #[must_use]
    pub fn parameters(&self) -> Parameters {
        self.parameters
    }

    /// Send a parameter change to the server and adopt it locally.
    pub fn set_parameters(&mut self, parameters: Parameters) {
        self.parameters = parameters;
        self.send(&ClientMessage::SetParameters(parameters));
    }

    /// A new reader cursor over the mirrored reduced states.
    ///
    /// A locked snapshot whose session id differs from
    /// [`session_id`](Self::session_id) is stale and must not be rendered.
    #[must_use]
    pub fn state_reader(&self) -> SnapshotReader<ReducedUnitStateArray> {
        self.states.reader()
    }

    fn send(&self, message: &ClientMessage) {
        self.channel.send(&message.encode(self.client_message_base));
    }

    fn next_pick_id(&mut self) -> PickId {
        loop {
            self.last_pick_id = self.last_pick_id.wrapping_add(1);
            if self.last_pick_id != 0 {
                return PickId(self.last_pick_id);
            }
        }
    }

    /// Request a point pick; returns the client-side pick id.
    pub fn pick_point(
        &mut self,
        position: Point,
        radius: Scalar,
        orientation: Rotation,
        connected: bool,
    ) -> PickId {
        let pick_id = self.next_pick_id();
        self.send(&ClientMessage::PointPick {
            pick_id,
            position,
            radius,
            orientation,
            connected,
        });
        pick_id
    }

    /// Request a ray pick; returns the client-side pick id.
    pub fn pick_ray(
        &mut self,
        position: Point,
        direction: Vector,
        orientation: Rotation,
        connected: bool,
    ) -> PickId {
        let pick_id = self.next_pick_id();
        self.send(&ClientMessage::RayPick {
            pick_id,
            position,
            direction,
            orientation,
            connected,
        });
        pick_id
    }

    /// Request a paste of the server-side copy buffer; returns the
    /// client-side pick id owning the pasted units.
    pub fn paste(
        &mut self,
        position: Point,
        orientation: Rotation,
        linear_velocity: Vector,
        angular_velocity: Vector,
    ) -> PickId {
        let pick_id = self.next_pick_id();
        self.send(&ClientMessage::PasteUnit {
            pick_id,
            position,
            orientation,
            linear_velocity,
            angular_velocity,
        });
        pick_id
    }

    /// Request creation of a new unit under an empty pick.
    pub fn create(
        &mut self,
        pick_id: PickId,
        unit_type: UnitTypeId,
        position: Point,
        orientation: Rotation,
        linear_velocity: Vector,
        angular_velocity: Vector,
    ) {
        self.send(&ClientMessage::CreateUnit {
            pick_id,
            unit_type,
            position,
            orientation,
            linear_velocity,
            angular_velocity,
        });
    }

    /// Drive a picked set kinematically.
    pub fn set_state(
        &mut self,
        pick_id: PickId,
        position: Point,
        orientation: Rotation,
        linear_velocity: Vector,
        angular_velocity: Vector,
    ) {
        self.send(&ClientMessage::SetUnitState {
            pick_id,
            position,
            orientation,
            linear_velocity,
            angular_velocity,
        });
    }

    /// Copy a picked set into the server-side copy buffer.
    pub fn copy(&mut self, pick_id: PickId) {
        self.send(&ClientMessage::CopyUnit { pick_id });
    }

    /// Destroy a picked set.
    pub fn destroy(&mut self, pick_id: PickId) {
        self.send(&ClientMessage::DestroyUnit { pick_id });
    }

    /// Release a pick.
    pub fn release(&mut self, pick_id: PickId) {
        self.send(&ClientMessage::Release { pick_id });
    }

    /// Upload a state file to the server, replacing the shared session.
    ///
    /// The source is copied into an outbound bulk stream on the calling
    /// thread.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] if the stream cannot be created or the copy
    /// fails.
    pub fn load_state(&mut self, mut source: Box<dyn Read + Send>) -> Result<(), ClientError> {
        let (stream, mut sink) = self.streams.create_out_stream()?;
        self.send(&ClientMessage::LoadState { stream });
        io::copy(&mut source, &mut sink)?;
        sink.flush()?;
        Ok(())
    }

    /// Ask the server for a state save, to be streamed into `sink`.
    ///
    /// The incoming stream is copied on a background worker; `on_complete`
    /// fires there once the sink is fully written.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::SaveInProgress`] while a previous save is
    /// still streaming.
    pub fn save_state(
        &mut self,
        sink: Box<dyn Write + Send>,
        on_complete: Option<SaveCompleteCallback>,
    ) -> Result<(), ClientError> {
        if self.pending_save.is_some() {
            return Err(ClientError::SaveInProgress);
        }
        self.pending_save = Some(PendingSave { sink, on_complete });
        self.send(&ClientMessage::SaveState);
        Ok(())
    }

    /// Handle one frame from the server.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the frame is malformed or references an
    /// unknown bulk stream; the caller must drop the connection.
    pub fn handle_message(&mut self, frame: &[u8]) -> Result<(), ClientError> {
        match ServerMessage::decode(self.server_message_base, frame)? {
            ServerMessage::SessionInvalid => {
                // Readers will see mirrored snapshots as stale from now on.
                self.session_id = SessionId::INVALID;
            }

            ServerMessage::SessionUpdate(update) => {
                info!(session_id = %update.session_id, units = update.unit_types.len(),
                    "session update");
                self.session_id = update.session_id;
                self.domain = update.domain;
                self.unit_types = Arc::new(update.unit_types);
                if let Some(callback) = &mut self.session_changed {
                    callback(self.session_id);
                }
            }

            ServerMessage::SetParameters(parameters) => {
                self.parameters = parameters;
                if let Some(callback) = &mut self.parameters_changed {
                    callback();
                }
            }

            ServerMessage::SimulationUpdate(states) => {
                self.states.publish(Arc::new(states));
                if let Some(callback) = &mut self.new_data {
                    callback();
                }
            }

            ServerMessage::SaveStateReply { stream } => {
                let Some(pending) = self.pending_save.take() else {
                    debug!(stream, "save reply without a pending save, ignored");
                    return Ok(());
                };
                let source = self.streams.accept_in_stream(stream)?;
                spawn_save_worker(source, pending);
            }
        }
        Ok(())
    }
}

/// Copy an incoming save stream to its destination off the I/O thread.
fn spawn_save_worker(mut source: Box<dyn Read + Send>, pending: PendingSave) {
    let PendingSave {
        mut sink,
        on_complete,
    } = pending;
    thread::Builder::new()
        .name("state-saver".into())
        .spawn(move || {
            match io::copy(&mut source, &mut sink).and_then(|_| sink.flush()) {
                Ok(()) => {
                    if let Some(on_complete) = on_complete {
                        on_complete();
                    }
                }
                Err(err) => warn!(%err, "writing streamed save failed"),
            }
        })
        .expect("failed to spawn state-saver thread");
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use nck_types::{ReducedUnitState, UnitTypeId};

    use super::*;

    #[derive(Default)]
    struct RecordingChannel {
        frames: Mutex<Vec<Vec<u8>>>,
    }

    impl FrameChannel for RecordingChannel {
        fn send(&self, frame: &[u8]) {
            self.frames.lock().unwrap().push(frame.to_vec());
        }
    }

    struct NoStreams;

    impl ClientBulkStreams for NoStreams {
        fn create_out_stream(
            &self,
        ) -> Result<(nck_proto::StreamId, Box<dyn Write + Send>), BulkStreamError> {
            Ok((1, Box::new(Vec::new())))
        }

        fn accept_in_stream(
            &self,
            stream: nck_proto::StreamId,
        ) -> Result<Box<dyn Read + Send>, BulkStreamError> {
            Err(BulkStreamError::UnknownStream { stream })
        }
    }

    fn client() -> (Client, Arc<RecordingChannel>) {
        let channel = Arc::new(RecordingChannel::default());
        let client = Client::new(
            Arc::clone(&channel) as Arc<dyn FrameChannel>,
            Arc::new(NoStreams),
            10,
            20,
        );
        (client, channel)
    }

    #[test]
    fn pick_ids_skip_zero_across_wrap() {
        let (mut client, _) = client();
        client.last_pick_id = u16::MAX - 1;
        assert_eq!(client.next_pick_id(), PickId(u16::MAX));
        assert_eq!(client.next_pick_id(), PickId(1));
    }

    #[test]
    fn requests_are_encoded_with_the_client_base() {
        let (mut client, channel) = client();
        let pick = client.pick_point(Point::new(0.0, 1.0, 2.0), 0.5, Rotation::identity(), false);
        assert_eq!(pick, PickId(1));

        let frames = channel.frames.lock().unwrap();
        let decoded = ClientMessage::decode(10, &frames[0]).unwrap();
        assert!(matches!(
            decoded,
            ClientMessage::PointPick { pick_id: PickId(1), connected: false, .. }
        ));
    }

    #[test]
    fn simulation_updates_land_in_the_mirror_buffer() {
        let (mut client, _) = client();
        let mut reader = client.state_reader();

        let states = ReducedUnitStateArray {
            session_id: SessionId(3),
            time_stamp: 9,
            states: vec![ReducedUnitState {
                unit_type: UnitTypeId(0),
                position: Point::new(1.0, 1.0, 1.0),
                orientation: Rotation::identity(),
            }],
        };
        let frame = ServerMessage::SimulationUpdate(states.clone()).encode(20);
        client.handle_message(&frame).unwrap();

        assert!(reader.lock_newest());
        assert_eq!(**reader.locked().unwrap(), states);

        // Until a session update arrives, the mirrored snapshot is stale.
        assert_ne!(reader.locked().unwrap().session_id, client.session_id());
    }

    #[test]
    fn session_lifecycle_follows_notifications() {
        let (mut client, _) = client();
        let update = ServerMessage::SessionUpdate(nck_proto::SessionUpdate {
            session_id: SessionId(7),
            domain: Domain::default(),
            unit_types: Vec::new(),
        });
        client.handle_message(&update.encode(20)).unwrap();
        assert!(client.is_session_valid());
        assert_eq!(client.session_id(), SessionId(7));

        client
            .handle_message(&ServerMessage::SessionInvalid.encode(20))
            .unwrap();
        assert!(!client.is_session_valid());
    }
}
