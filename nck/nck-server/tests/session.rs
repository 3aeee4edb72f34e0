//! Server session tests over in-memory transport and bulk streams: connect
//! flows, pick-id translation, parameter forwarding, streamed save/load,
//! and pick release on disconnect.

use std::io::{Cursor, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use nck_client::Client;
use nck_engine::{EngineConfig, SavedState, UnitTypeSection};
use nck_proto::{
    BulkStreamError, ClientBulkStreams, ClientId, ClientMessage, FrameChannel, ServerBulkStreams,
    ServerMessage, ServerTransport, StreamId,
};
use nck_server::{Server, ServerConfig};
use nck_types::{Domain, Parameters, PickId, Point, Rotation, SessionId, UnitTypeId, Vector};

const CLIENT_BASE: u16 = 64;
const SERVER_BASE: u16 = 128;

// ── In-memory transport ─────────────────────────────────────────────

#[derive(Default)]
struct MockTransport {
    clients: Mutex<Vec<ClientId>>,
    frames: Mutex<Vec<(ClientId, Vec<u8>)>>,
}

impl MockTransport {
    fn register(&self, client: ClientId) {
        self.clients.lock().unwrap().push(client);
    }

    fn unregister(&self, client: ClientId) {
        self.clients.lock().unwrap().retain(|&c| c != client);
    }

    /// Frames queued to the given client, decoded, in send order.
    fn take_messages(&self, client: ClientId) -> Vec<ServerMessage> {
        let mut frames = self.frames.lock().unwrap();
        let mut taken = Vec::new();
        frames.retain(|(to, frame)| {
            if *to == client {
                taken.push(ServerMessage::decode(SERVER_BASE, frame).expect("bad server frame"));
                false
            } else {
                true
            }
        });
        taken
    }
}

impl ServerTransport for MockTransport {
    fn send(&self, client: ClientId, frame: &[u8]) {
        self.frames.lock().unwrap().push((client, frame.to_vec()));
    }

    fn broadcast(&self, except: Option<ClientId>, frame: &[u8]) {
        let clients = self.clients.lock().unwrap();
        let mut frames = self.frames.lock().unwrap();
        for &client in clients.iter() {
            if Some(client) != except {
                frames.push((client, frame.to_vec()));
            }
        }
    }
}

// ── In-memory bulk streams ──────────────────────────────────────────

#[derive(Clone, Default)]
struct StreamBuf {
    data: Arc<Mutex<Vec<u8>>>,
    done: Arc<AtomicBool>,
}

impl Write for StreamBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.data.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.done.store(true, Ordering::Release);
        Ok(())
    }
}

#[derive(Default)]
struct MockStreams {
    next: AtomicU32,
    bufs: Mutex<Vec<(StreamId, StreamBuf)>>,
}

impl MockStreams {
    fn open(&self) -> (StreamId, StreamBuf) {
        let id = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        let buf = StreamBuf::default();
        self.bufs.lock().unwrap().push((id, buf.clone()));
        (id, buf)
    }

    fn get(&self, stream: StreamId) -> Option<StreamBuf> {
        self.bufs
            .lock()
            .unwrap()
            .iter()
            .find(|(id, _)| *id == stream)
            .map(|(_, buf)| buf.clone())
    }

    /// Seed a stream with already-complete contents.
    fn preload(&self, bytes: Vec<u8>) -> StreamId {
        let (id, mut buf) = self.open();
        buf.write_all(&bytes).unwrap();
        buf.flush().unwrap();
        id
    }

    fn reader_for(&self, stream: StreamId) -> Result<Box<dyn Read + Send>, BulkStreamError> {
        let buf = self
            .get(stream)
            .ok_or(BulkStreamError::UnknownStream { stream })?;
        let data = buf.data.lock().unwrap().clone();
        Ok(Box::new(Cursor::new(data)))
    }
}

impl ServerBulkStreams for MockStreams {
    fn forward_out_stream(
        &self,
        _client: ClientId,
    ) -> Result<(StreamId, Box<dyn Write + Send>), BulkStreamError> {
        let (id, buf) = self.open();
        Ok((id, Box::new(buf)))
    }

    fn accept_in_stream(
        &self,
        _client: ClientId,
        stream: StreamId,
    ) -> Result<Box<dyn Read + Send>, BulkStreamError> {
        self.reader_for(stream)
    }
}

impl ClientBulkStreams for MockStreams {
    fn create_out_stream(&self) -> Result<(StreamId, Box<dyn Write + Send>), BulkStreamError> {
        let (id, buf) = self.open();
        Ok((id, Box::new(buf)))
    }

    fn accept_in_stream(&self, stream: StreamId) -> Result<Box<dyn Read + Send>, BulkStreamError> {
        self.reader_for(stream)
    }
}

#[derive(Default)]
struct RecordingChannel {
    frames: Mutex<Vec<Vec<u8>>>,
}

impl FrameChannel for RecordingChannel {
    fn send(&self, frame: &[u8]) {
        self.frames.lock().unwrap().push(frame.to_vec());
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    false
}

fn engine_config() -> EngineConfig {
    EngineConfig {
        domain: Domain::new(Point::new(-8.0, -8.0, -8.0), Point::new(8.0, 8.0, 8.0)),
        vertex_force_strength: 1.0,
        central_force_strength: 1.0,
        parameters: Parameters {
            linear_damp: 0.0,
            angular_damp: 0.0,
            attenuation: 0.1,
            time_factor: 1.0,
        },
        unit_types: vec![UnitTypeSection {
            name: "monomer".into(),
            radius: 1.0,
            mass: 1.0,
            moment_of_inertia: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            bond_sites: vec![[1.0, 0.0, 0.0]],
            mesh_vertices: Vec::new(),
            mesh_triangles: Vec::new(),
        }],
        ..EngineConfig::default()
    }
}

struct Harness {
    server: Server,
    transport: Arc<MockTransport>,
    streams: Arc<MockStreams>,
}

impl Harness {
    fn new() -> Self {
        let transport = Arc::new(MockTransport::default());
        let streams = Arc::new(MockStreams::default());
        let server = Server::from_config(
            &engine_config(),
            Arc::clone(&transport) as Arc<dyn ServerTransport>,
            Arc::clone(&streams) as Arc<dyn ServerBulkStreams>,
            ServerConfig {
                update_rate: 60.0,
                client_message_base: CLIENT_BASE,
                server_message_base: SERVER_BASE,
            },
        );
        Self {
            server,
            transport,
            streams,
        }
    }

    fn connect(&mut self, client: ClientId) {
        self.transport.register(client);
        self.server.client_connected(client);
    }

    fn disconnect(&mut self, client: ClientId) {
        self.server.client_disconnected(client);
        self.transport.unregister(client);
    }

    fn send(&mut self, client: ClientId, message: &ClientMessage) {
        self.server
            .handle_message(client, &message.encode(CLIENT_BASE))
            .expect("server rejected message");
    }

    /// Spawn two units whose facing bond sites will bond on the next step.
    fn seed_bonded_pair(&mut self, client: ClientId) {
        let half_turn = Rotation::from_scaled_axis(Vector::new(0.0, 0.0, std::f32::consts::PI));
        for (pick, position, orientation) in [
            (PickId(101), Point::new(-1.05, 0.0, 0.0), Rotation::identity()),
            (PickId(102), Point::new(1.05, 0.0, 0.0), half_turn),
        ] {
            self.send(
                client,
                &ClientMessage::PointPick {
                    pick_id: pick,
                    position,
                    radius: 0.1,
                    orientation: Rotation::identity(),
                    connected: false,
                },
            );
            self.send(
                client,
                &ClientMessage::CreateUnit {
                    pick_id: pick,
                    unit_type: UnitTypeId(0),
                    position,
                    orientation,
                    linear_velocity: Vector::zeros(),
                    angular_velocity: Vector::zeros(),
                },
            );
            self.send(client, &ClientMessage::Release { pick_id: pick });
        }
        let handle = self.server.simulation().clone();
        assert!(
            wait_until(|| {
                let mut reader = handle.state_reader();
                reader.lock_newest();
                reader.locked().map_or(0, |s| s.states.len()) == 2
            }),
            "seeded units never appeared"
        );
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[test]
fn first_connect_delivers_parameters_and_session_and_starts_stepping() {
    let mut harness = Harness::new();
    harness.connect(1);
    assert!(harness.server.has_clients());

    let messages = harness.transport.take_messages(1);
    assert!(matches!(&messages[0], ServerMessage::SetParameters(p)
        if p.time_factor == 1.0));
    match &messages[1] {
        ServerMessage::SessionUpdate(update) => {
            assert_eq!(update.session_id, SessionId(1));
            assert_eq!(update.unit_types.len(), 1);
            assert_eq!(update.unit_types[0].name, "monomer");
        }
        other => panic!("expected a session update, got {other:?}"),
    }

    // The simulation thread is now stepping.
    let handle = harness.server.simulation().clone();
    let mut reader = handle.state_reader();
    reader.lock_newest();
    let first = reader.locked().unwrap().time_stamp;
    assert!(wait_until(|| {
        reader.lock_newest();
        reader.locked().unwrap().time_stamp > first
    }));
}

#[test]
fn client_pick_ids_are_translated_per_client() {
    let mut harness = Harness::new();
    harness.connect(1);
    harness.seed_bonded_pair(1);
    harness.connect(2);

    // Both clients use pick id 1 from their own space, on different units.
    for (client, x) in [(1, -1.05f32), (2, 1.05f32)] {
        harness.send(
            client,
            &ClientMessage::PointPick {
                pick_id: PickId(1),
                position: Point::new(x, 0.0, 0.0),
                radius: 0.3,
                orientation: Rotation::identity(),
                connected: false,
            },
        );
    }

    let handle = harness.server.simulation().clone();
    assert!(wait_until(|| {
        let mut reader = handle.state_reader();
        reader.lock_newest();
        reader.locked().map_or(false, |snap| {
            let picks: Vec<_> = snap.states.iter().map(|s| s.pick_id).collect();
            picks.iter().all(|p| p.is_some()) && picks[0] != picks[1]
        })
    }));
}

#[test]
fn disconnect_releases_the_departing_clients_picks() {
    let mut harness = Harness::new();
    harness.connect(1);
    harness.seed_bonded_pair(1);
    let handle = harness.server.simulation().clone();

    // Wait for the pair to bond, then grab the whole complex.
    assert!(wait_until(|| {
        harness.server.broadcast_tick();
        let mut reader = handle.state_reader();
        reader.lock_newest();
        reader.locked().map_or(false, |s| !s.states.is_empty())
    }));
    harness.send(
        1,
        &ClientMessage::PointPick {
            pick_id: PickId(7),
            position: Point::new(-1.05, 0.0, 0.0),
            radius: 0.3,
            orientation: Rotation::identity(),
            connected: true,
        },
    );
    assert!(wait_until(|| {
        let mut reader = handle.state_reader();
        reader.lock_newest();
        reader
            .locked()
            .map_or(false, |s| s.states.iter().all(|u| u.pick_id.is_some()))
    }));

    // The connection goes away while the pick is held.
    harness.disconnect(1);
    assert!(!harness.server.has_clients());
    assert!(
        wait_until(|| {
            let mut reader = handle.state_reader();
            reader.lock_newest();
            reader
                .locked()
                .map_or(false, |s| s.states.iter().all(|u| u.pick_id == PickId::NONE))
        }),
        "units kept their pick after the owner disconnected"
    );
}

#[test]
fn parameter_changes_are_forwarded_to_other_clients_only() {
    let mut harness = Harness::new();
    harness.connect(1);
    harness.connect(2);
    harness.transport.take_messages(1);
    harness.transport.take_messages(2);

    let parameters = Parameters {
        linear_damp: 0.5,
        angular_damp: 0.25,
        attenuation: 0.8,
        time_factor: 4.0,
    };
    harness.send(2, &ClientMessage::SetParameters(parameters));

    assert_eq!(harness.server.simulation().parameters(), parameters);
    let to_other = harness.transport.take_messages(1);
    assert!(matches!(to_other.as_slice(), [ServerMessage::SetParameters(p)] if *p == parameters));
    assert!(harness.transport.take_messages(2).is_empty());
}

#[test]
fn save_and_load_stream_through_the_bulk_facility() {
    let mut harness = Harness::new();
    harness.connect(1);
    harness.seed_bonded_pair(1);

    // Save: the reply names the stream; the engine fills it.
    harness.transport.take_messages(1);
    harness.send(1, &ClientMessage::SaveState);
    let messages = harness.transport.take_messages(1);
    let stream = match messages.as_slice() {
        [ServerMessage::SaveStateReply { stream }] => *stream,
        other => panic!("expected a save reply, got {other:?}"),
    };
    let buf = harness.streams.get(stream).expect("stream not created");
    assert!(wait_until(|| buf.done.load(Ordering::Acquire)));

    let bytes = buf.data.lock().unwrap().clone();
    let saved = SavedState::read(&mut bytes.as_slice()).unwrap();
    assert_eq!(saved.states.len(), 2);
    assert_eq!(saved.unit_types.len(), 1);

    // Load it back: a new session is established and broadcast.
    let handle = harness.server.simulation().clone();
    let stream = harness.streams.preload(bytes);
    harness.send(1, &ClientMessage::LoadState { stream });
    assert!(wait_until(|| handle.session_id() == SessionId(2)));
    assert!(wait_until(|| {
        harness.server.broadcast_tick();
        harness
            .transport
            .take_messages(1)
            .iter()
            .any(|m| matches!(m, ServerMessage::SessionUpdate(u) if u.session_id == SessionId(2)))
    }));
}

#[test]
fn broadcast_ticks_feed_a_client_mirror() {
    let mut harness = Harness::new();
    harness.connect(1);
    harness.seed_bonded_pair(1);

    // Stand up a client plugin and replay every server frame into it.
    let channel = Arc::new(RecordingChannel::default());
    let mut client = Client::new(
        Arc::clone(&channel) as Arc<dyn FrameChannel>,
        Arc::clone(&harness.streams) as Arc<dyn ClientBulkStreams>,
        CLIENT_BASE,
        SERVER_BASE,
    );
    let mut reader = client.state_reader();

    assert!(wait_until(|| {
        harness.server.broadcast_tick();
        let mut delivered_update = false;
        for (to, frame) in harness.transport.frames.lock().unwrap().drain(..) {
            if to == 1 {
                client.handle_message(&frame).unwrap();
                delivered_update = true;
            }
        }
        delivered_update && {
            reader.lock_newest();
            reader.locked().map_or(false, |mirror| {
                mirror.session_id == client.session_id() && mirror.states.len() == 2
            })
        }
    }));

    let mirror = reader.locked().unwrap();
    assert!(client.is_session_valid());
    assert_eq!(mirror.states[0].unit_type, UnitTypeId(0));
}
