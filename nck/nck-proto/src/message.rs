//! Protocol messages and their binary codec.

use std::io::{self, Read, Write};

use thiserror::Error;

use nck_types::wire::{read_state_array, write_state_array};
use nck_types::{
    Domain, Parameters, PickId, Point, ReducedUnitStateArray, Rotation, Scalar, SessionId,
    UnitType, UnitTypeId, Vector, Wire,
};

use crate::transport::StreamId;

/// Error decoding a protocol frame.
///
/// Any decode error terminates the offending peer's session; it never
/// affects the engine or other peers.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame's message id is outside the peer's registered range.
    #[error("unknown message id {id}")]
    UnknownMessage {
        /// The offending wire id.
        id: u16,
    },

    /// The frame body did not decode as the message its id declares.
    #[error("malformed message payload: {0}")]
    Malformed(#[from] io::Error),

    /// The frame body was longer than the message it decodes to.
    #[error("{remaining} trailing bytes after message payload")]
    TrailingBytes {
        /// Number of undecoded bytes.
        remaining: usize,
    },
}

/// Positional ids of client-to-server messages.
mod client_id {
    pub const SET_PARAMETERS: u16 = 0;
    pub const POINT_PICK: u16 = 1;
    pub const RAY_PICK: u16 = 2;
    pub const PASTE_UNIT: u16 = 3;
    pub const CREATE_UNIT: u16 = 4;
    pub const SET_UNIT_STATE: u16 = 5;
    pub const COPY_UNIT: u16 = 6;
    pub const DESTROY_UNIT: u16 = 7;
    pub const RELEASE: u16 = 8;
    pub const LOAD_STATE: u16 = 9;
    pub const SAVE_STATE: u16 = 10;
}

/// Positional ids of server-to-client messages.
mod server_id {
    pub const SESSION_INVALID: u16 = 0;
    pub const SESSION_UPDATE: u16 = 1;
    pub const SET_PARAMETERS: u16 = 2;
    pub const SIMULATION_UPDATE: u16 = 3;
    pub const SAVE_STATE_REPLY: u16 = 4;
}

/// Payload of a session update: everything a client needs to interpret
/// subsequent simulation updates.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionUpdate {
    /// The new session id.
    pub session_id: SessionId,
    /// The session's domain box.
    pub domain: Domain,
    /// The session's immutable unit-type registry.
    pub unit_types: Vec<UnitType>,
}

/// A message sent by a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Replace the simulation parameters.
    SetParameters(Parameters),
    /// Pick the nearest unit within a sphere.
    PointPick {
        /// Client-allocated pick id.
        pick_id: PickId,
        /// Centre of the query sphere.
        position: Point,
        /// Radius of the query sphere.
        radius: Scalar,
        /// Orientation of the pick frame.
        orientation: Rotation,
        /// Whether to pick the whole bonded complex.
        connected: bool,
    },
    /// Pick along a ray.
    RayPick {
        /// Client-allocated pick id.
        pick_id: PickId,
        /// Ray origin.
        position: Point,
        /// Ray direction.
        direction: Vector,
        /// Orientation of the pick frame.
        orientation: Rotation,
        /// Whether to pick the whole bonded complex.
        connected: bool,
    },
    /// Instantiate the copy buffer.
    PasteUnit {
        /// Client-allocated pick id for the pasted units.
        pick_id: PickId,
        /// Target position.
        position: Point,
        /// Target orientation.
        orientation: Rotation,
        /// Initial linear velocity.
        linear_velocity: Vector,
        /// Initial angular velocity.
        angular_velocity: Vector,
    },
    /// Create one unit if the pick is empty.
    CreateUnit {
        /// Pick id the new unit will belong to.
        pick_id: PickId,
        /// Type of the new unit.
        unit_type: UnitTypeId,
        /// Initial position.
        position: Point,
        /// Initial orientation.
        orientation: Rotation,
        /// Initial linear velocity.
        linear_velocity: Vector,
        /// Initial angular velocity.
        angular_velocity: Vector,
    },
    /// Kinematically drive a picked set.
    SetUnitState {
        /// The pick to drive.
        pick_id: PickId,
        /// New pick-frame position.
        position: Point,
        /// New pick-frame orientation.
        orientation: Rotation,
        /// Pick-frame linear velocity.
        linear_velocity: Vector,
        /// Pick-frame angular velocity.
        angular_velocity: Vector,
    },
    /// Snapshot a picked set into the copy buffer.
    CopyUnit {
        /// The pick to copy.
        pick_id: PickId,
    },
    /// Destroy a picked set.
    DestroyUnit {
        /// The pick to destroy.
        pick_id: PickId,
    },
    /// Release a pick.
    Release {
        /// The pick to release.
        pick_id: PickId,
    },
    /// Load state from an inbound bulk stream.
    LoadState {
        /// Stream carrying the state file.
        stream: StreamId,
    },
    /// Request a state save; the server replies with a stream id.
    SaveState,
}

/// A message sent by the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// The current session is no longer valid.
    SessionInvalid,
    /// A new session's id, domain, and unit types.
    SessionUpdate(SessionUpdate),
    /// Parameters changed (by another client or the host).
    SetParameters(Parameters),
    /// Periodic reduced-state broadcast.
    SimulationUpdate(ReducedUnitStateArray),
    /// A requested save is arriving on the given bulk stream.
    SaveStateReply {
        /// Stream carrying the state file.
        stream: StreamId,
    },
}

fn ensure_consumed(reader: &[u8]) -> Result<(), ProtocolError> {
    if reader.is_empty() {
        Ok(())
    } else {
        Err(ProtocolError::TrailingBytes {
            remaining: reader.len(),
        })
    }
}

fn write_pose_and_velocities<W: Write>(
    sink: &mut W,
    position: &Point,
    orientation: &Rotation,
    linear_velocity: &Vector,
    angular_velocity: &Vector,
) -> io::Result<()> {
    position.write_to(sink)?;
    orientation.write_to(sink)?;
    linear_velocity.write_to(sink)?;
    angular_velocity.write_to(sink)
}

fn read_pose_and_velocities<R: Read>(
    source: &mut R,
) -> io::Result<(Point, Rotation, Vector, Vector)> {
    Ok((
        Point::read_from(source)?,
        Rotation::read_from(source)?,
        Vector::read_from(source)?,
        Vector::read_from(source)?,
    ))
}

impl ClientMessage {
    /// Positional id of this message within the plugin.
    #[must_use]
    pub fn id(&self) -> u16 {
        match self {
            Self::SetParameters(_) => client_id::SET_PARAMETERS,
            Self::PointPick { .. } => client_id::POINT_PICK,
            Self::RayPick { .. } => client_id::RAY_PICK,
            Self::PasteUnit { .. } => client_id::PASTE_UNIT,
            Self::CreateUnit { .. } => client_id::CREATE_UNIT,
            Self::SetUnitState { .. } => client_id::SET_UNIT_STATE,
            Self::CopyUnit { .. } => client_id::COPY_UNIT,
            Self::DestroyUnit { .. } => client_id::DESTROY_UNIT,
            Self::Release { .. } => client_id::RELEASE,
            Self::LoadState { .. } => client_id::LOAD_STATE,
            Self::SaveState => client_id::SAVE_STATE,
        }
    }

    /// Encode into a frame, offsetting the id by the handshake-assigned
    /// message base.
    #[must_use]
    pub fn encode(&self, message_base: u16) -> Vec<u8> {
        let mut frame = Vec::new();
        (message_base + self.id())
            .write_to(&mut frame)
            .expect("writing to a Vec cannot fail");
        self.write_payload(&mut frame)
            .expect("writing to a Vec cannot fail");
        frame
    }

    fn write_payload<W: Write>(&self, sink: &mut W) -> io::Result<()> {
        match self {
            Self::SetParameters(parameters) => parameters.write_to(sink),
            Self::PointPick {
                pick_id,
                position,
                radius,
                orientation,
                connected,
            } => {
                pick_id.write_to(sink)?;
                position.write_to(sink)?;
                radius.write_to(sink)?;
                orientation.write_to(sink)?;
                connected.write_to(sink)
            }
            Self::RayPick {
                pick_id,
                position,
                direction,
                orientation,
                connected,
            } => {
                pick_id.write_to(sink)?;
                position.write_to(sink)?;
                direction.write_to(sink)?;
                orientation.write_to(sink)?;
                connected.write_to(sink)
            }
            Self::PasteUnit {
                pick_id,
                position,
                orientation,
                linear_velocity,
                angular_velocity,
            } => {
                pick_id.write_to(sink)?;
                write_pose_and_velocities(sink, position, orientation, linear_velocity, angular_velocity)
            }
            Self::CreateUnit {
                pick_id,
                unit_type,
                position,
                orientation,
                linear_velocity,
                angular_velocity,
            } => {
                pick_id.write_to(sink)?;
                unit_type.write_to(sink)?;
                write_pose_and_velocities(sink, position, orientation, linear_velocity, angular_velocity)
            }
            Self::SetUnitState {
                pick_id,
                position,
                orientation,
                linear_velocity,
                angular_velocity,
            } => {
                pick_id.write_to(sink)?;
                write_pose_and_velocities(sink, position, orientation, linear_velocity, angular_velocity)
            }
            Self::CopyUnit { pick_id }
            | Self::DestroyUnit { pick_id }
            | Self::Release { pick_id } => pick_id.write_to(sink),
            Self::LoadState { stream } => stream.write_to(sink),
            Self::SaveState => Ok(()),
        }
    }

    /// Decode a frame previously produced by [`encode`](Self::encode) with
    /// the same message base.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] for unknown ids, malformed payloads, and
    /// trailing bytes.
    pub fn decode(message_base: u16, frame: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = frame;
        let wire_id = u16::read_from(&mut reader)?;
        let id = wire_id.wrapping_sub(message_base);
        let message = match id {
            client_id::SET_PARAMETERS => Self::SetParameters(Parameters::read_from(&mut reader)?),
            client_id::POINT_PICK => {
                let pick_id = PickId::read_from(&mut reader)?;
                let position = Point::read_from(&mut reader)?;
                let radius = Scalar::read_from(&mut reader)?;
                let orientation = Rotation::read_from(&mut reader)?;
                let connected = bool::read_from(&mut reader)?;
                Self::PointPick {
                    pick_id,
                    position,
                    radius,
                    orientation,
                    connected,
                }
            }
            client_id::RAY_PICK => {
                let pick_id = PickId::read_from(&mut reader)?;
                let position = Point::read_from(&mut reader)?;
                let direction = Vector::read_from(&mut reader)?;
                let orientation = Rotation::read_from(&mut reader)?;
                let connected = bool::read_from(&mut reader)?;
                Self::RayPick {
                    pick_id,
                    position,
                    direction,
                    orientation,
                    connected,
                }
            }
            client_id::PASTE_UNIT => {
                let pick_id = PickId::read_from(&mut reader)?;
                let (position, orientation, linear_velocity, angular_velocity) =
                    read_pose_and_velocities(&mut reader)?;
                Self::PasteUnit {
                    pick_id,
                    position,
                    orientation,
                    linear_velocity,
                    angular_velocity,
                }
            }
            client_id::CREATE_UNIT => {
                let pick_id = PickId::read_from(&mut reader)?;
                let unit_type = UnitTypeId::read_from(&mut reader)?;
                let (position, orientation, linear_velocity, angular_velocity) =
                    read_pose_and_velocities(&mut reader)?;
                Self::CreateUnit {
                    pick_id,
                    unit_type,
                    position,
                    orientation,
                    linear_velocity,
                    angular_velocity,
                }
            }
            client_id::SET_UNIT_STATE => {
                let pick_id = PickId::read_from(&mut reader)?;
                let (position, orientation, linear_velocity, angular_velocity) =
                    read_pose_and_velocities(&mut reader)?;
                Self::SetUnitState {
                    pick_id,
                    position,
                    orientation,
                    linear_velocity,
                    angular_velocity,
                }
            }
            client_id::COPY_UNIT => Self::CopyUnit {
                pick_id: PickId::read_from(&mut reader)?,
            },
            client_id::DESTROY_UNIT => Self::DestroyUnit {
                pick_id: PickId::read_from(&mut reader)?,
            },
            client_id::RELEASE => Self::Release {
                pick_id: PickId::read_from(&mut reader)?,
            },
            client_id::LOAD_STATE => Self::LoadState {
                stream: StreamId::read_from(&mut reader)?,
            },
            client_id::SAVE_STATE => Self::SaveState,
            _ => return Err(ProtocolError::UnknownMessage { id: wire_id }),
        };
        ensure_consumed(reader)?;
        Ok(message)
    }
}

impl ServerMessage {
    /// Positional id of this message within the plugin.
    #[must_use]
    pub fn id(&self) -> u16 {
        match self {
            Self::SessionInvalid => server_id::SESSION_INVALID,
            Self::SessionUpdate(_) => server_id::SESSION_UPDATE,
            Self::SetParameters(_) => server_id::SET_PARAMETERS,
            Self::SimulationUpdate(_) => server_id::SIMULATION_UPDATE,
            Self::SaveStateReply { .. } => server_id::SAVE_STATE_REPLY,
        }
    }

    /// Encode into a frame, offsetting the id by the handshake-assigned
    /// message base.
    #[must_use]
    pub fn encode(&self, message_base: u16) -> Vec<u8> {
        let mut frame = Vec::new();
        (message_base + self.id())
            .write_to(&mut frame)
            .expect("writing to a Vec cannot fail");
        self.write_payload(&mut frame)
            .expect("writing to a Vec cannot fail");
        frame
    }

    fn write_payload<W: Write>(&self, sink: &mut W) -> io::Result<()> {
        match self {
            Self::SessionInvalid => Ok(()),
            Self::SessionUpdate(update) => {
                update.session_id.write_to(sink)?;
                update.domain.write_to(sink)?;
                update.unit_types.write_to(sink)
            }
            Self::SetParameters(parameters) => parameters.write_to(sink),
            Self::SimulationUpdate(states) => write_state_array(states, sink, true),
            Self::SaveStateReply { stream } => stream.write_to(sink),
        }
    }

    /// Encode a simulation update directly from a borrowed array.
    ///
    /// The broadcast tick runs at 60 Hz over potentially large state
    /// arrays; this avoids copying the array into an owned message first.
    #[must_use]
    pub fn encode_simulation_update(
        message_base: u16,
        states: &ReducedUnitStateArray,
    ) -> Vec<u8> {
        let mut frame = Vec::new();
        (message_base + server_id::SIMULATION_UPDATE)
            .write_to(&mut frame)
            .expect("writing to a Vec cannot fail");
        write_state_array(states, &mut frame, true).expect("writing to a Vec cannot fail");
        frame
    }

    /// Decode a frame previously produced by [`encode`](Self::encode) with
    /// the same message base.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] for unknown ids, malformed payloads, and
    /// trailing bytes.
    pub fn decode(message_base: u16, frame: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = frame;
        let wire_id = u16::read_from(&mut reader)?;
        let id = wire_id.wrapping_sub(message_base);
        let message = match id {
            server_id::SESSION_INVALID => Self::SessionInvalid,
            server_id::SESSION_UPDATE => {
                let session_id = SessionId::read_from(&mut reader)?;
                let domain = Domain::read_from(&mut reader)?;
                let unit_types: Vec<UnitType> = Vec::read_from(&mut reader)?;
                Self::SessionUpdate(SessionUpdate {
                    session_id,
                    domain,
                    unit_types,
                })
            }
            server_id::SET_PARAMETERS => Self::SetParameters(Parameters::read_from(&mut reader)?),
            server_id::SIMULATION_UPDATE => {
                let mut states = ReducedUnitStateArray::empty();
                read_state_array(&mut reader, &mut states, true)?;
                Self::SimulationUpdate(states)
            }
            server_id::SAVE_STATE_REPLY => Self::SaveStateReply {
                stream: StreamId::read_from(&mut reader)?,
            },
            _ => return Err(ProtocolError::UnknownMessage { id: wire_id }),
        };
        ensure_consumed(reader)?;
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use nck_types::ReducedUnitState;

    use super::*;

    #[test]
    fn client_frames_round_trip_through_a_message_base() {
        let base = 37;
        let messages = [
            ClientMessage::SetParameters(Parameters {
                linear_damp: 0.5,
                angular_damp: 0.25,
                attenuation: 0.9,
                time_factor: 8.0,
            }),
            ClientMessage::PointPick {
                pick_id: PickId(3),
                position: Point::new(1.0, 2.0, 3.0),
                radius: 0.5,
                orientation: Rotation::from_scaled_axis(Vector::new(0.1, 0.2, 0.3)),
                connected: true,
            },
            ClientMessage::Release { pick_id: PickId(9) },
            ClientMessage::LoadState { stream: 77 },
            ClientMessage::SaveState,
        ];
        for message in messages {
            let frame = message.encode(base);
            let decoded = ClientMessage::decode(base, &frame).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn server_simulation_update_round_trips() {
        let base = 200;
        let states = ReducedUnitStateArray {
            session_id: SessionId(5),
            time_stamp: 42,
            states: vec![ReducedUnitState {
                unit_type: UnitTypeId(1),
                position: Point::new(-1.0, 0.0, 2.5),
                orientation: Rotation::identity(),
            }],
        };
        let message = ServerMessage::SimulationUpdate(states);
        let decoded = ServerMessage::decode(base, &message.encode(base)).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn wrong_base_is_an_unknown_message() {
        let frame = ClientMessage::SaveState.encode(0);
        assert!(matches!(
            ClientMessage::decode(100, &frame),
            Err(ProtocolError::UnknownMessage { .. })
        ));
    }

    #[test]
    fn truncated_and_oversized_frames_are_rejected() {
        let frame = ClientMessage::Release { pick_id: PickId(1) }.encode(0);
        assert!(matches!(
            ClientMessage::decode(0, &frame[..frame.len() - 1]),
            Err(ProtocolError::Malformed(_))
        ));

        let mut padded = frame;
        padded.push(0);
        assert!(matches!(
            ClientMessage::decode(0, &padded),
            Err(ProtocolError::TrailingBytes { remaining: 1 })
        ));
    }
}
