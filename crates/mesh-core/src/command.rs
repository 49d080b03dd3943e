//! Room-server and repeater command packets
//!
//! Commands ride in the regular packet envelope: the type byte is the command
//! code and the payload is opaque except for status responses.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::codec::{Packet, PacketType};
use crate::error::{MeshError, MeshResult};
use crate::ids::{Destination, NodeId};

macro_rules! command_codes {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $code:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum $name {
            $($variant = $code),+
        }

        impl $name {
            pub fn code(self) -> u8 {
                self as u8
            }

            pub fn from_code(code: u8) -> Option<Self> {
                match code {
                    $($code => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

command_codes!(
    /// Commands understood by room servers
    RoomServerCommand {
        Login = 0x10,
        Logout = 0x11,
        PostMessage = 0x12,
        SyncMessages = 0x13,
        ListMembers = 0x14,
        SetPermissions = 0x15,
        Ping = 0x16,
        StatusRequest = 0x17,
        StatusResponse = 0x18,
    }
);

command_codes!(
    /// Commands understood by repeaters
    RepeaterCommand {
        Login = 0x20,
        Logout = 0x21,
        GetNeighbors = 0x22,
        SetTxPower = 0x23,
        SetRadioParams = 0x24,
        Reboot = 0x25,
        Ping = 0x26,
        StatusRequest = 0x27,
        StatusResponse = 0x28,
    }
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    RoomServer(RoomServerCommand),
    Repeater(RepeaterCommand),
}

impl Command {
    pub fn code(&self) -> u8 {
        match self {
            Command::RoomServer(c) => c.code(),
            Command::Repeater(c) => c.code(),
        }
    }

    pub fn packet_type(&self) -> PacketType {
        match self {
            Command::RoomServer(c) => PacketType::RoomServer(c.code()),
            Command::Repeater(c) => PacketType::Repeater(c.code()),
        }
    }

    pub fn is_status_response(&self) -> bool {
        matches!(
            self,
            Command::RoomServer(RoomServerCommand::StatusResponse)
                | Command::Repeater(RepeaterCommand::StatusResponse)
        )
    }
}

/// A command with its opaque argument bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPacket {
    pub command: Command,
    pub payload: Vec<u8>,
}

impl CommandPacket {
    pub fn new(command: Command, payload: Vec<u8>) -> Self {
        Self { command, payload }
    }

    pub fn from_packet(packet: &Packet) -> MeshResult<Self> {
        let command = match packet.packet_type {
            PacketType::RoomServer(code) => RoomServerCommand::from_code(code).map(Command::RoomServer),
            PacketType::Repeater(code) => RepeaterCommand::from_code(code).map(Command::Repeater),
            other => {
                return Err(MeshError::InvalidPayload(format!(
                    "{:?} is not a command packet",
                    other
                )))
            }
        }
        .ok_or_else(|| {
            MeshError::InvalidPayload(format!(
                "unassigned command code {:#04x}",
                packet.packet_type.code()
            ))
        })?;

        Ok(Self {
            command,
            payload: packet.payload.clone(),
        })
    }

    pub fn to_packet(&self, message_id: u32, from: NodeId, to: Destination, ttl: u8) -> Packet {
        Packet::new(
            self.command.packet_type(),
            message_id,
            from,
            to,
            ttl,
            self.payload.clone(),
        )
    }

    /// Interpret the payload of a status response
    pub fn status(&self) -> Option<StatusReport> {
        self.command
            .is_status_response()
            .then(|| StatusReport::parse(&self.payload))
    }
}

/// Device health counters reported by repeaters and room servers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusSnapshot {
    pub battery_mv: u16,
    pub uptime_secs: u32,
    pub packets_recv: u32,
    pub packets_sent: u32,
    pub last_rssi: i16,
    pub last_snr: i8,
    pub queue_len: u8,
}

impl StatusSnapshot {
    pub const BINARY_LEN: usize = 18;

    pub fn encode_binary(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::BINARY_LEN);
        out.extend_from_slice(&self.battery_mv.to_be_bytes());
        out.extend_from_slice(&self.uptime_secs.to_be_bytes());
        out.extend_from_slice(&self.packets_recv.to_be_bytes());
        out.extend_from_slice(&self.packets_sent.to_be_bytes());
        out.extend_from_slice(&self.last_rssi.to_be_bytes());
        out.extend_from_slice(&self.last_snr.to_be_bytes());
        out.push(self.queue_len);
        out
    }

    pub fn decode_binary(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::BINARY_LEN {
            return None;
        }
        let u32_at = |at: usize| u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);

        Some(Self {
            battery_mv: u16::from_be_bytes([bytes[0], bytes[1]]),
            uptime_secs: u32_at(2),
            packets_recv: u32_at(6),
            packets_sent: u32_at(10),
            last_rssi: i16::from_be_bytes([bytes[14], bytes[15]]),
            last_snr: i8::from_be_bytes([bytes[16]]),
            queue_len: bytes[17],
        })
    }
}

/// Which encoding a status payload used
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusReport {
    Structured(StatusSnapshot),
    Binary(StatusSnapshot),
    Unrecognized(Vec<u8>),
}

impl StatusReport {
    /// Try JSON first, then the fixed binary layout
    pub fn parse(payload: &[u8]) -> Self {
        let looks_like_json = payload
            .iter()
            .find(|b| !b.is_ascii_whitespace())
            .map(|b| *b == b'{')
            .unwrap_or(false);

        if looks_like_json {
            match serde_json::from_slice::<StatusSnapshot>(payload) {
                Ok(snapshot) => return StatusReport::Structured(snapshot),
                Err(e) => debug!(error = %e, "Status payload is not valid status JSON"),
            }
        }

        match StatusSnapshot::decode_binary(payload) {
            Some(snapshot) => StatusReport::Binary(snapshot),
            None => StatusReport::Unrecognized(payload.to_vec()),
        }
    }

    pub fn snapshot(&self) -> Option<&StatusSnapshot> {
        match self {
            StatusReport::Structured(s) | StatusReport::Binary(s) => Some(s),
            StatusReport::Unrecognized(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode, encode, Frame};

    fn snapshot() -> StatusSnapshot {
        StatusSnapshot {
            battery_mv: 3912,
            uptime_secs: 86_400,
            packets_recv: 1200,
            packets_sent: 800,
            last_rssi: -97,
            last_snr: -4,
            queue_len: 3,
        }
    }

    #[test]
    fn test_code_tables() {
        assert_eq!(RoomServerCommand::Login.code(), 0x10);
        assert_eq!(RoomServerCommand::from_code(0x18), Some(RoomServerCommand::StatusResponse));
        assert_eq!(RepeaterCommand::from_code(0x20), Some(RepeaterCommand::Login));
        assert_eq!(RepeaterCommand::StatusResponse.code(), 0x28);
        assert_eq!(RepeaterCommand::from_code(0x29), None);
    }

    #[test]
    fn test_command_survives_codec() {
        let command = CommandPacket::new(Command::Repeater(RepeaterCommand::SetTxPower), vec![20]);
        let packet = command.to_packet(11, NodeId(1), Destination::Node(NodeId(2)), 3);

        let bytes = encode(&packet).unwrap();
        let decoded = match decode(&bytes).unwrap() {
            Frame::Packet(packet) => packet,
            other => panic!("unexpected frame {:?}", other),
        };
        assert_eq!(CommandPacket::from_packet(&decoded).unwrap(), command);
    }

    #[test]
    fn test_non_command_packet_rejected() {
        let packet = Packet::new(PacketType::Text, 1, NodeId(1), Destination::Broadcast, 1, vec![]);
        assert!(CommandPacket::from_packet(&packet).is_err());
    }

    #[test]
    fn test_binary_status() {
        let bytes = snapshot().encode_binary();
        assert_eq!(bytes.len(), StatusSnapshot::BINARY_LEN);
        assert_eq!(StatusReport::parse(&bytes), StatusReport::Binary(snapshot()));
    }

    #[test]
    fn test_json_status() {
        let json = br#"{"battery_mv":3700,"uptime_secs":60,"queue_len":1}"#;
        match StatusReport::parse(json) {
            StatusReport::Structured(s) => {
                assert_eq!(s.battery_mv, 3700);
                assert_eq!(s.queue_len, 1);
                assert_eq!(s.packets_sent, 0);
            }
            other => panic!("expected structured status, got {:?}", other),
        }
    }

    #[test]
    fn test_unrecognized_status() {
        assert_eq!(
            StatusReport::parse(b"{broken"),
            StatusReport::Unrecognized(b"{broken".to_vec())
        );
        assert!(StatusReport::parse(&[1, 2, 3]).snapshot().is_none());
    }

    #[test]
    fn test_status_only_for_status_responses() {
        let ping = CommandPacket::new(Command::RoomServer(RoomServerCommand::Ping), vec![]);
        assert!(ping.status().is_none());

        let response = CommandPacket::new(
            Command::RoomServer(RoomServerCommand::StatusResponse),
            snapshot().encode_binary(),
        );
        assert_eq!(response.status(), Some(StatusReport::Binary(snapshot())));
    }
}
