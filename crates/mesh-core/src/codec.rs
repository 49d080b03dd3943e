//! Binary packet codec shared by every transport
//!
//! Wire layout (all integers big-endian):
//!
//! ```text
//! version u8 | type u8 | flags u8 | ttl u8 | messageId u32 | fromNodeId u64 |
//! toNodeId u64 | timestamp u32 | subMeshId u16 | payloadLen u16 | payload
//! ```
//!
//! The first four bytes are present in every frame. Frames whose type byte is
//! not understood are returned as [`Frame::Unknown`] with their raw bytes so
//! newer peers can extend the protocol without older nodes rejecting traffic.

use chrono::Utc;
use tracing::{debug, warn};

use crate::error::{InvalidFrame, MeshError, MeshResult};
use crate::ids::{Destination, NodeId};

/// Only protocol version understood by this codec
pub const PROTOCOL_VERSION: u8 = 1;

/// Bytes every frame must carry (version, type, flags, ttl)
pub const MIN_FRAME_LEN: usize = 4;

/// Full header length for known packet types
pub const HEADER_LEN: usize = 32;

/// Largest payload the 16-bit length field can describe
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Payload substituted when a compressed payload cannot be inflated
pub const DECOMPRESSION_PLACEHOLDER: &str = "[undecodable compressed payload]";

/// Upper bound for inflated payloads, guards against hostile size prefixes
const MAX_DECOMPRESSED_LEN: usize = 64 * 1024;

/// Packet type carried in the second header byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Text,
    Position,
    KeyAnnounce,
    Ack,
    Chunk,
    /// Room-server command, codes 0x10..=0x18
    RoomServer(u8),
    /// Repeater command, codes 0x20..=0x28
    Repeater(u8),
}

impl PacketType {
    pub const TEXT: u8 = 0x01;
    pub const POSITION: u8 = 0x02;
    pub const KEY_ANNOUNCE: u8 = 0x03;
    pub const ACK: u8 = 0x04;
    pub const CHUNK: u8 = 0x05;

    pub fn code(&self) -> u8 {
        match self {
            PacketType::Text => Self::TEXT,
            PacketType::Position => Self::POSITION,
            PacketType::KeyAnnounce => Self::KEY_ANNOUNCE,
            PacketType::Ack => Self::ACK,
            PacketType::Chunk => Self::CHUNK,
            PacketType::RoomServer(code) | PacketType::Repeater(code) => *code,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            Self::TEXT => Some(PacketType::Text),
            Self::POSITION => Some(PacketType::Position),
            Self::KEY_ANNOUNCE => Some(PacketType::KeyAnnounce),
            Self::ACK => Some(PacketType::Ack),
            Self::CHUNK => Some(PacketType::Chunk),
            0x10..=0x18 => Some(PacketType::RoomServer(code)),
            0x20..=0x28 => Some(PacketType::Repeater(code)),
            _ => None,
        }
    }
}

/// Header flag bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketFlags(u8);

impl PacketFlags {
    pub const ENCRYPTED: u8 = 0x01;
    pub const COMPRESSED: u8 = 0x02;
    /// Sender is an active Internet gateway (KEY_ANNOUNCE)
    pub const GATEWAY: u8 = 0x04;

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn is_encrypted(&self) -> bool {
        self.0 & Self::ENCRYPTED != 0
    }

    pub fn is_compressed(&self) -> bool {
        self.0 & Self::COMPRESSED != 0
    }

    pub fn is_gateway(&self) -> bool {
        self.0 & Self::GATEWAY != 0
    }

    pub fn with_gateway(self, on: bool) -> Self {
        self.with_bit(Self::GATEWAY, on)
    }

    pub fn with_encrypted(self, on: bool) -> Self {
        self.with_bit(Self::ENCRYPTED, on)
    }

    pub fn with_compressed(self, on: bool) -> Self {
        self.with_bit(Self::COMPRESSED, on)
    }

    fn with_bit(self, bit: u8, on: bool) -> Self {
        if on {
            Self(self.0 | bit)
        } else {
            Self(self.0 & !bit)
        }
    }
}

/// A decoded wire packet
///
/// `payload` always holds the uncompressed bytes; compression is applied by
/// [`encode`] and removed by [`decode`] according to the flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub version: u8,
    pub packet_type: PacketType,
    pub flags: PacketFlags,
    pub ttl: u8,
    pub message_id: u32,
    pub from: NodeId,
    pub to: Destination,
    /// Unix seconds
    pub timestamp: u32,
    pub sub_mesh_id: u16,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(
        packet_type: PacketType,
        message_id: u32,
        from: NodeId,
        to: Destination,
        ttl: u8,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            packet_type,
            flags: PacketFlags::empty(),
            ttl,
            message_id,
            from,
            to,
            timestamp: Utc::now().timestamp().clamp(0, u32::MAX as i64) as u32,
            sub_mesh_id: 0,
            payload,
        }
    }

    pub fn with_flags(mut self, flags: PacketFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_sub_mesh(mut self, sub_mesh_id: u16) -> Self {
        self.sub_mesh_id = sub_mesh_id;
        self
    }
}

/// Frame with a type byte this codec does not understand
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownFrame {
    pub type_code: u8,
    pub raw: Vec<u8>,
}

/// Result of a successful decode
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Packet(Packet),
    Unknown(UnknownFrame),
}

/// Serialize a packet into wire bytes
pub fn encode(packet: &Packet) -> MeshResult<Vec<u8>> {
    let payload = if packet.flags.is_compressed() {
        compress(&packet.payload)?
    } else {
        packet.payload.clone()
    };

    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(MeshError::InvalidPayload(format!(
            "payload of {} bytes exceeds the {} byte frame limit",
            payload.len(),
            MAX_PAYLOAD_LEN
        )));
    }

    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(packet.version);
    out.push(packet.packet_type.code());
    out.push(packet.flags.bits());
    out.push(packet.ttl);
    out.extend_from_slice(&packet.message_id.to_be_bytes());
    out.extend_from_slice(&packet.from.as_u64().to_be_bytes());
    out.extend_from_slice(&packet.to.to_wire().to_be_bytes());
    out.extend_from_slice(&packet.timestamp.to_be_bytes());
    out.extend_from_slice(&packet.sub_mesh_id.to_be_bytes());
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(&payload);

    debug!(
        packet_type = ?packet.packet_type,
        message_id = packet.message_id,
        size = out.len(),
        "Encoded packet"
    );
    Ok(out)
}

/// Parse wire bytes into a packet
///
/// Never panics on malformed input; every rejection is an [`InvalidFrame`].
pub fn decode(bytes: &[u8]) -> Result<Frame, InvalidFrame> {
    if bytes.len() < MIN_FRAME_LEN {
        return Err(InvalidFrame::TooShort {
            required: MIN_FRAME_LEN,
            actual: bytes.len(),
        });
    }

    let version = bytes[0];
    if version != PROTOCOL_VERSION {
        return Err(InvalidFrame::UnsupportedVersion(version));
    }

    let packet_type = match PacketType::from_code(bytes[1]) {
        Some(packet_type) => packet_type,
        None => {
            debug!(type_code = bytes[1], "Decoded frame with unknown type");
            return Ok(Frame::Unknown(UnknownFrame {
                type_code: bytes[1],
                raw: bytes.to_vec(),
            }));
        }
    };

    if bytes.len() < HEADER_LEN {
        return Err(InvalidFrame::TooShort {
            required: HEADER_LEN,
            actual: bytes.len(),
        });
    }

    let flags = PacketFlags::from_bits(bytes[2]);
    let ttl = bytes[3];
    let message_id = read_u32(&bytes[4..8]);
    let from = NodeId(read_u64(&bytes[8..16]));
    let to = Destination::from_wire(read_u64(&bytes[16..24]));
    let timestamp = read_u32(&bytes[24..28]);
    let sub_mesh_id = u16::from_be_bytes([bytes[28], bytes[29]]);
    let payload_len = u16::from_be_bytes([bytes[30], bytes[31]]) as usize;

    let available = bytes.len() - HEADER_LEN;
    if payload_len > available {
        return Err(InvalidFrame::PayloadOverrun {
            declared: payload_len,
            available,
        });
    }

    let raw_payload = &bytes[HEADER_LEN..HEADER_LEN + payload_len];
    let payload = if flags.is_compressed() {
        decompress(raw_payload).unwrap_or_else(|| {
            warn!(message_id, "Failed to decompress payload, substituting placeholder");
            DECOMPRESSION_PLACEHOLDER.as_bytes().to_vec()
        })
    } else {
        raw_payload.to_vec()
    };

    Ok(Frame::Packet(Packet {
        version,
        packet_type,
        flags,
        ttl,
        message_id,
        from,
        to,
        timestamp,
        sub_mesh_id,
        payload,
    }))
}

fn compress(data: &[u8]) -> MeshResult<Vec<u8>> {
    lz4::block::compress(data, None, true)
        .map_err(|e| MeshError::InvalidPayload(format!("compression failed: {}", e)))
}

fn decompress(data: &[u8]) -> Option<Vec<u8>> {
    // lz4 prepends the inflated size as a little-endian i32
    if data.len() < 4 {
        return None;
    }
    let declared = i32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    if declared < 0 || declared as usize > MAX_DECOMPRESSED_LEN {
        return None;
    }
    lz4::block::decompress(data, None).ok()
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_be_bytes(buf)
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_be_bytes(buf)
}

/// POSITION payload: coordinates in 1e-7 degrees plus altitude in metres
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionPayload {
    pub latitude_e7: i32,
    pub longitude_e7: i32,
    pub altitude_m: i32,
}

impl PositionPayload {
    pub const LEN: usize = 12;

    pub fn from_degrees(latitude: f64, longitude: f64, altitude_m: i32) -> Self {
        Self {
            latitude_e7: (latitude * 1e7).round() as i32,
            longitude_e7: (longitude * 1e7).round() as i32,
            altitude_m,
        }
    }

    pub fn latitude(&self) -> f64 {
        self.latitude_e7 as f64 / 1e7
    }

    pub fn longitude(&self) -> f64 {
        self.longitude_e7 as f64 / 1e7
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.extend_from_slice(&self.latitude_e7.to_be_bytes());
        out.extend_from_slice(&self.longitude_e7.to_be_bytes());
        out.extend_from_slice(&self.altitude_m.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> MeshResult<Self> {
        if bytes.len() < Self::LEN {
            return Err(MeshError::InvalidPayload(format!(
                "position payload needs {} bytes, got {}",
                Self::LEN,
                bytes.len()
            )));
        }
        Ok(Self {
            latitude_e7: read_u32(&bytes[0..4]) as i32,
            longitude_e7: read_u32(&bytes[4..8]) as i32,
            altitude_m: read_u32(&bytes[8..12]) as i32,
        })
    }
}

/// KEY_ANNOUNCE payload: compressed secp256k1 public key and optional name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyAnnouncePayload {
    pub public_key: [u8; 33],
    pub display_name: Option<String>,
}

impl KeyAnnouncePayload {
    pub const KEY_LEN: usize = 33;

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.public_key.to_vec();
        if let Some(name) = &self.display_name {
            out.extend_from_slice(name.as_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> MeshResult<Self> {
        if bytes.len() < Self::KEY_LEN {
            return Err(MeshError::InvalidPayload(format!(
                "key announce needs {} bytes, got {}",
                Self::KEY_LEN,
                bytes.len()
            )));
        }
        let mut public_key = [0u8; 33];
        public_key.copy_from_slice(&bytes[..Self::KEY_LEN]);

        let name_bytes = &bytes[Self::KEY_LEN..];
        let display_name = if name_bytes.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(name_bytes).into_owned())
        };

        Ok(Self {
            public_key,
            display_name,
        })
    }
}

/// ACK payload: the packet-level ID being acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckPayload {
    pub acked_message_id: u32,
}

impl AckPayload {
    pub fn encode(&self) -> Vec<u8> {
        self.acked_message_id.to_be_bytes().to_vec()
    }

    pub fn decode(bytes: &[u8]) -> MeshResult<Self> {
        if bytes.len() < 4 {
            return Err(MeshError::InvalidPayload(format!(
                "ack payload needs 4 bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self {
            acked_message_id: read_u32(&bytes[0..4]),
        })
    }
}
