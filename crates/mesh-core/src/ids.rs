//! Node identifiers and locally generated message/job IDs

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use uuid::Uuid;

use crate::error::MeshError;

/// Wire value of `toNodeId` for broadcast packets
pub const BROADCAST_NODE_ID: u64 = u64::MAX;

/// Literal used for broadcast destinations in JSON messages
const BROADCAST_LITERAL: &str = "broadcast";

/// 64-bit mesh node identifier, rendered as 16 hex digits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl NodeId {
    pub fn random() -> Self {
        // Never collide with the broadcast address
        loop {
            let id = OsRng.next_u64();
            if id != BROADCAST_NODE_ID {
                return NodeId(id);
            }
        }
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        shared::config::parse_node_id(s)
            .map(NodeId)
            .map_err(|e| MeshError::InvalidMessage(e.to_string()))
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Addressee of a mesh message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Destination {
    Node(NodeId),
    Broadcast,
}

impl Destination {
    pub fn from_wire(raw: u64) -> Self {
        if raw == BROADCAST_NODE_ID {
            Destination::Broadcast
        } else {
            Destination::Node(NodeId(raw))
        }
    }

    pub fn to_wire(&self) -> u64 {
        match self {
            Destination::Node(id) => id.0,
            Destination::Broadcast => BROADCAST_NODE_ID,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self, Destination::Broadcast)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Node(id) => id.fmt(f),
            Destination::Broadcast => f.write_str(BROADCAST_LITERAL),
        }
    }
}

impl Serialize for Destination {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Destination {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw == BROADCAST_LITERAL {
            return Ok(Destination::Broadcast);
        }
        raw.parse::<NodeId>()
            .map(Destination::Node)
            .map_err(serde::de::Error::custom)
    }
}

/// Source of locally generated identifiers
///
/// Injected into the router, node and gateway so tests can substitute a
/// seeded generator and get reproducible IDs.
pub trait IdGenerator: Send + Sync {
    /// 128-bit random message ID as 32 lowercase hex characters
    fn message_id(&self) -> String;

    /// Packet-level message ID, also used to key outbound chunk sets
    fn packet_id(&self) -> u32;

    /// Identifier for gateway relay jobs
    fn job_id(&self) -> Uuid;
}

/// [`IdGenerator`] backed by any random number generator
pub struct RandomIdGenerator<R: RngCore + Send> {
    rng: Mutex<R>,
}

impl RandomIdGenerator<OsRng> {
    pub fn new() -> Self {
        Self::from_rng(OsRng)
    }
}

impl Default for RandomIdGenerator<OsRng> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: RngCore + Send> RandomIdGenerator<R> {
    pub fn from_rng(rng: R) -> Self {
        Self { rng: Mutex::new(rng) }
    }

    fn fill(&self, bytes: &mut [u8]) {
        // A poisoned lock only means another thread panicked mid-draw;
        // the generator state is still usable
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        rng.fill_bytes(bytes);
    }
}

impl<R: RngCore + Send> IdGenerator for RandomIdGenerator<R> {
    fn message_id(&self) -> String {
        let mut bytes = [0u8; 16];
        self.fill(&mut bytes);
        hex::encode(bytes)
    }

    fn packet_id(&self) -> u32 {
        let mut bytes = [0u8; 4];
        self.fill(&mut bytes);
        u32::from_be_bytes(bytes)
    }

    fn job_id(&self) -> Uuid {
        let mut bytes = [0u8; 16];
        self.fill(&mut bytes);
        uuid::Builder::from_random_bytes(bytes).into_uuid()
    }
}
