//! Application-level mesh messages

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::crypto::EncryptedPayload;
use crate::error::{MeshError, MeshResult};
use crate::ids::{Destination, NodeId};

/// Current message format version
pub const MESSAGE_VERSION: u8 = 1;

/// Kind of content a message carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Cashu,
    BtcTx,
}

/// A flood-routed message as exchanged between nodes
///
/// Invariants: `route[0] == from` and `hop_count == route.len() - 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshMessage {
    pub v: u8,
    pub msg_id: String,
    pub from: NodeId,
    pub to: Destination,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_pubkey: Option<String>,
    pub enc: EncryptedPayload,
    /// Unix milliseconds at origin
    pub ts: i64,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub ttl: i64,
    pub hop_count: u32,
    #[serde(default)]
    pub route: Vec<NodeId>,
}

impl MeshMessage {
    pub fn new(
        msg_id: String,
        from: NodeId,
        to: Destination,
        kind: MessageKind,
        enc: EncryptedPayload,
        ttl: u8,
    ) -> Self {
        Self {
            v: MESSAGE_VERSION,
            msg_id,
            from,
            to,
            from_pubkey: None,
            enc,
            ts: Utc::now().timestamp_millis(),
            kind,
            ttl: ttl as i64,
            hop_count: 0,
            route: vec![from],
        }
    }

    pub fn with_sender_key(mut self, public_key_hex: String) -> Self {
        self.from_pubkey = Some(public_key_hex);
        self
    }

    /// Parse a message received from the mesh
    ///
    /// This is the only place external bytes become a [`MeshMessage`], so the
    /// TTL clamp and route normalization are applied here for every path.
    pub fn from_wire(bytes: &[u8], max_ttl: u8) -> MeshResult<Self> {
        let mut message: MeshMessage = serde_json::from_slice(bytes)
            .map_err(|e| MeshError::InvalidMessage(format!("malformed message JSON: {}", e)))?;

        if message.msg_id.is_empty() {
            return Err(MeshError::InvalidMessage("empty msgId".into()));
        }

        let raw_ttl = message.ttl;
        message.ttl = sanitize_ttl(raw_ttl, max_ttl);
        if message.ttl != raw_ttl {
            debug!(msg_id = %message.msg_id, raw_ttl, clamped = message.ttl, "Clamped inbound TTL");
        }

        if message.route.is_empty() {
            message.route.push(message.from);
        }
        if message.route[0] != message.from {
            return Err(MeshError::InvalidMessage(format!(
                "route starts at {} but message is from {}",
                message.route[0], message.from
            )));
        }
        message.hop_count = (message.route.len() - 1) as u32;

        Ok(message)
    }

    pub fn to_wire(&self) -> MeshResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn to_wire_string(&self) -> MeshResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn is_addressed_to(&self, node: NodeId) -> bool {
        self.to == Destination::Node(node)
    }
}

/// Clamp a TTL from an untrusted source into `[0, max_ttl]`
pub fn sanitize_ttl(ttl: i64, max_ttl: u8) -> i64 {
    ttl.clamp(0, max_ttl as i64)
}
