//! A mesh node: the inbound and outbound message pipeline
//!
//! Inbound frames flow through the codec, chunk reassembly, message parsing,
//! the router decision and finally decryption. Outbound messages are
//! encrypted, registered with the router so echoes are dropped, and sent as
//! one TEXT packet or a run of CHUNK packets.

use dashmap::DashMap;
use shared::config::{Config, NodeConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::chunker::{ChunkManager, ChunkProgress};
use crate::codec::{
    self, AckPayload, Frame, KeyAnnouncePayload, Packet, PacketFlags, PacketType, PositionPayload,
};
use crate::command::CommandPacket;
use crate::crypto::{CryptoEngine, NodeIdentity, SymmetricKey};
use crate::error::{MeshError, MeshResult};
use crate::ids::{Destination, IdGenerator, NodeId};
use crate::message::{MeshMessage, MessageKind};
use crate::router::{DropReason, MeshRouter, RoutingDecision};
use crate::scheduler::PeriodicTask;
use crate::transport::MeshTransport;

/// A message decrypted for this node
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveredMessage {
    pub message: MeshMessage,
    pub plaintext: String,
    /// Forum the message was posted to; `None` for direct messages
    pub channel: Option<String>,
}

/// What happened to an inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Delivered(DeliveredMessage),
    Relayed {
        msg_id: String,
        ttl: i64,
    },
    Dropped {
        msg_id: String,
        reason: DropReason,
    },
    ChunkPending {
        message_id: u32,
        progress: ChunkProgress,
    },
    KeyAnnounced {
        node_id: NodeId,
        public_key_hex: String,
        display_name: Option<String>,
        /// False when a different key was already pinned for the node
        pinned: bool,
        /// Sender advertises itself as an active gateway
        is_gateway: bool,
    },
    Position {
        from: NodeId,
        position: PositionPayload,
    },
    Ack {
        from: NodeId,
        acked_message_id: u32,
    },
    Command {
        from: NodeId,
        command: CommandPacket,
    },
    /// Frame sent by this node and heard back
    OwnFrame,
    /// Frame for a different sub-mesh sharing the medium
    ForeignSubMesh {
        sub_mesh_id: u16,
    },
    /// Broadcast that none of the joined forum keys opens
    ForeignForum {
        msg_id: String,
    },
    Unknown {
        type_code: u8,
    },
}

struct Forum {
    name: String,
    key: SymmetricKey,
}

pub struct MeshNode {
    node_id: NodeId,
    identity: NodeIdentity,
    sub_mesh_id: u16,
    default_ttl: u8,
    router: Arc<MeshRouter>,
    chunks: Arc<ChunkManager>,
    transport: Arc<dyn MeshTransport>,
    ids: Arc<dyn IdGenerator>,
    peer_keys: DashMap<NodeId, String>,
    forums: RwLock<Vec<Forum>>,
    advertise_gateway: AtomicBool,
    announce_interval: Duration,
}

impl MeshNode {
    pub fn new(
        config: &Config,
        identity: NodeIdentity,
        transport: Arc<dyn MeshTransport>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        let NodeConfig {
            node_id,
            sub_mesh_id,
            forum_channels,
            announce_interval_secs,
            ..
        } = &config.node;

        let node_id = node_id.map(NodeId).unwrap_or_else(NodeId::random);
        let router = Arc::new(MeshRouter::new(node_id, config.router.clone()));
        let chunks = Arc::new(ChunkManager::new(config.chunk.clone()));
        let default_ttl = config.router.default_ttl.min(config.router.max_ttl);

        let node = Self {
            node_id,
            identity,
            sub_mesh_id: *sub_mesh_id,
            default_ttl,
            router,
            chunks,
            transport,
            ids,
            peer_keys: DashMap::new(),
            forums: RwLock::new(Vec::new()),
            advertise_gateway: AtomicBool::new(false),
            announce_interval: Duration::from_secs(*announce_interval_secs),
        };
        for channel in forum_channels {
            node.join_forum(channel);
        }

        info!(
            node_id = %node.node_id,
            public_key = %node.identity.public_key_hex(),
            transport = node.transport.name(),
            "MeshNode started"
        );
        node
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn public_key_hex(&self) -> String {
        self.identity.public_key_hex()
    }

    pub fn router(&self) -> &Arc<MeshRouter> {
        &self.router
    }

    pub fn chunks(&self) -> &Arc<ChunkManager> {
        &self.chunks
    }

    /// Start the router cleanup and chunk sweep tasks
    pub fn start_background_tasks(&self) -> Vec<PeriodicTask> {
        vec![self.router.start_cleanup(), self.chunks.start_sweeper()]
    }

    /// Periodically re-announce this node's key and gateway status
    pub fn start_announcer(self: &Arc<Self>) -> PeriodicTask {
        let node = Arc::clone(self);
        PeriodicTask::spawn_async("key-announce", self.announce_interval, move || {
            let node = Arc::clone(&node);
            async move {
                if let Err(e) = node.announce_key(None).await {
                    warn!(error = %e, "Periodic key announcement failed");
                }
            }
        })
    }

    /// Mark key announcements with the gateway flag
    pub fn set_gateway_advertised(&self, on: bool) {
        self.advertise_gateway.store(on, Ordering::Relaxed);
    }

    pub fn is_gateway_advertised(&self) -> bool {
        self.advertise_gateway.load(Ordering::Relaxed)
    }

    pub fn join_forum(&self, channel: &str) {
        let mut forums = self.forums.write().unwrap_or_else(|p| p.into_inner());
        if forums.iter().any(|f| f.name == channel) {
            return;
        }
        forums.push(Forum {
            name: channel.to_string(),
            key: CryptoEngine::derive_forum_key(channel),
        });
        debug!(channel, "Joined forum");
    }

    pub fn leave_forum(&self, channel: &str) {
        let mut forums = self.forums.write().unwrap_or_else(|p| p.into_inner());
        forums.retain(|f| f.name != channel);
    }

    pub fn forums(&self) -> Vec<String> {
        let forums = self.forums.read().unwrap_or_else(|p| p.into_inner());
        forums.iter().map(|f| f.name.clone()).collect()
    }

    /// Set the public key of a peer, replacing any pinned key
    pub fn add_peer_key(&self, node_id: NodeId, public_key_hex: &str) {
        self.peer_keys.insert(node_id, public_key_hex.to_string());
    }

    /// Pin a key heard on the air unless a different one is already pinned
    ///
    /// Returns whether `public_key_hex` is the key now used for `node_id`.
    fn pin_peer_key(&self, node_id: NodeId, public_key_hex: &str) -> bool {
        let pinned = self
            .peer_keys
            .entry(node_id)
            .or_insert_with(|| {
                info!(node_id = %node_id, "Pinned peer key");
                public_key_hex.to_string()
            });
        if pinned.as_str() == public_key_hex {
            return true;
        }
        warn!(
            node_id = %node_id,
            pinned = %pinned.as_str(),
            announced = public_key_hex,
            "Ignoring key announcement that conflicts with pinned key"
        );
        false
    }

    pub fn peer_key(&self, node_id: &NodeId) -> Option<String> {
        self.peer_keys.get(node_id).map(|k| k.clone())
    }

    /// Wait for the next frame on the transport and process it
    pub async fn receive_next(&self) -> MeshResult<InboundEvent> {
        let frame = self.transport.receive().await?;
        self.handle_frame(&frame).await
    }

    /// Process one raw frame
    pub async fn handle_frame(&self, bytes: &[u8]) -> MeshResult<InboundEvent> {
        let packet = match codec::decode(bytes)? {
            Frame::Packet(packet) => packet,
            Frame::Unknown(unknown) => {
                debug!(type_code = unknown.type_code, "Ignoring frame of unknown type");
                return Ok(InboundEvent::Unknown {
                    type_code: unknown.type_code,
                });
            }
        };

        if packet.from == self.node_id {
            return Ok(InboundEvent::OwnFrame);
        }
        if packet.sub_mesh_id != self.sub_mesh_id {
            return Ok(InboundEvent::ForeignSubMesh {
                sub_mesh_id: packet.sub_mesh_id,
            });
        }

        match packet.packet_type {
            PacketType::Text => self.handle_message_bytes(&packet.payload).await,
            PacketType::Chunk => {
                let result = self.chunks.handle_incoming_packet(&packet);
                if let Some(e) = result.error {
                    return Err(e);
                }
                match result.message {
                    Some(text) if result.complete => self.handle_message_bytes(text.as_bytes()).await,
                    _ => Ok(InboundEvent::ChunkPending {
                        message_id: packet.message_id,
                        progress: result.progress,
                    }),
                }
            }
            PacketType::KeyAnnounce => {
                let announce = KeyAnnouncePayload::decode(&packet.payload)?;
                CryptoEngine::validate_public_key(&announce.public_key)?;
                let public_key_hex = announce.public_key_hex();
                let pinned = self.pin_peer_key(packet.from, &public_key_hex);
                self.router.update_neighbor(packet.from, None, 0, None);
                Ok(InboundEvent::KeyAnnounced {
                    node_id: packet.from,
                    public_key_hex,
                    display_name: announce.display_name,
                    pinned,
                    is_gateway: packet.flags.is_gateway(),
                })
            }
            PacketType::Position => {
                let position = PositionPayload::decode(&packet.payload)?;
                self.router.update_neighbor(packet.from, None, 0, None);
                Ok(InboundEvent::Position {
                    from: packet.from,
                    position,
                })
            }
            PacketType::Ack => {
                let ack = AckPayload::decode(&packet.payload)?;
                Ok(InboundEvent::Ack {
                    from: packet.from,
                    acked_message_id: ack.acked_message_id,
                })
            }
            PacketType::RoomServer(_) | PacketType::Repeater(_) => {
                let command = CommandPacket::from_packet(&packet)?;
                Ok(InboundEvent::Command {
                    from: packet.from,
                    command,
                })
            }
        }
    }

    async fn handle_message_bytes(&self, bytes: &[u8]) -> MeshResult<InboundEvent> {
        let message = MeshMessage::from_wire(bytes, self.router.config().max_ttl)?;

        match self.router.process_incoming_message(&message) {
            RoutingDecision::Drop(reason) => Ok(InboundEvent::Dropped {
                msg_id: message.msg_id,
                reason,
            }),
            RoutingDecision::Relay => {
                let relayed = self.router.prepare_relay(&message);
                self.transmit(&relayed).await?;
                debug!(msg_id = %relayed.msg_id, ttl = relayed.ttl, "Relayed message");
                Ok(InboundEvent::Relayed {
                    msg_id: relayed.msg_id,
                    ttl: relayed.ttl,
                })
            }
            RoutingDecision::Deliver => {
                if message.to.is_broadcast() {
                    // Forum traffic keeps flooding past every member
                    let relayed = self.router.prepare_relay(&message);
                    if relayed.ttl <= 0 {
                        debug!(msg_id = %message.msg_id, "Hop budget spent, not re-broadcasting");
                    } else if let Err(e) = self.transmit(&relayed).await {
                        warn!(msg_id = %message.msg_id, error = %e, "Failed to re-broadcast forum message");
                    }
                }
                self.deliver(message)
            }
        }
    }

    fn deliver(&self, message: MeshMessage) -> MeshResult<InboundEvent> {
        if message.to.is_broadcast() {
            let forums = self.forums.read().unwrap_or_else(|p| p.into_inner());
            for forum in forums.iter() {
                match CryptoEngine::decrypt_message(&message.enc, &forum.key) {
                    Ok(plaintext) => {
                        return Ok(InboundEvent::Delivered(DeliveredMessage {
                            channel: Some(forum.name.clone()),
                            message,
                            plaintext,
                        }))
                    }
                    Err(MeshError::AuthenticationFailure) => continue,
                    Err(e) => return Err(e),
                }
            }
            debug!(msg_id = %message.msg_id, "Broadcast is not for any joined forum");
            return Ok(InboundEvent::ForeignForum {
                msg_id: message.msg_id,
            });
        }

        let sender_key = match (&message.from_pubkey, self.peer_key(&message.from)) {
            (_, Some(known)) => known,
            (Some(claimed), None) => claimed.clone(),
            (None, None) => return Err(MeshError::UnknownPeerKey(message.from.to_string())),
        };

        let plaintext = CryptoEngine::decrypt_dm(&message.enc, &self.identity, &sender_key)?;
        // Only keys that produced an authentic message are remembered
        self.peer_keys.entry(message.from).or_insert(sender_key);

        Ok(InboundEvent::Delivered(DeliveredMessage {
            message,
            plaintext,
            channel: None,
        }))
    }

    /// Encrypt `text` for `to` and send it
    ///
    /// Returns the message ID.
    pub async fn send_direct(&self, to: NodeId, text: &str, kind: MessageKind) -> MeshResult<String> {
        let their_key = self
            .peer_key(&to)
            .ok_or_else(|| MeshError::UnknownPeerKey(to.to_string()))?;
        let enc = CryptoEngine::encrypt_dm(text, &self.identity, &their_key)?;

        let message = MeshMessage::new(
            self.ids.message_id(),
            self.node_id,
            Destination::Node(to),
            kind,
            enc,
            self.default_ttl,
        )
        .with_sender_key(self.identity.public_key_hex());

        self.send_message(message).await
    }

    /// Post `text` to a forum channel; the channel does not need to be joined
    pub async fn send_forum(&self, channel: &str, text: &str, kind: MessageKind) -> MeshResult<String> {
        let enc = CryptoEngine::encrypt_forum(text, channel)?;
        let message = MeshMessage::new(
            self.ids.message_id(),
            self.node_id,
            Destination::Broadcast,
            kind,
            enc,
            self.default_ttl,
        );
        self.send_message(message).await
    }

    async fn send_message(&self, message: MeshMessage) -> MeshResult<String> {
        self.router.register_outbound(&message);
        self.transmit(&message).await?;
        debug!(msg_id = %message.msg_id, to = %message.to, kind = ?message.kind, "Sent message");
        Ok(message.msg_id)
    }

    /// Put a message on the air, chunked when it exceeds one packet
    async fn transmit(&self, message: &MeshMessage) -> MeshResult<()> {
        let text = message.to_wire_string()?;
        let ttl = message.ttl.clamp(0, u8::MAX as i64) as u8;
        let packet_id = self.ids.packet_id();

        if !self.chunks.needs_chunking(&text) {
            let packet = Packet::new(
                PacketType::Text,
                packet_id,
                self.node_id,
                message.to,
                ttl,
                text.into_bytes(),
            )
            .with_flags(PacketFlags::empty().with_encrypted(true))
            .with_sub_mesh(self.sub_mesh_id);
            return self.send_packet(&packet).await;
        }

        let report = self
            .chunks
            .send_message_with_chunking(&text, packet_id, |chunk| {
                let packet = chunk
                    .to_packet(self.node_id, message.to, ttl)
                    .with_flags(PacketFlags::empty().with_encrypted(true))
                    .with_sub_mesh(self.sub_mesh_id);
                async move { self.send_packet(&packet).await }
            })
            .await;

        match report.error {
            Some(e) => {
                warn!(
                    msg_id = %message.msg_id,
                    sent = report.sent,
                    total = report.total,
                    "Chunked send incomplete"
                );
                Err(e)
            }
            None => Ok(()),
        }
    }

    async fn send_packet(&self, packet: &Packet) -> MeshResult<()> {
        let bytes = codec::encode(packet)?;
        self.transport.send(&bytes).await
    }

    /// Broadcast this node's public key
    pub async fn announce_key(&self, display_name: Option<&str>) -> MeshResult<()> {
        let payload = KeyAnnouncePayload {
            public_key: self.identity.public_key_bytes(),
            display_name: display_name.map(str::to_string),
        };
        let packet = Packet::new(
            PacketType::KeyAnnounce,
            self.ids.packet_id(),
            self.node_id,
            Destination::Broadcast,
            1,
            payload.encode(),
        )
        .with_flags(PacketFlags::empty().with_gateway(self.is_gateway_advertised()))
        .with_sub_mesh(self.sub_mesh_id);
        self.send_packet(&packet).await
    }

    pub async fn send_position(&self, latitude: f64, longitude: f64, altitude_m: i32) -> MeshResult<()> {
        let position = PositionPayload::from_degrees(latitude, longitude, altitude_m);
        let packet = Packet::new(
            PacketType::Position,
            self.ids.packet_id(),
            self.node_id,
            Destination::Broadcast,
            1,
            position.encode(),
        )
        .with_sub_mesh(self.sub_mesh_id);
        self.send_packet(&packet).await
    }

    /// Acknowledge a packet-level message ID to `to`
    pub async fn acknowledge(&self, to: NodeId, acked_message_id: u32) -> MeshResult<()> {
        let packet = Packet::new(
            PacketType::Ack,
            self.ids.packet_id(),
            self.node_id,
            Destination::Node(to),
            1,
            AckPayload { acked_message_id }.encode(),
        )
        .with_sub_mesh(self.sub_mesh_id);
        self.send_packet(&packet).await
    }

    pub async fn send_command(&self, to: NodeId, command: &CommandPacket) -> MeshResult<()> {
        let packet = command
            .to_packet(self.ids.packet_id(), self.node_id, Destination::Node(to), 1)
            .with_sub_mesh(self.sub_mesh_id);
        self.send_packet(&packet).await
    }
}
