//! Decentralized mesh messaging over low-bandwidth radio links
//!
//! This crate implements the binary packet codec, chunked delivery of long
//! messages, end-to-end and forum encryption, flood routing with TTL and
//! deduplication, and a gateway bridge that relays payments to Internet
//! services.

pub mod chunker;
pub mod codec;
pub mod command;
pub mod crypto;
pub mod error;
pub mod gateway;
pub mod ids;
pub mod message;
pub mod node;
pub mod router;
pub mod scheduler;
pub mod transport;

// Re-export main types
pub use chunker::{Chunk, ChunkManager, ChunkProgress, ChunkResult, ChunkSendReport};
pub use codec::{decode, encode, Frame, Packet, PacketFlags, PacketType};
pub use command::{Command, CommandPacket, StatusReport, StatusSnapshot};
pub use crypto::{CryptoEngine, EncryptedPayload, NodeIdentity, SymmetricKey};
pub use error::{InvalidFrame, MeshError, MeshResult};
pub use gateway::{GatewayBridge, GatewayServices, GatewayState, GatewayUpdate, RelayJobStatus};
pub use ids::{Destination, IdGenerator, NodeId, RandomIdGenerator};
pub use message::{MeshMessage, MessageKind};
pub use node::{DeliveredMessage, InboundEvent, MeshNode};
pub use router::{DropReason, MeshRouter, NeighborRoute, RoutingDecision};
pub use scheduler::PeriodicTask;
pub use transport::{MemoryHub, MemoryTransport, MeshTransport};
