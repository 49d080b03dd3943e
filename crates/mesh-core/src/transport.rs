//! Transport abstraction for moving raw frames between nodes

use crate::error::{MeshError, MeshResult};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

/// Frames buffered per in-memory endpoint
const CHANNEL_CAPACITY: usize = 256;

/// Byte-level link to the rest of the mesh
///
/// Framing is whatever the codec produces; a transport delivers each frame
/// whole or not at all.
#[async_trait]
pub trait MeshTransport: Send + Sync {
    /// Transmit one frame to every reachable peer
    async fn send(&self, frame: &[u8]) -> MeshResult<()>;

    /// Wait for the next inbound frame
    async fn receive(&self) -> MeshResult<Vec<u8>>;

    /// Label used in logs
    fn name(&self) -> &str;
}

enum Outbound {
    Direct(mpsc::Sender<Vec<u8>>),
    Hub { hub: Arc<HubInner>, member: usize },
}

/// In-process transport endpoint
pub struct MemoryTransport {
    name: String,
    outbound: Outbound,
    inbound: RwLock<mpsc::Receiver<Vec<u8>>>,
}

impl MemoryTransport {
    /// Two endpoints wired to each other
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (b_tx, b_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let a = Self {
            name: "memory-a".to_string(),
            outbound: Outbound::Direct(b_tx),
            inbound: RwLock::new(a_rx),
        };
        let b = Self {
            name: "memory-b".to_string(),
            outbound: Outbound::Direct(a_tx),
            inbound: RwLock::new(b_rx),
        };
        (a, b)
    }
}

#[async_trait]
impl MeshTransport for MemoryTransport {
    async fn send(&self, frame: &[u8]) -> MeshResult<()> {
        match &self.outbound {
            Outbound::Direct(tx) => tx
                .send(frame.to_vec())
                .await
                .map_err(|_| MeshError::TransportFailure(format!("{}: peer closed", self.name))),
            Outbound::Hub { hub, member } => {
                hub.broadcast(*member, frame);
                Ok(())
            }
        }
    }

    async fn receive(&self) -> MeshResult<Vec<u8>> {
        let mut rx = self.inbound.write().await;
        rx.recv()
            .await
            .ok_or_else(|| MeshError::TransportFailure(format!("{}: link closed", self.name)))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

struct HubInner {
    members: Mutex<Vec<mpsc::Sender<Vec<u8>>>>,
    blocked: Mutex<HashSet<(usize, usize)>>,
}

impl HubInner {
    fn broadcast(&self, from: usize, frame: &[u8]) {
        let members = self.members.lock().unwrap_or_else(|p| p.into_inner());
        let blocked = self.blocked.lock().unwrap_or_else(|p| p.into_inner());

        for (member, tx) in members.iter().enumerate() {
            if member == from || blocked.contains(&ordered(from, member)) {
                continue;
            }
            // A full queue behaves like a collision on the air: the frame is lost
            if let Err(e) = tx.try_send(frame.to_vec()) {
                warn!(from, to = member, error = %e, "Hub dropped frame");
            }
        }
        debug!(from, size = frame.len(), "Hub broadcast frame");
    }
}

/// Shared in-process medium where every frame reaches every other member
///
/// Pairs can be cut with [`MemoryHub::partition`] to build multi-hop
/// topologies.
#[derive(Clone)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                members: Mutex::new(Vec::new()),
                blocked: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Attach a new endpoint; the returned index identifies it to `partition`
    pub fn join(&self) -> (usize, MemoryTransport) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut members = self.inner.members.lock().unwrap_or_else(|p| p.into_inner());
        let member = members.len();
        members.push(tx);

        let transport = MemoryTransport {
            name: format!("hub-{}", member),
            outbound: Outbound::Hub {
                hub: Arc::clone(&self.inner),
                member,
            },
            inbound: RwLock::new(rx),
        };
        (member, transport)
    }

    /// Stop frames flowing between `a` and `b` in both directions
    pub fn partition(&self, a: usize, b: usize) {
        self.inner
            .blocked
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(ordered(a, b));
    }

    pub fn heal(&self, a: usize, b: usize) {
        self.inner
            .blocked
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&ordered(a, b));
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

fn ordered(a: usize, b: usize) -> (usize, usize) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}
