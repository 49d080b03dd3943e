//! UDP transport: every frame goes to each configured peer as one datagram

use async_trait::async_trait;
use mesh_core::codec::{HEADER_LEN, MAX_PAYLOAD_LEN};
use mesh_core::{MeshError, MeshResult, MeshTransport};
use std::net::SocketAddr;
use std::sync::RwLock;
use tokio::net::{lookup_host, UdpSocket};
use tracing::{debug, info, warn};

/// Largest datagram a codec frame can occupy
const MAX_DATAGRAM: usize = HEADER_LEN + MAX_PAYLOAD_LEN;

pub struct UdpTransport {
    name: String,
    socket: UdpSocket,
    peers: RwLock<Vec<SocketAddr>>,
}

impl UdpTransport {
    /// Bind `listen_addr` and resolve every `host:port` peer
    pub async fn bind(listen_addr: &str, peers: &[String]) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(listen_addr).await?;
        let local = socket.local_addr()?;

        let mut resolved = Vec::with_capacity(peers.len());
        for peer in peers {
            match lookup_host(peer.as_str()).await?.next() {
                Some(addr) => resolved.push(addr),
                None => warn!(peer = %peer, "Peer address did not resolve"),
            }
        }

        info!(local = %local, peers = resolved.len(), "UDP transport bound");
        Ok(Self {
            name: format!("udp:{}", local),
            socket,
            peers: RwLock::new(resolved),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn add_peer(&self, addr: SocketAddr) {
        let mut peers = self.peers.write().unwrap_or_else(|p| p.into_inner());
        if !peers.contains(&addr) {
            peers.push(addr);
        }
    }

    fn peers(&self) -> Vec<SocketAddr> {
        self.peers.read().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl MeshTransport for UdpTransport {
    async fn send(&self, frame: &[u8]) -> MeshResult<()> {
        let peers = self.peers();
        if peers.is_empty() {
            return Err(MeshError::TransportFailure("no UDP peers configured".into()));
        }

        let mut delivered = 0;
        for peer in &peers {
            match self.socket.send_to(frame, peer).await {
                Ok(_) => delivered += 1,
                Err(e) => warn!(peer = %peer, error = %e, "UDP send failed"),
            }
        }

        if delivered == 0 {
            return Err(MeshError::TransportFailure(format!(
                "frame reached none of {} peers",
                peers.len()
            )));
        }
        debug!(size = frame.len(), delivered, "Sent UDP frame");
        Ok(())
    }

    async fn receive(&self) -> MeshResult<Vec<u8>> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (len, from) = self.socket.recv_from(&mut buf).await?;
        buf.truncate(len);
        debug!(from = %from, size = len, "Received UDP frame");
        Ok(buf)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
