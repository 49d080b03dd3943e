//! Flood routing with TTL decay and message deduplication

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use shared::config::RouterConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::ids::{Destination, NodeId};
use crate::message::MeshMessage;
use crate::scheduler::PeriodicTask;

/// Why a correctly decoded message is not processed further
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Duplicate,
    TtlExpired,
}

/// Outcome of routing an inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingDecision {
    /// Addressed to this node or broadcast
    Deliver,
    /// Addressed elsewhere, re-broadcast after [`MeshRouter::prepare_relay`]
    Relay,
    Drop(DropReason),
}

/// What this node knows about reaching another node
#[derive(Debug, Clone, PartialEq)]
pub struct NeighborRoute {
    pub node_id: NodeId,
    pub last_seen: DateTime<Utc>,
    pub rssi: Option<i16>,
    /// Relays between this node and the neighbor; 0 means heard directly
    pub hop_count: u32,
    /// Relays to traverse, nearest first
    pub via: Option<Vec<NodeId>>,
}

impl NeighborRoute {
    pub fn is_active(&self, now: DateTime<Utc>, timeout: ChronoDuration) -> bool {
        now.signed_duration_since(self.last_seen) <= timeout
    }
}

/// Counts from a cleanup pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStats {
    pub seen_removed: usize,
    pub neighbors_removed: usize,
}

/// Mesh router owning the seen-message set and the neighbor table
///
/// One instance per mesh identity. Both tables are concurrent maps so the
/// router can be shared across transports; the duplicate check and the
/// seen-marking happen under a single map entry lock.
pub struct MeshRouter {
    node_id: NodeId,
    config: RouterConfig,
    seen_messages: DashMap<String, DateTime<Utc>>,
    neighbors: DashMap<NodeId, NeighborRoute>,
}

impl MeshRouter {
    pub fn new(node_id: NodeId, config: RouterConfig) -> Self {
        info!(
            node_id = %node_id,
            max_ttl = config.max_ttl,
            "MeshRouter initialized"
        );

        Self {
            node_id,
            config,
            seen_messages: DashMap::new(),
            neighbors: DashMap::new(),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    fn seen_expiration(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.config.seen_expiration_secs as i64)
    }

    fn neighbor_timeout(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.config.neighbor_timeout_secs as i64)
    }

    /// Classify an inbound message as deliver, relay or drop
    pub fn process_incoming_message(&self, message: &MeshMessage) -> RoutingDecision {
        self.process_incoming_message_at(message, Utc::now())
    }

    pub fn process_incoming_message_at(
        &self,
        message: &MeshMessage,
        now: DateTime<Utc>,
    ) -> RoutingDecision {
        // Check and mark seen atomically so concurrent arrivals of the same
        // message from different transports cannot both pass
        if !self.try_mark_seen(&message.msg_id, now) {
            debug!(msg_id = %message.msg_id, "Duplicate message, dropping");
            return RoutingDecision::Drop(DropReason::Duplicate);
        }

        self.learn_from_route(message, now);

        if message.ttl <= 0 {
            debug!(msg_id = %message.msg_id, "Message TTL expired, dropping");
            return RoutingDecision::Drop(DropReason::TtlExpired);
        }

        if message.to == Destination::Broadcast || message.is_addressed_to(self.node_id) {
            debug!(msg_id = %message.msg_id, from = %message.from, "Delivering message");
            return RoutingDecision::Deliver;
        }

        debug!(msg_id = %message.msg_id, to = %message.to, "Message will be relayed");
        RoutingDecision::Relay
    }

    /// Returns false when the ID was already seen and has not expired
    fn try_mark_seen(&self, msg_id: &str, now: DateTime<Utc>) -> bool {
        let expiration = self.seen_expiration();
        match self.seen_messages.entry(msg_id.to_string()) {
            Entry::Occupied(mut entry) => {
                if now.signed_duration_since(*entry.get()) > expiration {
                    // Expired but not yet swept: treat as new
                    entry.insert(now);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(now);
                true
            }
        }
    }

    /// Record a locally originated message so its echoes are dropped
    pub fn register_outbound(&self, message: &MeshMessage) {
        self.seen_messages.insert(message.msg_id.clone(), Utc::now());
    }

    pub fn has_seen(&self, msg_id: &str) -> bool {
        self.seen_messages.contains_key(msg_id)
    }

    /// Build the copy of `message` this node re-broadcasts
    ///
    /// The input is left untouched.
    pub fn prepare_relay(&self, message: &MeshMessage) -> MeshMessage {
        let mut relayed = message.clone();
        relayed.ttl = message.ttl.saturating_sub(1);
        relayed.hop_count = message.hop_count.saturating_add(1);
        relayed.route.push(self.node_id);
        relayed
    }

    /// The last route entry transmitted the message to us; the origin sits
    /// `hop_count` relays away, reachable through the route in reverse.
    fn learn_from_route(&self, message: &MeshMessage, now: DateTime<Utc>) {
        if let Some(&last_hop) = message.route.last() {
            self.update_neighbor_at(last_hop, None, 0, None, now);
        }

        if message.route.len() > 1 {
            let via: Vec<NodeId> = message.route[1..].iter().rev().copied().collect();
            self.update_neighbor_at(message.from, None, message.hop_count, Some(via), now);
        }
    }

    pub fn update_neighbor(
        &self,
        node_id: NodeId,
        rssi: Option<i16>,
        hop_count: u32,
        via: Option<Vec<NodeId>>,
    ) {
        self.update_neighbor_at(node_id, rssi, hop_count, via, Utc::now());
    }

    /// Insert or refresh a neighbor
    ///
    /// A known active route is only replaced by one with an equal or lower
    /// hop count; a worse route still refreshes presence.
    pub fn update_neighbor_at(
        &self,
        node_id: NodeId,
        rssi: Option<i16>,
        hop_count: u32,
        via: Option<Vec<NodeId>>,
        now: DateTime<Utc>,
    ) {
        if node_id == self.node_id {
            return;
        }
        let timeout = self.neighbor_timeout();

        match self.neighbors.entry(node_id) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get_mut();
                if hop_count <= existing.hop_count || !existing.is_active(now, timeout) {
                    existing.hop_count = hop_count;
                    existing.via = via;
                    if rssi.is_some() {
                        existing.rssi = rssi;
                    }
                }
                existing.last_seen = now;
            }
            Entry::Vacant(entry) => {
                debug!(node_id = %node_id, hop_count, "Discovered neighbor");
                entry.insert(NeighborRoute {
                    node_id,
                    last_seen: now,
                    rssi,
                    hop_count,
                    via,
                });
            }
        }
    }

    pub fn remove_neighbor(&self, node_id: &NodeId) -> Option<NeighborRoute> {
        let removed = self.neighbors.remove(node_id).map(|(_, route)| route);
        if removed.is_some() {
            info!(node_id = %node_id, "Removed neighbor");
        }
        removed
    }

    /// Active neighbors, nearest first
    pub fn get_neighbors(&self) -> Vec<NeighborRoute> {
        self.get_neighbors_at(Utc::now())
    }

    pub fn get_neighbors_at(&self, now: DateTime<Utc>) -> Vec<NeighborRoute> {
        let timeout = self.neighbor_timeout();
        let mut neighbors: Vec<NeighborRoute> = self
            .neighbors
            .iter()
            .filter(|entry| entry.value().is_active(now, timeout))
            .map(|entry| entry.value().clone())
            .collect();
        neighbors.sort_by_key(|n| (n.hop_count, n.node_id));
        neighbors
    }

    pub fn is_direct_neighbor(&self, node_id: &NodeId) -> bool {
        let timeout = self.neighbor_timeout();
        let now = Utc::now();
        self.neighbors
            .get(node_id)
            .map(|route| route.hop_count == 0 && route.is_active(now, timeout))
            .unwrap_or(false)
    }

    /// Best-effort path hint ending at `destination`
    ///
    /// Relaying is always a flood; this only informs presence displays.
    pub fn find_route(&self, destination: &NodeId) -> Option<Vec<NodeId>> {
        let timeout = self.neighbor_timeout();
        let now = Utc::now();
        let route = self.neighbors.get(destination)?;
        if !route.is_active(now, timeout) {
            return None;
        }

        let mut path = route.via.clone().unwrap_or_default();
        path.push(*destination);
        Some(path)
    }

    /// Evict expired seen IDs and stale neighbors
    pub fn cleanup(&self) -> CleanupStats {
        self.cleanup_at(Utc::now())
    }

    pub fn cleanup_at(&self, now: DateTime<Utc>) -> CleanupStats {
        let expiration = self.seen_expiration();
        let timeout = self.neighbor_timeout();

        let seen_before = self.seen_messages.len();
        self.seen_messages
            .retain(|_, seen_at| now.signed_duration_since(*seen_at) <= expiration);

        let neighbors_before = self.neighbors.len();
        self.neighbors.retain(|_, route| route.is_active(now, timeout));

        let stats = CleanupStats {
            seen_removed: seen_before.saturating_sub(self.seen_messages.len()),
            neighbors_removed: neighbors_before.saturating_sub(self.neighbors.len()),
        };

        if stats != CleanupStats::default() {
            info!(
                seen_removed = stats.seen_removed,
                neighbors_removed = stats.neighbors_removed,
                "Router cleanup complete"
            );
        } else {
            debug!("Router cleanup complete: nothing expired");
        }
        stats
    }

    /// Run [`MeshRouter::cleanup`] on the configured interval
    pub fn start_cleanup(self: &Arc<Self>) -> PeriodicTask {
        let router = Arc::clone(self);
        PeriodicTask::spawn(
            "router-cleanup",
            Duration::from_secs(self.config.cleanup_interval_secs),
            move || {
                router.cleanup();
            },
        )
    }

    pub fn seen_count(&self) -> usize {
        self.seen_messages.len()
    }

    pub fn neighbor_count(&self) -> usize {
        self.neighbors.len()
    }
}
