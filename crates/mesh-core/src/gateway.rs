//! Gateway bridge between the mesh and Internet-side services
//!
//! State is a plain value: every operation takes the current [`GatewayState`]
//! and hands back the next one inside a [`GatewayUpdate`], including when the
//! downstream service failed. Relay jobs are append/update only.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use shared::config::{GatewayConfig, GatewayMode, ServiceFlags};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{MeshError, MeshResult};
use crate::ids::{IdGenerator, NodeId};
use crate::message::{MeshMessage, MessageKind};
use crate::scheduler::PeriodicTask;

/// Internet-facing operations a gateway performs on behalf of the mesh
#[async_trait]
pub trait GatewayServices: Send + Sync {
    /// Probe the configured message broker
    async fn test_mqtt_connection(&self) -> MeshResult<()>;

    /// Submit a raw transaction, returning its txid
    async fn broadcast_transaction(&self, tx_hex: &str) -> MeshResult<String>;

    /// Redeem a Cashu token, returning a receipt reference
    async fn redeem_cashu_token(&self, token: &str) -> MeshResult<String>;
}

/// A mesh node seen by this gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayPeer {
    pub node_id: NodeId,
    pub last_seen: DateTime<Utc>,
    /// Whether the peer itself offers gateway services
    pub is_gateway: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayJobKind {
    BtcTransaction,
    CashuToken,
    /// Payment handed to another node acting as gateway
    ForwardedPayment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RelayJobStatus {
    Pending,
    Completed { reference: String },
    Failed { reason: String },
}

impl RelayJobStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, RelayJobStatus::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayRelayJob {
    pub id: Uuid,
    pub kind: RelayJobKind,
    /// Mesh node that asked for the relay, if any
    pub origin: Option<NodeId>,
    pub status: RelayJobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GatewayState {
    pub mode: GatewayMode,
    pub is_active: bool,
    pub services: ServiceFlags,
    pub peers: HashMap<NodeId, GatewayPeer>,
    pub relay_jobs: HashMap<Uuid, GatewayRelayJob>,
    pub started_at: Option<DateTime<Utc>>,
}

impl GatewayState {
    pub fn new(services: ServiceFlags) -> Self {
        Self {
            services,
            ..Self::default()
        }
    }

    pub fn is_relaying(&self) -> bool {
        self.mode == GatewayMode::Gateway && self.is_active
    }

    pub fn job(&self, id: &Uuid) -> Option<&GatewayRelayJob> {
        self.relay_jobs.get(id)
    }

    pub fn summary(&self) -> GatewaySummary {
        let mut summary = GatewaySummary {
            mode: self.mode,
            is_active: self.is_active,
            peers: self.peers.len(),
            ..GatewaySummary::default()
        };
        for job in self.relay_jobs.values() {
            match job.status {
                RelayJobStatus::Pending => summary.pending_jobs += 1,
                RelayJobStatus::Completed { .. } => summary.completed_jobs += 1,
                RelayJobStatus::Failed { .. } => summary.failed_jobs += 1,
            }
        }
        summary
    }
}

/// Counters for status displays and logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct GatewaySummary {
    pub mode: GatewayMode,
    pub is_active: bool,
    pub peers: usize,
    pub pending_jobs: usize,
    pub completed_jobs: usize,
    pub failed_jobs: usize,
}

/// Result of a bridge operation
#[derive(Debug)]
pub struct GatewayUpdate {
    pub state: GatewayState,
    /// Job created or updated by the operation
    pub job_id: Option<Uuid>,
    pub outcome: MeshResult<()>,
}

impl GatewayUpdate {
    fn unchanged(state: GatewayState) -> Self {
        Self {
            state,
            job_id: None,
            outcome: Ok(()),
        }
    }

    fn rejected(state: GatewayState, error: MeshError) -> Self {
        Self {
            state,
            job_id: None,
            outcome: Err(error),
        }
    }
}

/// Remove peers not seen within `max_age` of `now`
pub fn cleanup_stale_peers(
    mut state: GatewayState,
    max_age: Duration,
    now: DateTime<Utc>,
) -> GatewayState {
    let max_age = to_chrono(max_age);
    let before = state.peers.len();
    state
        .peers
        .retain(|_, peer| now.signed_duration_since(peer.last_seen) <= max_age);

    let removed = before - state.peers.len();
    if removed > 0 {
        info!(removed, remaining = state.peers.len(), "Evicted stale gateway peers");
    }
    state
}

/// Remove relay jobs not updated within `max_age` of `now`
pub fn cleanup_old_jobs(
    mut state: GatewayState,
    max_age: Duration,
    now: DateTime<Utc>,
) -> GatewayState {
    let max_age = to_chrono(max_age);
    let before = state.relay_jobs.len();
    state.relay_jobs.retain(|id, job| {
        let keep = now.signed_duration_since(job.updated_at) <= max_age;
        if !keep && !job.status.is_finished() {
            warn!(job_id = %id, kind = ?job.kind, "Evicting relay job that never finished");
        }
        keep
    });

    let removed = before - state.relay_jobs.len();
    if removed > 0 {
        info!(removed, remaining = state.relay_jobs.len(), "Evicted old relay jobs");
    }
    state
}

fn to_chrono(duration: Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or(ChronoDuration::MAX)
}

/// Relays mesh payments to Internet services
pub struct GatewayBridge {
    config: GatewayConfig,
    services: Arc<dyn GatewayServices>,
    ids: Arc<dyn IdGenerator>,
}

impl GatewayBridge {
    pub fn new(
        config: GatewayConfig,
        services: Arc<dyn GatewayServices>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        info!(mode = ?config.mode, services = ?config.services, "GatewayBridge initialized");
        Self {
            config,
            services,
            ids,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Fresh client-mode state carrying the configured service flags
    pub fn initial_state(&self) -> GatewayState {
        GatewayState::new(self.config.services)
    }

    /// Bring configured services up and switch to gateway mode on success
    pub async fn activate(&self, mut state: GatewayState) -> GatewayUpdate {
        if state.is_relaying() {
            return GatewayUpdate::unchanged(state);
        }

        if state.services.mqtt {
            if let Err(e) = self.services.test_mqtt_connection().await {
                error!(error = %e, "Gateway activation failed: MQTT broker unreachable");
                return GatewayUpdate::rejected(
                    state,
                    MeshError::ServiceUnavailable(format!("mqtt: {}", e)),
                );
            }
        }

        state.mode = GatewayMode::Gateway;
        state.is_active = true;
        state.started_at = Some(Utc::now());
        info!(services = ?state.services, "Gateway activated");
        GatewayUpdate::unchanged(state)
    }

    /// Return to client mode; peers are forgotten, relay jobs are kept
    pub fn deactivate(&self, mut state: GatewayState) -> GatewayState {
        state.mode = GatewayMode::Client;
        state.is_active = false;
        state.started_at = None;
        state.peers.clear();
        info!(jobs = state.relay_jobs.len(), "Gateway deactivated");
        state
    }

    pub fn record_peer(&self, state: GatewayState, node_id: NodeId, is_gateway: bool) -> GatewayState {
        self.record_peer_at(state, node_id, is_gateway, Utc::now())
    }

    pub fn record_peer_at(
        &self,
        mut state: GatewayState,
        node_id: NodeId,
        is_gateway: bool,
        now: DateTime<Utc>,
    ) -> GatewayState {
        state
            .peers
            .entry(node_id)
            .and_modify(|peer| {
                peer.last_seen = now;
                // Gateway status is sticky until the peer is evicted
                peer.is_gateway |= is_gateway;
            })
            .or_insert_with(|| {
                debug!(node_id = %node_id, is_gateway, "New gateway peer");
                GatewayPeer {
                    node_id,
                    last_seen: now,
                    is_gateway,
                }
            });
        state
    }

    pub fn job_status<'a>(&self, state: &'a GatewayState, job_id: &Uuid) -> Option<&'a RelayJobStatus> {
        state.job(job_id).map(|job| &job.status)
    }

    fn open_job(&self, state: &mut GatewayState, kind: RelayJobKind, origin: Option<NodeId>) -> Uuid {
        let id = self.ids.job_id();
        let now = Utc::now();
        state.relay_jobs.insert(
            id,
            GatewayRelayJob {
                id,
                kind,
                origin,
                status: RelayJobStatus::Pending,
                created_at: now,
                updated_at: now,
            },
        );
        debug!(job_id = %id, ?kind, "Opened relay job");
        id
    }

    /// Record the service result on the job and surface it as the outcome
    fn settle_job(
        &self,
        mut state: GatewayState,
        job_id: Uuid,
        result: MeshResult<String>,
    ) -> GatewayUpdate {
        let status = match &result {
            Ok(reference) => RelayJobStatus::Completed {
                reference: reference.clone(),
            },
            Err(e) => RelayJobStatus::Failed {
                reason: e.to_string(),
            },
        };

        if let Some(job) = state.relay_jobs.get_mut(&job_id) {
            match &status {
                RelayJobStatus::Completed { reference } => {
                    info!(job_id = %job_id, kind = ?job.kind, reference = %reference, "Relay job completed")
                }
                RelayJobStatus::Failed { reason } => {
                    warn!(job_id = %job_id, kind = ?job.kind, reason = %reason, "Relay job failed")
                }
                RelayJobStatus::Pending => {}
            }
            job.status = status;
            job.updated_at = Utc::now();
        }

        GatewayUpdate {
            state,
            job_id: Some(job_id),
            outcome: result.map(|_| ()),
        }
    }

    fn ensure_service(&self, state: &GatewayState, enabled: bool, name: &str) -> MeshResult<()> {
        if !state.is_relaying() {
            return Err(MeshError::GatewayInactive);
        }
        if !enabled {
            return Err(MeshError::ServiceUnavailable(format!("{} relay is disabled", name)));
        }
        Ok(())
    }

    /// Broadcast a raw Bitcoin transaction through the mempool service
    pub async fn broadcast_transaction(
        &self,
        mut state: GatewayState,
        tx_hex: &str,
        origin: Option<NodeId>,
    ) -> GatewayUpdate {
        if let Err(e) = self.ensure_service(&state, state.services.mempool, "mempool") {
            return GatewayUpdate::rejected(state, e);
        }
        let tx_hex = tx_hex.trim();
        if tx_hex.is_empty() || hex::decode(tx_hex).is_err() {
            return GatewayUpdate::rejected(
                state,
                MeshError::InvalidPayload("transaction is not hex encoded".into()),
            );
        }

        let job_id = self.open_job(&mut state, RelayJobKind::BtcTransaction, origin);
        let result = self.services.broadcast_transaction(tx_hex).await;
        self.settle_job(state, job_id, result)
    }

    /// Redeem a Cashu token through the configured relay
    pub async fn relay_cashu_token(
        &self,
        mut state: GatewayState,
        token: &str,
        origin: Option<NodeId>,
    ) -> GatewayUpdate {
        if let Err(e) = self.ensure_service(&state, state.services.cashu, "cashu") {
            return GatewayUpdate::rejected(state, e);
        }
        let token = token.trim();
        if token.is_empty() {
            return GatewayUpdate::rejected(state, MeshError::InvalidPayload("empty cashu token".into()));
        }

        let job_id = self.open_job(&mut state, RelayJobKind::CashuToken, origin);
        let result = self.services.redeem_cashu_token(token).await;
        self.settle_job(state, job_id, result)
    }

    /// Hand a payment to the freshest known gateway peer through `send`
    ///
    /// Used by client-mode nodes without Internet access. The job is recorded
    /// even when no gateway is known.
    pub async fn forward_payment_to_gateway<F, Fut>(
        &self,
        mut state: GatewayState,
        payload: String,
        send: F,
    ) -> GatewayUpdate
    where
        F: FnOnce(NodeId, String) -> Fut,
        Fut: Future<Output = MeshResult<()>>,
    {
        let job_id = self.open_job(&mut state, RelayJobKind::ForwardedPayment, None);

        let gateway = state
            .peers
            .values()
            .filter(|peer| peer.is_gateway)
            .max_by_key(|peer| peer.last_seen)
            .map(|peer| peer.node_id);

        let result = match gateway {
            Some(gateway) => {
                debug!(job_id = %job_id, gateway = %gateway, "Forwarding payment to gateway");
                send(gateway, payload).await.map(|_| gateway.to_string())
            }
            None => Err(MeshError::ServiceUnavailable("no gateway peer known".into())),
        };
        self.settle_job(state, job_id, result)
    }

    /// Submit a locally originated payment
    ///
    /// An active gateway relays it itself; any other node forwards it to the
    /// freshest gateway peer through `send`.
    pub async fn submit_payment<F, Fut>(
        &self,
        state: GatewayState,
        kind: MessageKind,
        payload: String,
        send: F,
    ) -> GatewayUpdate
    where
        F: FnOnce(NodeId, String) -> Fut,
        Fut: Future<Output = MeshResult<()>>,
    {
        match (kind, state.is_relaying()) {
            (MessageKind::Text, _) => GatewayUpdate::rejected(
                state,
                MeshError::InvalidPayload("text messages are not payments".into()),
            ),
            (MessageKind::BtcTx, true) => self.broadcast_transaction(state, &payload, None).await,
            (MessageKind::Cashu, true) => self.relay_cashu_token(state, &payload, None).await,
            (_, false) => self.forward_payment_to_gateway(state, payload, send).await,
        }
    }

    /// Relay a delivered mesh message if this node is an active gateway
    ///
    /// In client mode, or while inactive, the state is returned untouched.
    pub async fn handle_incoming_lora_message(
        &self,
        state: GatewayState,
        message: &MeshMessage,
        plaintext: &str,
    ) -> GatewayUpdate {
        if !state.is_relaying() {
            debug!(msg_id = %message.msg_id, "Not an active gateway, ignoring message");
            return GatewayUpdate::unchanged(state);
        }

        let state = self.record_peer(state, message.from, false);
        match message.kind {
            MessageKind::BtcTx => {
                self.broadcast_transaction(state, plaintext, Some(message.from))
                    .await
            }
            MessageKind::Cashu => {
                self.relay_cashu_token(state, plaintext, Some(message.from))
                    .await
            }
            MessageKind::Text => GatewayUpdate::unchanged(state),
        }
    }

    /// Apply both janitor passes with the configured ages
    pub fn cleanup(&self, state: GatewayState, now: DateTime<Utc>) -> GatewayState {
        let state = cleanup_stale_peers(state, Duration::from_secs(self.config.max_peer_age_secs), now);
        cleanup_old_jobs(state, Duration::from_secs(self.config.max_relay_job_age_secs), now)
    }

    /// Periodically run [`GatewayBridge::cleanup`] over shared state
    pub fn start_janitor(self: &Arc<Self>, state: Arc<RwLock<GatewayState>>) -> PeriodicTask {
        let bridge = Arc::clone(self);
        PeriodicTask::spawn_async(
            "gateway-janitor",
            Duration::from_secs(self.config.cleanup_interval_secs),
            move || {
                let bridge = Arc::clone(&bridge);
                let state = Arc::clone(&state);
                async move {
                    let mut guard = state.write().await;
                    let current = std::mem::take(&mut *guard);
                    *guard = bridge.cleanup(current, Utc::now());
                }
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::EncryptedPayload;
    use crate::ids::{Destination, RandomIdGenerator};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeServices {
        mqtt_down: bool,
        mempool_down: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl GatewayServices for FakeServices {
        async fn test_mqtt_connection(&self) -> MeshResult<()> {
            if self.mqtt_down {
                Err(MeshError::TransportFailure("connection refused".into()))
            } else {
                Ok(())
            }
        }

        async fn broadcast_transaction(&self, _tx_hex: &str) -> MeshResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.mempool_down {
                Err(MeshError::ServiceUnavailable("mempool returned 503".into()))
            } else {
                Ok("f00d".to_string())
            }
        }

        async fn redeem_cashu_token(&self, _token: &str) -> MeshResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok("receipt-1".to_string())
        }
    }

    fn all_services() -> ServiceFlags {
        ServiceFlags {
            mempool: true,
            cashu: true,
            mqtt: true,
            lora: true,
        }
    }

    fn bridge_with(services: Arc<FakeServices>) -> GatewayBridge {
        let config = GatewayConfig {
            services: all_services(),
            ..GatewayConfig::default()
        };
        let ids = Arc::new(RandomIdGenerator::from_rng(StdRng::seed_from_u64(7)));
        GatewayBridge::new(config, services, ids)
    }

    fn message(kind: MessageKind) -> MeshMessage {
        MeshMessage::new(
            "0011".to_string(),
            NodeId(5),
            Destination::Node(NodeId(1)),
            kind,
            EncryptedPayload {
                v: 1,
                nonce: String::new(),
                ciphertext: String::new(),
            },
            10,
        )
    }

    async fn active_bridge(services: Arc<FakeServices>) -> (GatewayBridge, GatewayState) {
        let bridge = bridge_with(services);
        let update = bridge.activate(bridge.initial_state()).await;
        assert!(update.outcome.is_ok());
        (bridge, update.state)
    }

    #[tokio::test]
    async fn test_activate_requires_mqtt() {
        let bridge = bridge_with(Arc::new(FakeServices {
            mqtt_down: true,
            ..FakeServices::default()
        }));
        let update = bridge.activate(bridge.initial_state()).await;

        assert!(matches!(update.outcome, Err(MeshError::ServiceUnavailable(_))));
        assert_eq!(update.state.mode, GatewayMode::Client);
        assert!(!update.state.is_active);
    }

    #[tokio::test]
    async fn test_activate_and_deactivate() {
        let (bridge, state) = active_bridge(Arc::new(FakeServices::default())).await;
        assert!(state.is_relaying());
        assert!(state.started_at.is_some());

        let state = bridge.record_peer(state, NodeId(9), false);
        let update = bridge.broadcast_transaction(state, "0100", None).await;
        let state = bridge.deactivate(update.state);

        assert_eq!(state.mode, GatewayMode::Client);
        assert!(state.peers.is_empty());
        assert_eq!(state.relay_jobs.len(), 1, "jobs survive deactivation");
    }

    #[tokio::test]
    async fn test_client_mode_ignores_lora_message() {
        let services = Arc::new(FakeServices::default());
        let bridge = bridge_with(services.clone());
        let state = bridge.initial_state();

        let update = bridge
            .handle_incoming_lora_message(state.clone(), &message(MessageKind::BtcTx), "0100")
            .await;

        assert_eq!(update.state, state);
        assert!(update.job_id.is_none());
        assert!(update.state.relay_jobs.is_empty());
        assert_eq!(services.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_gateway_relays_btc_tx() {
        let (bridge, state) = active_bridge(Arc::new(FakeServices::default())).await;
        let update = bridge
            .handle_incoming_lora_message(state, &message(MessageKind::BtcTx), "0200aabb")
            .await;

        assert!(update.outcome.is_ok());
        let job_id = update.job_id.unwrap();
        assert_eq!(
            bridge.job_status(&update.state, &job_id),
            Some(&RelayJobStatus::Completed {
                reference: "f00d".into()
            })
        );
        assert_eq!(update.state.job(&job_id).unwrap().origin, Some(NodeId(5)));
        assert!(update.state.peers.contains_key(&NodeId(5)));
    }

    #[tokio::test]
    async fn test_failed_broadcast_is_recorded() {
        let (bridge, state) = active_bridge(Arc::new(FakeServices {
            mempool_down: true,
            ..FakeServices::default()
        }))
        .await;

        let update = bridge.broadcast_transaction(state, "0100", None).await;
        assert!(update.outcome.is_err());
        let job = update.state.job(&update.job_id.unwrap()).unwrap();
        assert!(matches!(job.status, RelayJobStatus::Failed { .. }));
        assert_eq!(update.state.summary().failed_jobs, 1);
    }

    #[tokio::test]
    async fn test_rejects_before_creating_job() {
        let services = Arc::new(FakeServices::default());
        let bridge = bridge_with(services.clone());

        let update = bridge
            .broadcast_transaction(bridge.initial_state(), "0100", None)
            .await;
        assert!(matches!(update.outcome, Err(MeshError::GatewayInactive)));

        let (bridge, state) = active_bridge(services.clone()).await;
        let update = bridge.broadcast_transaction(state, "not hex", None).await;
        assert!(matches!(update.outcome, Err(MeshError::InvalidPayload(_))));
        assert!(update.state.relay_jobs.is_empty());
        assert_eq!(services.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cashu_relay() {
        let (bridge, state) = active_bridge(Arc::new(FakeServices::default())).await;
        let update = bridge
            .handle_incoming_lora_message(state, &message(MessageKind::Cashu), "cashuAbc")
            .await;
        let job = update.state.job(&update.job_id.unwrap()).unwrap();
        assert_eq!(job.kind, RelayJobKind::CashuToken);
        assert_eq!(
            job.status,
            RelayJobStatus::Completed {
                reference: "receipt-1".into()
            }
        );
    }

    #[tokio::test]
    async fn test_forward_payment_picks_gateway_peer() {
        let bridge = bridge_with(Arc::new(FakeServices::default()));
        let now = Utc::now();
        let state = bridge.record_peer_at(bridge.initial_state(), NodeId(2), true, now - ChronoDuration::seconds(30));
        let state = bridge.record_peer_at(state, NodeId(3), true, now);
        let state = bridge.record_peer_at(state, NodeId(4), false, now);

        let update = bridge
            .forward_payment_to_gateway(state, "cashuXyz".into(), |gateway, _payload| async move {
                assert_eq!(gateway, NodeId(3));
                Ok(())
            })
            .await;

        assert!(update.outcome.is_ok());
        assert_eq!(
            bridge.job_status(&update.state, &update.job_id.unwrap()),
            Some(&RelayJobStatus::Completed {
                reference: NodeId(3).to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_forward_payment_without_gateway_still_records_job() {
        let bridge = bridge_with(Arc::new(FakeServices::default()));
        let update = bridge
            .forward_payment_to_gateway(bridge.initial_state(), "cashuXyz".into(), |_, _| async {
                Ok(())
            })
            .await;

        assert!(matches!(update.outcome, Err(MeshError::ServiceUnavailable(_))));
        let job = update.state.job(&update.job_id.unwrap()).unwrap();
        assert!(matches!(job.status, RelayJobStatus::Failed { .. }));
    }

    #[tokio::test]
    async fn test_submit_payment_relays_or_forwards() {
        let services = Arc::new(FakeServices::default());
        let (bridge, state) = active_bridge(services.clone()).await;
        let update = bridge
            .submit_payment(state, MessageKind::BtcTx, "0200aabb".into(), |_, _| async {
                Err(MeshError::TransportFailure("not a mesh send".into()))
            })
            .await;
        assert!(update.outcome.is_ok());
        let job = update.state.job(&update.job_id.unwrap()).unwrap();
        assert_eq!(job.kind, RelayJobKind::BtcTransaction);
        assert_eq!(services.calls.load(Ordering::SeqCst), 1);

        let client = bridge_with(services.clone());
        let state = client.record_peer(client.initial_state(), NodeId(3), true);
        let update = client
            .submit_payment(state, MessageKind::Cashu, "cashuXyz".into(), |gateway, payload| async move {
                assert_eq!(gateway, NodeId(3));
                assert_eq!(payload, "cashuXyz");
                Ok(())
            })
            .await;
        let job = update.state.job(&update.job_id.unwrap()).unwrap();
        assert_eq!(job.kind, RelayJobKind::ForwardedPayment);
        assert!(update.outcome.is_ok());
        assert_eq!(services.calls.load(Ordering::SeqCst), 1);

        let update = client
            .submit_payment(update.state, MessageKind::Text, "hello".into(), |_, _| async { Ok(()) })
            .await;
        assert!(matches!(update.outcome, Err(MeshError::InvalidPayload(_))));
        assert!(update.job_id.is_none());
    }

    #[test]
    fn test_cleanup_stale_peers_age_threshold() {
        let now = Utc::now();
        let mut state = GatewayState::default();
        for (id, age_ms) in [(1u64, 301_000i64), (2, 100_000)] {
            state.peers.insert(
                NodeId(id),
                GatewayPeer {
                    node_id: NodeId(id),
                    last_seen: now - ChronoDuration::milliseconds(age_ms),
                    is_gateway: false,
                },
            );
        }

        let state = cleanup_stale_peers(state, Duration::from_millis(300_000), now);
        assert!(!state.peers.contains_key(&NodeId(1)));
        assert!(state.peers.contains_key(&NodeId(2)));
    }

    #[test]
    fn test_cleanup_old_jobs() {
        let now = Utc::now();
        let mut state = GatewayState::default();
        for (n, age_secs) in [(1u128, 7200i64), (2, 60)] {
            let id = Uuid::from_u128(n);
            let at = now - ChronoDuration::seconds(age_secs);
            state.relay_jobs.insert(
                id,
                GatewayRelayJob {
                    id,
                    kind: RelayJobKind::CashuToken,
                    origin: None,
                    status: RelayJobStatus::Completed {
                        reference: "r".into(),
                    },
                    created_at: at,
                    updated_at: at,
                },
            );
        }

        let state = cleanup_old_jobs(state, Duration::from_secs(3600), now);
        assert_eq!(state.relay_jobs.len(), 1);
        assert!(state.relay_jobs.contains_key(&Uuid::from_u128(2)));
    }

    #[test]
    fn test_job_ids_come_from_generator() {
        let bridge = bridge_with(Arc::new(FakeServices::default()));
        let mut state = bridge.initial_state();
        let a = bridge.open_job(&mut state, RelayJobKind::CashuToken, None);
        let b = bridge.open_job(&mut state, RelayJobKind::CashuToken, None);
        assert_ne!(a, b);
        assert_eq!(a.get_version_num(), 4);
    }
}
