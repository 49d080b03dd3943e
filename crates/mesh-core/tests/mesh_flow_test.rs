// Integration tests: several nodes on a shared in-memory medium

use async_trait::async_trait;
use mesh_core::gateway::RelayJobStatus;
use mesh_core::{
    DropReason, GatewayBridge, GatewayServices, InboundEvent, MemoryHub, MemoryTransport, MeshError, MeshNode,
    MeshResult, MessageKind, NodeId, NodeIdentity, RandomIdGenerator,
};
use shared::{Config, GatewayConfig, ServiceFlags};
use std::sync::Arc;
use std::time::Duration;

fn config(node_id: u64) -> Config {
    let mut config = Config::default();
    config.node.node_id = Some(node_id);
    config.chunk.inter_chunk_delay_ms = 0;
    config
}

/// Three nodes in a line: A hears B, B hears C, A and C are out of range
fn line() -> (MeshNode, MeshNode, MeshNode) {
    let hub = MemoryHub::new();
    let (ia, ta) = hub.join();
    let (_, tb) = hub.join();
    let (ic, tc) = hub.join();
    hub.partition(ia, ic);

    let build = |id: u64, transport: MemoryTransport| {
        MeshNode::new(
            &config(id),
            NodeIdentity::generate(),
            Arc::new(transport),
            Arc::new(RandomIdGenerator::new()),
        )
    };
    (build(0xa, ta), build(0xb, tb), build(0xc, tc))
}

/// Next event that is not an intermediate chunk
async fn next_event(node: &MeshNode) -> MeshResult<InboundEvent> {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match node.receive_next().await {
                Ok(InboundEvent::ChunkPending { .. }) => continue,
                other => return other,
            }
        }
    })
    .await
    .expect("timed out waiting for a mesh event")
}

#[tokio::test]
async fn test_direct_message_crosses_relay() {
    let (a, b, c) = line();
    a.add_peer_key(c.node_id(), &c.public_key_hex());

    let msg_id = a
        .send_direct(c.node_id(), "two hops away", MessageKind::Text)
        .await
        .unwrap();

    match next_event(&b).await.unwrap() {
        InboundEvent::Relayed { msg_id: relayed, ttl } => {
            assert_eq!(relayed, msg_id);
            assert_eq!(ttl, 9);
        }
        other => panic!("relay saw {:?}", other),
    }

    match next_event(&c).await.unwrap() {
        InboundEvent::Delivered(delivered) => {
            assert_eq!(delivered.plaintext, "two hops away");
            assert_eq!(delivered.message.route, vec![a.node_id(), b.node_id()]);
            assert_eq!(delivered.message.hop_count, 1);
        }
        other => panic!("destination saw {:?}", other),
    }

    // The origin hears the relayed copy and drops it as already seen
    match next_event(&a).await.unwrap() {
        InboundEvent::Dropped { reason, .. } => assert_eq!(reason, DropReason::Duplicate),
        other => panic!("origin saw {:?}", other),
    }

    // C learned the route back to A through B
    assert!(c.router().is_direct_neighbor(&b.node_id()));
    assert_eq!(
        c.router().find_route(&a.node_id()),
        Some(vec![b.node_id(), a.node_id()])
    );
}

#[tokio::test]
async fn test_forum_message_floods_the_line() {
    let (a, b, c) = line();
    a.send_forum("general", "gm mesh", MessageKind::Text).await.unwrap();

    for node in [&b, &c] {
        match next_event(node).await.unwrap() {
            InboundEvent::Delivered(delivered) => {
                assert_eq!(delivered.plaintext, "gm mesh");
                assert_eq!(delivered.channel.as_deref(), Some("general"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_key_announce_enables_reply() {
    let (a, b, _c) = line();

    a.announce_key(Some("alice")).await.unwrap();
    assert!(matches!(
        next_event(&b).await.unwrap(),
        InboundEvent::KeyAnnounced { .. }
    ));

    b.send_direct(a.node_id(), "hi alice", MessageKind::Text).await.unwrap();
    match next_event(&a).await.unwrap() {
        InboundEvent::Delivered(delivered) => assert_eq!(delivered.plaintext, "hi alice"),
        other => panic!("unexpected event {:?}", other),
    }
}

struct RecordingServices;

#[async_trait]
impl GatewayServices for RecordingServices {
    async fn test_mqtt_connection(&self) -> MeshResult<()> {
        Ok(())
    }

    async fn broadcast_transaction(&self, tx_hex: &str) -> MeshResult<String> {
        Ok(format!("txid-{}", &tx_hex[..4]))
    }

    async fn redeem_cashu_token(&self, _token: &str) -> MeshResult<String> {
        Err(MeshError::ServiceUnavailable("mint offline".into()))
    }
}

fn recording_bridge() -> GatewayBridge {
    GatewayBridge::new(
        GatewayConfig {
            services: ServiceFlags {
                mempool: true,
                cashu: true,
                mqtt: true,
                lora: true,
            },
            ..GatewayConfig::default()
        },
        Arc::new(RecordingServices),
        Arc::new(RandomIdGenerator::new()),
    )
}

#[tokio::test]
async fn test_gateway_relays_transaction_from_the_mesh() {
    let (a, b, c) = line();
    let bridge = recording_bridge();
    let state = bridge.activate(bridge.initial_state()).await.state;

    a.add_peer_key(c.node_id(), &c.public_key_hex());
    a.send_direct(c.node_id(), "02000000deadbeef", MessageKind::BtcTx)
        .await
        .unwrap();
    next_event(&b).await.unwrap();

    let delivered = match next_event(&c).await.unwrap() {
        InboundEvent::Delivered(delivered) => delivered,
        other => panic!("unexpected event {:?}", other),
    };
    let update = bridge
        .handle_incoming_lora_message(state, &delivered.message, &delivered.plaintext)
        .await;

    assert!(update.outcome.is_ok());
    let job = update.state.job(&update.job_id.unwrap()).unwrap();
    assert_eq!(
        job.status,
        RelayJobStatus::Completed {
            reference: "txid-0200".into()
        }
    );
    assert_eq!(job.origin, Some(a.node_id()));

    // A failed redemption is still on record
    let update = bridge
        .relay_cashu_token(update.state, "cashuAeyJ0b2tlbiI", Some(a.node_id()))
        .await;
    assert!(update.outcome.is_err());
    assert_eq!(update.state.summary().failed_jobs, 1);
    assert_eq!(update.state.summary().completed_jobs, 1);
}

#[tokio::test]
async fn test_client_submits_payment_through_advertised_gateway() {
    let (_a, b, c) = line();
    let gateway = recording_bridge();
    let gateway_state = gateway.activate(gateway.initial_state()).await.state;
    c.set_gateway_advertised(gateway_state.is_relaying());
    c.announce_key(None).await.unwrap();

    let client = recording_bridge();
    let client_state = match next_event(&b).await.unwrap() {
        InboundEvent::KeyAnnounced {
            node_id, is_gateway, ..
        } => {
            assert_eq!(node_id, c.node_id());
            assert!(is_gateway);
            client.record_peer(client.initial_state(), node_id, is_gateway)
        }
        other => panic!("unexpected event {:?}", other),
    };

    let sender = &b;
    let update = client
        .submit_payment(client_state, MessageKind::BtcTx, "0200beef".into(), |gw, payload| async move {
            sender.send_direct(gw, &payload, MessageKind::BtcTx).await.map(|_| ())
        })
        .await;
    assert!(update.outcome.is_ok());
    let job = update.state.job(&update.job_id.unwrap()).unwrap();
    assert_eq!(
        job.status,
        RelayJobStatus::Completed {
            reference: c.node_id().to_string()
        }
    );

    let delivered = match next_event(&c).await.unwrap() {
        InboundEvent::Delivered(delivered) => delivered,
        other => panic!("unexpected event {:?}", other),
    };
    let update = gateway
        .handle_incoming_lora_message(gateway_state, &delivered.message, &delivered.plaintext)
        .await;
    let job = update.state.job(&update.job_id.unwrap()).unwrap();
    assert_eq!(
        job.status,
        RelayJobStatus::Completed {
            reference: "txid-0200".into()
        }
    );
    assert_eq!(job.origin, Some(b.node_id()));
}

#[tokio::test]
async fn test_ttl_limits_reach() {
    let hub = MemoryHub::new();
    let (ia, ta) = hub.join();
    let (_, tb) = hub.join();
    let (ic, tc) = hub.join();
    hub.partition(ia, ic);

    let mut short = config(0x1);
    short.router.default_ttl = 1;
    let a = MeshNode::new(&short, NodeIdentity::generate(), Arc::new(ta), Arc::new(RandomIdGenerator::new()));
    let b = MeshNode::new(&config(0x2), NodeIdentity::generate(), Arc::new(tb), Arc::new(RandomIdGenerator::new()));
    let c = MeshNode::new(&config(0x3), NodeIdentity::generate(), Arc::new(tc), Arc::new(RandomIdGenerator::new()));

    a.add_peer_key(c.node_id(), &c.public_key_hex());
    a.send_direct(c.node_id(), "too far", MessageKind::Text).await.unwrap();

    // B relays with the last hop of budget; C receives ttl 0 and drops it
    assert!(matches!(next_event(&b).await.unwrap(), InboundEvent::Relayed { ttl: 0, .. }));
    match next_event(&c).await.unwrap() {
        InboundEvent::Dropped { reason, .. } => assert_eq!(reason, DropReason::TtlExpired),
        other => panic!("unexpected event {:?}", other),
    }
}

#[test]
fn test_node_ids_are_distinct() {
    let (a, b, c) = line();
    assert_ne!(a.node_id(), b.node_id());
    assert_ne!(b.node_id(), c.node_id());
    assert_eq!(a.node_id(), NodeId(0xa));
}
