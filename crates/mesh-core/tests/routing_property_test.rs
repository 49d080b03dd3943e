// Property-based tests for flood routing

use mesh_core::crypto::EncryptedPayload;
use mesh_core::{Destination, DropReason, MeshMessage, MeshRouter, MessageKind, NodeId, RoutingDecision};
use proptest::prelude::*;
use shared::RouterConfig;

const ME: NodeId = NodeId(0xabcd);

fn message(msg_id: String, from: u64, to: Destination, ttl: i64, relays: Vec<u64>) -> MeshMessage {
    let mut message = MeshMessage::new(
        msg_id,
        NodeId(from),
        to,
        MessageKind::Text,
        EncryptedPayload {
            v: 1,
            nonce: "AAAAAAAAAAAAAAAA".into(),
            ciphertext: "AAAA".into(),
        },
        10,
    );
    message.ttl = ttl;
    message.route.extend(relays.into_iter().map(NodeId));
    message.hop_count = (message.route.len() - 1) as u32;
    message
}

fn destination() -> impl Strategy<Value = Destination> {
    prop_oneof![
        Just(Destination::Broadcast),
        Just(Destination::Node(ME)),
        (1u64..1000).prop_map(|n| Destination::Node(NodeId(n))),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// A fresh message is delivered or relayed once, then always dropped
    #[test]
    fn prop_second_arrival_is_duplicate(
        msg_id in "[0-9a-f]{32}",
        from in 1u64..1000,
        to in destination(),
        ttl in 1i64..=10,
    ) {
        let router = MeshRouter::new(ME, RouterConfig::default());
        let msg = message(msg_id, from, to, ttl, vec![]);

        let first = router.process_incoming_message(&msg);
        prop_assert!(matches!(first, RoutingDecision::Deliver | RoutingDecision::Relay));
        prop_assert_eq!(
            router.process_incoming_message(&msg),
            RoutingDecision::Drop(DropReason::Duplicate)
        );
    }

    /// Exhausted TTL is dropped whatever the destination
    #[test]
    fn prop_non_positive_ttl_is_dropped(
        msg_id in "[0-9a-f]{32}",
        to in destination(),
        ttl in -1000i64..=0,
    ) {
        let router = MeshRouter::new(ME, RouterConfig::default());
        let msg = message(msg_id, 7, to, ttl, vec![]);
        prop_assert_eq!(
            router.process_incoming_message(&msg),
            RoutingDecision::Drop(DropReason::TtlExpired)
        );
    }

    /// Relaying copies; the input keeps its TTL, hop count and route
    #[test]
    fn prop_prepare_relay_is_pure(
        ttl in 1i64..=10,
        relays in prop::collection::vec(1u64..1000, 0..8),
    ) {
        let router = MeshRouter::new(ME, RouterConfig::default());
        let msg = message("00".repeat(16), 3, Destination::Node(NodeId(4)), ttl, relays);
        let before = msg.clone();

        let relayed = router.prepare_relay(&msg);

        prop_assert_eq!(&msg, &before);
        prop_assert_eq!(relayed.ttl, msg.ttl - 1);
        prop_assert_eq!(relayed.hop_count, msg.hop_count + 1);
        prop_assert_eq!(relayed.route.len(), msg.route.len() + 1);
        prop_assert_eq!(relayed.route.last(), Some(&ME));
    }

    /// Inbound TTLs always land in [0, max_ttl]
    #[test]
    fn prop_ingested_ttl_is_clamped(ttl in any::<i64>()) {
        let msg = message("11".repeat(16), 3, Destination::Broadcast, ttl, vec![]);
        let parsed = MeshMessage::from_wire(&msg.to_wire().unwrap(), 10).unwrap();
        prop_assert!((0..=10).contains(&parsed.ttl));
    }
}
