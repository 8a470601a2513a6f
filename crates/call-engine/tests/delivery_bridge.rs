//! Per-agent delivery over in-process connections

use call_engine::delivery::channel_connection;
use call_engine::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

async fn publish_assigned(broker: &InMemoryBroker, call_id: &str, agent: &str) {
    let call = AssignedCall::assign(&InboundCall::new(call_id, "+15550100"), AgentId::from(agent));
    broker
        .publish(topics::ASSIGNED_CALLS, call_id, serde_json::to_vec(&call).unwrap())
        .await
        .unwrap();
}

fn bridge_for(
    broker: &InMemoryBroker,
    registry: &BridgeRegistry,
    agent: &str,
    shutdown: &CancellationToken,
) -> DeliveryBridge {
    DeliveryBridge::new(
        AgentId::from(agent),
        Arc::new(broker.clone()),
        registry.clone(),
        shutdown.clone(),
    )
}

async fn next_call_id(peer: &mut call_engine::delivery::ChannelPeer) -> String {
    match tokio::time::timeout(Duration::from_secs(2), peer.recv()).await {
        Ok(Some(DeliveryMessage::NewCall { data })) => data.call_id,
        other => panic!("expected a new_call frame, got {:?}", other),
    }
}

#[tokio::test]
async fn test_two_agents_each_see_only_their_calls() {
    let broker = InMemoryBroker::new();
    let registry = BridgeRegistry::new();
    let shutdown = CancellationToken::new();

    let (sink1, source1, mut peer1) = channel_connection();
    let (sink2, source2, mut peer2) = channel_connection();
    let b1 = tokio::spawn(bridge_for(&broker, &registry, "100001", &shutdown).run(sink1, source1));
    let b2 = tokio::spawn(bridge_for(&broker, &registry, "100002", &shutdown).run(sink2, source2));

    match peer1.recv().await {
        Some(DeliveryMessage::Connected { message }) => {
            assert_eq!(message, "Connected as agent 100001")
        }
        other => panic!("expected connected frame, got {:?}", other),
    }
    assert!(matches!(peer2.recv().await, Some(DeliveryMessage::Connected { .. })));
    assert_eq!(registry.total(), 2);
    assert_eq!(broker.group_count(topics::ASSIGNED_CALLS), 2);

    publish_assigned(&broker, "c1", "100001").await;
    publish_assigned(&broker, "c2", "100002").await;
    publish_assigned(&broker, "c3", "100001").await;

    assert_eq!(next_call_id(&mut peer1).await, "c1");
    assert_eq!(next_call_id(&mut peer1).await, "c3");
    assert_eq!(next_call_id(&mut peer2).await, "c2");

    shutdown.cancel();
    let s1 = b1.await.unwrap();
    let s2 = b2.await.unwrap();

    assert_eq!((s1.delivered, s1.skipped), (2, 1));
    assert_eq!((s2.delivered, s2.skipped), (1, 2));
    assert_eq!(registry.total(), 0);
    assert_eq!(broker.group_count(topics::ASSIGNED_CALLS), 0);
}

#[tokio::test]
async fn test_calls_published_before_connect_are_not_replayed() {
    let broker = InMemoryBroker::new();
    let registry = BridgeRegistry::new();
    let shutdown = CancellationToken::new();

    publish_assigned(&broker, "old", "100001").await;

    let (sink, source, mut peer) = channel_connection();
    let task = tokio::spawn(bridge_for(&broker, &registry, "100001", &shutdown).run(sink, source));
    assert!(matches!(peer.recv().await, Some(DeliveryMessage::Connected { .. })));

    publish_assigned(&broker, "new", "100001").await;
    assert_eq!(next_call_id(&mut peer).await, "new");

    peer.close();
    let summary = task.await.unwrap();
    assert_eq!(summary.delivered, 1);
    assert_eq!(summary.reason, CloseReason::PeerClosed);
}

#[tokio::test]
async fn test_second_connection_for_same_agent_gets_its_own_group() {
    let broker = InMemoryBroker::new();
    let registry = BridgeRegistry::new();
    let shutdown = CancellationToken::new();

    let (sink_a, source_a, mut peer_a) = channel_connection();
    let (sink_b, source_b, mut peer_b) = channel_connection();
    let bridge_a = bridge_for(&broker, &registry, "100001", &shutdown);
    let bridge_b = bridge_for(&broker, &registry, "100001", &shutdown);
    assert_ne!(bridge_a.group_id(), bridge_b.group_id());

    let task_a = tokio::spawn(bridge_a.run(sink_a, source_a));
    let task_b = tokio::spawn(bridge_b.run(sink_b, source_b));
    assert!(matches!(peer_a.recv().await, Some(DeliveryMessage::Connected { .. })));
    assert!(matches!(peer_b.recv().await, Some(DeliveryMessage::Connected { .. })));
    assert_eq!(registry.connections(&AgentId::from("100001")), 2);

    publish_assigned(&broker, "c1", "100001").await;
    assert_eq!(next_call_id(&mut peer_a).await, "c1");
    assert_eq!(next_call_id(&mut peer_b).await, "c1");

    peer_a.close();
    task_a.await.unwrap();
    assert_eq!(registry.connections(&AgentId::from("100001")), 1);
    assert_eq!(broker.group_count(topics::ASSIGNED_CALLS), 1);

    shutdown.cancel();
    task_b.await.unwrap();
    assert_eq!(broker.group_count(topics::ASSIGNED_CALLS), 0);
}

#[tokio::test]
async fn test_malformed_records_are_skipped() {
    let broker = InMemoryBroker::new();
    let registry = BridgeRegistry::new();
    let shutdown = CancellationToken::new();

    let (sink, source, mut peer) = channel_connection();
    let task = tokio::spawn(bridge_for(&broker, &registry, "100001", &shutdown).run(sink, source));
    assert!(matches!(peer.recv().await, Some(DeliveryMessage::Connected { .. })));

    broker
        .publish(topics::ASSIGNED_CALLS, "bad", b"not json".to_vec())
        .await
        .unwrap();
    publish_assigned(&broker, "c1", "100001").await;
    assert_eq!(next_call_id(&mut peer).await, "c1");

    shutdown.cancel();
    let summary = task.await.unwrap();
    assert_eq!(summary.malformed, 1);
    assert_eq!(summary.delivered, 1);
    assert_eq!(summary.reason, CloseReason::Shutdown);
}

#[tokio::test]
async fn test_broker_shutdown_ends_bridge() {
    let broker = InMemoryBroker::new();
    let registry = BridgeRegistry::new();

    let (sink, source, mut peer) = channel_connection();
    let task = tokio::spawn(
        bridge_for(&broker, &registry, "100001", &CancellationToken::new()).run(sink, source),
    );
    assert!(matches!(peer.recv().await, Some(DeliveryMessage::Connected { .. })));

    broker.shutdown();
    let summary = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(summary.reason, CloseReason::StreamEnded);
    assert_eq!(registry.total(), 0);
}
