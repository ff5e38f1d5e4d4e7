//! Broadcast Integration Test
//!
//! 本地广播测试无需外部依赖。NATS 测试需要一个运行中的 NATS 服务器：
//!
//!   docker run -d -p 4222:4222 nats:2
//!   TEST_NATS_URL=nats://localhost:4222 cargo test --package armada-core --test broadcast_integration -- --ignored --nocapture

use armada_core::broadcast::{Broadcast, BroadcastOptions, LocalBroadcast, MessageAttributes, NatsBroadcast};
use armada_core::config::NatsConfig;
use armada_core::constants::{ATTR_ACCOUNT_ID, ATTR_TYPE};
use armada_core::core_types::NodeId;
use armada_core::eventbus::SubscriptionOptions;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
struct AgentEvent {
    account: String,
    agent: String,
    kind: String,
}

fn agent_event(account: &str, agent: &str, kind: &str) -> AgentEvent {
    AgentEvent {
        account: account.to_string(),
        agent: agent.to_string(),
        kind: kind.to_string(),
    }
}

fn tenant_options() -> BroadcastOptions<AgentEvent> {
    BroadcastOptions::new()
        .with_routing(
            |e: &AgentEvent| e.account.clone(),
            |attrs: &MessageAttributes| attrs.account_id().map(str::to_string),
        )
        .with_attribute_processor(
            |e: &AgentEvent, attrs: &mut MessageAttributes| {
                attrs.insert(ATTR_ACCOUNT_ID, e.account.clone());
                attrs.insert(ATTR_TYPE, e.kind.clone());
            },
            |attrs: &MessageAttributes| attrs.message_type() != Some("internal"),
        )
        .with_json_parse()
}

#[tokio::test]
async fn test_local_broadcast_tenant_isolation() {
    let token = CancellationToken::new();
    let broadcast = LocalBroadcast::new("agent-events", NodeId::new("node-1"), tenant_options(), token.clone());

    let mut acme = broadcast
        .subscribe_routed(&MessageAttributes::new().with(ATTR_ACCOUNT_ID, "acme"))
        .unwrap();
    let mut globex = broadcast
        .subscribe_routed(&MessageAttributes::new().with(ATTR_ACCOUNT_ID, "globex"))
        .unwrap();

    let producer = broadcast.producer();
    producer.send(agent_event("acme", "a1", "connected")).await;
    producer.send(agent_event("acme", "a1", "internal")).await;
    producer.send(agent_event("globex", "g1", "connected")).await;
    producer.send(agent_event("initech", "i1", "connected")).await;
    producer.send(agent_event("acme", "a2", "disconnected")).await;

    let got: Vec<AgentEvent> = tokio::time::timeout(Duration::from_secs(2), (&mut acme).take(2).collect())
        .await
        .unwrap();
    assert_eq!(
        got,
        vec![
            agent_event("acme", "a1", "connected"),
            agent_event("acme", "a2", "disconnected"),
        ]
    );
    let got = tokio::time::timeout(Duration::from_secs(2), globex.recv())
        .await
        .unwrap();
    assert_eq!(got, Some(agent_event("globex", "g1", "connected")));

    token.cancel();
}

#[tokio::test]
async fn test_local_broadcast_many_subscribers() {
    let token = CancellationToken::new();
    let broadcast: LocalBroadcast<u64> =
        LocalBroadcast::new("fanout", NodeId::new("node-1"), BroadcastOptions::new(), token.clone());

    let consumer = broadcast.consumer();
    let mut subs: Vec<_> = (0..8)
        .map(|_| consumer.subscribe(SubscriptionOptions::unbounded()))
        .collect();

    for i in 0..50u64 {
        broadcast.producer().send(i).await;
    }

    for sub in subs.iter_mut() {
        let mut seen = HashSet::new();
        for _ in 0..50 {
            let v = tokio::time::timeout(Duration::from_secs(2), sub.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(seen.insert(v));
        }
    }
    token.cancel();
}

fn get_test_nats_url() -> String {
    env::var("TEST_NATS_URL").unwrap_or_else(|_| {
        panic!(
            "TEST_NATS_URL environment variable not set.\n\
             Start NATS first: docker run -d -p 4222:4222 nats:2\n\
             Then run: TEST_NATS_URL=nats://localhost:4222 cargo test -- --ignored"
        )
    })
}

#[tokio::test]
#[ignore]
async fn test_nats_broadcast_reaches_every_node() {
    let url = get_test_nats_url();
    let token = CancellationToken::new();
    let config = NatsConfig {
        url,
        subject_prefix: format!("armada.test.{}", uuid::Uuid::new_v4().simple()),
    };

    let client_a = armada_core::nats::connect(&config).await.unwrap();
    let client_b = armada_core::nats::connect(&config).await.unwrap();

    let node_a = NatsBroadcast::new(
        client_a,
        &config.subject_prefix,
        "agent-events",
        NodeId::new("node-a"),
        tenant_options(),
        token.clone(),
    )
    .await
    .unwrap();
    let node_b = NatsBroadcast::new(
        client_b,
        &config.subject_prefix,
        "agent-events",
        NodeId::new("node-b"),
        tenant_options(),
        token.clone(),
    )
    .await
    .unwrap();

    let attrs = MessageAttributes::new().with(ATTR_ACCOUNT_ID, "acme");
    let mut on_a = node_a.subscribe_routed(&attrs).unwrap();
    let mut on_b = node_b.subscribe_routed(&attrs).unwrap();

    node_a.producer().send(agent_event("acme", "a1", "connected")).await;

    for sub in [&mut on_a, &mut on_b] {
        let env = tokio::time::timeout(Duration::from_secs(5), sub.recv_envelope())
            .await
            .expect("message arrives")
            .expect("subscription open");
        assert_eq!(env.message, agent_event("acme", "a1", "connected"));
        assert_eq!(env.attributes.origin(), Some("node-a"));
    }

    token.cancel();
}
