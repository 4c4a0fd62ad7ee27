//! Channel pool tests against mock nodes.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use common::{MockNode, LOCAL_DC};
use cql_client::core::protocol::{body, Opcode};
use cql_client::{
    ChannelConfig, ChannelPool, ConstantReconnectionPolicy, Distance, DriverConfig, NodeInfo,
    NodeRegistry, NodeState, ProtocolVersion, ReconnectionPolicy,
};

struct Fixture {
    registry: Arc<NodeRegistry>,
    pool: Arc<ChannelPool>,
}

fn fixture(node: &MockNode, distance: Distance) -> Fixture {
    fixture_at(node.address(), distance, Duration::from_millis(50))
}

fn fixture_at(address: SocketAddr, distance: Distance, reconnect_delay: Duration) -> Fixture {
    let config = DriverConfig::builder()
        .network(|n| n.connect_timeout(Duration::from_millis(500)))
        .pool(|p| {
            p.local_size(2)
                .remote_size(1)
                .drain_timeout(Duration::from_millis(200))
        })
        .build()
        .unwrap();
    let registry = Arc::new(NodeRegistry::new());
    let info = NodeInfo::new(address).with_datacenter(LOCAL_DC);
    let added = registry.add_node(info, distance);
    let reconnection: Arc<dyn ReconnectionPolicy> =
        Arc::new(ConstantReconnectionPolicy::new(reconnect_delay));

    let pool = ChannelPool::new(
        added.id(),
        address,
        Arc::clone(&registry),
        config.pool().clone(),
        ChannelConfig::from_config(&config, ProtocolVersion::V4),
        reconnection,
    );
    Fixture { registry, pool }
}

fn state(fixture: &Fixture) -> NodeState {
    fixture.registry.get(fixture.pool.node()).unwrap().state()
}

#[tokio::test]
async fn test_local_pool_reaches_target_size() {
    common::init_tracing();
    let node = MockNode::start().await;
    let fixture = fixture(&node, Distance::Local);
    assert_eq!(state(&fixture), NodeState::Unknown);

    let size = fixture.pool.ensure_size().await.unwrap();
    assert_eq!(size, 2);
    assert_eq!(node.connections(), 2);
    assert!(fixture.pool.is_usable());
    assert_eq!(state(&fixture), NodeState::Up);

    assert_eq!(fixture.pool.ensure_size().await.unwrap(), 2);
    assert_eq!(node.connections(), 2);
}

#[tokio::test]
async fn test_remote_pool_opens_one_channel() {
    let node = MockNode::start().await;
    let fixture = fixture(&node, Distance::Remote);
    assert_eq!(fixture.pool.ensure_size().await.unwrap(), 1);
    assert_eq!(node.connections(), 1);
}

#[tokio::test]
async fn test_ignored_node_gets_no_channels() {
    let node = MockNode::start().await;
    let fixture = fixture(&node, Distance::Local);
    fixture.pool.ensure_size().await.unwrap();

    fixture.registry.set_distance(fixture.pool.node(), Distance::Ignored);
    assert_eq!(fixture.pool.target_size(), 0);
    assert_eq!(fixture.pool.ensure_size().await.unwrap(), 0);
    assert!(!fixture.pool.is_usable());
    assert!(common::eventually(Duration::from_secs(1), || node.open_connections() == 0).await);
}

#[tokio::test]
async fn test_shrinking_pool_keeps_busy_channel() {
    let node = MockNode::start().await;
    node.set_reply(common::QueryReply::Delay(Duration::from_millis(100)));
    let fixture = fixture(&node, Distance::Local);
    fixture.pool.ensure_size().await.unwrap();

    let busy = fixture.pool.pick_channel().unwrap();
    let pending = busy
        .send(Opcode::Query, body::query_body("SELECT 1", 0x0001))
        .unwrap();

    fixture.registry.set_distance(fixture.pool.node(), Distance::Remote);
    assert_eq!(fixture.pool.ensure_size().await.unwrap(), 1);
    assert_eq!(fixture.pool.channels()[0].id(), busy.id());

    let frame = pending.await.unwrap();
    assert_eq!(frame.opcode, Opcode::Result);
}

#[tokio::test]
async fn test_shrinking_with_closed_channels_keeps_target() {
    let node = MockNode::start().await;
    let fixture = fixture(&node, Distance::Local);
    fixture.pool.ensure_size().await.unwrap();

    fixture.pool.channels()[0].close("closed by test");
    fixture.registry.set_distance(fixture.pool.node(), Distance::Remote);
    assert_eq!(fixture.pool.ensure_size().await.unwrap(), 1);
    assert!(fixture.pool.channels().iter().all(|c| c.is_open()));

    fixture.pool.channels()[0].close("closed by test");
    fixture.registry.set_distance(fixture.pool.node(), Distance::Ignored);
    assert_eq!(fixture.pool.ensure_size().await.unwrap(), 0);
    assert_eq!(fixture.pool.size(), 0);
}

#[tokio::test]
async fn test_pick_channel_prefers_least_loaded() {
    let node = MockNode::start().await;
    node.set_reply(common::QueryReply::Silent);
    let fixture = fixture(&node, Distance::Local);
    fixture.pool.ensure_size().await.unwrap();

    let first = fixture.pool.pick_channel().unwrap();
    let _pending = first
        .send(Opcode::Query, body::query_body("SELECT 1", 0x0001))
        .unwrap();
    let second = fixture.pool.pick_channel().unwrap();
    assert_ne!(first.id(), second.id());
}

#[tokio::test]
async fn test_unreachable_node_goes_down() {
    let address = common::unused_address().await;
    let fixture = fixture_at(address, Distance::Local, Duration::from_secs(10));

    assert!(fixture.pool.ensure_size().await.is_err());
    assert_eq!(state(&fixture), NodeState::Down);
    assert!(fixture.pool.is_reconnecting());
    fixture.pool.close();
}

#[tokio::test]
async fn test_lost_channels_mark_node_down_and_reconnect() {
    let node = MockNode::start().await;
    let fixture = fixture(&node, Distance::Local);
    let mut events = fixture.registry.subscribe();
    fixture.pool.ensure_size().await.unwrap();

    node.set_reply(common::QueryReply::Close);
    for channel in fixture.pool.channels() {
        let _ = channel
            .send(Opcode::Query, body::query_body("SELECT 1", 0x0001))
            .unwrap()
            .await;
    }
    node.set_reply(common::QueryReply::Void);

    let mut saw_down = false;
    let mut saw_up_again = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !(saw_down && saw_up_again) {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .unwrap()
            .unwrap();
        if let cql_client::NodeEvent::StateChanged { new, .. } = event {
            match new {
                NodeState::Down => saw_down = true,
                NodeState::Up if saw_down => saw_up_again = true,
                _ => {}
            }
        }
    }
    assert!(common::eventually(Duration::from_secs(2), || fixture.pool.size() == 2).await);
}

#[tokio::test]
async fn test_forced_down_node_drains_pool() {
    let node = MockNode::start().await;
    let fixture = fixture(&node, Distance::Local);
    fixture.pool.ensure_size().await.unwrap();

    assert!(fixture.registry.force_down(fixture.pool.node()));
    assert_eq!(fixture.pool.ensure_size().await.unwrap(), 0);
    assert_eq!(state(&fixture), NodeState::ForcedDown);

    assert!(fixture.registry.force_up(fixture.pool.node()));
    assert_eq!(state(&fixture), NodeState::Unknown);
    assert_eq!(fixture.pool.ensure_size().await.unwrap(), 2);
    assert_eq!(state(&fixture), NodeState::Up);
}

#[tokio::test]
async fn test_close_fails_in_flight_requests() {
    let node = MockNode::start().await;
    node.set_reply(common::QueryReply::Silent);
    let fixture = fixture(&node, Distance::Local);
    fixture.pool.ensure_size().await.unwrap();

    let pending = fixture
        .pool
        .pick_channel()
        .unwrap()
        .send(Opcode::Query, body::query_body("SELECT 1", 0x0001))
        .unwrap();
    fixture.pool.close();

    assert!(fixture.pool.is_closed());
    assert!(pending.await.is_err());
    assert!(fixture.pool.pick_channel().is_err());
    assert_eq!(fixture.pool.ensure_size().await.unwrap(), 0);
}
