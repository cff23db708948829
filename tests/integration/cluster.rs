//! Consensus scenarios over the in-process router and real TCP.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ravel::config::RaftConfig;
use ravel::fsm::{Applied, Command, FailureKind};
use ravel::graph::{Graph, MemoryGraph};
use ravel::model::{props, Properties, Value};
use ravel::raft::{ClusterError, Coordinator, LocalRouter, NodeId, TcpNetwork};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tracing::info_span;

const WAIT: Duration = Duration::from_secs(10);

fn settings() -> RaftConfig {
    RaftConfig {
        heartbeat_interval_ms: 50,
        election_timeout_min_ms: 200,
        election_timeout_max_ms: 400,
        snapshot_logs_since_last: 5,
        propose_timeout_ms: 5000,
        rpc_timeout_ms: 1000,
    }
}

async fn local_member(router: &LocalRouter, id: NodeId, dir: &Path) -> Coordinator {
    let coordinator = Coordinator::start(
        id,
        format!("node-{id}"),
        Arc::new(MemoryGraph::new()),
        &dir.join(format!("raft-{id}")),
        &settings(),
        router.clone(),
        info_span!("node", id),
    )
    .await
    .unwrap();
    router.register(id, coordinator.raft().clone());
    coordinator
}

async fn wait_for_voters(coordinator: &Coordinator, expected: &[NodeId]) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while coordinator.stats().voters != expected {
        assert!(tokio::time::Instant::now() < deadline, "voters stuck at {:?}", coordinator.stats().voters);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn last_applied(coordinator: &Coordinator) -> u64 {
    coordinator.stats().last_applied.unwrap_or(0)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_node_applies_proposals() {
    ravel::telemetry::init_for_tests();
    let dir = TempDir::new().unwrap();
    let router = LocalRouter::new();
    let node = local_member(&router, 1, dir.path()).await;
    node.bootstrap().await.unwrap();
    node.bootstrap().await.unwrap();
    assert_eq!(node.wait_for_leader(WAIT).await.unwrap(), 1);
    assert!(node.is_leader());

    let applied = node
        .propose(&Command::add_node("x", "1", props([("a", 1i64)])))
        .await
        .unwrap();
    assert!(matches!(applied, Applied::Node(ref n) if n.id == "1"));
    assert_eq!(node.graph().get_node("x", "1").unwrap().properties["a"], Value::Int(1));

    let err = node
        .propose(&Command::delete_node("x", "missing"))
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::Apply(ref f) if f.kind == FailureKind::NotFound));

    let stats = node.stats();
    assert_eq!(stats.leader_id, Some(1));
    assert_eq!(stats.leader_addr.as_deref(), Some("node-1"));
    assert_eq!(stats.voters, vec![1]);
    node.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_nodes_replicate_and_redirect() {
    ravel::telemetry::init_for_tests();
    let dir = TempDir::new().unwrap();
    let router = LocalRouter::new();
    let leader = local_member(&router, 1, dir.path()).await;
    let second = local_member(&router, 2, dir.path()).await;
    let third = local_member(&router, 3, dir.path()).await;

    leader.bootstrap().await.unwrap();
    leader.wait_for_leader(WAIT).await.unwrap();
    leader.join(2, "node-2").await.unwrap();
    leader.join(3, "node-3").await.unwrap();
    leader.join(3, "node-3").await.unwrap();
    wait_for_voters(&leader, &[1, 2, 3]).await;

    for i in 0..12 {
        leader
            .propose(&Command::add_node("x", format!("{i}"), props([("a", i as i64)])))
            .await
            .unwrap();
    }
    let index = last_applied(&leader);
    for follower in [&second, &third] {
        follower.wait_for_applied(index, WAIT).await.unwrap();
        assert_eq!(follower.graph().size().unwrap(), 12);
        assert_eq!(follower.graph().get_node("x", "1").unwrap().properties["a"], Value::Int(1));
    }

    let err = second
        .propose(&Command::add_node("x", "direct", Properties::new()))
        .await
        .unwrap_err();
    match err {
        ClusterError::NotLeader { leader_id, leader_addr } => {
            assert_eq!(leader_id, Some(1));
            assert_eq!(leader_addr.as_deref(), Some("node-1"));
        }
        other => panic!("expected NotLeader, got {other}"),
    }
    assert!(matches!(second.join(4, "node-4").await, Err(ClusterError::NotLeader { .. })));

    leader.leave(3).await.unwrap();
    wait_for_voters(&leader, &[1, 2]).await;

    for node in [&leader, &second, &third] {
        node.shutdown().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restart_rebuilds_graph_from_log_and_snapshot() {
    ravel::telemetry::init_for_tests();
    let dir = TempDir::new().unwrap();
    let router = LocalRouter::new();
    let index = {
        let node = local_member(&router, 1, dir.path()).await;
        node.bootstrap().await.unwrap();
        node.wait_for_leader(WAIT).await.unwrap();
        for i in 0..8 {
            node.propose(&Command::add_node("x", format!("{i}"), Properties::new()))
                .await
                .unwrap();
        }
        let index = last_applied(&node);
        node.shutdown().await.unwrap();
        router.unregister(1);
        index
    };

    let node = local_member(&router, 1, dir.path()).await;
    node.wait_for_leader(WAIT).await.unwrap();
    node.wait_for_applied(index, WAIT).await.unwrap();
    assert_eq!(node.graph().size().unwrap(), 8);
    node.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tcp_members_join_through_any_node() {
    ravel::telemetry::init_for_tests();
    let dir = TempDir::new().unwrap();
    let mut members = Vec::new();
    for id in 1..=2u64 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let graph: Arc<dyn Graph> = Arc::new(MemoryGraph::new());
        let node = Arc::new(
            Coordinator::start(
                id,
                addr,
                graph,
                &dir.path().join(format!("raft-{id}")),
                &settings(),
                TcpNetwork::new(Duration::from_secs(1)),
                info_span!("node", id),
            )
            .await
            .unwrap(),
        );
        node.serve(listener);
        members.push(node);
    }
    let (first, second) = (&members[0], &members[1]);
    first.bootstrap().await.unwrap();
    first.wait_for_leader(WAIT).await.unwrap();
    second.join_cluster(first.addr()).await.unwrap();

    first
        .propose(&Command::add_node("x", "1", props([("via", "tcp")])))
        .await
        .unwrap();
    second.wait_for_applied(last_applied(first), WAIT).await.unwrap();
    assert_eq!(
        second.graph().get_node("x", "1").unwrap().properties["via"],
        Value::from("tcp")
    );
    assert_eq!(second.leader().map(|(id, _)| id), Some(1));

    for node in &members {
        node.shutdown().await.unwrap();
    }
}
