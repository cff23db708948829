//! Replaying one command log on independent replicas.

use std::sync::Arc;

use ravel::fsm::{ApplyError, Command, FailureKind, GraphFsm, GraphSnapshot, NodePayload};
use ravel::graph::{Graph, MemoryGraph};
use ravel::model::{props, Direction, EntityKey, Properties};
use ravel::storage::{KvGraph, KvOptions};

fn log() -> Vec<Vec<u8>> {
    let u1 = EntityKey::new("user", "u1");
    let u2 = EntityKey::new("user", "u2");
    let b1 = EntityKey::new("business", "b1");
    let commands = vec![
        Command::bulk_add(vec![
            NodePayload::new("user", "u1", props([("name", "Ann")])),
            NodePayload::new("user", "u2", props([("name", "Bo")])),
            NodePayload::new("business", "b1", Properties::new()),
        ]),
        Command::add_relationship(u1.clone(), Direction::Outgoing, "works_at", b1.clone(), Properties::new()),
        Command::add_relationship(b1.clone(), Direction::Incoming, "works_at", u2.clone(), props([("since", 2021i64)])),
        Command::add_relationship(u1.clone(), Direction::Outgoing, "knows", u2.clone(), Properties::new()),
        Command::set_node_properties("user", "u2", props([("name", "Bob")])),
        Command::delete_node("user", "ghost"),
        Command::bulk_set(vec![NodePayload::new("business", "b1", props([("city", "Oslo")]))]),
        Command::delete_relationship(
            u1.clone(),
            Direction::Outgoing,
            "knows",
            ravel::model::relationship_id(&u1, "knows", &u2),
        ),
        Command::add_node("user", "u3", Properties::new()),
        Command::bulk_delete(vec![EntityKey::new("user", "u3")]),
    ];
    commands.iter().map(|c| c.encode().unwrap()).collect()
}

fn replay(fsm: &GraphFsm, entries: &[Vec<u8>]) -> Vec<Option<FailureKind>> {
    entries
        .iter()
        .map(|entry| fsm.apply(entry).err().map(|err| err.to_failure().kind))
        .collect()
}

fn normalized(graph: &dyn Graph) -> GraphSnapshot {
    let mut snapshot = GraphSnapshot::capture(graph).unwrap();
    snapshot.nodes.sort_by(|a, b| (&a.type_name, &a.id).cmp(&(&b.type_name, &b.id)));
    snapshot
        .relationships
        .sort_by(|a, b| (&a.relation_type, &a.id).cmp(&(&b.relation_type, &b.id)));
    snapshot
}

#[test]
fn replicas_fed_the_same_log_converge() {
    let entries = log();
    let first = GraphFsm::new(Arc::new(MemoryGraph::new()));
    let second = GraphFsm::new(Arc::new(MemoryGraph::new()));

    let outcomes = replay(&first, &entries);
    assert_eq!(outcomes, replay(&second, &entries));
    assert_eq!(outcomes[5], Some(FailureKind::NotFound));
    assert_eq!(outcomes.iter().filter(|o| o.is_some()).count(), 1);

    assert_eq!(first.snapshot().unwrap(), second.snapshot().unwrap());
    assert_eq!(first.graph().size().unwrap(), 3);
    let rel = first
        .graph()
        .get_relationship("works_at", &ravel::model::relationship_id(
            &EntityKey::new("user", "u2"),
            "works_at",
            &EntityKey::new("business", "b1"),
        ))
        .unwrap();
    assert_eq!(rel.source.id, "u2");
    assert_eq!(rel.properties["since"], ravel::model::Value::Int(2021));
}

#[test]
fn memory_and_durable_replicas_agree() {
    let entries = log();
    let dir = tempfile::tempdir().unwrap();
    let options = KvOptions {
        cache_capacity: 2,
        gc_interval: None,
        ..KvOptions::default()
    };
    let memory = GraphFsm::new(Arc::new(MemoryGraph::new()));
    let durable = GraphFsm::new(Arc::new(KvGraph::open(dir.path().join("g.redb"), options).unwrap()));

    assert_eq!(replay(&memory, &entries), replay(&durable, &entries));
    assert_eq!(normalized(memory.graph().as_ref()), normalized(durable.graph().as_ref()));
}

#[test]
fn restored_replica_continues_from_snapshot() {
    let entries = log();
    let (head, tail) = entries.split_at(4);
    let leader = GraphFsm::new(Arc::new(MemoryGraph::new()));
    replay(&leader, head);
    let image = leader.snapshot().unwrap().to_bytes().unwrap();
    replay(&leader, tail);

    let newcomer = GraphFsm::new(Arc::new(MemoryGraph::new()));
    newcomer.restore(&GraphSnapshot::from_bytes(&image).unwrap()).unwrap();
    replay(&newcomer, tail);

    assert_eq!(normalized(leader.graph().as_ref()), normalized(newcomer.graph().as_ref()));
}

#[test]
fn unknown_method_halts_the_replica() {
    let fsm = GraphFsm::new(Arc::new(MemoryGraph::new()));
    fsm.apply(&Command::add_node("x", "1", Properties::new()).encode().unwrap())
        .unwrap();

    let err = fsm
        .apply(br#"{"method":"merge-nodes","payload":{"a":"1","b":"2"}}"#)
        .unwrap_err();
    assert!(err.is_fatal());

    let later = fsm
        .apply(&Command::add_node("x", "2", Properties::new()).encode().unwrap())
        .unwrap_err();
    assert!(matches!(later, ApplyError::Halted(_)));
    assert_eq!(fsm.graph().size().unwrap(), 1);
    assert_eq!(fsm.halted().as_deref(), Some("merge-nodes"));
}
