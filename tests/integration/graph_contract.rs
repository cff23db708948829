//! Contract scenarios run against every backend.

use std::collections::BTreeSet;
use std::sync::Arc;

use ravel::graph::{page_nodes, page_relationships, Graph, MemoryGraph};
use ravel::model::{props, Direction, EntityKey, Node, Properties, Value};
use ravel::storage::{KvGraph, KvOptions};
use ravel::GraphError;
use tempfile::TempDir;

struct Backend {
    name: &'static str,
    graph: Arc<dyn Graph>,
    _dir: Option<TempDir>,
}

fn backends() -> Vec<Backend> {
    let dir = tempfile::tempdir().unwrap();
    let options = KvOptions {
        cache_capacity: 8,
        gc_interval: None,
        ..KvOptions::default()
    };
    let kv = KvGraph::open(dir.path().join("graph.redb"), options).unwrap();
    vec![
        Backend {
            name: "memory",
            graph: Arc::new(MemoryGraph::new()),
            _dir: None,
        },
        Backend {
            name: "kv",
            graph: Arc::new(kv),
            _dir: Some(dir),
        },
    ]
}

fn ids(nodes: &[Node]) -> BTreeSet<String> {
    nodes.iter().map(|n| n.id.clone()).collect()
}

#[test]
fn works_at_is_visible_from_both_endpoints() {
    for Backend { name, graph, .. } in backends() {
        let u1 = graph.add_node("user", "u1", props([("name", "Ann")])).unwrap();
        let b1 = graph.add_node("business", "b1", Properties::new()).unwrap();
        u1.add_relationship(graph.as_ref(), Direction::Outgoing, "works_at", "r1", &b1.key(), Properties::new())
            .unwrap();

        let out = page_relationships(graph.as_ref(), &u1.key(), Direction::Outgoing, "works_at", 0, 10).unwrap();
        assert_eq!(out.len(), 1, "{name}");
        assert_eq!(out[0].id, "r1", "{name}");
        assert_eq!(out[0].target.id, "b1", "{name}");

        let inc = page_relationships(graph.as_ref(), &b1.key(), Direction::Incoming, "works_at", 0, 10).unwrap();
        assert_eq!(inc.len(), 1, "{name}");
        assert_eq!(inc[0].id, "r1", "{name}");
        assert_eq!(inc[0].source.id, "u1", "{name}");

        let source = inc[0].source_node(graph.as_ref()).unwrap();
        assert_eq!(source.properties["name"], Value::from("Ann"), "{name}");
    }
}

#[test]
fn deleting_a_node_removes_every_mirror() {
    for Backend { name, graph, .. } in backends() {
        let hub = graph.add_node("n", "hub", Properties::new()).unwrap();
        let a = graph.add_node("n", "a", Properties::new()).unwrap();
        let b = graph.add_node("m", "b", Properties::new()).unwrap();
        hub.add_relationship(graph.as_ref(), Direction::Outgoing, "r", "x1", &a.key(), Properties::new())
            .unwrap();
        hub.add_relationship(graph.as_ref(), Direction::Incoming, "r", "x2", &b.key(), Properties::new())
            .unwrap();
        hub.add_relationship(graph.as_ref(), Direction::Outgoing, "loop", "x3", &hub.key(), Properties::new())
            .unwrap();

        graph.del_node("n", "hub").unwrap();

        assert!(graph.get_node("n", "hub").unwrap_err().is_not_found(), "{name}");
        for id in ["x1", "x2"] {
            assert!(graph.get_relationship("r", id).unwrap_err().is_not_found(), "{name}");
        }
        assert!(graph.get_relationship("loop", "x3").is_err(), "{name}");
        assert!(page_relationships(graph.as_ref(), &a.key(), Direction::Incoming, "r", 0, 10)
            .unwrap()
            .is_empty());
        assert!(page_relationships(graph.as_ref(), &b.key(), Direction::Outgoing, "r", 0, 10)
            .unwrap()
            .is_empty());
        assert_eq!(graph.size().unwrap(), 2, "{name}");
        assert!(graph.relationship_types().unwrap().is_empty(), "{name}");
    }
}

#[test]
fn node_pages_cover_each_node_once() {
    for Backend { name, graph, .. } in backends() {
        for i in 0..23 {
            graph.add_node("item", &format!("i{i:02}"), Properties::new()).unwrap();
        }
        graph.add_node("other", "z", Properties::new()).unwrap();

        let mut seen = Vec::new();
        let mut skip = 0;
        loop {
            let page = page_nodes(graph.as_ref(), "item", skip, 5).unwrap();
            assert!(page.len() <= 5, "{name}");
            if page.is_empty() {
                break;
            }
            skip += page.len();
            seen.extend(page);
        }
        assert_eq!(seen.len(), 23, "{name}");
        assert_eq!(ids(&seen).len(), 23, "{name}");
        assert_eq!(graph.node_types().unwrap(), vec!["item".to_string(), "other".to_string()]);
    }
}

#[test]
fn visitor_can_stop_a_scan() {
    for Backend { name, graph, .. } in backends() {
        for id in ["a", "b", "c"] {
            graph.add_node("t", id, Properties::new()).unwrap();
        }
        let mut visited = 0;
        graph
            .range_nodes(0, "t", &mut |_| {
                visited += 1;
                false
            })
            .unwrap();
        assert_eq!(visited, 1, "{name}");
    }
}

#[test]
fn property_updates_replace_the_bag() {
    for Backend { name, graph, .. } in backends() {
        graph.add_node("user", "u1", props([("a", 1i64), ("b", 2i64)])).unwrap();
        let updated = graph.set_node_properties("user", "u1", props([("c", 3i64)])).unwrap();
        assert_eq!(updated.properties, props([("c", 3i64)]), "{name}");
        assert_eq!(graph.get_node("user", "u1").unwrap().properties, props([("c", 3i64)]));

        let err = graph.set_node_properties("user", "ghost", Properties::new()).unwrap_err();
        assert!(err.is_not_found(), "{name}");
    }
}

#[test]
fn relationship_properties_round_trip() {
    for Backend { name, graph, .. } in backends() {
        let a = EntityKey::new("n", "a");
        let b = EntityKey::new("n", "b");
        graph.add_node("n", "a", Properties::new()).unwrap();
        graph.add_node("n", "b", Properties::new()).unwrap();
        graph
            .add_relationship(&a, Direction::Outgoing, "knows", "k1", &b, props([("since", 2019i64)]))
            .unwrap();
        graph
            .set_relationship_properties("knows", "k1", props([("since", 2020i64)]))
            .unwrap();
        let rel = graph.get_relationship("knows", "k1").unwrap();
        assert_eq!(rel.properties["since"], Value::Int(2020), "{name}");
        assert_eq!(rel.source, a, "{name}");

        let mut all = Vec::new();
        graph
            .range_relationships(0, "knows", &mut |rel| {
                all.push(rel.id);
                true
            })
            .unwrap();
        assert_eq!(all, vec!["k1".to_string()], "{name}");
    }
}

#[test]
fn rebinding_a_relationship_id_is_rejected() {
    for Backend { name, graph, .. } in backends() {
        let a = EntityKey::new("n", "a");
        let b = EntityKey::new("n", "b");
        let c = EntityKey::new("n", "c");
        for key in [&a, &b, &c] {
            graph.add_node(&key.type_name, &key.id, Properties::new()).unwrap();
        }
        graph
            .add_relationship(&a, Direction::Outgoing, "r", "r1", &b, Properties::new())
            .unwrap();
        let err = graph
            .add_relationship(&a, Direction::Outgoing, "r", "r1", &c, Properties::new())
            .unwrap_err();
        assert!(matches!(err, GraphError::InvalidArgument(_)), "{name}: {err}");
    }
}

#[test]
fn missing_endpoint_leaves_no_trace() {
    for Backend { name, graph, .. } in backends() {
        let a = EntityKey::new("n", "a");
        graph.add_node("n", "a", Properties::new()).unwrap();
        let err = graph
            .add_relationship(&a, Direction::Outgoing, "r", "r1", &EntityKey::new("n", "ghost"), Properties::new())
            .unwrap_err();
        assert!(err.is_not_found(), "{name}");
        assert!(graph.get_relationship("r", "r1").is_err(), "{name}");
        assert!(page_relationships(graph.as_ref(), &a, Direction::Outgoing, "r", 0, 10)
            .unwrap()
            .is_empty());
    }
}

#[test]
fn closed_graphs_refuse_work() {
    for Backend { name, graph, .. } in backends() {
        graph.add_node("n", "a", Properties::new()).unwrap();
        graph.close().unwrap();
        graph.close().unwrap();
        assert!(matches!(graph.get_node("n", "a"), Err(GraphError::Closed)), "{name}");
        assert!(matches!(graph.size(), Err(GraphError::Closed)), "{name}");
    }
}
