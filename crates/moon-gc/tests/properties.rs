//! Randomized heap-graph properties.
//!
//! A full collection frees exactly the unreachable objects, and the
//! collector invariants hold between any two incremental steps whatever the
//! mutator does in between.

#![allow(clippy::unwrap_used, clippy::cast_possible_wrap)]

use std::collections::HashSet;

use moon_gc::{GcConfig, GcMode, GcRef, Heap, Value};
use proptest::prelude::*;

const SLOTS: usize = 8;

#[derive(Debug, Clone)]
struct Graph {
    nodes: usize,
    edges: Vec<(usize, usize)>,
    roots: Vec<usize>,
}

fn graph() -> impl Strategy<Value = Graph> {
    (1usize..40).prop_flat_map(|nodes| {
        (
            prop::collection::vec((0..nodes, 0..nodes), 0..80),
            prop::collection::vec(0..nodes, 0..6),
        )
            .prop_map(move |(edges, roots)| Graph {
                nodes,
                edges,
                roots,
            })
    })
}

fn reachable(graph: &Graph) -> HashSet<usize> {
    let mut seen = HashSet::new();
    let mut stack = graph.roots.clone();
    while let Some(n) = stack.pop() {
        if seen.insert(n) {
            stack.extend(graph.edges.iter().filter(|&&(from, _)| from == n).map(|&(_, to)| to));
        }
    }
    seen
}

/// Builds `graph` under a pinned root table and returns the node handles.
fn build(heap: &mut Heap, graph: &Graph) -> Vec<GcRef> {
    let root = heap.new_table().unwrap();
    heap.pin(root.into()).unwrap();
    let nodes: Vec<GcRef> = (0..graph.nodes).map(|_| heap.new_table().unwrap()).collect();
    for (i, &(from, to)) in graph.edges.iter().enumerate() {
        heap.table_set(nodes[from], Value::Integer(i as i64 + 1), nodes[to].into())
            .unwrap();
    }
    for (i, &n) in graph.roots.iter().enumerate() {
        heap.table_set(root, Value::Integer(i as i64 + 1), nodes[n].into())
            .unwrap();
    }
    nodes
}

#[derive(Debug, Clone)]
enum Op {
    /// Store a new table in a root slot.
    New(usize),
    /// `root[a][key] = root[b]`
    Link(usize, i64, usize),
    /// `root[dst] = root[src][key]`
    Load(usize, i64, usize),
    Clear(usize),
    Step,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..SLOTS).prop_map(Op::New),
        3 => (0..SLOTS, 1i64..4, 0..SLOTS).prop_map(|(a, k, b)| Op::Link(a, k, b)),
        2 => (0..SLOTS, 1i64..4, 0..SLOTS).prop_map(|(s, k, d)| Op::Load(s, k, d)),
        1 => (0..SLOTS).prop_map(Op::Clear),
        4 => Just(Op::Step),
    ]
}

fn slot(n: usize) -> Value {
    Value::Integer(n as i64 + 1)
}

/// Applies `op`, touching only objects reachable from `root`.
fn apply(heap: &mut Heap, root: GcRef, op: &Op) {
    match *op {
        Op::New(n) => {
            let t = heap.new_table().unwrap();
            heap.table_set(root, slot(n), t.into()).unwrap();
        }
        Op::Link(a, key, b) => {
            if let Some(table) = heap.table_get(root, slot(a)).unwrap().as_object() {
                let value = heap.table_get(root, slot(b)).unwrap();
                heap.table_set(table, Value::Integer(key), value).unwrap();
            }
        }
        Op::Load(src, key, dst) => {
            if let Some(table) = heap.table_get(root, slot(src)).unwrap().as_object() {
                let value = heap.table_get(table, Value::Integer(key)).unwrap();
                heap.table_set(root, slot(dst), value).unwrap();
            }
        }
        Op::Clear(n) => heap.table_set(root, slot(n), Value::Nil).unwrap(),
        Op::Step => {
            heap.step_kb(0);
        }
    }
}

fn random_mutation(mode: GcMode, ops: &[Op]) {
    let mut heap = Heap::with_config(GcConfig {
        mode,
        step_size_log2: 0,
        ..GcConfig::default()
    })
    .unwrap();
    let root = heap.new_table().unwrap();
    heap.pin(root.into()).unwrap();
    for op in ops {
        apply(&mut heap, root, op);
        heap.verify().unwrap();
    }

    // Everything still reachable from the root survives a full collection.
    let before: Vec<Value> = (0..SLOTS)
        .map(|n| heap.table_get(root, slot(n)).unwrap())
        .collect();
    heap.full_collect();
    heap.verify().unwrap();
    for (n, value) in before.into_iter().enumerate() {
        if let Some(r) = value.as_object() {
            assert!(heap.is_live(r));
        }
        assert_eq!(heap.table_get(root, slot(n)).unwrap(), value);
    }
}

proptest! {
    #[test]
    fn test_full_collect_frees_exactly_the_unreachable(graph in graph()) {
        let mut heap = Heap::new().unwrap();
        let nodes = build(&mut heap, &graph);
        let live = reachable(&graph);

        heap.full_collect();
        for (i, &node) in nodes.iter().enumerate() {
            prop_assert_eq!(heap.is_live(node), live.contains(&i), "node {}", i);
        }

        let count = heap.object_count();
        heap.full_collect();
        prop_assert_eq!(heap.object_count(), count);
        heap.verify().unwrap();
    }

    #[test]
    fn test_generational_full_collect_matches_reachability(graph in graph()) {
        let mut heap = Heap::with_config(GcConfig::generational()).unwrap();
        let nodes = build(&mut heap, &graph);
        let live = reachable(&graph);

        heap.full_collect();
        for (i, &node) in nodes.iter().enumerate() {
            prop_assert_eq!(heap.is_live(node), live.contains(&i), "node {}", i);
        }
        heap.verify().unwrap();
    }

    #[test]
    fn test_invariants_hold_between_incremental_steps(ops in prop::collection::vec(op(), 1..200)) {
        random_mutation(GcMode::Incremental, &ops);
    }

    #[test]
    fn test_invariants_hold_between_generational_steps(ops in prop::collection::vec(op(), 1..200)) {
        random_mutation(GcMode::Generational, &ops);
    }
}
