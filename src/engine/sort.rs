//! Ordering of creation records.
//!
//! Records are ordered topologically over their declared dependencies, with
//! ties broken by ascending dependency count and then by original position.
//! Dependency cycles are broken by dropping every edge inside the strongly
//! connected component, the nodes involved are reported.
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::core::NodeId;

pub(crate) struct SortItem<'a> {
    pub id: &'a NodeId,
    pub dependencies: &'a [NodeId],
}

#[derive(Debug, Default)]
pub(crate) struct Sorted {
    /// Item positions, in scheduling order.
    pub order: Vec<usize>,
    /// For every item, the positions of the items it has to wait for.
    pub prerequisites: Vec<Vec<usize>>,
    /// Nodes of every dependency cycle that had to be broken.
    pub cycles: Vec<Vec<NodeId>>,
}

pub(crate) fn sort(items: &[SortItem<'_>]) -> Sorted {
    let position: HashMap<&NodeId, usize> = items
        .iter()
        .enumerate()
        .map(|(i, item)| (item.id, i))
        .collect();

    let mut graph = DiGraph::<usize, ()>::with_capacity(items.len(), 0);
    for i in 0..items.len() {
        graph.add_node(i);
    }

    let mut self_loops = Vec::new();
    let mut edges = BTreeSet::new();
    for (i, item) in items.iter().enumerate() {
        for dep in item.dependencies {
            // Dependencies on nodes that are not being created impose no order.
            let Some(&j) = position.get(dep) else {
                continue;
            };

            if i == j {
                self_loops.push(i);
            } else if edges.insert((j, i)) {
                graph.add_edge(NodeIndex::new(j), NodeIndex::new(i), ());
            }
        }
    }

    let mut cycles = Vec::new();
    for component in tarjan_scc(&graph) {
        if component.len() < 2 {
            continue;
        }

        let members: BTreeSet<usize> = component.iter().map(|n| graph[*n]).collect();
        edges.retain(|(from, to)| !(members.contains(from) && members.contains(to)));
        cycles.push(members.iter().map(|&i| items[i].id.clone()).collect());
    }

    for i in self_loops {
        if !cycles.iter().any(|c: &Vec<NodeId>| c.contains(items[i].id)) {
            cycles.push(vec![items[i].id.clone()]);
        }
    }

    let mut prerequisites = vec![Vec::new(); items.len()];
    let mut dependents = vec![Vec::new(); items.len()];
    for &(from, to) in &edges {
        prerequisites[to].push(from);
        dependents[from].push(to);
    }

    // Kahn's algorithm; the heap picks the ready item with the fewest
    // declared dependencies, then the earliest one.
    let mut waiting: Vec<usize> = prerequisites.iter().map(Vec::len).collect();
    let mut ready: BinaryHeap<Reverse<(usize, usize)>> = waiting
        .iter()
        .enumerate()
        .filter(|(_, count)| **count == 0)
        .map(|(i, _)| Reverse((items[i].dependencies.len(), i)))
        .collect();

    let mut order = Vec::with_capacity(items.len());
    while let Some(Reverse((_, i))) = ready.pop() {
        order.push(i);
        for &next in &dependents[i] {
            waiting[next] -= 1;
            if waiting[next] == 0 {
                ready.push(Reverse((items[next].dependencies.len(), next)));
            }
        }
    }

    debug_assert_eq!(order.len(), items.len(), "cycle survived cycle breaking");

    Sorted {
        order,
        prerequisites,
        cycles,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<NodeId> {
        names.iter().map(|n| NodeId::from(*n)).collect()
    }

    fn run(nodes: &[(&str, &[&str])]) -> (Vec<String>, Sorted) {
        let owned: Vec<(NodeId, Vec<NodeId>)> = nodes
            .iter()
            .map(|(id, deps)| (NodeId::from(*id), ids(deps)))
            .collect();
        let items: Vec<SortItem> = owned
            .iter()
            .map(|(id, deps)| SortItem {
                id,
                dependencies: deps,
            })
            .collect();

        let sorted = sort(&items);
        let names = sorted.order.iter().map(|&i| nodes[i].0.to_string()).collect();
        (names, sorted)
    }

    fn before(order: &[String], a: &str, b: &str) -> bool {
        let pa = order.iter().position(|n| *n == a).unwrap();
        let pb = order.iter().position(|n| *n == b).unwrap();
        pa < pb
    }

    #[test]
    fn test_dependency_comes_first() {
        let (order, sorted) = run(&[("b", &["a"]), ("c", &["a"]), ("a", &[])]);

        assert_eq!(order[0], "a");
        assert!(sorted.cycles.is_empty());
        assert_eq!(sorted.prerequisites[0], vec![2]);
        assert_eq!(sorted.prerequisites[1], vec![2]);
        assert!(sorted.prerequisites[2].is_empty());
    }

    #[test]
    fn test_ties_prefer_fewer_dependencies() {
        let (order, _) = run(&[
            ("x", &["missing-1", "missing-2"]),
            ("y", &[]),
            ("z", &["missing-1"]),
        ]);

        assert_eq!(order, ["y", "z", "x"]);
    }

    #[test]
    fn test_diamond_uses_real_edges() {
        // Equal counts everywhere, but `d` must still wait for both sides.
        let (order, sorted) = run(&[
            ("d", &["b", "c"]),
            ("b", &["a"]),
            ("c", &["a"]),
            ("a", &[]),
        ]);

        assert!(before(&order, "a", "b"));
        assert!(before(&order, "a", "c"));
        assert!(before(&order, "b", "d"));
        assert!(before(&order, "c", "d"));
        assert_eq!(sorted.prerequisites[0], vec![1, 2]);
    }

    #[test]
    fn test_long_chain_declared_backwards() {
        let (order, _) = run(&[
            ("e", &["d"]),
            ("d", &["c"]),
            ("c", &["b"]),
            ("b", &["a"]),
            ("a", &[]),
        ]);

        assert_eq!(order, ["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn test_cycle_is_broken_and_reported() {
        let (order, sorted) = run(&[
            ("a", &["c"]),
            ("b", &["a"]),
            ("c", &["b"]),
            ("d", &["a"]),
        ]);

        assert_eq!(order.len(), 4);
        assert_eq!(sorted.cycles, vec![ids(&["a", "b", "c"])]);
        // The edge leaving the cycle survives.
        assert!(before(&order, "a", "d"));
        assert_eq!(sorted.prerequisites[3], vec![0]);
        assert!(sorted.prerequisites[0].is_empty());
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let (order, sorted) = run(&[("a", &["a"]), ("b", &[])]);

        assert_eq!(order.len(), 2);
        assert_eq!(sorted.cycles, vec![ids(&["a"])]);
        assert!(sorted.prerequisites[0].is_empty());
    }

    #[test]
    fn test_duplicate_dependency_declared_once() {
        let (_, sorted) = run(&[("a", &[]), ("b", &["a", "a"])]);
        assert_eq!(sorted.prerequisites[1], vec![0]);
    }
}
