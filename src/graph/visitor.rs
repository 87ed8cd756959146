use std::collections::{HashSet, VecDeque};

use petgraph::Direction;
use petgraph::stable_graph::NodeIndex;
use petgraph::visit::EdgeRef;

use super::UrlGraph;
use super::url_info::UrlInfo;

/// True when `node` is reachable from the root through live, non-weak references.
///
/// Walks backwards from `node`, so cycles detached from the root report unused.
pub fn is_used(graph: &UrlGraph, node: NodeIndex) -> bool {
    let root = graph.root();
    if node == root {
        return true;
    }
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([node]);
    while let Some(current) = queue.pop_front() {
        if current == root {
            return true;
        }
        if !seen.insert(current) {
            continue;
        }
        for edge in graph.graph.edges_directed(current, Direction::Incoming) {
            let id = *edge.weight();
            if !graph.is_live(id) {
                continue;
            }
            if graph.reference(id).is_some_and(|r| r.is_weak) {
                continue;
            }
            queue.push_back(edge.source());
        }
    }
    false
}

/// Visit every node strongly reachable from `start` (excluded), depth-first, with
/// outgoing references taken in creation order.
pub fn for_each_strongly_referenced(
    graph: &UrlGraph,
    start: NodeIndex,
    mut visit: impl FnMut(NodeIndex, &UrlInfo),
) {
    let mut seen = HashSet::from([start]);
    let mut stack: Vec<NodeIndex> = strong_targets(graph, start).into_iter().rev().collect();
    while let Some(current) = stack.pop() {
        if !seen.insert(current) {
            continue;
        }
        visit(current, graph.url_info(current));
        for target in strong_targets(graph, current).into_iter().rev() {
            if !seen.contains(&target) {
                stack.push(target);
            }
        }
    }
}

/// Nodes strongly reachable from the root, in visiting order.
pub fn strongly_referenced_from_root(graph: &UrlGraph) -> Vec<NodeIndex> {
    let mut out = Vec::new();
    for_each_strongly_referenced(graph, graph.root(), |idx, _| out.push(idx));
    out
}

fn strong_targets(graph: &UrlGraph, node: NodeIndex) -> Vec<NodeIndex> {
    graph
        .references_to_others(node)
        .into_iter()
        .filter_map(|id| graph.reference(id))
        .filter(|r| !r.is_weak)
        .filter_map(|r| r.target())
        .collect()
}

/// First node (breadth-first over live incoming references) for which `predicate` holds.
pub fn find_dependent(
    graph: &UrlGraph,
    node: NodeIndex,
    mut predicate: impl FnMut(NodeIndex, &UrlInfo) -> bool,
) -> Option<NodeIndex> {
    let mut seen = HashSet::from([node]);
    let mut queue = VecDeque::from([node]);
    while let Some(current) = queue.pop_front() {
        for id in graph.references_from_others(current) {
            let Some(owner) = graph.reference(id).map(|r| r.owner) else {
                continue;
            };
            if owner == graph.root() || !seen.insert(owner) {
                continue;
            }
            if predicate(owner, graph.url_info(owner)) {
                return Some(owner);
            }
            queue.push_back(owner);
        }
    }
    None
}

/// First node (breadth-first over live outgoing references) for which `predicate` holds.
pub fn find_dependency(
    graph: &UrlGraph,
    node: NodeIndex,
    mut predicate: impl FnMut(NodeIndex, &UrlInfo) -> bool,
) -> Option<NodeIndex> {
    let mut seen = HashSet::from([node]);
    let mut queue = VecDeque::from([node]);
    while let Some(current) = queue.pop_front() {
        for id in graph.references_to_others(current) {
            let Some(target) = graph.reference(id).and_then(|r| r.target()) else {
                continue;
            };
            if !seen.insert(target) {
                continue;
            }
            if predicate(target, graph.url_info(target)) {
                return Some(target);
            }
            queue.push_back(target);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::reference::{ReferenceId, ReferenceInit, ReferenceKind};

    fn link(g: &mut UrlGraph, owner: NodeIndex, init: ReferenceInit, url: &str) -> (ReferenceId, NodeIndex) {
        let id = g.create_reference(owner, init);
        g.set_reference_url(id, url.to_owned()).unwrap();
        let target = g.finalize_reference(id).unwrap();
        (id, target)
    }

    #[test]
    fn test_cycle_detached_from_root_is_unused() {
        let mut g = UrlGraph::new("test", "file:///app/");
        let root = g.root();
        let (entry, a) = link(
            &mut g,
            root,
            ReferenceInit::new(ReferenceKind::EntryPoint, "./a.js"),
            "file:///app/a.js",
        );
        let (_, b) = link(&mut g, a, ReferenceInit::new(ReferenceKind::JsImport, "./b.js"), "file:///app/b.js");
        link(&mut g, b, ReferenceInit::new(ReferenceKind::JsImport, "./a.js"), "file:///app/a.js");
        assert!(is_used(&g, a) && is_used(&g, b));

        g.remove_reference(entry).unwrap();
        assert!(!is_used(&g, a), "a <-> b cycle no longer reachable from root");
        assert!(!is_used(&g, b));
    }

    #[test]
    fn test_strong_walk_visits_each_node_of_a_cycle_once() {
        let mut g = UrlGraph::new("test", "file:///app/");
        let root = g.root();
        let (_, a) = link(
            &mut g,
            root,
            ReferenceInit::new(ReferenceKind::EntryPoint, "./a.js"),
            "file:///app/a.js",
        );
        let (_, b) = link(&mut g, a, ReferenceInit::new(ReferenceKind::JsImport, "./b.js"), "file:///app/b.js");
        link(&mut g, b, ReferenceInit::new(ReferenceKind::JsImport, "./a.js"), "file:///app/a.js");

        let mut visited = Vec::new();
        for_each_strongly_referenced(&g, root, |idx, _| visited.push(idx));
        assert_eq!(visited, vec![a, b]);

        let mut from_a = Vec::new();
        for_each_strongly_referenced(&g, a, |idx, _| from_a.push(idx));
        assert_eq!(from_a, vec![b], "the start node is never visited, even through the cycle");
    }

    #[test]
    fn test_weak_references_do_not_keep_nodes_used() {
        let mut g = UrlGraph::new("test", "file:///app/");
        let root = g.root();
        let (_, html) = link(
            &mut g,
            root,
            ReferenceInit::new(ReferenceKind::EntryPoint, "./index.html"),
            "file:///app/index.html",
        );
        let (_, hinted) = link(
            &mut g,
            html,
            ReferenceInit::new(ReferenceKind::LinkHref, "./lazy.js").resource_hint(),
            "file:///app/lazy.js",
        );
        assert!(!is_used(&g, hinted));
        let visited = strongly_referenced_from_root(&g);
        assert_eq!(visited, vec![html]);
    }

    #[test]
    fn test_find_dependent_and_dependency() {
        let mut g = UrlGraph::new("test", "file:///app/");
        let root = g.root();
        let (_, html) = link(
            &mut g,
            root,
            ReferenceInit::new(ReferenceKind::EntryPoint, "./index.html"),
            "file:///app/index.html",
        );
        let (_, main) = link(&mut g, html, ReferenceInit::new(ReferenceKind::Script, "./main.js"), "file:///app/main.js");
        let (_, dep) = link(&mut g, main, ReferenceInit::new(ReferenceKind::JsImport, "./dep.js"), "file:///app/dep.js");

        let found = find_dependent(&g, dep, |_, info| info.url().ends_with(".html"));
        assert_eq!(found, Some(html));
        let found = find_dependency(&g, html, |_, info| info.url().ends_with("dep.js"));
        assert_eq!(found, Some(dep));
        assert_eq!(find_dependency(&g, dep, |_, _| true), None);
    }
}
