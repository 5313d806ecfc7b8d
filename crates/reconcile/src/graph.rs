//! Dependency graph builder
//!
//! Edges run from a dependency to its dependent. They come from references
//! in attribute and hook expressions and from explicit `depends_on`.

use crate::error::{Error, Result};
use crate::types::{Node, NodeId};
use indexmap::IndexMap;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Validated, acyclic set of nodes for one planning run
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: IndexMap<NodeId, Node>,
    dependencies: BTreeMap<NodeId, BTreeSet<NodeId>>,
    dependents: BTreeMap<NodeId, BTreeSet<NodeId>>,
}

/// Build the graph, checking references and cycles.
///
/// Pure: on error nothing is returned and nothing else is touched.
pub fn build(nodes: Vec<Node>) -> Result<Graph> {
    let mut by_id: IndexMap<NodeId, Node> = IndexMap::with_capacity(nodes.len());
    for node in nodes {
        if by_id.contains_key(&node.id) {
            return Err(Error::DuplicateDeclaration { name: node.id });
        }
        by_id.insert(node.id.clone(), node);
    }

    let mut dependencies: BTreeMap<NodeId, BTreeSet<NodeId>> = BTreeMap::new();
    let mut dependents: BTreeMap<NodeId, BTreeSet<NodeId>> = BTreeMap::new();

    for node in by_id.values() {
        let mut deps = node.referenced_nodes()?;
        deps.extend(node.depends_on.iter().cloned());

        for dep in &deps {
            if !by_id.contains_key(dep) {
                return Err(Error::UnknownReference {
                    node: node.id.clone(),
                    reference: dep.clone(),
                });
            }
            dependents
                .entry(dep.clone())
                .or_default()
                .insert(node.id.clone());
        }
        dependencies.insert(node.id.clone(), deps);
    }

    let graph = Graph {
        nodes: by_id,
        dependencies,
        dependents,
    };
    if let Some(cycle) = graph.find_cycle() {
        return Err(Error::CyclicDependency { cycle });
    }
    log::debug!(
        "Built graph with {} nodes and {} edges",
        graph.len(),
        graph.edge_count()
    );
    Ok(graph)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

impl Graph {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.dependencies.values().map(BTreeSet::len).sum()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Nodes in declaration order
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Direct dependencies of a node
    pub fn dependencies_of(&self, id: &str) -> BTreeSet<NodeId> {
        self.dependencies.get(id).cloned().unwrap_or_default()
    }

    /// Direct dependents of a node
    pub fn dependents_of(&self, id: &str) -> BTreeSet<NodeId> {
        self.dependents.get(id).cloned().unwrap_or_default()
    }

    /// All nodes reachable by following dependency edges
    pub fn transitive_dependencies(&self, id: &str) -> BTreeSet<NodeId> {
        walk(id, &self.dependencies)
    }

    /// All nodes that depend on `id`, directly or not
    pub fn transitive_dependents(&self, id: &str) -> BTreeSet<NodeId> {
        walk(id, &self.dependents)
    }

    /// Depth-first search with a recursion stack; returns the first cycle found
    fn find_cycle(&self) -> Option<Vec<NodeId>> {
        let mut marks: BTreeMap<&str, Mark> = self
            .nodes
            .keys()
            .map(|id| (id.as_str(), Mark::Unvisited))
            .collect();
        let mut stack: Vec<&str> = Vec::new();

        for id in self.nodes.keys() {
            if marks[id.as_str()] == Mark::Unvisited
                && let Some(cycle) = self.visit(id, &mut marks, &mut stack)
            {
                return Some(cycle);
            }
        }
        None
    }

    fn visit<'a>(
        &'a self,
        id: &'a str,
        marks: &mut BTreeMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<NodeId>> {
        marks.insert(id, Mark::OnStack);
        stack.push(id);

        if let Some(deps) = self.dependencies.get(id) {
            for dep in deps {
                match marks[dep.as_str()] {
                    Mark::OnStack => {
                        let start = stack.iter().position(|n| *n == dep.as_str()).unwrap_or(0);
                        let mut cycle: Vec<NodeId> =
                            stack[start..].iter().map(|n| (*n).to_string()).collect();
                        cycle.push(dep.clone());
                        return Some(cycle);
                    }
                    Mark::Unvisited => {
                        if let Some(cycle) = self.visit(dep, marks, stack) {
                            return Some(cycle);
                        }
                    }
                    Mark::Done => {}
                }
            }
        }

        stack.pop();
        marks.insert(id, Mark::Done);
        None
    }

    /// Topological order: every node after all of its dependencies.
    /// Ties are broken by declaration order so plans are reproducible.
    pub fn topological_order(&self) -> Vec<NodeId> {
        let index: BTreeMap<&str, usize> = self
            .nodes
            .keys()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();
        let mut remaining: Vec<usize> = self
            .nodes
            .keys()
            .map(|id| self.dependencies.get(id).map_or(0, BTreeSet::len))
            .collect();
        let mut ready: BTreeSet<usize> = remaining
            .iter()
            .enumerate()
            .filter(|(_, n)| **n == 0)
            .map(|(i, _)| i)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(i) = ready.pop_first() {
            let Some((id, _)) = self.nodes.get_index(i) else {
                continue;
            };
            order.push(id.clone());
            for dependent in self.dependents.get(id).into_iter().flatten() {
                let j = index[dependent.as_str()];
                remaining[j] -= 1;
                if remaining[j] == 0 {
                    ready.insert(j);
                }
            }
        }
        order
    }

    /// Resolve `-target` expressions to the targeted nodes plus everything
    /// they depend on
    pub fn select_targets(&self, targets: &[String]) -> BTreeSet<NodeId> {
        let mut selected = BTreeSet::new();
        for target in targets {
            let matched: Vec<&Node> = self
                .nodes
                .values()
                .filter(|n| matches_target(target, &n.id, &n.node_type))
                .collect();
            if matched.is_empty() {
                log::warn!("Target `{target}` matches no declared node");
            }
            for node in matched {
                selected.insert(node.id.clone());
                selected.extend(self.transitive_dependencies(&node.id));
            }
        }
        selected
    }
}

fn walk(start: &str, edges: &BTreeMap<NodeId, BTreeSet<NodeId>>) -> BTreeSet<NodeId> {
    let mut seen = BTreeSet::new();
    let mut queue: VecDeque<&str> = VecDeque::from([start]);
    while let Some(id) = queue.pop_front() {
        for next in edges.get(id).into_iter().flatten() {
            if seen.insert(next.clone()) {
                queue.push_back(next);
            }
        }
    }
    seen
}

/// Parse a target string like "type.name" into (type, name)
fn parse_target(target: &str) -> (Option<&str>, Option<&str>) {
    let parts: Vec<&str> = target.split('.').collect();
    match parts.as_slice() {
        [ty] => (Some(ty), None),
        [ty, name] => (Some(ty), Some(name)),
        _ => (None, Some(target)),
    }
}

/// Check whether a node matches a target: a full address, a type, or
/// `type.name`
pub fn matches_target(target: &str, id: &str, node_type: &str) -> bool {
    if target == id {
        return true;
    }
    match parse_target(target) {
        (Some(ty), None) => ty == node_type,
        (Some(ty), Some(name)) => ty == node_type && id.ends_with(&format!(".{name}")),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> Node {
        let (ty, name) = id.split_once('.').unwrap();
        Node::resource(ty, name)
    }

    fn position(order: &[NodeId], id: &str) -> usize {
        order.iter().position(|n| n == id).unwrap()
    }

    #[test]
    fn test_edges_from_references_and_depends_on() {
        let graph = build(vec![
            node("aws_instance.web")
                .with_attr("subnet_id", "${aws_subnet.a.id}")
                .depends_on("aws_security_group.sg"),
            node("aws_subnet.a").with_attr("vpc_id", "${aws_vpc.main.id}"),
            node("aws_vpc.main"),
            node("aws_security_group.sg"),
        ])
        .unwrap();

        assert_eq!(graph.edge_count(), 3);
        assert_eq!(
            graph.dependencies_of("aws_instance.web"),
            BTreeSet::from(["aws_security_group.sg".into(), "aws_subnet.a".into()])
        );
        assert_eq!(
            graph.transitive_dependents("aws_vpc.main"),
            BTreeSet::from(["aws_instance.web".into(), "aws_subnet.a".into()])
        );

        let order = graph.topological_order();
        assert_eq!(order.len(), 4);
        assert!(position(&order, "aws_vpc.main") < position(&order, "aws_subnet.a"));
        assert!(position(&order, "aws_subnet.a") < position(&order, "aws_instance.web"));
        assert!(position(&order, "aws_security_group.sg") < position(&order, "aws_instance.web"));
    }

    #[test]
    fn test_order_is_declaration_order_without_edges() {
        let graph = build(vec![node("b.x"), node("a.y"), node("c.z")]).unwrap();
        assert_eq!(graph.topological_order(), vec!["b.x", "a.y", "c.z"]);
    }

    #[test]
    fn test_unknown_reference() {
        let err = build(vec![node("a.x").with_attr("v", "${b.missing.id}")]).unwrap_err();
        match err {
            Error::UnknownReference { node, reference } => {
                assert_eq!(node, "a.x");
                assert_eq!(reference, "b.missing");
            }
            other => panic!("unexpected error {other:?}"),
        }

        let err = build(vec![node("a.x").depends_on("b.nope")]).unwrap_err();
        assert!(matches!(err, Error::UnknownReference { .. }));
    }

    #[test]
    fn test_cycle_is_reported_in_order() {
        let err = build(vec![
            node("a.x").with_attr("v", "${b.y.id}"),
            node("b.y").with_attr("v", "${c.z.id}"),
            node("c.z").depends_on("a.x"),
            node("d.free"),
        ])
        .unwrap_err();
        match err {
            Error::CyclicDependency { cycle } => {
                assert_eq!(cycle, vec!["a.x", "b.y", "c.z", "a.x"]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let err = build(vec![node("a.x").with_attr("v", "${a.x.id}")]).unwrap_err();
        assert!(matches!(err, Error::CyclicDependency { cycle } if cycle == vec!["a.x", "a.x"]));
    }

    #[test]
    fn test_duplicate_node() {
        let err = build(vec![node("a.x"), node("a.x")]).unwrap_err();
        assert!(matches!(err, Error::DuplicateDeclaration { .. }));
    }

    #[test]
    fn test_select_targets_includes_dependencies() {
        let graph = build(vec![
            node("aws_vpc.main"),
            node("aws_subnet.a").with_attr("vpc_id", "${aws_vpc.main.id}"),
            node("aws_instance.web"),
        ])
        .unwrap();
        let selected = graph.select_targets(&["aws_subnet.a".to_string()]);
        assert_eq!(
            selected,
            BTreeSet::from(["aws_subnet.a".into(), "aws_vpc.main".into()])
        );
        let by_type = graph.select_targets(&["aws_instance".to_string()]);
        assert_eq!(by_type, BTreeSet::from(["aws_instance.web".into()]));
    }

    #[test]
    fn test_matches_target_forms() {
        assert!(matches_target("aws_instance", "aws_instance.web", "aws_instance"));
        assert!(matches_target("aws_instance.web", "aws_instance.web", "aws_instance"));
        assert!(matches_target("data.aws_ami.u", "data.aws_ami.u", "aws_ami"));
        assert!(!matches_target("aws_instance.db", "aws_instance.web", "aws_instance"));
    }
}
