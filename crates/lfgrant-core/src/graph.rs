//! Dependency graph of provisioning operations
//!
//! Edges read "must exist before". Implicit edges come from references
//! between operations (an association needs its tag, a tag-expression grant
//! needs the tag and its associations, a location grant needs the location
//! registered, a grant to a created principal needs the creator). Explicit
//! edges declared by the caller are layered on top.

use crate::declarations::DeclarationSet;
use crate::error::{Error, Result};
use crate::operation::{LogicalId, Operation, PlannedOperation};
use crate::types::{location_contains, Resource};
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use petgraph::Direction;
use std::cmp::Reverse;
use std::collections::{btree_set, BTreeSet, BinaryHeap, HashMap};

/// Acyclic graph of operations. Node indices follow declaration order.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    catalog_id: String,
    nodes: Vec<PlannedOperation>,
    /// Edge weights are unused; node weights are the logical ids
    graph: DiGraph<LogicalId, ()>,
    index: HashMap<LogicalId, NodeIndex>,
}

impl DependencyGraph {
    /// Build the graph and reject it if it contains a cycle
    pub fn build(decls: &DeclarationSet) -> Result<Self> {
        let nodes = decls.planned_operations();
        let mut graph = DiGraph::with_capacity(nodes.len(), nodes.len());
        let mut index = HashMap::with_capacity(nodes.len());
        for node in &nodes {
            let idx = graph.add_node(node.id.clone());
            index.insert(node.id.clone(), idx);
        }

        let mut graph = Self {
            catalog_id: decls.catalog_id().to_string(),
            nodes,
            graph,
            index,
        };

        graph.add_implicit_edges(decls);
        graph.add_explicit_edges(decls)?;
        graph.check_acyclic()?;
        Ok(graph)
    }

    fn add_implicit_edges(&mut self, decls: &DeclarationSet) {
        let mut edges = Vec::new();

        for (after, node) in self.nodes.iter().enumerate() {
            match &node.operation {
                Operation::AssociateTag(assoc) => {
                    if let Some(tag_op) = self.lookup(decls.tag_operation(&assoc.tag_key)) {
                        edges.push((tag_op, after));
                    }
                }
                Operation::Grant(grant) => {
                    match &grant.target {
                        Resource::TagExpression {
                            resource_type,
                            tag_key,
                            tag_values,
                        } => {
                            if let Some(tag_op) = self.lookup(decls.tag_operation(tag_key)) {
                                edges.push((tag_op, after));
                            }
                            for (before, other) in self.nodes.iter().enumerate() {
                                if let Operation::AssociateTag(assoc) = &other.operation {
                                    if assoc.matches_expression(*resource_type, tag_key, tag_values)
                                    {
                                        edges.push((before, after));
                                    }
                                }
                            }
                        }
                        Resource::DataLocation { arn } => {
                            for (before, other) in self.nodes.iter().enumerate() {
                                if let Operation::RegisterResource(reg) = &other.operation {
                                    if location_contains(&reg.arn, arn) {
                                        edges.push((before, after));
                                    }
                                }
                            }
                        }
                        _ => {}
                    }

                    if let Some(origin) = decls.principal_origin(&grant.principal.identifier) {
                        if let Some(creator) = self.lookup(decls.resolve(&origin.created_by)) {
                            edges.push((creator, after));
                        }
                    }
                }
                Operation::CreateTag(_) | Operation::RegisterResource(_) => {}
            }
        }

        for (before, after) in edges {
            self.add_edge(before, after);
        }
    }

    fn add_explicit_edges(&mut self, decls: &DeclarationSet) -> Result<()> {
        for edge in decls.edges() {
            let resolve = |id: &LogicalId| {
                decls
                    .resolve(id)
                    .and_then(|canonical| self.index_of(canonical))
                    .ok_or_else(|| {
                        Error::validation(format!(
                            "ordering constraint names unknown operation `{id}`"
                        ))
                    })
            };
            let before = resolve(&edge.before)?;
            let after = resolve(&edge.after)?;
            self.add_edge(before, after);
        }
        Ok(())
    }

    fn lookup(&self, id: Option<&LogicalId>) -> Option<usize> {
        id.and_then(|id| self.index_of(id))
    }

    // update_edge keeps at most one edge per pair, so in-degrees count
    // distinct predecessors
    fn add_edge(&mut self, before: usize, after: usize) {
        self.graph.update_edge(NodeIndex::new(before), NodeIndex::new(after), ());
    }

    /// Report one concrete cycle, in dependency order, if the graph has any
    fn check_acyclic(&self) -> Result<()> {
        let cyclic = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|scc| scc.len() > 1 || self.graph.find_edge(scc[0], scc[0]).is_some())
            .map(|scc| scc.into_iter().map(NodeIndex::index).collect::<BTreeSet<usize>>())
            .min_by_key(|scc| scc.iter().next().copied());
        let Some(component) = cyclic else {
            return Ok(());
        };

        // Every member of a strongly connected component has a successor
        // inside it, so following successors must revisit a node.
        let mut path: Vec<usize> = Vec::new();
        let mut current = *component.iter().next().unwrap_or(&0);
        loop {
            if let Some(pos) = path.iter().position(|&n| n == current) {
                let cycle = path[pos..]
                    .iter()
                    .map(|&n| self.nodes[n].id.clone())
                    .collect();
                return Err(Error::Cycle { ids: cycle });
            }
            path.push(current);
            match self.successors(current).find(|s| component.contains(s)) {
                Some(next) => current = next,
                None => {
                    return Err(Error::Cycle {
                        ids: component.iter().map(|&n| self.nodes[n].id.clone()).collect(),
                    })
                }
            }
        }
    }

    /// Deterministic linearization (Kahn); ties are broken by declaration order
    pub fn topological_order(&self) -> Vec<usize> {
        let mut in_degree: Vec<usize> = (0..self.len())
            .map(|n| self.predecessors(n).count())
            .collect();
        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(self.len());
        while let Some(Reverse(node)) = ready.pop() {
            order.push(node);
            for succ in self.successors(node) {
                in_degree[succ] -= 1;
                if in_degree[succ] == 0 {
                    ready.push(Reverse(succ));
                }
            }
        }
        order
    }

    /// Group nodes into waves; every node of a wave can run concurrently once
    /// the previous waves have succeeded
    pub fn levels(&self) -> Vec<Vec<usize>> {
        let mut depth = vec![0usize; self.len()];
        let mut levels: Vec<Vec<usize>> = Vec::new();
        for node in self.topological_order() {
            let level = self
                .predecessors(node)
                .map(|p| depth[p] + 1)
                .max()
                .unwrap_or(0);
            depth[node] = level;
            if levels.len() <= level {
                levels.resize_with(level + 1, Vec::new);
            }
            levels[level].push(node);
        }
        levels
    }

    /// Every node that transitively depends on `node`
    pub fn descendants(&self, node: usize) -> BTreeSet<usize> {
        let start = NodeIndex::new(node);
        let mut dfs = Dfs::new(&self.graph, start);
        let mut seen = BTreeSet::new();
        while let Some(next) = dfs.next(&self.graph) {
            if next != start {
                seen.insert(next.index());
            }
        }
        seen
    }

    pub fn catalog_id(&self) -> &str {
        &self.catalog_id
    }

    pub fn nodes(&self) -> &[PlannedOperation] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> &PlannedOperation {
        &self.nodes[index]
    }

    pub fn index_of(&self, id: &LogicalId) -> Option<usize> {
        self.index.get(id).map(|idx| idx.index())
    }

    /// Direct predecessors of `node`, in declaration order
    pub fn predecessors(&self, node: usize) -> impl Iterator<Item = usize> + '_ {
        self.neighbors(node, Direction::Incoming)
    }

    /// Direct successors of `node`, in declaration order
    pub fn successors(&self, node: usize) -> impl Iterator<Item = usize> + '_ {
        self.neighbors(node, Direction::Outgoing)
    }

    fn neighbors(&self, node: usize, direction: Direction) -> btree_set::IntoIter<usize> {
        self.graph
            .neighbors_directed(NodeIndex::new(node), direction)
            .map(|n| n.index())
            .collect::<BTreeSet<usize>>()
            .into_iter()
    }

    /// Direct dependencies of `id`, by logical id
    pub fn dependencies_of(&self, id: &LogicalId) -> Vec<&LogicalId> {
        match self.index_of(id) {
            Some(node) => self
                .predecessors(node)
                .map(|p| &self.nodes[p].id)
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn has_edge(&self, before: &LogicalId, after: &LogicalId) -> bool {
        match (self.index.get(before), self.index.get(after)) {
            (Some(&b), Some(&a)) => self.graph.contains_edge(b, a),
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        permission_set, DataLocationRegistration, Principal, Tag, TagAssociation, TagResourceType,
    };

    fn id(s: &str) -> LogicalId {
        LogicalId::from(s)
    }

    fn privacy_scenario() -> DeclarationSet {
        let mut decls = DeclarationSet::new("123456789012");
        let reviews =
            Resource::table_with_columns("default", "reviews", ["product_id", "product_title"])
                .unwrap();
        decls
            .submit_grant(
                "grant_ds",
                Principal::user("ds-1").unwrap(),
                Resource::tag_expression(TagResourceType::Table, "privacy", ["open"]).unwrap(),
                permission_set(["SELECT"]).unwrap(),
                permission_set(["SELECT"]).unwrap(),
            )
            .unwrap();
        decls
            .associate_tag(
                "assoc_privacy",
                TagAssociation::new("privacy", ["open"], reviews).unwrap(),
            )
            .unwrap();
        decls
            .declare_tag("privacy_tag", Tag::new("privacy", ["open"]).unwrap())
            .unwrap();
        decls
    }

    #[test]
    fn test_tag_expression_grant_order() {
        let graph = DependencyGraph::build(&privacy_scenario()).unwrap();
        assert!(graph.has_edge(&id("privacy_tag"), &id("assoc_privacy")));
        assert!(graph.has_edge(&id("privacy_tag"), &id("grant_ds")));
        assert!(graph.has_edge(&id("assoc_privacy"), &id("grant_ds")));

        let order: Vec<&str> = graph
            .topological_order()
            .into_iter()
            .map(|n| graph.node(n).id.as_str())
            .collect();
        assert_eq!(order, vec!["privacy_tag", "assoc_privacy", "grant_ds"]);
        assert_eq!(graph.levels().len(), 3);
    }

    #[test]
    fn test_explicit_cycle_is_rejected() {
        let mut decls = DeclarationSet::new("123456789012");
        decls
            .declare_tag("a", Tag::new("environment", ["production"]).unwrap())
            .unwrap();
        decls
            .declare_tag("b", Tag::new("privacy", ["open"]).unwrap())
            .unwrap();
        decls.add_dependency("a", "b");
        decls.add_dependency("b", "a");

        match DependencyGraph::build(&decls) {
            Err(Error::Cycle { ids }) => {
                let names: BTreeSet<&str> = ids.iter().map(LogicalId::as_str).collect();
                assert_eq!(names, BTreeSet::from(["a", "b"]));
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_cycle_through_implicit_edge() {
        let mut decls = privacy_scenario();
        // the tag cannot wait for a grant that needs the tag
        decls.add_dependency("privacy_tag", "grant_ds");
        let err = DependencyGraph::build(&decls).unwrap_err();
        match err {
            Error::Cycle { ids } => assert!(ids.contains(&id("privacy_tag"))),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_location_grant_waits_for_registration() {
        let mut decls = DeclarationSet::new("123456789012");
        decls
            .submit_grant(
                "grant_location",
                Principal::role("arn:aws:iam::1:role/LakeFormationWorkFlowRole").unwrap(),
                Resource::data_location("arn:aws:s3:::lake/raw").unwrap(),
                permission_set(["DATA_LOCATION_ACCESS"]).unwrap(),
                permission_set(["DATA_LOCATION_ACCESS"]).unwrap(),
            )
            .unwrap();
        decls
            .register_location(
                "register_lake",
                DataLocationRegistration::service_linked("arn:aws:s3:::lake").unwrap(),
            )
            .unwrap();
        let graph = DependencyGraph::build(&decls).unwrap();
        assert_eq!(
            graph.dependencies_of(&id("grant_location")),
            vec![&id("register_lake")]
        );
    }

    #[test]
    fn test_sibling_bucket_is_not_a_dependency() {
        let mut decls = DeclarationSet::new("123456789012");
        decls
            .register_location(
                "register_lake",
                DataLocationRegistration::service_linked("arn:aws:s3:::lake").unwrap(),
            )
            .unwrap();
        decls
            .register_location(
                "register_house",
                DataLocationRegistration::service_linked("arn:aws:s3:::lakehouse").unwrap(),
            )
            .unwrap();
        decls
            .submit_grant(
                "grant_house",
                Principal::role("arn:aws:iam::1:role/LakeFormationWorkFlowRole").unwrap(),
                Resource::data_location("arn:aws:s3:::lakehouse").unwrap(),
                permission_set(["DATA_LOCATION_ACCESS"]).unwrap(),
                BTreeSet::new(),
            )
            .unwrap();

        let graph = DependencyGraph::build(&decls).unwrap();
        assert_eq!(
            graph.dependencies_of(&id("grant_house")),
            vec![&id("register_house")]
        );
    }

    #[test]
    fn test_cycle_is_reported_in_dependency_order() {
        let mut decls = DeclarationSet::new("123456789012");
        for (name, key) in [("a", "k1"), ("b", "k2"), ("c", "k3")] {
            decls.declare_tag(name, Tag::new(key, ["v"]).unwrap()).unwrap();
        }
        decls.add_dependency("b", "a");
        decls.add_dependency("c", "b");
        decls.add_dependency("a", "c");

        match DependencyGraph::build(&decls) {
            Err(Error::Cycle { ids }) => {
                assert_eq!(ids, vec![id("a"), id("b"), id("c")]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_grant_waits_for_principal_creator_and_aliases_resolve() {
        let mut decls = privacy_scenario();
        decls
            .declare_tag("privacy_dup", Tag::new("privacy", ["open"]).unwrap())
            .unwrap();
        decls
            .declare_principal(Principal::user("ds-1").unwrap(), "assoc_privacy")
            .unwrap();
        decls
            .register_location(
                "register_lake",
                DataLocationRegistration::service_linked("arn:aws:s3:::lake").unwrap(),
            )
            .unwrap();
        decls.add_dependency("register_lake", "privacy_dup");

        let graph = DependencyGraph::build(&decls).unwrap();
        assert!(graph.has_edge(&id("privacy_tag"), &id("register_lake")));
        assert_eq!(graph.len(), 4);
    }

    #[test]
    fn test_independent_nodes_share_a_level() {
        let mut decls = DeclarationSet::new("123456789012");
        decls
            .declare_tag("env", Tag::new("environment", ["production"]).unwrap())
            .unwrap();
        decls
            .declare_tag("privacy", Tag::new("privacy", ["open"]).unwrap())
            .unwrap();
        let graph = DependencyGraph::build(&decls).unwrap();
        assert_eq!(graph.levels(), vec![vec![0, 1]]);
        assert!(graph.descendants(0).is_empty());
    }
}
