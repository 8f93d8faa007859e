//! Friend graph assembly.
//!
//! Every known friend becomes a node, inserted in ascending user id order so
//! that node indices are a canonical traversal order. An edge joins two
//! friends when either one lists the other as a mutual connection. Each
//! directed report (reporter lists friend) counts once toward the edge weight,
//! so a relationship confirmed from both sides weighs 2 and a one-sided one 1.

use petgraph::graph::{EdgeIndex, NodeIndex, UnGraph};
use petgraph::unionfind::UnionFind;
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::cache::MutualResult;
use crate::identity::IdentityStore;

/// Top entries kept in [`GraphStats::top_connected`]
const TOP_CONNECTED: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FriendNode {
    pub user_id: String,
    pub display_name: String,
    /// Number of distinct neighbors in the graph
    pub degree: usize,
    /// Length of the friend's raw mutual list, including non-friends
    pub mutual_count: usize,
    pub community: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphStats {
    pub node_count: usize,
    pub edge_count: usize,
    pub community_count: usize,
    /// edges / (n * (n - 1) / 2)
    pub density: f64,
    pub avg_degree: f64,
    pub isolated_count: usize,
    pub component_count: usize,
    pub largest_component: usize,
    /// (display name, degree), most connected first
    pub top_connected: Vec<(String, usize)>,
}

#[derive(Debug, Clone, Default)]
pub struct SocialGraph {
    graph: UnGraph<FriendNode, u32>,
    index: HashMap<String, NodeIndex>,
}

impl SocialGraph {
    /// Assemble the graph from known friends and their `ok` fetch results.
    /// Results with any other status are ignored.
    pub fn build<'r, I>(identities: &IdentityStore, results: I) -> Self
    where
        I: IntoIterator<Item = &'r MutualResult>,
    {
        let mut graph = UnGraph::with_capacity(identities.len(), 0);
        let mut index = HashMap::with_capacity(identities.len());

        for record in identities.records() {
            let id = record.user_id.clone();
            let node = graph.add_node(FriendNode {
                user_id: record.user_id,
                display_name: record.display_name,
                degree: 0,
                mutual_count: 0,
                community: None,
            });
            index.insert(id, node);
        }

        let mut results: Vec<&MutualResult> = results.into_iter().filter(|r| r.is_ok()).collect();
        results.sort_by(|a, b| a.user_id.cmp(&b.user_id));

        let mut evidence: HashSet<(NodeIndex, NodeIndex)> = HashSet::new();
        let mut outside = 0usize;

        for result in results {
            let Some(&reporter) = index.get(&result.user_id) else {
                continue;
            };
            graph[reporter].mutual_count = result.mutual_ids.len();

            for mutual_id in &result.mutual_ids {
                let Some(&other) = index.get(mutual_id) else {
                    outside += 1;
                    continue;
                };
                if other == reporter || !evidence.insert((reporter, other)) {
                    continue;
                }

                if let Some(edge) = graph.find_edge(reporter, other) {
                    graph[edge] += 1;
                } else {
                    graph.add_edge(reporter, other, 1);
                }
            }
        }

        let nodes: Vec<NodeIndex> = graph.node_indices().collect();
        for node in nodes {
            graph[node].degree = graph.neighbors(node).count();
        }

        debug!(
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            outside_mutuals = outside,
            "Built friend graph"
        );
        Self { graph, index }
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn inner(&self) -> &UnGraph<FriendNode, u32> {
        &self.graph
    }

    pub fn node(&self, node: NodeIndex) -> &FriendNode {
        &self.graph[node]
    }

    pub fn index_of(&self, user_id: &str) -> Option<NodeIndex> {
        self.index.get(user_id).copied()
    }

    /// Nodes in canonical (ascending user id) order
    pub fn nodes(&self) -> impl Iterator<Item = (NodeIndex, &FriendNode)> {
        self.graph
            .node_indices()
            .map(move |node| (node, &self.graph[node]))
    }

    /// `(a, b, weight)` with `a < b` by node index
    pub fn edges(&self) -> impl Iterator<Item = (NodeIndex, NodeIndex, u32)> + '_ {
        self.graph.edge_references().map(|edge| {
            let (a, b) = (edge.source(), edge.target());
            (a.min(b), a.max(b), *edge.weight())
        })
    }

    pub fn edge_between(&self, a: &str, b: &str) -> Option<EdgeIndex> {
        self.graph.find_edge(self.index_of(a)?, self.index_of(b)?)
    }

    pub fn weight(&self, a: &str, b: &str) -> Option<u32> {
        self.edge_between(a, b).map(|edge| self.graph[edge])
    }

    /// Neighbors in ascending index order
    pub fn neighbors(&self, node: NodeIndex) -> Vec<NodeIndex> {
        let mut neighbors: Vec<NodeIndex> = self.graph.neighbors(node).collect();
        neighbors.sort();
        neighbors.dedup();
        neighbors
    }

    /// Record a community id per node, indexed by node index
    pub fn assign_communities(&mut self, assignment: &[usize]) {
        for (position, &community) in assignment.iter().enumerate() {
            let node = NodeIndex::new(position);
            if let Some(weight) = self.graph.node_weight_mut(node) {
                weight.community = Some(community);
            }
        }
    }

    pub fn stats(&self) -> GraphStats {
        let node_count = self.node_count();
        let edge_count = self.edge_count();

        let density = if node_count > 1 {
            edge_count as f64 / (node_count * (node_count - 1) / 2) as f64
        } else {
            0.0
        };
        let avg_degree = if node_count > 0 {
            2.0 * edge_count as f64 / node_count as f64
        } else {
            0.0
        };

        let mut components = UnionFind::new(node_count);
        for (a, b, _) in self.edges() {
            components.union(a.index(), b.index());
        }
        let mut sizes: HashMap<usize, usize> = HashMap::new();
        for label in components.into_labeling() {
            *sizes.entry(label).or_insert(0) += 1;
        }

        let communities: HashSet<usize> = self
            .graph
            .node_weights()
            .filter_map(|node| node.community)
            .collect();

        let mut by_degree: Vec<&FriendNode> = self.graph.node_weights().collect();
        by_degree.sort_by(|a, b| b.degree.cmp(&a.degree).then_with(|| a.user_id.cmp(&b.user_id)));
        let top_connected = by_degree
            .into_iter()
            .filter(|node| node.degree > 0)
            .take(TOP_CONNECTED)
            .map(|node| (node.display_name.clone(), node.degree))
            .collect();

        GraphStats {
            node_count,
            edge_count,
            community_count: communities.len(),
            density,
            avg_degree,
            isolated_count: self.graph.node_weights().filter(|n| n.degree == 0).count(),
            component_count: sizes.len(),
            largest_component: sizes.values().copied().max().unwrap_or(0),
            top_connected,
        }
    }
}
