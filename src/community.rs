//! Louvain modularity optimization.
//!
//! Each level starts with every (super-)node in its own community, then sweeps
//! the nodes in index order, moving each into the neighboring community with
//! the largest modularity gain until a sweep changes nothing. Communities are
//! then collapsed into super-nodes and the process repeats on the smaller
//! graph, until a level makes no move at all.
//!
//! Node index order is ascending user id (see [`SocialGraph`]) and candidate
//! communities are visited in ascending id, with ties going to the lowest id,
//! so the result depends only on the graph. No randomness is involved.

use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::cancel::CancelFlag;
use crate::config::CommunityConfig;
use crate::graph::SocialGraph;

/// Gains closer than this count as equal
const EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Community {
    pub id: usize,
    /// Member user ids in canonical order
    pub members: Vec<String>,
    pub size: usize,
}

/// A total assignment of nodes to communities
#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    assignment: Vec<usize>,
    modularity: f64,
    levels: usize,
}

impl Partition {
    /// Every node alone, the starting point of the first level
    pub fn singletons(graph: &SocialGraph) -> Self {
        let assignment: Vec<usize> = (0..graph.node_count()).collect();
        let modularity = modularity(graph, &assignment);
        Self {
            assignment,
            modularity,
            levels: 0,
        }
    }

    /// Community id per node, indexed by node index
    pub fn assignment(&self) -> &[usize] {
        &self.assignment
    }

    pub fn community_of(&self, node: petgraph::graph::NodeIndex) -> usize {
        self.assignment[node.index()]
    }

    pub fn modularity(&self) -> f64 {
        self.modularity
    }

    /// Aggregation levels that produced at least one move
    pub fn levels(&self) -> usize {
        self.levels
    }

    pub fn community_count(&self) -> usize {
        self.assignment.iter().max().map_or(0, |max| max + 1)
    }

    pub fn communities(&self, graph: &SocialGraph) -> Vec<Community> {
        let mut communities: Vec<Community> = (0..self.community_count())
            .map(|id| Community {
                id,
                members: Vec::new(),
                size: 0,
            })
            .collect();
        for (node, friend) in graph.nodes() {
            let community = &mut communities[self.community_of(node)];
            community.members.push(friend.user_id.clone());
            community.size += 1;
        }
        communities
    }
}

/// Weighted graph for one aggregation level. Self-loops hold the weight of
/// edges already internal to a super-node.
struct Level {
    adjacency: Vec<Vec<(usize, f64)>>,
    self_loops: Vec<f64>,
    degree: Vec<f64>,
    total_weight: f64,
}

impl Level {
    fn from_graph(graph: &SocialGraph) -> Self {
        let inner = graph.inner();
        let n = graph.node_count();
        let mut adjacency = vec![Vec::new(); n];
        let mut total_weight = 0.0;

        for edge in inner.edge_references() {
            let (a, b) = (edge.source().index(), edge.target().index());
            let weight = f64::from(*edge.weight());
            if a == b {
                continue;
            }
            adjacency[a].push((b, weight));
            adjacency[b].push((a, weight));
            total_weight += weight;
        }

        let degree: Vec<f64> = adjacency
            .iter()
            .map(|links| links.iter().map(|(_, w)| w).sum::<f64>())
            .collect();

        Self {
            adjacency,
            self_loops: vec![0.0; n],
            degree,
            total_weight,
        }
    }

    fn len(&self) -> usize {
        self.adjacency.len()
    }

    /// Collapse each community into one node
    fn aggregate(&self, community: &[usize], count: usize) -> Level {
        let mut self_loops = vec![0.0; count];
        let mut degree = vec![0.0; count];
        let mut links: Vec<BTreeMap<usize, f64>> = vec![BTreeMap::new(); count];

        for node in 0..self.len() {
            let c = community[node];
            self_loops[c] += self.self_loops[node];
            degree[c] += self.degree[node];
            for &(neighbor, weight) in &self.adjacency[node] {
                let d = community[neighbor];
                if c == d {
                    if node < neighbor {
                        self_loops[c] += weight;
                    }
                } else {
                    *links[c].entry(d).or_insert(0.0) += weight;
                }
            }
        }

        Level {
            adjacency: links.into_iter().map(|m| m.into_iter().collect()).collect(),
            self_loops,
            degree,
            total_weight: self.total_weight,
        }
    }

    /// Local-move phase. Returns the renumbered community of every node and
    /// whether any node moved, or `None` when cancelled.
    fn local_moves(&self, max_passes: usize, cancel: &CancelFlag) -> Option<(Vec<usize>, bool)> {
        let n = self.len();
        let mut community: Vec<usize> = (0..n).collect();
        let mut totals = self.degree.clone();
        let two_m = 2.0 * self.total_weight;
        let mut moved_any = false;

        if two_m <= 0.0 {
            return Some((community, false));
        }

        for pass in 0..max_passes {
            if cancel.is_cancelled() {
                return None;
            }
            let mut moved = false;

            for node in 0..n {
                let current = community[node];
                let k = self.degree[node];

                let mut links: BTreeMap<usize, f64> = BTreeMap::new();
                for &(neighbor, weight) in &self.adjacency[node] {
                    *links.entry(community[neighbor]).or_insert(0.0) += weight;
                }

                totals[current] -= k;
                let stay = links.get(&current).copied().unwrap_or(0.0) - totals[current] * k / two_m;

                let mut best: Option<(usize, f64)> = None;
                for (&candidate, &weight) in &links {
                    if candidate == current {
                        continue;
                    }
                    let gain = weight - totals[candidate] * k / two_m;
                    if best.is_none_or(|(_, best_gain)| gain > best_gain + EPSILON) {
                        best = Some((candidate, gain));
                    }
                }

                let target = match best {
                    Some((candidate, gain)) if gain > stay + EPSILON => candidate,
                    _ => current,
                };
                totals[target] += k;
                if target != current {
                    community[node] = target;
                    moved = true;
                }
            }

            debug!(pass, moved, "Louvain local-move pass");
            if !moved {
                break;
            }
            moved_any = true;
        }

        Some((renumber(&community), moved_any))
    }
}

/// Relabel communities 0.. in order of first appearance
fn renumber(community: &[usize]) -> Vec<usize> {
    let mut labels: BTreeMap<usize, usize> = BTreeMap::new();
    let mut order = Vec::with_capacity(community.len());
    for &c in community {
        let next = labels.len();
        order.push(*labels.entry(c).or_insert(next));
    }
    order
}

/// Newman modularity of `assignment` (community per node index).
/// Zero for a graph without edges.
pub fn modularity(graph: &SocialGraph, assignment: &[usize]) -> f64 {
    let count = assignment.iter().max().map_or(0, |max| max + 1);
    let mut internal = vec![0.0; count];
    let mut totals = vec![0.0; count];
    let mut m = 0.0;

    for (a, b, weight) in graph.edges() {
        let weight = f64::from(weight);
        let (ca, cb) = (assignment[a.index()], assignment[b.index()]);
        if ca == cb {
            internal[ca] += weight;
        }
        totals[ca] += weight;
        totals[cb] += weight;
        m += weight;
    }

    if m <= 0.0 {
        return 0.0;
    }
    internal
        .iter()
        .zip(&totals)
        .map(|(inside, total)| inside / m - (total / (2.0 * m)).powi(2))
        .sum()
}

#[derive(Debug, Clone)]
pub struct Louvain {
    pub max_passes: usize,
    pub max_levels: usize,
}

impl Default for Louvain {
    fn default() -> Self {
        Self::from(&CommunityConfig::default())
    }
}

impl From<&CommunityConfig> for Louvain {
    fn from(config: &CommunityConfig) -> Self {
        Self {
            max_passes: config.max_passes,
            max_levels: config.max_levels,
        }
    }
}

impl Louvain {
    /// Partition `graph`, or `None` if `cancel` fires between passes
    pub fn detect(&self, graph: &SocialGraph, cancel: &CancelFlag) -> Option<Partition> {
        let mut assignment: Vec<usize> = (0..graph.node_count()).collect();
        let mut level = Level::from_graph(graph);
        let mut levels = 0;

        while levels < self.max_levels {
            let (community, moved) = level.local_moves(self.max_passes, cancel)?;
            if !moved {
                break;
            }
            levels += 1;

            for slot in assignment.iter_mut() {
                *slot = community[*slot];
            }
            let count = community.iter().max().map_or(0, |max| max + 1);
            debug!(level = levels, communities = count, "Louvain level complete");
            level = level.aggregate(&community, count);
        }

        let assignment = renumber(&assignment);
        let modularity = modularity(graph, &assignment);
        debug!(
            communities = assignment.iter().max().map_or(0, |max| max + 1),
            modularity,
            levels,
            "Community detection finished"
        );
        Some(Partition {
            assignment,
            modularity,
            levels,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MutualResult;
    use crate::identity::{FriendRecord, IdentityStore};

    fn graph(ids: &[&str], edges: &[(&str, &str)]) -> SocialGraph {
        let identities =
            IdentityStore::from_records(ids.iter().map(|id| FriendRecord::new(*id, *id))).unwrap();
        let results: Vec<MutualResult> = edges
            .iter()
            .map(|(a, b)| MutualResult::ok(*a, vec![b.to_string()]))
            .collect();
        SocialGraph::build(&identities, &results)
    }

    fn two_triangles() -> SocialGraph {
        graph(
            &["a1", "a2", "a3", "b1", "b2", "b3"],
            &[
                ("a1", "a2"),
                ("a2", "a3"),
                ("a1", "a3"),
                ("b1", "b2"),
                ("b2", "b3"),
                ("b1", "b3"),
                ("a3", "b1"),
            ],
        )
    }

    #[test]
    fn test_chain_collapses_to_one_community() {
        let g = graph(&["a", "b", "c"], &[("a", "b"), ("b", "c")]);
        let partition = Louvain::default().detect(&g, &CancelFlag::new()).unwrap();

        assert_eq!(partition.assignment(), &[0, 0, 0]);
        assert_eq!(partition.community_count(), 1);
        assert!(partition.modularity().abs() < 1e-9);
        assert!(partition.modularity() > Partition::singletons(&g).modularity());
    }

    #[test]
    fn test_two_triangles_split() {
        let g = two_triangles();
        let partition = Louvain::default().detect(&g, &CancelFlag::new()).unwrap();

        assert_eq!(partition.assignment(), &[0, 0, 0, 1, 1, 1]);
        // 2 * (3/7 - (7/14)^2)
        assert!((partition.modularity() - (2.0 * (3.0 / 7.0 - 0.25))).abs() < 1e-9);

        let communities = partition.communities(&g);
        assert_eq!(communities.len(), 2);
        assert_eq!(communities[0].members, vec!["a1", "a2", "a3"]);
        assert_eq!(communities[1].size, 3);
    }

    #[test]
    fn test_deterministic() {
        let g = two_triangles();
        let louvain = Louvain::default();
        let first = louvain.detect(&g, &CancelFlag::new()).unwrap();
        let second = louvain.detect(&g, &CancelFlag::new()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_edgeless_graph_keeps_singletons() {
        let g = graph(&["a", "b", "c"], &[]);
        let partition = Louvain::default().detect(&g, &CancelFlag::new()).unwrap();
        assert_eq!(partition.assignment(), &[0, 1, 2]);
        assert_eq!(partition.modularity(), 0.0);
        assert_eq!(partition.levels(), 0);
    }

    #[test]
    fn test_isolated_node_stays_alone() {
        let g = graph(&["a", "b", "c", "z"], &[("a", "b"), ("b", "c"), ("a", "c")]);
        let partition = Louvain::default().detect(&g, &CancelFlag::new()).unwrap();
        assert_eq!(partition.assignment(), &[0, 0, 0, 1]);
    }

    #[test]
    fn test_ring_of_cliques() {
        // Eight 4-cliques joined in a ring by single edges
        let mut ids = Vec::new();
        let mut edges = Vec::new();
        for clique in 0..8 {
            let members: Vec<String> = (0..4).map(|i| format!("c{}_{}", clique, i)).collect();
            for i in 0..4 {
                for j in (i + 1)..4 {
                    edges.push((members[i].clone(), members[j].clone()));
                }
            }
            edges.push((members[3].clone(), format!("c{}_0", (clique + 1) % 8)));
            ids.extend(members);
        }
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let edge_refs: Vec<(&str, &str)> =
            edges.iter().map(|(a, b)| (a.as_str(), b.as_str())).collect();
        let g = graph(&id_refs, &edge_refs);

        let partition = Louvain::default().detect(&g, &CancelFlag::new()).unwrap();
        let count = partition.community_count();
        assert!((2..=8).contains(&count), "got {} communities", count);
        assert!(partition.modularity() > 0.5);

        // Clique members never end up split
        for clique in 0..8 {
            let first = g.index_of(&format!("c{}_0", clique)).unwrap();
            for i in 1..4 {
                let other = g.index_of(&format!("c{}_{}", clique, i)).unwrap();
                assert_eq!(partition.community_of(first), partition.community_of(other));
            }
        }
    }

    #[test]
    fn test_cancelled_detection() {
        let cancel = CancelFlag::new();
        cancel.request_cancel();
        assert!(Louvain::default().detect(&two_triangles(), &cancel).is_none());
    }

    #[test]
    fn test_renumber_by_first_appearance() {
        assert_eq!(renumber(&[5, 5, 2, 9, 2]), vec![0, 0, 1, 2, 1]);
    }
}
