//! Structural properties of graph assembly and community detection

use friend_network::community::modularity;
use friend_network::{
    CancelFlag, FriendRecord, IdentityStore, Louvain, MutualResult, Partition, SocialGraph,
};
use proptest::prelude::*;
use std::collections::HashSet;

fn friend_id(i: usize) -> String {
    format!("usr_{:02}", i)
}

/// Friend count plus mutual reports, some of which point outside the friend set
fn arb_network() -> impl Strategy<Value = (usize, Vec<(usize, Vec<usize>)>)> {
    (1usize..16).prop_flat_map(|friends| {
        let report = (0..friends, prop::collection::vec(0..friends + 4, 0..8));
        (Just(friends), prop::collection::vec(report, 0..24))
    })
}

fn build(friends: usize, reports: &[(usize, Vec<usize>)]) -> (IdentityStore, SocialGraph) {
    let identities = IdentityStore::from_records(
        (0..friends).map(|i| FriendRecord::new(friend_id(i), format!("Friend {}", i))),
    )
    .unwrap();
    let results: Vec<MutualResult> = reports
        .iter()
        .map(|(reporter, mutuals)| {
            MutualResult::ok(friend_id(*reporter), mutuals.iter().map(|m| friend_id(*m)).collect())
        })
        .collect();
    let graph = SocialGraph::build(&identities, &results);
    (identities, graph)
}

proptest! {
    #[test]
    fn prop_no_phantom_nodes_or_edges((friends, reports) in arb_network()) {
        let (identities, graph) = build(friends, &reports);

        prop_assert_eq!(graph.node_count(), identities.len());
        for (_, node) in graph.nodes() {
            prop_assert!(identities.contains(&node.user_id));
        }
        for (a, b, weight) in graph.edges() {
            prop_assert!(a != b);
            prop_assert!(identities.contains(&graph.node(a).user_id));
            prop_assert!(identities.contains(&graph.node(b).user_id));
            prop_assert!((1..=2).contains(&weight));
        }
    }

    #[test]
    fn prop_detection_yields_a_partition((friends, reports) in arb_network()) {
        let (identities, graph) = build(friends, &reports);
        let partition = Louvain::default().detect(&graph, &CancelFlag::new()).unwrap();

        prop_assert_eq!(partition.assignment().len(), graph.node_count());

        let mut seen = HashSet::new();
        for community in partition.communities(&graph) {
            prop_assert!(community.size > 0);
            prop_assert_eq!(community.size, community.members.len());
            for member in community.members {
                prop_assert!(seen.insert(member));
            }
        }
        let all: HashSet<String> = identities.ids().map(str::to_string).collect();
        prop_assert_eq!(seen, all);
    }

    #[test]
    fn prop_detection_never_loses_modularity((friends, reports) in arb_network()) {
        let (_, graph) = build(friends, &reports);
        let partition = Louvain::default().detect(&graph, &CancelFlag::new()).unwrap();
        let baseline = Partition::singletons(&graph).modularity();

        prop_assert!(partition.modularity() >= baseline - 1e-9);
        prop_assert!((partition.modularity() - modularity(&graph, partition.assignment())).abs() < 1e-9);
        if graph.edge_count() == 0 {
            prop_assert_eq!(partition.modularity(), 0.0);
            prop_assert_eq!(partition.community_count(), graph.node_count());
        }
    }

    #[test]
    fn prop_detection_is_deterministic((friends, reports) in arb_network()) {
        let (_, graph) = build(friends, &reports);
        let first = Louvain::default().detect(&graph, &CancelFlag::new()).unwrap();
        let second = Louvain::default().detect(&graph, &CancelFlag::new()).unwrap();
        prop_assert_eq!(first.assignment(), second.assignment());
    }
}
