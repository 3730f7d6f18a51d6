use proptest::prelude::*;

use troupe_core::topology::{
    AgentSpec, DefectCode, EdgeSpec, NodeKind, NodeSpec, TopologyConfig,
};

fn node(id: String, kind: NodeKind) -> NodeSpec {
    NodeSpec {
        name: id.to_uppercase(),
        id,
        kind,
        agent_config: AgentSpec {
            role: "worker".into(),
            instructions: "do the work".into(),
            provider: "mock".into(),
            model_id: "m1".into(),
            tools: vec![],
            temperature: 0.7,
            max_tokens: None,
        },
        coordination_strategy: None,
    }
}

/// Random tree-shaped topologies rooted at a global supervisor: every
/// non-root node gets exactly one parent that was created before it.
fn arb_tree() -> impl Strategy<Value = TopologyConfig> {
    (2usize..=10)
        .prop_flat_map(|n| {
            let parents: Vec<BoxedStrategy<usize>> =
                (1..n).map(|i| (0..i).boxed()).collect();
            parents
        })
        .prop_map(|parents| {
            let mut nodes = vec![node("g".into(), NodeKind::GlobalSupervisor)];
            let mut edges = Vec::new();
            for (i, parent) in parents.into_iter().enumerate() {
                let id = format!("a{}", i + 1);
                let parent_id = if parent == 0 {
                    "g".to_string()
                } else {
                    format!("a{parent}")
                };
                nodes.push(node(id.clone(), NodeKind::Agent));
                edges.push(EdgeSpec {
                    source: parent_id,
                    target: id,
                    condition_label: None,
                });
            }
            TopologyConfig {
                nodes,
                edges,
                entry_point: "g".into(),
                output_schema: None,
            }
        })
}

proptest! {
    /// A supervisor-rooted tree of depth < 10 always validates and
    /// compiles to a complete arena.
    #[test]
    fn generated_trees_validate_and_compile(topo in arb_tree()) {
        let report = topo.validate_structure();
        prop_assert!(report.is_ok(), "unexpected defects: {report}");

        let graph = topo.compile().unwrap();
        prop_assert_eq!(graph.topo_order.len(), topo.nodes.len());
        prop_assert_eq!(graph.entry, graph.index["g"]);
        for &idx in &graph.topo_order {
            prop_assert!(graph.depth[idx] < topo.nodes.len());
        }
        // Every non-entry node is reachable from the entry.
        let reachable = graph.descendants(graph.entry);
        prop_assert_eq!(reachable.len(), topo.nodes.len() - 1);
    }

    /// Closing the tree back onto the root plants exactly the defects
    /// the validator must report: a cycle and a lost entry point.
    #[test]
    fn planted_cycle_is_reported(topo in arb_tree()) {
        let mut broken = topo;
        let last = broken.nodes.last().unwrap().id.clone();
        broken.edges.push(EdgeSpec {
            source: last,
            target: "g".into(),
            condition_label: None,
        });

        let report = broken.validate_structure();
        prop_assert!(report.has(DefectCode::Cycle), "missing cycle: {report}");
        prop_assert!(report.has(DefectCode::NoEntryPoint));
        prop_assert!(broken.compile().is_err());
    }

    /// Duplicating any node id is always reported.
    #[test]
    fn planted_duplicate_is_reported(topo in arb_tree(), pick in 0usize..10) {
        let mut broken = topo;
        let duplicate = broken.nodes[pick % broken.nodes.len()].clone();
        broken.nodes.push(duplicate);

        let report = broken.validate_structure();
        prop_assert!(report.has(DefectCode::DuplicateId), "missing duplicate: {report}");
    }

    /// Dangling an edge at a ghost node is always reported, and the
    /// rest of the graph is still checked in the same pass.
    #[test]
    fn planted_dangling_edge_is_reported(topo in arb_tree()) {
        let mut broken = topo;
        broken.edges.push(EdgeSpec {
            source: "g".into(),
            target: "ghost".into(),
            condition_label: None,
        });

        let report = broken.validate_structure();
        prop_assert!(report.has(DefectCode::DanglingEdge), "missing dangling edge: {report}");
        prop_assert!(!report.has(DefectCode::Cycle));
    }
}
