// Property-based tests for traversal and partition invariants.
//
// Two categories:
// 1. Traversal: arbitrary signal graphs (cycles included) produce a
//    terminating, duplicate-free traversal that trims to a consistent graph
// 2. Pipeline: arbitrary acyclic graphs compile, and the precompile cert
//    passes with disjoint hot/cold groups
//
// Uses proptest with explicit configuration to prevent CI flakiness.

use std::collections::HashSet;

use dspc::graph::{trim_graph, Endpoint, Graph, Node, PortletKind};
use dspc::pass::{PassId, StageCert};
use dspc::pipeline::{run_pipeline, CompilationState};
use dspc::settings::{CompilationSettings, UserSettings};
use dspc::traversal::build_full_graph_traversal;
use proptest::prelude::*;

// ── Graph generator ─────────────────────────────────────────────────────────

const REGISTRY: &str = r#"{
    "nodes": {
        "osc~": { "loop": "${outs.0} = ${ins.0} + ${ins.1}" },
        "mul~": {
            "flags": { "isPureFunction": true, "isLoopInline": true },
            "loop": "${ins.0} * ${ins.1}"
        },
        "dac~": { "loop": "// write ${ins.0} ${ins.1}" }
    }
}"#;

#[derive(Debug, Clone)]
struct GraphSpec {
    /// Node type index per node (0 = osc~, 1 = mul~).
    types: Vec<usize>,
    pulling: Vec<bool>,
    /// (source node, sink node, sink inlet)
    edges: Vec<(usize, usize, usize)>,
}

fn arb_graph_spec(acyclic: bool) -> impl Strategy<Value = GraphSpec> {
    (2usize..9).prop_flat_map(move |n| {
        (
            prop::collection::vec(0usize..2, n),
            prop::collection::vec(any::<bool>(), n),
            prop::collection::vec((0..n, 0..n, 0usize..2), 0..(n * 2)),
        )
            .prop_map(move |(types, pulling, edges)| {
                let edges = edges
                    .into_iter()
                    .filter(|(from, to, _)| !acyclic || from < to)
                    .collect();
                GraphSpec {
                    types,
                    pulling,
                    edges,
                }
            })
    })
}

fn build_graph(spec: &GraphSpec) -> Graph {
    let mut graph = Graph::new();
    for (i, typ) in spec.types.iter().enumerate() {
        let node_type = if spec.pulling[i] {
            "dac~"
        } else if *typ == 0 {
            "osc~"
        } else {
            "mul~"
        };
        let mut node = Node::new(format!("n{}", i), node_type)
            .with_inlet("0", PortletKind::Signal)
            .with_inlet("1", PortletKind::Signal)
            .with_outlet("0", PortletKind::Signal);
        if spec.pulling[i] {
            node = node.pulling_signal();
        }
        graph.insert(node);
    }
    for (from, to, inlet) in &spec.edges {
        graph
            .connect(
                Endpoint::new(format!("n{}", from), "0"),
                Endpoint::new(format!("n{}", to), inlet.to_string()),
            )
            .unwrap();
    }
    graph
}

fn signal_sources(graph: &Graph, id: &str) -> Vec<String> {
    graph.nodes[id]
        .sources
        .values()
        .flatten()
        .map(|e| e.node_id.clone())
        .collect()
}

// ── Traversal invariants ────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 200,
        max_shrink_iters: 200,
        .. ProptestConfig::default()
    })]

    #[test]
    fn traversal_lists_each_reachable_node_once(spec in arb_graph_spec(false)) {
        let graph = build_graph(&spec);
        let traversal = build_full_graph_traversal(&graph, &CompilationSettings::default())
            .unwrap();

        let unique: HashSet<&String> = traversal.iter().collect();
        prop_assert_eq!(unique.len(), traversal.len(), "duplicates in {:?}", traversal);

        for (i, pulling) in spec.pulling.iter().enumerate() {
            if *pulling {
                let name = format!("n{}", i);
                prop_assert!(traversal.contains(&name));
            }
        }
        // Closed under signal sources.
        for id in &traversal {
            for source in signal_sources(&graph, id) {
                prop_assert!(unique.contains(&source), "{} missing from {:?}", source, traversal);
            }
        }
    }

    #[test]
    fn acyclic_traversal_puts_sources_first(spec in arb_graph_spec(true)) {
        let graph = build_graph(&spec);
        let traversal = build_full_graph_traversal(&graph, &CompilationSettings::default())
            .unwrap();
        let position = |id: &str| traversal.iter().position(|n| n == id);
        for id in &traversal {
            for source in signal_sources(&graph, id) {
                prop_assert!(
                    position(&source) < position(id),
                    "{} listed after its sink {} in {:?}",
                    source,
                    id,
                    traversal
                );
            }
        }
    }

    #[test]
    fn trimmed_graph_is_consistent(spec in arb_graph_spec(false)) {
        let graph = build_graph(&spec);
        let traversal = build_full_graph_traversal(&graph, &CompilationSettings::default())
            .unwrap();
        let trimmed = trim_graph(&graph, &traversal);

        prop_assert_eq!(trimmed.len(), traversal.len());
        prop_assert!(trimmed.check_integrity().is_ok());
        for node in trimmed.nodes.values() {
            for endpoint in node.sources.values().chain(node.sinks.values()).flatten() {
                prop_assert!(trimmed.get(&endpoint.node_id).is_some());
            }
        }
    }
}

// ── Pipeline invariants ─────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 100,
        max_shrink_iters: 200,
        .. ProptestConfig::default()
    })]

    #[test]
    fn acyclic_graphs_compile_with_a_passing_cert(spec in arb_graph_spec(true)) {
        let graph = build_graph(&spec);
        let registry = dspc::template::load_registry(REGISTRY).unwrap();
        let mut state = CompilationState::new(&graph, &registry, UserSettings::default());
        let result = run_pipeline(&mut state, PassId::Assemble, false, |_, _| {});
        prop_assert!(result.is_ok(), "pipeline failed: {:?}", result.err());

        let cert = state.cert.as_ref().unwrap();
        prop_assert!(cert.all_pass(), "obligations: {:?}", cert.obligations());

        let code = state.precompiled.as_ref().unwrap();
        let traversal = state.traversal.as_ref().unwrap();
        let mut seen = HashSet::new();
        let groups = std::iter::once(&code.graph.hot)
            .chain(code.graph.cold.iter().map(|g| &g.group));
        for group in groups {
            for id in &group.traversal {
                prop_assert!(seen.insert(id.clone()), "{} in two groups", id);
                prop_assert!(traversal.contains(id));
                prop_assert!(!code.node(id).unwrap().inlined);
            }
        }
        // Pulling nodes never move to a cold group.
        for group in &code.graph.cold {
            for id in &group.group.traversal {
                prop_assert!(!graph.nodes[id.as_str()].is_pulling_signal);
            }
        }
    }
}
