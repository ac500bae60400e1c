// End-to-end precompilation scenarios on small hand-built graphs.
//
// Each test builds a graph with the builder API, loads node templates from
// an inline registry file, and runs every precompile pass through
// `dspc::precompile::precompile`. Assertions target the partition and the
// resolved signal expressions, not the assembled program text.

use dspc::ast::Sequence;
use dspc::graph::{Connection, Endpoint, Graph, Node, PortletKind};
use dspc::names::generate_variable_names_index;
use dspc::precompile::{precompile, DspGroup, PrecompileInput, PrecompiledCode};
use dspc::registry::NodeRegistry;
use dspc::settings::CompilationSettings;
use dspc::traversal::build_full_graph_traversal;

use PortletKind::Signal;

// ── Helpers ─────────────────────────────────────────────────────────────────

const REGISTRY: &str = r#"{
    "nodes": {
        "signalType": {
            "loop": "// loop signalType",
            "inletDsp": { "0": "// caching 0" }
        },
        "plainSignalType": {
            "loop": "// loop signalType"
        },
        "inlinableType0": {
            "flags": { "isLoopInline": true },
            "loop": "${args.value} + 1"
        },
        "inlinableType1": {
            "flags": { "isLoopInline": true },
            "loop": "${ins.0} * ${args.value}"
        },
        "inlinableType2": {
            "flags": { "isLoopInline": true },
            "loop": "${args.value} * ${ins.0} - ${args.value} * ${ins.1}"
        },
        "double": {
            "flags": { "isLoopInline": true, "isPureFunction": true },
            "loop": "${ins.0} * 2"
        },
        "increment": {
            "flags": { "isLoopInline": true, "isPureFunction": true },
            "loop": "${ins.0} + 1"
        },
        "square": {
            "flags": { "isLoopInline": true, "isPureFunction": true },
            "loop": "${ins.0} * ${ins.0}"
        },
        "inlinableAndColdType": {
            "flags": { "isLoopInline": true, "isPureFunction": true },
            "loop": "1 + ${ins.0}"
        }
    }
}"#;

fn registry() -> NodeRegistry {
    dspc::template::load_registry(REGISTRY).expect("registry should load")
}

fn node(id: &str, node_type: &str, inlets: &[&str], outlets: &[&str]) -> Node {
    let mut node = Node::new(id, node_type);
    for inlet in inlets {
        node = node.with_inlet(*inlet, Signal);
    }
    for outlet in outlets {
        node = node.with_outlet(*outlet, Signal);
    }
    node
}

fn valued(node: Node, value: &str) -> Node {
    node.with_arg("value", serde_json::json!(value))
}

fn link(graph: &mut Graph, from: (&str, &str), to: (&str, &str)) {
    graph
        .connect(Endpoint::new(from.0, from.1), Endpoint::new(to.0, to.1))
        .expect("connection should be valid");
}

fn run(graph: &Graph) -> PrecompiledCode {
    let registry = registry();
    let settings = CompilationSettings::default();
    let traversal = build_full_graph_traversal(graph, &settings).expect("traversal");
    let mut names = generate_variable_names_index(graph, false).expect("names");
    let input = PrecompileInput {
        graph,
        registry: &registry,
        settings: &settings,
    };
    precompile(input, &traversal, &mut names).expect("precompile should succeed")
}

fn ids(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

// ── Scenarios ───────────────────────────────────────────────────────────────

#[test]
fn inlinable_chain_collapses_into_one_expression() {
    let mut graph = Graph::new()
        .with_node(node("nonInline1", "plainSignalType", &[], &["0"]))
        .with_node(valued(node("n1", "inlinableType1", &["0"], &["0"]), "N1"))
        .with_node(valued(node("n2", "inlinableType0", &[], &["0"]), "N2"))
        .with_node(valued(node("n3", "inlinableType1", &["0"], &["0"]), "N3"))
        .with_node(valued(node("n4", "inlinableType2", &["0", "1"], &["0"]), "N4"))
        .with_node(node("nonInline2", "plainSignalType", &["0"], &[]).pulling_signal());
    link(&mut graph, ("nonInline1", "0"), ("n1", "0"));
    link(&mut graph, ("n1", "0"), ("n3", "0"));
    link(&mut graph, ("n2", "0"), ("n4", "0"));
    link(&mut graph, ("n3", "0"), ("n4", "1"));
    link(&mut graph, ("n4", "0"), ("nonInline2", "0"));

    let code = run(&graph);

    assert_eq!(
        code.node("nonInline2").unwrap().signal_ins["0"],
        "(N4 * (N2 + 1) - N4 * ((nonInline1_OUTS_0 * N1) * N3))"
    );
    assert_eq!(
        code.graph.hot,
        DspGroup {
            traversal: ids(&["nonInline1", "nonInline2"]),
            out_nodes: ids(&["nonInline2"]),
        }
    );
    assert!(code.graph.cold.is_empty());
    for inlined in ["n1", "n2", "n3", "n4"] {
        let precompiled = code.node(inlined).unwrap();
        assert!(precompiled.inlined, "{} should be inlined", inlined);
        assert!(precompiled.dsp.loop_code.is_none());
        assert!(precompiled.signal_outs.is_empty());
    }
}

#[test]
fn pure_inlinable_nodes_form_a_cold_group() {
    let mut graph = Graph::new()
        .with_node(node("n1", "inlinableAndColdType", &["0"], &["0"]))
        .with_node(node("n2", "inlinableAndColdType", &["0"], &["0"]))
        .with_node(node("n3", "plainSignalType", &[], &["0"]))
        .with_node(node("n4", "plainSignalType", &["0", "1"], &[]).pulling_signal());
    link(&mut graph, ("n1", "0"), ("n2", "0"));
    link(&mut graph, ("n2", "0"), ("n4", "0"));
    link(&mut graph, ("n3", "0"), ("n4", "1"));

    let code = run(&graph);

    assert_eq!(
        code.graph.hot,
        DspGroup {
            traversal: ids(&["n3", "n4"]),
            out_nodes: ids(&["n4"]),
        }
    );
    assert_eq!(code.graph.cold.len(), 1);
    let cold = &code.graph.cold[0];
    assert_eq!(
        cold.group,
        DspGroup {
            traversal: ids(&["n2"]),
            out_nodes: ids(&["n2"]),
        }
    );
    assert_eq!(
        cold.sink_connections,
        vec![Connection {
            source: Endpoint::new("n2", "0"),
            sink: Endpoint::new("n4", "0"),
        }]
    );
    assert_eq!(code.node("n2").unwrap().signal_ins["0"], "(1 + NULL_SIGNAL)");
    assert_eq!(
        code.node("n2").unwrap().dsp.loop_code,
        Some(Sequence::code("n2_OUTS_0 = 1 + (1 + NULL_SIGNAL)"))
    );
    assert!(code.node("n1").unwrap().inlined);
}

#[test]
fn inlet_dsp_of_a_cold_fed_sink_is_kept() {
    let mut graph = Graph::new()
        .with_node(node("n1", "inlinableAndColdType", &["0"], &["0"]))
        .with_node(node("n2", "signalType", &["0"], &[]).pulling_signal());
    link(&mut graph, ("n1", "0"), ("n2", "0"));

    let code = run(&graph);

    assert_eq!(code.graph.cold.len(), 1);
    let cold = &code.graph.cold[0];
    assert_eq!(
        cold.group,
        DspGroup {
            traversal: ids(&["n1"]),
            out_nodes: ids(&["n1"]),
        }
    );
    assert_eq!(
        cold.sink_connections,
        vec![Connection {
            source: Endpoint::new("n1", "0"),
            sink: Endpoint::new("n2", "0"),
        }]
    );
    assert_eq!(
        code.node("n2").unwrap().dsp.inlets["0"],
        Sequence::code("// caching 0")
    );
}

#[test]
fn pure_chain_after_a_hot_source_fuses_transitively() {
    let mut graph = Graph::new()
        .with_node(node("x", "plainSignalType", &[], &["0"]))
        .with_node(node("a", "double", &["0"], &["0"]))
        .with_node(node("b", "increment", &["0"], &["0"]))
        .with_node(node("c", "square", &["0"], &["0"]))
        .with_node(node("out", "plainSignalType", &["0"], &[]).pulling_signal());
    link(&mut graph, ("x", "0"), ("a", "0"));
    link(&mut graph, ("a", "0"), ("b", "0"));
    link(&mut graph, ("b", "0"), ("c", "0"));
    link(&mut graph, ("c", "0"), ("out", "0"));

    let code = run(&graph);

    // `x` is impure, so nothing downstream of it can go cold.
    assert!(code.graph.cold.is_empty());
    assert_eq!(code.graph.hot.traversal, ids(&["x", "out"]));
    assert_eq!(
        code.node("out").unwrap().signal_ins["0"],
        "(((x_OUTS_0 * 2) + 1) * ((x_OUTS_0 * 2) + 1))"
    );
}

#[test]
fn every_node_in_the_traversal_is_precompiled() {
    let mut graph = Graph::new()
        .with_node(node("src", "plainSignalType", &[], &["0"]))
        .with_node(node("out", "plainSignalType", &["0"], &[]).pulling_signal())
        .with_node(node("orphan", "plainSignalType", &[], &["0"]));
    link(&mut graph, ("src", "0"), ("out", "0"));

    let code = run(&graph);

    let precompiled: Vec<&String> = code.nodes.keys().collect();
    assert_eq!(precompiled, vec!["src", "out"]);
    assert_eq!(code.graph.full_traversal, ids(&["src", "out"]));
}

#[test]
fn very_long_signal_chain_compiles() {
    let n = 10_000;
    let mut graph = Graph::new();
    for i in 0..n {
        let mut chained = node(&format!("s{}", i), "plainSignalType", &["0"], &["0"]);
        if i == n - 1 {
            chained = chained.pulling_signal();
        }
        graph.insert(chained);
    }
    for i in 1..n {
        let (from, to) = (format!("s{}", i - 1), format!("s{}", i));
        link(&mut graph, (&from, "0"), (&to, "0"));
    }

    let code = run(&graph);

    assert_eq!(code.graph.full_traversal.len(), n);
    assert_eq!(code.graph.full_traversal[0], "s0");
    assert_eq!(code.graph.hot.traversal.len(), n);
    assert_eq!(code.graph.hot.out_nodes, vec![format!("s{}", n - 1)]);
    assert_eq!(
        code.node(&format!("s{}", n - 1)).unwrap().signal_ins["0"],
        format!("s{}_OUTS_0", n - 2)
    );
}
