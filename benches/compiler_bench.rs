use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use dspc::graph::{Endpoint, Graph, Node, PortletKind};
use dspc::names::generate_variable_names_index;
use dspc::pass::PassId;
use dspc::pipeline::{run_pipeline, CompilationState};
use dspc::precompile::{precompile, PrecompileInput};
use dspc::registry::NodeRegistry;
use dspc::settings::{CompilationSettings, UserSettings};
use dspc::traversal::build_full_graph_traversal;
use std::path::Path;

// KPI-aligned benchmark scenarios.
// Generated graphs only use node types declared in REGISTRY.

const REGISTRY: &str = r#"{
    "nodes": {
        "osc~": {
            "state": [{ "name": "phase", "type": "Float", "value": "0" }],
            "loop": "${outs.0} = cos(${state}.phase)\n${state}.phase += ${ins.0} / ${globs.sampleRate}"
        },
        "sig~": {
            "flags": { "isPureFunction": true, "isLoopInline": true },
            "loop": "${args.value}"
        },
        "mul~": {
            "flags": { "isPureFunction": true, "isLoopInline": true },
            "loop": "${ins.0} * ${ins.1}"
        },
        "dac~": { "loop": "${globs.output}[0][${globs.iterFrame}] = ${ins.0}" },
        "metro": {},
        "float": {
            "messageReceivers": { "0": "${snds.0}(m)\nreturn" }
        }
    }
}"#;

fn registry() -> NodeRegistry {
    dspc::template::load_registry(REGISTRY).expect("benchmark registry must load")
}

/// `n_voices` oscillators, each detuned by a constant and scaled by a
/// constant gain, summed into one output; plus a message chain of
/// `n_voices` float boxes fed by a metro.
fn generate_patch(n_voices: usize) -> Graph {
    let signal = PortletKind::Signal;
    let message = PortletKind::Message;
    let mut graph = Graph::new()
        .with_node(Node::new("dac", "dac~").with_inlet("0", signal).pulling_signal())
        .with_node(
            Node::new("metro", "metro")
                .with_outlet("0", message)
                .pushing_messages(),
        );
    let mut links = Vec::new();
    let mut previous = "metro".to_string();

    for v in 0..n_voices {
        let freq = format!("freq{}", v);
        let osc = format!("osc{}", v);
        let amp = format!("amp{}", v);
        let gain = format!("gain{}", v);
        let float = format!("float{}", v);
        graph.insert(
            Node::new(&freq, "sig~")
                .with_arg("value", serde_json::json!(110.0 * (v + 1) as f64))
                .with_outlet("0", signal),
        );
        graph.insert(
            Node::new(&osc, "osc~")
                .with_inlet("0", signal)
                .with_outlet("0", signal),
        );
        graph.insert(
            Node::new(&amp, "sig~")
                .with_arg("value", serde_json::json!(1.0 / n_voices as f64))
                .with_outlet("0", signal),
        );
        graph.insert(
            Node::new(&gain, "mul~")
                .with_inlet("0", signal)
                .with_inlet("1", signal)
                .with_outlet("0", signal),
        );
        graph.insert(
            Node::new(&float, "float")
                .with_inlet("0", message)
                .with_outlet("0", message),
        );
        links.push(((freq, "0"), (osc.clone(), "0")));
        links.push(((osc, "0"), (gain.clone(), "0")));
        links.push(((amp, "0"), (gain.clone(), "1")));
        links.push(((gain, "0"), ("dac".to_string(), "0")));
        links.push(((previous, "0"), (float.clone(), "0")));
        previous = float;
    }

    for ((from, outlet), (to, inlet)) in links {
        graph
            .connect(Endpoint::new(from, outlet), Endpoint::new(to, inlet))
            .expect("generated connection must be valid");
    }
    graph
}

fn compile_full(graph: &Graph, registry: &NodeRegistry) {
    let compiled = dspc::compile(graph, registry, UserSettings::default())
        .expect("benchmark scenario must compile");
    black_box(&compiled.program);
}

fn scenarios() -> [(&'static str, Graph); 3] {
    [
        ("small", generate_patch(2)),
        ("medium", generate_patch(16)),
        ("large", generate_patch(64)),
    ]
}

// KPI: full compile latency (settings -> traversal -> names -> precompile -> assemble).
fn bench_kpi_full_compile_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("kpi/full_compile_latency");
    let registry = registry();

    for (name, graph) in scenarios() {
        group.bench_with_input(BenchmarkId::from_parameter(name), &graph, |b, graph| {
            b.iter(|| compile_full(black_box(graph), &registry));
        });
    }

    group.finish();
}

// KPI: phase-level latency on a non-trivial patch.
fn bench_kpi_phase_latency(c: &mut Criterion) {
    let registry = registry();
    let settings = CompilationSettings::default();
    let graph = generate_patch(16);

    // traversal
    {
        let mut group = c.benchmark_group("kpi/phase_latency/traversal");
        group.bench_function("medium", |b| {
            b.iter(|| {
                let t = build_full_graph_traversal(black_box(&graph), &settings)
                    .expect("traversal must succeed");
                black_box(&t);
            });
        });
        group.finish();
    }

    // precompile (setup: traversal + names)
    {
        let traversal =
            build_full_graph_traversal(&graph, &settings).expect("traversal must succeed");
        let mut group = c.benchmark_group("kpi/phase_latency/precompile");
        group.bench_function("medium", |b| {
            b.iter_batched(
                || generate_variable_names_index(&graph, false).expect("names must allocate"),
                |mut names| {
                    let input = PrecompileInput {
                        graph: &graph,
                        registry: &registry,
                        settings: &settings,
                    };
                    let code = precompile(input, black_box(&traversal), &mut names)
                        .expect("precompile must succeed");
                    black_box(&code);
                },
                BatchSize::SmallInput,
            );
        });
        group.finish();
    }

    // assemble (setup: every earlier pass)
    {
        let mut group = c.benchmark_group("kpi/phase_latency/assemble");
        group.bench_function("medium", |b| {
            b.iter_batched(
                || {
                    let mut state =
                        CompilationState::new(&graph, &registry, UserSettings::default());
                    run_pipeline(&mut state, PassId::GenerateNodeCode, false, |_, _| {})
                        .expect("precompile must succeed");
                    state
                },
                |state| {
                    let program = dspc::assemble::assemble(
                        state.precompiled.as_ref().expect("precompiled code"),
                        state.names.as_ref().expect("names"),
                    )
                    .expect("assemble must succeed");
                    black_box(&program);
                },
                BatchSize::SmallInput,
            );
        });
        group.finish();
    }
}

// KPI: compile scaling vs number of voices.
fn bench_kpi_compile_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("kpi/compile_scaling");
    let registry = registry();

    for n_voices in [1_usize, 8, 32, 128] {
        let graph = generate_patch(n_voices);
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}voices", n_voices)),
            &graph,
            |b, graph| {
                b.iter(|| compile_full(black_box(graph), &registry));
            },
        );
    }

    group.finish();
}

// KPI: end-to-end compile of the demo patch shipped with the repository.
fn bench_kpi_demo_patch(c: &mut Criterion) {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../demos");
    let read = |name: &str| {
        std::fs::read_to_string(root.join(name)).expect("demo files must be readable")
    };
    let graph = Graph::from_json(&read("graph.json")).expect("demo graph must load");
    let registry =
        dspc::template::load_registry(&read("registry.json")).expect("demo registry must load");

    c.bench_function("kpi/demo_patch", |b| {
        b.iter(|| compile_full(black_box(&graph), &registry));
    });
}

criterion_group!(
    benches,
    bench_kpi_full_compile_latency,
    bench_kpi_phase_latency,
    bench_kpi_compile_scaling,
    bench_kpi_demo_patch,
);
criterion_main!(benches);
