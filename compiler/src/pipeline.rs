// pipeline.rs — Compilation state and pass orchestration
//
// Holds all pass artifacts as optional fields and runs the minimal set of
// passes for a given terminal PassId.
//
// Preconditions: graph and registry loaded; graph integrity checked.
// Postconditions: all artifacts for required passes are populated, or a
//                 `PipelineError` names the failing pass.
// Failure modes: any pass returning a `CompileError`; precompile cert failure.
// Side effects: calls on_pass_complete callback after each pass; prints pass
//               timings to stderr when verbose.

use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::debug_span;

use crate::ast::{Func, Sequence, Var};
use crate::diag::CompileError;
use crate::graph::{trim_graph, Graph};
use crate::names::{generate_variable_names_index, VariableNamesIndex};
use crate::pass::{descriptor, required_passes, PassId, StageCert};
use crate::precompile::{
    cert_failure, finalize_node_code, initialize_precompilation, verify_precompiled,
    PrecompileCert, PrecompileInput, PrecompiledCode,
};
use crate::registry::NodeRegistry;
use crate::settings::{validate_io_specs, validate_settings, CompilationSettings, UserSettings};

// ── Provenance ─────────────────────────────────────────────────────────────

/// Provenance metadata for reproducible builds and cache-key use.
///
/// `graph_hash`: hex SHA-256 of `Graph::canonical_json()`.
/// `registry_fingerprint`: hex SHA-256 of `NodeRegistry::canonical_json()`.
/// `compiler_version`: crate version from `Cargo.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Provenance {
    pub graph_hash: String,
    pub registry_fingerprint: String,
    pub compiler_version: &'static str,
}

fn sha256_hex(text: &str) -> String {
    use sha2::{Digest, Sha256};

    format!("{:x}", Sha256::digest(text.as_bytes()))
}

/// Compute provenance from the input graph and registry.
pub fn compute_provenance(graph: &Graph, registry: &NodeRegistry) -> Provenance {
    Provenance {
        graph_hash: sha256_hex(&graph.canonical_json()),
        registry_fingerprint: sha256_hex(&registry.canonical_json()),
        compiler_version: env!("CARGO_PKG_VERSION"),
    }
}

// ── Artifact storage ───────────────────────────────────────────────────────

/// Inputs plus every artifact a pass may produce.
pub struct CompilationState<'a> {
    pub graph: &'a Graph,
    pub registry: &'a NodeRegistry,
    pub user_settings: UserSettings,
    pub settings: Option<CompilationSettings>,
    pub traversal: Option<Vec<String>>,
    pub trimmed: Option<Graph>,
    pub names: Option<VariableNamesIndex>,
    pub precompiled: Option<PrecompiledCode>,
    pub cert: Option<PrecompileCert>,
    pub program: Option<Sequence>,
    pub provenance: Option<Provenance>,
}

impl<'a> CompilationState<'a> {
    pub fn new(graph: &'a Graph, registry: &'a NodeRegistry, user_settings: UserSettings) -> Self {
        Self {
            graph,
            registry,
            user_settings,
            settings: None,
            traversal: None,
            trimmed: None,
            names: None,
            precompiled: None,
            cert: None,
            program: None,
            provenance: None,
        }
    }
}

fn artifact<'s, T>(slot: &'s Option<T>, name: &str) -> Result<&'s T, CompileError> {
    slot.as_ref()
        .ok_or_else(|| CompileError::namespace("artifacts", name))
}

fn artifact_mut<'s, T>(slot: &'s mut Option<T>, name: &str) -> Result<&'s mut T, CompileError> {
    slot.as_mut()
        .ok_or_else(|| CompileError::namespace("artifacts", name))
}

// ── Error type ─────────────────────────────────────────────────────────────

/// Pipeline execution failed in a pass.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{error}")]
pub struct PipelineError {
    /// The pass that produced the error.
    pub failing_pass: PassId,
    #[source]
    pub error: CompileError,
}

/// Per-pass post-processing: callback, verbose timing.
fn finish_pass(
    pass_id: PassId,
    elapsed: Duration,
    verbose: bool,
    on_pass_complete: &mut impl FnMut(PassId, Duration),
) {
    on_pass_complete(pass_id, elapsed);
    if verbose {
        eprintln!(
            "dspc: {} complete, {:.1}ms",
            descriptor(pass_id).name,
            elapsed.as_secs_f64() * 1000.0
        );
    }
}

// ── Pipeline runner ────────────────────────────────────────────────────────

/// Run the minimal set of passes to produce `terminal`.
///
/// Per-pass sequence: execute → on_pass_complete(callback) → verbose → error check.
pub fn run_pipeline(
    state: &mut CompilationState<'_>,
    terminal: PassId,
    verbose: bool,
    mut on_pass_complete: impl FnMut(PassId, Duration),
) -> Result<(), PipelineError> {
    state.provenance = Some(compute_provenance(state.graph, state.registry));

    for pass_id in required_passes(terminal) {
        let t = Instant::now();
        let result = run_pass(state, pass_id);
        finish_pass(pass_id, t.elapsed(), verbose, &mut on_pass_complete);
        result.map_err(|error| PipelineError {
            failing_pass: pass_id,
            error,
        })?;
    }
    Ok(())
}

fn run_pass(state: &mut CompilationState<'_>, pass_id: PassId) -> Result<(), CompileError> {
    let _span = debug_span!("pass", name = descriptor(pass_id).name).entered();
    let CompilationState {
        graph,
        registry,
        user_settings,
        settings,
        traversal,
        trimmed,
        names,
        precompiled,
        cert,
        program,
        ..
    } = state;

    match pass_id {
        PassId::ValidateSettings => {
            let validated = validate_settings(user_settings.clone())?;
            validate_io_specs(&validated, graph)?;
            *settings = Some(validated);
        }
        PassId::BuildTraversal => {
            let order =
                crate::traversal::build_full_graph_traversal(graph, artifact(settings, "settings")?)?;
            *trimmed = Some(trim_graph(graph, &order));
            *traversal = Some(order);
        }
        PassId::AllocateNames => {
            let debug = artifact(settings, "settings")?.debug;
            *names = Some(generate_variable_names_index(
                artifact(trimmed, "trimmed graph")?,
                debug,
            )?);
        }
        PassId::ResolvePortlets => {
            let graph = artifact(trimmed, "trimmed graph")?;
            let mut code = initialize_precompilation(graph, artifact(traversal, "traversal")?)?;
            let input = PrecompileInput {
                graph,
                registry,
                settings: artifact(settings, "settings")?,
            };
            crate::flow::resolve_portlets(input, artifact_mut(names, "names")?, &mut code)?;
            *precompiled = Some(code);
        }
        PassId::CollectDependencies
        | PassId::PartitionDsp
        | PassId::SynthesizeMessages
        | PassId::GenerateNodeCode => {
            let input = PrecompileInput {
                graph: artifact(trimmed, "trimmed graph")?,
                registry,
                settings: artifact(settings, "settings")?,
            };
            let names = artifact_mut(names, "names")?;
            let code = artifact_mut(precompiled, "precompiled code")?;
            match pass_id {
                PassId::CollectDependencies => {
                    crate::dependencies::collect_node_dependencies(input, names, code)?
                }
                PassId::PartitionDsp => crate::dsp::partition_dsp(input, names, code)?,
                PassId::SynthesizeMessages => {
                    crate::messages::synthesize_messages(input, names, code)?
                }
                _ => {
                    finalize_node_code(input, names, code)?;
                    let verified = verify_precompiled(code, names);
                    if !verified.all_pass() {
                        return Err(cert_failure(&verified));
                    }
                    *cert = Some(verified);
                }
            }
        }
        PassId::Assemble => {
            *program = Some(crate::assemble::assemble(
                artifact(precompiled, "precompiled code")?,
                artifact(names, "names")?,
            )?);
        }
    }
    Ok(())
}

// ── One-shot compilation ───────────────────────────────────────────────────

/// Everything a backend needs to emit a program.
#[derive(Debug, Clone)]
pub struct CompiledProgram {
    pub program: Sequence,
    /// Host functions the program calls.
    pub imports: Vec<Func>,
    /// Symbols the program exposes to the host.
    pub exports: Vec<String>,
    pub traversal: Vec<String>,
    pub names: VariableNamesIndex,
    pub settings: CompilationSettings,
    pub provenance: Provenance,
}

/// Run every pass and collect the results.
pub fn compile(
    graph: &Graph,
    registry: &NodeRegistry,
    settings: UserSettings,
) -> Result<CompiledProgram, PipelineError> {
    let mut state = CompilationState::new(graph, registry, settings);
    run_pipeline(&mut state, PassId::Assemble, false, |_, _| {})?;
    into_compiled(state).map_err(|error| PipelineError {
        failing_pass: PassId::Assemble,
        error,
    })
}

fn into_compiled(state: CompilationState<'_>) -> Result<CompiledProgram, CompileError> {
    let take = |name: &str| CompileError::namespace("artifacts", name);
    let precompiled = state.precompiled.ok_or_else(|| take("precompiled code"))?;
    let names = state.names.ok_or_else(|| take("names"))?;

    // Outlet listeners are host callbacks; inlet callers are host entry points.
    let mut imports = precompiled.dependencies.imports;
    for listeners in names.outlet_listeners.values() {
        for (_, symbol) in listeners.iter() {
            imports.push(Func::named(symbol, vec![Var::new("Message", "m")], "void"));
        }
    }
    let mut exports = precompiled.dependencies.exports;
    exports.extend(precompiled.inlet_callers.iter().map(|c| c.symbol.clone()));

    Ok(CompiledProgram {
        program: state.program.ok_or_else(|| take("program"))?,
        imports,
        exports,
        traversal: state.traversal.ok_or_else(|| take("traversal"))?,
        names,
        settings: state.settings.ok_or_else(|| take("settings"))?,
        provenance: state.provenance.ok_or_else(|| take("provenance"))?,
    })
}

// ── Tests ──────────────────────────────────────────────────────────────────
