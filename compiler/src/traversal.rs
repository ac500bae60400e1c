// traversal.rs — Full graph traversal used to drive compilation
//
// Roots: nodes pulling signal (audio outputs), nodes pushing messages
// (timers, inputs) and nodes named in the inlet-caller specs. The signal
// traversal from the pulling nodes comes first so every node follows its
// signal sources; nodes reached only through messages are appended in
// discovery order.
//
// Preconditions: graph passed `Graph::check_integrity`.
// Postconditions: each reachable node listed exactly once.
// Failure modes: dangling connection → `CompileError::GraphIntegrity`.
// Side effects: none.

use std::collections::HashSet;

use crate::diag::CompileError;
use crate::graph::{message_traversal, signal_traversal, Graph};
use crate::settings::CompilationSettings;

pub fn build_full_graph_traversal(
    graph: &Graph,
    settings: &CompilationSettings,
) -> Result<Vec<String>, CompileError> {
    let signal_roots: Vec<String> = graph
        .nodes
        .values()
        .filter(|n| n.is_pulling_signal)
        .map(|n| n.id.clone())
        .collect();

    let mut message_roots: Vec<String> = graph
        .nodes
        .values()
        .filter(|n| n.is_pushing_messages)
        .map(|n| n.id.clone())
        .collect();
    for node_id in settings.inlet_caller_specs.keys() {
        graph.node(node_id)?;
        if !message_roots.contains(node_id) {
            message_roots.push(node_id.clone());
        }
    }

    let mut traversal = signal_traversal(graph, &signal_roots, None)?;
    let mut seen: HashSet<String> = traversal.iter().cloned().collect();
    for id in message_traversal(graph, &message_roots)? {
        if seen.insert(id.clone()) {
            traversal.push(id);
        }
    }

    tracing::debug!(
        signal_roots = signal_roots.len(),
        message_roots = message_roots.len(),
        nodes = traversal.len(),
        "full traversal built"
    );
    Ok(traversal)
}
