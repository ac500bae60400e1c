// flow.rs — Portlet resolution (Pass A)
//
// Allocates the symbols every later pass reads: signal outlet variables,
// message receivers for inlets that can actually receive, outlet listeners
// and inlet callers named in the settings. A second sweep then resolves each
// signal inlet to an expression and each message outlet to its call plan.
//
// Preconditions: every node `Untouched`; graph trimmed to the traversal.
// Postconditions: every signal inlet has an expression; every message
//                 outlet has a (possibly empty) plan; nodes `PortletsResolved`.
// Failure modes: signal inlet fed by a message outlet, message outlet wired
//                to a signal inlet → `CompileError::GraphIntegrity`.
// Side effects: allocates outs / rcvs / listener / caller symbols.

use tracing::{debug, debug_span};

use crate::diag::CompileError;
use crate::graph::{Node, PortletKind};
use crate::names::{PortletSlot, VariableNamesIndex};
use crate::precompile::{NodeStage, PrecompileInput, PrecompiledCode};

pub fn resolve_portlets(
    input: PrecompileInput<'_>,
    names: &mut VariableNamesIndex,
    code: &mut PrecompiledCode,
) -> Result<(), CompileError> {
    let _span = debug_span!("resolve_portlets").entered();
    code.expect_stage(NodeStage::Untouched)?;

    let ids: Vec<String> = code.nodes.keys().cloned().collect();

    // ── Symbol allocation ──
    for id in &ids {
        let node = input.graph.node(id)?;
        let callers = input.settings.inlet_caller_specs.get(id);

        for outlet in node.outlets_of(PortletKind::Signal) {
            let symbol = names.attach_node_portlet(PortletSlot::Outs, id, &outlet.id)?;
            code.node_mut(id)?.signal_outs.insert(outlet.id.clone(), symbol);
        }

        for inlet in node.inlets_of(PortletKind::Message) {
            let called = callers.map_or(false, |list| list.contains(&inlet.id));
            if called || !node.sources_of(&inlet.id).is_empty() {
                names.attach_node_portlet(PortletSlot::Rcvs, id, &inlet.id)?;
            }
        }

        if let Some(outlet_ids) = input.settings.outlet_listener_specs.get(id) {
            for outlet_id in outlet_ids {
                names.attach_outlet_listener(id, outlet_id)?;
            }
        }
        if let Some(inlet_ids) = callers {
            for inlet_id in inlet_ids {
                names.attach_inlet_caller(id, inlet_id)?;
            }
        }
    }

    // ── Inlet expressions and sender plans ──
    for id in &ids {
        let node = input.graph.node(id)?;

        for inlet in node.inlets_of(PortletKind::Signal) {
            let expression = signal_inlet_expression(input, names, node, &inlet.id)?;
            code.node_mut(id)?.signal_ins.insert(inlet.id.clone(), expression);
        }

        for outlet in node.outlets_of(PortletKind::Message) {
            let plan = sender_plan(input, names, node, &outlet.id)?;
            code.node_mut(id)?.sender_plans.insert(outlet.id.clone(), plan);
        }
    }

    debug!(nodes = ids.len(), "portlets resolved");
    code.advance_stage(NodeStage::PortletsResolved);
    Ok(())
}

/// `NULL_SIGNAL` when unconnected, the source variable for one source, a
/// parenthesised sum for several.
fn signal_inlet_expression(
    input: PrecompileInput<'_>,
    names: &VariableNamesIndex,
    node: &Node,
    inlet_id: &str,
) -> Result<String, CompileError> {
    let mut terms = Vec::new();
    for source in node.sources_of(inlet_id) {
        let source_node = input.graph.node(&source.node_id)?;
        if source_node.outlet(&source.portlet_id)?.kind != PortletKind::Signal {
            return Err(CompileError::graph_at(
                &node.id,
                Some(inlet_id),
                format!(
                    "signal inlet fed by message outlet \"{}\" of node \"{}\"",
                    source.portlet_id, source.node_id
                ),
            ));
        }
        terms.push(
            names
                .portlet(PortletSlot::Outs, &source.node_id, &source.portlet_id)?
                .to_string(),
        );
    }
    Ok(match terms.len() {
        0 => names.globs.null_signal.clone(),
        1 => terms.remove(0),
        _ => format!("({})", terms.join(" + ")),
    })
}

/// Listener first, then every sink receiver in connection order.
fn sender_plan(
    input: PrecompileInput<'_>,
    names: &VariableNamesIndex,
    node: &Node,
    outlet_id: &str,
) -> Result<Vec<String>, CompileError> {
    let mut plan = Vec::new();
    if let Some(listener) = names.outlet_listener(&node.id, outlet_id) {
        plan.push(listener.to_string());
    }
    for sink in node.sinks_of(outlet_id) {
        let sink_node = input.graph.node(&sink.node_id)?;
        if sink_node.inlet(&sink.portlet_id)?.kind != PortletKind::Message {
            return Err(CompileError::graph_at(
                &node.id,
                Some(outlet_id),
                format!(
                    "message outlet connected to signal inlet \"{}\" of node \"{}\"",
                    sink.portlet_id, sink.node_id
                ),
            ));
        }
        plan.push(
            names
                .portlet(PortletSlot::Rcvs, &sink.node_id, &sink.portlet_id)?
                .to_string(),
        );
    }
    Ok(plan)
}
