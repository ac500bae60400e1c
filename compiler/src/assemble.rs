// assemble.rs — Final program assembly from precompiled code
//
// Emits one ordered `Sequence`:
//
//   engine globals, shared dependencies, per-type state classes and core,
//   signal outlet variables, message receivers, sender functions, state
//   instances, custom node initialisation, inlet-caller wrappers, the
//   per-frame DSP loop, cold group triggers, and the cold start-up calls.
//
// Preconditions: every node `Finalized`.
// Postconditions: each node contributes at most one fragment per section,
//                 in full-traversal order.
// Failure modes: unfinalized node → `CompileError::PassOrder`; missing
//                symbol → `CompileError::Namespace`.
// Side effects: none.

use std::collections::HashSet;

use tracing::debug_span;

use crate::ast::{Element, FrameLoop, Func, Sequence, Var};
use crate::diag::CompileError;
use crate::names::VariableNamesIndex;
use crate::precompile::{ColdDspGroup, NodeStage, PrecompiledCode};

pub fn assemble(code: &PrecompiledCode, names: &VariableNamesIndex) -> Result<Sequence, CompileError> {
    let _span = debug_span!("assemble").entered();
    code.expect_stage(NodeStage::Finalized)?;

    let mut program = engine_globals(names)?;
    program.extend(code.dependencies.ast.clone());

    // ── Per-type code ──
    for type_code in code.node_types.values() {
        if let Some(class) = &type_code.state_class {
            program.push(Element::Class(class.clone()));
        }
        if let Some(core) = &type_code.core {
            program.extend(core.clone());
        }
    }

    // ── Per-node declarations ──
    for node in code.nodes.values() {
        for symbol in node.signal_outs.values() {
            program.push(Element::Var(Var::new("Float", symbol.clone()).with_value("0")));
        }
    }
    for node in code.nodes.values() {
        for receiver in node.message_receivers.values() {
            program.push(Element::Func(receiver.clone()));
        }
    }
    for node in code.nodes.values() {
        for sender in node.message_senders.values().filter(|s| s.needs_function) {
            let body: Vec<String> = sender.callees.iter().map(|c| format!("{}(m)", c)).collect();
            program.push(Element::Func(
                Func::named(sender.symbol.clone(), vec![Var::new("Message", "m")], "void")
                    .with_body(body.join("\n")),
            ));
        }
    }
    for node in code.nodes.values() {
        if let Some(state) = &node.state {
            let members: Vec<String> = state
                .members
                .iter()
                .map(|m| format!("{}: {},", m.name, m.value))
                .collect();
            program.push(Element::ConstVar(
                Var::new(state.class_name.clone(), state.symbol.clone())
                    .with_value(format!("{{\n{}\n}}", members.join("\n"))),
            ));
        }
    }
    for node in code.nodes.values() {
        if let Some(initialization) = &node.initialization {
            program.extend(initialization.clone());
        }
    }

    for caller in &code.inlet_callers {
        let mut body = format!("{}(m)", caller.receiver);
        if let Some(trigger) = &caller.cold_trigger {
            body.push_str(&format!("\n{}(m)", trigger));
        }
        program.push(Element::Func(
            Func::named(caller.symbol.clone(), vec![Var::new("Message", "m")], "void")
                .with_body(body),
        ));
    }

    // ── DSP ──
    program.push(Element::Loop(FrameLoop {
        iter: names.globs.iter_frame.clone(),
        block_size: names.globs.block_size.clone(),
        frame: names.globs.frame.clone(),
        frame_hook: names.global("commons", "emitFrame")?.to_string(),
        body: hot_loop_body(code)?,
    }));

    for group in &code.graph.cold {
        program.push(Element::Func(cold_function(code, group)?));
    }
    for group in &code.graph.cold {
        program.push_code(&format!(
            "{}({})",
            group.function_name, names.globs.empty_message
        ));
    }

    Ok(program)
}

fn engine_globals(names: &VariableNamesIndex) -> Result<Sequence, CompileError> {
    let globs = &names.globs;
    let mut seq = Sequence::new();
    seq.push(Element::Var(Var::new("Int", globs.iter_frame.clone())));
    seq.push(Element::Var(Var::new("Int", globs.frame.clone()).with_value("0")));
    seq.push(Element::Var(Var::new("Int", globs.block_size.clone()).with_value("0")));
    seq.push(Element::Var(Var::new("Float", globs.sample_rate.clone()).with_value("0")));
    seq.push(Element::Var(Var::new("FloatArray[]", globs.input.clone()).with_value("[]")));
    seq.push(Element::Var(Var::new("FloatArray[]", globs.output.clone()).with_value("[]")));
    seq.push(Element::ConstVar(Var::new("Float", globs.null_signal.clone()).with_value("0")));
    seq.push(Element::Func(Func::named(
        globs.null_receiver.clone(),
        vec![Var::new("Message", "m")],
        "void",
    )));
    seq.push(Element::ConstVar(
        Var::new("Message", globs.empty_message.clone())
            .with_value(format!("{}([])", names.global("msg", "create")?)),
    ));
    Ok(seq)
}

/// Hot nodes in order: inlet DSP for inlets not refreshed by a cold group,
/// then the node loop.
fn hot_loop_body(code: &PrecompiledCode) -> Result<Sequence, CompileError> {
    let cold_fed: HashSet<(&str, &str)> = code
        .graph
        .cold
        .iter()
        .flat_map(|g| g.sink_connections.iter())
        .map(|c| (c.sink.node_id.as_str(), c.sink.portlet_id.as_str()))
        .collect();

    let mut body = Sequence::new();
    for id in &code.graph.hot.traversal {
        let node = code.node(id)?;
        for (inlet_id, fragment) in &node.dsp.inlets {
            if !cold_fed.contains(&(id.as_str(), inlet_id.as_str())) {
                body.extend(fragment.clone());
            }
        }
        if let Some(loop_code) = &node.dsp.loop_code {
            body.extend(loop_code.clone());
        }
    }
    Ok(body)
}

/// Recompute a cold group, then refresh the inlet DSP of the nodes it feeds.
fn cold_function(code: &PrecompiledCode, group: &ColdDspGroup) -> Result<Func, CompileError> {
    let mut body = Sequence::new();
    for id in &group.group.traversal {
        if let Some(loop_code) = &code.node(id)?.dsp.loop_code {
            body.extend(loop_code.clone());
        }
    }
    let mut refreshed: HashSet<(&str, &str)> = HashSet::new();
    for connection in &group.sink_connections {
        let key = (
            connection.sink.node_id.as_str(),
            connection.sink.portlet_id.as_str(),
        );
        if !refreshed.insert(key) {
            continue;
        }
        if let Some(fragment) = code.node(key.0)?.dsp.inlets.get(key.1) {
            body.extend(fragment.clone());
        }
    }
    Ok(Func::named(
        group.function_name.clone(),
        vec![Var::new("Message", "m")],
        "void",
    )
    .with_body(body))
}
