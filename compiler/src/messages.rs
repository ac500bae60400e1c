// messages.rs — Message sender and receiver synthesis (Pass D)
//
// Each message outlet gets a sender symbol: the null receiver when nothing
// listens, the callee itself when exactly one function listens, otherwise a
// dedicated `<prefix>_SNDS_<id>` function calling every callee in order.
// Sending into a cold group member also triggers that group's recompute.
//
// Receivers wrap the node's generated body in `func(m: Message) -> void`.
// Unless a body declares itself exhaustive, a trailing `throw` reports
// unhandled messages.
//
// Preconditions: nodes `DspPartitioned`.
// Postconditions: every message outlet resolves to a sender; every allocated
//                 receiver has a function; nodes `MessagesSynthesized`.
// Failure modes: allocated receiver without implementation
//                → `CompileError::MissingImplementation` (E0501).
// Side effects: allocates / aliases `snds` symbols.

use indexmap::IndexMap;
use tracing::{debug, debug_span};

use crate::ast::{Func, Var};
use crate::diag::CompileError;
use crate::graph::PortletKind;
use crate::names::{PortletSlot, VariableNamesIndex};
use crate::precompile::{
    InletCaller, MessageSender, NodeStage, PrecompileInput, PrecompiledCode,
};

pub fn synthesize_messages(
    input: PrecompileInput<'_>,
    names: &mut VariableNamesIndex,
    code: &mut PrecompiledCode,
) -> Result<(), CompileError> {
    let _span = debug_span!("synthesize_messages").entered();
    code.expect_stage(NodeStage::DspPartitioned)?;

    let ids: Vec<String> = code.nodes.keys().cloned().collect();
    let cold_triggers = code.graph.cold_triggers();

    // ── Senders ──
    for id in &ids {
        let node = input.graph.node(id)?;
        for outlet in node.outlets_of(PortletKind::Message) {
            let mut callees = code
                .node(id)?
                .sender_plans
                .get(&outlet.id)
                .cloned()
                .unwrap_or_default();
            for sink in node.sinks_of(&outlet.id) {
                if let Some(trigger) = cold_triggers.get(&sink.node_id) {
                    if !callees.contains(trigger) {
                        callees.push(trigger.clone());
                    }
                }
            }

            let (symbol, needs_function) = match callees.as_slice() {
                [] => {
                    let null = names.globs.null_receiver.clone();
                    (names.alias_node_portlet(PortletSlot::Snds, id, &outlet.id, &null)?, false)
                }
                [only] => (
                    names.alias_node_portlet(PortletSlot::Snds, id, &outlet.id, only)?,
                    false,
                ),
                _ => (
                    names.attach_node_portlet(PortletSlot::Snds, id, &outlet.id)?,
                    true,
                ),
            };
            code.node_mut(id)?.message_senders.insert(
                outlet.id.clone(),
                MessageSender {
                    symbol,
                    callees,
                    needs_function,
                },
            );
        }
    }

    // ── Receivers ──
    for id in &ids {
        let inlet_ids: Vec<String> = names
            .node(id)?
            .rcvs
            .iter()
            .map(|(inlet, _)| inlet.to_string())
            .collect();
        if inlet_ids.is_empty() {
            continue;
        }
        let node = input.graph.node(id)?;
        let imp = input.registry.implementation_for(node)?;
        let mut bodies = {
            let ctx = input.context(id, names, code)?;
            imp.message_receivers(&ctx)?
        };

        let mut receivers = IndexMap::new();
        for inlet_id in &inlet_ids {
            let receiver = bodies.shift_remove(inlet_id).ok_or_else(|| {
                CompileError::MissingImplementation {
                    node_type: node.node_type.clone(),
                    node_id: Some(id.clone()),
                    portlet_id: Some(inlet_id.clone()),
                    message: "no implementation for message receiver".into(),
                }
            })?;
            let mut body = receiver.body;
            if !receiver.exhaustive {
                body.push_code(&unhandled_message_tail(
                    names,
                    input.settings.debug,
                    &node.node_type,
                    id,
                    inlet_id,
                )?);
            }
            let symbol = names.portlet(PortletSlot::Rcvs, id, inlet_id)?;
            receivers.insert(
                inlet_id.clone(),
                Func::named(symbol, vec![Var::new("Message", "m")], "void").with_body(body),
            );
        }
        code.node_mut(id)?.message_receivers = receivers;
    }

    // ── Inlet callers ──
    let mut callers = Vec::new();
    for (node_id, inlet_ids) in &input.settings.inlet_caller_specs {
        if !code.nodes.contains_key(node_id) {
            continue;
        }
        for inlet_id in inlet_ids {
            let symbol = names.inlet_caller(node_id, inlet_id).ok_or_else(|| {
                CompileError::namespace(format!("inletCallers_{}", node_id), inlet_id.clone())
            })?;
            callers.push(InletCaller {
                node_id: node_id.clone(),
                inlet_id: inlet_id.clone(),
                symbol: symbol.to_string(),
                receiver: names.portlet(PortletSlot::Rcvs, node_id, inlet_id)?.to_string(),
                cold_trigger: cold_triggers.get(node_id).cloned(),
            });
        }
    }
    code.inlet_callers = callers;

    debug!(inlet_callers = code.inlet_callers.len(), "messages synthesized");
    code.advance_stage(NodeStage::MessagesSynthesized);
    Ok(())
}

/// Statement appended to non-exhaustive receivers.
fn unhandled_message_tail(
    names: &VariableNamesIndex,
    debug: bool,
    node_type: &str,
    node_id: &str,
    inlet_id: &str,
) -> Result<String, CompileError> {
    let location = format!(
        "[{}], id \"{}\", inlet \"{}\", unsupported message",
        node_type, node_id, inlet_id
    );
    if debug {
        Ok(format!(
            "throw new Error('{} : ' + {}(m) + '\\nDEBUG : remember, you must return from message receiver')",
            location,
            names.global("msg", "display")?
        ))
    } else {
        Ok(format!("throw new Error('{}')", location))
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Sequence;
    use crate::dependencies::collect_node_dependencies;
    use crate::dsp::partition_dsp;
    use crate::flow::resolve_portlets;
    use crate::graph::{Endpoint, Graph, Node};
    use crate::names::generate_variable_names_index;
    use crate::precompile::{finalize_node_code, initialize_precompilation};
    use crate::registry::{
        MessageReceiver, NodeContext, NodeFlags, NodeImplementation, NodeRegistry,
    };
    use crate::settings::CompilationSettings;
    use PortletKind::{Message, Signal};

    struct Receiving {
        exhaustive: bool,
    }

    impl NodeImplementation for Receiving {
        fn message_receivers(
            &self,
            ctx: &NodeContext<'_>,
        ) -> Result<IndexMap<String, MessageReceiver>, CompileError> {
            let mut map = IndexMap::new();
            for inlet in ctx.node.inlets_of(Message) {
                let mut receiver = MessageReceiver::new(format!("{}(m)\nreturn", ctx.snds("0")?));
                if self.exhaustive {
                    receiver = receiver.exhaustive();
                }
                map.insert(inlet.id.clone(), receiver);
            }
            Ok(map)
        }
    }

    struct Silent;
    impl NodeImplementation for Silent {}

    struct Pure;
    impl NodeImplementation for Pure {
        fn flags(&self) -> NodeFlags {
            NodeFlags {
                is_pure_function: true,
                is_loop_inline: false,
            }
        }
        fn message_receivers(
            &self,
            ctx: &NodeContext<'_>,
        ) -> Result<IndexMap<String, MessageReceiver>, CompileError> {
            let mut map = IndexMap::new();
            for inlet in ctx.node.inlets_of(Message) {
                map.insert(inlet.id.clone(), MessageReceiver::new("return").exhaustive());
            }
            Ok(map)
        }
    }

    fn registry() -> NodeRegistry {
        let mut registry = NodeRegistry::new();
        registry.register("recv", Receiving { exhaustive: false });
        registry.register("recvAll", Receiving { exhaustive: true });
        registry.register("silent", Silent);
        registry.register("pure", Pure);
        registry
    }

    fn run(
        graph: &Graph,
        settings: &CompilationSettings,
    ) -> Result<(VariableNamesIndex, PrecompiledCode), CompileError> {
        run_through(graph, settings, false)
    }

    /// Pass A through Pass D; with `finalize`, node code is finalized too.
    fn run_through(
        graph: &Graph,
        settings: &CompilationSettings,
        finalize: bool,
    ) -> Result<(VariableNamesIndex, PrecompiledCode), CompileError> {
        let registry = registry();
        let input = PrecompileInput {
            graph,
            registry: &registry,
            settings,
        };
        let ids: Vec<String> = graph.nodes.keys().cloned().collect();
        let mut names = generate_variable_names_index(graph, false)?;
        let mut code = initialize_precompilation(graph, &ids)?;
        resolve_portlets(input, &mut names, &mut code)?;
        collect_node_dependencies(input, &mut names, &mut code)?;
        partition_dsp(input, &mut names, &mut code)?;
        synthesize_messages(input, &mut names, &mut code)?;
        if finalize {
            finalize_node_code(input, &mut names, &mut code)?;
        }
        Ok((names, code))
    }

    fn msg_node(id: &str, typ: &str) -> Node {
        Node::new(id, typ)
            .with_inlet("0", Message)
            .with_outlet("0", Message)
    }

    #[test]
    fn sender_symbol_depends_on_callee_count() {
        let mut graph = Graph::new()
            .with_node(msg_node("a", "recvAll"))
            .with_node(msg_node("b", "recvAll"))
            .with_node(msg_node("c", "recvAll"))
            .with_node(msg_node("d", "recvAll"));
        graph.connect(Endpoint::new("a", "0"), Endpoint::new("b", "0")).unwrap();
        graph.connect(Endpoint::new("b", "0"), Endpoint::new("c", "0")).unwrap();
        graph.connect(Endpoint::new("b", "0"), Endpoint::new("d", "0")).unwrap();

        let (names, code) = run(&graph, &CompilationSettings::default()).unwrap();
        let a = &code.node("a").unwrap().message_senders["0"];
        assert_eq!(a.symbol, "b_RCVS_0");
        assert!(!a.needs_function);

        let b = &code.node("b").unwrap().message_senders["0"];
        assert_eq!(b.symbol, "b_SNDS_0");
        assert_eq!(b.callees, vec!["c_RCVS_0", "d_RCVS_0"]);
        assert!(b.needs_function);

        let c = &code.node("c").unwrap().message_senders["0"];
        assert_eq!(c.symbol, "SND_TO_NULL");
        assert_eq!(names.portlet(PortletSlot::Snds, "c", "0").unwrap(), "SND_TO_NULL");

        let receiver = &code.node("b").unwrap().message_receivers["0"];
        assert_eq!(receiver.name.as_deref(), Some("b_RCVS_0"));
        assert_eq!(receiver.body, Sequence::code("b_SNDS_0(m)\nreturn"));
        assert!(code.node("a").unwrap().message_receivers.is_empty());
    }

    #[test]
    fn non_exhaustive_receiver_gets_error_tail() {
        let mut graph = Graph::new()
            .with_node(msg_node("a", "recvAll"))
            .with_node(msg_node("node1", "recv"));
        graph
            .connect(Endpoint::new("a", "0"), Endpoint::new("node1", "0"))
            .unwrap();

        let (_, code) = run(&graph, &CompilationSettings::default()).unwrap();
        assert_eq!(
            code.node("node1").unwrap().message_receivers["0"].body,
            Sequence::code(
                "SND_TO_NULL(m)\nreturn\n\
                 throw new Error('[recv], id \"node1\", inlet \"0\", unsupported message')"
            )
        );

        let settings = CompilationSettings {
            debug: true,
            ..CompilationSettings::default()
        };
        let (_, code) = run(&graph, &settings).unwrap();
        let body = code.node("node1").unwrap().message_receivers["0"]
            .body
            .to_string();
        assert!(body.contains(
            "unsupported message : ' + msg_display(m) + '\\nDEBUG : remember, you must return from message receiver')"
        ));
    }

    #[test]
    fn missing_receiver_names_the_inlet() {
        let mut graph = Graph::new()
            .with_node(msg_node("a", "recvAll"))
            .with_node(msg_node("s", "silent"));
        graph.connect(Endpoint::new("a", "0"), Endpoint::new("s", "0")).unwrap();
        let err = run(&graph, &CompilationSettings::default()).unwrap_err();
        assert_eq!(err.code(), crate::diag::codes::E0501);
        assert_eq!(
            err.to_string(),
            "no implementation for message receiver (type [silent], node \"s\", portlet \"0\")"
        );
    }

    #[test]
    fn messages_into_cold_nodes_trigger_the_group() {
        let mut graph = Graph::new()
            .with_node(msg_node("m", "recvAll"))
            .with_node(
                Node::new("p", "pure")
                    .with_inlet("0", Signal)
                    .with_inlet("1", Message)
                    .with_outlet("0", Signal),
            )
            .with_node(
                Node::new("out", "silent")
                    .with_inlet("0", Signal)
                    .pulling_signal(),
            );
        graph.connect(Endpoint::new("m", "0"), Endpoint::new("p", "1")).unwrap();
        graph.connect(Endpoint::new("p", "0"), Endpoint::new("out", "0")).unwrap();

        let mut settings = CompilationSettings::default();
        settings.inlet_caller_specs.insert("p".into(), vec!["1".into()]);

        let (_, code) = run(&graph, &settings).unwrap();
        let sender = &code.node("m").unwrap().message_senders["0"];
        assert_eq!(sender.callees, vec!["p_RCVS_1", "COLD_0"]);
        assert_eq!(sender.symbol, "m_SNDS_0");
        assert_eq!(
            code.inlet_callers,
            vec![InletCaller {
                node_id: "p".into(),
                inlet_id: "1".into(),
                symbol: "inletCallers_p_1".into(),
                receiver: "p_RCVS_1".into(),
                cold_trigger: Some("COLD_0".into()),
            }]
        );
    }

    #[test]
    fn sender_calls_listener_then_sinks_then_cold_trigger() {
        let mut graph = Graph::new()
            .with_node(msg_node("f", "recvAll"))
            .with_node(msg_node("a", "recvAll"))
            .with_node(
                Node::new("b", "pure")
                    .with_inlet("0", Message)
                    .with_outlet("0", Signal),
            )
            .with_node(
                Node::new("out", "silent")
                    .with_inlet("0", Signal)
                    .pulling_signal(),
            );
        graph.connect(Endpoint::new("f", "0"), Endpoint::new("a", "0")).unwrap();
        graph.connect(Endpoint::new("f", "0"), Endpoint::new("b", "0")).unwrap();
        graph.connect(Endpoint::new("b", "0"), Endpoint::new("out", "0")).unwrap();

        let mut settings = CompilationSettings::default();
        settings.outlet_listener_specs.insert("f".into(), vec!["0".into()]);

        let (names, code) = run_through(&graph, &settings, true).unwrap();
        assert_eq!(code.graph.cold.len(), 1);
        let sender = &code.node("f").unwrap().message_senders["0"];
        assert_eq!(
            sender.callees,
            vec!["outletListeners_f_0", "a_RCVS_0", "b_RCVS_0", "COLD_0"]
        );
        assert_eq!(sender.symbol, "f_SNDS_0");
        assert!(sender.needs_function);

        let program = crate::assemble::assemble(&code, &names).unwrap().to_string();
        assert!(
            program.contains(
                "func f_SNDS_0(m: Message) -> void {\n    \
                 outletListeners_f_0(m)\n    \
                 a_RCVS_0(m)\n    \
                 b_RCVS_0(m)\n    \
                 COLD_0(m)\n}"
            ),
            "{}",
            program
        );
    }
}
