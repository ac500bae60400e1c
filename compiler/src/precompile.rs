// precompile.rs — Precompiled code artifact and pass orchestration
//
// `PrecompiledCode` is created empty from the full traversal, then filled in
// place by the passes in fixed order:
//
//   A. flow::resolve_portlets           (signal ins, receivers, sender plans)
//   B. dependencies::collect_node_dependencies
//   C. dsp::partition_dsp               (hot/cold split, inline fusion)
//   D. messages::synthesize_messages    (senders, receivers, inlet callers)
//   E. finalize_node_code               (state, declarations, loops, inlet dsp)
//
// Every node carries a `NodeStage`; a pass refuses to run on a node that is
// not exactly at the stage it expects.
//
// Preconditions: `graph` is trimmed to `traversal`; names index allocated.
// Postconditions: every node `Finalized`; `verify_precompiled` holds.
// Failure modes: any pass error; stage mismatch → `CompileError::PassOrder`.
// Side effects: allocates symbols in the names index.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use tracing::debug_span;

use crate::ast::{Class, Func, Sequence, Var};
use crate::dependencies::CollectedDependencies;
use crate::diag::CompileError;
use crate::graph::{Connection, Graph};
use crate::id::GroupId;
use crate::names::VariableNamesIndex;
use crate::pass::StageCert;
use crate::registry::{NodeContext, NodeRegistry, StateMember};
use crate::settings::CompilationSettings;

// ── Node stage ──────────────────────────────────────────────────────────────

/// Precompilation progress of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodeStage {
    Untouched,
    PortletsResolved,
    DependenciesCollected,
    DspPartitioned,
    MessagesSynthesized,
    Finalized,
}

impl NodeStage {
    pub fn name(self) -> &'static str {
        match self {
            NodeStage::Untouched => "untouched",
            NodeStage::PortletsResolved => "portlets-resolved",
            NodeStage::DependenciesCollected => "dependencies-collected",
            NodeStage::DspPartitioned => "dsp-partitioned",
            NodeStage::MessagesSynthesized => "messages-synthesized",
            NodeStage::Finalized => "finalized",
        }
    }
}

// ── Artifact types ──────────────────────────────────────────────────────────

/// Resolved message outlet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSender {
    /// Symbol other code calls to send on this outlet.
    pub symbol: String,
    /// Functions invoked, in order: listener, sink receivers, cold triggers.
    pub callees: Vec<String>,
    /// A dedicated sender function must be emitted under `symbol`.
    pub needs_function: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeState {
    pub symbol: String,
    pub class_name: String,
    pub members: Vec<StateMember>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeDsp {
    pub loop_code: Option<Sequence>,
    /// `loop_code` has been generated (possibly to nothing).
    pub loop_resolved: bool,
    pub inlets: IndexMap<String, Sequence>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrecompiledNode {
    pub node_type: String,
    pub stage: NodeStage,
    /// Signal inlet → expression feeding it.
    pub signal_ins: IndexMap<String, String>,
    /// Signal outlet → variable to declare.
    pub signal_outs: IndexMap<String, String>,
    /// Message outlet → callees known after portlet resolution.
    pub sender_plans: IndexMap<String, Vec<String>>,
    pub message_senders: IndexMap<String, MessageSender>,
    pub message_receivers: IndexMap<String, Func>,
    pub state: Option<NodeState>,
    pub initialization: Option<Sequence>,
    pub dsp: NodeDsp,
    /// Fused into its sink; emits no loop and no outlet variable.
    pub inlined: bool,
}

impl PrecompiledNode {
    fn new(node_type: &str) -> Self {
        PrecompiledNode {
            node_type: node_type.to_string(),
            stage: NodeStage::Untouched,
            signal_ins: IndexMap::new(),
            signal_outs: IndexMap::new(),
            sender_plans: IndexMap::new(),
            message_senders: IndexMap::new(),
            message_receivers: IndexMap::new(),
            state: None,
            initialization: None,
            dsp: NodeDsp::default(),
            inlined: false,
        }
    }
}

/// Ordered node ids plus the members whose outputs leave the group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DspGroup {
    pub traversal: Vec<String>,
    pub out_nodes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColdDspGroup {
    pub id: GroupId,
    pub group: DspGroup,
    /// Connections from group members to nodes outside the group.
    pub sink_connections: Vec<Connection>,
    pub function_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphPartition {
    pub full_traversal: Vec<String>,
    pub hot: DspGroup,
    pub cold: Vec<ColdDspGroup>,
}

impl GraphPartition {
    /// Node id → function name of the cold group that node belongs to.
    pub fn cold_triggers(&self) -> HashMap<String, String> {
        self.cold
            .iter()
            .flat_map(|g| {
                g.group
                    .traversal
                    .iter()
                    .map(move |id| (id.clone(), g.function_name.clone()))
            })
            .collect()
    }
}

/// Code shared by every node of one type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TypeCode {
    pub state_class: Option<Class>,
    pub core: Option<Sequence>,
}

/// Externally callable entry point into a message inlet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InletCaller {
    pub node_id: String,
    pub inlet_id: String,
    pub symbol: String,
    pub receiver: String,
    pub cold_trigger: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrecompiledCode {
    /// In full traversal order.
    pub nodes: IndexMap<String, PrecompiledNode>,
    /// In order of first appearance in the traversal.
    pub node_types: IndexMap<String, TypeCode>,
    pub dependencies: CollectedDependencies,
    pub graph: GraphPartition,
    pub inlet_callers: Vec<InletCaller>,
}

impl PrecompiledCode {
    pub fn node(&self, node_id: &str) -> Result<&PrecompiledNode, CompileError> {
        self.nodes
            .get(node_id)
            .ok_or_else(|| CompileError::namespace("precompiledNodes", node_id))
    }

    pub fn node_mut(&mut self, node_id: &str) -> Result<&mut PrecompiledNode, CompileError> {
        self.nodes
            .get_mut(node_id)
            .ok_or_else(|| CompileError::namespace("precompiledNodes", node_id))
    }

    /// Fail unless every node is at `expected`.
    pub(crate) fn expect_stage(&self, expected: NodeStage) -> Result<(), CompileError> {
        for (id, node) in &self.nodes {
            if node.stage != expected {
                return Err(CompileError::PassOrder {
                    node_id: id.clone(),
                    expected: expected.name(),
                    found: node.stage.name(),
                });
            }
        }
        Ok(())
    }

    pub(crate) fn advance_stage(&mut self, to: NodeStage) {
        for node in self.nodes.values_mut() {
            node.stage = to;
        }
    }
}

/// Read-only inputs shared by all passes.
#[derive(Clone, Copy)]
pub struct PrecompileInput<'a> {
    pub graph: &'a Graph,
    pub registry: &'a NodeRegistry,
    pub settings: &'a CompilationSettings,
}

impl<'a> PrecompileInput<'a> {
    pub(crate) fn context<'c>(
        &self,
        node_id: &str,
        names: &'c VariableNamesIndex,
        code: &'c PrecompiledCode,
    ) -> Result<NodeContext<'c>, CompileError>
    where
        'a: 'c,
    {
        Ok(NodeContext {
            node: self.graph.node(node_id)?,
            names,
            settings: self.settings,
            signal_ins: &code.node(node_id)?.signal_ins,
        })
    }
}

// ── Orchestration ───────────────────────────────────────────────────────────

/// Empty artifact with one `Untouched` node per traversal entry.
pub fn initialize_precompilation(
    graph: &Graph,
    traversal: &[String],
) -> Result<PrecompiledCode, CompileError> {
    let mut nodes = IndexMap::new();
    for id in traversal {
        let node = graph.node(id)?;
        nodes.insert(id.clone(), PrecompiledNode::new(&node.node_type));
    }
    Ok(PrecompiledCode {
        nodes,
        node_types: IndexMap::new(),
        dependencies: CollectedDependencies::default(),
        graph: GraphPartition {
            full_traversal: traversal.to_vec(),
            ..GraphPartition::default()
        },
        inlet_callers: Vec::new(),
    })
}

/// Run every precompilation pass and verify the result.
pub fn precompile(
    input: PrecompileInput<'_>,
    traversal: &[String],
    names: &mut VariableNamesIndex,
) -> Result<PrecompiledCode, CompileError> {
    let mut code = initialize_precompilation(input.graph, traversal)?;
    crate::flow::resolve_portlets(input, names, &mut code)?;
    crate::dependencies::collect_node_dependencies(input, names, &mut code)?;
    crate::dsp::partition_dsp(input, names, &mut code)?;
    crate::messages::synthesize_messages(input, names, &mut code)?;
    finalize_node_code(input, names, &mut code)?;
    let cert = verify_precompiled(&code, names);
    if !cert.all_pass() {
        return Err(cert_failure(&cert));
    }
    Ok(code)
}

// ── Node code finalisation ──────────────────────────────────────────────────

/// Generate state, custom initialisation, remaining loops and inlet DSP for
/// every node.
pub fn finalize_node_code(
    input: PrecompileInput<'_>,
    names: &mut VariableNamesIndex,
    code: &mut PrecompiledCode,
) -> Result<(), CompileError> {
    let _span = debug_span!("finalize_node_code").entered();
    code.expect_stage(NodeStage::MessagesSynthesized)?;

    let ids: Vec<String> = code.nodes.keys().cloned().collect();
    for id in &ids {
        let node = input.graph.node(id)?;
        let imp = input.registry.implementation_for(node)?;

        let (members, initialization, loop_code, inlet_dsp, inlined) = {
            let ctx = input.context(id, names, code)?;
            let precompiled = code.node(id)?;
            let members = imp.state(&ctx)?;
            let initialization = imp.declarations(&ctx)?;
            let (loop_code, inlet_dsp) = if precompiled.inlined {
                (None, IndexMap::new())
            } else {
                let loop_code = if precompiled.dsp.loop_resolved {
                    None
                } else {
                    Some(imp.loop_code(&ctx)?)
                };
                (loop_code, imp.inlet_dsp(&ctx)?)
            };
            (members, initialization, loop_code, inlet_dsp, precompiled.inlined)
        };

        let state = if members.is_empty() {
            None
        } else {
            let tag = names.type_tag(&node.node_type)?.to_string();
            let class_name = names.attach_global(&tag, "State")?;
            let class_members: Vec<Var> = members
                .iter()
                .map(|m| Var::new(m.typ.clone(), m.name.clone()))
                .collect();
            let type_code = code.node_types.entry(node.node_type.clone()).or_default();
            match &type_code.state_class {
                None => {
                    type_code.state_class = Some(Class {
                        name: class_name.clone(),
                        members: class_members,
                    })
                }
                Some(existing) if existing.members != class_members => {
                    return Err(CompileError::Verification(format!(
                        "node \"{}\" declares a state layout different from other [{}] nodes",
                        id, node.node_type
                    )));
                }
                Some(_) => {}
            }
            Some(NodeState {
                symbol: names.node(id)?.state.clone(),
                class_name,
                members,
            })
        };

        let precompiled = code.node_mut(id)?;
        precompiled.state = state;
        precompiled.initialization = initialization;
        if let Some(loop_code) = loop_code {
            precompiled.dsp.loop_code = loop_code;
            precompiled.dsp.loop_resolved = true;
        }
        if !inlined {
            precompiled.dsp.inlets = inlet_dsp;
        }
    }

    code.advance_stage(NodeStage::Finalized);
    Ok(())
}

// ── Verification ────────────────────────────────────────────────────────────

/// Machine-checkable evidence for precompilation postconditions.
#[derive(Debug, Clone)]
pub struct PrecompileCert {
    /// Every node reached `Finalized`.
    pub all_finalized: bool,
    /// Hot and cold traversals are pairwise disjoint.
    pub groups_disjoint: bool,
    /// Every grouped node belongs to the full traversal.
    pub groups_within_traversal: bool,
    /// Every cold group has its trigger symbol allocated.
    pub cold_groups_named: bool,
    /// Inlined nodes appear in no group and declare no outlet variable.
    pub inlined_nodes_elided: bool,
}

impl StageCert for PrecompileCert {
    fn all_pass(&self) -> bool {
        self.all_finalized
            && self.groups_disjoint
            && self.groups_within_traversal
            && self.cold_groups_named
            && self.inlined_nodes_elided
    }

    fn obligations(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("all_finalized", self.all_finalized),
            ("groups_disjoint", self.groups_disjoint),
            ("groups_within_traversal", self.groups_within_traversal),
            ("cold_groups_named", self.cold_groups_named),
            ("inlined_nodes_elided", self.inlined_nodes_elided),
        ]
    }
}

pub fn verify_precompiled(code: &PrecompiledCode, names: &VariableNamesIndex) -> PrecompileCert {
    let all_finalized = code
        .nodes
        .values()
        .all(|n| n.stage == NodeStage::Finalized);

    let groups = std::iter::once(&code.graph.hot).chain(code.graph.cold.iter().map(|g| &g.group));
    let mut seen: HashSet<&str> = HashSet::new();
    let mut groups_disjoint = true;
    let mut groups_within_traversal = true;
    for group in groups {
        for id in &group.traversal {
            groups_disjoint &= seen.insert(id.as_str());
            groups_within_traversal &= code.nodes.contains_key(id);
        }
    }

    let cold_groups_named = code.graph.cold.iter().all(|g| {
        names
            .cold_dsp_groups
            .get(&g.id.to_string())
            .map_or(false, |symbol| symbol == g.function_name)
    });

    let inlined_nodes_elided = code
        .nodes
        .iter()
        .filter(|(_, n)| n.inlined)
        .all(|(id, n)| !seen.contains(id.as_str()) && n.signal_outs.is_empty());

    PrecompileCert {
        all_finalized,
        groups_disjoint,
        groups_within_traversal,
        cold_groups_named,
        inlined_nodes_elided,
    }
}

pub(crate) fn cert_failure(cert: &PrecompileCert) -> CompileError {
    let failed: Vec<&str> = cert
        .obligations()
        .into_iter()
        .filter(|(_, ok)| !ok)
        .map(|(name, _)| name)
        .collect();
    CompileError::Verification(failed.join(", "))
}

// ── Tests ───────────────────────────────────────────────────────────────────
