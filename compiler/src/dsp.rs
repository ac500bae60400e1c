// dsp.rs — DSP partitioning and inline fusion (Pass C)
//
// Splits the signal part of the graph into one hot group, run every frame,
// and cold groups, recomputed only when a message reaches one of their
// members. A node is cold-eligible when it is pure, not pulling, not on a
// signal cycle, has a signal outlet, and all of its signal sources are
// eligible. Connected eligible nodes form one cold group.
//
// Inline fusion then substitutes single-use expression loops into their
// sink's inlet expression, so `a -> b -> c` collapses into one assignment.
//
// Preconditions: nodes `DependenciesCollected`.
// Postconditions: hot and cold groups are disjoint; inlined nodes appear in
//                 no group; nodes `DspPartitioned`.
// Failure modes: loop generator errors propagate.
// Side effects: allocates `COLD_<n>` symbols.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::{debug, debug_span};

use crate::ast::Sequence;
use crate::diag::CompileError;
use crate::graph::{signal_traversal, Connection, Endpoint, Graph, Node, PortletKind};
use crate::id::IdAllocator;
use crate::names::VariableNamesIndex;
use crate::precompile::{
    ColdDspGroup, DspGroup, GraphPartition, NodeStage, PrecompileInput, PrecompiledCode,
};

pub fn partition_dsp(
    input: PrecompileInput<'_>,
    names: &mut VariableNamesIndex,
    code: &mut PrecompiledCode,
) -> Result<(), CompileError> {
    let _span = debug_span!("partition_dsp").entered();
    code.expect_stage(NodeStage::DependenciesCollected)?;

    let graph = input.graph;
    let pulling: Vec<String> = code
        .graph
        .full_traversal
        .iter()
        .filter(|id| graph.get(id).map_or(false, |n| n.is_pulling_signal))
        .cloned()
        .collect();
    let signal_nodes: HashSet<String> = signal_traversal(graph, &pulling, None)?
        .into_iter()
        .collect();
    // Full traversal order, restricted to the signal part.
    let dsp_order: Vec<String> = code
        .graph
        .full_traversal
        .iter()
        .filter(|id| signal_nodes.contains(*id))
        .cloned()
        .collect();

    // ── Cold groups ──
    let cyclic = signal_cycle_members(graph, &dsp_order)?;
    let mut eligibility = Eligibility {
        input,
        signal_nodes: &signal_nodes,
        cyclic: &cyclic,
        memo: HashMap::new(),
    };
    let mut eligible: HashSet<String> = HashSet::new();
    for id in &dsp_order {
        if eligibility.check(id)? {
            eligible.insert(id.clone());
        }
    }

    let mut ids = IdAllocator::new();
    let mut assigned: HashSet<String> = HashSet::new();
    let mut cold = Vec::new();
    for id in &dsp_order {
        if !eligible.contains(id) || assigned.contains(id) {
            continue;
        }
        let members = connected_component(graph, id, &eligible)?;
        let traversal: Vec<String> = dsp_order
            .iter()
            .filter(|n| members.contains(*n))
            .cloned()
            .collect();
        assigned.extend(members.iter().cloned());

        let sink_connections = external_sinks(graph, &traversal, &members)?;
        let mut out_nodes: Vec<String> = Vec::new();
        for conn in &sink_connections {
            if !out_nodes.contains(&conn.source.node_id) {
                out_nodes.push(conn.source.node_id.clone());
            }
        }

        let group_id = ids.alloc_group();
        let function_name = names.attach_cold_dsp_group(group_id);
        debug!(group = %group_id, members = traversal.len(), "cold dsp group");
        cold.push(ColdDspGroup {
            id: group_id,
            group: DspGroup {
                traversal,
                out_nodes,
            },
            sink_connections,
            function_name,
        });
    }

    let hot_traversal: Vec<String> = dsp_order
        .iter()
        .filter(|id| !assigned.contains(*id))
        .cloned()
        .collect();
    let hot_out: Vec<String> = hot_traversal
        .iter()
        .filter(|id| pulling.contains(*id))
        .cloned()
        .collect();
    code.graph.hot = DspGroup {
        traversal: hot_traversal,
        out_nodes: hot_out,
    };
    code.graph.cold = cold;

    // ── Inline fusion ──
    let placement = group_placement(&code.graph);
    for id in &dsp_order {
        fuse_node(input, names, code, &placement, id)?;
    }
    let inlined: HashSet<String> = code
        .nodes
        .iter()
        .filter(|(_, n)| n.inlined)
        .map(|(id, _)| id.clone())
        .collect();
    code.graph.hot.traversal.retain(|id| !inlined.contains(id));
    for group in &mut code.graph.cold {
        group.group.traversal.retain(|id| !inlined.contains(id));
    }

    debug!(
        hot = code.graph.hot.traversal.len(),
        cold = code.graph.cold.len(),
        inlined = inlined.len(),
        "dsp partitioned"
    );
    code.advance_stage(NodeStage::DspPartitioned);
    Ok(())
}

// ── Eligibility ─────────────────────────────────────────────────────────────

struct Eligibility<'a, 'i> {
    input: PrecompileInput<'i>,
    signal_nodes: &'a HashSet<String>,
    cyclic: &'a HashSet<String>,
    memo: HashMap<String, bool>,
}

impl<'a, 'i> Eligibility<'a, 'i> {
    /// Post-order over signal sources with an explicit stack. Cyclic nodes
    /// are decided without looking at their sources, so every expanded path
    /// is acyclic and the walk terminates.
    fn check(&mut self, root: &str) -> Result<bool, CompileError> {
        let graph = self.input.graph;
        let mut stack: Vec<(&str, bool)> = vec![(root, false)];
        while let Some((id, expanded)) = stack.pop() {
            if self.memo.contains_key(id) {
                continue;
            }
            let node = graph.node(id)?;
            if !self.locally_eligible(node)? {
                self.memo.insert(id.to_string(), false);
                continue;
            }
            let mut sources = node
                .inlets_of(PortletKind::Signal)
                .flat_map(|inlet| node.sources_of(&inlet.id))
                .map(|e| e.node_id.as_str());
            if expanded {
                let eligible = sources.all(|s| self.memo.get(s).copied().unwrap_or(false));
                self.memo.insert(id.to_string(), eligible);
            } else {
                stack.push((id, true));
                for source in sources {
                    if !self.memo.contains_key(source) {
                        stack.push((source, false));
                    }
                }
            }
        }
        Ok(self.memo.get(root).copied().unwrap_or(false))
    }

    fn locally_eligible(&self, node: &Node) -> Result<bool, CompileError> {
        let flags = self.input.registry.implementation_for(node)?.flags();
        Ok(flags.is_pure_function
            && !node.is_pulling_signal
            && self.signal_nodes.contains(&node.id)
            && !self.cyclic.contains(&node.id)
            && node.outlets_of(PortletKind::Signal).next().is_some())
    }
}

/// Nodes on a signal cycle: members of a strongly connected component with
/// more than one node, or with a self-connection. Iterative Tarjan over the
/// signal subgraph spanned by `order`.
fn signal_cycle_members(graph: &Graph, order: &[String]) -> Result<HashSet<String>, CompileError> {
    let in_order: HashSet<&str> = order.iter().map(String::as_str).collect();
    let mut sinks: HashMap<&str, Vec<&str>> = HashMap::new();
    for id in order {
        let targets = signal_sink_ids(graph, id)?
            .into_iter()
            .filter(|t| in_order.contains(t))
            .collect();
        sinks.insert(id.as_str(), targets);
    }

    let mut tarjan = Tarjan {
        sinks: &sinks,
        index: HashMap::new(),
        lowlink: HashMap::new(),
        on_stack: HashSet::new(),
        stack: Vec::new(),
        next_index: 0,
        cyclic: HashSet::new(),
    };
    for id in order {
        if !tarjan.index.contains_key(id.as_str()) {
            tarjan.run(id.as_str());
        }
    }
    Ok(tarjan.cyclic)
}

struct Tarjan<'s, 'g> {
    sinks: &'s HashMap<&'g str, Vec<&'g str>>,
    index: HashMap<&'g str, usize>,
    lowlink: HashMap<&'g str, usize>,
    on_stack: HashSet<&'g str>,
    stack: Vec<&'g str>,
    next_index: usize,
    cyclic: HashSet<String>,
}

impl<'s, 'g> Tarjan<'s, 'g> {
    fn run(&mut self, root: &'g str) {
        let sinks = self.sinks;
        // (node, next sink to look at)
        let mut calls: Vec<(&'g str, usize)> = Vec::new();
        self.open(root);
        calls.push((root, 0));

        while let Some(frame) = calls.last_mut() {
            let (id, position) = *frame;
            frame.1 += 1;
            let targets = sinks.get(id).map(Vec::as_slice).unwrap_or(&[]);
            if let Some(&sink) = targets.get(position) {
                match self.index.get(sink) {
                    None => {
                        self.open(sink);
                        calls.push((sink, 0));
                    }
                    Some(&sink_index) if self.on_stack.contains(sink) => {
                        self.lower(id, sink_index);
                    }
                    Some(_) => {}
                }
                continue;
            }

            calls.pop();
            let low = self.lowlink[id];
            if let Some(&(parent, _)) = calls.last() {
                self.lower(parent, low);
            }
            if low == self.index[id] {
                self.close_component(id, targets.contains(&id));
            }
        }
    }

    fn open(&mut self, id: &'g str) {
        self.index.insert(id, self.next_index);
        self.lowlink.insert(id, self.next_index);
        self.next_index += 1;
        self.stack.push(id);
        self.on_stack.insert(id);
    }

    fn lower(&mut self, id: &'g str, value: usize) {
        if let Some(low) = self.lowlink.get_mut(id) {
            *low = (*low).min(value);
        }
    }

    fn close_component(&mut self, root: &'g str, self_loop: bool) {
        let mut members = Vec::new();
        while let Some(member) = self.stack.pop() {
            self.on_stack.remove(member);
            members.push(member);
            if member == root {
                break;
            }
        }
        if members.len() > 1 || self_loop {
            self.cyclic.extend(members.into_iter().map(str::to_string));
        }
    }
}

fn signal_sink_ids<'g>(graph: &'g Graph, id: &str) -> Result<Vec<&'g str>, CompileError> {
    let node = graph.node(id)?;
    Ok(node
        .outlets_of(PortletKind::Signal)
        .flat_map(|o| node.sinks_of(&o.id))
        .map(|e| e.node_id.as_str())
        .collect())
}

/// Eligible nodes reachable from `start` over signal connections in either
/// direction.
fn connected_component(
    graph: &Graph,
    start: &str,
    eligible: &HashSet<String>,
) -> Result<HashSet<String>, CompileError> {
    let mut members = HashSet::new();
    let mut queue = VecDeque::new();
    members.insert(start.to_string());
    queue.push_back(start.to_string());
    while let Some(id) = queue.pop_front() {
        let node = graph.node(&id)?;
        let sinks = node
            .outlets_of(PortletKind::Signal)
            .flat_map(|o| node.sinks_of(&o.id));
        let sources = node
            .inlets_of(PortletKind::Signal)
            .flat_map(|i| node.sources_of(&i.id));
        for endpoint in sinks.chain(sources) {
            if eligible.contains(&endpoint.node_id) && members.insert(endpoint.node_id.clone()) {
                queue.push_back(endpoint.node_id.clone());
            }
        }
    }
    Ok(members)
}

/// Signal connections leaving the group, by member, outlet, then sink order.
fn external_sinks(
    graph: &Graph,
    traversal: &[String],
    members: &HashSet<String>,
) -> Result<Vec<Connection>, CompileError> {
    let mut connections = Vec::new();
    for id in traversal {
        let node = graph.node(id)?;
        for outlet in node.outlets_of(PortletKind::Signal) {
            for sink in node.sinks_of(&outlet.id) {
                if !members.contains(&sink.node_id) {
                    connections.push(Connection {
                        source: Endpoint::new(id.clone(), outlet.id.clone()),
                        sink: sink.clone(),
                    });
                }
            }
        }
    }
    Ok(connections)
}

// ── Inline fusion ───────────────────────────────────────────────────────────

/// Generate the loop of an inline-flagged node and either fuse it into its
/// single sink or turn it into an assignment.
fn fuse_node(
    input: PrecompileInput<'_>,
    names: &VariableNamesIndex,
    code: &mut PrecompiledCode,
    placement: &HashMap<String, Placement>,
    id: &str,
) -> Result<(), CompileError> {
    let node = input.graph.node(id)?;
    let imp = input.registry.implementation_for(node)?;
    if !imp.flags().is_loop_inline {
        return Ok(());
    }

    let generated = {
        let ctx = input.context(id, names, code)?;
        imp.loop_code(&ctx)?
    };
    let expression = generated
        .as_ref()
        .and_then(Sequence::as_expression)
        .map(str::to_string);

    let Some(expression) = expression else {
        let precompiled = code.node_mut(id)?;
        precompiled.dsp.loop_code = generated;
        precompiled.dsp.loop_resolved = true;
        return Ok(());
    };

    let outs: Vec<(String, String)> = code
        .node(id)?
        .signal_outs
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    if let Some(sink_id) = fusion_target(input.graph, code, placement, id, &outs)? {
        let (_, outs_symbol) = &outs[0];
        let replacement = format!("({})", expression);
        let sink = code.node_mut(&sink_id)?;
        for value in sink.signal_ins.values_mut() {
            *value = replace_identifier(value, outs_symbol, &replacement);
        }
        let precompiled = code.node_mut(id)?;
        precompiled.inlined = true;
        precompiled.signal_outs.clear();
        precompiled.dsp.loop_code = None;
        precompiled.dsp.loop_resolved = true;
        debug!(node = %id, into = %sink_id, "inlined");
        return Ok(());
    }

    let loop_code = match outs.as_slice() {
        [(_, symbol)] => Sequence::code(format!("{} = {}", symbol, expression)),
        _ => Sequence::code(expression),
    };
    let precompiled = code.node_mut(id)?;
    precompiled.dsp.loop_code = Some(loop_code);
    precompiled.dsp.loop_resolved = true;
    Ok(())
}

/// Where a node sits after partitioning: its group (`None` for hot) and
/// its position in that group's traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Placement {
    cold_group: Option<usize>,
    position: usize,
}

fn group_placement(partition: &GraphPartition) -> HashMap<String, Placement> {
    let groups = std::iter::once((None, &partition.hot))
        .chain(partition.cold.iter().enumerate().map(|(i, c)| (Some(i), &c.group)));
    let mut placement = HashMap::new();
    for (cold_group, group) in groups {
        for (position, id) in group.traversal.iter().enumerate() {
            placement.insert(
                id.clone(),
                Placement {
                    cold_group,
                    position,
                },
            );
        }
    }
    placement
}

/// The sink an expression can be fused into: the only signal connection of
/// the only signal outlet, landing later in the same group, from a node
/// whose output is not needed outside the group.
fn fusion_target(
    graph: &Graph,
    code: &PrecompiledCode,
    placement: &HashMap<String, Placement>,
    id: &str,
    outs: &[(String, String)],
) -> Result<Option<String>, CompileError> {
    let [(outlet_id, _)] = outs else {
        return Ok(None);
    };
    let node = graph.node(id)?;
    let [sink] = node.sinks_of(outlet_id) else {
        return Ok(None);
    };

    let (Some(own), Some(target)) = (placement.get(id), placement.get(&sink.node_id)) else {
        return Ok(None);
    };
    if own.cold_group != target.cold_group || target.position <= own.position {
        return Ok(None);
    }
    let group = match own.cold_group {
        Some(index) => &code.graph.cold[index].group,
        None => &code.graph.hot,
    };
    if group.out_nodes.iter().any(|n| n == id) {
        return Ok(None);
    }
    Ok(Some(sink.node_id.clone()))
}

/// Replace whole-identifier occurrences of `ident` in `text`.
pub(crate) fn replace_identifier(text: &str, ident: &str, replacement: &str) -> String {
    let is_ident = |c: char| c.is_ascii_alphanumeric() || c == '_';
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find(ident) {
        out.push_str(&rest[..pos]);
        let before = out.chars().next_back();
        let after = rest[pos + ident.len()..].chars().next();
        if before.map_or(true, |c| !is_ident(c)) && after.map_or(true, |c| !is_ident(c)) {
            out.push_str(replacement);
        } else {
            out.push_str(ident);
        }
        rest = &rest[pos + ident.len()..];
    }
    out.push_str(rest);
    out
}

// ── Tests ───────────────────────────────────────────────────────────────────
