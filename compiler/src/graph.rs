// graph.rs — Dataflow graph model for signal/message patches
//
// Nodes carry typed inlets/outlets and both views of every connection
// (`sources` per inlet, `sinks` per outlet). Queries, the two traversals and
// trimming are pure functions over a borrowed `Graph`.
//
// Preconditions: graphs loaded through `Graph::from_json` or built with
//                `Graph::connect` keep both connection views consistent.
// Postconditions: traversals list every reachable node exactly once;
//                 `trim_graph` never leaves an endpoint naming a removed node.
// Failure modes: dangling connection, unknown node or undeclared portlet
//                → `CompileError::GraphIntegrity`.
// Side effects: none.

use std::collections::{HashSet, VecDeque};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::diag::CompileError;

// ── Public types ────────────────────────────────────────────────────────────

/// Kind of value carried by a portlet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortletKind {
    /// Per-sample value, resolved to an expression at compile time.
    Signal,
    /// Discrete event, resolved to a function call chain.
    Message,
}

/// An inlet or outlet declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Portlet {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: PortletKind,
}

/// One end of a connection: a portlet of a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub node_id: String,
    pub portlet_id: String,
}

impl Endpoint {
    pub fn new(node_id: impl Into<String>, portlet_id: impl Into<String>) -> Self {
        Endpoint {
            node_id: node_id.into(),
            portlet_id: portlet_id.into(),
        }
    }
}

/// An outlet → inlet connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Connection {
    pub source: Endpoint,
    pub sink: Endpoint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub args: IndexMap<String, serde_json::Value>,
    #[serde(default)]
    pub inlets: IndexMap<String, Portlet>,
    #[serde(default)]
    pub outlets: IndexMap<String, Portlet>,
    #[serde(default)]
    pub sources: IndexMap<String, Vec<Endpoint>>,
    #[serde(default)]
    pub sinks: IndexMap<String, Vec<Endpoint>>,
    /// Must run every frame even without sinks (e.g. audio output).
    #[serde(default)]
    pub is_pulling_signal: bool,
    /// Originates messages on its own (e.g. a timer).
    #[serde(default)]
    pub is_pushing_messages: bool,
}

/// The patch graph, keyed by node id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Graph {
    pub nodes: IndexMap<String, Node>,
}

// ── Node ────────────────────────────────────────────────────────────────────

impl Node {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Node {
            id: id.into(),
            node_type: node_type.into(),
            args: IndexMap::new(),
            inlets: IndexMap::new(),
            outlets: IndexMap::new(),
            sources: IndexMap::new(),
            sinks: IndexMap::new(),
            is_pulling_signal: false,
            is_pushing_messages: false,
        }
    }

    pub fn with_inlet(mut self, id: impl Into<String>, kind: PortletKind) -> Self {
        let id = id.into();
        self.inlets.insert(id.clone(), Portlet { id, kind });
        self
    }

    pub fn with_outlet(mut self, id: impl Into<String>, kind: PortletKind) -> Self {
        let id = id.into();
        self.outlets.insert(id.clone(), Portlet { id, kind });
        self
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.args.insert(key.into(), value);
        self
    }

    pub fn pulling_signal(mut self) -> Self {
        self.is_pulling_signal = true;
        self
    }

    pub fn pushing_messages(mut self) -> Self {
        self.is_pushing_messages = true;
        self
    }

    pub fn inlet(&self, id: &str) -> Result<&Portlet, CompileError> {
        self.inlets.get(id).ok_or_else(|| {
            CompileError::graph_at(&self.id, Some(id), "inlet is not declared")
        })
    }

    pub fn outlet(&self, id: &str) -> Result<&Portlet, CompileError> {
        self.outlets.get(id).ok_or_else(|| {
            CompileError::graph_at(&self.id, Some(id), "outlet is not declared")
        })
    }

    pub fn inlets_of(&self, kind: PortletKind) -> impl Iterator<Item = &Portlet> {
        self.inlets.values().filter(move |p| p.kind == kind)
    }

    pub fn outlets_of(&self, kind: PortletKind) -> impl Iterator<Item = &Portlet> {
        self.outlets.values().filter(move |p| p.kind == kind)
    }

    /// Sources connected to `inlet_id`, in connection order.
    pub fn sources_of(&self, inlet_id: &str) -> &[Endpoint] {
        self.sources.get(inlet_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Sinks connected to `outlet_id`, in connection order.
    pub fn sinks_of(&self, outlet_id: &str) -> &[Endpoint] {
        self.sinks.get(outlet_id).map(Vec::as_slice).unwrap_or(&[])
    }
}

// ── Graph ───────────────────────────────────────────────────────────────────

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a graph from its JSON form (an object keyed by node id) and check
    /// its integrity.
    pub fn from_json(text: &str) -> Result<Graph, CompileError> {
        let graph: Graph = serde_json::from_str(text)
            .map_err(|e| CompileError::graph(format!("invalid graph JSON: {}", e)))?;
        graph.check_integrity()?;
        Ok(graph)
    }

    /// Compact JSON, stable for identical graphs. Used for provenance hashing.
    pub fn canonical_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn with_node(mut self, node: Node) -> Self {
        self.insert(node);
        self
    }

    pub fn insert(&mut self, node: Node) {
        self.nodes.insert(node.id.clone(), node);
    }

    pub fn get(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn node(&self, id: &str) -> Result<&Node, CompileError> {
        self.nodes
            .get(id)
            .ok_or_else(|| CompileError::graph(format!("node \"{}\" not found in graph", id)))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Connect `source` outlet to `sink` inlet, updating both views.
    /// Connecting the same pair twice is a no-op.
    pub fn connect(&mut self, source: Endpoint, sink: Endpoint) -> Result<(), CompileError> {
        self.node(&source.node_id)?.outlet(&source.portlet_id)?;
        self.node(&sink.node_id)?.inlet(&sink.portlet_id)?;

        if let Some(node) = self.nodes.get_mut(&source.node_id) {
            let list = node.sinks.entry(source.portlet_id.clone()).or_default();
            if !list.contains(&sink) {
                list.push(sink.clone());
            }
        }
        if let Some(node) = self.nodes.get_mut(&sink.node_id) {
            let list = node.sources.entry(sink.portlet_id.clone()).or_default();
            if !list.contains(&source) {
                list.push(source);
            }
        }
        Ok(())
    }

    /// Check that every endpoint names an existing portlet of an existing
    /// node, and that the `sources` and `sinks` views mirror each other.
    pub fn check_integrity(&self) -> Result<(), CompileError> {
        for (key, node) in &self.nodes {
            if key != &node.id {
                return Err(CompileError::graph_at(
                    key,
                    None,
                    format!("node is keyed \"{}\" but declares id \"{}\"", key, node.id),
                ));
            }
            for (outlet_id, sinks) in &node.sinks {
                node.outlet(outlet_id)?;
                for sink in sinks {
                    let sink_node = self.node(&sink.node_id).map_err(|_| {
                        CompileError::graph_at(
                            &node.id,
                            Some(outlet_id),
                            format!("sink node \"{}\" not found", sink.node_id),
                        )
                    })?;
                    sink_node.inlet(&sink.portlet_id)?;
                    let mirrored = sink_node
                        .sources_of(&sink.portlet_id)
                        .iter()
                        .any(|s| s.node_id == node.id && &s.portlet_id == outlet_id);
                    if !mirrored {
                        return Err(CompileError::graph_at(
                            &node.id,
                            Some(outlet_id),
                            format!(
                                "sink \"{}:{}\" has no matching source entry",
                                sink.node_id, sink.portlet_id
                            ),
                        ));
                    }
                }
            }
            for (inlet_id, sources) in &node.sources {
                node.inlet(inlet_id)?;
                for source in sources {
                    let source_node = self.node(&source.node_id).map_err(|_| {
                        CompileError::graph_at(
                            &node.id,
                            Some(inlet_id),
                            format!("source node \"{}\" not found", source.node_id),
                        )
                    })?;
                    source_node.outlet(&source.portlet_id)?;
                    let mirrored = source_node
                        .sinks_of(&source.portlet_id)
                        .iter()
                        .any(|s| s.node_id == node.id && &s.portlet_id == inlet_id);
                    if !mirrored {
                        return Err(CompileError::graph_at(
                            &node.id,
                            Some(inlet_id),
                            format!(
                                "source \"{}:{}\" has no matching sink entry",
                                source.node_id, source.portlet_id
                            ),
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

// ── Queries ─────────────────────────────────────────────────────────────────

/// Nodes connected downstream of `node` through outlets of `kind`,
/// deduplicated, in connection order.
pub fn list_sink_nodes<'g>(
    graph: &'g Graph,
    node: &Node,
    kind: PortletKind,
) -> Result<Vec<&'g Node>, CompileError> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for outlet in node.outlets_of(kind) {
        for sink in node.sinks_of(&outlet.id) {
            if seen.insert(sink.node_id.as_str()) {
                out.push(graph.node(&sink.node_id)?);
            }
        }
    }
    Ok(out)
}

/// Nodes connected upstream of `node` through inlets of `kind`,
/// deduplicated, in connection order.
pub fn list_source_nodes<'g>(
    graph: &'g Graph,
    node: &Node,
    kind: PortletKind,
) -> Result<Vec<&'g Node>, CompileError> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for inlet in node.inlets_of(kind) {
        for source in node.sources_of(&inlet.id) {
            if seen.insert(source.node_id.as_str()) {
                out.push(graph.node(&source.node_id)?);
            }
        }
    }
    Ok(out)
}

/// Every connection arriving at `node`, per inlet in declaration order.
pub fn list_source_connections(node: &Node) -> Vec<Connection> {
    let mut out = Vec::new();
    for inlet_id in node.inlets.keys() {
        for source in node.sources_of(inlet_id) {
            out.push(Connection {
                source: source.clone(),
                sink: Endpoint::new(&node.id, inlet_id),
            });
        }
    }
    out
}

/// Every connection leaving `node`, per outlet in declaration order.
pub fn list_sink_connections(node: &Node) -> Vec<Connection> {
    let mut out = Vec::new();
    for outlet_id in node.outlets.keys() {
        for sink in node.sinks_of(outlet_id) {
            out.push(Connection {
                source: Endpoint::new(&node.id, outlet_id),
                sink: sink.clone(),
            });
        }
    }
    out
}

// ── Traversals ──────────────────────────────────────────────────────────────

/// Depth-first post-order over signal connections: every node comes after
/// its signal sources. A node already on the current path is treated as
/// satisfied, so feedback loops terminate.
///
/// `explore_sources`, when given, is asked for every visited node; returning
/// `false` keeps the node but does not walk its sources.
pub fn signal_traversal(
    graph: &Graph,
    roots: &[String],
    explore_sources: Option<&dyn Fn(&Node) -> bool>,
) -> Result<Vec<String>, CompileError> {
    let mut walk = SignalWalk {
        graph,
        explore_sources,
        visited: HashSet::new(),
        on_path: HashSet::new(),
        order: Vec::new(),
    };
    for root in roots {
        walk.visit(root)?;
    }
    Ok(walk.order)
}

struct SignalWalk<'g, 'p> {
    graph: &'g Graph,
    explore_sources: Option<&'p dyn Fn(&Node) -> bool>,
    visited: HashSet<&'g str>,
    on_path: HashSet<&'g str>,
    order: Vec<String>,
}

/// One node on the walk stack: its signal sources as `(inlet, source node)`
/// and the index of the next one to visit.
struct WalkFrame<'g> {
    node: &'g Node,
    sources: Vec<(&'g str, &'g str)>,
    next: usize,
}

impl<'g, 'p> SignalWalk<'g, 'p> {
    /// Explicit stack instead of recursion: long chains must not grow the
    /// call stack.
    fn visit(&mut self, root: &str) -> Result<(), CompileError> {
        let graph = self.graph;
        let node = graph.node(root)?;
        if self.visited.contains(node.id.as_str()) || self.on_path.contains(node.id.as_str()) {
            return Ok(());
        }
        let mut stack = vec![self.enter(node)?];

        while let Some(frame) = stack.last_mut() {
            let node: &'g Node = frame.node;
            let Some(&(inlet_id, source_id)) = frame.sources.get(frame.next) else {
                stack.pop();
                let id = node.id.as_str();
                self.on_path.remove(id);
                self.visited.insert(id);
                self.order.push(id.to_string());
                continue;
            };
            frame.next += 1;

            let source = graph.get(source_id).ok_or_else(|| {
                CompileError::graph_at(
                    &node.id,
                    Some(inlet_id),
                    format!("source node \"{}\" not found", source_id),
                )
            })?;
            if self.visited.contains(source_id) || self.on_path.contains(source_id) {
                continue;
            }
            let entered = self.enter(source)?;
            stack.push(entered);
        }
        Ok(())
    }

    fn enter(&mut self, node: &'g Node) -> Result<WalkFrame<'g>, CompileError> {
        self.on_path.insert(node.id.as_str());
        let mut sources = Vec::new();
        if self.explore_sources.map_or(true, |f| f(node)) {
            for (inlet_id, endpoints) in &node.sources {
                if node.inlet(inlet_id)?.kind != PortletKind::Signal {
                    continue;
                }
                for source in endpoints {
                    sources.push((inlet_id.as_str(), source.node_id.as_str()));
                }
            }
        }
        Ok(WalkFrame {
            node,
            sources,
            next: 0,
        })
    }
}

/// Breadth-first walk over message connections from `roots`; each node is
/// listed once, at its first discovery.
pub fn message_traversal(graph: &Graph, roots: &[String]) -> Result<Vec<String>, CompileError> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&Node> = VecDeque::new();
    let mut order = Vec::new();

    for root in roots {
        let node = graph.node(root)?;
        if seen.insert(node.id.as_str()) {
            queue.push_back(node);
        }
    }

    while let Some(node) = queue.pop_front() {
        order.push(node.id.clone());
        for outlet in node.outlets_of(PortletKind::Message) {
            for sink in node.sinks_of(&outlet.id) {
                let sink_node = graph.get(&sink.node_id).ok_or_else(|| {
                    CompileError::graph_at(
                        &node.id,
                        Some(&outlet.id),
                        format!("sink node \"{}\" not found", sink.node_id),
                    )
                })?;
                if seen.insert(sink_node.id.as_str()) {
                    queue.push_back(sink_node);
                }
            }
        }
    }
    Ok(order)
}

// ── Trimming ────────────────────────────────────────────────────────────────

/// A copy of `graph` restricted to `keep`, with every endpoint naming a
/// removed node stripped from both connection views.
pub fn trim_graph(graph: &Graph, keep: &[String]) -> Graph {
    let keep: HashSet<&str> = keep.iter().map(String::as_str).collect();
    let mut trimmed = Graph::new();
    for (id, node) in &graph.nodes {
        if !keep.contains(id.as_str()) {
            continue;
        }
        let mut node = node.clone();
        strip_endpoints(&mut node.sources, &keep);
        strip_endpoints(&mut node.sinks, &keep);
        trimmed.insert(node);
    }
    trimmed
}

fn strip_endpoints(map: &mut IndexMap<String, Vec<Endpoint>>, keep: &HashSet<&str>) {
    for endpoints in map.values_mut() {
        endpoints.retain(|e| keep.contains(e.node_id.as_str()));
    }
    map.retain(|_, endpoints| !endpoints.is_empty());
}

// ── Tests ───────────────────────────────────────────────────────────────────
