// registry.rs — Node implementation interface and registry
//
// A node implementation supplies code generators for one node type. The
// compiler calls them at most once per node (or once per type for `core`)
// and splices the returned fragments verbatim. Generators read names through
// `NodeContext` / `TypeContext`; every read of an unpopulated slot fails with
// `CompileError::Namespace`.

use std::rc::Rc;

use indexmap::IndexMap;
use serde::Serialize;

use crate::ast::Sequence;
use crate::dependencies::GlobalDefinitions;
use crate::diag::CompileError;
use crate::graph::Node;
use crate::names::{Globs, PortletSlot, VariableNamesIndex};
use crate::settings::CompilationSettings;
use crate::stdlib::Stdlib;

// ── Data types ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeFlags {
    /// Output depends only on inputs and state; eligible for cold groups.
    pub is_pure_function: bool,
    /// `loop_code` returns a single expression that may be fused at its use.
    pub is_loop_inline: bool,
}

/// One member of a node's persistent state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateMember {
    pub name: String,
    pub typ: String,
    /// Initial value, as target code.
    pub value: String,
}

/// Body of a message receiver.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageReceiver {
    pub body: Sequence,
    /// The body returns for every message shape; no fallback error is added.
    pub exhaustive: bool,
}

impl MessageReceiver {
    pub fn new(body: impl Into<Sequence>) -> Self {
        MessageReceiver {
            body: body.into(),
            exhaustive: false,
        }
    }

    pub fn exhaustive(mut self) -> Self {
        self.exhaustive = true;
        self
    }
}

// ── Generator contexts ──────────────────────────────────────────────────────

/// What a per-node generator can see.
pub struct NodeContext<'a> {
    pub node: &'a Node,
    pub names: &'a VariableNamesIndex,
    pub settings: &'a CompilationSettings,
    /// Resolved signal inlet expressions.
    pub signal_ins: &'a IndexMap<String, String>,
}

impl<'a> NodeContext<'a> {
    /// Expression feeding signal inlet `inlet_id`.
    pub fn ins(&self, inlet_id: &str) -> Result<&'a str, CompileError> {
        self.signal_ins
            .get(inlet_id)
            .map(String::as_str)
            .ok_or_else(|| CompileError::namespace(format!("n_{}_ins", self.node.id), inlet_id))
    }

    pub fn outs(&self, outlet_id: &str) -> Result<&'a str, CompileError> {
        self.names.portlet(PortletSlot::Outs, &self.node.id, outlet_id)
    }

    pub fn snds(&self, outlet_id: &str) -> Result<&'a str, CompileError> {
        self.names.portlet(PortletSlot::Snds, &self.node.id, outlet_id)
    }

    pub fn rcvs(&self, inlet_id: &str) -> Result<&'a str, CompileError> {
        self.names.portlet(PortletSlot::Rcvs, &self.node.id, inlet_id)
    }

    pub fn state(&self) -> Result<&'a str, CompileError> {
        Ok(&self.names.node(&self.node.id)?.state)
    }

    /// Symbol of `local` in this node type's namespace.
    pub fn ns(&self, local: &str) -> Result<&'a str, CompileError> {
        let tag = self.names.type_tag(&self.node.node_type)?;
        self.names.global(tag, local)
    }

    pub fn global(&self, tag: &str, local: &str) -> Result<&'a str, CompileError> {
        self.names.global(tag, local)
    }

    pub fn globs(&self) -> &'a Globs {
        &self.names.globs
    }

    pub fn arg(&self, key: &str) -> Option<&'a serde_json::Value> {
        self.node.args.get(key)
    }
}

/// What a per-type generator (`core`) can see.
pub struct TypeContext<'a> {
    pub node_type: &'a str,
    pub names: &'a VariableNamesIndex,
    pub settings: &'a CompilationSettings,
}

impl<'a> TypeContext<'a> {
    pub fn ns(&self, local: &str) -> Result<&'a str, CompileError> {
        let tag = self.names.type_tag(self.node_type)?;
        self.names.global(tag, local)
    }

    pub fn global(&self, tag: &str, local: &str) -> Result<&'a str, CompileError> {
        self.names.global(tag, local)
    }

    pub fn globs(&self) -> &'a Globs {
        &self.names.globs
    }
}

// ── Implementation trait ────────────────────────────────────────────────────

/// Code generators for one node type. Every method has an empty default.
pub trait NodeImplementation {
    fn flags(&self) -> NodeFlags {
        NodeFlags::default()
    }

    /// Local names of the per-type namespace, allocated as `<tag>_<local>`.
    fn namespace(&self) -> Vec<String> {
        Vec::new()
    }

    /// Shared code for all nodes of this type.
    fn core(&self, _ctx: &TypeContext<'_>) -> Result<Option<Sequence>, CompileError> {
        Ok(None)
    }

    /// Persistent per-node state. Every node of a type must declare the same
    /// member names and types.
    fn state(&self, _ctx: &NodeContext<'_>) -> Result<Vec<StateMember>, CompileError> {
        Ok(Vec::new())
    }

    /// Custom per-node initialisation.
    fn declarations(&self, _ctx: &NodeContext<'_>) -> Result<Option<Sequence>, CompileError> {
        Ok(None)
    }

    /// Per-sample code; a bare expression when `is_loop_inline` is set.
    fn loop_code(&self, _ctx: &NodeContext<'_>) -> Result<Option<Sequence>, CompileError> {
        Ok(None)
    }

    /// Per-inlet code re-run when that inlet's source changes.
    fn inlet_dsp(
        &self,
        _ctx: &NodeContext<'_>,
    ) -> Result<IndexMap<String, Sequence>, CompileError> {
        Ok(IndexMap::new())
    }

    /// Receiver bodies keyed by message inlet id.
    fn message_receivers(
        &self,
        _ctx: &NodeContext<'_>,
    ) -> Result<IndexMap<String, MessageReceiver>, CompileError> {
        Ok(IndexMap::new())
    }

    fn dependencies(&self) -> Vec<Rc<GlobalDefinitions>> {
        Vec::new()
    }
}

// ── Registry ────────────────────────────────────────────────────────────────

/// Node type → implementation, plus the shared helper namespaces.
pub struct NodeRegistry {
    stdlib: Stdlib,
    types: IndexMap<String, Box<dyn NodeImplementation>>,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRegistry {
    pub fn new() -> Self {
        NodeRegistry {
            stdlib: Stdlib::new(),
            types: IndexMap::new(),
        }
    }

    pub fn stdlib(&self) -> &Stdlib {
        &self.stdlib
    }

    pub fn register(
        &mut self,
        node_type: impl Into<String>,
        implementation: impl NodeImplementation + 'static,
    ) {
        self.types.insert(node_type.into(), Box::new(implementation));
    }

    pub fn register_boxed(
        &mut self,
        node_type: impl Into<String>,
        implementation: Box<dyn NodeImplementation>,
    ) {
        self.types.insert(node_type.into(), implementation);
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.types.contains_key(node_type)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn get(&self, node_type: &str) -> Option<&dyn NodeImplementation> {
        self.types.get(node_type).map(|b| b.as_ref())
    }

    /// Implementation for `node`, or `MissingImplementation` naming it.
    pub fn implementation_for(&self, node: &Node) -> Result<&dyn NodeImplementation, CompileError> {
        self.get(&node.node_type)
            .ok_or_else(|| CompileError::MissingImplementation {
                node_type: node.node_type.clone(),
                node_id: Some(node.id.clone()),
                portlet_id: None,
                message: "unknown node type".into(),
            })
    }

    /// Compact JSON of the registered types and their flags, sorted by type.
    /// Used for provenance fingerprints.
    pub fn canonical_json(&self) -> String {
        let mut entries: Vec<(&String, NodeFlags)> = self
            .types
            .iter()
            .map(|(name, imp)| (name, imp.flags()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        let map: IndexMap<&String, NodeFlags> = entries.into_iter().collect();
        serde_json::to_string(&map).unwrap_or_default()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
