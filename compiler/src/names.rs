// names.rs — Variable name allocation for generated code
//
// Builds the `VariableNamesIndex`: one state symbol and three portlet
// namespaces (`outs`, `snds`, `rcvs`) per node, engine globals, namespaced
// helper symbols, cold-group triggers, outlet listeners and inlet callers.
//
// Preconditions: node and portlet ids are identifier fragments
//                (`[a-zA-Z0-9_]+`).
// Postconditions: a symbol, once allocated, never changes; re-attaching
//                 returns the stored symbol.
// Failure modes: illegal characters → `CompileError::InvalidName`;
//                reading an unallocated slot → `CompileError::Namespace`.
// Side effects: none.

use indexmap::IndexMap;
use serde::Serialize;

use crate::diag::CompileError;
use crate::graph::Graph;
use crate::id::GroupId;

// ── Namespace ───────────────────────────────────────────────────────────────

/// Keyed symbol table whose reads fail loudly on missing keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Namespace {
    #[serde(skip)]
    label: String,
    #[serde(flatten)]
    entries: IndexMap<String, String>,
}

impl Namespace {
    pub fn new(label: impl Into<String>) -> Self {
        Namespace {
            label: label.into(),
            entries: IndexMap::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn get(&self, key: &str) -> Result<&str, CompileError> {
        self.entries
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| CompileError::namespace(&self.label, key))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Store `value` under `key` unless the key is already taken; returns
    /// the symbol that ends up stored.
    pub fn assign(&mut self, key: &str, value: impl FnOnce() -> String) -> &str {
        self.entries.entry(key.to_string()).or_insert_with(value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ── Index ───────────────────────────────────────────────────────────────────

/// Which per-node portlet namespace a symbol lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortletSlot {
    /// Signal outlet variable.
    Outs,
    /// Message sender function.
    Snds,
    /// Message receiver function.
    Rcvs,
}

impl PortletSlot {
    fn suffix(self) -> &'static str {
        match self {
            PortletSlot::Outs => "OUTS",
            PortletSlot::Snds => "SNDS",
            PortletSlot::Rcvs => "RCVS",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeVariableNames {
    pub prefix: String,
    pub state: String,
    pub outs: Namespace,
    pub snds: Namespace,
    pub rcvs: Namespace,
}

impl NodeVariableNames {
    pub fn slot(&self, slot: PortletSlot) -> &Namespace {
        match slot {
            PortletSlot::Outs => &self.outs,
            PortletSlot::Snds => &self.snds,
            PortletSlot::Rcvs => &self.rcvs,
        }
    }

    fn slot_mut(&mut self, slot: PortletSlot) -> &mut Namespace {
        match slot {
            PortletSlot::Outs => &mut self.outs,
            PortletSlot::Snds => &mut self.snds,
            PortletSlot::Rcvs => &mut self.rcvs,
        }
    }
}

/// Engine-level symbols shared by every generated program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Globs {
    pub iter_frame: String,
    pub frame: String,
    pub block_size: String,
    pub sample_rate: String,
    pub output: String,
    pub input: String,
    pub null_receiver: String,
    pub null_signal: String,
    pub empty_message: String,
}

impl Default for Globs {
    fn default() -> Self {
        Globs {
            iter_frame: "F".into(),
            frame: "FRAME".into(),
            block_size: "BLOCK_SIZE".into(),
            sample_rate: "SAMPLE_RATE".into(),
            output: "OUTPUT".into(),
            input: "INPUT".into(),
            null_receiver: "SND_TO_NULL".into(),
            null_signal: "NULL_SIGNAL".into(),
            empty_message: "EMPTY_MESSAGE".into(),
        }
    }
}

impl Globs {
    /// Look a glob up by the key used in code templates.
    pub fn get(&self, key: &str) -> Result<&str, CompileError> {
        let value = match key {
            "iterFrame" => &self.iter_frame,
            "frame" => &self.frame,
            "blockSize" => &self.block_size,
            "sampleRate" => &self.sample_rate,
            "output" => &self.output,
            "input" => &self.input,
            "nullReceiver" => &self.null_receiver,
            "nullSignal" => &self.null_signal,
            "emptyMessage" => &self.empty_message,
            _ => return Err(CompileError::namespace("globs", key)),
        };
        Ok(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableNamesIndex {
    pub nodes: IndexMap<String, NodeVariableNames>,
    pub globs: Globs,
    /// Namespace tag → local name → symbol.
    pub globals: IndexMap<String, Namespace>,
    /// Node type → namespace tag used for its shared code and state class.
    pub type_tags: IndexMap<String, String>,
    pub cold_dsp_groups: Namespace,
    pub outlet_listeners: IndexMap<String, Namespace>,
    pub inlet_callers: IndexMap<String, Namespace>,
}

/// Allocate the index for `graph`: a state symbol per node plus empty
/// portlet namespaces. With `debug`, prefixes read `<type>_<id>`, where the
/// sanitized type may be empty (`_<id>`).
pub fn generate_variable_names_index(
    graph: &Graph,
    debug: bool,
) -> Result<VariableNamesIndex, CompileError> {
    let mut nodes = IndexMap::new();
    for node in graph.nodes.values() {
        let id = assert_valid_name_part(&node.id)?;
        let prefix = if debug {
            format!("{}_{}", sanitize_name_part(&node.node_type), id)
        } else {
            id.to_string()
        };
        let label = |part: &str| format!("n_{}_{}", node.id, part);
        nodes.insert(
            node.id.clone(),
            NodeVariableNames {
                state: format!("{}_STATE", prefix),
                outs: Namespace::new(label("outs")),
                snds: Namespace::new(label("snds")),
                rcvs: Namespace::new(label("rcvs")),
                prefix,
            },
        );
    }
    Ok(VariableNamesIndex {
        nodes,
        globs: Globs::default(),
        globals: IndexMap::new(),
        type_tags: IndexMap::new(),
        cold_dsp_groups: Namespace::new("coldDspGroups"),
        outlet_listeners: IndexMap::new(),
        inlet_callers: IndexMap::new(),
    })
}

impl VariableNamesIndex {
    pub fn node(&self, node_id: &str) -> Result<&NodeVariableNames, CompileError> {
        self.nodes
            .get(node_id)
            .ok_or_else(|| CompileError::namespace("nodes", node_id))
    }

    fn node_mut(&mut self, node_id: &str) -> Result<&mut NodeVariableNames, CompileError> {
        self.nodes
            .get_mut(node_id)
            .ok_or_else(|| CompileError::namespace("nodes", node_id))
    }

    /// Allocate `<prefix>_<SLOT>_<portletId>` for a node portlet. Idempotent.
    pub fn attach_node_portlet(
        &mut self,
        slot: PortletSlot,
        node_id: &str,
        portlet_id: &str,
    ) -> Result<String, CompileError> {
        assert_valid_name_part(portlet_id)?;
        let names = self.node_mut(node_id)?;
        let symbol = format!("{}_{}_{}", names.prefix, slot.suffix(), portlet_id);
        Ok(names.slot_mut(slot).assign(portlet_id, || symbol).to_string())
    }

    /// Point a portlet slot at an existing symbol (a sink's receiver, the
    /// null receiver...). A slot already holding a symbol keeps it.
    pub fn alias_node_portlet(
        &mut self,
        slot: PortletSlot,
        node_id: &str,
        portlet_id: &str,
        symbol: &str,
    ) -> Result<String, CompileError> {
        let names = self.node_mut(node_id)?;
        Ok(names
            .slot_mut(slot)
            .assign(portlet_id, || symbol.to_string())
            .to_string())
    }

    pub fn portlet(
        &self,
        slot: PortletSlot,
        node_id: &str,
        portlet_id: &str,
    ) -> Result<&str, CompileError> {
        self.node(node_id)?.slot(slot).get(portlet_id)
    }

    /// `outletListeners_<nodeId>_<outletId>`.
    pub fn attach_outlet_listener(
        &mut self,
        node_id: &str,
        outlet_id: &str,
    ) -> Result<String, CompileError> {
        assert_valid_name_part(node_id)?;
        assert_valid_name_part(outlet_id)?;
        let ns = self
            .outlet_listeners
            .entry(node_id.to_string())
            .or_insert_with(|| Namespace::new(format!("outletListeners_{}", node_id)));
        Ok(ns
            .assign(outlet_id, || {
                format!("outletListeners_{}_{}", node_id, outlet_id)
            })
            .to_string())
    }

    pub fn outlet_listener(&self, node_id: &str, outlet_id: &str) -> Option<&str> {
        self.outlet_listeners
            .get(node_id)
            .and_then(|ns| ns.get(outlet_id).ok())
    }

    /// `inletCallers_<nodeId>_<inletId>`.
    pub fn attach_inlet_caller(
        &mut self,
        node_id: &str,
        inlet_id: &str,
    ) -> Result<String, CompileError> {
        assert_valid_name_part(node_id)?;
        assert_valid_name_part(inlet_id)?;
        let ns = self
            .inlet_callers
            .entry(node_id.to_string())
            .or_insert_with(|| Namespace::new(format!("inletCallers_{}", node_id)));
        Ok(ns
            .assign(inlet_id, || format!("inletCallers_{}_{}", node_id, inlet_id))
            .to_string())
    }

    pub fn inlet_caller(&self, node_id: &str, inlet_id: &str) -> Option<&str> {
        self.inlet_callers
            .get(node_id)
            .and_then(|ns| ns.get(inlet_id).ok())
    }

    /// Trigger function name of a cold DSP group: `COLD_<n>`.
    pub fn attach_cold_dsp_group(&mut self, group: GroupId) -> String {
        self.cold_dsp_groups
            .assign(&group.to_string(), || format!("COLD_{}", group))
            .to_string()
    }

    /// Allocate `<tag>_<local>` in a helper namespace. Idempotent.
    pub fn attach_global(&mut self, tag: &str, local: &str) -> Result<String, CompileError> {
        assert_valid_name_part(tag)?;
        assert_valid_name_part(local)?;
        let ns = self
            .globals
            .entry(tag.to_string())
            .or_insert_with(|| Namespace::new(tag));
        Ok(ns
            .assign(local, || format!("{}_{}", tag, local))
            .to_string())
    }

    pub fn global(&self, tag: &str, local: &str) -> Result<&str, CompileError> {
        self.globals
            .get(tag)
            .ok_or_else(|| CompileError::namespace("globals", tag))?
            .get(local)
    }

    /// Namespace tag of a node type. Distinct types whose sanitised names
    /// collide get a numeric suffix.
    pub fn attach_type_tag(&mut self, node_type: &str) -> String {
        if let Some(tag) = self.type_tags.get(node_type) {
            return tag.clone();
        }
        let base = match sanitize_name_part(node_type) {
            s if s.is_empty() => "t".to_string(),
            s => s,
        };
        let mut tag = format!("n_{}", base);
        let mut suffix = 1;
        while self.type_tags.values().any(|t| t == &tag) {
            suffix += 1;
            tag = format!("n_{}_{}", base, suffix);
        }
        self.type_tags.insert(node_type.to_string(), tag.clone());
        tag
    }

    pub fn type_tag(&self, node_type: &str) -> Result<&str, CompileError> {
        self.type_tags
            .get(node_type)
            .map(String::as_str)
            .ok_or_else(|| CompileError::namespace("typeTags", node_type))
    }
}

// ── Name validation ─────────────────────────────────────────────────────────

/// Accept only non-empty `[a-zA-Z0-9_]+` fragments.
pub fn assert_valid_name_part(part: &str) -> Result<&str, CompileError> {
    let valid = !part.is_empty()
        && part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(part)
    } else {
        Err(CompileError::InvalidName(part.to_string()))
    }
}

/// Drop every character not allowed in an identifier fragment.
pub fn sanitize_name_part(part: &str) -> String {
    part.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect()
}

// ── Tests ───────────────────────────────────────────────────────────────────
