// settings.rs — Compilation settings: user input, validation, defaults
//
// `UserSettings` mirrors the JSON a caller provides, every field optional.
// `validate_settings` fills defaults and rejects malformed values before any
// pass runs; `validate_io_specs` checks inlet-caller and outlet-listener
// specs against the graph.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::diag::CompileError;
use crate::graph::{Graph, PortletKind};
use crate::names::assert_valid_name_part;

/// Node id → portlet ids.
pub type PortletSpecs = IndexMap<String, Vec<String>>;

// ── User-facing form ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UserSettings {
    pub audio: Option<UserAudioSettings>,
    pub arrays: Option<IndexMap<String, Vec<f64>>>,
    pub inlet_caller_specs: Option<PortletSpecs>,
    pub outlet_listener_specs: Option<PortletSpecs>,
    pub debug: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAudioSettings {
    pub channel_count: Option<ChannelCount>,
    pub bit_depth: Option<u32>,
}

impl UserSettings {
    pub fn from_json(text: &str) -> Result<UserSettings, CompileError> {
        serde_json::from_str(text)
            .map_err(|e| CompileError::InvalidSettings(format!("malformed settings: {}", e)))
    }
}

// ── Validated form ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelCount {
    #[serde(rename = "in")]
    pub input: u32,
    #[serde(rename = "out")]
    pub output: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BitDepth {
    #[serde(rename = "32")]
    B32,
    #[serde(rename = "64")]
    B64,
}

impl BitDepth {
    pub fn from_bits(bits: u32) -> Result<BitDepth, CompileError> {
        match bits {
            32 => Ok(BitDepth::B32),
            64 => Ok(BitDepth::B64),
            _ => Err(CompileError::InvalidSettings(
                "\"bitDepth\" can be only 32 or 64".into(),
            )),
        }
    }

    pub fn bits(self) -> u32 {
        match self {
            BitDepth::B32 => 32,
            BitDepth::B64 => 64,
        }
    }

    /// Scalar float type name for generated code.
    pub fn float_type(self) -> &'static str {
        match self {
            BitDepth::B32 => "f32",
            BitDepth::B64 => "f64",
        }
    }

    /// Float array type name for generated code.
    pub fn float_array_type(self) -> &'static str {
        match self {
            BitDepth::B32 => "Float32Array",
            BitDepth::B64 => "Float64Array",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioSettings {
    pub channel_count: ChannelCount,
    pub bit_depth: BitDepth,
}

impl Default for AudioSettings {
    fn default() -> Self {
        AudioSettings {
            channel_count: ChannelCount {
                input: 2,
                output: 2,
            },
            bit_depth: BitDepth::B64,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompilationSettings {
    pub audio: AudioSettings,
    pub arrays: IndexMap<String, Vec<f64>>,
    pub inlet_caller_specs: PortletSpecs,
    pub outlet_listener_specs: PortletSpecs,
    pub debug: bool,
}

/// Fill defaults and reject malformed values.
pub fn validate_settings(user: UserSettings) -> Result<CompilationSettings, CompileError> {
    let audio = match user.audio {
        None => AudioSettings::default(),
        Some(audio) => {
            let defaults = AudioSettings::default();
            AudioSettings {
                channel_count: audio.channel_count.unwrap_or(defaults.channel_count),
                bit_depth: match audio.bit_depth {
                    Some(bits) => BitDepth::from_bits(bits)?,
                    None => defaults.bit_depth,
                },
            }
        }
    };

    let arrays = user.arrays.unwrap_or_default();
    for name in arrays.keys() {
        assert_valid_name_part(name).map_err(|_| {
            CompileError::InvalidSettings(format!("invalid array name \"{}\"", name))
        })?;
    }

    Ok(CompilationSettings {
        audio,
        arrays,
        inlet_caller_specs: user.inlet_caller_specs.unwrap_or_default(),
        outlet_listener_specs: user.outlet_listener_specs.unwrap_or_default(),
        debug: user.debug.unwrap_or(false),
    })
}

/// Check that every inlet-caller / outlet-listener spec names an existing
/// message portlet of an existing node.
pub fn validate_io_specs(settings: &CompilationSettings, graph: &Graph) -> Result<(), CompileError> {
    for (node_id, inlet_ids) in &settings.inlet_caller_specs {
        let node = spec_node(graph, node_id, "inletCallerSpecs")?;
        for inlet_id in inlet_ids {
            let kind = node.inlets.get(inlet_id).map(|p| p.kind);
            check_spec_portlet(kind, node_id, inlet_id, "inletCallerSpecs", "inlet")?;
        }
    }
    for (node_id, outlet_ids) in &settings.outlet_listener_specs {
        let node = spec_node(graph, node_id, "outletListenerSpecs")?;
        for outlet_id in outlet_ids {
            let kind = node.outlets.get(outlet_id).map(|p| p.kind);
            check_spec_portlet(kind, node_id, outlet_id, "outletListenerSpecs", "outlet")?;
        }
    }
    Ok(())
}

fn spec_node<'g>(
    graph: &'g Graph,
    node_id: &str,
    field: &str,
) -> Result<&'g crate::graph::Node, CompileError> {
    graph.get(node_id).ok_or_else(|| {
        CompileError::InvalidSettings(format!("{}: unknown node \"{}\"", field, node_id))
    })
}

fn check_spec_portlet(
    kind: Option<PortletKind>,
    node_id: &str,
    portlet_id: &str,
    field: &str,
    what: &str,
) -> Result<(), CompileError> {
    match kind {
        Some(PortletKind::Message) => Ok(()),
        Some(PortletKind::Signal) => Err(CompileError::InvalidSettings(format!(
            "{}: {} \"{}\" of node \"{}\" is a signal {}",
            field, what, portlet_id, node_id, what
        ))),
        None => Err(CompileError::InvalidSettings(format!(
            "{}: node \"{}\" has no {} \"{}\"",
            field, node_id, what, portlet_id
        ))),
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
