// diag.rs — Unified compiler error model
//
// Provides the error type shared by every compiler stage, together with the
// stable diagnostic codes used when rendering failures to users.
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use std::fmt;

use thiserror::Error;

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A stable diagnostic code (e.g., `E0100`).
///
/// Once assigned, a code must never be reassigned to a different meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub mod codes {
    use super::DiagCode;

    /// Dangling connection or portlet reference.
    pub const E0100: DiagCode = DiagCode("E0100");
    /// Compilation settings rejected.
    pub const E0200: DiagCode = DiagCode("E0200");
    /// Identifier fragment with illegal characters.
    pub const E0300: DiagCode = DiagCode("E0300");
    /// Read of an unallocated variable-name slot.
    pub const E0400: DiagCode = DiagCode("E0400");
    /// Node type absent from the registry.
    pub const E0500: DiagCode = DiagCode("E0500");
    /// Reachable message inlet without a receiver implementation.
    pub const E0501: DiagCode = DiagCode("E0501");
    /// Malformed code template or registry file.
    pub const E0600: DiagCode = DiagCode("E0600");
    /// Pass observed a node in an unexpected precompilation stage.
    pub const E0700: DiagCode = DiagCode("E0700");
    /// Precompiled artifact failed its postcondition checks.
    pub const E0701: DiagCode = DiagCode("E0701");
}

// ── Compile error ────────────────────────────────────────────────────────

/// Any failure of a compilation run. All errors are fatal: there is no
/// partial output.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("{message}{}", location(None, .node_id.as_deref(), .portlet_id.as_deref()))]
    GraphIntegrity {
        node_id: Option<String>,
        portlet_id: Option<String>,
        message: String,
    },

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("invalid variable name for code generation \"{0}\"")]
    InvalidName(String),

    #[error("namespace \"{namespace}\" has no key \"{key}\"")]
    Namespace { namespace: String, key: String },

    #[error("{message}{}", location(Some(.node_type.as_str()), .node_id.as_deref(), .portlet_id.as_deref()))]
    MissingImplementation {
        node_type: String,
        node_id: Option<String>,
        portlet_id: Option<String>,
        message: String,
    },

    #[error("template error in {origin}: {message}")]
    Template { origin: String, message: String },

    #[error("node \"{node_id}\" is {found}, pass expected {expected}")]
    PassOrder {
        node_id: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("precompile verification failed: {0}")]
    Verification(String),
}

impl CompileError {
    pub fn graph(message: impl Into<String>) -> Self {
        CompileError::GraphIntegrity {
            node_id: None,
            portlet_id: None,
            message: message.into(),
        }
    }

    pub fn graph_at(
        node_id: impl Into<String>,
        portlet_id: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        CompileError::GraphIntegrity {
            node_id: Some(node_id.into()),
            portlet_id: portlet_id.map(str::to_string),
            message: message.into(),
        }
    }

    pub fn namespace(namespace: impl Into<String>, key: impl Into<String>) -> Self {
        CompileError::Namespace {
            namespace: namespace.into(),
            key: key.into(),
        }
    }

    pub fn template(origin: impl Into<String>, message: impl Into<String>) -> Self {
        CompileError::Template {
            origin: origin.into(),
            message: message.into(),
        }
    }

    /// Stable diagnostic code for this error.
    pub fn code(&self) -> DiagCode {
        match self {
            CompileError::GraphIntegrity { .. } => codes::E0100,
            CompileError::InvalidSettings(_) => codes::E0200,
            CompileError::InvalidName(_) => codes::E0300,
            CompileError::Namespace { .. } => codes::E0400,
            CompileError::MissingImplementation { portlet_id, .. } => {
                if portlet_id.is_some() {
                    codes::E0501
                } else {
                    codes::E0500
                }
            }
            CompileError::Template { .. } => codes::E0600,
            CompileError::PassOrder { .. } => codes::E0700,
            CompileError::Verification(_) => codes::E0701,
        }
    }

    /// Render as `error[E0xxx]: message`, the form printed by the CLI.
    pub fn render(&self) -> String {
        format!("error[{}]: {}", self.code(), self)
    }
}

fn location(node_type: Option<&str>, node_id: Option<&str>, portlet_id: Option<&str>) -> String {
    let mut parts = Vec::new();
    if let Some(node_type) = node_type {
        parts.push(format!("type [{}]", node_type));
    }
    if let Some(node_id) = node_id {
        parts.push(format!("node \"{}\"", node_id));
    }
    if let Some(portlet_id) = portlet_id {
        parts.push(format!("portlet \"{}\"", portlet_id));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}
