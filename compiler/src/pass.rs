// pass.rs — Pass descriptor module: metadata, dependency resolution, artifact IDs
//
// Declares the compiler's passes (graph / registry loading is outside the
// runner), their dependency edges, and the artifacts they produce. Used by
// the pipeline runner to compute minimal pass subsets for each --emit target.

use std::collections::HashSet;

// ── Pass and Artifact identifiers ──────────────────────────────────────────

/// Identifies each compiler pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassId {
    ValidateSettings,
    BuildTraversal,
    AllocateNames,
    ResolvePortlets,
    CollectDependencies,
    PartitionDsp,
    SynthesizeMessages,
    GenerateNodeCode,
    Assemble,
}

/// Machine-readable artifact identifiers. Each maps to a field of the
/// compilation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactId {
    Settings,     // CompilationSettings
    Traversal,    // Vec<String>
    TrimmedGraph, // Graph
    Names,        // VariableNamesIndex
    Precompiled,  // PrecompiledCode
    Cert,         // PrecompileCert
    Program,      // Sequence
}

// ── Pass descriptor ────────────────────────────────────────────────────────

/// Static metadata about a compiler pass.
pub struct PassDescriptor {
    /// Human-readable name for diagnostics/verbose output.
    pub name: &'static str,
    /// Pass dependencies (other passes whose outputs this pass consumes).
    pub inputs: &'static [PassId],
    /// Artifacts this pass produces or updates.
    pub outputs: &'static [ArtifactId],
}

/// Return the static descriptor for a given pass.
pub fn descriptor(id: PassId) -> PassDescriptor {
    match id {
        PassId::ValidateSettings => PassDescriptor {
            name: "validate_settings",
            inputs: &[],
            outputs: &[ArtifactId::Settings],
        },
        PassId::BuildTraversal => PassDescriptor {
            name: "build_traversal",
            inputs: &[PassId::ValidateSettings],
            outputs: &[ArtifactId::Traversal, ArtifactId::TrimmedGraph],
        },
        PassId::AllocateNames => PassDescriptor {
            name: "allocate_names",
            inputs: &[PassId::BuildTraversal],
            outputs: &[ArtifactId::Names],
        },
        PassId::ResolvePortlets => PassDescriptor {
            name: "resolve_portlets",
            inputs: &[PassId::AllocateNames],
            outputs: &[ArtifactId::Precompiled, ArtifactId::Names],
        },
        PassId::CollectDependencies => PassDescriptor {
            name: "collect_dependencies",
            inputs: &[PassId::ResolvePortlets],
            outputs: &[ArtifactId::Precompiled, ArtifactId::Names],
        },
        PassId::PartitionDsp => PassDescriptor {
            name: "partition_dsp",
            inputs: &[PassId::CollectDependencies],
            outputs: &[ArtifactId::Precompiled, ArtifactId::Names],
        },
        PassId::SynthesizeMessages => PassDescriptor {
            name: "synthesize_messages",
            inputs: &[PassId::PartitionDsp],
            outputs: &[ArtifactId::Precompiled, ArtifactId::Names],
        },
        PassId::GenerateNodeCode => PassDescriptor {
            name: "generate_node_code",
            inputs: &[PassId::SynthesizeMessages],
            outputs: &[ArtifactId::Precompiled, ArtifactId::Cert],
        },
        PassId::Assemble => PassDescriptor {
            name: "assemble",
            inputs: &[PassId::GenerateNodeCode],
            outputs: &[ArtifactId::Program],
        },
    }
}

// ── Stage certificates ─────────────────────────────────────────────────────

/// Evidence that a stage's postconditions hold.
pub trait StageCert {
    fn all_pass(&self) -> bool;
    fn obligations(&self) -> Vec<(&'static str, bool)>;
}

// ── Dependency resolution ──────────────────────────────────────────────────

/// All pass IDs in declaration order (used for iteration).
pub const ALL_PASSES: [PassId; 9] = [
    PassId::ValidateSettings,
    PassId::BuildTraversal,
    PassId::AllocateNames,
    PassId::ResolvePortlets,
    PassId::CollectDependencies,
    PassId::PartitionDsp,
    PassId::SynthesizeMessages,
    PassId::GenerateNodeCode,
    PassId::Assemble,
];

/// Compute the minimal ordered set of passes needed to produce `terminal`.
/// Returns passes in topological (execution) order.
pub fn required_passes(terminal: PassId) -> Vec<PassId> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    visit(terminal, &mut visited, &mut order);
    order
}

fn visit(id: PassId, visited: &mut HashSet<PassId>, order: &mut Vec<PassId>) {
    if !visited.insert(id) {
        return;
    }
    for &dep in descriptor(id).inputs {
        visit(dep, visited, order);
    }
    order.push(id);
}

// ── Tests ──────────────────────────────────────────────────────────────────
