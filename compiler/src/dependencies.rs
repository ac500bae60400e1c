// dependencies.rs — Global definitions and their collection (Pass B)
//
// A `GlobalDefinitions` is a unit of shared code declared in a namespace
// (`<tag>_<local>` symbols), optionally depending on other definitions and
// declaring host imports / exports. Collection flattens the dependency DAG
// depth-first (dependencies before dependents), keeps each definition once at
// its first position, renders the code, and gathers imports and exports.
//
// Preconditions: definition graphs are acyclic (shared `Rc`s cannot form a
//                cycle; the template loader rejects named cycles).
// Postconditions: each definition is rendered at most once; identical
//                 rendered fragments are emitted once.
// Failure modes: invalid local names → `InvalidName`; generator errors
//                propagate unchanged.
// Side effects: allocates `<tag>_<local>` symbols in the names index.
//
// `collect_node_dependencies` is the precompiler entry point: it tags every
// node type in the traversal, gathers their dependencies behind the stdlib,
// then renders each type's shared `core` code.

use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;

use tracing::debug_span;

use crate::ast::{Func, Sequence, Var};
use crate::diag::CompileError;
use crate::id::DefId;
use crate::names::{Globs, VariableNamesIndex};
use crate::precompile::{NodeStage, PrecompileInput, PrecompiledCode, TypeCode};
use crate::registry::{NodeImplementation, TypeContext};
use crate::settings::CompilationSettings;

// ── Definitions ─────────────────────────────────────────────────────────────

pub type DefinitionCode = Box<dyn Fn(&GlobalContext<'_>) -> Result<Sequence, CompileError>>;

/// A host function the generated program imports, declared by local name.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportSpec {
    pub local: String,
    pub args: Vec<Var>,
    pub return_type: String,
}

pub struct GlobalDefinitions {
    id: DefId,
    pub namespace: String,
    /// Local names allocated as `<namespace>_<local>` before rendering.
    pub locals: Vec<String>,
    pub dependencies: Vec<Rc<GlobalDefinitions>>,
    pub imports: Vec<ImportSpec>,
    /// Local names exported to the host.
    pub exports: Vec<String>,
    code: DefinitionCode,
}

impl fmt::Debug for GlobalDefinitions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalDefinitions")
            .field("id", &self.id)
            .field("namespace", &self.namespace)
            .field("locals", &self.locals)
            .field("dependencies", &self.dependencies.len())
            .finish()
    }
}

impl GlobalDefinitions {
    pub fn new(
        namespace: impl Into<String>,
        code: impl Fn(&GlobalContext<'_>) -> Result<Sequence, CompileError> + 'static,
    ) -> Self {
        GlobalDefinitions {
            id: DefId::fresh(),
            namespace: namespace.into(),
            locals: Vec::new(),
            dependencies: Vec::new(),
            imports: Vec::new(),
            exports: Vec::new(),
            code: Box::new(code),
        }
    }

    pub fn id(&self) -> DefId {
        self.id
    }

    pub fn with_locals(mut self, locals: &[&str]) -> Self {
        self.locals.extend(locals.iter().map(|s| s.to_string()));
        self
    }

    pub fn with_dependency(mut self, dependency: Rc<GlobalDefinitions>) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn with_import(mut self, local: &str, args: Vec<Var>, return_type: &str) -> Self {
        self.imports.push(ImportSpec {
            local: local.to_string(),
            args,
            return_type: return_type.to_string(),
        });
        self
    }

    pub fn with_export(mut self, local: &str) -> Self {
        self.exports.push(local.to_string());
        self
    }

    pub fn shared(self) -> Rc<GlobalDefinitions> {
        Rc::new(self)
    }

    fn all_locals(&self) -> impl Iterator<Item = &str> {
        self.locals
            .iter()
            .map(String::as_str)
            .chain(self.imports.iter().map(|i| i.local.as_str()))
            .chain(self.exports.iter().map(String::as_str))
    }
}

/// What a definition's code generator can see.
pub struct GlobalContext<'a> {
    pub names: &'a VariableNamesIndex,
    pub settings: &'a CompilationSettings,
    pub namespace: &'a str,
}

impl<'a> GlobalContext<'a> {
    /// Symbol of `local` in this definition's own namespace.
    pub fn ns(&self, local: &str) -> Result<&'a str, CompileError> {
        self.names.global(self.namespace, local)
    }

    pub fn global(&self, tag: &str, local: &str) -> Result<&'a str, CompileError> {
        self.names.global(tag, local)
    }

    pub fn globs(&self) -> &'a Globs {
        &self.names.globs
    }
}

// ── Collection ──────────────────────────────────────────────────────────────

/// Output of Pass B: rendered shared code plus host imports and exports.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectedDependencies {
    pub ast: Sequence,
    pub imports: Vec<Func>,
    pub exports: Vec<String>,
}

/// Depth-first flattening, dependencies before dependents, each definition
/// kept at its first position. Walks with an explicit stack so long
/// dependency chains do not grow the call stack.
pub fn flatten_dependencies(roots: &[Rc<GlobalDefinitions>]) -> Vec<Rc<GlobalDefinitions>> {
    let mut seen: HashSet<DefId> = HashSet::new();
    let mut order = Vec::new();
    for root in roots {
        if seen.contains(&root.id) {
            continue;
        }
        // (definition, next dependency to visit)
        let mut stack: Vec<(&Rc<GlobalDefinitions>, usize)> = vec![(root, 0)];
        while let Some(frame) = stack.last_mut() {
            let (def, next) = *frame;
            frame.1 += 1;
            match def.dependencies.get(next) {
                Some(dep) => {
                    if !seen.contains(&dep.id) {
                        stack.push((dep, 0));
                    }
                }
                None => {
                    stack.pop();
                    if seen.insert(def.id) {
                        order.push(Rc::clone(def));
                    }
                }
            }
        }
    }
    order
}

/// Allocate symbols, render every definition once, and gather imports
/// (deduplicated by name) and exports (deduplicated by symbol).
pub fn collect_dependencies(
    roots: &[Rc<GlobalDefinitions>],
    names: &mut VariableNamesIndex,
    settings: &CompilationSettings,
) -> Result<CollectedDependencies, CompileError> {
    let flat = flatten_dependencies(roots);

    for def in &flat {
        for local in def.all_locals() {
            names.attach_global(&def.namespace, local)?;
        }
    }

    let mut collected = CollectedDependencies::default();
    let mut rendered_fragments: HashSet<String> = HashSet::new();
    let mut import_names: HashSet<String> = HashSet::new();
    let mut export_names: HashSet<String> = HashSet::new();

    for def in &flat {
        let ctx = GlobalContext {
            names,
            settings,
            namespace: &def.namespace,
        };
        let code = (def.code)(&ctx)?;
        if !code.is_empty() && rendered_fragments.insert(code.to_string()) {
            collected.ast.extend(code);
        }

        for import in &def.imports {
            let symbol = ctx.ns(&import.local)?.to_string();
            if import_names.insert(symbol.clone()) {
                collected.imports.push(Func {
                    name: Some(symbol),
                    args: import.args.clone(),
                    return_type: import.return_type.clone(),
                    body: Sequence::new(),
                });
            }
        }
        for export in &def.exports {
            let symbol = ctx.ns(export)?.to_string();
            if export_names.insert(symbol.clone()) {
                collected.exports.push(symbol);
            }
        }
    }

    tracing::debug!(
        definitions = flat.len(),
        imports = collected.imports.len(),
        exports = collected.exports.len(),
        "collected dependencies"
    );
    Ok(collected)
}

// ── Node dependencies ───────────────────────────────────────────────────────

/// Tag node types, collect the stdlib plus every type's dependencies, and
/// render per-type core code.
pub fn collect_node_dependencies(
    input: PrecompileInput<'_>,
    names: &mut VariableNamesIndex,
    code: &mut PrecompiledCode,
) -> Result<(), CompileError> {
    let _span = debug_span!("collect_node_dependencies").entered();
    code.expect_stage(NodeStage::PortletsResolved)?;

    let mut types: Vec<(String, &dyn NodeImplementation)> = Vec::new();
    for id in code.nodes.keys() {
        let node = input.graph.node(id)?;
        let imp = input.registry.implementation_for(node)?;
        if !types.iter().any(|(t, _)| t == &node.node_type) {
            types.push((node.node_type.clone(), imp));
        }
    }

    let mut roots = input.registry.stdlib().minimal_dependencies();
    for (node_type, imp) in &types {
        let tag = names.attach_type_tag(node_type);
        for local in imp.namespace() {
            names.attach_global(&tag, &local)?;
        }
        roots.extend(imp.dependencies());
    }
    code.dependencies = collect_dependencies(&roots, names, input.settings)?;

    for (node_type, imp) in &types {
        let ctx = TypeContext {
            node_type,
            names,
            settings: input.settings,
        };
        let core = imp.core(&ctx)?;
        code.node_types.insert(
            node_type.clone(),
            TypeCode {
                state_class: None,
                core,
            },
        );
    }

    code.advance_stage(NodeStage::DependenciesCollected);
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;
    use crate::names::generate_variable_names_index;

    fn def(tag: &str, code: &'static str) -> GlobalDefinitions {
        GlobalDefinitions::new(tag, move |_| Ok(Sequence::code(code)))
    }

    fn names() -> VariableNamesIndex {
        generate_variable_names_index(&Graph::new(), false).unwrap()
    }

    #[test]
    fn flatten_puts_dependencies_first_and_dedupes() {
        let shared = def("shared", "// shared").shared();
        let a = def("a", "// a").with_dependency(Rc::clone(&shared)).shared();
        let b = def("b", "// b")
            .with_dependency(Rc::clone(&shared))
            .with_dependency(Rc::clone(&a))
            .shared();
        let flat = flatten_dependencies(&[Rc::clone(&b), Rc::clone(&a)]);
        let tags: Vec<&str> = flat.iter().map(|d| d.namespace.as_str()).collect();
        assert_eq!(tags, vec!["shared", "a", "b"]);
    }

    #[test]
    fn flatten_handles_long_dependency_chains() {
        let n = 10_000;
        let mut chain: Vec<Rc<GlobalDefinitions>> = Vec::with_capacity(n);
        for _ in 0..n {
            let mut link = def("link", "// link");
            if let Some(previous) = chain.last() {
                link = link.with_dependency(Rc::clone(previous));
            }
            chain.push(link.shared());
        }

        let flat = flatten_dependencies(&chain[n - 1..]);
        assert_eq!(flat.len(), n);
        assert_eq!(flat[0].id(), chain[0].id());
        assert_eq!(flat[n - 1].id(), chain[n - 1].id());

        // Release from the dependent end so every drop stays shallow.
        drop(flat);
        while chain.pop().is_some() {}
    }

    #[test]
    fn shared_code_is_emitted_once() {
        let shared = def("shared", "// shared").shared();
        let a = def("a", "// a").with_dependency(Rc::clone(&shared)).shared();
        let b = def("b", "// b").with_dependency(Rc::clone(&shared)).shared();
        let mut names = names();
        let collected =
            collect_dependencies(&[a, b], &mut names, &CompilationSettings::default()).unwrap();
        assert_eq!(collected.ast, Sequence::code("// shared\n// a\n// b"));
    }

    #[test]
    fn identical_code_from_distinct_definitions_is_emitted_once() {
        let a = def("a", "// same").shared();
        let b = def("b", "// same").shared();
        let mut names = names();
        let collected =
            collect_dependencies(&[a, b], &mut names, &CompilationSettings::default()).unwrap();
        assert_eq!(collected.ast, Sequence::code("// same"));
    }

    #[test]
    fn namespace_symbols_are_allocated_before_rendering() {
        let helper = GlobalDefinitions::new("helper", |ctx| {
            Ok(Sequence::code(format!("func {}() {{}}", ctx.ns("compute")?)))
        })
        .with_locals(&["compute"])
        .with_import("log", vec![Var::new("String", "text")], "void")
        .with_export("compute")
        .shared();
        let other = GlobalDefinitions::new("other", |_| Ok(Sequence::new()))
            .with_import("log", vec![], "void")
            .with_dependency(Rc::clone(&helper))
            .shared();
        let mut names = names();
        let collected =
            collect_dependencies(&[helper, other], &mut names, &CompilationSettings::default())
                .unwrap();
        assert_eq!(collected.ast, Sequence::code("func helper_compute() {}"));
        let imports: Vec<&str> = collected
            .imports
            .iter()
            .filter_map(|f| f.name.as_deref())
            .collect();
        assert_eq!(imports, vec!["helper_log", "other_log"]);
        assert_eq!(collected.exports, vec!["helper_compute".to_string()]);
    }

    #[test]
    fn node_types_are_tagged_and_core_rendered_once() {
        use crate::flow::resolve_portlets;
        use crate::graph::Node;
        use crate::precompile::initialize_precompilation;
        use crate::registry::NodeRegistry;

        struct Osc;
        impl NodeImplementation for Osc {
            fn namespace(&self) -> Vec<String> {
                vec!["phase".into()]
            }
            fn core(&self, ctx: &TypeContext<'_>) -> Result<Option<Sequence>, CompileError> {
                Ok(Some(Sequence::code(format!("// uses {}", ctx.ns("phase")?))))
            }
        }

        let mut registry = NodeRegistry::new();
        registry.register("osc~", Osc);
        let graph = Graph::new()
            .with_node(Node::new("a", "osc~"))
            .with_node(Node::new("b", "osc~"));
        let settings = CompilationSettings::default();
        let input = PrecompileInput {
            graph: &graph,
            registry: &registry,
            settings: &settings,
        };
        let mut names = generate_variable_names_index(&graph, false).unwrap();
        let ids = vec!["a".to_string(), "b".to_string()];
        let mut code = initialize_precompilation(&graph, &ids).unwrap();
        resolve_portlets(input, &mut names, &mut code).unwrap();
        collect_node_dependencies(input, &mut names, &mut code).unwrap();

        assert_eq!(names.type_tag("osc~").unwrap(), "n_osc");
        assert_eq!(code.node_types.len(), 1);
        assert_eq!(
            code.node_types["osc~"].core,
            Some(Sequence::code("// uses n_osc_phase"))
        );
        assert!(code.dependencies.ast.to_string().contains("msg_FLOAT_TOKEN"));
        assert_eq!(code.node("b").unwrap().stage, NodeStage::DependenciesCollected);
    }

    #[test]
    fn undeclared_local_is_namespace_error() {
        let bad = GlobalDefinitions::new("bad", |ctx| Ok(Sequence::code(ctx.ns("missing")?)))
            .shared();
        let mut names = names();
        let err = collect_dependencies(&[bad], &mut names, &CompilationSettings::default())
            .unwrap_err();
        assert!(matches!(err, CompileError::Namespace { .. }));
    }
}
