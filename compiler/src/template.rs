// template.rs — Data-driven node implementations
//
// Loads a registry file (JSON) whose node implementations and shared global
// definitions are written as code templates with `${namespace.key}`
// placeholders. Templates are tokenized with `logos` when the file is
// loaded, so malformed placeholders are reported before compilation.
//
// Preconditions: input is valid UTF-8 JSON.
// Postconditions: every template is parsed; named global references are
//                 resolved to shared `Rc`s; reference cycles are rejected.
// Failure modes: malformed JSON, unterminated placeholder, unknown or cyclic
//                global reference → `CompileError::Template`.
// Side effects: none.

use std::collections::HashMap;
use std::rc::Rc;

use indexmap::IndexMap;
use logos::Logos;
use serde::Deserialize;

use crate::ast::{Sequence, Var};
use crate::dependencies::{GlobalContext, GlobalDefinitions};
use crate::diag::CompileError;
use crate::names::{Globs, VariableNamesIndex};
use crate::registry::{
    MessageReceiver, NodeContext, NodeFlags, NodeImplementation, NodeRegistry, StateMember,
    TypeContext,
};

// ── Lexer ───────────────────────────────────────────────────────────────────

#[derive(Logos, Debug, Clone, PartialEq)]
enum TemplateToken {
    #[regex(r"\$\{[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z0-9_]+)?\}")]
    Placeholder,
    #[token("${")]
    Unterminated,
    #[token("$$")]
    EscapedDollar,
    #[token("$")]
    Dollar,
    #[regex(r"[^$]+")]
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Piece {
    Text(String),
    Ref {
        namespace: String,
        key: Option<String>,
    },
}

/// A parsed code template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pieces: Vec<Piece>,
}

impl Template {
    pub fn parse(origin: &str, source: &str) -> Result<Template, CompileError> {
        let mut pieces = Vec::new();
        let mut text = String::new();
        for (result, range) in TemplateToken::lexer(source).spanned() {
            let slice = &source[range.clone()];
            match result {
                Ok(TemplateToken::Text) | Ok(TemplateToken::Dollar) => text.push_str(slice),
                Ok(TemplateToken::EscapedDollar) => text.push('$'),
                Ok(TemplateToken::Placeholder) => {
                    if !text.is_empty() {
                        pieces.push(Piece::Text(std::mem::take(&mut text)));
                    }
                    let inner = &slice[2..slice.len() - 1];
                    let (namespace, key) = match inner.split_once('.') {
                        Some((ns, key)) => (ns.to_string(), Some(key.to_string())),
                        None => (inner.to_string(), None),
                    };
                    pieces.push(Piece::Ref { namespace, key });
                }
                Ok(TemplateToken::Unterminated) | Err(()) => {
                    return Err(CompileError::template(
                        origin,
                        format!("malformed placeholder at byte {}", range.start),
                    ));
                }
            }
        }
        if !text.is_empty() {
            pieces.push(Piece::Text(text));
        }
        Ok(Template { pieces })
    }

    pub fn render(&self, scope: &dyn TemplateScope) -> Result<String, CompileError> {
        let mut out = String::new();
        for piece in &self.pieces {
            match piece {
                Piece::Text(text) => out.push_str(text),
                Piece::Ref { namespace, key } => {
                    out.push_str(&scope.lookup(namespace, key.as_deref())?)
                }
            }
        }
        Ok(out)
    }

    pub fn render_sequence(&self, scope: &dyn TemplateScope) -> Result<Sequence, CompileError> {
        Ok(Sequence::code(self.render(scope)?))
    }
}

// ── Scopes ──────────────────────────────────────────────────────────────────

/// Resolves `${namespace.key}` placeholders.
pub trait TemplateScope {
    fn lookup(&self, namespace: &str, key: Option<&str>) -> Result<String, CompileError>;
}

fn need_key<'k>(namespace: &str, key: Option<&'k str>) -> Result<&'k str, CompileError> {
    key.ok_or_else(|| {
        CompileError::template(
            format!("${{{}}}", namespace),
            "placeholder needs a key",
        )
    })
}

/// `globs.*`, `ns.*` and `<tag>.*`, shared by every scope.
fn lookup_common(
    names: &VariableNamesIndex,
    globs: &Globs,
    own_tag: Option<&str>,
    namespace: &str,
    key: Option<&str>,
) -> Result<String, CompileError> {
    let key = need_key(namespace, key)?;
    match namespace {
        "globs" => Ok(globs.get(key)?.to_string()),
        "ns" => {
            let tag = own_tag.ok_or_else(|| CompileError::namespace("ns", key))?;
            Ok(names.global(tag, key)?.to_string())
        }
        tag => Ok(names.global(tag, key)?.to_string()),
    }
}

impl TemplateScope for NodeContext<'_> {
    fn lookup(&self, namespace: &str, key: Option<&str>) -> Result<String, CompileError> {
        match namespace {
            "state" if key.is_none() => Ok(self.state()?.to_string()),
            "ins" => Ok(self.ins(need_key(namespace, key)?)?.to_string()),
            "outs" => Ok(self.outs(need_key(namespace, key)?)?.to_string()),
            "snds" => Ok(self.snds(need_key(namespace, key)?)?.to_string()),
            "rcvs" => Ok(self.rcvs(need_key(namespace, key)?)?.to_string()),
            "args" => {
                let key = need_key(namespace, key)?;
                let value = self.arg(key).ok_or_else(|| {
                    CompileError::namespace(format!("n_{}_args", self.node.id), key)
                })?;
                Ok(render_arg(value))
            }
            _ => {
                let tag = self.names.type_tag(&self.node.node_type).ok();
                lookup_common(self.names, self.globs(), tag, namespace, key)
            }
        }
    }
}

impl TemplateScope for TypeContext<'_> {
    fn lookup(&self, namespace: &str, key: Option<&str>) -> Result<String, CompileError> {
        let tag = self.names.type_tag(self.node_type).ok();
        lookup_common(self.names, self.globs(), tag, namespace, key)
    }
}

impl TemplateScope for GlobalContext<'_> {
    fn lookup(&self, namespace: &str, key: Option<&str>) -> Result<String, CompileError> {
        lookup_common(self.names, self.globs(), Some(self.namespace), namespace, key)
    }
}

fn render_arg(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ── Registry file ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RegistryFile {
    #[serde(default)]
    globals: IndexMap<String, GlobalSpec>,
    #[serde(default)]
    nodes: IndexMap<String, NodeSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct GlobalSpec {
    namespace: String,
    #[serde(default)]
    locals: Vec<String>,
    #[serde(default)]
    code: String,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    imports: Vec<ImportJson>,
    #[serde(default)]
    exports: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ImportJson {
    name: String,
    #[serde(default)]
    args: Vec<ArgJson>,
    #[serde(default = "void_type")]
    return_type: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ArgJson {
    name: String,
    #[serde(rename = "type")]
    typ: String,
}

fn void_type() -> String {
    "void".into()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct NodeSpec {
    #[serde(default)]
    flags: NodeFlags,
    #[serde(default)]
    namespace: Vec<String>,
    #[serde(default)]
    state: Vec<StateJson>,
    core: Option<String>,
    declarations: Option<String>,
    #[serde(rename = "loop")]
    loop_code: Option<String>,
    #[serde(default)]
    inlet_dsp: IndexMap<String, String>,
    #[serde(default)]
    message_receivers: IndexMap<String, ReceiverJson>,
    #[serde(default)]
    dependencies: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StateJson {
    name: String,
    #[serde(rename = "type")]
    typ: String,
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ReceiverJson {
    Body(String),
    Full {
        body: String,
        #[serde(default)]
        exhaustive: bool,
    },
}

// ── Template node ───────────────────────────────────────────────────────────

/// A node implementation backed by templates.
#[derive(Debug)]
pub struct TemplateNode {
    flags: NodeFlags,
    namespace: Vec<String>,
    state: Vec<(String, String, Template)>,
    core: Option<Template>,
    declarations: Option<Template>,
    loop_code: Option<Template>,
    inlet_dsp: IndexMap<String, Template>,
    message_receivers: IndexMap<String, (Template, bool)>,
    dependencies: Vec<Rc<GlobalDefinitions>>,
}

impl NodeImplementation for TemplateNode {
    fn flags(&self) -> NodeFlags {
        self.flags
    }

    fn namespace(&self) -> Vec<String> {
        self.namespace.clone()
    }

    fn core(&self, ctx: &TypeContext<'_>) -> Result<Option<Sequence>, CompileError> {
        self.core.as_ref().map(|t| t.render_sequence(ctx)).transpose()
    }

    fn state(&self, ctx: &NodeContext<'_>) -> Result<Vec<StateMember>, CompileError> {
        self.state
            .iter()
            .map(|(name, typ, value)| {
                Ok(StateMember {
                    name: name.clone(),
                    typ: typ.clone(),
                    value: value.render(ctx)?,
                })
            })
            .collect()
    }

    fn declarations(&self, ctx: &NodeContext<'_>) -> Result<Option<Sequence>, CompileError> {
        self.declarations
            .as_ref()
            .map(|t| t.render_sequence(ctx))
            .transpose()
    }

    fn loop_code(&self, ctx: &NodeContext<'_>) -> Result<Option<Sequence>, CompileError> {
        self.loop_code
            .as_ref()
            .map(|t| t.render_sequence(ctx))
            .transpose()
    }

    fn inlet_dsp(
        &self,
        ctx: &NodeContext<'_>,
    ) -> Result<IndexMap<String, Sequence>, CompileError> {
        self.inlet_dsp
            .iter()
            .map(|(inlet, t)| Ok((inlet.clone(), t.render_sequence(ctx)?)))
            .collect()
    }

    fn message_receivers(
        &self,
        ctx: &NodeContext<'_>,
    ) -> Result<IndexMap<String, MessageReceiver>, CompileError> {
        self.message_receivers
            .iter()
            .map(|(inlet, (t, exhaustive))| {
                let receiver = MessageReceiver {
                    body: t.render_sequence(ctx)?,
                    exhaustive: *exhaustive,
                };
                Ok((inlet.clone(), receiver))
            })
            .collect()
    }

    fn dependencies(&self) -> Vec<Rc<GlobalDefinitions>> {
        self.dependencies.clone()
    }
}

// ── Loading ─────────────────────────────────────────────────────────────────

/// Parse a registry file into a `NodeRegistry`.
pub fn load_registry(text: &str) -> Result<NodeRegistry, CompileError> {
    let file: RegistryFile = serde_json::from_str(text)
        .map_err(|e| CompileError::template("registry", format!("invalid JSON: {}", e)))?;
    let mut registry = NodeRegistry::new();

    let mut resolver = GlobalResolver {
        specs: &file.globals,
        resolved: HashMap::new(),
        stack: Vec::new(),
    };
    for tag in ["core", "msg", "commons"] {
        if file.globals.contains_key(tag) {
            return Err(CompileError::template(
                format!("globals.{}", tag),
                "name is reserved for a built-in helper namespace",
            ));
        }
        if let Some(def) = registry.stdlib().by_tag(tag) {
            resolver.resolved.insert(tag.to_string(), Rc::clone(def));
        }
    }
    for name in file.globals.keys() {
        resolver.resolve(name)?;
    }

    for (node_type, spec) in &file.nodes {
        let node = build_template_node(node_type, spec, &mut resolver)?;
        registry.register(node_type.clone(), node);
    }
    tracing::debug!(
        node_types = registry.len(),
        globals = file.globals.len(),
        "loaded template registry"
    );
    Ok(registry)
}

struct GlobalResolver<'f> {
    specs: &'f IndexMap<String, GlobalSpec>,
    resolved: HashMap<String, Rc<GlobalDefinitions>>,
    stack: Vec<String>,
}

impl GlobalResolver<'_> {
    fn resolve(&mut self, name: &str) -> Result<Rc<GlobalDefinitions>, CompileError> {
        if let Some(def) = self.resolved.get(name) {
            return Ok(Rc::clone(def));
        }
        if self.stack.iter().any(|n| n == name) {
            let mut cycle = self.stack.clone();
            cycle.push(name.to_string());
            return Err(CompileError::template(
                format!("globals.{}", name),
                format!("dependency cycle: {}", cycle.join(" -> ")),
            ));
        }
        let spec = self.specs.get(name).ok_or_else(|| {
            CompileError::template(
                format!("globals.{}", name),
                "unknown global definition",
            )
        })?;

        self.stack.push(name.to_string());
        let origin = format!("globals.{}", name);
        let template = Template::parse(&origin, &spec.code)?;
        let mut def = GlobalDefinitions::new(spec.namespace.clone(), move |ctx| {
            template.render_sequence(ctx)
        });
        for dep in &spec.dependencies {
            def = def.with_dependency(self.resolve(dep)?);
        }
        let locals: Vec<&str> = spec.locals.iter().map(String::as_str).collect();
        def = def.with_locals(&locals);
        for import in &spec.imports {
            let args = import
                .args
                .iter()
                .map(|a| Var::new(a.typ.clone(), a.name.clone()))
                .collect();
            def = def.with_import(&import.name, args, &import.return_type);
        }
        for export in &spec.exports {
            def = def.with_export(export);
        }
        self.stack.pop();

        let def = def.shared();
        self.resolved.insert(name.to_string(), Rc::clone(&def));
        Ok(def)
    }
}

fn build_template_node(
    node_type: &str,
    spec: &NodeSpec,
    resolver: &mut GlobalResolver<'_>,
) -> Result<TemplateNode, CompileError> {
    let origin = |field: &str| format!("nodes.{}.{}", node_type, field);
    let parse_opt = |field: &str, source: &Option<String>| -> Result<Option<Template>, CompileError> {
        source
            .as_deref()
            .map(|s| Template::parse(&origin(field), s))
            .transpose()
    };

    let state = spec
        .state
        .iter()
        .map(|member| {
            let template = Template::parse(&origin(&format!("state.{}", member.name)), &member.value)?;
            Ok((member.name.clone(), member.typ.clone(), template))
        })
        .collect::<Result<Vec<_>, CompileError>>()?;

    let inlet_dsp = spec
        .inlet_dsp
        .iter()
        .map(|(inlet, source)| {
            Ok((
                inlet.clone(),
                Template::parse(&origin(&format!("inletDsp.{}", inlet)), source)?,
            ))
        })
        .collect::<Result<IndexMap<_, _>, CompileError>>()?;

    let message_receivers = spec
        .message_receivers
        .iter()
        .map(|(inlet, receiver)| {
            let (body, exhaustive) = match receiver {
                ReceiverJson::Body(body) => (body, false),
                ReceiverJson::Full { body, exhaustive } => (body, *exhaustive),
            };
            let template = Template::parse(&origin(&format!("messageReceivers.{}", inlet)), body)?;
            Ok((inlet.clone(), (template, exhaustive)))
        })
        .collect::<Result<IndexMap<_, _>, CompileError>>()?;

    let dependencies = spec
        .dependencies
        .iter()
        .map(|name| resolver.resolve(name))
        .collect::<Result<Vec<_>, CompileError>>()?;

    Ok(TemplateNode {
        flags: spec.flags,
        namespace: spec.namespace.clone(),
        state,
        core: parse_opt("core", &spec.core)?,
        declarations: parse_opt("declarations", &spec.declarations)?,
        loop_code: parse_opt("loop", &spec.loop_code)?,
        inlet_dsp,
        message_receivers,
        dependencies,
    })
}

// ── Tests ───────────────────────────────────────────────────────────────────
