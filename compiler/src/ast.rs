// ast.rs — Backend-agnostic output syntax tree
//
// The precompiler and the IR assembler build programs out of these nodes.
// Code fragments produced by node implementations are opaque text; the tree
// only gives structure (variables, functions, classes, the per-frame loop) so
// backend emitters can render concrete syntax and host bindings.
//
// Preconditions: none (data-only module).
// Postconditions: `Sequence` never holds two adjacent `Code` elements and
//                 never holds an empty `Code` element.
// Failure modes: none.
// Side effects: none.

use std::fmt;

use serde::Serialize;

// ── Elements ──

/// One element of an output sequence.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "astType", content = "value")]
pub enum Element {
    /// Opaque target code, one statement or expression per line.
    Code(String),
    Var(Var),
    ConstVar(Var),
    Func(Func),
    Class(Class),
    Loop(FrameLoop),
}

/// A variable declaration. `value` is `None` for uninitialised declarations.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Var {
    #[serde(rename = "type")]
    pub typ: String,
    pub name: String,
    pub value: Option<Sequence>,
}

impl Var {
    pub fn new(typ: impl Into<String>, name: impl Into<String>) -> Self {
        Var {
            typ: typ.into(),
            name: name.into(),
            value: None,
        }
    }

    pub fn with_value(mut self, value: impl Into<Sequence>) -> Self {
        self.value = Some(value.into());
        self
    }
}

/// A function definition. Anonymous when `name` is `None`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Func {
    pub name: Option<String>,
    pub args: Vec<Var>,
    #[serde(rename = "returnType")]
    pub return_type: String,
    pub body: Sequence,
}

impl Func {
    pub fn named(name: impl Into<String>, args: Vec<Var>, return_type: impl Into<String>) -> Self {
        Func {
            name: Some(name.into()),
            args,
            return_type: return_type.into(),
            body: Sequence::new(),
        }
    }

    pub fn with_body(mut self, body: impl Into<Sequence>) -> Self {
        self.body = body.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Class {
    pub name: String,
    pub members: Vec<Var>,
}

/// The per-block DSP loop: iterates `iter` over `0..block_size`, calls
/// `frame_hook(frame)` at the start of every frame and increments `frame`
/// at its end.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameLoop {
    pub iter: String,
    pub block_size: String,
    pub frame: String,
    #[serde(rename = "frameHook")]
    pub frame_hook: String,
    pub body: Sequence,
}

// ── Sequence ──

/// Ordered list of elements with adjacent code merged line-wise.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Sequence {
    pub content: Vec<Element>,
}

impl Sequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn code(text: impl AsRef<str>) -> Self {
        let mut seq = Sequence::new();
        seq.push_code(text.as_ref());
        seq
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Append code text. Lines are trimmed, blank lines dropped, and the
    /// result is merged into a trailing `Code` element when there is one.
    pub fn push_code(&mut self, text: &str) {
        let normalized = normalize_code(text);
        if normalized.is_empty() {
            return;
        }
        if let Some(Element::Code(last)) = self.content.last_mut() {
            last.push('\n');
            last.push_str(&normalized);
        } else {
            self.content.push(Element::Code(normalized));
        }
    }

    pub fn push(&mut self, element: Element) {
        match element {
            Element::Code(text) => self.push_code(&text),
            other => self.content.push(other),
        }
    }

    pub fn extend(&mut self, other: Sequence) {
        for element in other.content {
            self.push(element);
        }
    }

    /// The single-line expression this sequence consists of, if any.
    /// A sequence with several statements, or with structural elements, is
    /// not an expression.
    pub fn as_expression(&self) -> Option<&str> {
        match self.content.as_slice() {
            [Element::Code(text)] if !text.contains('\n') && !text.ends_with(';') => Some(text),
            _ => None,
        }
    }
}

impl From<Element> for Sequence {
    fn from(element: Element) -> Self {
        let mut seq = Sequence::new();
        seq.push(element);
        seq
    }
}

impl From<Vec<Element>> for Sequence {
    fn from(elements: Vec<Element>) -> Self {
        let mut seq = Sequence::new();
        for element in elements {
            seq.push(element);
        }
        seq
    }
}

impl From<&str> for Sequence {
    fn from(text: &str) -> Self {
        Sequence::code(text)
    }
}

impl From<String> for Sequence {
    fn from(text: String) -> Self {
        Sequence::code(text)
    }
}

impl From<Func> for Element {
    fn from(func: Func) -> Self {
        Element::Func(func)
    }
}

impl From<Class> for Element {
    fn from(class: Class) -> Self {
        Element::Class(class)
    }
}

fn normalize_code(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Display ─────────────────────────────────────────────────────────────────
//
// Renders a neutral pseudo-code listing. Used for snapshots and `--emit ir`;
// real backends walk the tree themselves.

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_sequence(f, self, "")
    }
}

fn fmt_sequence(f: &mut fmt::Formatter<'_>, seq: &Sequence, indent: &str) -> fmt::Result {
    for element in &seq.content {
        fmt_element(f, element, indent)?;
    }
    Ok(())
}

fn fmt_element(f: &mut fmt::Formatter<'_>, element: &Element, indent: &str) -> fmt::Result {
    let inner = format!("{}    ", indent);
    match element {
        Element::Code(text) => {
            for line in text.lines() {
                writeln!(f, "{}{}", indent, line)?;
            }
        }
        Element::Var(var) => writeln!(f, "{}let {}", indent, fmt_var(var))?,
        Element::ConstVar(var) => writeln!(f, "{}const {}", indent, fmt_var(var))?,
        Element::Func(func) => {
            let args: Vec<String> = func.args.iter().map(fmt_var).collect();
            writeln!(
                f,
                "{}func {}({}) -> {} {{",
                indent,
                func.name.as_deref().unwrap_or(""),
                args.join(", "),
                func.return_type
            )?;
            fmt_sequence(f, &func.body, &inner)?;
            writeln!(f, "{}}}", indent)?;
        }
        Element::Class(class) => {
            writeln!(f, "{}class {} {{", indent, class.name)?;
            for member in &class.members {
                writeln!(f, "{}{}", inner, fmt_var(member))?;
            }
            writeln!(f, "{}}}", indent)?;
        }
        Element::Loop(lp) => {
            writeln!(
                f,
                "{}for ({it} = 0; {it} < {bs}; {it}++) {{",
                indent,
                it = lp.iter,
                bs = lp.block_size
            )?;
            writeln!(f, "{}{}({})", inner, lp.frame_hook, lp.frame)?;
            fmt_sequence(f, &lp.body, &inner)?;
            writeln!(f, "{}{}++", inner, lp.frame)?;
            writeln!(f, "{}}}", indent)?;
        }
    }
    Ok(())
}

fn fmt_var(var: &Var) -> String {
    match &var.value {
        None => format!("{}: {}", var.name, var.typ),
        Some(value) => {
            let rendered = value.to_string();
            format!("{}: {} = {}", var.name, var.typ, rendered.trim_end())
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
