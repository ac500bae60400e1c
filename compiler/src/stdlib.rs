// stdlib.rs — Runtime helper namespaces every generated program depends on
//
// `core` exposes engine type aliases derived from the bit depth, `msg` the
// message datum tags and host message helpers, `commons` the frame hook.
// They are prepended to every compilation's dependency list so node
// implementations can reference `${msg.display}` and friends unconditionally.

use std::rc::Rc;

use crate::ast::{Element, Func, Sequence, Var};
use crate::dependencies::GlobalDefinitions;

/// Tag of a message datum. Values are the integers written into generated
/// code; they never change between compilations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageDatumType {
    Float,
    String,
}

impl MessageDatumType {
    pub const ALL: [MessageDatumType; 2] = [MessageDatumType::Float, MessageDatumType::String];

    pub fn tag(self) -> u8 {
        match self {
            MessageDatumType::Float => 0,
            MessageDatumType::String => 1,
        }
    }

    /// Local name of the tag constant in the `msg` namespace.
    pub fn local_name(self) -> &'static str {
        match self {
            MessageDatumType::Float => "FLOAT_TOKEN",
            MessageDatumType::String => "STRING_TOKEN",
        }
    }
}

/// Shared instances of the helper namespaces. Node implementations depend on
/// these exact `Rc`s so deduplication keeps a single copy.
#[derive(Debug, Clone)]
pub struct Stdlib {
    pub core: Rc<GlobalDefinitions>,
    pub msg: Rc<GlobalDefinitions>,
    pub commons: Rc<GlobalDefinitions>,
}

impl Default for Stdlib {
    fn default() -> Self {
        Self::new()
    }
}

impl Stdlib {
    pub fn new() -> Self {
        let core = GlobalDefinitions::new("core", |ctx| {
            let bit_depth = ctx.settings.audio.bit_depth;
            let mut seq = Sequence::code(format!(
                "type Float = {}\ntype FloatArray = {}",
                bit_depth.float_type(),
                bit_depth.float_array_type()
            ));
            seq.push(Element::Func(
                Func::named(ctx.ns("getBitDepth")?, vec![], "Int")
                    .with_body(format!("return {}", bit_depth.bits())),
            ));
            Ok(seq)
        })
        .with_export("getBitDepth")
        .shared();

        let locals: Vec<&str> = MessageDatumType::ALL.iter().map(|t| t.local_name()).collect();
        let msg = GlobalDefinitions::new("msg", |ctx| {
            let mut seq = Sequence::new();
            for datum in MessageDatumType::ALL {
                seq.push(Element::ConstVar(
                    Var::new("Int", ctx.ns(datum.local_name())?)
                        .with_value(datum.tag().to_string()),
                ));
            }
            Ok(seq)
        })
        .with_locals(&locals)
        .with_dependency(Rc::clone(&core))
        .with_import(
            "create",
            vec![Var::new("MessageTemplate", "template")],
            "Message",
        )
        .with_import("display", vec![Var::new("Message", "m")], "String")
        .with_import(
            "isMatching",
            vec![
                Var::new("Message", "m"),
                Var::new("MessageTemplate", "template"),
            ],
            "Bool",
        )
        .with_import(
            "readFloatToken",
            vec![Var::new("Message", "m"), Var::new("Int", "index")],
            "Float",
        )
        .with_import(
            "readStringToken",
            vec![Var::new("Message", "m"), Var::new("Int", "index")],
            "String",
        )
        .shared();

        let commons = GlobalDefinitions::new("commons", |_| Ok(Sequence::new()))
            .with_dependency(Rc::clone(&core))
            .with_import("emitFrame", vec![Var::new("Int", "frame")], "void")
            .shared();

        Stdlib { core, msg, commons }
    }

    /// Definitions every program starts with, in emission order.
    pub fn minimal_dependencies(&self) -> Vec<Rc<GlobalDefinitions>> {
        vec![
            Rc::clone(&self.core),
            Rc::clone(&self.msg),
            Rc::clone(&self.commons),
        ]
    }

    /// Look a helper namespace up by tag.
    pub fn by_tag(&self, tag: &str) -> Option<&Rc<GlobalDefinitions>> {
        match tag {
            "core" => Some(&self.core),
            "msg" => Some(&self.msg),
            "commons" => Some(&self.commons),
            _ => None,
        }
    }
}
