// dspc — DSP graph compiler
//
// Library root. Compiles a signal/message patch graph plus a registry of node
// implementations into one backend-agnostic program (`ast::Sequence`).
// `pipeline::compile` is the one-shot entry point; the passes are public for
// callers that need intermediate artifacts.

pub mod assemble;
pub mod ast;
pub mod dependencies;
pub mod diag;
pub mod dsp;
pub mod flow;
pub mod graph;
pub mod id;
pub mod messages;
pub mod names;
pub mod pass;
pub mod pipeline;
pub mod precompile;
pub mod registry;
pub mod settings;
pub mod stdlib;
pub mod template;
pub mod traversal;

pub use diag::CompileError;
pub use pipeline::{compile, CompiledProgram, PipelineError};
