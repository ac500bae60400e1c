use clap::Parser;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dspc::graph::Graph;
use dspc::pass::PassId;
use dspc::pipeline::{run_pipeline, CompilationState};
use dspc::settings::UserSettings;

#[derive(Debug, Clone, clap::ValueEnum)]
enum EmitStage {
    /// Pseudo-code listing of the assembled program
    Ir,
    /// Assembled program as JSON
    Json,
    /// Full graph traversal, one node id per line
    Traversal,
    /// Variable names index as JSON
    Names,
}

#[derive(Parser, Debug)]
#[command(
    name = "dspc",
    version,
    about = "DSP graph compiler — precompiles signal/message patch graphs into engine IR"
)]
struct Cli {
    /// Input graph (JSON object keyed by node id)
    graph: PathBuf,

    /// Node implementation registry (JSON templates)
    #[arg(long = "nodes")]
    nodes: PathBuf,

    /// Compilation settings (JSON)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Output stage
    #[arg(long, value_enum, default_value_t = EmitStage::Ir)]
    emit: EmitStage,

    /// Debug naming and verbose receiver errors in generated code
    #[arg(long)]
    debug: bool,

    /// Print compiler passes and timing
    #[arg(long)]
    verbose: bool,
}

fn read(path: &Path) -> String {
    match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("dspc: error: {}: {}", path.display(), e);
            std::process::exit(2);
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "dspc=debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if cli.verbose {
        eprintln!("dspc: graph = {}", cli.graph.display());
        eprintln!("dspc: nodes = {}", cli.nodes.display());
        eprintln!("dspc: emit  = {:?}", cli.emit);
    }

    // ── Load inputs ──
    let graph = match Graph::from_json(&read(&cli.graph)) {
        Ok(g) => g,
        Err(e) => {
            eprintln!("dspc: {}", e.render());
            std::process::exit(2);
        }
    };
    let registry = match dspc::template::load_registry(&read(&cli.nodes)) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("dspc: {}", e.render());
            std::process::exit(2);
        }
    };
    let mut settings = match &cli.settings {
        Some(path) => match UserSettings::from_json(&read(path)) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("dspc: {}", e.render());
                std::process::exit(2);
            }
        },
        None => UserSettings::default(),
    };
    if cli.debug {
        settings.debug = Some(true);
    }

    if cli.verbose {
        eprintln!(
            "dspc: {} nodes, {} node types registered",
            graph.len(),
            registry.len()
        );
    }

    // ── Run passes ──
    let terminal = match cli.emit {
        EmitStage::Traversal => PassId::BuildTraversal,
        _ => PassId::Assemble,
    };
    let mut state = CompilationState::new(&graph, &registry, settings);
    if let Err(e) = run_pipeline(&mut state, terminal, cli.verbose, |_, _| {}) {
        eprintln!("dspc: {}", e.error.render());
        std::process::exit(1);
    }

    if cli.verbose {
        if let Some(json) = state
            .provenance
            .as_ref()
            .and_then(|p| serde_json::to_string_pretty(p).ok())
        {
            eprintln!("{}", json);
        }
    }

    // ── Emit ──
    let output = match cli.emit {
        EmitStage::Ir => state.program.as_ref().map(|p| p.to_string()),
        EmitStage::Json => state
            .program
            .as_ref()
            .and_then(|p| serde_json::to_string_pretty(p).ok()),
        EmitStage::Traversal => state.traversal.as_ref().map(|t| {
            let mut s = t.join("\n");
            s.push('\n');
            s
        }),
        EmitStage::Names => state
            .names
            .as_ref()
            .and_then(|n| serde_json::to_string_pretty(n).ok()),
    };
    match output {
        Some(text) => print!("{}", text),
        None => {
            eprintln!("dspc: nothing to emit for {:?}", cli.emit);
            std::process::exit(1);
        }
    }
}
