//! scopeflow - load a session, run one refresh pass and report the results.

use anyhow::Context;
use clap::Parser;
use scopeflow::{
    config::EngineConfig,
    logging,
    pipeline::registered_protocols,
    session::{load_session, preload_session, SessionDocument},
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "scopeflow")]
#[command(author, version, about = "Run a scopeflow session once", long_about = None)]
struct Cli {
    /// Session document to load
    session: Option<PathBuf>,

    /// Engine config file (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// List registered filter protocols and exit
    #[arg(long)]
    list_protocols: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::load_from(path).with_context(|| format!("loading {}", path.display()))?,
        None => EngineConfig::load_or_default(),
    };
    let _log_guard = logging::init_logging(&config.logging)?;

    if cli.list_protocols {
        for protocol in registered_protocols() {
            println!("{protocol}");
        }
        return Ok(());
    }

    let Some(session_path) = cli.session else {
        anyhow::bail!("no session document given");
    };
    let doc = SessionDocument::load(&session_path)?;

    for warning in preload_session(&doc, &[]) {
        tracing::warn!("{}", warning);
    }

    let mut graph = config.build_graph();
    let loaded = load_session(&doc, &mut graph)?;
    for warning in &loaded.warnings {
        tracing::warn!("{}", warning);
    }

    let stats = graph.refresh()?;
    tracing::info!(
        "Refreshed {} nodes, {} with errors, {} submissions",
        stats.refreshed,
        stats.with_errors,
        stats.submissions
    );

    for id in graph.node_ids().collect::<Vec<_>>() {
        let Some(node) = graph.node(id) else {
            continue;
        };
        let core = node.core();
        for stream in &core.channel.streams {
            if let Some(value) = stream.scalar_value() {
                println!(
                    "{} / {}: {}",
                    core.display_name(),
                    stream.name,
                    stream.y_unit.format_value(value)
                );
            }
        }
        for error in core.errors() {
            println!("{}: {:?}: {}", core.display_name(), error.kind, error.message);
        }
    }
    Ok(())
}
