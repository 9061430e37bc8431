//! CLI binary for linting, inspecting and simulating Parley flows.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::json;

use parley_engine::{
    default_registry, lint, Collaborators, EchoGenerator, EngineConfig, FileStateStore,
    FlowDefinition, FlowEngine, InMemoryFlowSource, KeywordExtractor, MemoryStateStore, NodeType,
    RecordingDelivery, Severity, StateStore, StaticAdapter, TurnOutcome,
};
use parley_types::InboundEvent;

#[derive(Parser)]
#[command(name = "parley", version, about = "Conversation flow linter and simulator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Lint a flow definition
    Validate {
        /// Path to the flow .json file
        flow: PathBuf,
    },

    /// Show information about a flow
    Info {
        /// Path to the flow .json file
        flow: PathBuf,
    },

    /// Run messages through a flow with local stand-in collaborators
    Simulate {
        /// Path to the flow .json file
        flow: PathBuf,

        /// Inbound message text; repeat for several turns
        #[arg(short, long = "message", required = true)]
        messages: Vec<String>,

        /// Tenant id (default: the flow's tenant)
        #[arg(long)]
        tenant: Option<String>,

        #[arg(long, default_value = "simulator")]
        user: String,

        /// Engine config .json file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Overrides maxStepsPerTurn from the config
        #[arg(long)]
        max_steps: Option<usize>,

        /// Keep conversation state in this directory between runs
        #[arg(long)]
        state_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    match cli.command {
        Commands::Validate { flow } => {
            cmd_validate(&flow).await?;
        }
        Commands::Info { flow } => {
            cmd_info(&flow).await?;
        }
        Commands::Simulate {
            flow,
            messages,
            tenant,
            user,
            config,
            max_steps,
            state_dir,
        } => {
            cmd_simulate(
                &flow,
                &messages,
                tenant,
                &user,
                config.as_deref(),
                max_steps,
                state_dir,
            )
            .await?;
        }
    }

    Ok(())
}

async fn load_flow(path: &Path) -> anyhow::Result<FlowDefinition> {
    let source = tokio::fs::read_to_string(path).await?;
    Ok(FlowDefinition::from_json(&source)?)
}

async fn cmd_validate(path: &Path) -> anyhow::Result<()> {
    let flow = load_flow(path).await?;
    let diagnostics = lint(&flow);

    if diagnostics.is_empty() {
        println!("Flow is valid");
        return Ok(());
    }

    let mut has_error = false;
    for diag in &diagnostics {
        has_error |= diag.severity == Severity::Error;
        println!("{diag}");
        if let Some(fix) = &diag.fix {
            println!("    fix: {fix}");
        }
    }

    if has_error {
        std::process::exit(1);
    }
    Ok(())
}

async fn cmd_info(path: &Path) -> anyhow::Result<()> {
    let flow = load_flow(path).await?;

    println!("Flow: {} (v{})", flow.label(), flow.version);
    println!("Tenant: {}", flow.tenant_id);
    println!("Priority: {}", flow.priority);
    println!("Nodes: {}", flow.nodes.len());
    println!("Edges: {}", flow.edges.len());
    if let Some(trigger) = flow.triggers().next() {
        println!("Trigger: {}", trigger.id);
    }

    println!("\nNodes:");
    for node in &flow.nodes {
        let outgoing: Vec<String> = flow
            .edges_from(&node.id)
            .map(|e| match (&e.source_handle, &e.guard) {
                (Some(handle), Some(guard)) => format!("{} [{handle}] if {guard}", e.target),
                (Some(handle), None) => format!("{} [{handle}]", e.target),
                (None, Some(guard)) => format!("{} if {guard}", e.target),
                (None, None) => e.target.clone(),
            })
            .collect();
        println!("  {} [{}] -> {}", node.id, node.node_type, outgoing.join(", "));
    }

    Ok(())
}

/// Collaborators for local runs: echo generation, keyword extraction, a
/// recording channel, and a stub for every adapter the flow names.
fn simulation_collaborators(flow: &FlowDefinition, delivery: Arc<RecordingDelivery>) -> Collaborators {
    let mut collaborators = Collaborators::new(Arc::new(EchoGenerator), Arc::new(KeywordExtractor), delivery);
    for node in flow.nodes.iter().filter(|n| n.node_type == NodeType::ActionAdapter) {
        if let Some(name) = node.config_str("adapter") {
            collaborators = collaborators.with_adapter(name, Arc::new(StaticAdapter::new(json!({ "ok": true }))));
        }
    }
    collaborators
}

fn print_outcome(outcome: &TurnOutcome) {
    println!(
        "  -> {:?} after {} step(s): {}",
        outcome.status,
        outcome.steps,
        outcome.visited.join(" > ")
    );
    for missing in &outcome.diagnostics {
        println!("     missing variable {{{{{}}}}} in {}", missing.path, missing.node_id);
    }
    if let Some(failure) = &outcome.failure {
        println!("     failed at {}: {}", failure.node_id, failure.reason);
    }
}

async fn cmd_simulate(
    path: &Path,
    messages: &[String],
    tenant: Option<String>,
    user: &str,
    config: Option<&Path>,
    max_steps: Option<usize>,
    state_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    let mut flow = load_flow(path).await?;
    let tenant = tenant.unwrap_or_else(|| flow.tenant_id.clone());
    flow.tenant_id = tenant.clone();

    let mut config = match config {
        Some(p) => EngineConfig::load(p).await?,
        None => EngineConfig::default(),
    };
    if let Some(max_steps) = max_steps {
        config = config.with_max_steps(max_steps);
    }

    let delivery = Arc::new(RecordingDelivery::new());
    let collaborators = simulation_collaborators(&flow, delivery.clone());
    let store: Arc<dyn StateStore> = match state_dir {
        Some(dir) => Arc::new(FileStateStore::new(dir)),
        None => Arc::new(MemoryStateStore::new()),
    };
    let source = Arc::new(InMemoryFlowSource::new().with_flow(flow));
    let engine = FlowEngine::new(source, store, default_registry(&collaborators), config);

    tracing::debug!(flow = %path.display(), tenant = %tenant, user = %user, "Starting simulation");
    let run_id = std::process::id();
    let mut delivered = 0;
    for (i, text) in messages.iter().enumerate() {
        println!("> {text}");
        let event = InboundEvent::new(&tenant, user, format!("sim-{run_id}-{i}"))
            .with_field("text", json!(text));
        let outcome = engine.handle_event(event).await?;

        let texts = delivery.texts();
        for reply in &texts[delivered..] {
            println!("< {reply}");
        }
        delivered = texts.len();
        print_outcome(&outcome);
    }

    Ok(())
}
