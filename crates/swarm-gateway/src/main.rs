//! swarm-gateway: Multi-agent orchestration gateway binary
//!
//! Runs one subagent task against the configured Anthropic client and
//! prints the result.
//!
//! Usage:
//!   swarm-gateway <task...>              - Run a task through a subagent
//!   swarm-gateway --history <agent-id>   - Show recent delegations of an agent
//!   swarm-gateway --help                 - Show help

use std::sync::Arc;

use swarm_agents::{SpawnRequest, SpawnTool, SubagentManager, SubagentsTool};
use swarm_core::config::SubagentConfig;
use swarm_core::policy::DEFAULT_ALIASES;
use swarm_core::store::{HistoryStore, SqliteHistoryStore};
use swarm_core::{ChannelBus, ClaudeClient, Config, OriginMeta, RunContext, ToolManager};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

/// Run mode
enum RunMode {
    /// Run a task through a subagent
    Task(String),
    /// Show delegation history for an agent
    History(String),
    /// Show help
    Help,
    /// Show version
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mode = parse_args();

    match mode {
        RunMode::Help => {
            print_help();
            return Ok(());
        }
        RunMode::Version => {
            println!("swarm-gateway {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        _ => {}
    }

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    // Load .env file
    dotenvy::dotenv().ok();

    let config = Config::load().map_err(|e| anyhow::anyhow!("Config error: {}", e))?;

    match mode {
        RunMode::Task(task) => run_task(config, task).await,
        RunMode::History(agent_id) => show_history(&config, &agent_id).await,
        _ => Ok(()),
    }
}

/// Parse command line arguments
fn parse_args() -> RunMode {
    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.first().map(String::as_str) {
        None | Some("--help") | Some("-h") => RunMode::Help,
        Some("--version") | Some("-v") => RunMode::Version,
        Some("--history") => match args.get(1) {
            Some(agent_id) => RunMode::History(agent_id.clone()),
            None => RunMode::Help,
        },
        Some(_) => RunMode::Task(args.join(" ")),
    }
}

/// Print help message
fn print_help() {
    println!("swarm-gateway - Multi-agent orchestration gateway");
    println!();
    println!("Usage:");
    println!("  swarm-gateway <task...>             Run a task through a subagent");
    println!("  swarm-gateway --history <agent-id>  Show recent delegations of an agent");
    println!("  swarm-gateway --help                Show this help message");
    println!("  swarm-gateway --version             Show version");
    println!();
    println!("Configuration is read from ./swarm.toml when present, otherwise from the environment.");
    println!();
    println!("Environment Variables:");
    println!("  LLM_API_KEY                 API key (required)");
    println!("  LLM_MODEL                   Model name");
    println!("  LLM_BASE_URL                Custom API endpoint");
    println!("  SUBAGENT_MAX_DEPTH          Maximum spawn depth (default: 1; 2 or more lets the");
    println!("                              CLI task spawn subagents of its own)");
    println!("  SUBAGENT_MAX_CONCURRENT     Maximum concurrent subagents (default: 8)");
    println!("  SUBAGENT_MAX_CHILDREN       Maximum subagents per parent (default: 5)");
    println!("  SUBAGENT_ARCHIVE_AFTER_SECS Keep finished subagents visible (default: 0)");
    println!("  DELEGATION_MAX_LOAD         Default per-agent delegation load (default: 5)");
    println!("  DELEGATION_HISTORY_DB       SQLite path for delegation history");
}

async fn run_task(config: Config, task: String) -> anyhow::Result<()> {
    tracing::info!("Starting swarm-gateway...");
    tracing::info!("Model: {}", config.llm.model);

    let client = ClaudeClient::new(&config.llm)
        .map_err(|e| anyhow::anyhow!("Failed to create LLM client: {}", e))?;

    // Announces and lifecycle events are logged
    let (bus, mut inbound) = ChannelBus::new(64);
    let bus = Arc::new(bus);
    let mut events = bus.subscribe();
    tokio::spawn(async move {
        while let Some(msg) = inbound.recv().await {
            tracing::info!(chat_id = %msg.chat_id, sender = %msg.sender_id, "Announce:\n{}", msg.content);
        }
    });
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    tracing::debug!(event = %event.name, payload = %event.payload, "Lifecycle event")
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Lifecycle event log lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let manager = Arc::new(
        SubagentManager::new(config.subagents.clone(), Arc::new(client))
            .with_bus(bus)
            .with_tool_policy(config.tools.clone()),
    );

    let nested = allows_nested_spawns(&config.subagents);
    if !nested {
        tracing::info!("Nested subagents disabled (SUBAGENT_MAX_DEPTH < 2)");
    }
    let tools = build_tools(&manager, nested);
    tracing::info!("Registered {} tools", tools.len());
    manager.set_tools(Arc::new(tools));

    let ctx = RunContext::new()
        .with_session_key("cli")
        .with_origin(OriginMeta::new("cli", "local"));

    let outcome = tokio::select! {
        outcome = manager.run_sync(&ctx, SpawnRequest::new(task).with_label("cli")) => outcome,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down...");
            ctx.cancel.cancel();
            manager.shutdown();
            return Ok(());
        }
    };

    // Let background subagents spawned by the task finish
    while nested && manager.active_count() > 0 {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    }
    manager.shutdown();

    let outcome = outcome.map_err(|e| anyhow::anyhow!("{}", e))?;
    println!("{}", outcome.content);
    tracing::info!(
        iterations = outcome.iterations,
        "Finished in {:.1}s",
        outcome.runtime.as_secs_f64()
    );
    Ok(())
}

/// The CLI task itself runs at depth 1, so nested spawns need a depth of 2
fn allows_nested_spawns(config: &SubagentConfig) -> bool {
    config.max_spawn_depth >= 2
}

fn build_tools(manager: &Arc<SubagentManager>, nested: bool) -> ToolManager {
    let mut tools = ToolManager::new();
    for (alias, canonical) in DEFAULT_ALIASES {
        tools.register_alias(*alias, *canonical);
    }
    if nested {
        tools.register(Arc::new(SpawnTool::new(manager)));
        tools.register(Arc::new(SubagentsTool::new(manager)));
    }
    tools
}

async fn show_history(config: &Config, agent_id: &str) -> anyhow::Result<()> {
    let Some(path) = config.delegation.history_db_path.as_deref() else {
        anyhow::bail!("Delegation history is not configured (set DELEGATION_HISTORY_DB)");
    };
    let store = SqliteHistoryStore::new(path)
        .map_err(|e| anyhow::anyhow!("Failed to open history database: {}", e))?;

    let records = store
        .list_delegations(agent_id, 20)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read history: {}", e))?;
    if records.is_empty() {
        println!("No delegations recorded for {}", agent_id);
        return Ok(());
    }

    for record in records {
        println!(
            "{}  {} -> {}  [{}] {}ms  {}",
            record.created_at.format("%Y-%m-%d %H:%M:%S"),
            record.source_agent_id,
            record.target_agent_id,
            record.status,
            record.duration_ms,
            record.task.lines().next().unwrap_or_default()
        );
    }
    Ok(())
}
