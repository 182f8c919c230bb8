//! Distributed inference orchestrator - entry point.
//!
//! The interactive console is explicitly out of scope (see SPEC_FULL §1); this is just enough of
//! a binary to bootstrap the registry, load the persisted node list, and dispatch the handful of
//! one-shot subcommands the external CLI surface names (`run`, `nodes`, `health`, `dashboard`).

use std::sync::Arc;

use orchestrator_core::agent::runtime::AgentRuntime;
use orchestrator_core::executor::ParallelExecutor;
use orchestrator_core::intelligent_router::IntelligentRouter;
use orchestrator_core::longform::LongformEngine;
use orchestrator_core::performance_memory::PerformanceMemory;
use orchestrator_core::registry::Registry;
use orchestrator_core::events::EventBus;
use orchestrator_core::workflow::{CollaborativeWorkflow, WorkflowConfig};
use orchestrator_core::Config;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

struct Orchestrator {
    registry: Arc<Registry>,
    memory: Arc<PerformanceMemory>,
    runtime: Arc<AgentRuntime>,
    executor: Arc<ParallelExecutor>,
}

impl Orchestrator {
    async fn bootstrap(config: &Config) -> anyhow::Result<Self> {
        let events = Arc::new(EventBus::new_disconnected());
        if let Some(redis_url) = &config.redis_url {
            events.connect_redis(redis_url).await;
        }

        let registry = Arc::new(Registry::new(events));
        match registry.load_config(&config.node_list_path).await {
            Ok(count) => info!(count, path = %config.node_list_path.display(), "loaded persisted node list"),
            Err(err) => warn!(%err, path = %config.node_list_path.display(), "no persisted node list loaded, starting empty"),
        }
        if let Some(url) = &config.ollama_url {
            if let Err(err) = registry.add_node(url, None, None, true).await {
                warn!(%err, url, "failed to register default ollama node");
            }
        }

        let memory = Arc::new(PerformanceMemory::new());
        let router = Arc::new(IntelligentRouter::new(memory.clone()));
        let runtime = Arc::new(AgentRuntime::new(
            registry.clone(),
            router,
            memory.clone(),
            config.default_model.clone(),
        ));
        let executor = Arc::new(ParallelExecutor::new(runtime.clone(), config.pool_size));

        Ok(Self { registry, memory, runtime, executor })
    }
}

fn print_help() {
    println!("distributed inference orchestrator v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Usage: llm-fleet-orchestrator <command> [args]");
    println!();
    println!("Commands:");
    println!("  run <query>           One-shot collaborative run (research -> critic -> editor)");
    println!("  longform <query>      One-shot long-form chunked run");
    println!("  nodes                 List registered nodes");
    println!("  add <url>             Register a node");
    println!("  health                Probe every registered node");
    println!("  dashboard             Print a JSON dashboard snapshot");
    println!("  --help, -h            Show this help");
    println!();
    println!("Environment variables are documented in SPEC_FULL.md §6a (ORCHESTRATOR_* and REDIS_URL).");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") || args.len() < 2 {
        print_help();
        return Ok(());
    }

    let log_level = std::env::var("RUST_LOG")
        .map(|s| match s.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        })
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .json()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = Config::from_env()?;
    let orchestrator = Orchestrator::bootstrap(&config).await?;

    let command = args[1].as_str();
    match command {
        "run" => {
            let query = args[2..].join(" ");
            if query.is_empty() {
                eprintln!("usage: llm-fleet-orchestrator run <query>");
                std::process::exit(1);
            }
            let workflow = CollaborativeWorkflow::new(orchestrator.runtime.clone());
            let result = workflow.run(&query, &WorkflowConfig::default()).await?;
            println!("{}", result.final_output);
        }
        "longform" => {
            let query = args[2..].join(" ");
            if query.is_empty() {
                eprintln!("usage: llm-fleet-orchestrator longform <query>");
                std::process::exit(1);
            }
            let engine = LongformEngine::new(orchestrator.runtime.clone(), orchestrator.executor.clone());
            let result = engine.run(&query).await?;
            println!("{}", result.final_text);
        }
        "nodes" => {
            for node in orchestrator.registry.all_nodes().await {
                println!("{} ({}) healthy={}", node.url, node.name, node.is_healthy());
            }
        }
        "add" => {
            let Some(url) = args.get(2) else {
                eprintln!("usage: llm-fleet-orchestrator add <url>");
                std::process::exit(1);
            };
            orchestrator.registry.add_node(url, None, None, true).await?;
            orchestrator.registry.save_config(&config.node_list_path).await?;
            println!("registered {url}");
        }
        "health" => {
            let results = orchestrator
                .registry
                .health_check_all(std::time::Duration::from_millis(config.discovery_timeout_ms))
                .await;
            for (url, healthy) in results {
                println!("{url}: {}", if healthy { "healthy" } else { "unreachable" });
            }
        }
        "dashboard" => {
            let snapshot = orchestrator_core::snapshot::build(&orchestrator.registry, &orchestrator.memory).await;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        other => {
            eprintln!("unknown command: {other}");
            print_help();
            std::process::exit(1);
        }
    }

    Ok(())
}
