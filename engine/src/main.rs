//! Headless entrypoint for the coordination core. Grounded in the teacher's
//! `engine/src/main.rs`: a `clap` `Cli`/`Command` enum, a `build_state`
//! assembling every collaborator, and `resolve_state_dir`/`log_startup_paths`
//! helpers, retargeted from the teacher's `serve`/`run`/`chat` subcommands to
//! `serve`/`run`/`migrate` (the coordination core has no interactive chat
//! surface but does need an explicit store-migration path).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use coord_arbitrator::Arbitrator;
use coord_bus::InProcessBus;
use coord_client::{Backend, HttpBackend, InferenceClient};
use coord_config::{CliArgs, Config};
use coord_ledger::CostLedger;
use coord_observability::{canonical_logs_dir_from_root, init_process_logging, ProcessKind};
use coord_orchestrator::{Orchestrator, OrchestratorConfig};
use coord_router::ModelRouter;
use coord_store::TaskStore;
use coord_types::{AgentRole, BudgetCaps, ModelDescriptor, ProjectStatus, Stage};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "coord-engine")]
#[command(about = "Headless coordination-core engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    config: CliArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP/WebSocket facade and the background arbitrator/bus sweep.
    Serve {
        #[arg(long, alias = "host", default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, default_value_t = 4000)]
        port: u16,
        #[arg(long)]
        state_dir: Option<String>,
    },
    /// Submit and execute a single one-stage project, then print its result.
    Run {
        name: String,
        #[arg(long)]
        requirement: Vec<String>,
        #[arg(long)]
        state_dir: Option<String>,
    },
    /// Re-serialize every stored project and task through the current schema.
    Migrate {
        #[arg(long)]
        state_dir: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Command::Serve { state_dir, .. } | Command::Run { state_dir, .. } | Command::Migrate { state_dir } => {
            let resolved = resolve_state_dir(state_dir.clone());
            let logs_dir = canonical_logs_dir_from_root(&resolved);
            let retention_days = 7;
            match init_process_logging(ProcessKind::Engine, &logs_dir, retention_days) {
                Ok((guard, info)) => {
                    // The worker guard must outlive the process for the
                    // non-blocking file writer to flush; leaking it here is
                    // intentional for a long-running binary.
                    std::mem::forget(guard);
                    tracing::info!(?info, "structured logging initialized");
                }
                Err(err) => {
                    tracing_subscriber::fmt().with_env_filter("info").with_target(false).init();
                    tracing::warn!(error = %err, "falling back to stderr-only logging");
                }
            }
        }
    }

    let config = coord_config::load(&cli.config).context("failed to load configuration")?;

    match cli.command {
        Command::Serve { hostname, port, state_dir } => {
            let state_dir = resolve_state_dir(state_dir);
            let state = build_state(&state_dir, &config).await?;
            let addr: SocketAddr = format!("{hostname}:{port}").parse().context("invalid hostname or port")?;
            log_startup_paths(&state_dir, &addr);

            let recovered = state.orchestrator.recover_orphaned_tasks().await?;
            if recovered > 0 {
                info!(recovered, "requeued orphaned tasks from a prior process");
            }

            let cancel = CancellationToken::new();
            let arbitrator_cancel = cancel.clone();
            let arbitrator = state.arbitrator.clone();
            tokio::spawn(async move {
                arbitrator.run(arbitrator_cancel).await;
            });

            let server_state = coord_server::AppState {
                bus: state.bus.clone(),
                store: state.store.clone(),
                ledger: state.ledger.clone(),
                orchestrator: state.orchestrator.clone(),
            };
            let result = coord_server::serve(addr, server_state).await;
            cancel.cancel();
            result
        }
        Command::Run { name, requirement, state_dir } => {
            let state_dir = resolve_state_dir(state_dir);
            let state = build_state(&state_dir, &config).await?;
            let requirements = if requirement.is_empty() { vec!["complete the task".to_string()] } else { requirement };
            let stage = Stage {
                id: "stage-1".to_string(),
                name: "run".to_string(),
                roles: vec![AgentRole::Writer],
                output_schema: "{}".to_string(),
            };
            let project = state
                .orchestrator
                .submit_project(
                    name,
                    requirements,
                    1,
                    BudgetCaps { currency: "USD".to_string(), daily: config.budget.daily, monthly: config.budget.monthly },
                    vec![stage],
                )
                .await?;
            state.orchestrator.execute_project(project.id).await?;

            loop {
                tokio::time::sleep(Duration::from_millis(250)).await;
                let current = state.store.load_project(project.id).await?;
                if matches!(current.status, ProjectStatus::Completed | ProjectStatus::Failed | ProjectStatus::Paused) {
                    println!("{}", serde_json::to_string_pretty(&current)?);
                    break;
                }
            }
            Ok(())
        }
        Command::Migrate { state_dir } => {
            let state_dir = resolve_state_dir(state_dir);
            let store = TaskStore::new(state_dir.join("store"))?;
            let mut migrated_projects = 0usize;
            let mut migrated_tasks = 0usize;
            for project in store.list_projects().await? {
                store.save_project(&project).await?;
                migrated_projects += 1;
                for task in store.list_tasks(project.id).await? {
                    store.save_task(&task).await?;
                    migrated_tasks += 1;
                }
            }
            info!(migrated_projects, migrated_tasks, "migration complete");
            Ok(())
        }
    }
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("COORD_STATE_DIR") {
        return PathBuf::from(dir);
    }
    PathBuf::from(".coord")
}

fn log_startup_paths(state_dir: &PathBuf, addr: &SocketAddr) {
    info!(state_dir = %state_dir.display(), %addr, "coord-engine starting");
}

struct EngineState {
    bus: Arc<InProcessBus>,
    store: Arc<TaskStore>,
    ledger: Arc<CostLedger>,
    orchestrator: Arc<Orchestrator<InProcessBus>>,
    arbitrator: Arc<Arbitrator<InProcessBus>>,
}

async fn build_state(state_dir: &PathBuf, config: &Config) -> anyhow::Result<EngineState> {
    let bus = InProcessBus::spawn(
        Duration::from_secs(config.retention.agent_state_idle_ttl_secs),
        Duration::from_secs(30 * 60),
    );

    let store = Arc::new(TaskStore::new(state_dir.join("store"))?);

    let descriptors: Vec<ModelDescriptor> = config
        .backends
        .iter()
        .map(|b| ModelDescriptor {
            id: b.id.clone(),
            tier: b.tier,
            price_in_per_million: b.price_in,
            price_out_per_million: b.price_out,
            context_window: b.context_window,
            latency_class: coord_types::LatencyClass::Medium,
            capability_tags: Vec::new(),
            endpoint: b.endpoint.clone(),
        })
        .collect();

    let ledger = Arc::new(CostLedger::new(state_dir.join("ledger"), descriptors.clone(), config.budget.daily, config.budget.monthly)?);

    let router = Arc::new(ModelRouter::new(descriptors, config.router.overrides.arbitrator, config.router.overrides.orchestrator));

    let backends: Vec<Arc<dyn Backend>> = config
        .backends
        .iter()
        .map(|b| Arc::new(HttpBackend::new(b.id.clone(), b.endpoint.clone(), b.id.clone(), b.credential.clone())) as Arc<dyn Backend>)
        .collect();
    let client = Arc::new(InferenceClient::new(
        backends,
        ledger.clone(),
        config.breaker.failure_threshold,
        Duration::from_secs(config.breaker.reset_timeout_secs),
    ));

    let orchestrator_config = OrchestratorConfig {
        per_project_concurrency: config.task.concurrency.per_project,
        task_deadline: Duration::from_secs(config.task.deadline_secs),
        heartbeat_interval: Duration::from_secs(config.task.heartbeat_interval_secs),
        lock_ttl: Duration::from_secs(config.lock.default_ttl_secs),
        ..OrchestratorConfig::default()
    };

    let orchestrator = Arc::new(Orchestrator::new(
        bus.clone(),
        store.clone(),
        ledger.clone(),
        router.clone(),
        client.clone(),
        orchestrator_config,
        config.router.mode,
    ));

    let arbitrator = Arc::new(Arbitrator::new(bus.clone(), ledger.clone(), router, client, config.router.mode));

    Ok(EngineState { bus, store, ledger, orchestrator, arbitrator })
}
