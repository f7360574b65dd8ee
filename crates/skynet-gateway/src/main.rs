use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use rusqlite::Connection;
use tracing::{info, warn};

mod app;
mod auth;
mod http;
mod mcp_bridge;
mod mcp_lifecycle;
mod provider_setup;
mod stop;
mod update;
mod ws;

#[derive(Parser)]
#[command(name = "skynet-gateway", version = update::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run as an MCP stdio server for Claude Code (registered automatically
    /// when `claude-cli` is the active provider).
    McpBridge,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "skynet_gateway=info,tower_http=debug".into()),
        )
        .init();

    let config_path = std::env::var("SKYNET_CONFIG").ok();
    let config = skynet_core::config::SkynetConfig::load(config_path.as_deref())
        .unwrap_or_else(|e| {
            tracing::warn!("Config load failed ({}), using defaults", e);
            skynet_core::config::SkynetConfig::default()
        });

    let cli = Cli::parse();
    if matches!(cli.command, Some(Command::McpBridge)) {
        return mcp_bridge::run(&config);
    }

    mcp_lifecycle::ensure_mcp_registration(&config);

    let db_dir = Path::new(&config.database.path)
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&db_dir).ok();

    let agent_conn = open_db(&config.database.path)?;
    skynet_memory::db::init_db(&agent_conn)?;
    let memory = skynet_memory::manager::MemoryManager::new(agent_conn);

    let sessions_conn = open_db(&config.database.path)?;
    skynet_sessions::db::init_db(&sessions_conn)?;
    let sessions = skynet_sessions::SessionManager::new(sessions_conn);

    let users_conn = open_db(&config.database.path)?;
    skynet_users::db::init_db(&users_conn)?;
    let users = skynet_users::resolver::UserResolver::new(Arc::new(std::sync::Mutex::new(users_conn)));

    // `main` is a convention checked by string comparison wherever group
    // authorization matters (see skynet-ipc); it does not need a row here
    // until something actually registers members into it.
    let groups_conn = open_db(&config.database.path)?;
    let groups = Arc::new(skynet_users::GroupStore::new(groups_conn));

    let scheduler_conn = open_db(&config.database.path)?;
    let scheduler = skynet_scheduler::SchedulerHandle::new(scheduler_conn)?;

    // The engine owns a separate connection and polls independently of the
    // handle the HTTP/WS layer uses for task CRUD.
    let engine_conn = open_db(&config.database.path)?;
    let (fired_tx, mut fired_rx) = tokio::sync::mpsc::channel::<skynet_scheduler::Task>(64);
    let engine = skynet_scheduler::SchedulerEngine::new(engine_conn, Some(fired_tx), config.scheduler.clone())?;
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let ipc_shutdown_rx = shutdown_rx.clone();
    tokio::spawn(engine.run(shutdown_rx));
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(true);
    });

    let queue_conn = open_db(&config.database.path)?;
    skynet_queue::db::init_db(&queue_conn)?;
    let queue = skynet_queue::QueueStore::new(queue_conn);

    let router = provider_setup::build_router(&config)?;
    let prompt = skynet_agent::prompt::PromptBuilder::load(
        config.agent.soul_path.as_deref(),
        None,
    );
    let agent = skynet_agent::runtime::AgentRuntime::new(
        Box::new(router),
        prompt,
        config.agent.model.clone(),
    );

    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    let ipc_base_dir = PathBuf::from(home).join(".skynet/data/ipc");
    std::fs::create_dir_all(&ipc_base_dir).ok();
    let ipc_config_dir = PathBuf::from(&home).join(".skynet/config");

    let bind = config.gateway.bind.clone();
    let port = config.gateway.port;

    let state = Arc::new(app::AppState::new(
        config,
        agent,
        users,
        memory,
        sessions,
        scheduler,
        Arc::clone(&groups),
        queue,
        ipc_base_dir.clone(),
    ));
    let router = app::build_router(state.clone());

    // File-based IPC dispatcher (C8) — watches every group's request/task/
    // message directories under `ipc_base_dir` and dispatches to the same
    // in-process subsystems the WS/HTTP layers use.
    {
        let state = Arc::clone(&state);
        let poll_interval = std::time::Duration::from_millis(state.config.ipc.poll_interval_ms);
        tokio::spawn(skynet_ipc::run(
            state,
            groups,
            ipc_base_dir,
            ipc_config_dir,
            poll_interval,
            ipc_shutdown_rx,
        ));
    }

    // Route fired scheduled tasks through the shared pipeline (C7) and feed
    // the outcome back to the scheduler for retry/backoff/pause.
    {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            use skynet_agent::pipeline::process::enqueue_and_await;

            while let Some(task) = fired_rx.recv().await {
                let timeout_ms = state.config.sandbox.timeout_ms;
                let result = enqueue_and_await(
                    &state,
                    &task.chat_id,
                    &task.group_folder,
                    &task.prompt,
                    Vec::new(),
                    skynet_queue::Lane::Scheduled,
                    timeout_ms,
                )
                .await;

                let outcome = match &result {
                    Ok(processed) => skynet_scheduler::RunOutcome {
                        success: true,
                        result: Some(processed.content.clone()),
                        error: None,
                    },
                    Err(e) => {
                        warn!(task_id = %task.id, error = %e, "scheduled task delivery failed");
                        skynet_scheduler::RunOutcome {
                            success: false,
                            result: None,
                            error: Some(e.to_string()),
                        }
                    }
                };
                if let Err(e) = state.scheduler.complete_run(&task.id, outcome, &state.config.scheduler) {
                    warn!(task_id = %task.id, error = %e, "failed to record scheduled task outcome");
                }
            }
        });
    }

    let addr: SocketAddr = format!("{}:{}", bind, port).parse()?;
    info!("Skynet gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

/// Open a connection to the shared SQLite database, tuned for multiple
/// independent connections against the same file (one per subsystem).
fn open_db(path: &str) -> anyhow::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;")
        .map_err(|e| {
            warn!(path, error = %e, "failed to apply PRAGMAs");
            e
        })?;
    Ok(conn)
}
