use axum::{
    routing::{get, post},
    Router,
};
use dashmap::DashMap;
use skynet_agent::lanes::LaneSemaphore;
use skynet_agent::pipeline::DrainCoordinator;
use skynet_agent::runtime::AgentRuntime;
use skynet_core::config::SkynetConfig;
use skynet_core::types::ChannelOutbound;
use skynet_memory::manager::MemoryManager;
use skynet_queue::QueueStore;
use skynet_scheduler::SchedulerHandle;
use skynet_sessions::SessionManager;
use skynet_users::resolver::UserResolver;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::mpsc;

use crate::ws::broadcast::EventBroadcaster;

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: SkynetConfig,
    pub event_seq: AtomicU64,
    #[allow(dead_code)]
    pub presence_version: AtomicU64,
    pub broadcaster: EventBroadcaster,
    pub agent: AgentRuntime,
    pub users: UserResolver,
    pub memory: MemoryManager,
    pub sessions: SessionManager,
    pub scheduler: SchedulerHandle,
    /// Workspace/group registry — backs group CRUD over WS and the IPC
    /// dispatcher's `register_group`/`remove_group`/`list_groups` actions.
    pub groups: Arc<skynet_users::GroupStore>,
    /// Durable inbound message queue (C1) — backs the drain/batch pipeline (C7).
    pub queue: QueueStore,
    /// Bounded interactive/scheduled/maintenance worker pool (C4).
    pub lanes: LaneSemaphore,
    /// Ensures at most one drain loop runs per chat at a time.
    pub drains: Arc<DrainCoordinator>,
    /// Root of the per-group IPC namespace (`<home>/data/ipc`).
    pub ipc_base_dir: std::path::PathBuf,
    /// Active WS connections: conn_id -> message sender.
    pub ws_clients: DashMap<String, mpsc::Sender<String>>,
    /// Notification queue for HTTP/terminal clients: session_key -> pending messages.
    /// Drained by `GET /notifications`.
    pub notifications: DashMap<String, Vec<String>>,
    /// Outbound channel senders for cross-channel messaging.
    /// Key: channel name (e.g. "discord"), Value: sender for `ChannelOutbound` messages.
    pub channel_senders: DashMap<String, mpsc::Sender<ChannelOutbound>>,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SkynetConfig,
        agent: AgentRuntime,
        users: UserResolver,
        memory: MemoryManager,
        sessions: SessionManager,
        scheduler: SchedulerHandle,
        groups: Arc<skynet_users::GroupStore>,
        queue: QueueStore,
        ipc_base_dir: std::path::PathBuf,
    ) -> Self {
        let lanes = LaneSemaphore::new(
            config.lanes.pool_size,
            config.lanes.starvation_ms,
            config.lanes.max_consecutive_interactive,
        );
        Self {
            config,
            event_seq: AtomicU64::new(0),
            presence_version: AtomicU64::new(0),
            broadcaster: EventBroadcaster::new(),
            agent,
            users,
            memory,
            sessions,
            scheduler,
            groups,
            queue,
            lanes,
            drains: Arc::new(DrainCoordinator::new()),
            ipc_base_dir,
            ws_clients: DashMap::new(),
            notifications: DashMap::new(),
            channel_senders: DashMap::new(),
        }
    }

    /// Monotonically increasing sequence for broadcast events.
    pub fn next_seq(&self) -> u64 {
        self.event_seq.fetch_add(1, Ordering::Relaxed)
    }
}

impl skynet_agent::pipeline::MessageContext for AppState {
    fn agent(&self) -> &skynet_agent::runtime::AgentRuntime {
        &self.agent
    }

    fn memory(&self) -> &skynet_memory::manager::MemoryManager {
        &self.memory
    }

    fn queue(&self) -> &skynet_queue::QueueStore {
        &self.queue
    }

    fn lanes(&self) -> &skynet_agent::lanes::LaneSemaphore {
        &self.lanes
    }

    fn scheduler(&self) -> &skynet_scheduler::SchedulerHandle {
        &self.scheduler
    }

    fn users(&self) -> &skynet_users::resolver::UserResolver {
        &self.users
    }

    fn sandbox_config(&self) -> &skynet_core::config::SandboxConfig {
        &self.config.sandbox
    }

    fn sessions(&self) -> &skynet_sessions::SessionManager {
        &self.sessions
    }

    fn queue_config(&self) -> &skynet_core::config::QueueConfig {
        &self.config.queue
    }

    fn drains(&self) -> &Arc<skynet_agent::pipeline::DrainCoordinator> {
        &self.drains
    }

    fn ipc_base_dir(&self) -> &std::path::Path {
        &self.ipc_base_dir
    }

    fn connected_channels(&self) -> Vec<String> {
        self.channel_senders
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    fn send_to_channel(&self, channel: &str, recipient: &str, message: &str) -> Result<(), String> {
        let sender = self
            .channel_senders
            .get(channel)
            .ok_or_else(|| format!("channel '{}' is not connected", channel))?;
        sender
            .try_send(ChannelOutbound {
                recipient: recipient.to_string(),
                message: message.to_string(),
            })
            .map_err(|e| format!("failed to send to '{}': {}", channel, e))
    }

    fn gateway_port(&self) -> Option<u16> {
        Some(self.config.gateway.port)
    }

    fn database_path(&self) -> Option<&str> {
        Some(&self.config.database.path)
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(crate::http::ui::ui_handler))
        .route("/health", get(crate::http::health::health_handler))
        .route("/chat", post(crate::http::chat::chat_handler))
        .route(
            "/notifications",
            get(crate::http::notifications::notifications_handler),
        )
        .route("/ws", get(crate::ws::connection::ws_handler))
        .route(
            "/v1/chat/completions",
            post(crate::http::openai_compat::chat_completions),
        )
        .route(
            "/webhooks/{source}",
            post(crate::http::webhooks::webhook_handler),
        )
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
