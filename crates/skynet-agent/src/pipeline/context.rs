//! Shared context interface for all channel adapters.
//!
//! `MessageContext` is the single trait every channel host (gateway, discord,
//! telegram) must implement. It keeps the pipeline crate channel-agnostic and
//! lets it dispatch turns into the sandbox orchestrator (C5) without knowing
//! which platform originated the message.

use std::sync::Arc;

use skynet_core::config::{QueueConfig, SandboxConfig};
use skynet_memory::manager::MemoryManager;
use skynet_queue::QueueStore;
use skynet_scheduler::SchedulerHandle;
use skynet_sessions::SessionManager;
use skynet_users::resolver::UserResolver;

use crate::lanes::LaneSemaphore;
use crate::pipeline::process::DrainCoordinator;
use crate::runtime::AgentRuntime;

/// Minimal context interface required by the shared message pipeline.
///
/// Implemented by `AppState` in `skynet-gateway` and any future channel host.
/// Defined here (in `skynet-agent`) to avoid a circular dependency: every
/// channel crate depends on `skynet-agent`, never the other way around.
pub trait MessageContext: Send + Sync {
    fn agent(&self) -> &AgentRuntime;
    fn memory(&self) -> &MemoryManager;
    fn queue(&self) -> &QueueStore;
    fn lanes(&self) -> &LaneSemaphore;
    fn scheduler(&self) -> &SchedulerHandle;
    fn users(&self) -> &UserResolver;
    fn sandbox_config(&self) -> &SandboxConfig;

    /// Group-keyed agent session continuity tokens (distinct from
    /// `skynet-sessions`' per-user stats tracking by the same name).
    fn sessions(&self) -> &SessionManager;

    /// Batch-window and admission limits for [`crate::pipeline::process`]'s
    /// claim loop.
    fn queue_config(&self) -> &QueueConfig;

    /// The per-chat drain coordinator (C7) — ensures at most one drain loop
    /// runs per chat regardless of which channel enqueues into it.
    fn drains(&self) -> &Arc<DrainCoordinator>;

    /// Names of channel adapters currently connected (for cross-channel sends).
    fn connected_channels(&self) -> Vec<String>;

    /// Deliver `message` to `recipient` on `channel`, used by the IPC
    /// dispatcher's `edit_message`/cross-channel send actions.
    fn send_to_channel(&self, channel: &str, recipient: &str, message: &str) -> Result<(), String>;

    fn gateway_port(&self) -> Option<u16> {
        None
    }

    fn database_path(&self) -> Option<&str> {
        None
    }

    /// Absolute path to the per-group IPC namespace root
    /// (`<home>/data/ipc` per spec §6).
    fn ipc_base_dir(&self) -> &std::path::Path;
}
