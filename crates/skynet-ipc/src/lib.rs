//! `skynet-ipc` — file-based IPC dispatcher (C8).
//!
//! Agents and external tools drop JSON files under a group's
//! `<ipc>/<group>/{requests,tasks,messages}/` directories; this crate
//! watches every such directory, authorizes the request (non-`main` groups
//! may only act on their own namespace), dispatches it to the matching
//! in-process subsystem (memory, scheduler, groups, channel adapters), and
//! writes an atomic response for synchronous `requests/` calls.

pub mod actions;
pub mod dispatcher;
pub mod subagents;
pub mod types;

pub use dispatcher::run;
pub use subagents::SubagentRegistry;
pub use types::{IpcError, IpcRequest, IpcResponse};
