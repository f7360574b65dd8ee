//! File-based IPC dispatcher (C8).
//!
//! Watches `<ipc>/<group>/{requests,tasks,messages}/` for every group
//! directory under the IPC base dir. `requests/` is synchronous (a response
//! is written to `<ipc>/<group>/responses/<id>.json`); `tasks/` and
//! `messages/` are fire-and-forget. Unreadable or unauthorized files are
//! moved to `<ipc>/errors/` rather than silently dropped.
//!
//! Grounded on `skynet-agent/src/sandbox.rs`'s `write_atomic` (write-temp +
//! rename) and poll-loop pattern, generalised from one sandbox's request/
//! response pair into a whole-tree multi-group watcher. A real filesystem
//! watch (inotify via `notify`) would avoid the poll latency but the spec's
//! own contract treats polling as an acceptable fallback, so this pass only
//! implements that fallback path.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use skynet_agent::pipeline::MessageContext;
use skynet_users::GroupStore;
use tracing::{debug, warn};

use crate::actions::dispatch;
use crate::subagents::SubagentRegistry;
use crate::types::{IpcRequest, IpcResponse};

const WATCHED_DIRS: [&str; 3] = ["requests", "tasks", "messages"];

/// Runs forever (or until `shutdown` fires), polling every `poll_interval`.
pub async fn run<C: MessageContext + 'static>(
    ctx: Arc<C>,
    groups: Arc<GroupStore>,
    ipc_base_dir: PathBuf,
    config_dir: PathBuf,
    poll_interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let subagents = SubagentRegistry::new();
    std::fs::create_dir_all(&ipc_base_dir).ok();

    loop {
        if let Err(e) = poll_once(&ctx, &groups, &subagents, &ipc_base_dir, &config_dir).await {
            warn!(error = %e, "ipc dispatcher poll failed");
        }

        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("ipc dispatcher shutting down");
                    return;
                }
            }
        }
    }
}

async fn poll_once<C: MessageContext + 'static>(
    ctx: &Arc<C>,
    groups: &GroupStore,
    subagents: &SubagentRegistry,
    ipc_base_dir: &Path,
    config_dir: &Path,
) -> std::io::Result<()> {
    let mut group_dirs = tokio::fs::read_dir(ipc_base_dir).await?;
    while let Some(entry) = group_dirs.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        let group_name = entry.file_name().to_string_lossy().to_string();
        if group_name == "errors" {
            continue;
        }
        let group_path = entry.path();

        for kind in WATCHED_DIRS {
            let dir = group_path.join(kind);
            if !dir.is_dir() {
                continue;
            }
            process_dir(ctx, groups, subagents, ipc_base_dir, config_dir, &group_name, &group_path, &dir, kind)
                .await;
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn process_dir<C: MessageContext + 'static>(
    ctx: &Arc<C>,
    groups: &GroupStore,
    subagents: &SubagentRegistry,
    ipc_base_dir: &Path,
    config_dir: &Path,
    group_name: &str,
    group_path: &Path,
    dir: &Path,
    kind: &str,
) {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else { return };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }

        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) => {
                warn!(?path, error = %e, "failed to read ipc request file");
                route_to_error(ipc_base_dir, &path).await;
                continue;
            }
        };

        let req: IpcRequest = match serde_json::from_str(&contents) {
            Ok(r) => r,
            Err(e) => {
                warn!(?path, error = %e, "malformed ipc request file");
                route_to_error(ipc_base_dir, &path).await;
                continue;
            }
        };

        debug!(group = group_name, action = %req.action, kind, "dispatching ipc request");

        let outcome = dispatch(ctx, groups, subagents, config_dir, group_name, &req.action, &req.params).await;

        // requests/ always gets a response file when the caller supplied an
        // id; tasks/ and messages/ are fire-and-forget regardless.
        if kind == "requests" {
            if let Some(id) = &req.id {
                let response = match &outcome {
                    Ok(result) => IpcResponse::ok(id, result.clone()),
                    Err(e) => IpcResponse::err(id, e.to_string()),
                };
                write_response(group_path, &response);
            }
        } else if let Err(e) = &outcome {
            warn!(group = group_name, action = %req.action, error = %e, "fire-and-forget ipc action failed");
        }

        let _ = tokio::fs::remove_file(&path).await;
    }
}

fn write_response(group_path: &Path, response: &IpcResponse) {
    let dir = group_path.join("responses");
    if let Err(e) = skynet_agent::sandbox::write_atomic(&dir, &response.id, response) {
        warn!(id = %response.id, error = %e, "failed to write ipc response");
    }
}

async fn route_to_error(ipc_base_dir: &Path, path: &Path) {
    let errors_dir = ipc_base_dir.join("errors");
    if tokio::fs::create_dir_all(&errors_dir).await.is_err() {
        return;
    }
    if let Some(name) = path.file_name() {
        let dest = errors_dir.join(name);
        let _ = tokio::fs::rename(path, dest).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn route_to_error_moves_file_into_errors_dir() {
        let base = tempfile::tempdir().unwrap();
        let bad_file = base.path().join("malformed.json");
        tokio::fs::write(&bad_file, b"not json").await.unwrap();

        route_to_error(base.path(), &bad_file).await;

        assert!(!bad_file.exists());
        assert!(base.path().join("errors").join("malformed.json").exists());
    }

    #[test]
    fn write_response_creates_atomic_response_file() {
        let base = tempfile::tempdir().unwrap();
        let response = IpcResponse::ok("req-1", serde_json::json!({ "stored": true }));

        write_response(base.path(), &response);

        let path = base.path().join("responses").join("req-1.json");
        assert!(path.exists());
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("\"ok\""));
        assert!(contents.contains("req-1"));
    }
}
