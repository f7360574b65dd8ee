//! Action catalogue (C8): one arm per `action` name accepted from an
//! `IpcRequest`. Each handler is a thin translation from the request's
//! `params` JSON into a call against an existing subsystem — memory,
//! scheduler, groups, or the channel adapters reachable through
//! [`MessageContext`]. No business logic lives here beyond that translation.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use serde_json::{json, Value};
use skynet_agent::pipeline::MessageContext;
use skynet_memory::{MemoryCategory, MemorySource};
use skynet_users::GroupStore;

use crate::subagents::SubagentRegistry;
use crate::types::IpcError;

fn field<'a>(params: &'a Value, name: &'static str) -> Result<&'a Value, IpcError> {
    params.get(name).filter(|v| !v.is_null()).ok_or(IpcError::MissingField(name))
}

fn field_str<'a>(params: &'a Value, name: &'static str) -> Result<&'a str, IpcError> {
    field(params, name)?.as_str().ok_or(IpcError::InvalidField { field: name, reason: "expected string".into() })
}

/// Reject cross-group actions from anything but `main`.
///
/// `acting_group` is the namespace whose `requests/`/`tasks/`/`messages/`
/// directory the dispatcher is watching; `target_group`, if present in the
/// request's params, is the group the action actually operates on.
fn authorize(acting_group: &str, target_group: Option<&str>) -> Result<(), IpcError> {
    match target_group {
        Some(target) if target != acting_group && acting_group != skynet_core::types::GroupFolder::MAIN => {
            Err(IpcError::Unauthorized { group: acting_group.to_string(), target: target.to_string() })
        }
        _ => Ok(()),
    }
}

/// Writes one of the plain-JSON config artifacts described in the host's
/// external-interfaces contract (`config/model.json`, `config/tool-policy.json`,
/// `config/behavior.json`). These are separate from the TOML runtime config
/// the gateway loads at startup — IPC-driven overrides land here and take
/// effect on the next reload, they are not hot-applied to the running process.
fn write_config_artifact(config_dir: &Path, file: &str, value: &Value) -> Result<(), IpcError> {
    std::fs::create_dir_all(config_dir)?;
    let path = config_dir.join(file);
    let tmp = config_dir.join(format!("{file}.tmp"));
    std::fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
    std::fs::rename(&tmp, &path)?;
    Ok(())
}

fn read_config_artifact(config_dir: &Path, file: &str) -> Result<Value, IpcError> {
    let path = config_dir.join(file);
    match std::fs::read(&path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(json!({})),
        Err(e) => Err(e.into()),
    }
}

/// Dispatch one parsed request. `acting_group` is the watched namespace;
/// `config_dir` is `<home>/config` (sibling of the IPC base dir).
#[allow(clippy::too_many_lines)]
pub async fn dispatch<C: MessageContext + 'static>(
    ctx: &Arc<C>,
    groups: &GroupStore,
    subagents: &SubagentRegistry,
    config_dir: &Path,
    acting_group: &str,
    action: &str,
    params: &Value,
) -> Result<Value, IpcError> {
    match action {
        "memory_upsert" => {
            let user_id = field_str(params, "user_id")?;
            let category = MemoryCategory::from_str(field_str(params, "category")?)
                .map_err(|e| IpcError::InvalidField { field: "category", reason: e })?;
            let key = field_str(params, "key")?;
            let value = field_str(params, "value")?;
            let confidence = params.get("confidence").and_then(Value::as_f64).unwrap_or(1.0);
            let source = params
                .get("source")
                .and_then(Value::as_str)
                .map(MemorySource::from_str)
                .transpose()
                .map_err(|e| IpcError::InvalidField { field: "source", reason: e })?
                .unwrap_or(MemorySource::AdminSet);
            ctx.memory().learn(user_id, category, key, value, confidence, source)?;
            Ok(json!({ "stored": true }))
        }

        "memory_forget" => {
            let user_id = field_str(params, "user_id")?;
            let category = MemoryCategory::from_str(field_str(params, "category")?)
                .map_err(|e| IpcError::InvalidField { field: "category", reason: e })?;
            let key = field_str(params, "key")?;
            ctx.memory().forget(user_id, category, key)?;
            Ok(json!({ "forgotten": true }))
        }

        "memory_list" => {
            let user_id = field_str(params, "user_id")?;
            let memories = ctx.memory().list_all(user_id)?;
            Ok(json!({ "memories": memories }))
        }

        "memory_search" => {
            let user_id = field_str(params, "user_id")?;
            let query = field_str(params, "query")?;
            let limit = params.get("limit").and_then(Value::as_u64).unwrap_or(10) as usize;
            let results = ctx.memory().search(user_id, query, limit)?;
            Ok(json!({ "results": results }))
        }

        "memory_stats" => {
            let user_id = field_str(params, "user_id")?;
            let stats = ctx.memory().stats(user_id)?;
            Ok(serde_json::to_value(stats)?)
        }

        "schedule_task" => {
            let new_task: skynet_scheduler::NewTask = serde_json::from_value(params.clone())
                .map_err(|e| IpcError::InvalidField { field: "task", reason: e.to_string() })?;
            let task = ctx.scheduler().add_task(new_task)?;
            Ok(serde_json::to_value(task)?)
        }

        "pause_task" => {
            ctx.scheduler().pause_task(field_str(params, "id")?)?;
            Ok(json!({ "paused": true }))
        }

        "resume_task" => {
            ctx.scheduler().resume_task(field_str(params, "id")?)?;
            Ok(json!({ "resumed": true }))
        }

        "cancel_task" => {
            ctx.scheduler().cancel_task(field_str(params, "id")?)?;
            Ok(json!({ "cancelled": true }))
        }

        "run_task" => {
            ctx.scheduler().run_task_now(field_str(params, "id")?)?;
            Ok(json!({ "queued": true }))
        }

        "set_model" => {
            authorize(acting_group, params.get("group").and_then(Value::as_str))?;
            write_config_artifact(config_dir, "model.json", params)?;
            Ok(json!({ "updated": true }))
        }

        "set_tool_policy" => {
            authorize(acting_group, params.get("group").and_then(Value::as_str))?;
            write_config_artifact(config_dir, "tool-policy.json", params)?;
            Ok(json!({ "updated": true }))
        }

        "set_behavior" => {
            authorize(acting_group, params.get("group").and_then(Value::as_str))?;
            write_config_artifact(config_dir, "behavior.json", params)?;
            Ok(json!({ "updated": true }))
        }

        "get_config" => {
            let model = read_config_artifact(config_dir, "model.json")?;
            let tool_policy = read_config_artifact(config_dir, "tool-policy.json")?;
            let behavior = read_config_artifact(config_dir, "behavior.json")?;
            Ok(json!({
                "gateway_port": ctx.gateway_port(),
                "database_path": ctx.database_path(),
                "model": model,
                "tool_policy": tool_policy,
                "behavior": behavior,
            }))
        }

        "register_group" => {
            let folder = field_str(params, "folder")?;
            authorize(acting_group, Some(folder))?;
            let display_name = params.get("display_name").and_then(Value::as_str).unwrap_or(folder);
            // `created_by` must be an existing user id — `groups.created_by`
            // carries a foreign key into `users`, so this can't be synthesized.
            let created_by = field_str(params, "created_by")?;
            let group = groups.create_group(folder, display_name, created_by)?;
            Ok(serde_json::to_value(group)?)
        }

        "remove_group" => {
            let folder = field_str(params, "folder")?;
            authorize(acting_group, Some(folder))?;
            groups.remove_group(folder)?;
            Ok(json!({ "removed": true }))
        }

        "list_groups" => {
            let all = groups.list_groups()?;
            Ok(json!({ "groups": all }))
        }

        "edit_message" | "delete_message" => {
            // Channel adapters expose a single outbound send path
            // (`ChannelOutbound`) with no edit/delete semantics — this is a
            // best-effort re-send, not a true in-place edit or deletion.
            let channel = field_str(params, "channel")?;
            let recipient = field_str(params, "recipient")?;
            let message = params.get("message").and_then(Value::as_str).unwrap_or("");
            ctx.send_to_channel(channel, recipient, message)
                .map_err(|e| IpcError::InvalidField { field: "channel", reason: e })?;
            Ok(json!({ "sent": true }))
        }

        "spawn_subagent" => {
            let prompt = field_str(params, "prompt")?;
            let chat_id = format!("subagent:{acting_group}:{}", uuid::Uuid::new_v4());
            let id = subagents.spawn(Arc::clone(ctx), chat_id, prompt.to_string());
            Ok(json!({ "subagent_id": id }))
        }

        "subagent_status" => {
            let id = field_str(params, "subagent_id")?;
            Ok(json!({ "status": subagents.status(id) }))
        }

        "subagent_result" => {
            let id = field_str(params, "subagent_id")?;
            Ok(json!({ "result": subagents.result(id) }))
        }

        other => Err(IpcError::UnknownAction(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn main_group_may_act_cross_group() {
        assert!(authorize("main", Some("team-2")).is_ok());
    }

    #[test]
    fn non_main_group_is_confined_to_itself() {
        assert!(authorize("team-2", Some("team-2")).is_ok());
        assert!(authorize("team-2", Some("team-3")).is_err());
    }

    #[test]
    fn authorize_ignores_absent_target() {
        assert!(authorize("team-2", None).is_ok());
    }

    #[test]
    fn config_artifact_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let value = json!({ "model": "claude-sonnet" });
        write_config_artifact(dir.path(), "model.json", &value).unwrap();
        let read_back = read_config_artifact(dir.path(), "model.json").unwrap();
        assert_eq!(read_back, value);
    }

    #[test]
    fn missing_config_artifact_reads_as_empty_object() {
        let dir = tempfile::tempdir().unwrap();
        let read_back = read_config_artifact(dir.path(), "behavior.json").unwrap();
        assert_eq!(read_back, json!({}));
    }
}
