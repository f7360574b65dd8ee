use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One request file dropped under `<ipc>/<group>/requests|tasks|messages/`.
///
/// `id` is only present on synchronous `requests/` calls — a response is
/// written back only when it is set. `tasks/` and `messages/` are
/// fire-and-forget and normally omit it.
#[derive(Debug, Clone, Deserialize)]
pub struct IpcRequest {
    #[serde(default)]
    pub id: Option<String>,
    pub action: String,
    #[serde(default)]
    pub params: Value,
}

/// Response written to `<ipc>/<group>/responses/<id>.json`.
#[derive(Debug, Clone, Serialize)]
pub struct IpcResponse {
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IpcResponse {
    pub fn ok(id: &str, result: Value) -> Self {
        Self { id: id.to_string(), ok: true, result: Some(result), error: None }
    }

    pub fn err(id: &str, error: impl Into<String>) -> Self {
        Self { id: id.to_string(), ok: false, result: None, error: Some(error.into()) }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("unauthorized: group '{group}' may not act on '{target}'")]
    Unauthorized { group: String, target: String },

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("memory error: {0}")]
    Memory(#[from] skynet_memory::MemoryError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] skynet_scheduler::SchedulerError),

    #[error("users error: {0}")]
    Users(#[from] skynet_users::UserError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
}
