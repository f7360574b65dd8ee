//! Sandbox orchestrator (C5) — runs agent turns inside an isolated process
//! whose only channel to the host is a controlled filesystem/stdio surface.
//!
//! Two modes, selected by [`skynet_core::config::SandboxConfig::mode`]:
//! - **Ephemeral**: one subprocess per request; stdin carries one JSON
//!   [`SandboxRequest`], stdout carries free-form logs plus the response
//!   wrapped between `---DOTCLAW_OUTPUT_START---` / `---DOTCLAW_OUTPUT_END---`.
//! - **Daemon**: one long-lived subprocess per group; requests and responses
//!   are exchanged as atomically-written JSON files, and the daemon proves
//!   liveness with a heartbeat file touched at least once a second.
//!
//! Grounded on `claude_cli.rs`'s subprocess-spawn-with-stdin pattern,
//! generalised from a one-shot `LlmProvider` call into the full request/
//! response envelope the spec's sandbox contract requires.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

const OUTPUT_START: &str = "---DOTCLAW_OUTPUT_START---";
const OUTPUT_END: &str = "---DOTCLAW_OUTPUT_END---";

/// One tool invocation performed by the sandbox during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallOutcome {
    pub name: String,
    pub ok: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// Request record sent to the sandbox — identical shape for both modes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub memory_recall: Value,
    #[serde(default)]
    pub user_profile: Value,
    #[serde(default)]
    pub tool_policy: Value,
    #[serde(default)]
    pub behavior: Value,
    pub model: String,
    #[serde(default)]
    pub context_window: Option<u32>,
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub channel_metadata: Value,
    pub max_tool_steps: u32,
    pub timeout_ms: u64,
    pub trace_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Ok,
    Error,
}

/// Response record read back from the sandbox — identical shape for both modes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxResponse {
    pub status: SandboxStatus,
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub new_session_id: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallOutcome>,
    pub model: String,
    pub latency_ms: u64,
    #[serde(default)]
    pub memory_summary: Option<String>,
    #[serde(default)]
    pub prompt_pack_versions: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("sandbox process error: {0}")]
    Process(String),

    #[error("sandbox timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("sandbox response malformed: {0}")]
    Malformed(String),

    #[error("run was cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Run one request in ephemeral mode: spawn `command`, write the request to
/// stdin as JSON, and extract the delimited response block from stdout.
/// Anything outside the markers is treated as diagnostic log output.
pub async fn run_ephemeral(
    command: &str,
    args: &[String],
    req: &SandboxRequest,
    cancel: tokio_util::sync::CancellationToken,
) -> Result<SandboxResponse, SandboxError> {
    let start = Instant::now();
    let payload = serde_json::to_vec(req).map_err(|e| SandboxError::Malformed(e.to_string()))?;

    let mut cmd = Command::new(command);
    cmd.args(args)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| SandboxError::Process(format!("failed to spawn '{command}': {e}")))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(&payload).await?;
    }

    let wait = async {
        let mut stdout = String::new();
        if let Some(mut out) = child.stdout.take() {
            out.read_to_string(&mut stdout).await?;
        }
        let status = child.wait().await?;
        Ok::<_, std::io::Error>((status, stdout))
    };

    let timeout = Duration::from_millis(req.timeout_ms);
    let (status, stdout) = tokio::select! {
        res = tokio::time::timeout(timeout, wait) => match res {
            Ok(inner) => inner?,
            Err(_) => return Err(SandboxError::Timeout { ms: req.timeout_ms }),
        },
        _ = cancel.cancelled() => {
            let _ = child.start_kill();
            return Err(SandboxError::Cancelled);
        }
    };

    if !status.success() {
        warn!(trace_id = %req.trace_id, "ephemeral sandbox exited non-zero");
    }

    let block = extract_between(&stdout, OUTPUT_START, OUTPUT_END)
        .ok_or_else(|| SandboxError::Malformed("no sentinel-delimited output block found".into()))?;

    let mut response: SandboxResponse =
        serde_json::from_str(block).map_err(|e| SandboxError::Malformed(e.to_string()))?;
    response.latency_ms = start.elapsed().as_millis() as u64;
    Ok(response)
}

fn extract_between<'a>(haystack: &'a str, start: &str, end: &str) -> Option<&'a str> {
    let s = haystack.find(start)? + start.len();
    let e = haystack[s..].find(end)? + s;
    Some(haystack[s..e].trim())
}

/// Write `value` to `<dir>/<id>.json` atomically (write-temp then rename).
pub fn write_atomic(dir: &Path, id: &str, value: &impl Serialize) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let tmp = dir.join(format!("{id}.json.tmp"));
    let target = dir.join(format!("{id}.json"));
    let json = serde_json::to_vec_pretty(value)?;
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, &target)?;
    Ok(())
}

/// Daemon mode: submit a request via `<ipc>/<group>/agent_requests/<id>.json`
/// and poll `<ipc>/<group>/agent_responses/<id>.json` until it appears, the
/// deadline elapses, or `cancel` fires.
pub async fn run_daemon(
    ipc_base: &Path,
    group: &str,
    req: &SandboxRequest,
    poll_interval: Duration,
    cancel: tokio_util::sync::CancellationToken,
) -> Result<SandboxResponse, SandboxError> {
    let group_dir = ipc_base.join(group);
    let id = Uuid::now_v7().to_string();
    write_atomic(&group_dir.join("agent_requests"), &id, req)?;

    let response_path = group_dir.join("agent_responses").join(format!("{id}.json"));
    let deadline = Instant::now() + Duration::from_millis(req.timeout_ms);

    loop {
        if response_path.exists() {
            let contents = tokio::fs::read_to_string(&response_path).await?;
            let _ = tokio::fs::remove_file(&response_path).await;
            let response: SandboxResponse =
                serde_json::from_str(&contents).map_err(|e| SandboxError::Malformed(e.to_string()))?;
            return Ok(response);
        }
        if Instant::now() >= deadline {
            return Err(SandboxError::Timeout { ms: req.timeout_ms });
        }
        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = cancel.cancelled() => return Err(SandboxError::Cancelled),
        }
    }
}

/// Tracks heartbeat liveness for each group's daemon sandbox.
pub struct DaemonLiveness {
    last_heartbeat: Mutex<HashMap<String, chrono::DateTime<chrono::Utc>>>,
    /// Set once a wake-from-sleep jump is detected; suppresses kills for a
    /// grace window and widens the heartbeat tolerance.
    suspended_until: Mutex<Option<chrono::DateTime<chrono::Utc>>>,
}

impl DaemonLiveness {
    pub fn new() -> Self {
        Self {
            last_heartbeat: Mutex::new(HashMap::new()),
            suspended_until: Mutex::new(None),
        }
    }

    /// Read `<ipc>/<group>/heartbeat`'s mtime and record it for `group`.
    pub fn observe(&self, ipc_base: &Path, group: &str) {
        let path = ipc_base.join(group).join("heartbeat");
        if let Ok(meta) = std::fs::metadata(&path) {
            if let Ok(modified) = meta.modified() {
                let ts: chrono::DateTime<chrono::Utc> = modified.into();
                self.last_heartbeat.lock().unwrap().insert(group.to_string(), ts);
            }
        }
    }

    /// Declare all daemons healthy and suspend liveness enforcement for
    /// `grace_ms` — called when a wall-clock jump (sleep/wake) is detected.
    pub fn mark_wake_recovery(&self, grace_ms: u64) {
        *self.suspended_until.lock().unwrap() =
            Some(chrono::Utc::now() + chrono::Duration::milliseconds(grace_ms as i64));
        info!("daemon liveness checks suspended after wake-recovery");
    }

    /// Whether `group`'s daemon should be considered unhealthy and killed
    /// on next acquire.
    pub fn is_unhealthy(&self, group: &str, grace_ms: u64) -> bool {
        if let Some(until) = *self.suspended_until.lock().unwrap() {
            if chrono::Utc::now() < until {
                return false;
            }
        }
        let last = self.last_heartbeat.lock().unwrap().get(group).copied();
        match last {
            Some(ts) => {
                let age_ms = chrono::Utc::now().signed_duration_since(ts).num_milliseconds();
                age_ms > grace_ms as i64
            }
            None => false,
        }
    }
}

impl Default for DaemonLiveness {
    fn default() -> Self {
        Self::new()
    }
}

/// Wall-clock jump detector: compares successive polls of `Instant`/`SystemTime`
/// and flags a suspend/resume when the gap exceeds `threshold_ms` beyond the
/// expected poll interval.
pub struct WakeDetector {
    last_seen: Mutex<chrono::DateTime<chrono::Utc>>,
}

impl WakeDetector {
    pub fn new() -> Self {
        Self { last_seen: Mutex::new(chrono::Utc::now()) }
    }

    /// Call on every scheduler/heartbeat tick. Returns `true` the first time
    /// a jump greater than `threshold_ms` is observed since the last call.
    pub fn tick(&self, threshold_ms: u64) -> bool {
        let now = chrono::Utc::now();
        let mut last = self.last_seen.lock().unwrap();
        let gap_ms = now.signed_duration_since(*last).num_milliseconds();
        *last = now;
        gap_ms > threshold_ms as i64
    }
}

impl Default for WakeDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_sentinel_delimited_block() {
        let stdout = format!(
            "some log line\n{OUTPUT_START}\n{{\"status\":\"ok\"}}\n{OUTPUT_END}\nmore logs"
        );
        let block = extract_between(&stdout, OUTPUT_START, OUTPUT_END).unwrap();
        assert_eq!(block, "{\"status\":\"ok\"}");
    }

    #[test]
    fn missing_sentinels_returns_none() {
        assert!(extract_between("no markers here", OUTPUT_START, OUTPUT_END).is_none());
    }

    #[test]
    fn wake_detector_flags_large_gap() {
        let detector = WakeDetector::new();
        assert!(!detector.tick(20_000));
        {
            let mut last = detector.last_seen.lock().unwrap();
            *last = *last - chrono::Duration::seconds(30);
        }
        assert!(detector.tick(20_000));
    }

    #[test]
    fn daemon_liveness_unknown_group_is_healthy() {
        let liveness = DaemonLiveness::new();
        assert!(!liveness.is_unhealthy("unknown-group", 5_000));
    }

    #[tokio::test]
    async fn write_atomic_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        #[derive(Serialize, Deserialize)]
        struct Payload {
            value: u32,
        }
        write_atomic(dir.path(), "req1", &Payload { value: 42 }).unwrap();
        let contents = tokio::fs::read_to_string(dir.path().join("req1.json")).await.unwrap();
        assert!(contents.contains("42"));
    }
}
