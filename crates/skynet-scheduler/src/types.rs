use serde::{Deserialize, Serialize};

/// How `schedule_value` on a [`Task`] should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    /// `schedule_value` is a cron expression (5-field Unix or 6/7-field
    /// quartz-style — see [`crate::schedule::compute_next_run`]).
    Cron,
    /// `schedule_value` is a whole number of milliseconds between runs.
    Interval,
    /// `schedule_value` is an RFC3339 instant; the task fires once and
    /// transitions to [`TaskStatus::Completed`].
    Once,
}

impl std::fmt::Display for ScheduleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ScheduleType::Cron => "cron",
            ScheduleType::Interval => "interval",
            ScheduleType::Once => "once",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ScheduleType {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "cron" => Ok(ScheduleType::Cron),
            "interval" => Ok(ScheduleType::Interval),
            "once" => Ok(ScheduleType::Once),
            other => Err(format!("unknown schedule_type: {other}")),
        }
    }
}

/// Whether a fired run shares the target group's ongoing agent session or
/// starts a throwaway context of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextMode {
    /// Resolve and persist back the group's session token like any other
    /// chat turn — the run shows up as part of the group's conversation.
    Group,
    /// Run with a fresh, unpersisted context every time. Used for tasks
    /// that shouldn't pollute or depend on the group's running context.
    Isolated,
}

impl std::fmt::Display for ContextMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContextMode::Group => "group",
            ContextMode::Isolated => "isolated",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ContextMode {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "group" => Ok(ContextMode::Group),
            "isolated" => Ok(ContextMode::Isolated),
            other => Err(format!("unknown context_mode: {other}")),
        }
    }
}

/// Lifecycle state of a scheduled task.
///
/// Allowed transitions: `active` <-> `paused`, `active` -> `completed`,
/// any state -> `deleted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Active,
    Paused,
    Completed,
    Deleted,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Active => "active",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Deleted => "deleted",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(TaskStatus::Active),
            "paused" => Ok(TaskStatus::Paused),
            "completed" => Ok(TaskStatus::Completed),
            "deleted" => Ok(TaskStatus::Deleted),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// A persisted scheduled task (C6).
///
/// `running_since` is a lease: a task claimed by [`crate::engine::SchedulerEngine::tick`]
/// has `running_since` set to the claiming instant, and is eligible to be
/// re-claimed by a later tick once that timestamp is older than the
/// configured stale-lease threshold (handles a crash mid-run).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// UUID v4 string — primary key.
    pub id: String,
    /// The group (workspace) this task's runs are dispatched into.
    pub group_folder: String,
    /// Synthetic chat id the run is enqueued under, e.g. `scheduler:<id>`.
    pub chat_id: String,
    /// The prompt sent to the agent on each fire.
    pub prompt: String,
    pub schedule_type: ScheduleType,
    /// Cron expression, millisecond interval, or RFC3339 instant, per `schedule_type`.
    pub schedule_value: String,
    /// IANA timezone name the cron expression is interpreted in. `None`
    /// falls back to the host's local timezone.
    pub timezone: Option<String>,
    pub context_mode: ContextMode,
    /// ISO-8601 timestamp of the next planned execution, if any.
    pub next_run: Option<String>,
    /// ISO-8601 timestamp of the most recent execution start, if any.
    pub last_run: Option<String>,
    /// Truncated result text from the most recent run (see `run_log` for
    /// the untruncated history).
    pub last_result: Option<String>,
    /// Consecutive failures since the last success. Reset on success; the
    /// task is paused once this reaches `task_max_retries`.
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Set while claimed by a tick; cleared when the run finishes.
    pub running_since: Option<String>,
    pub status: TaskStatus,
    pub created_at: String,
    pub updated_at: String,
}

/// A single row in the `run_log` table, recorded after every claimed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLogEntry {
    pub id: i64,
    pub task_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub duration_ms: i64,
    pub status: String,
    pub result: Option<String>,
    pub error: Option<String>,
}

/// Parameters accepted when creating a new task — mirrors the columns a
/// caller (WS `cron.add`, the IPC `schedule_task` action) actually supplies;
/// the rest (`id`, timestamps, lease/retry state) are server-assigned.
#[derive(Debug, Clone, Deserialize)]
pub struct NewTask {
    pub group_folder: String,
    pub prompt: String,
    pub schedule_type: ScheduleType,
    pub schedule_value: String,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub context_mode: Option<ContextMode>,
}
