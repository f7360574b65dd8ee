use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::Connection;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    db::init_db,
    error::{Result, SchedulerError},
    schedule::{compute_next_run, validate_schedule},
    types::{ContextMode, NewTask, RunLogEntry, ScheduleType, Task, TaskStatus},
};

/// Reject a schedule at creation time rather than letting it sit forever
/// with no `next_run`.
fn check_schedule(schedule_type: ScheduleType, value: &str) -> Result<()> {
    validate_schedule(schedule_type, value).map_err(SchedulerError::InvalidSchedule)
}

/// Exponential backoff for a failed task, capped at `retry_max_ms`.
fn backoff_ms(cfg: &skynet_core::config::SchedulerConfig, retry_count: u32) -> u64 {
    let multiplier = 2u64.checked_pow(retry_count.min(32)).unwrap_or(u64::MAX);
    cfg.retry_base_ms.saturating_mul(multiplier).min(cfg.retry_max_ms)
}

/// Truncate result/error text kept on the task row and in `run_log`.
const MAX_RESULT_CHARS: usize = 4_000;

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        s
    } else {
        &s[..max]
    }
}

/// Outcome of a dispatched run, reported back by whoever awaited the
/// agent's reply (the gateway's fired-task forwarder).
pub struct RunOutcome {
    pub success: bool,
    pub result: Option<String>,
    pub error: Option<String>,
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let schedule_type_str: String = row.get(4)?;
    let context_mode_str: String = row.get(7)?;
    let status_str: String = row.get(14)?;
    Ok(Task {
        id: row.get(0)?,
        group_folder: row.get(1)?,
        chat_id: row.get(2)?,
        prompt: row.get(3)?,
        schedule_type: schedule_type_str.parse().unwrap_or(ScheduleType::Once),
        schedule_value: row.get(5)?,
        timezone: row.get(6)?,
        context_mode: context_mode_str.parse().unwrap_or(ContextMode::Group),
        next_run: row.get(8)?,
        last_run: row.get(9)?,
        last_result: row.get(10)?,
        retry_count: row.get(11)?,
        last_error: row.get(12)?,
        running_since: row.get(13)?,
        status: status_str.parse().unwrap_or(TaskStatus::Active),
        created_at: row.get(15)?,
        updated_at: row.get(16)?,
    })
}

const TASK_COLUMNS: &str = "id, group_folder, chat_id, prompt, schedule_type, schedule_value,
     timezone, context_mode, next_run, last_run, last_result, retry_count,
     last_error, running_since, status, created_at, updated_at";

/// Shared handle for task management (list/add/pause/resume/cancel) plus
/// recording the outcome of a dispatched run, usable while the engine loop
/// runs independently against its own connection.
pub struct SchedulerHandle {
    conn: Arc<Mutex<Connection>>,
}

impl SchedulerHandle {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create a task. `chat_id` is derived from the generated id so the
    /// message pipeline has a stable per-task chat lane to batch under.
    pub fn add_task(&self, new_task: NewTask) -> Result<Task> {
        check_schedule(new_task.schedule_type, &new_task.schedule_value)?;
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        let now_str = now.to_rfc3339();
        let id = Uuid::new_v4().to_string();
        let chat_id = format!("scheduler:{id}");
        let context_mode = new_task.context_mode.unwrap_or(ContextMode::Group);
        let next = compute_next_run(new_task.schedule_type, &new_task.schedule_value, new_task.timezone.as_deref(), now)
            .map_err(SchedulerError::InvalidSchedule)?
            .map(|dt| dt.to_rfc3339());

        conn.execute(
            "INSERT INTO tasks
             (id, group_folder, chat_id, prompt, schedule_type, schedule_value, timezone,
              context_mode, next_run, last_run, last_result, retry_count, last_error,
              running_since, status, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,NULL,NULL,0,NULL,NULL,'active',?10,?10)",
            rusqlite::params![
                id,
                new_task.group_folder,
                chat_id,
                new_task.prompt,
                new_task.schedule_type.to_string(),
                new_task.schedule_value,
                new_task.timezone,
                context_mode.to_string(),
                next,
                now_str,
            ],
        )?;
        info!(task_id = %id, group = %new_task.group_folder, "task added");

        Ok(Task {
            id,
            group_folder: new_task.group_folder,
            chat_id,
            prompt: new_task.prompt,
            schedule_type: new_task.schedule_type,
            schedule_value: new_task.schedule_value,
            timezone: new_task.timezone,
            context_mode,
            next_run: next,
            last_run: None,
            last_result: None,
            retry_count: 0,
            last_error: None,
            running_since: None,
            status: TaskStatus::Active,
            created_at: now_str.clone(),
            updated_at: now_str,
        })
    }

    /// Fetch a single task by id, regardless of status.
    pub fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
        match conn.query_row(&sql, [id], row_to_task) {
            Ok(task) => Ok(Some(task)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(SchedulerError::Database(e)),
        }
    }

    /// List every task that hasn't been soft-deleted, oldest first.
    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE status != 'deleted' ORDER BY created_at");
        let mut stmt = conn.prepare(&sql)?;
        let tasks = stmt.query_map([], row_to_task)?.filter_map(|r| r.ok()).collect();
        Ok(tasks)
    }

    /// Soft-delete a task (`status -> deleted`) — any status may transition here.
    pub fn cancel_task(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE tasks SET status='deleted', updated_at=?1 WHERE id=?2",
            rusqlite::params![Utc::now().to_rfc3339(), id],
        )?;
        if n == 0 {
            return Err(SchedulerError::TaskNotFound { id: id.to_string() });
        }
        info!(task_id = %id, "task cancelled");
        Ok(())
    }

    /// Park an active task (`active -> paused`) — used by the IPC
    /// dispatcher's `pause_task` action.
    pub fn pause_task(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE tasks SET status='paused', updated_at=?1 WHERE id=?2 AND status != 'deleted'",
            rusqlite::params![Utc::now().to_rfc3339(), id],
        )?;
        if n == 0 {
            return Err(SchedulerError::TaskNotFound { id: id.to_string() });
        }
        Ok(())
    }

    /// Resume a paused task (`paused -> active`): reset the retry counter
    /// and recompute `next_run` from its stored schedule, starting from now.
    pub fn resume_task(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let (schedule_type_str, schedule_value, timezone): (String, String, Option<String>) = conn
            .query_row(
                "SELECT schedule_type, schedule_value, timezone FROM tasks WHERE id = ?1",
                [id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .map_err(|_| SchedulerError::TaskNotFound { id: id.to_string() })?;
        let schedule_type: ScheduleType = schedule_type_str
            .parse()
            .map_err(SchedulerError::InvalidSchedule)?;
        let now = Utc::now();
        let next = compute_next_run(schedule_type, &schedule_value, timezone.as_deref(), now)
            .map_err(SchedulerError::InvalidSchedule)?
            .map(|dt| dt.to_rfc3339());
        conn.execute(
            "UPDATE tasks SET status='active', retry_count=0, last_error=NULL, next_run=?1, updated_at=?2
             WHERE id=?3",
            rusqlite::params![next, now.to_rfc3339(), id],
        )?;
        Ok(())
    }

    /// Force a task to become due on the next engine tick — used by the
    /// `run_task` IPC action.
    pub fn run_task_now(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        let n = conn.execute(
            "UPDATE tasks SET next_run=?1, updated_at=?1 WHERE id=?2 AND status = 'active'",
            rusqlite::params![now, id],
        )?;
        if n == 0 {
            return Err(SchedulerError::TaskNotFound { id: id.to_string() });
        }
        Ok(())
    }

    /// Record the outcome of a claimed run: insert a `run_log` row, clear
    /// the lease, and advance the task per §4.6's retry/backoff policy.
    ///
    /// `context_mode == Group` runs have already had their session persisted
    /// by the pipeline itself by the time this is called; this only updates
    /// scheduler bookkeeping.
    pub fn complete_run(&self, task_id: &str, outcome: RunOutcome, cfg: &skynet_core::config::SchedulerConfig) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        let now_str = now.to_rfc3339();

        let (schedule_type_str, schedule_value, timezone, running_since, retry_count, max_runs_unused): (
            String,
            String,
            Option<String>,
            Option<String>,
            u32,
            Option<u32>,
        ) = conn
            .query_row(
                "SELECT schedule_type, schedule_value, timezone, running_since, retry_count, NULL FROM tasks WHERE id = ?1",
                [task_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?)),
            )
            .map_err(|_| SchedulerError::TaskNotFound { id: task_id.to_string() })?;
        let _ = max_runs_unused;

        let started_at = running_since.clone().unwrap_or_else(|| now_str.clone());
        let duration_ms = chrono::DateTime::parse_from_rfc3339(&started_at)
            .map(|start| now.signed_duration_since(start.with_timezone(&Utc)).num_milliseconds())
            .unwrap_or(0);

        let truncated_result = outcome.result.as_deref().map(|r| truncate(r, MAX_RESULT_CHARS).to_string());
        let log_status = if outcome.success { "completed" } else { "failed" };
        conn.execute(
            "INSERT INTO run_log (task_id, started_at, finished_at, duration_ms, status, result, error)
             VALUES (?1,?2,?3,?4,?5,?6,?7)",
            rusqlite::params![task_id, started_at, now_str, duration_ms, log_status, truncated_result, outcome.error],
        )?;

        if outcome.success {
            let schedule_type: ScheduleType = schedule_type_str.parse().map_err(SchedulerError::InvalidSchedule)?;
            match compute_next_run(schedule_type, &schedule_value, timezone.as_deref(), now) {
                Ok(Some(next)) => {
                    conn.execute(
                        "UPDATE tasks SET status='active', retry_count=0, last_error=NULL, last_result=?1,
                             last_run=?2, next_run=?3, running_since=NULL, updated_at=?2
                         WHERE id=?4",
                        rusqlite::params![truncated_result, now_str, next.to_rfc3339(), task_id],
                    )?;
                }
                Ok(None) => {
                    conn.execute(
                        "UPDATE tasks SET status='completed', retry_count=0, last_error=NULL, last_result=?1,
                             last_run=?2, next_run=NULL, running_since=NULL, updated_at=?2
                         WHERE id=?3",
                        rusqlite::params![truncated_result, now_str, task_id],
                    )?;
                }
                Err(e) => {
                    warn!(task_id, error = %e, "schedule became invalid after a successful run; pausing");
                    conn.execute(
                        "UPDATE tasks SET status='paused', last_error=?1, last_result=?2, last_run=?3,
                             running_since=NULL, updated_at=?3
                         WHERE id=?4",
                        rusqlite::params![e, truncated_result, now_str, task_id],
                    )?;
                }
            }
            return Ok(());
        }

        let new_retry_count = retry_count + 1;
        let error_text = outcome.error.unwrap_or_else(|| "run failed".to_string());
        if new_retry_count >= cfg.task_max_retries {
            conn.execute(
                "UPDATE tasks SET status='paused', retry_count=?1, last_error=?2, last_run=?3,
                     running_since=NULL, updated_at=?3
                 WHERE id=?4",
                rusqlite::params![new_retry_count, error_text, now_str, task_id],
            )?;
            warn!(task_id, retries = new_retry_count, "task paused after repeated failures");
        } else {
            let next = (now + chrono::Duration::milliseconds(backoff_ms(cfg, new_retry_count) as i64)).to_rfc3339();
            conn.execute(
                "UPDATE tasks SET status='active', retry_count=?1, last_error=?2, last_run=?3,
                     next_run=?4, running_since=NULL, updated_at=?3
                 WHERE id=?5",
                rusqlite::params![new_retry_count, error_text, now_str, next, task_id],
            )?;
            info!(task_id, retries = new_retry_count, next_run = %next, "task requeued after failure");
        }
        Ok(())
    }

    /// History of runs for one task, newest first.
    pub fn run_log(&self, task_id: &str, limit: usize) -> Result<Vec<RunLogEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, task_id, started_at, finished_at, duration_ms, status, result, error
             FROM run_log WHERE task_id = ?1 ORDER BY started_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![task_id, limit as i64], |row| {
            Ok(RunLogEntry {
                id: row.get(0)?,
                task_id: row.get(1)?,
                started_at: row.get(2)?,
                finished_at: row.get(3)?,
                duration_ms: row.get(4)?,
                status: row.get(5)?,
                result: row.get(6)?,
                error: row.get(7)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

/// Core scheduler: persists tasks to SQLite and drives execution at ±1 s precision.
pub struct SchedulerEngine {
    conn: Connection,
    cfg: skynet_core::config::SchedulerConfig,
    /// If set, claimed tasks are sent here for dispatch routing.
    fired_tx: Option<mpsc::Sender<Task>>,
}

impl SchedulerEngine {
    /// Create a new engine, initialising the DB schema if needed.
    ///
    /// Pass `Some(tx)` to receive a copy of every claimed [`Task`] via mpsc.
    /// The sender is non-blocking (`try_send`) so the tick loop is never stalled.
    pub fn new(conn: Connection, fired_tx: Option<mpsc::Sender<Task>>, cfg: skynet_core::config::SchedulerConfig) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self { conn, cfg, fired_tx })
    }

    /// Main event loop. Polls at `cfg.poll_interval_ms` until `shutdown` broadcasts `true`.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("scheduler engine started");

        let poll_ms = self.cfg.poll_interval_ms;
        let mut interval = tokio::time::interval(std::time::Duration::from_millis(poll_ms));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick() {
                        error!("scheduler tick error: {e}");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("scheduler engine shutting down");
                        break;
                    }
                }
            }
        }
    }

    // --- private helpers ---------------------------------------------------

    /// Transactionally claim every task whose `next_run` has arrived and
    /// whose lease is free — `running_since` unset, or stale beyond
    /// `stale_lease_ms` (a prior claim whose completer crashed mid-run).
    /// Claimed tasks have `running_since` stamped to the claim instant and
    /// are forwarded to `fired_tx`; the status stays `active` throughout —
    /// the lease, not the status, marks a task as currently running.
    fn tick(&mut self) -> Result<()> {
        let now = Utc::now();
        let now_str = now.to_rfc3339();
        let stale_cutoff = (now - chrono::Duration::milliseconds(self.cfg.stale_lease_ms as i64)).to_rfc3339();

        let due: Vec<String> = {
            let mut stmt = self.conn.prepare_cached(
                "SELECT id FROM tasks
                 WHERE status = 'active' AND next_run IS NOT NULL AND next_run <= ?1
                   AND (running_since IS NULL OR running_since < ?2)",
            )?;
            let rows: Vec<_> = stmt
                .query_map(rusqlite::params![now_str, stale_cutoff], |row| row.get::<_, String>(0))?
                .filter_map(|r| r.ok())
                .collect();
            rows
        };

        for id in due {
            let tx = self.conn.transaction()?;
            let claimed = tx.execute(
                "UPDATE tasks SET running_since = ?1 WHERE id = ?2
                   AND status = 'active' AND (running_since IS NULL OR running_since < ?3)",
                rusqlite::params![now_str, id, stale_cutoff],
            )?;
            if claimed == 0 {
                // Raced with another claim (or the task was paused/deleted
                // concurrently) — skip it this tick.
                tx.commit()?;
                continue;
            }
            let task = tx.query_row(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"), [&id], row_to_task)?;
            tx.commit()?;

            info!(task_id = %task.id, group = %task.group_folder, "task claimed");

            if let Some(ref tx_chan) = self.fired_tx {
                if tx_chan.try_send(task).is_err() {
                    warn!(task_id = %id, "delivery channel full or closed — claimed task dropped this tick");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> SchedulerHandle {
        let conn = Connection::open_in_memory().unwrap();
        SchedulerHandle::new(conn).unwrap()
    }

    fn interval_task(group: &str) -> NewTask {
        NewTask {
            group_folder: group.to_string(),
            prompt: "say hi".to_string(),
            schedule_type: ScheduleType::Interval,
            schedule_value: "60000".to_string(),
            timezone: None,
            context_mode: None,
        }
    }

    #[test]
    fn add_task_computes_next_run_and_chat_id() {
        let h = handle();
        let task = h.add_task(interval_task("main")).unwrap();
        assert!(task.next_run.is_some());
        assert_eq!(task.chat_id, format!("scheduler:{}", task.id));
        assert_eq!(task.status, TaskStatus::Active);
        assert_eq!(task.context_mode, ContextMode::Group);
    }

    #[test]
    fn add_task_rejects_invalid_schedule() {
        let h = handle();
        let mut new_task = interval_task("main");
        new_task.schedule_value = "not a number".to_string();
        assert!(h.add_task(new_task).is_err());
    }

    #[test]
    fn pause_then_resume_recomputes_next_run() {
        let h = handle();
        let task = h.add_task(interval_task("main")).unwrap();
        h.pause_task(&task.id).unwrap();
        assert_eq!(h.get_task(&task.id).unwrap().unwrap().status, TaskStatus::Paused);

        h.resume_task(&task.id).unwrap();
        let resumed = h.get_task(&task.id).unwrap().unwrap();
        assert_eq!(resumed.status, TaskStatus::Active);
        assert!(resumed.next_run.is_some());
    }

    #[test]
    fn cancel_soft_deletes_and_excludes_from_list() {
        let h = handle();
        let task = h.add_task(interval_task("main")).unwrap();
        h.cancel_task(&task.id).unwrap();
        assert!(h.list_tasks().unwrap().is_empty());
        assert_eq!(h.get_task(&task.id).unwrap().unwrap().status, TaskStatus::Deleted);
    }

    #[test]
    fn complete_run_success_resets_retry_and_advances_next_run() {
        let h = handle();
        let task = h.add_task(interval_task("main")).unwrap();
        let cfg = skynet_core::config::SchedulerConfig::default();
        let first_next_run = task.next_run.clone();

        h.complete_run(
            &task.id,
            RunOutcome { success: true, result: Some("done".to_string()), error: None },
            &cfg,
        )
        .unwrap();

        let updated = h.get_task(&task.id).unwrap().unwrap();
        assert_eq!(updated.status, TaskStatus::Active);
        assert_eq!(updated.retry_count, 0);
        assert_eq!(updated.last_result.as_deref(), Some("done"));
        assert!(updated.running_since.is_none());
        assert_ne!(updated.next_run, first_next_run);
        assert_eq!(h.run_log(&task.id, 10).unwrap().len(), 1);
    }

    #[test]
    fn complete_run_failure_backs_off_then_pauses_after_max_retries() {
        let h = handle();
        let task = h.add_task(interval_task("main")).unwrap();
        let cfg = skynet_core::config::SchedulerConfig {
            task_max_retries: 2,
            ..skynet_core::config::SchedulerConfig::default()
        };

        h.complete_run(
            &task.id,
            RunOutcome { success: false, result: None, error: Some("boom".to_string()) },
            &cfg,
        )
        .unwrap();
        let after_first = h.get_task(&task.id).unwrap().unwrap();
        assert_eq!(after_first.status, TaskStatus::Active);
        assert_eq!(after_first.retry_count, 1);

        h.complete_run(
            &task.id,
            RunOutcome { success: false, result: None, error: Some("boom again".to_string()) },
            &cfg,
        )
        .unwrap();
        let after_second = h.get_task(&task.id).unwrap().unwrap();
        assert_eq!(after_second.status, TaskStatus::Paused);
        assert_eq!(after_second.retry_count, 2);
        assert_eq!(after_second.last_error.as_deref(), Some("boom again"));
    }

    #[test]
    fn tick_claims_due_task_and_stamps_lease_then_skips_fresh_lease() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO tasks (id, group_folder, chat_id, prompt, schedule_type, schedule_value,
                 timezone, context_mode, next_run, retry_count, status, created_at, updated_at)
             VALUES ('t1','main','scheduler:t1','hi','interval','60000',NULL,'group',?1,0,'active',?1,?1)",
            [&now],
        )
        .unwrap();

        let cfg = skynet_core::config::SchedulerConfig::default();
        let (tx, mut rx) = mpsc::channel(8);
        let mut engine = SchedulerEngine::new(conn, Some(tx), cfg).unwrap();

        engine.tick().unwrap();
        let claimed = rx.try_recv().expect("task should have been claimed");
        assert_eq!(claimed.id, "t1");

        // Immediately claimed again: the lease is fresh, so a second tick must not re-fire it.
        engine.tick().unwrap();
        assert!(rx.try_recv().is_err());
    }
}
