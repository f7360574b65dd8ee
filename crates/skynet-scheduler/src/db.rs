use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `tasks` table (the C6 scheduled-task subsystem) and its
/// `run_log` history, both idempotent, plus an index on `next_run` so the
/// due-task poll stays efficient with thousands of tasks.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS tasks (
            id             TEXT    NOT NULL PRIMARY KEY,
            group_folder   TEXT    NOT NULL,
            chat_id        TEXT    NOT NULL,
            prompt         TEXT    NOT NULL,
            schedule_type  TEXT    NOT NULL,
            schedule_value TEXT    NOT NULL,
            timezone       TEXT,
            context_mode   TEXT    NOT NULL DEFAULT 'group',
            next_run       TEXT,
            last_run       TEXT,
            last_result    TEXT,
            retry_count    INTEGER NOT NULL DEFAULT 0,
            last_error     TEXT,
            running_since  TEXT,
            status         TEXT    NOT NULL DEFAULT 'active',
            created_at     TEXT    NOT NULL,
            updated_at     TEXT    NOT NULL
        ) STRICT;

        -- Efficient polling: SELECT … WHERE next_run <= ?  ORDER BY next_run
        CREATE INDEX IF NOT EXISTS idx_tasks_next_run ON tasks (next_run);

        CREATE TABLE IF NOT EXISTS run_log (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id      TEXT    NOT NULL,
            started_at   TEXT    NOT NULL,
            finished_at  TEXT    NOT NULL,
            duration_ms  INTEGER NOT NULL,
            status       TEXT    NOT NULL,
            result       TEXT,
            error        TEXT,
            FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_run_log_task ON run_log (task_id, started_at DESC);
        ",
    )?;
    Ok(())
}
