use rusqlite::Connection;

use crate::error::Result;

/// Initialise the `queued_messages` table and its indexes.
///
/// Safe to call on every startup — uses `IF NOT EXISTS` throughout.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS queued_messages (
            id            TEXT PRIMARY KEY,
            chat_id       TEXT NOT NULL,
            lane          TEXT NOT NULL,
            status        TEXT NOT NULL DEFAULT 'pending',
            text          TEXT NOT NULL,
            attachments   TEXT NOT NULL DEFAULT '[]',
            enqueued_at   TEXT NOT NULL,
            claimed_at    TEXT,
            retry_count   INTEGER NOT NULL DEFAULT 0,
            last_error    TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_queue_chat_status
            ON queued_messages(chat_id, status, enqueued_at);
        CREATE INDEX IF NOT EXISTS idx_queue_status_claimed
            ON queued_messages(status, claimed_at);",
    )?;
    Ok(())
}
