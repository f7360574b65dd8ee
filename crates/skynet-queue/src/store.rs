use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::error::{QueueError, Result};
use crate::types::{Attachment, Lane, QueueItemStatus, QueuedMessage};

/// Thread-safe store for the durable inbound-message queue.
///
/// Wraps a single SQLite connection in a `Mutex`, following the same
/// single-node pattern used for sessions and scheduled jobs.
pub struct QueueStore {
    db: Mutex<Connection>,
}

impl QueueStore {
    pub fn new(conn: Connection) -> Self {
        Self { db: Mutex::new(conn) }
    }

    /// Append a new message in `pending` state. Returns its generated id.
    #[instrument(skip(self, text, attachments), fields(chat_id, lane = %lane))]
    pub fn enqueue(
        &self,
        chat_id: &str,
        lane: Lane,
        text: &str,
        attachments: Vec<Attachment>,
    ) -> Result<String> {
        let id = Uuid::now_v7().to_string();
        let now = chrono::Utc::now().to_rfc3339();
        let attachments_json = serde_json::to_string(&attachments)?;
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO queued_messages
             (id, chat_id, lane, status, text, attachments, enqueued_at, retry_count)
             VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6, 0)",
            params![id, chat_id, lane.to_string(), text, attachments_json, now],
        )?;
        Ok(id)
    }

    /// Distinct chat ids with at least one `pending` row, oldest-enqueued first.
    ///
    /// The message pipeline (C7) polls this to decide which chats are ready
    /// to have their batch window evaluated.
    pub fn chats_with_pending(&self) -> Result<Vec<String>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT chat_id FROM queued_messages
             WHERE status = 'pending'
             GROUP BY chat_id
             ORDER BY MIN(enqueued_at) ASC",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Age in milliseconds of the oldest `pending` row for `chat_id`, if any.
    pub fn oldest_pending_age_ms(&self, chat_id: &str) -> Result<Option<i64>> {
        let db = self.db.lock().unwrap();
        let ts: Option<String> = db
            .query_row(
                "SELECT MIN(enqueued_at) FROM queued_messages
                 WHERE chat_id = ?1 AND status = 'pending'",
                params![chat_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        let Some(ts) = ts else { return Ok(None) };
        let parsed = chrono::DateTime::parse_from_rfc3339(&ts)
            .map_err(|e| QueueError::Database(rusqlite::Error::InvalidParameterName(e.to_string())))?;
        let age = chrono::Utc::now().signed_duration_since(parsed.with_timezone(&chrono::Utc));
        Ok(Some(age.num_milliseconds().max(0)))
    }

    /// Atomically claim up to `max_batch` oldest `pending` rows for `chat_id`,
    /// transitioning them to `processing` and returning them in enqueue order.
    #[instrument(skip(self), fields(chat_id, max_batch))]
    pub fn claim_batch(&self, chat_id: &str, max_batch: u32) -> Result<Vec<QueuedMessage>> {
        let now = chrono::Utc::now().to_rfc3339();
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;

        let ids: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM queued_messages
                 WHERE chat_id = ?1 AND status = 'pending'
                 ORDER BY enqueued_at ASC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![chat_id, max_batch], |row| row.get::<_, String>(0))?;
            rows.filter_map(|r| r.ok()).collect()
        };

        for id in &ids {
            tx.execute(
                "UPDATE queued_messages SET status = 'processing', claimed_at = ?1 WHERE id = ?2",
                params![now, id],
            )?;
        }

        let mut claimed = Vec::with_capacity(ids.len());
        for id in &ids {
            claimed.push(row_by_id(&tx, id)?);
        }
        tx.commit()?;
        debug!(claimed = claimed.len(), "batch claimed");
        Ok(claimed)
    }

    /// Mark a claimed message as successfully delivered/processed.
    pub fn complete(&self, id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE queued_messages SET status = 'completed' WHERE id = ?1",
            params![id],
        )?;
        if changed == 0 {
            return Err(QueueError::NotFound { id: id.to_string() });
        }
        Ok(())
    }

    /// Record a processing failure. Requeues to `pending` if `retry_count`
    /// after increment is still below `max_retries`, otherwise marks `failed`.
    #[instrument(skip(self, error), fields(id, max_retries))]
    pub fn fail(&self, id: &str, error: &str, max_retries: u32) -> Result<QueueItemStatus> {
        let db = self.db.lock().unwrap();
        let retry_count: u32 = db
            .query_row(
                "SELECT retry_count FROM queued_messages WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| QueueError::NotFound { id: id.to_string() })?;

        let new_count = retry_count + 1;
        let next_status = if new_count < max_retries {
            QueueItemStatus::Pending
        } else {
            QueueItemStatus::Failed
        };
        db.execute(
            "UPDATE queued_messages
             SET retry_count = ?1, last_error = ?2, status = ?3, claimed_at = NULL
             WHERE id = ?4",
            params![new_count, error, next_status.to_string(), id],
        )?;
        if next_status == QueueItemStatus::Failed {
            warn!(%id, retries = new_count, "message exhausted retries");
        }
        Ok(next_status)
    }

    /// Force a `processing` row back to `pending` regardless of age.
    pub fn requeue(&self, id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE queued_messages SET status = 'pending', claimed_at = NULL WHERE id = ?1",
            params![id],
        )?;
        if changed == 0 {
            return Err(QueueError::NotFound { id: id.to_string() });
        }
        Ok(())
    }

    /// Requeue every `processing` row whose `claimed_at` is older than
    /// `threshold_ms`. Returns the number of rows reclaimed.
    ///
    /// Called by C7's drain loop on a timer, and with a shorter threshold
    /// immediately after a wake-from-sleep jump is detected.
    #[instrument(skip(self))]
    pub fn reset_stalled(&self, threshold_ms: i64) -> Result<u64> {
        let db = self.db.lock().unwrap();
        let cutoff = chrono::Utc::now() - chrono::Duration::milliseconds(threshold_ms);
        let cutoff_str = cutoff.to_rfc3339();
        let changed = db.execute(
            "UPDATE queued_messages
             SET status = 'pending', claimed_at = NULL
             WHERE status = 'processing' AND claimed_at < ?1",
            params![cutoff_str],
        )?;
        if changed > 0 {
            warn!(count = changed, "reclaimed stalled queue rows");
        }
        Ok(changed as u64)
    }
}

fn row_by_id(tx: &rusqlite::Transaction<'_>, id: &str) -> Result<QueuedMessage> {
    tx.query_row(
        "SELECT id, chat_id, lane, status, text, attachments, enqueued_at, claimed_at, retry_count, last_error
         FROM queued_messages WHERE id = ?1",
        params![id],
        row_to_message,
    )
    .map_err(QueueError::Database)
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueuedMessage> {
    let lane_str: String = row.get(2)?;
    let status_str: String = row.get(3)?;
    let attachments_json: String = row.get(5)?;
    let attachments: Vec<Attachment> = serde_json::from_str(&attachments_json).unwrap_or_default();
    Ok(QueuedMessage {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        lane: lane_str.parse().unwrap_or(Lane::Interactive),
        status: status_str.parse().unwrap_or(QueueItemStatus::Pending),
        text: row.get(4)?,
        attachments,
        enqueued_at: row.get(6)?,
        claimed_at: row.get(7)?,
        retry_count: row.get(8)?,
        last_error: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> QueueStore {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::init_db(&conn).unwrap();
        QueueStore::new(conn)
    }

    #[test]
    fn enqueue_then_claim_batch_transitions_to_processing() {
        let s = store();
        s.enqueue("telegram:1", Lane::Interactive, "hi", vec![]).unwrap();
        s.enqueue("telegram:1", Lane::Interactive, "there", vec![]).unwrap();

        let claimed = s.claim_batch("telegram:1", 50).unwrap();
        assert_eq!(claimed.len(), 2);
        assert!(claimed.iter().all(|m| m.status == QueueItemStatus::Processing));
        assert_eq!(s.chats_with_pending().unwrap().len(), 0);
    }

    #[test]
    fn claim_batch_respects_max_batch_and_order() {
        let s = store();
        for i in 0..5 {
            s.enqueue("telegram:1", Lane::Interactive, &format!("m{i}"), vec![]).unwrap();
        }
        let claimed = s.claim_batch("telegram:1", 3).unwrap();
        assert_eq!(claimed.len(), 3);
        assert_eq!(claimed[0].text, "m0");
        assert_eq!(claimed[2].text, "m2");
    }

    #[test]
    fn fail_requeues_until_max_retries_then_fails() {
        let s = store();
        let id = s.enqueue("telegram:1", Lane::Interactive, "hi", vec![]).unwrap();
        s.claim_batch("telegram:1", 10).unwrap();

        assert_eq!(s.fail(&id, "boom", 4).unwrap(), QueueItemStatus::Pending);
        s.claim_batch("telegram:1", 10).unwrap();
        assert_eq!(s.fail(&id, "boom", 4).unwrap(), QueueItemStatus::Pending);
        s.claim_batch("telegram:1", 10).unwrap();
        assert_eq!(s.fail(&id, "boom", 4).unwrap(), QueueItemStatus::Pending);
        s.claim_batch("telegram:1", 10).unwrap();
        assert_eq!(s.fail(&id, "boom", 4).unwrap(), QueueItemStatus::Failed);
    }

    #[test]
    fn reset_stalled_reclaims_old_processing_rows() {
        let s = store();
        let id = s.enqueue("telegram:1", Lane::Interactive, "hi", vec![]).unwrap();
        s.claim_batch("telegram:1", 10).unwrap();

        // Not yet stale at a huge threshold.
        assert_eq!(s.reset_stalled(60_000).unwrap(), 0);

        // Backdate claimed_at to simulate a stalled worker.
        {
            let db = s.db.lock().unwrap();
            let old = (chrono::Utc::now() - chrono::Duration::minutes(10)).to_rfc3339();
            db.execute(
                "UPDATE queued_messages SET claimed_at = ?1 WHERE id = ?2",
                params![old, id],
            )
            .unwrap();
        }
        assert_eq!(s.reset_stalled(60_000).unwrap(), 1);
        assert_eq!(s.chats_with_pending().unwrap(), vec!["telegram:1".to_string()]);
    }
}
