//! Hybrid recall scoring: lexical match (bm25) blended with importance and recency.
//!
//! Score = 0.55 * bm25Norm + 0.30 * importance + 0.15 * recency, where
//! `bm25Norm = 1 / (1 + bm25)` (bm25 from SQLite FTS5 is more negative for
//! better matches, so more negative -> higher bm25Norm) and
//! `recency = exp(-ageDays / 30)` computed from `updated_at`.

use rusqlite::Connection;

use crate::error::Result;
use crate::types::UserMemory;

const WEIGHT_BM25: f64 = 0.55;
const WEIGHT_IMPORTANCE: f64 = 0.30;
const WEIGHT_RECENCY: f64 = 0.15;
const RECENCY_HALFLIFE_DAYS: f64 = 30.0;

#[derive(Debug, Clone)]
pub struct ScoredMemory {
    pub memory: UserMemory,
    pub bm25: f64,
    pub score: f64,
}

fn bm25_norm(bm25: f64) -> f64 {
    // bm25() returns a negative value for good matches; flip sign so that
    // a stronger match yields a value in (0, 1].
    1.0 / (1.0 + bm25.abs())
}

fn recency_score(updated_at: &str) -> f64 {
    let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(updated_at) else {
        return 0.0;
    };
    let age_days = chrono::Utc::now()
        .signed_duration_since(parsed.with_timezone(&chrono::Utc))
        .num_seconds() as f64
        / 86_400.0;
    (-age_days.max(0.0) / RECENCY_HALFLIFE_DAYS).exp()
}

/// Run the FTS5 MATCH query for `query` scoped to `user_id`, blend bm25,
/// confidence (importance), and recency, and return the top `limit` hits
/// ordered by descending blended score.
pub fn blended_recall(
    conn: &Connection,
    user_id: &str,
    query: &str,
    limit: usize,
) -> Result<Vec<ScoredMemory>> {
    let mut stmt = conn.prepare(
        "SELECT m.id, m.user_id, m.category, m.key, m.value, m.confidence,
                m.source, m.expires_at, m.created_at, m.updated_at,
                bm25(user_memory_fts) as rank
         FROM user_memory m
         JOIN user_memory_fts f ON m.id = f.rowid
         WHERE m.user_id = ?1 AND user_memory_fts MATCH ?2
         AND (m.expires_at IS NULL OR m.expires_at > ?3)",
    )?;

    let now = chrono::Utc::now().to_rfc3339();
    let rows = stmt.query_map(rusqlite::params![user_id, query, now], |row| {
        let memory = crate::manager::row_to_memory(row)?;
        let bm25: f64 = row.get(10)?;
        Ok((memory, bm25))
    })?;

    let mut scored: Vec<ScoredMemory> = rows
        .filter_map(|r| r.ok())
        .map(|(memory, bm25)| {
            let recency = recency_score(&memory.updated_at);
            let score = WEIGHT_BM25 * bm25_norm(bm25)
                + WEIGHT_IMPORTANCE * memory.confidence
                + WEIGHT_RECENCY * recency;
            ScoredMemory { memory, bm25, score }
        })
        .collect();

    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(limit);
    Ok(scored)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recency_decays_towards_zero() {
        let now = chrono::Utc::now().to_rfc3339();
        let month_ago = (chrono::Utc::now() - chrono::Duration::days(30)).to_rfc3339();
        let fresh = recency_score(&now);
        let old = recency_score(&month_ago);
        assert!(fresh > old);
        assert!((old - (-1.0f64).exp()).abs() < 0.05);
    }

    #[test]
    fn bm25_norm_is_bounded() {
        assert!(bm25_norm(0.0) <= 1.0);
        assert!(bm25_norm(-10.0) > 0.0 && bm25_norm(-10.0) < 1.0);
    }
}
