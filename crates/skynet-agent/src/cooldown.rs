//! Persisted per-model cooldown state for the failover cascade (C3).
//!
//! A provider call that fails is classified into an [`ErrorCategory`]; the
//! category decides whether (and for how long) the model goes into cooldown.
//! State survives restarts via an atomic write-then-rename JSON file so a
//! crash mid-write never corrupts the file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// How an LLM provider failure should be treated for cooldown purposes.
///
/// Classification is implementation-configurable (spec Open Question a):
/// each provider adapter maps its own status codes/response bodies onto
/// this shared vocabulary via a `classify` function, and everything
/// downstream only ever matches on the category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    RateLimit,
    Timeout,
    Overloaded,
    Auth,
    NonRetryable,
    Transport,
    InvalidResponse,
    ContextOverflow,
    Aborted,
}

impl ErrorCategory {
    /// Base cooldown duration for a first occurrence, or `None` if this
    /// category never triggers a cooldown.
    fn base_duration(self) -> Option<chrono::Duration> {
        match self {
            ErrorCategory::RateLimit => Some(chrono::Duration::seconds(60)),
            ErrorCategory::Timeout => Some(chrono::Duration::minutes(15)),
            ErrorCategory::Overloaded => Some(chrono::Duration::minutes(2)),
            ErrorCategory::Auth | ErrorCategory::NonRetryable => Some(chrono::Duration::days(3650)),
            ErrorCategory::Transport
            | ErrorCategory::InvalidResponse
            | ErrorCategory::ContextOverflow
            | ErrorCategory::Aborted => None,
        }
    }

    /// Multiplier applied per repeat occurrence, and the capped maximum.
    fn escalation(self) -> (f64, chrono::Duration) {
        match self {
            ErrorCategory::Timeout => (3.0, chrono::Duration::hours(6)),
            ErrorCategory::Overloaded => (2.0, chrono::Duration::minutes(30)),
            // RateLimit does not escalate; Auth/NonRetryable are already effectively indefinite.
            _ => (1.0, chrono::Duration::days(3650)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CooldownEntry {
    category: ErrorCategory,
    until: DateTime<Utc>,
    /// Number of consecutive failures of the same category, used to escalate.
    repeat_count: u32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CooldownFile {
    #[serde(default)]
    models: HashMap<String, CooldownEntry>,
}

/// File-backed per-model cooldown tracker.
pub struct CooldownStore {
    path: PathBuf,
    state: Mutex<CooldownFile>,
}

impl CooldownStore {
    /// Load existing state from `path`, or start empty if the file is
    /// missing/unreadable.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = std::fs::read_to_string(&path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();
        Self { path, state: Mutex::new(state) }
    }

    /// Record a failure for `model` and return the instant it becomes
    /// available again (`None` means this category does not cool down).
    pub fn record_failure(&self, model: &str, category: ErrorCategory) -> Option<DateTime<Utc>> {
        let Some(base) = category.base_duration() else {
            return None;
        };

        let mut state = self.state.lock().unwrap();
        let (multiplier, cap) = category.escalation();
        let repeat_count = match state.models.get(model) {
            Some(existing) if existing.category == category => existing.repeat_count + 1,
            _ => 1,
        };

        let scaled_secs = base.num_seconds() as f64 * multiplier.powi((repeat_count - 1) as i32);
        let duration = chrono::Duration::seconds(scaled_secs as i64).min(cap);
        let until = Utc::now() + duration;

        state.models.insert(
            model.to_string(),
            CooldownEntry { category, until, repeat_count },
        );
        warn!(model, ?category, repeat_count, until = %until, "model entered cooldown");
        self.persist(&state);
        Some(until)
    }

    /// Whether `model` is currently cooling down.
    pub fn is_cooling_down(&self, model: &str) -> bool {
        let state = self.state.lock().unwrap();
        state.models.get(model).is_some_and(|e| e.until > Utc::now())
    }

    /// Clear a model's cooldown (e.g. an operator override, or a successful
    /// manual probe of an `Auth`/`NonRetryable` model).
    pub fn clear(&self, model: &str) {
        let mut state = self.state.lock().unwrap();
        if state.models.remove(model).is_some() {
            info!(model, "cooldown cleared");
            self.persist(&state);
        }
    }

    fn persist(&self, state: &CooldownFile) {
        let Ok(json) = serde_json::to_string_pretty(state) else { return };
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        write_then_rename(&self.path, &json);
    }
}

/// Write to a sibling temp file then rename over the target — the rename is
/// atomic on POSIX filesystems, so a crash mid-write never leaves a
/// truncated/corrupt cooldown file.
fn write_then_rename(path: &Path, contents: &str) {
    let tmp = path.with_extension("tmp");
    if std::fs::write(&tmp, contents).is_ok() {
        let _ = std::fs::rename(&tmp, path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_does_not_escalate() {
        let dir = tempfile::tempdir().unwrap();
        let store = CooldownStore::load(dir.path().join("cooldowns.json"));

        let first = store.record_failure("claude-sonnet-4-6", ErrorCategory::RateLimit).unwrap();
        store.clear("claude-sonnet-4-6");
        let second = store.record_failure("claude-sonnet-4-6", ErrorCategory::RateLimit).unwrap();

        let first_secs = (first - Utc::now()).num_seconds();
        let second_secs = (second - Utc::now()).num_seconds();
        assert!((first_secs - second_secs).abs() < 2);
    }

    #[test]
    fn timeout_escalates_and_caps_at_six_hours() {
        let dir = tempfile::tempdir().unwrap();
        let store = CooldownStore::load(dir.path().join("cooldowns.json"));

        for _ in 0..6 {
            store.record_failure("slow-model", ErrorCategory::Timeout);
        }
        assert!(store.is_cooling_down("slow-model"));
        let state = store.state.lock().unwrap();
        let until = state.models.get("slow-model").unwrap().until;
        let capped = (until - Utc::now()).num_minutes();
        assert!(capped <= 6 * 60 + 1);
    }

    #[test]
    fn transport_errors_never_cool_down() {
        let dir = tempfile::tempdir().unwrap();
        let store = CooldownStore::load(dir.path().join("cooldowns.json"));
        assert!(store.record_failure("any-model", ErrorCategory::Transport).is_none());
        assert!(!store.is_cooling_down("any-model"));
    }

    #[test]
    fn state_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cooldowns.json");
        {
            let store = CooldownStore::load(&path);
            store.record_failure("gpt-5", ErrorCategory::Overloaded);
        }
        let reloaded = CooldownStore::load(&path);
        assert!(reloaded.is_cooling_down("gpt-5"));
    }
}
