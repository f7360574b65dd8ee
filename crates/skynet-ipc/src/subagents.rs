//! Tracks delegated sub-agent runs spawned via the `spawn_subagent` action.
//!
//! There is no separate sub-agent runtime — a sub-agent is just another
//! turn through the existing pipeline (C7), run under a synthetic
//! `subagent:<group>:<uuid>` chat id so it gets its own drain lane and
//! doesn't interleave with the group's regular conversation. This registry
//! exists only so `subagent_status`/`subagent_result` have something to
//! poll, since the pipeline itself is fire-and-forget once queued.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{json, Value};
use skynet_agent::pipeline::{process::enqueue_and_await, MessageContext};
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone)]
enum SubagentState {
    Running,
    Done { ok: bool, output: String },
}

pub struct SubagentRegistry {
    states: Arc<DashMap<String, SubagentState>>,
}

impl SubagentRegistry {
    pub fn new() -> Self {
        Self { states: Arc::new(DashMap::new()) }
    }

    /// Enqueue `prompt` as a standalone run and return an id to poll.
    pub fn spawn<C: MessageContext + 'static>(&self, ctx: Arc<C>, chat_id: String, prompt: String) -> String {
        let id = Uuid::new_v4().to_string();
        self.states.insert(id.clone(), SubagentState::Running);

        let states = Arc::clone(&self.states);
        let id_for_task = id.clone();
        let timeout_ms = ctx.sandbox_config().timeout_ms;
        tokio::spawn(async move {
            let result = enqueue_and_await(
                &ctx,
                &chat_id,
                skynet_core::types::GroupFolder::MAIN,
                &prompt,
                Vec::new(),
                skynet_queue::Lane::Interactive,
                timeout_ms,
            )
            .await;

            let state = match result {
                Ok(processed) => SubagentState::Done { ok: true, output: processed.content },
                Err(e) => {
                    warn!(subagent_id = %id_for_task, error = %e, "subagent run failed");
                    SubagentState::Done { ok: false, output: e.to_string() }
                }
            };
            states.insert(id_for_task, state);
        });

        id
    }

    pub fn status(&self, id: &str) -> &'static str {
        match self.states.get(id).as_deref() {
            Some(SubagentState::Running) => "running",
            Some(SubagentState::Done { ok: true, .. }) => "completed",
            Some(SubagentState::Done { ok: false, .. }) => "failed",
            None => "unknown",
        }
    }

    pub fn result(&self, id: &str) -> Value {
        match self.states.get(id).as_deref() {
            Some(SubagentState::Done { ok, output }) => json!({ "ok": ok, "output": output }),
            Some(SubagentState::Running) => Value::Null,
            None => Value::Null,
        }
    }
}

impl Default for SubagentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_id_reports_unknown_status_and_null_result() {
        let registry = SubagentRegistry::new();
        assert_eq!(registry.status("does-not-exist"), "unknown");
        assert_eq!(registry.result("does-not-exist"), Value::Null);
    }

    #[test]
    fn running_state_has_no_result_yet() {
        let registry = SubagentRegistry::new();
        registry.states.insert("abc".to_string(), SubagentState::Running);
        assert_eq!(registry.status("abc"), "running");
        assert_eq!(registry.result("abc"), Value::Null);
    }

    #[test]
    fn done_state_reports_completed_or_failed() {
        let registry = SubagentRegistry::new();
        registry
            .states
            .insert("ok".to_string(), SubagentState::Done { ok: true, output: "done".to_string() });
        registry
            .states
            .insert("bad".to_string(), SubagentState::Done { ok: false, output: "boom".to_string() });

        assert_eq!(registry.status("ok"), "completed");
        assert_eq!(registry.result("ok"), json!({ "ok": true, "output": "done" }));
        assert_eq!(registry.status("bad"), "failed");
        assert_eq!(registry.result("bad"), json!({ "ok": false, "output": "boom" }));
    }
}
