//! Message pipeline (C7) — shared by all channel adapters.
//!
//! One call to [`drain_chat`] claims a batch of queued messages for a single
//! chat, builds the sandboxed agent's request context (memory recall, model,
//! tool policy), dispatches the run through the sandbox orchestrator (C5)
//! under the group's lane permit and mutex, and delivers the result back to
//! the originating platform. The caller (gateway, discord, telegram) is only
//! responsible for enqueueing inbound messages and wiring channel delivery;
//! everything else lives here, once.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use skynet_queue::{Attachment as QueueAttachment, QueuedMessage};

use crate::lanes::Lane;
use crate::provider::ProviderError;
use crate::sandbox::{self, SandboxRequest, SandboxStatus};

use super::context::MessageContext;

/// Outcome of one drained batch, for callers that want to log/report it.
#[derive(Debug, Clone)]
pub struct ProcessedMessage {
    pub content: String,
    pub model: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub stop_reason: String,
}

type WaitResult = Result<ProcessedMessage, String>;

/// Messages in a single batch requeue at most this many times before the
/// batch is given up on and a fallback reply is sent instead.
const MAX_BATCH_RETRIES: u32 = 4;

/// Poll interval for a daemon-mode run awaiting its response file.
const DAEMON_RESPONSE_POLL_MS: u64 = 250;

/// Ensures at most one drain loop runs per chat at a time. A second enqueue
/// for a chat whose drain is already running just nudges it — see
/// [`DrainCoordinator::notify`] — rather than spawning a parallel drain.
#[derive(Default)]
pub struct DrainCoordinator {
    active: DashMap<String, CancellationToken>,
    /// Per-message completion channels, used by [`enqueue_and_await`] so a
    /// request/response-shaped caller (gateway HTTP, a Discord slash
    /// interaction) can await the batch its message ended up in.
    waiters: DashMap<String, oneshot::Sender<WaitResult>>,
}

impl DrainCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a drain loop for `chat_id` if one isn't already running.
    pub fn spawn_if_idle<C: MessageContext + 'static>(
        self: &Arc<Self>,
        ctx: Arc<C>,
        chat_id: String,
        group: String,
    ) {
        if self.active.contains_key(&chat_id) {
            return;
        }
        let cancel = CancellationToken::new();
        self.active.insert(chat_id.clone(), cancel.clone());
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            run_drain_loop(Arc::clone(&coordinator), Arc::clone(&ctx), chat_id.clone(), group.clone(), cancel).await;
            coordinator.active.remove(&chat_id);

            // A message enqueued while this loop was exiting (after its last
            // empty claim but before deregistering above) would otherwise be
            // stranded as `pending` with nothing left to wake a drain for it.
            // Ground truth is the queue itself, not a notification that could
            // race the teardown above.
            if matches!(ctx.queue().oldest_pending_age_ms(&chat_id), Ok(Some(_))) {
                coordinator.spawn_if_idle(ctx, chat_id, group);
            }
        });
    }

    /// Abort the in-flight run for `chat_id`, if any (interrupt-on-new-message),
    /// then make sure a drain is queued up to pick up the message that
    /// triggered the interrupt. Safe to call unconditionally on every inbound
    /// message: if nothing was draining this is just `spawn_if_idle`.
    pub fn interrupt_and_redrain<C: MessageContext + 'static>(
        self: &Arc<Self>,
        ctx: Arc<C>,
        chat_id: String,
        group: String,
    ) {
        self.interrupt(&chat_id);
        self.spawn_if_idle(ctx, chat_id, group);
    }

    /// Abort the in-flight run for `chat_id`, if any (interrupt-on-new-message).
    pub fn interrupt(&self, chat_id: &str) {
        if let Some(token) = self.active.get(chat_id) {
            token.cancel();
        }
    }

    pub fn chats_draining(&self) -> Vec<String> {
        self.active.iter().map(|e| e.key().clone()).collect()
    }

    fn notify(&self, message_id: &str, result: WaitResult) {
        if let Some((_, tx)) = self.waiters.remove(message_id) {
            let _ = tx.send(result);
        }
    }
}

/// Enqueue `text` for `chat_id`, make sure a drain is running, and wait for
/// the batch this message lands in to finish — for channel adapters built
/// around a synchronous request/response call (gateway's `/chat`, Discord
/// slash command responses) rather than a pure fire-and-forget delivery.
pub async fn enqueue_and_await<C: MessageContext + 'static>(
    ctx: &Arc<C>,
    chat_id: &str,
    group: &str,
    text: &str,
    attachments: Vec<QueueAttachment>,
    lane: skynet_queue::Lane,
    timeout_ms: u64,
) -> Result<ProcessedMessage, ProviderError> {
    let id = ctx
        .queue()
        .enqueue(chat_id, lane, text, attachments)
        .map_err(|e| ProviderError::Unavailable(e.to_string()))?;

    let drains = ctx.drains();
    let (tx, rx) = oneshot::channel();
    drains.waiters.insert(id, tx);
    drains.interrupt_and_redrain(Arc::clone(ctx), chat_id.to_string(), group.to_string());

    match tokio::time::timeout(tokio::time::Duration::from_millis(timeout_ms), rx).await {
        Ok(Ok(Ok(msg))) => Ok(msg),
        Ok(Ok(Err(e))) => Err(ProviderError::Unavailable(e)),
        Ok(Err(_)) => Err(ProviderError::Unavailable("drain dropped without a response".into())),
        Err(_) => Err(ProviderError::Unavailable("timed out waiting for agent reply".into())),
    }
}

/// Drain every pending batch for `chat_id` until the queue is empty.
async fn run_drain_loop<C: MessageContext + 'static>(
    coordinator: Arc<DrainCoordinator>,
    ctx: Arc<C>,
    chat_id: String,
    group: String,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        match drain_one_batch(&coordinator, &ctx, &chat_id, &group, &cancel).await {
            Ok(Some(_)) => continue,
            Ok(None) => return,
            Err(e) => {
                warn!(chat = %chat_id, err = %e, "drain batch failed");
                return;
            }
        }
    }
}

/// Claim one batch, run it through the sandbox, deliver the result.
/// Returns `Ok(None)` when the chat has no pending messages left.
async fn drain_one_batch<C: MessageContext + 'static>(
    coordinator: &Arc<DrainCoordinator>,
    ctx: &Arc<C>,
    chat_id: &str,
    group: &str,
    cancel: &CancellationToken,
) -> Result<Option<ProcessedMessage>, ProviderError> {
    let queue_cfg = ctx.queue_config();

    // Let a chat's queued messages accumulate for batch_window_ms (measured
    // from the oldest pending row) before claiming, so a burst of rapid-fire
    // messages lands in one batch instead of one sandbox run per message.
    loop {
        match ctx.queue().oldest_pending_age_ms(chat_id) {
            Ok(None) => return Ok(None),
            Ok(Some(age_ms)) if age_ms < queue_cfg.batch_window_ms as i64 => {
                let remaining = (queue_cfg.batch_window_ms as i64 - age_ms).max(0) as u64;
                tokio::select! {
                    _ = tokio::time::sleep(tokio::time::Duration::from_millis(remaining)) => continue,
                    _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                }
            }
            Ok(Some(_)) => break,
            Err(e) => return Err(ProviderError::Unavailable(e.to_string())),
        }
    }

    let batch = ctx
        .queue()
        .claim_batch(chat_id, queue_cfg.max_batch)
        .map_err(|e| ProviderError::Unavailable(e.to_string()))?;
    if batch.is_empty() {
        return Ok(None);
    }

    let ids: Vec<String> = batch.iter().map(|m| m.id.clone()).collect();
    let prompt = compose_batch_prompt(&batch);

    let memory_recall = ctx
        .memory()
        .recall_blended(chat_id, &prompt, 8)
        .map(|scored| {
            serde_json::json!(scored
                .into_iter()
                .map(|s| serde_json::json!({
                    "content": s.memory.content,
                    "score": s.score,
                }))
                .collect::<Vec<_>>())
        })
        .unwrap_or(serde_json::Value::Null);

    let model = ctx.agent().get_model().await;
    let sandbox_cfg = ctx.sandbox_config().clone();

    // A batch is admitted at its most urgent member's lane so a scheduled or
    // maintenance message riding along with an interactive one doesn't get
    // starved behind the lower-priority default.
    let lane = batch
        .iter()
        .map(|m| queue_lane_to_pool_lane(m.lane))
        .max_by_key(|l| l.priority())
        .unwrap_or(Lane::Interactive);

    let permit = ctx.lanes().acquire(lane, cancel).await;
    if permit.is_none() {
        // Cancelled while waiting — the batch stays `processing` and will be
        // reclaimed by reset_stalled on the next sweep.
        return Err(ProviderError::Cancelled);
    }

    // A scheduled task's own `group_folder` (not the caller's `group`, which
    // for scheduler-forwarded runs is just `main`) and `context_mode` decide
    // whether this run shares and updates the group's ongoing session.
    let (session_group, persist_session) = match chat_id.strip_prefix("scheduler:") {
        Some(task_id) => match ctx.scheduler().get_task(task_id) {
            Ok(Some(task)) => (
                task.group_folder,
                task.context_mode == skynet_scheduler::ContextMode::Group,
            ),
            _ => (group.to_string(), true),
        },
        None => (group.to_string(), true),
    };
    let session_id = if persist_session {
        ctx.sessions().get_group_session(&session_group).ok().flatten()
    } else {
        None
    };

    let req = SandboxRequest {
        prompt,
        session_id,
        memory_recall,
        user_profile: serde_json::Value::Null,
        tool_policy: serde_json::Value::Null,
        behavior: serde_json::Value::Null,
        model: model.clone(),
        context_window: None,
        max_output_tokens: None,
        temperature: None,
        channel_metadata: serde_json::json!({ "chat_id": chat_id, "group": group }),
        max_tool_steps: sandbox_cfg.max_tool_steps,
        timeout_ms: sandbox_cfg.timeout_ms,
        trace_id: uuid::Uuid::now_v7().to_string(),
    };

    let result = if sandbox_cfg.mode == "daemon" {
        let poll = tokio::time::Duration::from_millis(DAEMON_RESPONSE_POLL_MS);
        sandbox::run_daemon(ctx.ipc_base_dir(), group, &req, poll, cancel.clone()).await
    } else {
        sandbox::run_ephemeral(&sandbox_cfg.command, &sandbox_cfg.args, &req, cancel.clone()).await
    };

    // Permit is released when dropped at end of scope.
    drop(permit);

    match result {
        Ok(resp) if resp.status == SandboxStatus::Ok => {
            if persist_session {
                if let Some(new_session_id) = &resp.new_session_id {
                    if let Err(e) = ctx.sessions().upsert_group_session(&session_group, new_session_id) {
                        warn!(chat = %chat_id, err = %e, "failed to persist group session token");
                    }
                }
            }
            let content = resp.result.clone().unwrap_or_default();
            if !content.is_empty() {
                if let Err(e) = ctx.send_to_channel(
                    channel_from_chat_id(chat_id),
                    chat_id,
                    &content,
                ) {
                    warn!(chat = %chat_id, err = %e, "failed to deliver reply");
                }
            }
            for id in &ids {
                let _ = ctx.queue().complete(id);
            }
            info!(chat = %chat_id, model = %resp.model, latency_ms = resp.latency_ms, "batch delivered");
            let processed = ProcessedMessage {
                content,
                model: resp.model,
                tokens_in: 0,
                tokens_out: 0,
                stop_reason: "stop".to_string(),
            };
            for id in &ids {
                coordinator.notify(id, Ok(processed.clone()));
            }
            Ok(Some(processed))
        }
        Ok(resp) => {
            let err = resp.error.unwrap_or_else(|| "sandbox reported an error".to_string());
            requeue_or_fail(coordinator, ctx, chat_id, &ids, &err).await;
            Err(ProviderError::Unavailable(err))
        }
        Err(e) => {
            requeue_or_fail(coordinator, ctx, chat_id, &ids, &e.to_string()).await;
            Err(ProviderError::Unavailable(e.to_string()))
        }
    }
}

async fn requeue_or_fail<C: MessageContext + 'static>(
    coordinator: &Arc<DrainCoordinator>,
    ctx: &Arc<C>,
    chat_id: &str,
    ids: &[String],
    error: &str,
) {
    for id in ids {
        match ctx.queue().fail(id, error, MAX_BATCH_RETRIES) {
            Ok(skynet_queue::QueueItemStatus::Failed) => {
                let _ = ctx.send_to_channel(
                    channel_from_chat_id(chat_id),
                    chat_id,
                    "Sorry, something went wrong processing that message. Please try again.",
                );
                coordinator.notify(id, Err(error.to_string()));
            }
            Ok(_) => {}
            Err(e) => warn!(chat = %chat_id, id, err = %e, "failed to record batch failure"),
        }
    }
}

/// The queue's `Lane` (persisted per message) and the pool's `Lane` (used by
/// the admission semaphore) are distinct types from different crates but the
/// same three-way split — map one onto the other.
fn queue_lane_to_pool_lane(lane: skynet_queue::Lane) -> Lane {
    match lane {
        skynet_queue::Lane::Interactive => Lane::Interactive,
        skynet_queue::Lane::Scheduled => Lane::Scheduled,
        skynet_queue::Lane::Maintenance => Lane::Maintenance,
    }
}

fn channel_from_chat_id(chat_id: &str) -> &str {
    chat_id.split(':').next().unwrap_or(chat_id)
}

/// Join a batch of queued messages into one prompt, oldest first, each
/// prefixed with its enqueue timestamp so the agent sees real ordering.
fn compose_batch_prompt(batch: &[QueuedMessage]) -> String {
    batch
        .iter()
        .map(|m| format!("[{}] {}", m.enqueued_at, m.text))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use skynet_queue::{Lane as QueueLane, QueueItemStatus};

    fn msg(text: &str, ts: &str) -> QueuedMessage {
        QueuedMessage {
            id: "id".to_string(),
            chat_id: "telegram:1".to_string(),
            lane: QueueLane::Interactive,
            status: QueueItemStatus::Processing,
            text: text.to_string(),
            attachments: Vec::new(),
            enqueued_at: ts.to_string(),
            claimed_at: None,
            retry_count: 0,
            last_error: None,
        }
    }

    #[test]
    fn composes_batch_in_order_with_timestamps() {
        let batch = vec![msg("hi", "t1"), msg("there", "t2")];
        let prompt = compose_batch_prompt(&batch);
        assert_eq!(prompt, "[t1] hi\n[t2] there");
    }

    #[test]
    fn channel_from_chat_id_splits_on_colon() {
        assert_eq!(channel_from_chat_id("discord:12345"), "discord");
        assert_eq!(channel_from_chat_id("no-colon"), "no-colon");
    }
}
