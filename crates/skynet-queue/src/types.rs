use serde::{Deserialize, Serialize};

/// Lifecycle state of a queued message row.
///
/// `pending -> processing -> completed` is the happy path. A worker that
/// dies mid-processing leaves a row `processing`; `resetStalled` requeues it
/// back to `pending` once its age exceeds the configured stalled threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl std::fmt::Display for QueueItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for QueueItemStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown queue item status: {other}")),
        }
    }
}

/// Which admission lane a message belongs to once it reaches C4.
///
/// Carried on the queue row so a batch can be handed to the semaphore with
/// the right priority without a second lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    Interactive,
    Scheduled,
    Maintenance,
}

impl Lane {
    /// Higher is more urgent — interactive=3, scheduled=2, maintenance=1.
    pub fn priority(self) -> u8 {
        match self {
            Lane::Interactive => 3,
            Lane::Scheduled => 2,
            Lane::Maintenance => 1,
        }
    }
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Lane::Interactive => "interactive",
            Lane::Scheduled => "scheduled",
            Lane::Maintenance => "maintenance",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Lane {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "interactive" => Ok(Lane::Interactive),
            "scheduled" => Ok(Lane::Scheduled),
            "maintenance" => Ok(Lane::Maintenance),
            other => Err(format!("unknown lane: {other}")),
        }
    }
}

/// An inbound image/file attachment referenced by a queued message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub mime_type: String,
    pub size_bytes: u64,
}

/// A single unit of inbound work, durably persisted until processed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    /// UUIDv7 — time-sortable, used as the claim-ordering tiebreaker.
    pub id: String,
    pub chat_id: String,
    pub lane: Lane,
    pub status: QueueItemStatus,
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// ISO-8601; batch windowing groups by proximity to this timestamp.
    pub enqueued_at: String,
    /// Set when a worker claims the row; used by `resetStalled`.
    pub claimed_at: Option<String>,
    pub retry_count: u32,
    pub last_error: Option<String>,
}
