use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("message {id} not found")]
    NotFound { id: String },

    #[error("message {id} is not in a claimable state (status={status})")]
    NotClaimable { id: String, status: String },
}

pub type Result<T> = std::result::Result<T, QueueError>;
