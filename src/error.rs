use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Job serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown worker type: {0}")]
    UnknownWorker(String),

    /// The scheduler actor is gone. Outstanding submissions cannot make
    /// progress; the supervising layer is expected to rebuild the queue.
    #[error("Scheduler is not available")]
    SchedulerUnavailable,
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// Synthetic error for a worker task that terminated without producing a
/// result (aborted or killed mid-run).
#[derive(Debug, Error)]
#[error("The job runner crashed. Reason: {0}")]
pub struct CrashError(pub String);
