use thiserror::Error;

use convoy_store::StoreError;

/// Errors surfaced by the aggregator, dispatcher and retry coordinator.
///
/// A failed or timed-out dispatch is not in this list: the fault is recorded
/// on the task row and reported through its status, so `process` still
/// returns `Ok` with the terminal record.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// No active delivery settings row exists. Activating settings is an
    /// explicit administrative step; the pipeline never invents defaults.
    #[error("no active delivery settings; activate settings before pushing")]
    NoActiveSettings,

    #[error("request task not found: {id}")]
    TaskNotFound { id: String },

    #[error("failed message not found: {id}")]
    FailedMessageNotFound { id: i64 },

    /// The failed message row points at neither a live task nor a live
    /// message, so there is nothing left to dispatch.
    #[error("failed message {id} references no live task or message")]
    DanglingFailedMessage { id: i64 },

    #[error("retry budget exhausted for failed message {id}: {max_retries} attempts recorded")]
    RetryBudgetExhausted { id: i64, max_retries: u32 },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
