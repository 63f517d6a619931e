use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No conversation row exists for the given id.
    #[error("conversation not found: {id}")]
    ConversationNotFound { id: String },

    /// No message row exists for the given rowid.
    #[error("message not found: {id}")]
    MessageNotFound { id: i64 },

    /// No request task row exists for the given id.
    #[error("request task not found: {id}")]
    TaskNotFound { id: String },

    /// No failed-message row exists for the given rowid.
    #[error("failed message not found: {id}")]
    FailedMessageNotFound { id: i64 },

    /// A stored retry_history column did not parse as JSON.
    #[error("corrupt retry history on failed message {id}: {source}")]
    History {
        id: i64,
        #[source]
        source: serde_json::Error,
    },

    /// A SQLite operation failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
