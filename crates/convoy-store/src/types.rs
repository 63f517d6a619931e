use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lifecycle state of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    /// Receiving messages; the aggregator buffers for it.
    Active,
    /// No recent traffic. A new push reactivates it.
    Inactive,
    /// Ended by the caller. A new push reactivates it.
    Closed,
    /// Retired from normal operation; kept for history.
    Archived,
}

impl std::fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConversationStatus::Active => "active",
            ConversationStatus::Inactive => "inactive",
            ConversationStatus::Closed => "closed",
            ConversationStatus::Archived => "archived",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ConversationStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(ConversationStatus::Active),
            "inactive" => Ok(ConversationStatus::Inactive),
            "closed" => Ok(ConversationStatus::Closed),
            "archived" => Ok(ConversationStatus::Archived),
            other => Err(format!("unknown conversation status: {other}")),
        }
    }
}

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            other => Err(format!("unknown message role: {other}")),
        }
    }
}

/// Delivery state of a single message.
///
/// User messages walk pending → aggregated → sent (or failed);
/// assistant messages are written directly as received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Pushed but not yet folded into a batch.
    Pending,
    /// Folded into a request task that has not resolved yet.
    Aggregated,
    /// Its task completed; the backend saw this message.
    Sent,
    /// Its task failed or timed out.
    Failed,
    /// Backend reply, stored verbatim.
    Received,
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Aggregated => "aggregated",
            MessageStatus::Sent => "sent",
            MessageStatus::Failed => "failed",
            MessageStatus::Received => "received",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MessageStatus::Pending),
            "aggregated" => Ok(MessageStatus::Aggregated),
            "sent" => Ok(MessageStatus::Sent),
            "failed" => Ok(MessageStatus::Failed),
            "received" => Ok(MessageStatus::Received),
            other => Err(format!("unknown message status: {other}")),
        }
    }
}

/// Lifecycle state of a request task.
///
/// pending → processing → completed | failed | timeout;
/// failed/timeout → retrying (retry coordinator only) → processing.
/// `completed` is terminal; failed/timeout are terminal unless retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Sealed, waiting for a dispatcher worker.
    Pending,
    /// A backend call is in flight.
    Processing,
    /// The backend answered; response recorded.
    Completed,
    /// The backend errored; error recorded.
    Failed,
    /// The backend call exceeded the request timeout.
    Timeout,
    /// Queued again by the retry coordinator; dispatches like pending.
    Retrying,
}

impl TaskStatus {
    /// True when the dispatcher may claim this task for a backend call.
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Retrying)
    }

    /// True for failed/timeout, the states the retry coordinator acts on.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskStatus::Failed | TaskStatus::Timeout)
    }

    /// True when no further automatic transition occurs.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Timeout
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Timeout => "timeout",
            TaskStatus::Retrying => "retrying",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "timeout" => Ok(TaskStatus::Timeout),
            "retrying" => Ok(TaskStatus::Retrying),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// A persisted dialogue context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    /// Caller-supplied key, used as the primary key.
    pub id: String,
    pub status: ConversationStatus,
    /// RFC3339 timestamp of the most recent push.
    pub last_active_at: String,
    /// RFC3339 creation timestamp.
    pub created_at: String,
}

/// A persisted message row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// SQLite rowid.
    pub id: i64,
    pub conversation_id: String,
    pub role: MessageRole,
    pub status: MessageStatus,
    pub content: String,
    /// How many times a retry touched this message.
    pub retry_count: u32,
    /// The task this message was folded into, once aggregated.
    pub request_task_id: Option<String>,
    /// RFC3339 creation timestamp.
    pub created_at: String,
}

/// A persisted batch-dispatch task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestTask {
    /// UUID v7 string, used as the primary key. Sorts by seal time.
    pub id: String,
    pub conversation_id: String,
    pub status: TaskStatus,
    /// Batch texts joined in arrival order. Immutable after creation.
    pub content: String,
    /// Number of messages folded into this task.
    pub message_count: u32,
    /// Backend reply text; set only on completed.
    pub response: Option<String>,
    /// Failure description; set only on failed/timeout.
    pub error: Option<String>,
    /// RFC3339 timestamp of the most recent dispatch start.
    pub started_at: Option<String>,
    /// RFC3339 timestamp the task reached a terminal state.
    pub completed_at: Option<String>,
    /// RFC3339 creation timestamp.
    pub created_at: String,
}

/// One entry in a failed message's retry history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryAttempt {
    /// RFC3339 timestamp the retry ran.
    pub at: String,
    /// The task status after the retry: "completed", "failed" or "timeout".
    pub outcome: String,
}

/// Durable record of one failed dispatch attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedMessage {
    /// SQLite rowid.
    pub id: i64,
    pub conversation_id: String,
    /// The task whose dispatch failed, when one exists.
    pub request_task_id: Option<String>,
    /// Set when the failed batch had exactly one member; lets a retry
    /// rebuild a fresh task after the original is purged.
    pub message_id: Option<i64>,
    pub error: String,
    /// 1 for the first failure of a task, incrementing per subsequent failure.
    pub attempt_count: u32,
    /// RFC3339 timestamp of the failure.
    pub failed_at: String,
    /// Flipped to true by the first retry, never back.
    pub retried: bool,
    /// Append-only, oldest first. Its length counts against max_retries.
    pub retry_history: Vec<RetryAttempt>,
}

/// The active delivery configuration, read fresh per pipeline call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliverySettings {
    /// SQLite rowid.
    pub id: i64,
    /// Buffer size that forces an immediate flush.
    pub batch_size_threshold: u32,
    /// Maximum seconds a buffered message may wait before a time flush.
    pub batch_time_window_secs: u64,
    /// Seconds allowed per backend call.
    pub request_timeout_secs: u64,
    /// Cap on retry attempts per failed message.
    pub max_retries: u32,
    pub active: bool,
    /// RFC3339 creation timestamp.
    pub created_at: String,
}

impl DeliverySettings {
    pub fn batch_time_window(&self) -> Duration {
        Duration::from_secs(self.batch_time_window_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_round_trips_through_text() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Processing,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Timeout,
            TaskStatus::Retrying,
        ] {
            let parsed: TaskStatus = status.to_string().parse().expect("parse failed");
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn unknown_status_text_is_rejected() {
        assert!("cancelled".parse::<TaskStatus>().is_err());
        assert!("".parse::<MessageStatus>().is_err());
        assert!("system".parse::<MessageRole>().is_err());
    }

    #[test]
    fn dispatchable_states() {
        assert!(TaskStatus::Pending.is_dispatchable());
        assert!(TaskStatus::Retrying.is_dispatchable());
        assert!(!TaskStatus::Processing.is_dispatchable());
        assert!(!TaskStatus::Completed.is_dispatchable());
        assert!(!TaskStatus::Failed.is_dispatchable());
    }

    #[test]
    fn retryable_states_are_exactly_failed_and_timeout() {
        assert!(TaskStatus::Failed.is_retryable());
        assert!(TaskStatus::Timeout.is_retryable());
        assert!(!TaskStatus::Completed.is_retryable());
        assert!(!TaskStatus::Retrying.is_retryable());
    }

    #[test]
    fn settings_duration_helpers() {
        let settings = DeliverySettings {
            id: 1,
            batch_size_threshold: 5,
            batch_time_window_secs: 30,
            request_timeout_secs: 120,
            max_retries: 3,
            active: true,
            created_at: String::new(),
        };
        assert_eq!(settings.batch_time_window(), Duration::from_secs(30));
        assert_eq!(settings.request_timeout(), Duration::from_secs(120));
    }
}
