use std::sync::Mutex;

use chrono::Utc;
use rusqlite::Connection;
use tracing::{debug, info, instrument, warn};

use convoy_core::TaskId;

use crate::db::init_db;
use crate::error::{Result, StoreError};
use crate::types::{
    Conversation, ConversationStatus, DeliverySettings, FailedMessage, Message, MessageRole,
    MessageStatus, RequestTask, RetryAttempt, TaskStatus,
};

/// Thread-safe system of record for the delivery pipeline.
///
/// Wraps a single SQLite connection in a `Mutex`. Every state transition
/// the pipeline makes goes through here first; in-memory state (buffers,
/// in-flight sets) is rebuilt from these tables after a restart.
pub struct ConversationStore {
    db: Mutex<Connection>,
}

impl ConversationStore {
    /// Wrap a connection, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    // --- conversations -----------------------------------------------------

    /// Create the conversation on first contact, or refresh `last_active_at`
    /// and flip it back to active on every later push.
    #[instrument(skip(self))]
    pub fn upsert_conversation(&self, id: &str) -> Result<Conversation> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR IGNORE INTO conversations (id, status, last_active_at, created_at)
             VALUES (?1, 'active', ?2, ?2)",
            rusqlite::params![id, now],
        )?;
        db.execute(
            "UPDATE conversations SET status = 'active', last_active_at = ?2 WHERE id = ?1",
            rusqlite::params![id, now],
        )?;

        // Read back; covers the race where two callers insert simultaneously.
        let conversation = db.query_row(
            "SELECT id, status, last_active_at, created_at
             FROM conversations WHERE id = ?1",
            rusqlite::params![id],
            row_to_conversation,
        )?;
        Ok(conversation)
    }

    pub fn find_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT id, status, last_active_at, created_at
             FROM conversations WHERE id = ?1",
            rusqlite::params![id],
            row_to_conversation,
        ) {
            Ok(c) => Ok(Some(c)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    #[instrument(skip(self))]
    pub fn set_conversation_status(&self, id: &str, status: ConversationStatus) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE conversations SET status = ?1 WHERE id = ?2",
            rusqlite::params![status.to_string(), id],
        )?;
        if n == 0 {
            return Err(StoreError::ConversationNotFound { id: id.to_string() });
        }
        Ok(())
    }

    // --- messages ----------------------------------------------------------

    /// Append one message row and return the populated record.
    #[instrument(skip(self, content), fields(conversation = %conversation_id, role = %role))]
    pub fn append_message(
        &self,
        conversation_id: &str,
        role: MessageRole,
        status: MessageStatus,
        content: &str,
    ) -> Result<Message> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO messages (conversation_id, role, status, content, retry_count, created_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5)",
            rusqlite::params![conversation_id, role.to_string(), status.to_string(), content, now],
        )?;
        let id = db.last_insert_rowid();
        debug!(message_id = id, "message appended");

        Ok(Message {
            id,
            conversation_id: conversation_id.to_string(),
            role,
            status,
            content: content.to_string(),
            retry_count: 0,
            request_task_id: None,
            created_at: now,
        })
    }

    pub fn find_message(&self, id: i64) -> Result<Option<Message>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT id, conversation_id, role, status, content, retry_count,
                    request_task_id, created_at
             FROM messages WHERE id = ?1",
            rusqlite::params![id],
            row_to_message,
        ) {
            Ok(m) => Ok(Some(m)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    pub fn update_message_status(&self, id: i64, status: MessageStatus) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE messages SET status = ?1 WHERE id = ?2",
            rusqlite::params![status.to_string(), id],
        )?;
        if n == 0 {
            return Err(StoreError::MessageNotFound { id });
        }
        Ok(())
    }

    /// Move a whole set of messages to one status in a single transaction.
    pub fn update_message_statuses(&self, ids: &[i64], status: MessageStatus) -> Result<()> {
        let status = status.to_string();
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        {
            let mut stmt = tx.prepare("UPDATE messages SET status = ?1 WHERE id = ?2")?;
            for id in ids {
                stmt.execute(rusqlite::params![status, id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn increment_message_retries(&self, id: i64) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE messages SET retry_count = retry_count + 1 WHERE id = ?1",
            rusqlite::params![id],
        )?;
        if n == 0 {
            return Err(StoreError::MessageNotFound { id });
        }
        Ok(())
    }

    /// Bump the retry count of every batch member of a task at once.
    /// Returns how many messages were touched.
    pub fn increment_task_message_retries(&self, task_id: &str) -> Result<usize> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE messages SET retry_count = retry_count + 1 WHERE request_task_id = ?1",
            rusqlite::params![task_id],
        )?;
        Ok(n)
    }

    /// All messages of a conversation in arrival order.
    pub fn messages_for_conversation(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, conversation_id, role, status, content, retry_count,
                    request_task_id, created_at
             FROM messages WHERE conversation_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(rusqlite::params![conversation_id], row_to_message)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// The batch members of a task in arrival order (user messages only;
    /// the assistant reply is not linked to the task).
    pub fn messages_for_task(&self, task_id: &str) -> Result<Vec<Message>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, conversation_id, role, status, content, retry_count,
                    request_task_id, created_at
             FROM messages WHERE request_task_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(rusqlite::params![task_id], row_to_message)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // --- request tasks -----------------------------------------------------

    /// Seal a batch: insert one pending task and mark its member messages
    /// aggregated, atomically. `content` must be the member texts joined in
    /// arrival order; it is never updated after this call.
    #[instrument(skip(self, content, message_ids), fields(conversation = %conversation_id, messages = message_ids.len()))]
    pub fn create_task(
        &self,
        conversation_id: &str,
        message_ids: &[i64],
        content: &str,
    ) -> Result<RequestTask> {
        let id = TaskId::new().to_string();
        let now = Utc::now().to_rfc3339();
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO request_tasks
             (id, conversation_id, status, content, message_count, created_at)
             VALUES (?1, ?2, 'pending', ?3, ?4, ?5)",
            rusqlite::params![id, conversation_id, content, message_ids.len() as i64, now],
        )?;
        {
            let mut stmt = tx.prepare(
                "UPDATE messages SET status = 'aggregated', request_task_id = ?1 WHERE id = ?2",
            )?;
            for message_id in message_ids {
                stmt.execute(rusqlite::params![id, message_id])?;
            }
        }
        tx.commit()?;

        info!(task_id = %id, "batch sealed into task");

        Ok(RequestTask {
            id,
            conversation_id: conversation_id.to_string(),
            status: TaskStatus::Pending,
            content: content.to_string(),
            message_count: message_ids.len() as u32,
            response: None,
            error: None,
            started_at: None,
            completed_at: None,
            created_at: now,
        })
    }

    pub fn find_task(&self, id: &str) -> Result<Option<RequestTask>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT id, conversation_id, status, content, message_count, response,
                    error, started_at, completed_at, created_at
             FROM request_tasks WHERE id = ?1",
            rusqlite::params![id],
            row_to_task,
        ) {
            Ok(t) => Ok(Some(t)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    /// Claim a task for dispatch: pending/retrying → processing.
    ///
    /// Returns false when the task is in any other state, which means some
    /// other worker (or an earlier attempt) already owns it. The guard in
    /// the WHERE clause is what makes concurrent dispatch safe.
    #[instrument(skip(self))]
    pub fn mark_task_processing(&self, id: &str) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE request_tasks SET status = 'processing', started_at = ?1
             WHERE id = ?2 AND status IN ('pending', 'retrying')",
            rusqlite::params![now, id],
        )?;
        Ok(n == 1)
    }

    /// Re-open a failed/timeout task for another dispatch attempt.
    ///
    /// Returns false when the task is not in a retryable state, notably
    /// when a racing dispatch already completed it.
    #[instrument(skip(self))]
    pub fn mark_task_retrying(&self, id: &str) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE request_tasks SET status = 'retrying', completed_at = NULL
             WHERE id = ?1 AND status IN ('failed', 'timeout')",
            rusqlite::params![id],
        )?;
        Ok(n == 1)
    }

    /// Record a successful dispatch: task → completed, member messages →
    /// sent, and the backend reply stored as a new assistant message.
    /// All three writes commit together.
    #[instrument(skip(self, response))]
    pub fn complete_task(&self, id: &str, response: &str) -> Result<Message> {
        let now = Utc::now().to_rfc3339();
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;

        let conversation_id: String = match tx.query_row(
            "SELECT conversation_id FROM request_tasks WHERE id = ?1",
            rusqlite::params![id],
            |row| row.get(0),
        ) {
            Ok(c) => c,
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                return Err(StoreError::TaskNotFound { id: id.to_string() })
            }
            Err(e) => return Err(StoreError::Database(e)),
        };

        tx.execute(
            "UPDATE request_tasks
             SET status = 'completed', response = ?1, error = NULL, completed_at = ?2
             WHERE id = ?3",
            rusqlite::params![response, now, id],
        )?;
        tx.execute(
            "UPDATE messages SET status = 'sent' WHERE request_task_id = ?1 AND role = 'user'",
            rusqlite::params![id],
        )?;
        tx.execute(
            "INSERT INTO messages (conversation_id, role, status, content, retry_count, created_at)
             VALUES (?1, 'assistant', 'received', ?2, 0, ?3)",
            rusqlite::params![conversation_id, response, now],
        )?;
        let message_id = tx.last_insert_rowid();
        tx.commit()?;

        info!(task_id = %id, "task completed");

        Ok(Message {
            id: message_id,
            conversation_id,
            role: MessageRole::Assistant,
            status: MessageStatus::Received,
            content: response.to_string(),
            retry_count: 0,
            request_task_id: None,
            created_at: now,
        })
    }

    /// Record a backend failure: task → failed, member messages → failed,
    /// plus one durable failed_messages row. Commits atomically so no
    /// failure is ever observable without its failed_messages record.
    pub fn fail_task(&self, id: &str, error: &str) -> Result<FailedMessage> {
        self.finish_task_failure(id, error, TaskStatus::Failed)
    }

    /// Same as [`fail_task`](Self::fail_task) but records the distinct
    /// `timeout` status for calls that exceeded the request timeout.
    pub fn timeout_task(&self, id: &str, error: &str) -> Result<FailedMessage> {
        self.finish_task_failure(id, error, TaskStatus::Timeout)
    }

    fn finish_task_failure(
        &self,
        id: &str,
        error: &str,
        status: TaskStatus,
    ) -> Result<FailedMessage> {
        let now = Utc::now().to_rfc3339();
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;

        let conversation_id: String = match tx.query_row(
            "SELECT conversation_id FROM request_tasks WHERE id = ?1",
            rusqlite::params![id],
            |row| row.get(0),
        ) {
            Ok(c) => c,
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                return Err(StoreError::TaskNotFound { id: id.to_string() })
            }
            Err(e) => return Err(StoreError::Database(e)),
        };

        tx.execute(
            "UPDATE request_tasks SET status = ?1, error = ?2, completed_at = ?3 WHERE id = ?4",
            rusqlite::params![status.to_string(), error, now, id],
        )?;
        tx.execute(
            "UPDATE messages SET status = 'failed' WHERE request_task_id = ?1 AND role = 'user'",
            rusqlite::params![id],
        )?;

        // One-message batches keep a direct message link so a retry can
        // rebuild a fresh task even after this task is purged.
        let message_id: Option<i64> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM messages WHERE request_task_id = ?1 AND role = 'user'",
            )?;
            let member_ids: Vec<i64> = stmt
                .query_map(rusqlite::params![id], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            if member_ids.len() == 1 {
                Some(member_ids[0])
            } else {
                None
            }
        };

        let prior_failures: i64 = tx.query_row(
            "SELECT COUNT(*) FROM failed_messages WHERE request_task_id = ?1",
            rusqlite::params![id],
            |row| row.get(0),
        )?;
        let attempt_count = prior_failures as u32 + 1;

        tx.execute(
            "INSERT INTO failed_messages
             (conversation_id, request_task_id, message_id, error, attempt_count,
              failed_at, retried, retry_history)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, '[]')",
            rusqlite::params![conversation_id, id, message_id, error, attempt_count, now],
        )?;
        let failed_id = tx.last_insert_rowid();
        tx.commit()?;

        warn!(task_id = %id, status = %status, attempt = attempt_count, "task dispatch failed");

        Ok(FailedMessage {
            id: failed_id,
            conversation_id,
            request_task_id: Some(id.to_string()),
            message_id,
            error: error.to_string(),
            attempt_count,
            failed_at: now,
            retried: false,
            retry_history: Vec::new(),
        })
    }

    /// Tasks in one state, oldest first. Dispatch order for the recovery
    /// sweep follows this ordering.
    pub fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<RequestTask>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, conversation_id, status, content, message_count, response,
                    error, started_at, completed_at, created_at
             FROM request_tasks WHERE status = ?1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map(rusqlite::params![status.to_string()], row_to_task)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Every task sealed from one conversation, in seal order.
    pub fn tasks_for_conversation(&self, conversation_id: &str) -> Result<Vec<RequestTask>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, conversation_id, status, content, message_count, response,
                    error, started_at, completed_at, created_at
             FROM request_tasks WHERE conversation_id = ?1 ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map(rusqlite::params![conversation_id], row_to_task)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Delete terminal tasks older than `max_age`. Failed-message rows are
    /// dropped only for completed tasks; rows for failed or timed-out tasks
    /// survive the purge and stay retryable through their linked message.
    /// Message rows are kept untouched. Returns the number of tasks removed.
    /// Never runs automatically.
    #[instrument(skip(self))]
    pub fn purge_terminal_tasks(&self, max_age: chrono::Duration) -> Result<usize> {
        let cutoff = (Utc::now() - max_age).to_rfc3339();
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        tx.execute(
            "DELETE FROM failed_messages WHERE request_task_id IN (
                SELECT id FROM request_tasks
                WHERE status = 'completed' AND completed_at < ?1)",
            rusqlite::params![cutoff],
        )?;
        let n = tx.execute(
            "DELETE FROM request_tasks
             WHERE status IN ('completed', 'failed', 'timeout') AND completed_at < ?1",
            rusqlite::params![cutoff],
        )?;
        tx.commit()?;
        if n > 0 {
            info!(purged = n, "terminal tasks purged");
        }
        Ok(n)
    }

    // --- failed messages ---------------------------------------------------

    pub fn find_failed_message(&self, id: i64) -> Result<Option<FailedMessage>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT id, conversation_id, request_task_id, message_id, error,
                    attempt_count, failed_at, retried, retry_history
             FROM failed_messages WHERE id = ?1",
            rusqlite::params![id],
            row_to_failed_message,
        ) {
            Ok(f) => Ok(Some(f)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    pub fn failed_messages_for_task(&self, task_id: &str) -> Result<Vec<FailedMessage>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, conversation_id, request_task_id, message_id, error,
                    attempt_count, failed_at, retried, retry_history
             FROM failed_messages WHERE request_task_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(rusqlite::params![task_id], row_to_failed_message)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Failed deliveries no retry has touched yet, oldest failure first.
    pub fn unretried_failed_messages(&self) -> Result<Vec<FailedMessage>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, conversation_id, request_task_id, message_id, error,
                    attempt_count, failed_at, retried, retry_history
             FROM failed_messages WHERE retried = 0 ORDER BY failed_at",
        )?;
        let rows = stmt.query_map([], row_to_failed_message)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Append one {at, outcome} entry to the retry history and set the
    /// retried flag. The history is append-only; nothing ever rewrites it.
    ///
    /// The length check and the append run under one connection-lock hold,
    /// so this doubles as the budget claim: an entry that would push the
    /// history past `max_attempts` is refused and `false` returned, the
    /// same idiom as the guarded `processing` claim on tasks.
    #[instrument(skip(self))]
    pub fn record_retry_attempt(&self, id: i64, outcome: &str, max_attempts: u32) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let history_json: String = match db.query_row(
            "SELECT retry_history FROM failed_messages WHERE id = ?1",
            rusqlite::params![id],
            |row| row.get(0),
        ) {
            Ok(h) => h,
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                return Err(StoreError::FailedMessageNotFound { id })
            }
            Err(e) => return Err(StoreError::Database(e)),
        };

        let mut history: Vec<RetryAttempt> =
            serde_json::from_str(&history_json).map_err(|source| StoreError::History { id, source })?;
        if history.len() >= max_attempts as usize {
            debug!(failed_id = id, attempts = history.len(), "retry history at capacity");
            return Ok(false);
        }
        history.push(RetryAttempt {
            at: Utc::now().to_rfc3339(),
            outcome: outcome.to_string(),
        });
        let updated =
            serde_json::to_string(&history).map_err(|source| StoreError::History { id, source })?;

        db.execute(
            "UPDATE failed_messages SET retry_history = ?1, retried = 1 WHERE id = ?2",
            rusqlite::params![updated, id],
        )?;
        debug!(failed_id = id, attempts = history.len(), outcome, "retry attempt recorded");
        Ok(true)
    }

    // --- delivery settings -------------------------------------------------

    /// The single active configuration, or `None` when an operator has not
    /// activated one yet. Pipeline calls treat `None` as fatal.
    pub fn active_settings(&self) -> Result<Option<DeliverySettings>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT id, batch_size_threshold, batch_time_window_secs, request_timeout_secs,
                    max_retries, active, created_at
             FROM delivery_settings WHERE active = 1 ORDER BY id DESC LIMIT 1",
            [],
            row_to_settings,
        ) {
            Ok(s) => Ok(Some(s)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    /// Install a new configuration and deactivate every other row in the
    /// same transaction, keeping the single-active-row rule intact.
    #[instrument(skip(self))]
    pub fn activate_settings(
        &self,
        batch_size_threshold: u32,
        batch_time_window_secs: u64,
        request_timeout_secs: u64,
        max_retries: u32,
    ) -> Result<DeliverySettings> {
        let now = Utc::now().to_rfc3339();
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        tx.execute("UPDATE delivery_settings SET active = 0 WHERE active = 1", [])?;
        tx.execute(
            "INSERT INTO delivery_settings
             (batch_size_threshold, batch_time_window_secs, request_timeout_secs,
              max_retries, active, created_at)
             VALUES (?1, ?2, ?3, ?4, 1, ?5)",
            rusqlite::params![
                batch_size_threshold,
                batch_time_window_secs as i64,
                request_timeout_secs as i64,
                max_retries,
                now
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        info!(settings_id = id, batch_size_threshold, max_retries, "delivery settings activated");

        Ok(DeliverySettings {
            id,
            batch_size_threshold,
            batch_time_window_secs,
            request_timeout_secs,
            max_retries,
            active: true,
            created_at: now,
        })
    }
}

// --- row mappers -----------------------------------------------------------

/// Parse a TEXT status column, surfacing bad values as a conversion error
/// instead of silently defaulting.
fn parse_status<T>(idx: usize, s: String) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    s.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let status_str: String = row.get(1)?;
    Ok(Conversation {
        id: row.get(0)?,
        status: parse_status(1, status_str)?,
        last_active_at: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let role_str: String = row.get(2)?;
    let status_str: String = row.get(3)?;
    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        role: parse_status(2, role_str)?,
        status: parse_status(3, status_str)?,
        content: row.get(4)?,
        retry_count: row.get(5)?,
        request_task_id: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<RequestTask> {
    let status_str: String = row.get(2)?;
    Ok(RequestTask {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        status: parse_status(2, status_str)?,
        content: row.get(3)?,
        message_count: row.get(4)?,
        response: row.get(5)?,
        error: row.get(6)?,
        started_at: row.get(7)?,
        completed_at: row.get(8)?,
        created_at: row.get(9)?,
    })
}

fn row_to_failed_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<FailedMessage> {
    let history_json: String = row.get(8)?;
    let retry_history: Vec<RetryAttempt> = serde_json::from_str(&history_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(FailedMessage {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        request_task_id: row.get(2)?,
        message_id: row.get(3)?,
        error: row.get(4)?,
        attempt_count: row.get(5)?,
        failed_at: row.get(6)?,
        retried: row.get(7)?,
        retry_history,
    })
}

fn row_to_settings(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeliverySettings> {
    Ok(DeliverySettings {
        id: row.get(0)?,
        batch_size_threshold: row.get(1)?,
        batch_time_window_secs: row.get::<_, i64>(2)? as u64,
        request_timeout_secs: row.get::<_, i64>(3)? as u64,
        max_retries: row.get(4)?,
        active: row.get(5)?,
        created_at: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> ConversationStore {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        ConversationStore::new(conn).expect("init store")
    }

    fn seal_two_message_task(store: &ConversationStore, conversation: &str) -> RequestTask {
        store.upsert_conversation(conversation).unwrap();
        let a = store
            .append_message(conversation, MessageRole::User, MessageStatus::Pending, "A")
            .unwrap();
        let b = store
            .append_message(conversation, MessageRole::User, MessageStatus::Pending, "B")
            .unwrap();
        store.create_task(conversation, &[a.id, b.id], "A\nB").unwrap()
    }

    #[test]
    fn upsert_creates_then_reactivates() {
        let store = test_store();
        let first = store.upsert_conversation("conv-1").unwrap();
        assert_eq!(first.status, ConversationStatus::Active);

        store
            .set_conversation_status("conv-1", ConversationStatus::Closed)
            .unwrap();
        let again = store.upsert_conversation("conv-1").unwrap();
        assert_eq!(again.status, ConversationStatus::Active);
        assert_eq!(again.created_at, first.created_at);
    }

    #[test]
    fn set_status_on_unknown_conversation_errs() {
        let store = test_store();
        let err = store
            .set_conversation_status("ghost", ConversationStatus::Archived)
            .unwrap_err();
        assert!(matches!(err, StoreError::ConversationNotFound { .. }));
    }

    #[test]
    fn append_and_find_message() {
        let store = test_store();
        store.upsert_conversation("conv-1").unwrap();
        let msg = store
            .append_message("conv-1", MessageRole::User, MessageStatus::Pending, "hello")
            .unwrap();

        let found = store.find_message(msg.id).unwrap().expect("message exists");
        assert_eq!(found.content, "hello");
        assert_eq!(found.status, MessageStatus::Pending);
        assert_eq!(found.role, MessageRole::User);
        assert!(found.request_task_id.is_none());
    }

    #[test]
    fn create_task_marks_members_aggregated() {
        let store = test_store();
        let task = seal_two_message_task(&store, "conv-1");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.message_count, 2);
        assert_eq!(task.content, "A\nB");

        let members = store.messages_for_task(&task.id).unwrap();
        assert_eq!(members.len(), 2);
        for m in &members {
            assert_eq!(m.status, MessageStatus::Aggregated);
            assert_eq!(m.request_task_id.as_deref(), Some(task.id.as_str()));
        }
    }

    #[test]
    fn processing_claim_succeeds_once() {
        let store = test_store();
        let task = seal_two_message_task(&store, "conv-1");

        assert!(store.mark_task_processing(&task.id).unwrap());
        // Already processing, so the second claim must lose.
        assert!(!store.mark_task_processing(&task.id).unwrap());

        let current = store.find_task(&task.id).unwrap().unwrap();
        assert_eq!(current.status, TaskStatus::Processing);
        assert!(current.started_at.is_some());
    }

    #[test]
    fn complete_task_updates_messages_and_stores_reply() {
        let store = test_store();
        let task = seal_two_message_task(&store, "conv-1");
        store.mark_task_processing(&task.id).unwrap();

        let reply = store.complete_task(&task.id, "the answer").unwrap();
        assert_eq!(reply.role, MessageRole::Assistant);
        assert_eq!(reply.status, MessageStatus::Received);

        let current = store.find_task(&task.id).unwrap().unwrap();
        assert_eq!(current.status, TaskStatus::Completed);
        assert_eq!(current.response.as_deref(), Some("the answer"));
        assert!(current.completed_at.is_some());

        for m in store.messages_for_task(&task.id).unwrap() {
            assert_eq!(m.status, MessageStatus::Sent);
        }
        // Reply is part of the conversation but not a batch member.
        let all = store.messages_for_conversation("conv-1").unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn fail_task_writes_failed_message_row() {
        let store = test_store();
        let task = seal_two_message_task(&store, "conv-1");
        store.mark_task_processing(&task.id).unwrap();

        let failed = store.fail_task(&task.id, "connection refused").unwrap();
        assert_eq!(failed.attempt_count, 1);
        assert!(!failed.retried);
        assert_eq!(failed.request_task_id.as_deref(), Some(task.id.as_str()));
        // Two-message batch: no single message to link.
        assert!(failed.message_id.is_none());

        let current = store.find_task(&task.id).unwrap().unwrap();
        assert_eq!(current.status, TaskStatus::Failed);
        assert_eq!(current.error.as_deref(), Some("connection refused"));

        for m in store.messages_for_task(&task.id).unwrap() {
            assert_eq!(m.status, MessageStatus::Failed);
        }
    }

    #[test]
    fn second_failure_increments_attempt_count() {
        let store = test_store();
        let task = seal_two_message_task(&store, "conv-1");
        store.mark_task_processing(&task.id).unwrap();
        store.fail_task(&task.id, "boom").unwrap();

        assert!(store.mark_task_retrying(&task.id).unwrap());
        assert!(store.mark_task_processing(&task.id).unwrap());
        let second = store.fail_task(&task.id, "boom again").unwrap();
        assert_eq!(second.attempt_count, 2);

        let rows = store.failed_messages_for_task(&task.id).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn single_member_failure_links_the_message() {
        let store = test_store();
        store.upsert_conversation("conv-1").unwrap();
        let msg = store
            .append_message("conv-1", MessageRole::User, MessageStatus::Pending, "solo")
            .unwrap();
        let task = store.create_task("conv-1", &[msg.id], "solo").unwrap();
        store.mark_task_processing(&task.id).unwrap();

        let failed = store.fail_task(&task.id, "boom").unwrap();
        assert_eq!(failed.message_id, Some(msg.id));
    }

    #[test]
    fn retrying_allowed_only_from_failed_or_timeout() {
        let store = test_store();
        let task = seal_two_message_task(&store, "conv-1");

        // pending → retrying is not a legal transition
        assert!(!store.mark_task_retrying(&task.id).unwrap());

        store.mark_task_processing(&task.id).unwrap();
        store.complete_task(&task.id, "done").unwrap();
        // completed is terminal
        assert!(!store.mark_task_retrying(&task.id).unwrap());
    }

    #[test]
    fn timeout_task_records_distinct_status() {
        let store = test_store();
        let task = seal_two_message_task(&store, "conv-1");
        store.mark_task_processing(&task.id).unwrap();

        store.timeout_task(&task.id, "timed out after 30s").unwrap();
        let current = store.find_task(&task.id).unwrap().unwrap();
        assert_eq!(current.status, TaskStatus::Timeout);

        // timeout is retry-eligible exactly like failed
        assert!(store.mark_task_retrying(&task.id).unwrap());
    }

    #[test]
    fn record_retry_attempt_appends_history() {
        let store = test_store();
        let task = seal_two_message_task(&store, "conv-1");
        store.mark_task_processing(&task.id).unwrap();
        let failed = store.fail_task(&task.id, "boom").unwrap();

        assert!(store.record_retry_attempt(failed.id, "failed", 5).unwrap());
        assert!(store.record_retry_attempt(failed.id, "completed", 5).unwrap());

        let current = store.find_failed_message(failed.id).unwrap().unwrap();
        assert!(current.retried);
        assert_eq!(current.retry_history.len(), 2);
        assert_eq!(current.retry_history[0].outcome, "failed");
        assert_eq!(current.retry_history[1].outcome, "completed");
    }

    #[test]
    fn history_append_refuses_past_cap() {
        let store = test_store();
        let task = seal_two_message_task(&store, "conv-1");
        store.mark_task_processing(&task.id).unwrap();
        let failed = store.fail_task(&task.id, "boom").unwrap();

        assert!(store.record_retry_attempt(failed.id, "failed", 2).unwrap());
        assert!(store.record_retry_attempt(failed.id, "failed", 2).unwrap());
        // two callers can pass a stale length check; the append itself holds
        // the line
        assert!(!store.record_retry_attempt(failed.id, "completed", 2).unwrap());

        let current = store.find_failed_message(failed.id).unwrap().unwrap();
        assert_eq!(current.retry_history.len(), 2);
    }

    #[test]
    fn unretried_excludes_touched_rows() {
        let store = test_store();
        let task = seal_two_message_task(&store, "conv-1");
        store.mark_task_processing(&task.id).unwrap();
        let failed = store.fail_task(&task.id, "boom").unwrap();

        assert_eq!(store.unretried_failed_messages().unwrap().len(), 1);
        assert!(store.record_retry_attempt(failed.id, "failed", 5).unwrap());
        assert!(store.unretried_failed_messages().unwrap().is_empty());
    }

    #[test]
    fn activate_settings_keeps_single_active_row() {
        let store = test_store();
        assert!(store.active_settings().unwrap().is_none());

        store.activate_settings(5, 30, 120, 3).unwrap();
        let second = store.activate_settings(10, 60, 90, 5).unwrap();

        let active = store.active_settings().unwrap().expect("active row");
        assert_eq!(active.id, second.id);
        assert_eq!(active.batch_size_threshold, 10);
        assert_eq!(active.max_retries, 5);
    }

    #[test]
    fn purge_removes_old_terminal_tasks_only() {
        let store = test_store();
        let done = seal_two_message_task(&store, "conv-1");
        store.mark_task_processing(&done.id).unwrap();
        store.complete_task(&done.id, "ok").unwrap();

        let failed = seal_two_message_task(&store, "conv-2");
        store.mark_task_processing(&failed.id).unwrap();
        store.fail_task(&failed.id, "boom").unwrap();

        let open = seal_two_message_task(&store, "conv-3");

        // completed_at strictly before the cutoff computed below
        std::thread::sleep(std::time::Duration::from_millis(5));
        let purged = store.purge_terminal_tasks(chrono::Duration::zero()).unwrap();
        assert_eq!(purged, 2);

        assert!(store.find_task(&done.id).unwrap().is_none());
        assert!(store.find_task(&failed.id).unwrap().is_none());
        assert!(store.find_task(&open.id).unwrap().is_some());
        // the failure record outlives its purged task and stays retryable
        assert_eq!(store.failed_messages_for_task(&failed.id).unwrap().len(), 1);
    }

    #[test]
    fn purge_drops_failure_rows_of_completed_tasks() {
        let store = test_store();
        let task = seal_two_message_task(&store, "conv-1");
        store.mark_task_processing(&task.id).unwrap();
        store.fail_task(&task.id, "first try failed").unwrap();
        store.mark_task_retrying(&task.id).unwrap();
        store.mark_task_processing(&task.id).unwrap();
        store.complete_task(&task.id, "second try won").unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        store.purge_terminal_tasks(chrono::Duration::zero()).unwrap();

        // the eventual success makes the old failure row disposable
        assert!(store.failed_messages_for_task(&task.id).unwrap().is_empty());
    }

    #[test]
    fn single_status_update_checks_existence() {
        let store = test_store();
        store.upsert_conversation("conv-1").unwrap();
        let msg = store
            .append_message("conv-1", MessageRole::User, MessageStatus::Pending, "A")
            .unwrap();

        store.update_message_status(msg.id, MessageStatus::Sent).unwrap();
        assert_eq!(
            store.find_message(msg.id).unwrap().unwrap().status,
            MessageStatus::Sent
        );

        let err = store
            .update_message_status(9999, MessageStatus::Sent)
            .unwrap_err();
        assert!(matches!(err, StoreError::MessageNotFound { id: 9999 }));
    }

    #[test]
    fn bulk_status_update_moves_all_rows() {
        let store = test_store();
        store.upsert_conversation("conv-1").unwrap();
        let a = store
            .append_message("conv-1", MessageRole::User, MessageStatus::Pending, "A")
            .unwrap();
        let b = store
            .append_message("conv-1", MessageRole::User, MessageStatus::Pending, "B")
            .unwrap();

        store
            .update_message_statuses(&[a.id, b.id], MessageStatus::Failed)
            .unwrap();
        assert_eq!(
            store.find_message(a.id).unwrap().unwrap().status,
            MessageStatus::Failed
        );
        assert_eq!(
            store.find_message(b.id).unwrap().unwrap().status,
            MessageStatus::Failed
        );
    }

    #[test]
    fn task_retry_bump_touches_members_only() {
        let store = test_store();
        let task = seal_two_message_task(&store, "conv-1");
        let other = store
            .append_message("conv-1", MessageRole::User, MessageStatus::Pending, "C")
            .unwrap();

        let touched = store.increment_task_message_retries(&task.id).unwrap();
        assert_eq!(touched, 2);

        for m in store.messages_for_task(&task.id).unwrap() {
            assert_eq!(m.retry_count, 1);
        }
        assert_eq!(store.find_message(other.id).unwrap().unwrap().retry_count, 0);
    }
}
