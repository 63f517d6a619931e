//! Manual re-dispatch of failed batches, bounded by the retry budget.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use convoy_core::TaskId;
use convoy_store::{ConversationStore, FailedMessage, RequestTask, TaskStatus};

use crate::dispatcher::TaskDispatcher;
use crate::error::{PipelineError, Result};

/// Outcome summary for a task-level retry request.
#[derive(Debug, Clone, Serialize)]
pub struct RetryReport {
    pub success: bool,
    pub message: String,
}

/// Drives retries of failed messages through the dispatcher and keeps the
/// durable retry history on each failed-message row.
pub struct RetryCoordinator {
    store: Arc<ConversationStore>,
    dispatcher: Arc<TaskDispatcher>,
}

impl RetryCoordinator {
    pub fn new(store: Arc<ConversationStore>, dispatcher: Arc<TaskDispatcher>) -> Self {
        Self { store, dispatcher }
    }

    /// Retry one failed message by its failed-messages id.
    ///
    /// The recorded task is re-dispatched when it still exists; when it was
    /// purged, a fresh single-message task is rebuilt from the linked
    /// message. A task that completed meanwhile is a no-op success, not a
    /// duplicate send. Every attempt appends one entry to the retry history
    /// and sets `retried`, whatever the outcome, and the history may never
    /// grow past the configured retry budget.
    pub async fn retry_failed_message(&self, id: i64) -> Result<RequestTask> {
        let settings = self
            .store
            .active_settings()?
            .ok_or(PipelineError::NoActiveSettings)?;
        let failed = self
            .store
            .find_failed_message(id)?
            .ok_or(PipelineError::FailedMessageNotFound { id })?;

        if failed.retry_history.len() >= settings.max_retries as usize {
            return Err(PipelineError::RetryBudgetExhausted {
                id,
                max_retries: settings.max_retries,
            });
        }

        let task = self.resolve_task(&failed)?;
        if task.status.is_retryable() {
            // Re-open for dispatch. Losing this update to a racing state
            // change is fine; process() re-checks and no-ops safely.
            if self.store.mark_task_retrying(&task.id)? {
                self.store.increment_task_message_retries(&task.id)?;
            }
        }

        let task_id = TaskId::from(task.id);
        let result = self.dispatcher.process(&task_id).await;

        let outcome = match &result {
            Ok(task) => task.status.to_string(),
            Err(e) => e.to_string(),
        };
        // The store re-checks the budget under its lock; a refusal means a
        // concurrent retry of the same id recorded the final entry first.
        if !self
            .store
            .record_retry_attempt(id, &outcome, settings.max_retries)?
        {
            debug!(failed_id = id, "history already at the retry budget");
        }
        info!(failed_id = id, task_id = %task_id, outcome = %outcome, "retry finished");

        result
    }

    /// Retry a whole list of failed messages. One id failing does not abort
    /// the rest; every id gets its own result.
    pub async fn retry_failed_messages(&self, ids: &[i64]) -> Vec<(i64, Result<RequestTask>)> {
        let mut results = Vec::with_capacity(ids.len());
        for &id in ids {
            let result = self.retry_failed_message(id).await;
            if let Err(ref e) = result {
                warn!(failed_id = id, "retry failed: {e}");
            }
            results.push((id, result));
        }
        results
    }

    /// Retry every failed message recorded for one task, as a unit.
    ///
    /// A task with no failure rows yields a negative report instead of an
    /// error; asking is legitimate even when there is nothing to retry.
    pub async fn retry_by_task_id(&self, task_id: &TaskId) -> Result<RetryReport> {
        let failures = self.store.failed_messages_for_task(task_id.as_str())?;
        if failures.is_empty() {
            debug!(task_id = %task_id, "no failed messages recorded");
            return Ok(RetryReport {
                success: false,
                message: format!("no failed messages found for task {task_id}"),
            });
        }

        let ids: Vec<i64> = failures.iter().map(|f| f.id).collect();
        let results = self.retry_failed_messages(&ids).await;
        let completed = results
            .iter()
            .filter(|(_, r)| matches!(r, Ok(t) if t.status == TaskStatus::Completed))
            .count();

        Ok(RetryReport {
            success: completed == results.len(),
            message: format!(
                "{completed}/{} retries reached completed for task {task_id}",
                results.len()
            ),
        })
    }

    /// Sweep every failed message that has never been retried.
    pub async fn retry_unretried(&self) -> Result<Vec<(i64, Result<RequestTask>)>> {
        let pending: Vec<i64> = self
            .store
            .unretried_failed_messages()?
            .iter()
            .map(|f| f.id)
            .collect();
        if pending.is_empty() {
            return Ok(Vec::new());
        }
        info!(count = pending.len(), "retrying all unretried failed messages");
        Ok(self.retry_failed_messages(&pending).await)
    }

    /// The task to dispatch for a failed message: the recorded task when it
    /// still exists, else a fresh single-message task rebuilt from the
    /// linked message (set when the failed batch had exactly one member).
    fn resolve_task(&self, failed: &FailedMessage) -> Result<RequestTask> {
        if let Some(ref task_id) = failed.request_task_id {
            if let Some(task) = self.store.find_task(task_id)? {
                return Ok(task);
            }
        }
        if let Some(message_id) = failed.message_id {
            if let Some(message) = self.store.find_message(message_id)? {
                let task = self.store.create_task(
                    &message.conversation_id,
                    &[message.id],
                    &message.content,
                )?;
                self.store.increment_message_retries(message.id)?;
                info!(
                    task_id = %task.id,
                    failed_id = failed.id,
                    "rebuilt single-message task for retry"
                );
                return Ok(task);
            }
        }
        match failed.request_task_id {
            Some(ref id) => Err(PipelineError::TaskNotFound { id: id.clone() }),
            None => Err(PipelineError::DanglingFailedMessage { id: failed.id }),
        }
    }
}
