//! Assembled pipeline: store, aggregator, dispatcher and retry coordinator
//! wired together with their background loops.

use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use convoy_backend::{CompletionBackend, HttpCompletionBackend};
use convoy_core::{ConversationId, ConvoyConfig, TaskId};
use convoy_store::{ConversationStore, DeliverySettings, Message, RequestTask, StoreError};

use crate::aggregator::MessageAggregator;
use crate::dispatcher::TaskDispatcher;
use crate::error::Result;
use crate::retry::{RetryCoordinator, RetryReport};

/// One running delivery pipeline.
///
/// Owns the two background loops (aggregation sweep and dispatch queue) and
/// stops them in order on [`shutdown`](Self::shutdown): buffers are sealed
/// first so the dispatcher still drains the resulting tasks.
pub struct Convoy {
    store: Arc<ConversationStore>,
    aggregator: Arc<MessageAggregator>,
    dispatcher: Arc<TaskDispatcher>,
    retries: RetryCoordinator,
    shutdown_tx: watch::Sender<bool>,
    loops: Vec<JoinHandle<()>>,
}

impl Convoy {
    /// Wire a pipeline over an already-open store and backend and start the
    /// background loops. Must be called from inside a tokio runtime.
    pub fn new(store: Arc<ConversationStore>, backend: Arc<dyn CompletionBackend>) -> Self {
        let (task_tx, task_rx) = mpsc::unbounded_channel::<TaskId>();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let aggregator = Arc::new(MessageAggregator::new(store.clone(), task_tx));
        let dispatcher = Arc::new(TaskDispatcher::new(store.clone(), backend));
        let retries = RetryCoordinator::new(store.clone(), dispatcher.clone());

        let loops = vec![
            tokio::spawn(aggregator.clone().run(shutdown_rx.clone())),
            tokio::spawn(dispatcher.clone().run(task_rx, shutdown_rx)),
        ];

        Self {
            store,
            aggregator,
            dispatcher,
            retries,
            shutdown_tx,
            loops,
        }
    }

    /// Open (or create) the database at the configured path and start a
    /// pipeline against the configured HTTP backend.
    pub fn open(config: &ConvoyConfig) -> Result<Self> {
        let conn = Connection::open(&config.database.path).map_err(StoreError::Database)?;
        let store = Arc::new(ConversationStore::new(conn)?);
        let backend = Arc::new(HttpCompletionBackend::from_config(&config.backend));
        info!(
            db = %config.database.path,
            backend = %config.backend.base_url,
            "convoy pipeline opened"
        );
        Ok(Self::new(store, backend))
    }

    /// Buffered ingestion through the aggregator.
    pub async fn push(&self, conversation_id: &ConversationId, text: &str) -> Result<Message> {
        self.aggregator.push(conversation_id, text).await
    }

    /// Immediate single-message delivery, bypassing the buffer.
    pub async fn push_now(
        &self,
        conversation_id: &ConversationId,
        text: &str,
    ) -> Result<RequestTask> {
        self.dispatcher.push(conversation_id, text).await
    }

    /// Seal one conversation's buffer now.
    pub async fn flush(&self, conversation_id: &ConversationId) -> Result<Option<RequestTask>> {
        self.aggregator.flush(conversation_id).await
    }

    /// Seal every non-empty buffer now.
    pub async fn force_process(&self) -> Vec<RequestTask> {
        self.aggregator.force_process().await
    }

    /// Discard all buffered entries; their message rows stay pending.
    pub async fn reset(&self) -> usize {
        self.aggregator.reset().await
    }

    pub async fn retry_failed_message(&self, id: i64) -> Result<RequestTask> {
        self.retries.retry_failed_message(id).await
    }

    pub async fn retry_failed_messages(&self, ids: &[i64]) -> Vec<(i64, Result<RequestTask>)> {
        self.retries.retry_failed_messages(ids).await
    }

    pub async fn retry_by_task_id(&self, task_id: &TaskId) -> Result<RetryReport> {
        self.retries.retry_by_task_id(task_id).await
    }

    pub async fn retry_unretried(&self) -> Result<Vec<(i64, Result<RequestTask>)>> {
        self.retries.retry_unretried().await
    }

    /// Activate a new delivery settings row; the previous active row is
    /// retired in the same transaction.
    pub fn activate_settings(
        &self,
        batch_size_threshold: u32,
        batch_time_window_secs: u64,
        request_timeout_secs: u64,
        max_retries: u32,
    ) -> Result<DeliverySettings> {
        Ok(self.store.activate_settings(
            batch_size_threshold,
            batch_time_window_secs,
            request_timeout_secs,
            max_retries,
        )?)
    }

    pub fn active_settings(&self) -> Result<Option<DeliverySettings>> {
        Ok(self.store.active_settings()?)
    }

    /// Remove terminal tasks older than `max_age`. Explicit trigger only;
    /// nothing purges on a timer.
    pub fn purge_terminal_tasks(&self, max_age: chrono::Duration) -> Result<usize> {
        Ok(self.store.purge_terminal_tasks(max_age)?)
    }

    /// Direct store access for queries the facade does not wrap.
    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    /// Flush all buffers, stop both loops and wait for in-flight dispatches
    /// to finish.
    pub async fn shutdown(self) {
        // Seal leftovers before the stop signal so their ids are already on
        // the queue when the dispatcher drains it.
        self.aggregator.force_process().await;
        if self.shutdown_tx.send(true).is_err() {
            error!("pipeline loops already gone at shutdown");
        }
        for handle in self.loops {
            if let Err(e) = handle.await {
                error!("pipeline loop ended abnormally: {e}");
            }
        }
        info!("convoy pipeline stopped");
    }
}
