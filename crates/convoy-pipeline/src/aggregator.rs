//! Per-conversation message buffering.
//!
//! Messages accumulate in an in-memory buffer per conversation until either
//! the batch size threshold is reached or the oldest buffered message has
//! waited out the batch time window. Sealing a buffer persists one request
//! task and puts its id on the dispatch queue.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

use convoy_core::{ConversationId, TaskId};
use convoy_store::{ConversationStore, Message, MessageRole, MessageStatus, RequestTask};

use crate::error::{PipelineError, Result};

/// Joins member texts into the task content, in arrival order.
pub const BATCH_SEPARATOR: &str = "\n";

/// How often the background sweep checks buffers against the time window.
const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_millis(250);

struct BufferedMessage {
    message_id: i64,
    content: String,
    buffered_at: DateTime<Utc>,
}

#[derive(Default)]
struct ConversationBuffer {
    entries: Vec<BufferedMessage>,
}

/// Buffers incoming messages per conversation and seals them into request
/// tasks. Sealed task ids go out on the dispatch queue; the dispatcher holds
/// the receiving end.
pub struct MessageAggregator {
    store: Arc<ConversationStore>,
    task_tx: mpsc::UnboundedSender<TaskId>,
    buffers: DashMap<ConversationId, Arc<Mutex<ConversationBuffer>>>,
}

impl MessageAggregator {
    pub fn new(store: Arc<ConversationStore>, task_tx: mpsc::UnboundedSender<TaskId>) -> Self {
        Self {
            store,
            task_tx,
            buffers: DashMap::new(),
        }
    }

    /// Accept one message into its conversation buffer.
    ///
    /// The message is persisted as `pending` before it is buffered, so a
    /// crash between the two steps loses nothing. Reaching the batch size
    /// threshold seals the buffer inline, still under the buffer lock.
    pub async fn push(&self, conversation_id: &ConversationId, text: &str) -> Result<Message> {
        let settings = self
            .store
            .active_settings()?
            .ok_or(PipelineError::NoActiveSettings)?;

        self.store.upsert_conversation(conversation_id.as_str())?;
        let message = self.store.append_message(
            conversation_id.as_str(),
            MessageRole::User,
            MessageStatus::Pending,
            text,
        )?;

        let buffer = self.buffer_for(conversation_id);
        let mut guard = buffer.lock().await;
        guard.entries.push(BufferedMessage {
            message_id: message.id,
            content: text.to_string(),
            buffered_at: Utc::now(),
        });
        debug!(
            conversation = %conversation_id,
            buffered = guard.entries.len(),
            threshold = settings.batch_size_threshold,
            "message buffered"
        );

        if guard.entries.len() >= settings.batch_size_threshold as usize {
            self.seal_locked(conversation_id, &mut guard)?;
        }
        Ok(message)
    }

    /// Seal one conversation's buffer now, regardless of size or age.
    /// Returns `None` when nothing is buffered.
    pub async fn flush(&self, conversation_id: &ConversationId) -> Result<Option<RequestTask>> {
        let Some(buffer) = self.buffers.get(conversation_id).map(|e| e.value().clone()) else {
            return Ok(None);
        };
        let mut guard = buffer.lock().await;
        self.seal_locked(conversation_id, &mut guard)
    }

    /// Seal every non-empty buffer. Per-conversation failures are logged and
    /// skipped; the remaining conversations still flush.
    pub async fn force_process(&self) -> Vec<RequestTask> {
        let ids: Vec<ConversationId> = self.buffers.iter().map(|e| e.key().clone()).collect();
        let mut sealed = Vec::new();
        for id in ids {
            match self.flush(&id).await {
                Ok(Some(task)) => sealed.push(task),
                Ok(None) => {}
                Err(e) => warn!(conversation = %id, error = %e, "forced flush failed"),
            }
        }
        sealed
    }

    /// Drop every buffered entry without sealing anything. The dropped
    /// messages keep their `pending` rows in the store; only the in-memory
    /// buffers are cleared. Returns how many entries were discarded.
    pub async fn reset(&self) -> usize {
        let buffers: Vec<Arc<Mutex<ConversationBuffer>>> =
            self.buffers.iter().map(|e| e.value().clone()).collect();
        let mut discarded = 0;
        for buffer in buffers {
            let mut guard = buffer.lock().await;
            discarded += guard.entries.len();
            guard.entries.clear();
        }
        info!(discarded, "aggregator reset");
        discarded
    }

    /// Seal buffers whose oldest entry has outlived the batch time window.
    /// The window restarts from zero for a conversation whenever its buffer
    /// is sealed, because the next entry becomes the oldest one.
    pub async fn flush_expired(&self) -> Result<Vec<RequestTask>> {
        // No active settings means push has always refused, so every buffer
        // is empty and there is nothing to sweep.
        let Some(settings) = self.store.active_settings()? else {
            return Ok(Vec::new());
        };
        let window = chrono::Duration::seconds(settings.batch_time_window_secs as i64);
        let now = Utc::now();

        let buffers: Vec<(ConversationId, Arc<Mutex<ConversationBuffer>>)> = self
            .buffers
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut sealed = Vec::new();
        for (id, buffer) in buffers {
            let mut guard = buffer.lock().await;
            let Some(oldest) = guard.entries.first() else {
                continue;
            };
            if now.signed_duration_since(oldest.buffered_at) < window {
                continue;
            }
            debug!(conversation = %id, "batch time window expired");
            match self.seal_locked(&id, &mut guard) {
                Ok(Some(task)) => sealed.push(task),
                Ok(None) => {}
                Err(e) => warn!(conversation = %id, error = %e, "expired flush failed"),
            }
        }
        Ok(sealed)
    }

    /// Background loop: sweeps for expired buffers until shutdown, then
    /// flushes everything still buffered so no sealed-worthy message is
    /// stranded in memory.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("aggregator loop started");
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.flush_expired().await {
                        error!("aggregator sweep failed: {e}");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let sealed = self.force_process().await;
                        info!(sealed = sealed.len(), "aggregator stopped");
                        break;
                    }
                }
            }
        }
    }

    /// How many messages are buffered for a conversation right now.
    pub async fn buffered_count(&self, conversation_id: &ConversationId) -> usize {
        match self.buffers.get(conversation_id).map(|e| e.value().clone()) {
            Some(buffer) => buffer.lock().await.entries.len(),
            None => 0,
        }
    }

    fn buffer_for(&self, conversation_id: &ConversationId) -> Arc<Mutex<ConversationBuffer>> {
        self.buffers
            .entry(conversation_id.clone())
            .or_default()
            .value()
            .clone()
    }

    /// Drain the buffer into one request task. The caller holds the buffer
    /// lock, so no message can slip in between the drain and the insert.
    /// A store failure puts the drained entries back untouched.
    fn seal_locked(
        &self,
        conversation_id: &ConversationId,
        buffer: &mut ConversationBuffer,
    ) -> Result<Option<RequestTask>> {
        if buffer.entries.is_empty() {
            return Ok(None);
        }
        let entries: Vec<BufferedMessage> = buffer.entries.drain(..).collect();
        let message_ids: Vec<i64> = entries.iter().map(|e| e.message_id).collect();
        let content = entries
            .iter()
            .map(|e| e.content.as_str())
            .collect::<Vec<_>>()
            .join(BATCH_SEPARATOR);

        let task = match self
            .store
            .create_task(conversation_id.as_str(), &message_ids, &content)
        {
            Ok(task) => task,
            Err(e) => {
                buffer.entries = entries;
                return Err(e.into());
            }
        };

        info!(
            conversation = %conversation_id,
            task_id = %task.id,
            messages = message_ids.len(),
            "batch sealed"
        );
        if self.task_tx.send(TaskId::from(task.id.clone())).is_err() {
            warn!(task_id = %task.id, "dispatch queue closed; task stays pending until restart");
        }
        Ok(Some(task))
    }
}
