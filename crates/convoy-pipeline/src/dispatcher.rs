//! Exactly-once, conversation-ordered dispatch of sealed request tasks.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use convoy_backend::CompletionBackend;
use convoy_core::{ConversationId, TaskId};
use convoy_store::{ConversationStore, MessageRole, MessageStatus, RequestTask, TaskStatus};

use crate::error::{PipelineError, Result};

/// Marks a task as having a live dispatch attempt. Dropping the guard clears
/// the marker on every exit path, panic included.
struct FlightGuard<'a> {
    in_flight: &'a DashMap<TaskId, ()>,
    task_id: TaskId,
}

impl<'a> FlightGuard<'a> {
    /// `None` when another attempt already holds the slot.
    fn acquire(in_flight: &'a DashMap<TaskId, ()>, task_id: &TaskId) -> Option<Self> {
        match in_flight.entry(task_id.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(Self {
                    in_flight,
                    task_id: task_id.clone(),
                })
            }
        }
    }
}

/// FIFO of sealed tasks waiting behind a conversation's current dispatch.
#[derive(Default)]
struct DispatchLane {
    queue: VecDeque<TaskId>,
    busy: bool,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.task_id);
    }
}

/// Takes sealed tasks through `pending → processing → completed | failed |
/// timeout`. Exactly one backend request goes out per task per attempt: the
/// in-memory in-flight set stops concurrent calls inside this process, and
/// the guarded `processing` claim in the store stops everything else. The
/// queue loop additionally keeps one conversation's tasks in seal order:
/// each conversation dispatches one task at a time, the next starting only
/// after the previous reached a terminal status.
pub struct TaskDispatcher {
    store: Arc<ConversationStore>,
    backend: Arc<dyn CompletionBackend>,
    in_flight: DashMap<TaskId, ()>,
    lanes: DashMap<ConversationId, DispatchLane>,
}

impl TaskDispatcher {
    pub fn new(store: Arc<ConversationStore>, backend: Arc<dyn CompletionBackend>) -> Self {
        Self {
            store,
            backend,
            in_flight: DashMap::new(),
            lanes: DashMap::new(),
        }
    }

    /// Dispatch one task and return its record as of afterwards.
    ///
    /// `process` owns every transition of the attempt: the `processing`
    /// claim, then exactly one of `completed`, `failed` or `timeout`.
    /// Backend faults never escape as errors; they land on the task row.
    /// Calling `process` on a completed task is a no-op, and calling it
    /// while another attempt is in flight returns the current record
    /// without sending a second request.
    pub async fn process(&self, task_id: &TaskId) -> Result<RequestTask> {
        let settings = self
            .store
            .active_settings()?
            .ok_or(PipelineError::NoActiveSettings)?;

        let Some(_flight) = FlightGuard::acquire(&self.in_flight, task_id) else {
            debug!(task_id = %task_id, "attempt already in flight");
            return self.current(task_id);
        };

        let task = self.current(task_id)?;
        if !task.status.is_dispatchable() {
            debug!(task_id = %task_id, status = %task.status, "not dispatchable");
            return Ok(task);
        }
        if !self.store.mark_task_processing(task_id.as_str())? {
            // Lost the claim between the read above and this update.
            return self.current(task_id);
        }

        info!(
            task_id = %task_id,
            conversation = %task.conversation_id,
            messages = task.message_count,
            backend = self.backend.name(),
            "dispatching task"
        );

        let outcome = tokio::time::timeout(
            settings.request_timeout(),
            self.backend.complete(&task.content),
        )
        .await;

        match outcome {
            Ok(Ok(response)) => {
                self.store.complete_task(task_id.as_str(), &response)?;
                info!(task_id = %task_id, reply_bytes = response.len(), "task completed");
            }
            Ok(Err(e)) => {
                warn!(task_id = %task_id, error = %e, "backend request failed");
                self.store.fail_task(task_id.as_str(), &e.to_string())?;
            }
            Err(_) => {
                warn!(task_id = %task_id, "dispatch timed out");
                let error = format!("no reply within {}s", settings.request_timeout_secs);
                self.store.timeout_task(task_id.as_str(), &error)?;
            }
        }
        self.current(task_id)
    }

    /// Persist one message, seal it alone into a task and dispatch it right
    /// away, skipping the aggregation buffer.
    pub async fn push(&self, conversation_id: &ConversationId, text: &str) -> Result<RequestTask> {
        self.store
            .active_settings()?
            .ok_or(PipelineError::NoActiveSettings)?;

        self.store.upsert_conversation(conversation_id.as_str())?;
        let message = self.store.append_message(
            conversation_id.as_str(),
            MessageRole::User,
            MessageStatus::Pending,
            text,
        )?;
        let task = self
            .store
            .create_task(conversation_id.as_str(), &[message.id], text)?;
        info!(task_id = %task.id, conversation = %conversation_id, "single message sealed");

        self.process(&TaskId::from(task.id)).await
    }

    /// Startup recovery. Tasks left `processing` by a previous run can never
    /// finish (their attempt died with the process), so they are failed with
    /// a recovery note and become retryable. Dispatchable tasks are returned
    /// for re-enqueueing.
    pub fn recover(&self) -> Vec<TaskId> {
        match self.store.list_tasks_by_status(TaskStatus::Processing) {
            Ok(stuck) => {
                for task in stuck {
                    warn!(task_id = %task.id, "task abandoned mid-dispatch; marking failed");
                    if let Err(e) = self
                        .store
                        .fail_task(&task.id, "dispatch interrupted by restart")
                    {
                        error!(task_id = %task.id, "could not fail abandoned task: {e}");
                    }
                }
            }
            Err(e) => error!("recovery scan for processing tasks failed: {e}"),
        }

        let mut ready = Vec::new();
        for status in [TaskStatus::Pending, TaskStatus::Retrying] {
            match self.store.list_tasks_by_status(status) {
                Ok(tasks) => ready.extend(tasks.into_iter().map(|t| TaskId::from(t.id))),
                Err(e) => error!(status = %status, "recovery scan failed: {e}"),
            }
        }
        // ids are time-ordered, so this walks the tasks in seal order
        ready.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        if !ready.is_empty() {
            info!(count = ready.len(), "re-enqueueing tasks after restart");
        }
        ready
    }

    /// Dispatch loop. Runs recovery first, then serves queued task ids until
    /// shutdown. Each id lands on its conversation's lane: a lane runs one
    /// worker at a time and feeds it tasks in arrival order, so a
    /// conversation's batches reach the backend in the order they were
    /// sealed while separate conversations dispatch in parallel. On shutdown
    /// the queue is drained and every worker is awaited, so accepted tasks
    /// reach a terminal status before the loop returns.
    pub async fn run(
        self: Arc<Self>,
        mut task_rx: mpsc::UnboundedReceiver<TaskId>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(backend = self.backend.name(), "dispatcher loop started");
        let mut workers = JoinSet::new();
        for task_id in self.recover() {
            self.route_task(&mut workers, task_id);
        }
        loop {
            tokio::select! {
                received = task_rx.recv() => {
                    match received {
                        Some(task_id) => self.route_task(&mut workers, task_id),
                        None => {
                            info!("dispatch queue closed; dispatcher stopping");
                            break;
                        }
                    }
                }
                Some(_) = workers.join_next(), if !workers.is_empty() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        while let Ok(task_id) = task_rx.try_recv() {
                            self.route_task(&mut workers, task_id);
                        }
                        info!(draining = workers.len(), "dispatcher stopping");
                        break;
                    }
                }
            }
        }
        while workers.join_next().await.is_some() {}
        info!("dispatcher stopped");
    }

    /// Hand a sealed task to its conversation's lane, starting a worker when
    /// the lane is idle. A busy lane queues the task instead; the running
    /// worker picks it up once the current dispatch reaches a terminal
    /// status.
    fn route_task(self: &Arc<Self>, workers: &mut JoinSet<()>, task_id: TaskId) {
        let conversation_id = match self.store.find_task(task_id.as_str()) {
            Ok(Some(task)) => ConversationId::from(task.conversation_id),
            Ok(None) => {
                warn!(task_id = %task_id, "queued task not found; dropping it");
                return;
            }
            Err(e) => {
                error!(task_id = %task_id, "could not route queued task: {e}");
                return;
            }
        };
        if let Some(first) = self.enqueue_lane(&conversation_id, task_id) {
            self.spawn_worker(workers, conversation_id, first);
        }
    }

    /// Returns the task back when the lane was idle, meaning the caller must
    /// start a worker for it.
    fn enqueue_lane(&self, conversation_id: &ConversationId, task_id: TaskId) -> Option<TaskId> {
        let mut lane = self.lanes.entry(conversation_id.clone()).or_default();
        if lane.busy {
            debug!(conversation = %conversation_id, task_id = %task_id, "lane busy; task queued");
            lane.queue.push_back(task_id);
            None
        } else {
            lane.busy = true;
            Some(task_id)
        }
    }

    /// Next task queued on a conversation's lane, or drop the lane once it
    /// runs empty.
    fn next_in_lane(&self, conversation_id: &ConversationId) -> Option<TaskId> {
        match self.lanes.entry(conversation_id.clone()) {
            Entry::Occupied(mut slot) => match slot.get_mut().queue.pop_front() {
                Some(next) => Some(next),
                None => {
                    slot.remove();
                    None
                }
            },
            Entry::Vacant(_) => None,
        }
    }

    fn spawn_worker(
        self: &Arc<Self>,
        workers: &mut JoinSet<()>,
        conversation_id: ConversationId,
        task_id: TaskId,
    ) {
        let dispatcher = Arc::clone(self);
        workers.spawn(async move {
            let mut current = task_id;
            loop {
                if let Err(e) = dispatcher.process(&current).await {
                    error!(task_id = %current, "dispatch failed: {e}");
                }
                match dispatcher.next_in_lane(&conversation_id) {
                    Some(next) => current = next,
                    None => break,
                }
            }
        });
    }

    fn current(&self, task_id: &TaskId) -> Result<RequestTask> {
        self.store
            .find_task(task_id.as_str())?
            .ok_or_else(|| PipelineError::TaskNotFound {
                id: task_id.to_string(),
            })
    }
}
