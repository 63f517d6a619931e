//! Shared helpers for the unit tests in this crate.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use convoy_backend::{BackendError, CompletionBackend};
use convoy_core::TaskId;
use convoy_store::{ConversationStore, MessageRole, MessageStatus};

use crate::aggregator::BATCH_SEPARATOR;

pub(crate) fn test_store() -> Arc<ConversationStore> {
    let conn = rusqlite::Connection::open_in_memory().expect("open in-memory db");
    Arc::new(ConversationStore::new(conn).expect("init store"))
}

/// Persist `texts` as pending user messages and seal them into one task.
pub(crate) fn seal_task(store: &ConversationStore, conversation: &str, texts: &[&str]) -> TaskId {
    store.upsert_conversation(conversation).expect("conversation");
    let mut ids = Vec::new();
    for text in texts {
        let message = store
            .append_message(conversation, MessageRole::User, MessageStatus::Pending, text)
            .expect("append message");
        ids.push(message.id);
    }
    let task = store
        .create_task(conversation, &ids, &texts.join(BATCH_SEPARATOR))
        .expect("create task");
    TaskId::from(task.id)
}

/// Scripted completion backend. Replies are consumed front to back; once the
/// script runs dry every further call succeeds with the fallback text.
pub(crate) struct MockBackend {
    script: Mutex<VecDeque<Result<String, BackendError>>>,
    fallback: String,
    delay: Option<Duration>,
    calls: Arc<AtomicUsize>,
}

impl MockBackend {
    /// Always replies `text`.
    pub fn replying(text: &str) -> Self {
        Self::with_script(Vec::new(), text)
    }

    /// Fails the first call, then falls back to replying "ok".
    pub fn erroring(error: BackendError) -> Self {
        Self::with_script(vec![Err(error)], "ok")
    }

    pub fn scripted(script: Vec<Result<String, BackendError>>) -> Self {
        Self::with_script(script, "ok")
    }

    fn with_script(script: Vec<Result<String, BackendError>>, fallback: &str) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: fallback.to_string(),
            delay: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait]
impl CompletionBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(&self, _content: &str) -> Result<String, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(reply) => reply,
            None => Ok(self.fallback.clone()),
        }
    }
}
