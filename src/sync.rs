//! Message synchronization engine.
//!
//! The visible conversation is a projection of the latest snapshot delivered
//! by the remote store; `send` never inserts into it locally. Every persisted
//! user message starts a completion pipeline that runs as its own task and
//! persists the assistant reply when generation succeeds.

use crate::completion::{CompletionError, CompletionProvider};
use crate::remote::{CollectionPath, IdentityProvider, RemoteDocumentStore, StoreError};
use crate::types::Message;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const ORDER_FIELD: &str = "timestamp";
const EVENT_CAPACITY: usize = 64;

// ============================================
// Error Types
// ============================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncError {
    #[error("invalid message: {0}")]
    Validation(String),

    #[error("no authenticated user")]
    NotAuthenticated,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Completion(#[from] CompletionError),

    #[error("message feed closed")]
    FeedClosed,

    #[error("reply pipeline was aborted before it finished")]
    PipelineAborted,
}

/// Notifications about the engine's background work.
#[derive(Clone, Debug, PartialEq)]
pub enum SyncEvent {
    SnapshotApplied { count: usize },
    FeedError(StoreError),
    ReplyPersisted(Message),
    ReplyFailed(SyncError),
}

/// What `shutdown` does with reply pipelines that are still running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelinePolicy {
    /// Wait for every outstanding pipeline to finish.
    Await,
    /// Abort outstanding pipelines; their replies are never persisted.
    Abandon,
}

// ============================================
// Feed and reply handles
// ============================================

/// Live view of the ordered message list.
#[derive(Clone)]
pub struct MessageFeed {
    receiver: watch::Receiver<Vec<Message>>,
}

impl MessageFeed {
    pub fn current(&self) -> Vec<Message> {
        self.receiver.borrow().clone()
    }

    /// Waits for the next snapshot and returns it.
    pub async fn changed(&mut self) -> Result<Vec<Message>, SyncError> {
        self.receiver
            .changed()
            .await
            .map_err(|_| SyncError::FeedClosed)?;
        Ok(self.receiver.borrow_and_update().clone())
    }

    /// Waits until the list satisfies `predicate`, checking the current
    /// value first.
    pub async fn wait_for(
        &mut self,
        mut predicate: impl FnMut(&[Message]) -> bool,
    ) -> Result<Vec<Message>, SyncError> {
        let messages = self
            .receiver
            .wait_for(|messages| predicate(messages))
            .await
            .map_err(|_| SyncError::FeedClosed)?;
        Ok(messages.clone())
    }
}

/// Outcome of the reply pipeline started by one `send`.
pub struct PendingReply {
    pipeline: u64,
    receiver: oneshot::Receiver<Result<Message, SyncError>>,
}

impl PendingReply {
    pub fn pipeline_id(&self) -> u64 {
        self.pipeline
    }

    /// Resolves to the persisted assistant message or the pipeline's error.
    pub async fn wait(self) -> Result<Message, SyncError> {
        self.receiver
            .await
            .map_err(|_| SyncError::PipelineAborted)?
    }
}

// ============================================
// Engine
// ============================================

pub struct MessageSyncEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    store: Arc<dyn RemoteDocumentStore>,
    identity: Arc<dyn IdentityProvider>,
    completion: Arc<dyn CompletionProvider>,
    state: Mutex<EngineState>,
    messages: watch::Sender<Vec<Message>>,
    events: broadcast::Sender<SyncEvent>,
    next_pipeline: AtomicU64,
}

#[derive(Default)]
struct EngineState {
    draft: String,
    /// Bumped on every subscribe; a pump from an older generation stops
    /// without touching the list.
    generation: u64,
    subscription: Option<JoinHandle<()>>,
    pipelines: HashMap<u64, JoinHandle<()>>,
}

impl MessageSyncEngine {
    pub fn new(
        store: Arc<dyn RemoteDocumentStore>,
        identity: Arc<dyn IdentityProvider>,
        completion: Arc<dyn CompletionProvider>,
    ) -> Self {
        let (messages, _) = watch::channel(Vec::new());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(EngineInner {
                store,
                identity,
                completion,
                state: Mutex::new(EngineState::default()),
                messages,
                events,
                next_pipeline: AtomicU64::new(1),
            }),
        }
    }

    /// Opens the live message subscription for `user_id`, replacing any
    /// previous one. When calls overlap, the one made last wins.
    pub async fn subscribe(&self, user_id: &str) -> Result<MessageFeed, SyncError> {
        let path = CollectionPath::messages(user_id);
        let generation = {
            let mut state = self.inner.lock();
            state.generation += 1;
            if let Some(previous) = state.subscription.take() {
                previous.abort();
                info!(path = %path, "replacing message subscription");
            }
            self.inner.messages.send_replace(Vec::new());
            state.generation
        };

        let mut stream = self.inner.store.subscribe(&path, ORDER_FIELD).await?;

        let mut state = self.inner.lock();
        if state.generation != generation {
            debug!(path = %path, "subscription superseded before it opened");
            return Ok(self.feed());
        }
        info!(path = %path, "subscribed to messages");

        let inner = Arc::clone(&self.inner);
        state.subscription = Some(tokio::spawn(async move {
            while let Some(delivery) = stream.next().await {
                match delivery {
                    Ok(snapshot) => {
                        let messages: Vec<Message> =
                            snapshot.iter().map(Message::from_stored).collect();
                        let count = messages.len();
                        {
                            let state = inner.lock();
                            if state.generation != generation {
                                break;
                            }
                            inner.messages.send_replace(messages);
                        }
                        debug!(count, "applied message snapshot");
                        let _ = inner.events.send(SyncEvent::SnapshotApplied { count });
                    }
                    Err(err) => {
                        warn!(error = %err, "message feed error");
                        let _ = inner.events.send(SyncEvent::FeedError(err));
                    }
                }
            }
            debug!("message feed ended");
        }));
        drop(state);

        Ok(self.feed())
    }

    /// A new handle on the message list.
    pub fn feed(&self) -> MessageFeed {
        MessageFeed {
            receiver: self.inner.messages.subscribe(),
        }
    }

    pub fn messages(&self) -> Vec<Message> {
        self.inner.messages.borrow().clone()
    }

    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    pub fn set_draft(&self, text: impl Into<String>) {
        self.inner.lock().draft = text.into();
    }

    pub fn draft(&self) -> String {
        self.inner.lock().draft.clone()
    }

    /// Sends the current draft. The draft is kept if sending fails.
    pub async fn send_draft(&self) -> Result<PendingReply, SyncError> {
        let draft = self.draft();
        self.send(&draft).await
    }

    /// Persists a user message and starts its reply pipeline.
    ///
    /// The message becomes visible only once the subscription redelivers it.
    pub async fn send(&self, text: &str) -> Result<PendingReply, SyncError> {
        let content = text.trim();
        if content.is_empty() {
            return Err(SyncError::Validation("message is empty".to_string()));
        }
        let user_id = self
            .inner
            .identity
            .current_user_id()
            .ok_or(SyncError::NotAuthenticated)?;
        let path = CollectionPath::messages(&user_id);

        let message = Message::user(content);
        let id = self.inner.store.add(&path, message.to_record()).await?;
        info!(id = %id, "persisted user message");

        self.inner.lock().draft.clear();
        Ok(self.spawn_pipeline(path, content.to_string()))
    }

    /// Generates a reply to `prompt` and persists it as an assistant message.
    pub async fn generate_and_persist_response(&self, prompt: &str) -> Result<Message, SyncError> {
        let user_id = self
            .inner
            .identity
            .current_user_id()
            .ok_or(SyncError::NotAuthenticated)?;
        self.inner
            .generate_and_persist(&CollectionPath::messages(&user_id), prompt)
            .await
    }

    /// Reply pipelines that have not finished yet.
    pub fn outstanding_pipelines(&self) -> usize {
        self.inner
            .lock()
            .pipelines
            .values()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    /// Cancels the subscription and settles outstanding pipelines per `policy`.
    pub async fn shutdown(self, policy: PipelinePolicy) {
        let (subscription, pipelines) = {
            let mut state = self.inner.lock();
            let pipelines: Vec<JoinHandle<()>> =
                state.pipelines.drain().map(|(_, handle)| handle).collect();
            (state.subscription.take(), pipelines)
        };
        if let Some(subscription) = subscription {
            subscription.abort();
        }

        info!(pending = pipelines.len(), ?policy, "shutting down message engine");
        match policy {
            PipelinePolicy::Await => {
                for handle in pipelines {
                    let _ = handle.await;
                }
            }
            PipelinePolicy::Abandon => {
                for handle in pipelines {
                    handle.abort();
                }
            }
        }
    }

    fn spawn_pipeline(&self, path: CollectionPath, prompt: String) -> PendingReply {
        let pipeline = self.inner.next_pipeline.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        let inner = Arc::clone(&self.inner);

        // Registered under the lock so the task cannot deregister first.
        let mut state = self.inner.lock();
        state.pipelines.retain(|_, handle| !handle.is_finished());
        let handle = tokio::spawn(async move {
            debug!(pipeline, "reply pipeline started");
            let result = inner.generate_and_persist(&path, &prompt).await;
            let event = match &result {
                Ok(reply) => SyncEvent::ReplyPersisted(reply.clone()),
                Err(err) => {
                    warn!(pipeline, error = %err, "reply pipeline failed");
                    SyncEvent::ReplyFailed(err.clone())
                }
            };
            let _ = inner.events.send(event);
            inner.lock().pipelines.remove(&pipeline);
            let _ = sender.send(result);
        });
        state.pipelines.insert(pipeline, handle);

        PendingReply { pipeline, receiver }
    }
}

impl Drop for MessageSyncEngine {
    fn drop(&mut self) {
        if let Some(subscription) = self.inner.lock().subscription.take() {
            subscription.abort();
        }
    }
}

impl EngineInner {
    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn generate_and_persist(
        &self,
        path: &CollectionPath,
        prompt: &str,
    ) -> Result<Message, SyncError> {
        let text = self.completion.generate(prompt).await?;
        let mut reply = Message::assistant(text);
        let id = self.store.add(path, reply.to_record()).await?;
        info!(id = %id, "persisted assistant reply");
        reply.id = Some(id);
        Ok(reply)
    }
}
