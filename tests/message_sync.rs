//! Integration tests for the message sync engine
//!
//! Runs the engine against the in-memory store with scripted completion
//! providers.

use async_trait::async_trait;
use chatvault::completion::{CompletionError, CompletionProvider, CompletionResult, StaticReply};
use chatvault::remote::{CollectionPath, MemoryDocumentStore, StaticIdentity, StoreError};
use chatvault::sync::{MessageSyncEngine, PipelinePolicy, SyncError, SyncEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const USER: &str = "alice";
const WAIT: Duration = Duration::from_secs(5);

struct SlowReply {
    delay: Duration,
}

#[async_trait]
impl CompletionProvider for SlowReply {
    async fn generate(&self, prompt: &str) -> CompletionResult<String> {
        tokio::time::sleep(self.delay).await;
        Ok(format!("re: {prompt}"))
    }
}

struct Rejecting;

#[async_trait]
impl CompletionProvider for Rejecting {
    async fn generate(&self, _prompt: &str) -> CompletionResult<String> {
        Err(CompletionError::ServerRejected("quota exceeded".to_string()))
    }
}

fn setup(provider: Arc<dyn CompletionProvider>) -> (Arc<MemoryDocumentStore>, MessageSyncEngine) {
    let store = Arc::new(MemoryDocumentStore::new());
    let engine = MessageSyncEngine::new(
        store.clone(),
        Arc::new(StaticIdentity::signed_in(USER)),
        provider,
    );
    (store, engine)
}

fn stored_count(store: &MemoryDocumentStore) -> usize {
    store.records(&CollectionPath::messages(USER)).len()
}

mod send_tests {
    use super::*;

    #[tokio::test]
    async fn test_hello_gets_a_reply() {
        let (_store, engine) = setup(Arc::new(StaticReply::new("Hi there")));
        let mut feed = engine.subscribe(USER).await.expect("subscribe");

        let reply = engine.send("Hello").await.expect("send");
        let persisted = reply.wait().await.expect("reply");
        assert!(!persisted.is_user);
        assert!(persisted.id.is_some());

        let messages = timeout(WAIT, feed.wait_for(|m| m.len() == 2))
            .await
            .expect("timed out")
            .expect("feed");
        assert_eq!(messages[0].content, "Hello");
        assert!(messages[0].is_user);
        assert!(messages[0].id.is_some());
        assert!(!messages[1].is_user);
        assert_eq!(messages[1].content, "Hi there");
        assert!(messages[0].timestamp <= messages[1].timestamp);
    }

    #[tokio::test]
    async fn test_failed_completion_adds_no_reply() {
        let (store, engine) = setup(Arc::new(Rejecting));
        let mut events = engine.events();
        let mut feed = engine.subscribe(USER).await.expect("subscribe");

        let reply = engine.send("Hello").await.expect("send");
        let err = reply.wait().await.unwrap_err();
        assert_eq!(
            err,
            SyncError::Completion(CompletionError::ServerRejected("quota exceeded".to_string()))
        );

        // The failure is also broadcast
        let failed = timeout(WAIT, async {
            loop {
                if let SyncEvent::ReplyFailed(err) = events.recv().await.expect("event") {
                    break err;
                }
            }
        })
        .await
        .expect("timed out");
        assert!(matches!(failed, SyncError::Completion(_)));

        let messages = timeout(WAIT, feed.wait_for(|m| m.len() == 1))
            .await
            .expect("timed out")
            .expect("feed");
        assert!(messages[0].is_user);
        assert_eq!(stored_count(&store), 1);
    }

    #[tokio::test]
    async fn test_snapshots_grow_and_stay_sorted() {
        let (_store, engine) = setup(Arc::new(StaticReply::new("ok")));
        engine.subscribe(USER).await.expect("subscribe");

        let mut feed = engine.feed();
        let observer = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Ok(messages) = feed.changed().await {
                let done = messages.len() == 10;
                seen.push(messages);
                if done {
                    break;
                }
            }
            seen
        });

        for i in 0..5 {
            let reply = engine.send(&format!("message {i}")).await.expect("send");
            reply.wait().await.expect("reply");
        }

        let seen = timeout(WAIT, observer)
            .await
            .expect("timed out")
            .expect("observer");
        assert_eq!(seen.last().map(Vec::len), Some(10));
        for pair in seen.windows(2) {
            assert!(pair[0].len() <= pair[1].len());
        }
        for snapshot in &seen {
            for pair in snapshot.windows(2) {
                assert!(pair[0].timestamp <= pair[1].timestamp);
            }
        }
    }

    #[tokio::test]
    async fn test_feed_error_is_reported_and_feed_keeps_running() {
        let (store, engine) = setup(Arc::new(StaticReply::new("ok")));
        let mut events = engine.events();
        let mut feed = engine.subscribe(USER).await.expect("subscribe");

        store.push_feed_error(
            &CollectionPath::messages(USER),
            StoreError::Unavailable("stream reset".to_string()),
        );
        let reported = timeout(WAIT, async {
            loop {
                if let SyncEvent::FeedError(err) = events.recv().await.expect("event") {
                    break err;
                }
            }
        })
        .await
        .expect("timed out");
        assert_eq!(reported, StoreError::Unavailable("stream reset".to_string()));

        let reply = engine.send("still there?").await.expect("send");
        reply.wait().await.expect("reply");
        let messages = timeout(WAIT, feed.wait_for(|m| m.len() == 2))
            .await
            .expect("timed out")
            .expect("feed");
        assert_eq!(messages[0].content, "still there?");
    }

    #[tokio::test]
    async fn test_signed_out_send_fails() {
        let store = Arc::new(MemoryDocumentStore::new());
        let engine = MessageSyncEngine::new(
            store.clone(),
            Arc::new(StaticIdentity::signed_out()),
            Arc::new(StaticReply::new("ok")),
        );

        let err = engine.send("Hello").await.err().expect("error");
        assert_eq!(err, SyncError::NotAuthenticated);
        assert_eq!(stored_count(&store), 0);
    }
}

mod teardown_tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_awaits_outstanding_replies() {
        let (store, engine) = setup(Arc::new(SlowReply {
            delay: Duration::from_millis(50),
        }));

        let _reply = engine.send("Hello").await.expect("send");
        assert_eq!(engine.outstanding_pipelines(), 1);

        timeout(WAIT, engine.shutdown(PipelinePolicy::Await))
            .await
            .expect("timed out");
        assert_eq!(stored_count(&store), 2);
    }

    #[tokio::test]
    async fn test_abandoned_replies_are_never_persisted() {
        let (store, engine) = setup(Arc::new(SlowReply {
            delay: Duration::from_secs(30),
        }));

        let reply = engine.send("Hello").await.expect("send");
        engine.shutdown(PipelinePolicy::Abandon).await;

        assert_eq!(reply.wait().await.unwrap_err(), SyncError::PipelineAborted);
        assert_eq!(stored_count(&store), 1);
    }

    #[tokio::test]
    async fn test_dropping_the_engine_leaves_replies_running() {
        let (store, engine) = setup(Arc::new(SlowReply {
            delay: Duration::from_millis(20),
        }));

        let reply = engine.send("Hello").await.expect("send");
        drop(engine);

        let persisted = timeout(WAIT, reply.wait())
            .await
            .expect("timed out")
            .expect("reply");
        assert_eq!(persisted.content, "re: Hello");
        assert_eq!(stored_count(&store), 2);
    }
}
