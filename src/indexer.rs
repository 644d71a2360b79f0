use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::embeddings::EmbeddingProvider;
use crate::error::{RecallError, Result};
use crate::store::{Point, PointPayload, VectorStore};
use crate::types::{point_id, ChatMessage, IndexReport};

/// Cooperative cancellation flag, polled between messages.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// What the indexer remembers about one already-indexed message.
#[derive(Debug, Clone)]
struct IndexedEntry {
    swipe_id: u32,
    text_hash: String,
    point_id: String,
}

/// Per-chat indexing state. One instance per active chat, held in the
/// indexer's registry; torn down when the chat is closed on the host.
#[derive(Default)]
struct ChatIndexState {
    entries: HashMap<i64, IndexedEntry>,
    last_message_count: usize,
    /// False after a cancelled or partially failed pass — a later pass
    /// resumes from the first unindexed message.
    fully_indexed: bool,
    /// True while a pass is in flight. A duplicate request is rejected.
    is_indexing: bool,
    /// Cancel token of the in-flight pass, if any.
    active_cancel: Option<CancelToken>,
}

/// Incremental indexer: walks messages not yet indexed (or changed since),
/// embeds them, and upserts one vector-store point per message. Edits and
/// swipes delete the stale point before the replacement is inserted;
/// deletions delete the point outright.
pub struct Indexer {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    states: Mutex<HashMap<String, ChatIndexState>>,
}

impl Indexer {
    pub fn new(store: Arc<dyn VectorStore>, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            store,
            embedder,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Run one indexing pass over `messages` for `chat_id`.
    ///
    /// Only one pass per chat may be in flight; a concurrent request gets
    /// `RecallError::IndexInProgress`. Per-message embed/store failures are
    /// logged, counted in the report, and retried on the next pass — they
    /// never abort the run. Cancellation stops the walk between messages
    /// and keeps all work already upserted.
    pub async fn index_chat(
        &self,
        chat_id: &str,
        messages: &[ChatMessage],
        cancel: CancelToken,
    ) -> Result<IndexReport> {
        // Guard against concurrent passes for the same chat, then release
        // the registry lock so other chats can index while we embed.
        let mut entries = {
            let mut states = self.states.lock().await;
            let state = states.entry(chat_id.to_string()).or_default();
            if state.is_indexing {
                return Err(RecallError::IndexInProgress(chat_id.to_string()));
            }
            state.is_indexing = true;
            state.active_cancel = Some(cancel.clone());
            state.entries.clone()
        };

        let report = self
            .run_pass(chat_id, messages, &cancel, &mut entries)
            .await;

        let mut states = self.states.lock().await;
        let state = states.entry(chat_id.to_string()).or_default();
        state.entries = entries;
        state.last_message_count = messages.len();
        state.fully_indexed = !report.cancelled && report.failed == 0;
        state.is_indexing = false;
        state.active_cancel = None;

        info!(
            chat = chat_id,
            indexed = report.indexed,
            unchanged = report.unchanged,
            removed = report.removed,
            failed = report.failed,
            cancelled = report.cancelled,
            "indexing pass finished"
        );
        Ok(report)
    }

    async fn run_pass(
        &self,
        chat_id: &str,
        messages: &[ChatMessage],
        cancel: &CancelToken,
        entries: &mut HashMap<i64, IndexedEntry>,
    ) -> IndexReport {
        let mut report = IndexReport::default();

        // 1. Reconcile deletions first: entries whose message no longer
        //    exists lose their point before anything new is inserted.
        let present: std::collections::HashSet<i64> = messages.iter().map(|m| m.id).collect();
        let gone: Vec<i64> = entries
            .keys()
            .filter(|id| !present.contains(id))
            .copied()
            .collect();
        for message_id in gone {
            if cancel.is_cancelled() {
                report.cancelled = true;
                return report;
            }
            let Some(entry) = entries.get(&message_id) else {
                continue;
            };
            match self.store.delete(&entry.point_id).await {
                Ok(()) => {
                    entries.remove(&message_id);
                    report.removed += 1;
                }
                Err(e) => {
                    // Entry stays so the delete is retried next pass.
                    warn!(chat = chat_id, message_id, "delete failed: {e}");
                    report.failed += 1;
                }
            }
        }

        // 2. Walk messages oldest-first, indexing new and changed ones.
        for message in messages {
            if cancel.is_cancelled() {
                debug!(chat = chat_id, "indexing cancelled, keeping partial progress");
                report.cancelled = true;
                return report;
            }
            if message.text.trim().is_empty() {
                continue;
            }

            let text_hash = sha256_hex(&message.text);
            let stale = match entries.get(&message.id) {
                Some(entry) if entry.swipe_id == message.swipe_id && entry.text_hash == text_hash => {
                    report.unchanged += 1;
                    continue;
                }
                other => other.cloned(),
            };

            let embedding = match self.embedder.embed(&message.text).await {
                Ok(v) => v,
                Err(e) => {
                    let err = RecallError::EmbeddingFailed {
                        message_id: message.id,
                        reason: e.to_string(),
                    };
                    warn!(chat = chat_id, "{err}, will retry next pass");
                    report.failed += 1;
                    continue;
                }
            };

            // Edits and swipes: the old point goes away before the new one
            // lands, so a message id is never live twice.
            if let Some(old) = stale {
                if let Err(e) = self.store.delete(&old.point_id).await {
                    warn!(
                        chat = chat_id,
                        message_id = message.id,
                        "stale point delete failed, skipping reinsert: {e}"
                    );
                    report.failed += 1;
                    continue;
                }
                entries.remove(&message.id);
            }

            let pid = point_id(chat_id, message.id, message.swipe_id);
            let point = Point {
                payload: PointPayload {
                    point_id: pid.clone(),
                    chat_id: chat_id.to_string(),
                    message_id: message.id,
                    swipe_id: message.swipe_id,
                    text: message.text.clone(),
                    text_hash: text_hash.clone(),
                    sent_at: message.sent_at,
                },
                embedding,
            };
            match self.store.upsert(point).await {
                Ok(()) => {
                    entries.insert(
                        message.id,
                        IndexedEntry {
                            swipe_id: message.swipe_id,
                            text_hash,
                            point_id: pid,
                        },
                    );
                    report.indexed += 1;
                }
                Err(e) => {
                    warn!(
                        chat = chat_id,
                        message_id = message.id,
                        "upsert failed, will retry next pass: {e}"
                    );
                    report.failed += 1;
                }
            }
        }

        report
    }

    /// Cancel the in-flight pass for a chat, if any. Cooperative: the pass
    /// stops at the next between-messages checkpoint.
    pub async fn cancel_chat(&self, chat_id: &str) {
        let states = self.states.lock().await;
        if let Some(cancel) = states.get(chat_id).and_then(|s| s.active_cancel.clone()) {
            cancel.cancel();
        }
    }

    /// Message ids currently indexed for a chat.
    pub async fn indexed_ids(&self, chat_id: &str) -> Vec<i64> {
        let states = self.states.lock().await;
        let mut ids: Vec<i64> = states
            .get(chat_id)
            .map(|s| s.entries.keys().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    /// Whether the last pass covered every message without failures.
    pub async fn is_fully_indexed(&self, chat_id: &str) -> bool {
        let states = self.states.lock().await;
        states.get(chat_id).map(|s| s.fully_indexed).unwrap_or(false)
    }

    pub async fn is_indexing(&self, chat_id: &str) -> bool {
        let states = self.states.lock().await;
        states.get(chat_id).map(|s| s.is_indexing).unwrap_or(false)
    }

    pub async fn last_message_count(&self, chat_id: &str) -> usize {
        let states = self.states.lock().await;
        states
            .get(chat_id)
            .map(|s| s.last_message_count)
            .unwrap_or(0)
    }

    /// Drop the in-memory state for a chat without touching its points.
    /// Used on chat switch; must not cancel an in-flight pass.
    pub async fn reset_chat(&self, chat_id: &str) {
        let mut states = self.states.lock().await;
        if let Some(state) = states.get_mut(chat_id) {
            if state.is_indexing {
                // An in-flight pass will write its entries back when done;
                // only the transient counters reset.
                state.last_message_count = 0;
                return;
            }
        }
        states.remove(chat_id);
    }

    /// Tear down a chat entirely: state and stored points. Rejected while
    /// a pass is in flight — its completion write-back would otherwise
    /// resurrect the closed chat with a partial index. The registry lock
    /// is held across the delete so no new pass can start mid-teardown.
    pub async fn close_chat(&self, chat_id: &str) -> Result<()> {
        let mut states = self.states.lock().await;
        if states.get(chat_id).is_some_and(|s| s.is_indexing) {
            return Err(RecallError::IndexInProgress(chat_id.to_string()));
        }
        self.store.delete_chat(chat_id).await?;
        states.remove(chat_id);
        Ok(())
    }

    /// Rebuild the indexed-entries map from the store, e.g. after a restart
    /// with a persistent backend, so unchanged messages are not re-embedded.
    pub async fn restore_chat(&self, chat_id: &str) -> Result<usize> {
        let payloads = self.store.list_chat(chat_id).await?;
        let mut states = self.states.lock().await;
        let state = states.entry(chat_id.to_string()).or_default();
        if state.is_indexing {
            return Err(RecallError::IndexInProgress(chat_id.to_string()));
        }
        state.entries = payloads
            .iter()
            .map(|p| {
                (
                    p.message_id,
                    IndexedEntry {
                        swipe_id: p.swipe_id,
                        text_hash: p.text_hash.clone(),
                        point_id: p.point_id.clone(),
                    },
                )
            })
            .collect();
        Ok(state.entries.len())
    }
}

pub(crate) fn sha256_hex(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteVectorStore;
    use crate::testing::{msg, CountingEmbedder, FlakyEmbedder, GatedEmbedder};

    fn setup() -> (Indexer, Arc<SqliteVectorStore>, Arc<CountingEmbedder>) {
        let store = Arc::new(SqliteVectorStore::open(":memory:").unwrap());
        let embedder = Arc::new(CountingEmbedder::default());
        let indexer = Indexer::new(store.clone(), embedder.clone());
        (indexer, store, embedder)
    }

    #[tokio::test]
    async fn full_pass_indexes_every_message() {
        let (indexer, _store, _emb) = setup();
        let messages = vec![
            msg(1, "Alice likes tea"),
            msg(2, "Bob likes coffee"),
            msg(3, "The garden party is on Sunday"),
        ];
        let report = indexer
            .index_chat("c1", &messages, CancelToken::new())
            .await
            .unwrap();
        assert_eq!(report.indexed, 3);
        assert_eq!(report.failed, 0);
        assert!(!report.cancelled);
        assert_eq!(indexer.indexed_ids("c1").await, vec![1, 2, 3]);
        assert!(indexer.is_fully_indexed("c1").await);
    }

    #[tokio::test]
    async fn second_pass_skips_unchanged_messages() {
        let (indexer, _store, embedder) = setup();
        let messages = vec![msg(1, "hello"), msg(2, "world")];
        indexer
            .index_chat("c1", &messages, CancelToken::new())
            .await
            .unwrap();
        let calls_after_first = embedder.calls();

        let report = indexer
            .index_chat("c1", &messages, CancelToken::new())
            .await
            .unwrap();
        assert_eq!(report.indexed, 0);
        assert_eq!(report.unchanged, 2);
        assert_eq!(embedder.calls(), calls_after_first);
    }

    #[tokio::test]
    async fn deleted_message_loses_its_point() {
        let (indexer, store, _emb) = setup();
        let messages = vec![msg(1, "keep me"), msg(2, "delete me")];
        indexer
            .index_chat("c1", &messages, CancelToken::new())
            .await
            .unwrap();

        let report = indexer
            .index_chat("c1", &messages[..1], CancelToken::new())
            .await
            .unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(indexer.indexed_ids("c1").await, vec![1]);

        let points = store.list_chat("c1").await.unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].message_id, 1);
    }

    #[tokio::test]
    async fn swipe_leaves_exactly_one_live_point() {
        let (indexer, store, _emb) = setup();
        indexer
            .index_chat("c1", &[msg(1, "first draft")], CancelToken::new())
            .await
            .unwrap();

        let swiped = ChatMessage {
            id: 1,
            swipe_id: 1,
            text: "second draft".to_string(),
            sent_at: 1000,
        };
        let report = indexer
            .index_chat("c1", &[swiped], CancelToken::new())
            .await
            .unwrap();
        assert_eq!(report.indexed, 1);

        let points = store.list_chat("c1").await.unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].text, "second draft");
        assert_eq!(points[0].point_id, "c1:1:1");
    }

    #[tokio::test]
    async fn edit_replaces_point_under_same_swipe() {
        let (indexer, store, _emb) = setup();
        indexer
            .index_chat("c1", &[msg(1, "typo herr")], CancelToken::new())
            .await
            .unwrap();
        indexer
            .index_chat("c1", &[msg(1, "typo here")], CancelToken::new())
            .await
            .unwrap();

        let points = store.list_chat("c1").await.unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].text, "typo here");
    }

    #[tokio::test]
    async fn cancel_keeps_partial_progress_and_resumes() {
        let store = Arc::new(SqliteVectorStore::open(":memory:").unwrap());
        // Embedder cancels the pass after the first successful embed.
        let cancel = CancelToken::new();
        let embedder = Arc::new(CountingEmbedder::with_hook({
            let cancel = cancel.clone();
            move |n| {
                if n == 1 {
                    cancel.cancel();
                }
            }
        }));
        let indexer = Indexer::new(store, embedder.clone());

        let messages = vec![msg(1, "one"), msg(2, "two"), msg(3, "three")];
        let report = indexer
            .index_chat("c1", &messages, cancel)
            .await
            .unwrap();
        assert!(report.cancelled);
        assert_eq!(report.indexed, 1);
        assert_eq!(indexer.indexed_ids("c1").await, vec![1]);
        assert!(!indexer.is_fully_indexed("c1").await);

        // Resume: messages 2 and 3 get embedded, message 1 does not.
        let report = indexer
            .index_chat("c1", &messages, CancelToken::new())
            .await
            .unwrap();
        assert_eq!(report.indexed, 2);
        assert_eq!(report.unchanged, 1);
        assert_eq!(indexer.indexed_ids("c1").await, vec![1, 2, 3]);
        assert_eq!(embedder.calls(), 3);
    }

    #[tokio::test]
    async fn failing_message_is_skipped_and_retried() {
        let store = Arc::new(SqliteVectorStore::open(":memory:").unwrap());
        let embedder = Arc::new(FlakyEmbedder::failing_on("poison"));
        let indexer = Indexer::new(store.clone(), embedder.clone());

        let messages = vec![msg(1, "fine"), msg(2, "poison pill"), msg(3, "also fine")];
        let report = indexer
            .index_chat("c1", &messages, CancelToken::new())
            .await
            .unwrap();
        assert_eq!(report.indexed, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(indexer.indexed_ids("c1").await, vec![1, 3]);
        assert!(!indexer.is_fully_indexed("c1").await);

        // Provider recovers; the next pass picks up only the failed message.
        embedder.heal();
        let report = indexer
            .index_chat("c1", &messages, CancelToken::new())
            .await
            .unwrap();
        assert_eq!(report.indexed, 1);
        assert_eq!(report.unchanged, 2);
        assert_eq!(indexer.indexed_ids("c1").await, vec![1, 2, 3]);
        assert!(indexer.is_fully_indexed("c1").await);
    }

    #[tokio::test]
    async fn concurrent_pass_is_rejected_as_duplicate() {
        let store = Arc::new(SqliteVectorStore::open(":memory:").unwrap());
        let embedder = Arc::new(GatedEmbedder::new());
        let indexer = Arc::new(Indexer::new(store, embedder.clone()));

        let messages = vec![msg(1, "blocked")];
        let bg = {
            let indexer = indexer.clone();
            let messages = messages.clone();
            tokio::spawn(async move {
                indexer
                    .index_chat("c1", &messages, CancelToken::new())
                    .await
            })
        };
        embedder.wait_until_blocked().await;
        assert!(indexer.is_indexing("c1").await);

        let err = indexer
            .index_chat("c1", &messages, CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RecallError::IndexInProgress(_)));

        embedder.release();
        let report = bg.await.unwrap().unwrap();
        assert_eq!(report.indexed, 1);
        assert!(!indexer.is_indexing("c1").await);
    }

    #[tokio::test]
    async fn close_chat_removes_points_and_state() {
        let (indexer, store, _emb) = setup();
        indexer
            .index_chat("c1", &[msg(1, "tea"), msg(2, "coffee")], CancelToken::new())
            .await
            .unwrap();

        indexer.close_chat("c1").await.unwrap();
        assert!(indexer.indexed_ids("c1").await.is_empty());
        assert_eq!(indexer.last_message_count("c1").await, 0);
        assert!(store.list_chat("c1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn close_chat_rejects_while_pass_is_in_flight() {
        let store = Arc::new(SqliteVectorStore::open(":memory:").unwrap());
        let embedder = Arc::new(GatedEmbedder::new());
        let indexer = Arc::new(Indexer::new(store.clone(), embedder.clone()));

        let messages = vec![msg(1, "blocked"), msg(2, "also blocked")];
        let bg = {
            let indexer = indexer.clone();
            let messages = messages.clone();
            tokio::spawn(async move {
                indexer
                    .index_chat("c1", &messages, CancelToken::new())
                    .await
            })
        };
        embedder.wait_until_blocked().await;

        let err = indexer.close_chat("c1").await.unwrap_err();
        assert!(matches!(err, RecallError::IndexInProgress(_)));

        // The pass lands untouched; a close afterwards tears everything down.
        embedder.release();
        let report = bg.await.unwrap().unwrap();
        assert_eq!(report.indexed, 2);
        indexer.close_chat("c1").await.unwrap();
        assert!(indexer.indexed_ids("c1").await.is_empty());
        assert!(store.list_chat("c1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn restore_rebuilds_state_from_store() {
        let store = Arc::new(SqliteVectorStore::open(":memory:").unwrap());
        let embedder = Arc::new(CountingEmbedder::default());
        let messages = vec![msg(1, "persisted"), msg(2, "also persisted")];
        {
            let indexer = Indexer::new(store.clone(), embedder.clone());
            indexer
                .index_chat("c1", &messages, CancelToken::new())
                .await
                .unwrap();
        }

        // Fresh indexer over the same store — restore instead of re-embed.
        let indexer = Indexer::new(store, embedder.clone());
        let restored = indexer.restore_chat("c1").await.unwrap();
        assert_eq!(restored, 2);
        let calls_before = embedder.calls();
        let report = indexer
            .index_chat("c1", &messages, CancelToken::new())
            .await
            .unwrap();
        assert_eq!(report.unchanged, 2);
        assert_eq!(embedder.calls(), calls_before);
    }

    #[test]
    fn sha256_hex_known_value() {
        let hash = sha256_hex("hello");
        assert_eq!(
            hash,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }
}
