//! Retrieval-augmented memory core for a chat application: chat messages →
//! incremental indexer → vector store; query → hybrid dense+sparse
//! retrieval → debounced injection into the outgoing prompt.
//!
//! The host application owns the UI, the settings, and the prompt
//! pipeline; this crate only speaks the narrow traits in [`embeddings`],
//! [`store`], [`injector`] and [`monitor`].

pub mod embeddings;
pub mod embeddings_http;
pub mod error;
pub mod index;
pub mod indexer;
pub mod injector;
pub mod monitor;
pub mod retriever;
pub mod store;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::embeddings::{EmbeddingProvider, LocalEmbedding};
use crate::embeddings_http::OpenAiCompatEmbedding;
use crate::error::{RecallError, Result};
use crate::index::HnswVectorStore;
use crate::indexer::{CancelToken, Indexer};
use crate::injector::{InjectionOutcome, InjectionScheduler, PromptBuilder};
use crate::monitor::{
    ChangeSource, ChatChange, ChatProbe, EventChangeSource, PollingChangeSource,
};
use crate::retriever::Retriever;
use crate::store::{SqliteVectorStore, VectorStore};
use crate::types::{
    ChatMessage, EmbeddingBackend, IndexReport, MonitorMode, RetrievalResult, Settings,
    StoreBackend,
};

/// Read access to the host's message lists, used by the engine loop to
/// fetch a chat's messages when a change notification arrives.
pub trait ChatHost: Send + Sync {
    fn messages(&self, chat_id: &str) -> Vec<ChatMessage>;
}

/// Construct the embedding provider and vector store selected by a
/// settings snapshot.
pub fn build_backends(
    settings: &Settings,
) -> Result<(Arc<dyn VectorStore>, Arc<dyn EmbeddingProvider>)> {
    let embedder: Arc<dyn EmbeddingProvider> = match &settings.embedding {
        EmbeddingBackend::Local { cache_dir } => {
            let dir = cache_dir.as_deref().unwrap_or(".fastembed_cache");
            Arc::new(LocalEmbedding::new(Path::new(dir), false)?)
        }
        EmbeddingBackend::OpenAiCompat {
            base_url,
            api_key,
            model,
            dimensions,
        } => Arc::new(OpenAiCompatEmbedding::new(
            base_url.clone(),
            api_key.clone(),
            model.clone(),
            *dimensions,
        )),
    };

    let store: Arc<dyn VectorStore> = match &settings.store {
        StoreBackend::Sqlite { path } => Arc::new(SqliteVectorStore::open(path)?),
        StoreBackend::Hnsw { capacity } => {
            Arc::new(HnswVectorStore::new(embedder.dimensions(), *capacity)?)
        }
    };

    Ok((store, embedder))
}

/// Select the change source at startup: the host's event subscription
/// when it exposes one, the timer-poll fallback otherwise. The engine
/// loop is identical over either.
pub fn select_change_source(
    settings: &Settings,
    events: Option<EventChangeSource>,
    probe: Arc<dyn ChatProbe>,
) -> Box<dyn ChangeSource> {
    match (settings.monitor_mode, events) {
        (MonitorMode::Events, Some(source)) => Box::new(source),
        _ => {
            let interval = Duration::from_millis(settings.polling_interval_ms);
            // Quiet period: half the poll interval, floored so a very
            // tight interval still collapses save bursts.
            let quiet = (interval / 2).max(Duration::from_millis(250));
            Box::new(PollingChangeSource::new(probe, interval, quiet))
        }
    }
}

/// The host-facing façade: one engine per host process, with per-chat
/// index state held in the indexer's registry.
pub struct RecallEngine {
    settings: Settings,
    indexer: Indexer,
    retriever: Retriever,
    scheduler: tokio::sync::Mutex<InjectionScheduler>,
    current_chat: tokio::sync::Mutex<Option<String>>,
}

impl RecallEngine {
    pub fn new(
        settings: Settings,
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        let indexer = Indexer::new(store.clone(), embedder.clone());
        let retriever = Retriever::new(
            store,
            embedder,
            settings.dense_weight,
            settings.sparse_weight,
        );
        let scheduler = InjectionScheduler::new(Duration::from_millis(
            settings.injection_debounce_ms,
        ));
        Self {
            settings,
            indexer,
            retriever,
            scheduler: tokio::sync::Mutex::new(scheduler),
            current_chat: tokio::sync::Mutex::new(None),
        }
    }

    /// Build an engine from a settings snapshot alone.
    pub fn from_settings(settings: Settings) -> Result<Self> {
        let (store, embedder) = build_backends(&settings)?;
        Ok(Self::new(settings, store, embedder))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn indexer(&self) -> &Indexer {
        &self.indexer
    }

    /// React to a message-list change: run one indexing pass for the chat.
    /// A pass already in flight for this chat rejects the request as a
    /// duplicate (`RecallError::IndexInProgress`).
    pub async fn on_messages_changed(
        &self,
        chat_id: &str,
        messages: &[ChatMessage],
    ) -> Result<IndexReport> {
        self.indexer
            .index_chat(chat_id, messages, CancelToken::new())
            .await
    }

    /// React to the user switching chats. Transient per-chat counters for
    /// the previous chat are reset; an in-flight indexing pass for it is
    /// left running and lands its progress normally.
    pub async fn on_chat_switched(&self, chat_id: &str) {
        let mut current = self.current_chat.lock().await;
        if let Some(prev) = current.take() {
            if prev != chat_id {
                self.indexer.reset_chat(&prev).await;
            }
        }
        *current = Some(chat_id.to_string());
    }

    /// Retrieve context for a query, degrading gracefully: when the
    /// embedding provider or the store is down this returns an empty list
    /// after logging, so the host's chat turn proceeds without context
    /// instead of blocking on the outage.
    pub async fn retrieve(&self, query: &str, chat_id: &str) -> Vec<RetrievalResult> {
        match self
            .retriever
            .retrieve(
                query,
                chat_id,
                self.settings.retrieval_count,
                self.settings.score_threshold,
            )
            .await
        {
            Ok(results) => results,
            Err(e) => {
                warn!(chat = chat_id, "retrieval degraded to empty: {e}");
                vec![]
            }
        }
    }

    /// Retrieve and inject in one step: the usual path when the host is
    /// about to build a prompt. Debounce skips and empty retrievals are
    /// quiet no-ops.
    pub async fn inject_context(
        &self,
        builder: &mut dyn PromptBuilder,
        query: &str,
        chat_id: &str,
    ) -> InjectionOutcome {
        let results = self.retrieve(query, chat_id).await;
        let mut scheduler = self.scheduler.lock().await;
        scheduler.maybe_inject(
            builder,
            &results,
            self.settings.injection_position,
            self.settings.injection_offset,
        )
    }

    /// The host signals the turn finished; the injection state machine
    /// returns to idle.
    pub async fn on_turn_end(&self) {
        self.scheduler.lock().await.on_turn_end();
    }

    /// Cooperatively cancel the in-flight indexing pass for a chat.
    pub async fn cancel_indexing(&self, chat_id: &str) {
        self.indexer.cancel_chat(chat_id).await;
    }

    /// Drive the engine from a change source until it shuts down.
    /// Identical over the event-subscription and polling sources.
    pub async fn run(&self, mut source: Box<dyn ChangeSource>, host: Arc<dyn ChatHost>) {
        while let Some(change) = source.next_change().await {
            match change {
                ChatChange::MessagesChanged { chat_id } => {
                    let messages = host.messages(&chat_id);
                    match self.on_messages_changed(&chat_id, &messages).await {
                        Ok(_) => {}
                        Err(RecallError::IndexInProgress(_)) => {
                            debug!(chat = %chat_id, "indexing already running, skipping duplicate");
                        }
                        Err(e) => {
                            warn!(chat = %chat_id, "indexing pass failed: {e}");
                        }
                    }
                }
                ChatChange::ChatSwitched { chat_id } => {
                    self.on_chat_switched(&chat_id).await;
                }
            }
        }
    }
}
