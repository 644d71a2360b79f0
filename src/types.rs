use serde::{Deserialize, Serialize};

/// One chat message as supplied by the host application.
/// `swipe_id` identifies which alternative generation ("swipe") is the
/// currently visible text for this message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: i64,
    pub swipe_id: u32,
    pub text: String,
    /// Unix timestamp in ms.
    pub sent_at: i64,
}

/// Which embedding backend to use.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EmbeddingBackend {
    /// In-process fastembed model (downloaded and cached on first use).
    Local { cache_dir: Option<String> },
    /// OpenAI-compatible `/v1/embeddings` HTTP endpoint.
    OpenAiCompat {
        base_url: String,
        api_key: String,
        model: String,
        dimensions: usize,
    },
}

/// Which vector-store backend holds the indexed points.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreBackend {
    /// SQLite file (`:memory:` works for tests). Exact cosine scan,
    /// survives restarts, supports true deletes.
    Sqlite { path: String },
    /// In-memory HNSW index. Faster for large chats, deletes are
    /// tombstoned until the index is rebuilt.
    Hnsw { capacity: usize },
}

/// Where the retrieved context block is inserted into the outgoing prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionPosition {
    BeforeSystem,
    AfterSystem,
    /// After the last `offset_messages` chat turns.
    InChat,
}

/// How chat changes are observed: host-pushed events, or timer polling
/// when the host exposes no event API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorMode {
    Events,
    Polling,
}

/// Immutable settings snapshot, owned and persisted by the host.
/// The core reads one snapshot per indexing/retrieval cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub embedding: EmbeddingBackend,
    pub store: StoreBackend,
    /// How many passages to retrieve.
    pub retrieval_count: usize,
    /// Dense-score floor; results below it never reach the merge step.
    pub score_threshold: f32,
    /// Weight of the dense (vector) score in the combined score.
    pub dense_weight: f32,
    /// Weight of the sparse (keyword) score in the combined score.
    pub sparse_weight: f32,
    pub injection_position: InjectionPosition,
    /// Number of chat turns kept below an in-chat injection.
    pub injection_offset: usize,
    /// Minimum interval between two injections for the same turn (ms).
    pub injection_debounce_ms: u64,
    pub monitor_mode: MonitorMode,
    pub polling_interval_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            embedding: EmbeddingBackend::Local { cache_dir: None },
            store: StoreBackend::Sqlite {
                path: "recall.sqlite".to_string(),
            },
            retrieval_count: 5,
            score_threshold: 0.3,
            dense_weight: 0.7,
            sparse_weight: 0.3,
            injection_position: InjectionPosition::AfterSystem,
            injection_offset: 4,
            injection_debounce_ms: 2_000,
            monitor_mode: MonitorMode::Events,
            polling_interval_ms: 5_000,
        }
    }
}

/// One retrieved passage, produced per query. Ephemeral.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub message_id: i64,
    pub text: String,
    pub dense_score: f32,
    pub sparse_score: f32,
    pub combined_score: f32,
    /// Unix ms of the source message — used for recency tie-breaks.
    pub sent_at: i64,
}

/// Outcome summary of one indexing pass over a chat.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexReport {
    /// Messages embedded and upserted during this pass.
    pub indexed: usize,
    /// Messages already indexed with an unchanged hash.
    pub unchanged: usize,
    /// Points removed for deleted messages.
    pub removed: usize,
    /// Messages that failed to embed or upsert (retried next pass).
    pub failed: usize,
    /// True if the pass stopped early because the cancel flag was set.
    pub cancelled: bool,
}

/// Derive the stable vector-store point id for a message version.
/// A new swipe produces a new point id, so stale swipes can be deleted
/// before the replacement is inserted.
pub fn point_id(chat_id: &str, message_id: i64, swipe_id: u32) -> String {
    format!("{chat_id}:{message_id}:{swipe_id}")
}
