use thiserror::Error;

/// Errors surfaced across the core's public seams.
///
/// Per-message embedding/store failures during an indexing pass are *not*
/// represented here — they are logged, counted in the `IndexReport`, and
/// retried on the next pass. Cancellation is likewise not an error; a
/// cancelled pass returns a partial, resumable report.
#[derive(Debug, Error)]
pub enum RecallError {
    /// The embedding backend could not be reached or refused the request.
    #[error("embedding provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// The vector store could not be reached or rejected the operation.
    #[error("vector store unavailable: {0}")]
    StoreUnavailable(String),

    /// Embedding a specific message failed (bad input, model error).
    #[error("embedding failed for message {message_id}: {reason}")]
    EmbeddingFailed { message_id: i64, reason: String },

    /// An indexing pass for this chat is already in flight.
    #[error("indexing already in progress for chat {0}")]
    IndexInProgress(String),
}

pub type Result<T> = std::result::Result<T, RecallError>;
