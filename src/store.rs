use async_trait::async_trait;
use rusqlite::Connection;
use tokio::sync::Mutex;

use crate::embeddings::cosine_score;
use crate::error::{RecallError, Result};

/// Everything stored alongside a vector. Returned by scans and searches
/// so the retriever can run its sparse pass without a second lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct PointPayload {
    pub point_id: String,
    pub chat_id: String,
    pub message_id: i64,
    pub swipe_id: u32,
    pub text: String,
    pub text_hash: String,
    /// Unix ms of the source message.
    pub sent_at: i64,
}

/// A full point as written by the indexer.
#[derive(Debug, Clone)]
pub struct Point {
    pub payload: PointPayload,
    pub embedding: Vec<f32>,
}

/// A search hit: payload plus its cosine score in [0, 1].
#[derive(Debug, Clone)]
pub struct ScoredPoint {
    pub payload: PointPayload,
    pub score: f32,
}

/// Narrow contract over the vector store. All index mutation flows through
/// `upsert`/`delete`; the indexer serializes them per chat.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or replace the point stored under `point.payload.point_id`.
    async fn upsert(&self, point: Point) -> Result<()>;

    /// Remove the point with this id. Removing a missing id is a no-op.
    async fn delete(&self, point_id: &str) -> Result<()>;

    /// Remove every point belonging to a chat (chat deleted on the host).
    async fn delete_chat(&self, chat_id: &str) -> Result<()>;

    /// Cosine search over one chat's points. Results are sorted by score
    /// descending, ties broken by `sent_at` descending then `message_id`,
    /// so identical inputs always produce identical output.
    async fn search(&self, chat_id: &str, query: &[f32], limit: usize)
        -> Result<Vec<ScoredPoint>>;

    /// All live payloads for a chat, ordered by `message_id`. Feeds the
    /// sparse retrieval pass and index-state recovery after a restart.
    async fn list_chat(&self, chat_id: &str) -> Result<Vec<PointPayload>>;
}

/// Deterministic ordering shared by both store backends.
pub(crate) fn sort_scored(points: &mut [ScoredPoint]) {
    points.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.payload.sent_at.cmp(&a.payload.sent_at))
            .then_with(|| a.payload.message_id.cmp(&b.payload.message_id))
    });
}

/// SQLite-backed store. Exact cosine scan over the chat's points — chats
/// are small enough (hundreds to low thousands of messages) that a scan
/// beats maintaining an ANN structure, and deletes are real deletes.
pub struct SqliteVectorStore {
    conn: Mutex<Connection>,
}

fn store_err(e: impl std::fmt::Display) -> RecallError {
    RecallError::StoreUnavailable(e.to_string())
}

impl SqliteVectorStore {
    /// Open (and migrate) the store at `path`. `:memory:` gives an
    /// ephemeral store for tests.
    pub fn open(path: &str) -> Result<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory().map_err(store_err)?
        } else {
            Connection::open(path).map_err(store_err)?
        };
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             CREATE TABLE IF NOT EXISTS points (
                 point_id   TEXT PRIMARY KEY,
                 chat_id    TEXT NOT NULL,
                 message_id INTEGER NOT NULL,
                 swipe_id   INTEGER NOT NULL,
                 text       TEXT NOT NULL,
                 text_hash  TEXT NOT NULL,
                 sent_at    INTEGER NOT NULL,
                 embedding  BLOB NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_points_chat ON points(chat_id);",
        )
        .map_err(store_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn embedding_to_blob(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn row_payload(row: &rusqlite::Row<'_>) -> rusqlite::Result<PointPayload> {
    Ok(PointPayload {
        point_id: row.get(0)?,
        chat_id: row.get(1)?,
        message_id: row.get(2)?,
        swipe_id: row.get::<_, i64>(3)? as u32,
        text: row.get(4)?,
        text_hash: row.get(5)?,
        sent_at: row.get(6)?,
    })
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn upsert(&self, point: Point) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO points
                 (point_id, chat_id, message_id, swipe_id, text, text_hash, sent_at, embedding)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                point.payload.point_id,
                point.payload.chat_id,
                point.payload.message_id,
                point.payload.swipe_id as i64,
                point.payload.text,
                point.payload.text_hash,
                point.payload.sent_at,
                embedding_to_blob(&point.embedding),
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    async fn delete(&self, point_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM points WHERE point_id = ?1", [point_id])
            .map_err(store_err)?;
        Ok(())
    }

    async fn delete_chat(&self, chat_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM points WHERE chat_id = ?1", [chat_id])
            .map_err(store_err)?;
        Ok(())
    }

    async fn search(
        &self,
        chat_id: &str,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<ScoredPoint>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT point_id, chat_id, message_id, swipe_id, text, text_hash, sent_at, embedding
                 FROM points WHERE chat_id = ?1",
            )
            .map_err(store_err)?;

        let mut scored: Vec<ScoredPoint> = stmt
            .query_map([chat_id], |row| {
                let payload = row_payload(row)?;
                let blob: Vec<u8> = row.get(7)?;
                Ok((payload, blob))
            })
            .map_err(store_err)?
            .filter_map(|r| {
                r.map_err(|e| tracing::warn!("skipping malformed point row: {e}"))
                    .ok()
            })
            .map(|(payload, blob)| {
                let score = cosine_score(query, &blob_to_embedding(&blob));
                ScoredPoint { payload, score }
            })
            .collect();

        sort_scored(&mut scored);
        scored.truncate(limit);
        Ok(scored)
    }

    async fn list_chat(&self, chat_id: &str) -> Result<Vec<PointPayload>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT point_id, chat_id, message_id, swipe_id, text, text_hash, sent_at
                 FROM points WHERE chat_id = ?1
                 ORDER BY message_id",
            )
            .map_err(store_err)?;
        let rows = stmt
            .query_map([chat_id], row_payload)
            .map_err(store_err)?
            .filter_map(|r| {
                r.map_err(|e| tracing::warn!("skipping malformed point row: {e}"))
                    .ok()
            })
            .collect();
        Ok(rows)
    }
}
