use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::embeddings::EmbeddingProvider;
use crate::error::Result;
use crate::store::VectorStore;
use crate::types::RetrievalResult;

/// Hybrid retriever: a dense cosine pass through the vector store and a
/// sparse keyword-overlap pass over the same chat's indexed texts, fused
/// into one ranked list.
///
/// The fusion is a weighted sum of the two normalized scores:
/// `combined = dense_weight * dense + sparse_weight * sparse`. Both inputs
/// live in [0, 1], so the formula is monotonic in each and the output is
/// bounded by `dense_weight + sparse_weight`. The dense threshold is
/// applied *before* merging; a passage the vector pass rejects can never
/// be resurrected by keywords.
pub struct Retriever {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    dense_weight: f32,
    sparse_weight: f32,
}

impl Retriever {
    pub fn new(
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        dense_weight: f32,
        sparse_weight: f32,
    ) -> Self {
        Self {
            store,
            embedder,
            dense_weight,
            sparse_weight,
        }
    }

    /// Run both passes for `query` against one chat and return the top `k`
    /// passages ordered by combined score descending, ties broken by more
    /// recent message first, then message id. Deterministic for identical
    /// inputs and store state.
    ///
    /// Provider or store unavailability surfaces as an error; callers that
    /// prefer to degrade (inject nothing rather than block the turn) wrap
    /// this — see [`crate::RecallEngine::retrieve`].
    pub async fn retrieve(
        &self,
        query: &str,
        chat_id: &str,
        k: usize,
        threshold: f32,
    ) -> Result<Vec<RetrievalResult>> {
        if k == 0 || query.trim().is_empty() {
            return Ok(vec![]);
        }

        // Dense pass over every point in the chat. Only the threshold may
        // exclude a candidate before fusion; truncation to k happens after
        // the combined sort, or a high-sparse passage just past a dense
        // cut-off could be dropped from its rightful top-k slot.
        let query_vec = self.embedder.embed(query).await?;
        let dense_hits = self.store.search(chat_id, &query_vec, usize::MAX).await?;

        // Sparse pass over everything indexed for the chat.
        let terms = query_terms(query);
        let sparse_by_message: HashMap<i64, f32> = self
            .store
            .list_chat(chat_id)
            .await?
            .into_iter()
            .map(|p| (p.message_id, sparse_score(&terms, &p.text)))
            .collect();

        let mut results: Vec<RetrievalResult> = dense_hits
            .into_iter()
            .filter(|hit| hit.score >= threshold)
            .map(|hit| {
                let sparse = sparse_by_message
                    .get(&hit.payload.message_id)
                    .copied()
                    .unwrap_or(0.0);
                RetrievalResult {
                    message_id: hit.payload.message_id,
                    combined_score: self.dense_weight * hit.score + self.sparse_weight * sparse,
                    dense_score: hit.score,
                    sparse_score: sparse,
                    sent_at: hit.payload.sent_at,
                    text: hit.payload.text,
                }
            })
            .collect();

        results.sort_by(|a, b| {
            b.combined_score
                .partial_cmp(&a.combined_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.sent_at.cmp(&a.sent_at))
                .then_with(|| a.message_id.cmp(&b.message_id))
        });
        results.truncate(k);

        debug!(
            chat = chat_id,
            terms = terms.len(),
            results = results.len(),
            "hybrid retrieval done"
        );
        Ok(results)
    }
}

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "is", "are", "was", "were", "be", "been", "am", "do",
    "does", "did", "have", "has", "had", "what", "who", "whom", "which", "when", "where", "why",
    "how", "i", "you", "he", "she", "it", "we", "they", "me", "him", "her", "them", "my", "your",
    "his", "its", "our", "their", "this", "that", "these", "those", "of", "in", "on", "at", "to",
    "for", "with", "about", "from", "as", "so", "not", "no", "if", "then", "there",
];

/// A weighted query term. Proper nouns (capitalized words that do not open
/// a sentence) weigh double — names are the strongest lexical signal in
/// chat logs, and the embedding pass tends to wash them out.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryTerm {
    pub term: String,
    pub weight: f32,
}

/// Extract weighted terms from a query. Stop-words are dropped; remaining
/// terms are lowercased. Duplicate terms keep their maximum weight.
pub fn query_terms(query: &str) -> Vec<QueryTerm> {
    let mut terms: Vec<QueryTerm> = Vec::new();
    let mut sentence_start = true;

    for raw in query.split_whitespace() {
        let word: String = raw
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_string();
        let ends_sentence = raw.ends_with(['.', '!', '?']);
        if word.len() < 2 {
            sentence_start = sentence_start || ends_sentence;
            continue;
        }

        let lower = word.to_lowercase();
        if STOPWORDS.contains(&lower.as_str()) {
            sentence_start = ends_sentence;
            continue;
        }

        let capitalized = word.chars().next().is_some_and(|c| c.is_uppercase());
        let weight = if capitalized && !sentence_start { 2.0 } else { 1.0 };

        match terms.iter_mut().find(|t| t.term == lower) {
            Some(existing) => existing.weight = existing.weight.max(weight),
            None => terms.push(QueryTerm { term: lower, weight }),
        }
        sentence_start = ends_sentence;
    }
    terms
}

/// Fraction of query-term weight found in `text`, in [0, 1]. A term
/// matches a document token exactly, or as a prefix when the term is at
/// least three characters (so "like" matches "likes" but "is" cannot
/// match "island").
pub fn sparse_score(terms: &[QueryTerm], text: &str) -> f32 {
    let total: f32 = terms.iter().map(|t| t.weight).sum();
    if total <= 0.0 {
        return 0.0;
    }
    let lower = text.to_lowercase();
    let tokens: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();

    let matched: f32 = terms
        .iter()
        .filter(|t| {
            tokens.iter().any(|tok| {
                *tok == t.term || (t.term.len() >= 3 && tok.starts_with(t.term.as_str()))
            })
        })
        .map(|t| t.weight)
        .sum();
    matched / total
}
