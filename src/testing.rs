//! Deterministic test doubles shared by the unit-test modules.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::embeddings::{normalize, EmbeddingProvider};
use crate::error::{RecallError, Result};
use crate::types::ChatMessage;

/// Bag-of-keywords embedding: each dimension is 1.0 when the text contains
/// that keyword. Lets vector search distinguish topics without a model.
pub const KEYWORDS: [&str; 8] = [
    "alice", "bob", "tea", "coffee", "dragon", "castle", "music", "garden",
];

pub fn keyword_embedding(text: &str) -> Vec<f32> {
    let lower = text.to_lowercase();
    normalize(
        KEYWORDS
            .iter()
            .map(|kw| if lower.contains(kw) { 1.0 } else { 0.0 })
            .collect(),
    )
}

pub fn msg(id: i64, text: &str) -> ChatMessage {
    ChatMessage {
        id,
        swipe_id: 0,
        text: text.to_string(),
        sent_at: id * 1000,
    }
}

type EmbedHook = Box<dyn Fn(usize) + Send + Sync>;

/// Counts embed calls; optionally runs a hook after each one (used to
/// flip a cancel flag mid-pass).
#[derive(Default)]
pub struct CountingEmbedder {
    calls: AtomicUsize,
    hook: Option<EmbedHook>,
}

impl CountingEmbedder {
    pub fn with_hook(hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            hook: Some(Box::new(hook)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for CountingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(hook) = &self.hook {
            hook(n);
        }
        Ok(keyword_embedding(text))
    }

    fn model_name(&self) -> &str {
        "counting-mock"
    }

    fn dimensions(&self) -> usize {
        KEYWORDS.len()
    }
}

/// Fails any text containing a trigger substring until healed.
pub struct FlakyEmbedder {
    trigger: String,
    healed: AtomicBool,
}

impl FlakyEmbedder {
    pub fn failing_on(trigger: &str) -> Self {
        Self {
            trigger: trigger.to_string(),
            healed: AtomicBool::new(false),
        }
    }

    pub fn heal(&self) {
        self.healed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl EmbeddingProvider for FlakyEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if !self.healed.load(Ordering::SeqCst) && text.contains(&self.trigger) {
            return Err(RecallError::ProviderUnavailable("simulated outage".into()));
        }
        Ok(keyword_embedding(text))
    }

    fn model_name(&self) -> &str {
        "flaky-mock"
    }

    fn dimensions(&self) -> usize {
        KEYWORDS.len()
    }
}

/// Blocks inside `embed` until released — lets a test hold an indexing
/// pass open while asserting the duplicate-request guard.
pub struct GatedEmbedder {
    blocked: AtomicBool,
    gate: Semaphore,
}

impl GatedEmbedder {
    pub fn new() -> Self {
        Self {
            blocked: AtomicBool::new(false),
            gate: Semaphore::new(0),
        }
    }

    pub async fn wait_until_blocked(&self) {
        while !self.blocked.load(Ordering::SeqCst) {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
    }

    pub fn release(&self) {
        self.gate.add_permits(usize::MAX >> 3);
    }
}

impl Default for GatedEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingProvider for GatedEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.blocked.store(true, Ordering::SeqCst);
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| RecallError::ProviderUnavailable(e.to_string()))?;
        permit.forget();
        self.blocked.store(false, Ordering::SeqCst);
        Ok(keyword_embedding(text))
    }

    fn model_name(&self) -> &str {
        "gated-mock"
    }

    fn dimensions(&self) -> usize {
        KEYWORDS.len()
    }
}
