use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::types::{InjectionPosition, RetrievalResult};

/// Hook into the host's prompt pipeline. The host decides what "before
/// the system instructions" or "after the last N turns" means for its
/// prompt layout; the core only says where the block belongs.
pub trait PromptBuilder {
    fn insert(&mut self, position: InjectionPosition, offset_messages: usize, block: &str);
}

/// Result of an injection request. Debounce skips are expected, silent
/// no-ops — not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionOutcome {
    Injected,
    /// A previous injection happened less than the debounce interval ago;
    /// its content stays in place and nothing is re-issued.
    SkippedDebounce,
    /// Nothing to inject (no results survived retrieval).
    SkippedEmpty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionState {
    Idle,
    Injected,
}

/// Debounced prompt-injection scheduler: idle → (request) → injected →
/// idle on the next turn, with requests inside the debounce window
/// skipped. Chat hosts fire several events per turn (message rendered,
/// generation queued, swipe committed); without the debounce each would
/// redo the same injection.
pub struct InjectionScheduler {
    debounce: Duration,
    last_injected_at: Option<Instant>,
    state: InjectionState,
}

impl InjectionScheduler {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            last_injected_at: None,
            state: InjectionState::Idle,
        }
    }

    pub fn state(&self) -> InjectionState {
        self.state
    }

    /// Format `results` into a context block and insert it via `builder`,
    /// unless the previous injection was less than the debounce interval
    /// ago or there is nothing to inject.
    pub fn maybe_inject(
        &mut self,
        builder: &mut dyn PromptBuilder,
        results: &[RetrievalResult],
        position: InjectionPosition,
        offset_messages: usize,
    ) -> InjectionOutcome {
        if results.is_empty() {
            return InjectionOutcome::SkippedEmpty;
        }
        if let Some(last) = self.last_injected_at {
            if last.elapsed() < self.debounce {
                debug!("injection request inside debounce window, skipping");
                return InjectionOutcome::SkippedDebounce;
            }
        }

        let block = format_context_block(results);
        builder.insert(position, offset_messages, &block);
        self.last_injected_at = Some(Instant::now());
        self.state = InjectionState::Injected;
        InjectionOutcome::Injected
    }

    /// The host signals a completed turn; the scheduler returns to idle.
    /// The debounce clock is wall-time and is deliberately not reset here.
    pub fn on_turn_end(&mut self) {
        self.state = InjectionState::Idle;
    }
}

/// Render retrieved passages into the block inserted into the prompt.
/// Oldest passage first, so the model reads recalled events in order.
pub fn format_context_block(results: &[RetrievalResult]) -> String {
    let mut ordered: Vec<&RetrievalResult> = results.iter().collect();
    ordered.sort_by_key(|r| r.sent_at);

    let mut block = String::from("[Recalled from earlier in this chat]\n");
    for r in ordered {
        block.push_str("- ");
        block.push_str(r.text.trim());
        block.push('\n');
    }
    block
}
