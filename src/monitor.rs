use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// A change observed in the host chat application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatChange {
    /// Messages were added, edited, deleted, or swiped in `chat_id`.
    MessagesChanged { chat_id: String },
    /// The user switched to a different chat.
    ChatSwitched { chat_id: String },
}

/// Where chat changes come from. Two implementations: the host pushes
/// events on a channel when it has an event API, or we poll a cheap
/// snapshot when it does not. The engine loop is identical over either.
#[async_trait]
pub trait ChangeSource: Send {
    /// The next observed change, or `None` once the source shuts down.
    async fn next_change(&mut self) -> Option<ChatChange>;
}

/// Event-subscription source: the host owns the sender half and pushes
/// `ChatChange`s as its own events fire.
pub struct EventChangeSource {
    rx: mpsc::Receiver<ChatChange>,
}

impl EventChangeSource {
    pub fn channel(buffer: usize) -> (mpsc::Sender<ChatChange>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self { rx })
    }
}

#[async_trait]
impl ChangeSource for EventChangeSource {
    async fn next_change(&mut self) -> Option<ChatChange> {
        self.rx.recv().await
    }
}

/// A cheap fingerprint of the host's current chat state, comparable
/// between polls without reading full message bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatCursor {
    pub chat_id: String,
    pub message_count: usize,
    /// Hash (or any stable digest) of the last message's text + swipe,
    /// so in-place edits are visible even when the count is unchanged.
    pub tail_fingerprint: String,
}

/// Snapshot probe implemented by the host for the polling fallback.
/// Returning `None` means the host is shutting down.
pub trait ChatProbe: Send + Sync {
    fn observe(&self) -> Option<ChatCursor>;
}

/// Timer-poll source. The host may write several times while a turn is
/// being saved, so a change starts a quiet-period timer and the
/// notification only fires once the state has stopped moving.
pub struct PollingChangeSource {
    probe: Arc<dyn ChatProbe>,
    interval: Duration,
    quiet: Duration,
    last: Option<ChatCursor>,
    pending_since: Option<Instant>,
}

impl PollingChangeSource {
    pub fn new(probe: Arc<dyn ChatProbe>, interval: Duration, quiet: Duration) -> Self {
        Self {
            probe,
            interval,
            quiet,
            last: None,
            pending_since: None,
        }
    }
}

#[async_trait]
impl ChangeSource for PollingChangeSource {
    async fn next_change(&mut self) -> Option<ChatChange> {
        loop {
            tokio::time::sleep(self.interval).await;

            let Some(current) = self.probe.observe() else {
                return None;
            };

            match &self.last {
                // First observation is a baseline, not a change.
                None => {
                    self.last = Some(current);
                    continue;
                }
                Some(prev) => {
                    if prev.chat_id != current.chat_id {
                        // Chat switches fire immediately; any pending
                        // message-change for the old chat is dropped.
                        self.pending_since = None;
                        let chat_id = current.chat_id.clone();
                        self.last = Some(current);
                        return Some(ChatChange::ChatSwitched { chat_id });
                    }
                    if prev.message_count != current.message_count
                        || prev.tail_fingerprint != current.tail_fingerprint
                    {
                        // Start (or reset) the quiet-period timer.
                        self.pending_since = Some(Instant::now());
                        self.last = Some(current);
                    }
                }
            }

            if let (Some(since), Some(last)) = (self.pending_since, &self.last) {
                if since.elapsed() >= self.quiet {
                    self.pending_since = None;
                    return Some(ChatChange::MessagesChanged {
                        chat_id: last.chat_id.clone(),
                    });
                }
            }
        }
    }
}
