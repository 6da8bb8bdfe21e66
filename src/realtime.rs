//! Realtime notification bridge: relays row-change events to in-process
//! subscribers (and from there to SSE clients), with a reconnecting listener
//! for consumers that must survive lagging or closed channels.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

pub const DEFAULT_FEED_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
}

/// One row change, filtered by `scope_id` (the owning organisation for
/// documents, the job id for generation tasks, the user id for progress).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub event_type: ChangeType,
    pub table: String,
    pub scope_id: Uuid,
    pub row_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(
        event_type: ChangeType,
        table: &str,
        scope_id: Uuid,
        row_id: Uuid,
        new: Option<Value>,
        old: Option<Value>,
    ) -> Self {
        Self {
            event_type,
            table: table.to_string(),
            scope_id,
            row_id,
            new,
            old,
            timestamp: Utc::now(),
        }
    }
}

/// Broadcast hub for change events. Cloning is cheap; all clones share the
/// same channel.
#[derive(Clone)]
pub struct ChangeFeed {
    sender: Arc<broadcast::Sender<ChangeEvent>>,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// No active receivers is fine.
    pub fn publish(&self, event: ChangeEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events whose `scope_id` matches. The previous receiver
    /// (if the handle is reused) is dropped before the new one is created,
    /// so re-subscribing never leaks channels.
    pub fn subscribe(&self, scope_id: Uuid) -> Subscription {
        Subscription {
            scope_id,
            receiver: Some(self.sender.subscribe()),
        }
    }

    pub fn raw_receiver(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }

    /// A handle that does not keep the feed alive. Used by listeners so that
    /// a torn-down feed is observable as a connection loss.
    pub fn downgrade(&self) -> FeedRef {
        FeedRef {
            sender: Arc::downgrade(&self.sender),
        }
    }
}

#[derive(Clone)]
pub struct FeedRef {
    sender: std::sync::Weak<broadcast::Sender<ChangeEvent>>,
}

impl FeedRef {
    pub fn subscribe(&self, scope_id: Uuid) -> Option<Subscription> {
        self.sender.upgrade().map(|sender| Subscription {
            scope_id,
            receiver: Some(sender.subscribe()),
        })
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}

/// A scoped subscription. `unsubscribe` may be called any number of times.
pub struct Subscription {
    scope_id: Uuid,
    receiver: Option<broadcast::Receiver<ChangeEvent>>,
}

impl Subscription {
    pub fn scope_id(&self) -> Uuid {
        self.scope_id
    }

    pub fn is_active(&self) -> bool {
        self.receiver.is_some()
    }

    /// Next event matching this subscription's scope, or `None` once
    /// unsubscribed or the feed is gone.
    pub async fn next_event(&mut self) -> Option<ChangeEvent> {
        let receiver = self.receiver.as_mut()?;
        loop {
            match receiver.recv().await {
                Ok(event) if event.scope_id == self.scope_id => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn unsubscribe(&mut self) {
        self.receiver.take();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

/// Exponential backoff: `base`, doubling, capped at `cap`, at most
/// `max_attempts` retries before giving up.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    /// Delay before retry `attempt` (1-based), or `None` past the ceiling.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let exp = attempt.saturating_sub(1).min(31);
        let delay = self.base.saturating_mul(1u32 << exp);
        Some(delay.min(self.cap))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(10),
            max_attempts: 5,
        }
    }
}

/// A consumer that keeps a scoped subscription alive across channel errors.
/// On a dropped channel it re-subscribes with exponential backoff; after the
/// attempt ceiling it parks in `ConnectionState::Error` and expects a manual
/// `reconnect`.
pub struct ResilientListener {
    feed: FeedRef,
    scope_id: Uuid,
    policy: BackoffPolicy,
    state: ConnectionState,
    attempts: u32,
    subscription: Option<Subscription>,
}

impl ResilientListener {
    pub fn new(feed: FeedRef, scope_id: Uuid, policy: BackoffPolicy) -> Self {
        Self {
            feed,
            scope_id,
            policy,
            state: ConnectionState::Disconnected,
            attempts: 0,
            subscription: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Tears down any previous channel before establishing a new one.
    pub fn connect(&mut self) -> bool {
        self.state = ConnectionState::Connecting;
        if let Some(mut previous) = self.subscription.take() {
            previous.unsubscribe();
        }
        match self.feed.subscribe(self.scope_id) {
            Some(subscription) => {
                self.subscription = Some(subscription);
                self.state = ConnectionState::Connected;
                self.attempts = 0;
                true
            }
            None => {
                self.state = ConnectionState::Disconnected;
                false
            }
        }
    }

    /// Manual restart after the listener has hit `ConnectionState::Error`.
    pub fn reconnect(&mut self) -> bool {
        self.attempts = 0;
        self.connect()
    }

    /// Wait for the next scoped event, re-subscribing on channel loss. Returns
    /// `None` once the retry ceiling is exhausted (state becomes `Error`).
    pub async fn next_event(&mut self) -> Option<ChangeEvent> {
        loop {
            if self.state == ConnectionState::Error {
                return None;
            }

            if let Some(subscription) = self.subscription.as_mut() {
                if let Some(event) = subscription.next_event().await {
                    return Some(event);
                }
                // Channel closed underneath us.
                self.subscription.take();
            } else if self.connect() {
                continue;
            }

            self.attempts += 1;
            match self.policy.delay(self.attempts) {
                Some(delay) => {
                    self.state = ConnectionState::Reconnecting;
                    tokio::time::sleep(delay).await;
                }
                None => {
                    self.state = ConnectionState::Error;
                    return None;
                }
            }
        }
    }
}
