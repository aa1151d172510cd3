//! In-process event bus with filtered, backpressure-isolated fan-out
//!
//! Every subscriber owns a bounded channel. `publish` never blocks: it applies
//! each subscriber's filter and attempts a non-blocking send, dropping the
//! event for that subscriber alone when its buffer is full. Events reach a
//! single subscriber in publish order.

use crate::store::SessionChange;
use crate::types::{now, ApprovalStatus, SessionStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Kinds of event carried by the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusEventType {
    NewApproval,
    ApprovalResolved,
    SessionStatusChanged,
    ConversationUpdated,
    SessionSettingsChanged,
}

impl BusEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewApproval => "new_approval",
            Self::ApprovalResolved => "approval_resolved",
            Self::SessionStatusChanged => "session_status_changed",
            Self::ConversationUpdated => "conversation_updated",
            Self::SessionSettingsChanged => "session_settings_changed",
        }
    }
}

impl std::fmt::Display for BusEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed event with an attribute bag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEvent {
    #[serde(rename = "type")]
    pub event_type: BusEventType,
    pub timestamp: DateTime<Utc>,
    pub data: Map<String, Value>,
}

impl BusEvent {
    pub fn new(event_type: BusEventType) -> Self {
        Self {
            event_type,
            timestamp: now(),
            data: Map::new(),
        }
    }

    /// Attach an attribute
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    pub fn session_id(&self) -> Option<&str> {
        self.data.get("session_id").and_then(Value::as_str)
    }

    pub fn run_id(&self) -> Option<&str> {
        self.data.get("run_id").and_then(Value::as_str)
    }

    fn scoped(event_type: BusEventType, session_id: &str, run_id: &str) -> Self {
        Self::new(event_type)
            .with("session_id", session_id)
            .with("run_id", run_id)
    }

    pub fn status_changed(
        session_id: &str,
        run_id: &str,
        old_status: SessionStatus,
        new_status: SessionStatus,
    ) -> Self {
        Self::scoped(BusEventType::SessionStatusChanged, session_id, run_id)
            .with("old_status", old_status.as_str())
            .with("new_status", new_status.as_str())
    }

    /// `session_status_changed` for a stored change, if the status moved
    pub fn for_change(change: &SessionChange) -> Option<Self> {
        change.status_changed().then(|| {
            Self::status_changed(
                &change.session.id,
                &change.session.run_id,
                change.previous_status,
                change.session.status,
            )
        })
    }

    pub fn conversation_updated(session_id: &str, run_id: &str) -> Self {
        Self::scoped(BusEventType::ConversationUpdated, session_id, run_id)
    }

    pub fn new_approval(session_id: &str, run_id: &str, approval_id: &str, tool_name: &str) -> Self {
        Self::scoped(BusEventType::NewApproval, session_id, run_id)
            .with("approval_id", approval_id)
            .with("tool_name", tool_name)
    }

    pub fn approval_resolved(
        session_id: &str,
        run_id: &str,
        approval_id: &str,
        status: ApprovalStatus,
        response_text: Option<&str>,
    ) -> Self {
        Self::scoped(BusEventType::ApprovalResolved, session_id, run_id)
            .with("approval_id", approval_id)
            .with("approved", status == ApprovalStatus::Approved)
            .with("response_text", response_text.unwrap_or_default())
    }

    pub fn settings_changed(session_id: &str, run_id: &str, changes: Map<String, Value>) -> Self {
        let mut event = Self::scoped(BusEventType::SessionSettingsChanged, session_id, run_id);
        event.data.extend(changes);
        event
    }
}

/// Conjunctive subscriber filter
///
/// An empty `event_types` accepts every type. A set `session_id` or `run_id`
/// only matches events carrying the same value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionFilter {
    #[serde(default)]
    pub event_types: Vec<BusEventType>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub run_id: Option<String>,
}

impl SubscriptionFilter {
    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Default::default()
        }
    }

    pub fn with_types(mut self, types: impl IntoIterator<Item = BusEventType>) -> Self {
        self.event_types = types.into_iter().collect();
        self
    }

    pub fn matches(&self, event: &BusEvent) -> bool {
        if !self.event_types.is_empty() && !self.event_types.contains(&event.event_type) {
            return false;
        }
        if let Some(session_id) = &self.session_id {
            if event.session_id() != Some(session_id.as_str()) {
                return false;
            }
        }
        if let Some(run_id) = &self.run_id {
            if event.run_id() != Some(run_id.as_str()) {
                return false;
            }
        }
        true
    }
}

struct Subscriber {
    filter: SubscriptionFilter,
    tx: mpsc::Sender<BusEvent>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Registry {
    subscribers: RwLock<HashMap<String, Subscriber>>,
    dropped: AtomicU64,
}

impl Registry {
    // A poisoned registry is still structurally sound; publishing must not fail.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Subscriber>> {
        self.subscribers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Subscriber>> {
        self.subscribers.write().unwrap_or_else(|e| e.into_inner())
    }

    fn remove(&self, id: &str) -> bool {
        match self.write().remove(id) {
            Some(sub) => {
                sub.cancel.cancel();
                true
            }
            None => false,
        }
    }
}

/// Process-wide broadcaster of `BusEvent`s
#[derive(Clone)]
pub struct EventBus {
    registry: Arc<Registry>,
    buffer: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

impl EventBus {
    /// Create a bus whose subscribers each buffer `buffer` events
    pub fn new(buffer: usize) -> Self {
        Self {
            registry: Arc::new(Registry::default()),
            buffer: buffer.max(1),
        }
    }

    /// Register a subscriber bound to `cancel`
    ///
    /// The subscription ends when the token is cancelled, when
    /// `unsubscribe` is called, or when the handle is dropped.
    pub fn subscribe(&self, filter: SubscriptionFilter, cancel: CancellationToken) -> Subscription {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(self.buffer);
        let cancel = cancel.child_token();

        tracing::info!(
            subscriber = %id,
            event_types = ?filter.event_types,
            session_id = ?filter.session_id,
            run_id = ?filter.run_id,
            "Subscription created"
        );

        self.registry.write().insert(
            id.clone(),
            Subscriber {
                filter,
                tx,
                cancel: cancel.clone(),
            },
        );

        Subscription {
            id,
            rx,
            cancel,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Remove a subscriber; its undelivered events are discarded
    pub fn unsubscribe(&self, subscriber_id: &str) -> bool {
        let removed = self.registry.remove(subscriber_id);
        if removed {
            tracing::info!(subscriber = %subscriber_id, "Subscription removed");
        }
        removed
    }

    /// Deliver an event to every matching subscriber without blocking
    ///
    /// Returns the number of subscribers the event was enqueued for.
    pub fn publish(&self, event: BusEvent) -> usize {
        let mut targets = Vec::new();
        let mut stale = Vec::new();
        {
            let subscribers = self.registry.read();
            for (id, sub) in subscribers.iter() {
                if sub.cancel.is_cancelled() || sub.tx.is_closed() {
                    stale.push(id.clone());
                } else if sub.filter.matches(&event) {
                    targets.push((id.clone(), sub.tx.clone()));
                }
            }
        }

        let mut delivered = 0;
        for (id, tx) in targets {
            match tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.registry.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        subscriber = %id,
                        event_type = %event.event_type,
                        "Subscriber buffer full, dropping event"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => stale.push(id),
            }
        }

        if !stale.is_empty() {
            let mut subscribers = self.registry.write();
            for id in &stale {
                if let Some(sub) = subscribers.remove(id) {
                    sub.cancel.cancel();
                    tracing::debug!(subscriber = %id, "Pruned closed subscription");
                }
            }
        }

        delivered
    }

    /// Publish `session_status_changed` if the change moved the status
    pub fn publish_change(&self, change: &SessionChange) {
        if let Some(event) = BusEvent::for_change(change) {
            self.publish(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.read().len()
    }

    /// Events dropped on full buffers since the bus was created
    pub fn dropped_count(&self) -> u64 {
        self.registry.dropped.load(Ordering::Relaxed)
    }
}

/// Receiving half of a subscription
pub struct Subscription {
    id: String,
    rx: mpsc::Receiver<BusEvent>,
    cancel: CancellationToken,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next event, or `None` once cancelled or unsubscribed
    pub async fn recv(&mut self) -> Option<BusEvent> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.detach();
                None
            }
            event = self.rx.recv() => event,
        }
    }

    /// Next buffered event without waiting
    pub fn try_recv(&mut self) -> Option<BusEvent> {
        if self.cancel.is_cancelled() {
            return None;
        }
        self.rx.try_recv().ok()
    }

    /// Adapt into a `Stream` that ends with the subscription
    pub fn into_stream(self) -> impl futures::Stream<Item = BusEvent> + Send {
        futures::stream::unfold(self, |mut sub| async move {
            let event = sub.recv().await?;
            Some((event, sub))
        })
    }

    fn detach(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            if registry.remove(&self.id) {
                tracing::info!(subscriber = %self.id, "Subscription ended");
            }
        }
        self.rx.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}
