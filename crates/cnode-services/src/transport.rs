//! Transport seam — topic-based publish/subscribe.
//!
//! The node only needs three things from the network: publish a payload on a
//! topic, register a callback for a key expression, and drop that callback
//! again. Key expressions are `/`-separated; `*` matches one segment and
//! `**` matches any number of segments, including none.
//!
//! `LocalBus` is the in-process implementation used by tests and by nodes
//! sharing one runtime. The daemon ships a UDP multicast implementation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;

/// Invoked with `(payload, topic)` for every matching publication.
pub type MessageCallback = Arc<dyn Fn(&[u8], &str) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid key expression \"{0}\"")]
    InvalidKey(String),
    #[error("payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("send queue full ({0} pending)")]
    QueueFull(usize),
    #[error("transport closed")]
    Closed,
}

pub trait Transport: Send + Sync {
    /// Publish `payload` on a concrete topic (no wildcards).
    fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError>;

    /// Deliver every publication whose topic matches `key_expr` to `callback`.
    fn subscribe(
        &self,
        key_expr: &str,
        callback: MessageCallback,
    ) -> Result<SubscriptionId, TransportError>;

    /// Returns false if the id was not subscribed.
    fn unsubscribe(&self, id: SubscriptionId) -> bool;
}

// ── Key expressions ──────────────────────────────────────────────────────────

/// Whether a key expression is well formed: non-empty segments only.
pub fn valid_key_expr(key_expr: &str) -> bool {
    !key_expr.is_empty() && key_expr.split('/').all(|s| !s.is_empty())
}

/// Whether a concrete topic is well formed: a valid key with no wildcards.
pub fn valid_topic(topic: &str) -> bool {
    valid_key_expr(topic) && topic.split('/').all(|s| s != "*" && s != "**")
}

/// Match a concrete topic against a key expression.
pub fn key_expr_matches(key_expr: &str, topic: &str) -> bool {
    let pattern: Vec<&str> = key_expr.split('/').collect();
    let segments: Vec<&str> = topic.split('/').collect();
    matches_segments(&pattern, &segments)
}

fn matches_segments(pattern: &[&str], topic: &[&str]) -> bool {
    match pattern.split_first() {
        None => topic.is_empty(),
        Some((&"**", rest)) => (0..=topic.len()).any(|skip| matches_segments(rest, &topic[skip..])),
        Some((&head, rest)) => match topic.split_first() {
            Some((&seg, tail)) => (head == "*" || head == seg) && matches_segments(rest, tail),
            None => false,
        },
    }
}

// ── Subscriber table ─────────────────────────────────────────────────────────

/// Subscriptions shared by transport implementations.
#[derive(Default)]
pub struct SubscriberSet {
    next_id: AtomicU64,
    subscribers: DashMap<SubscriptionId, (String, MessageCallback)>,
}

impl SubscriberSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &self,
        key_expr: &str,
        callback: MessageCallback,
    ) -> Result<SubscriptionId, TransportError> {
        if !valid_key_expr(key_expr) {
            return Err(TransportError::InvalidKey(key_expr.to_string()));
        }
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .insert(id, (key_expr.to_string(), callback));
        Ok(id)
    }

    pub fn remove(&self, id: SubscriptionId) -> bool {
        self.subscribers.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Hand a publication to every matching subscriber. Returns how many
    /// callbacks ran.
    pub fn deliver(&self, topic: &str, payload: &[u8]) -> usize {
        // Collect first: a callback may subscribe or unsubscribe.
        let matching: Vec<MessageCallback> = self
            .subscribers
            .iter()
            .filter(|entry| key_expr_matches(&entry.value().0, topic))
            .map(|entry| entry.value().1.clone())
            .collect();
        for callback in &matching {
            callback(payload, topic);
        }
        matching.len()
    }
}

// ── In-process bus ───────────────────────────────────────────────────────────

/// Synchronous in-process transport. Publishing runs matching callbacks on
/// the caller's thread before returning.
#[derive(Default, Clone)]
pub struct LocalBus {
    subscribers: Arc<SubscriberSet>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl Transport for LocalBus {
    fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        if !valid_topic(topic) {
            return Err(TransportError::InvalidKey(topic.to_string()));
        }
        let delivered = self.subscribers.deliver(topic, &payload);
        tracing::trace!(topic, len = payload.len(), delivered, "local publish");
        Ok(())
    }

    fn subscribe(
        &self,
        key_expr: &str,
        callback: MessageCallback,
    ) -> Result<SubscriptionId, TransportError> {
        self.subscribers.insert(key_expr, callback)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.remove(id)
    }
}
