//! In-memory publish/subscribe event bus with bounded history and replay
//!
//! Delivery is synchronous: `publish` returns after every matching
//! subscriber has been invoked. Subscribers are snapshotted under the
//! registry lock and called outside it, so a callback may subscribe,
//! unsubscribe or publish on the same bus. A re-entrant dispatch lock keeps
//! deliveries in history order across threads.

use crate::event::{DeliveryGuarantee, Event, EventId};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Subscriber callback; an `Err` is logged and counted, never propagated
pub type Callback = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

/// Optional per-subscription filter evaluated before the callback
pub type Predicate = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Configuration for the bus
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Maximum number of events kept for history queries and replay
    pub history_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            history_capacity: 10_000,
        }
    }
}

/// Which event types a subscription receives
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventPattern {
    /// The `"*"` wildcard
    All,
    Exact(String),
}

impl EventPattern {
    pub fn matches(&self, event_type: &str) -> bool {
        match self {
            Self::All => true,
            Self::Exact(t) => t == event_type,
        }
    }
}

impl From<&str> for EventPattern {
    fn from(s: &str) -> Self {
        if s == "*" {
            Self::All
        } else {
            Self::Exact(s.to_string())
        }
    }
}

impl From<String> for EventPattern {
    fn from(s: String) -> Self {
        if s == "*" {
            Self::All
        } else {
            Self::Exact(s)
        }
    }
}

impl fmt::Display for EventPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("*"),
            Self::Exact(t) => f.write_str(t),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// History selection; every set field must match, time bounds are inclusive
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub event_type: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn of_type(event_type: impl Into<String>) -> Self {
        Self {
            event_type: Some(event_type.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn since(mut self, start: DateTime<Utc>) -> Self {
        self.start = Some(start);
        self
    }

    #[must_use]
    pub fn until(mut self, end: DateTime<Utc>) -> Self {
        self.end = Some(end);
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        self.event_type
            .as_deref()
            .map_or(true, |t| t == event.event_type)
            && self.start.map_or(true, |s| event.timestamp >= s)
            && self.end.map_or(true, |e| event.timestamp <= e)
    }
}

/// Counters reported by `EventBus::get_stats`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusStats {
    pub total_published: u64,
    /// Successful callback invocations from `publish`
    pub total_delivered: u64,
    /// Callbacks that returned an error or panicked
    pub total_failed: u64,
    /// Successful callback invocations from `replay_events`
    pub total_replayed: u64,
    /// Subscriptions ever registered
    pub total_subscriptions: u64,
    pub active_subscriptions: usize,
    pub history_size: usize,
}

struct Subscription {
    id: SubscriptionId,
    pattern: EventPattern,
    callback: Callback,
    predicate: Option<Predicate>,
    /// Exactly-once events this subscription already received
    delivered: Mutex<HashSet<EventId>>,
}

#[derive(Clone)]
struct HistoryEntry {
    event: Event,
    guarantee: DeliveryGuarantee,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    replayed: AtomicU64,
    subscriptions: AtomicU64,
}

/// The in-process event hub
pub struct EventBus {
    config: EventBusConfig,
    subscriptions: RwLock<Vec<Arc<Subscription>>>,
    history: Mutex<VecDeque<HistoryEntry>>,
    dispatch: ReentrantMutex<()>,
    counters: Counters,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventBusConfig::default())
    }
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        Self {
            config,
            subscriptions: RwLock::new(Vec::new()),
            history: Mutex::new(VecDeque::new()),
            dispatch: ReentrantMutex::new(()),
            counters: Counters::default(),
        }
    }

    /// Bus with the given history cap and otherwise default settings
    pub fn with_history_capacity(history_capacity: usize) -> Self {
        Self::new(EventBusConfig { history_capacity })
    }

    pub fn config(&self) -> &EventBusConfig {
        &self.config
    }

    /// Append to history, then deliver to every matching subscriber.
    ///
    /// Always returns `true`: subscriber failures are isolated.
    pub fn publish(&self, event: Event, guarantee: DeliveryGuarantee) -> bool {
        let _dispatch = self.dispatch.lock();

        let evicted = {
            let mut history = self.history.lock();
            history.push_back(HistoryEntry {
                event: event.clone(),
                guarantee,
            });
            let mut evicted = Vec::new();
            while history.len() > self.config.history_capacity {
                if let Some(old) = history.pop_front() {
                    evicted.push(old.event.event_id);
                }
            }
            evicted
        };
        self.counters.published.fetch_add(1, Ordering::Relaxed);

        let targets = self.matching(&event);
        debug!(
            event_type = %event.event_type,
            event_id = %event.event_id,
            subscribers = targets.len(),
            "publishing event"
        );

        for sub in &targets {
            if self.deliver(sub, &event, guarantee) {
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
            }
        }

        if !evicted.is_empty() {
            self.forget_delivered(&evicted);
        }

        true
    }

    /// Register a callback for `pattern` (`"*"` matches every type).
    ///
    /// Only events published after this call are delivered.
    pub fn subscribe<F>(&self, pattern: impl Into<EventPattern>, callback: F) -> SubscriptionId
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(pattern.into(), Arc::new(callback), None)
    }

    /// Like `subscribe`, with a predicate that must accept the event
    pub fn subscribe_filtered<F, P>(
        &self,
        pattern: impl Into<EventPattern>,
        callback: F,
        predicate: P,
    ) -> SubscriptionId
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
        P: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.register(pattern.into(), Arc::new(callback), Some(Arc::new(predicate)))
    }

    fn register(
        &self,
        pattern: EventPattern,
        callback: Callback,
        predicate: Option<Predicate>,
    ) -> SubscriptionId {
        let id = SubscriptionId::new();
        debug!(subscription = %id, %pattern, "subscribing");
        self.subscriptions.write().push(Arc::new(Subscription {
            id,
            pattern,
            callback,
            predicate,
            delivered: Mutex::new(HashSet::new()),
        }));
        self.counters.subscriptions.fetch_add(1, Ordering::Relaxed);
        id
    }

    /// Remove a subscription; returns whether it existed
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscriptions.write();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    /// The most recent `limit` matching events, oldest first
    pub fn get_event_history(&self, filter: &EventFilter, limit: usize) -> Vec<Event> {
        let history = self.history.lock();
        let matching: Vec<&HistoryEntry> =
            history.iter().filter(|e| filter.matches(&e.event)).collect();
        let skip = matching.len().saturating_sub(limit);
        matching
            .into_iter()
            .skip(skip)
            .map(|e| e.event.clone())
            .collect()
    }

    /// Re-deliver matching history to the current subscribers.
    ///
    /// Nothing is appended to history and event ids are preserved.
    /// Returns the number of successful deliveries.
    pub fn replay_events(&self, filter: &EventFilter) -> usize {
        let _dispatch = self.dispatch.lock();

        let entries: Vec<HistoryEntry> = self
            .history
            .lock()
            .iter()
            .filter(|e| filter.matches(&e.event))
            .cloned()
            .collect();

        let mut delivered = 0;
        for entry in &entries {
            if entry.guarantee == DeliveryGuarantee::AtMostOnce {
                continue;
            }
            for sub in self.matching(&entry.event) {
                if self.deliver(&sub, &entry.event, entry.guarantee) {
                    delivered += 1;
                }
            }
        }

        self.counters
            .replayed
            .fetch_add(delivered as u64, Ordering::Relaxed);
        debug!(events = entries.len(), delivered, "replayed history");
        delivered
    }

    pub fn clear_history(&self) {
        let evicted: Vec<EventId> = {
            let mut history = self.history.lock();
            history.drain(..).map(|e| e.event.event_id).collect()
        };
        self.forget_delivered(&evicted);
    }

    pub fn get_stats(&self) -> BusStats {
        BusStats {
            total_published: self.counters.published.load(Ordering::Relaxed),
            total_delivered: self.counters.delivered.load(Ordering::Relaxed),
            total_failed: self.counters.failed.load(Ordering::Relaxed),
            total_replayed: self.counters.replayed.load(Ordering::Relaxed),
            total_subscriptions: self.counters.subscriptions.load(Ordering::Relaxed),
            active_subscriptions: self.subscriptions.read().len(),
            history_size: self.history.lock().len(),
        }
    }

    fn matching(&self, event: &Event) -> Vec<Arc<Subscription>> {
        self.subscriptions
            .read()
            .iter()
            .filter(|s| s.pattern.matches(&event.event_type))
            .cloned()
            .collect()
    }

    /// Invoke one subscriber; returns whether the callback succeeded
    fn deliver(&self, sub: &Subscription, event: &Event, guarantee: DeliveryGuarantee) -> bool {
        let exactly_once = guarantee == DeliveryGuarantee::ExactlyOnce;
        // Claimed before the callback runs so a nested replay skips it
        if exactly_once && !sub.delivered.lock().insert(event.event_id) {
            return false;
        }

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            if let Some(predicate) = &sub.predicate {
                if !predicate(event) {
                    return Ok(false);
                }
            }
            (sub.callback)(event).map(|()| true)
        }));

        if exactly_once && !matches!(outcome, Ok(Ok(true))) {
            sub.delivered.lock().remove(&event.event_id);
        }

        match outcome {
            Ok(Ok(invoked)) => invoked,
            Ok(Err(err)) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    subscription = %sub.id,
                    event_type = %event.event_type,
                    event_id = %event.event_id,
                    error = %err,
                    "subscriber callback failed"
                );
                false
            }
            Err(_) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    subscription = %sub.id,
                    event_type = %event.event_type,
                    event_id = %event.event_id,
                    "subscriber callback panicked"
                );
                false
            }
        }
    }

    /// Drop exactly-once bookkeeping for events that left history
    fn forget_delivered(&self, ids: &[EventId]) {
        for sub in self.subscriptions.read().iter() {
            let mut delivered = sub.delivered.lock();
            if delivered.is_empty() {
                continue;
            }
            for id in ids {
                delivered.remove(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_parsing() {
        assert_eq!(EventPattern::from("*"), EventPattern::All);
        assert!(EventPattern::from("*").matches("Anything"));
        assert!(EventPattern::from("X").matches("X"));
        assert!(!EventPattern::from("X").matches("Y"));
    }

    #[test]
    fn test_filter_bounds_are_inclusive() {
        let event = Event::new("X", "test");
        let filter = EventFilter::of_type("X")
            .since(event.timestamp)
            .until(event.timestamp);
        assert!(filter.matches(&event));
        assert!(!EventFilter::of_type("Y").matches(&event));
    }
}
