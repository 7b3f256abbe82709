//! Alert dispatch and client fan-out.
//!
//! [`StreamHub`] is the generic fan-out primitive behind the four push
//! channels: every subscriber owns a bounded queue, and a slow consumer loses
//! its oldest queued item rather than ever blocking a publisher. The
//! [`AlertDispatcher`] layers the bounded in-memory alert ring on top, giving
//! late subscribers a replay of recent alerts and the query API its page
//! source.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::pipeline::data::{Alert, AlertSeverity};

/// Alerts replayed to a new subscriber from the ring.
const REPLAY_COUNT: usize = 20;

/// Outbound queue bound per subscriber.
const SUBSCRIBER_QUEUE_CAPACITY: usize = 64;

pub struct SubscriberQueue {
    items: Mutex<VecDeque<Value>>,
    dropped: AtomicU64,
    capacity: usize,
}

/// A client's handle on one stream. Dropping it unsubscribes; the hub prunes
/// the dead entry on the next publish.
pub struct Subscription {
    queue: Arc<SubscriberQueue>,
}

impl Subscription {
    /// Take everything currently queued, in delivery order.
    pub fn drain(&self) -> Vec<Value> {
        let mut items = self.queue.items.lock().expect("subscriber queue poisoned");
        items.drain(..).collect()
    }

    /// Alerts dropped for this subscriber under backpressure.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }
}

/// Fan-out of serialised payloads to any number of subscribers.
pub struct StreamHub {
    name: &'static str,
    queue_capacity: usize,
    subscribers: Mutex<Vec<Weak<SubscriberQueue>>>,
    total_dropped: AtomicU64,
}

impl StreamHub {
    pub fn new(name: &'static str) -> Self {
        Self::with_queue_capacity(name, SUBSCRIBER_QUEUE_CAPACITY)
    }

    pub fn with_queue_capacity(name: &'static str, queue_capacity: usize) -> Self {
        Self {
            name,
            queue_capacity,
            subscribers: Mutex::new(Vec::new()),
            total_dropped: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn subscribe(&self) -> Subscription {
        self.subscribe_seeded(Vec::new())
    }

    /// Subscribe with items already queued (ring replay).
    fn subscribe_seeded(&self, seed: Vec<Value>) -> Subscription {
        let queue = Arc::new(SubscriberQueue {
            items: Mutex::new(seed.into_iter().collect()),
            dropped: AtomicU64::new(0),
            capacity: self.queue_capacity,
        });
        self.subscribers
            .lock()
            .expect("subscriber list poisoned")
            .push(Arc::downgrade(&queue));
        Subscription { queue }
    }

    pub fn publish<T: Serialize>(&self, payload: &T) {
        match serde_json::to_value(payload) {
            Ok(value) => self.publish_json(value),
            Err(err) => tracing::error!("failed to serialise {} payload: {err}", self.name),
        }
    }

    pub fn publish_json(&self, value: Value) {
        let mut subscribers = self.subscribers.lock().expect("subscriber list poisoned");
        subscribers.retain(|weak| {
            let Some(queue) = weak.upgrade() else {
                return false;
            };
            let mut items = queue.items.lock().expect("subscriber queue poisoned");
            if items.len() >= queue.capacity {
                items.pop_front();
                queue.dropped.fetch_add(1, Ordering::Relaxed);
                self.total_dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("argus_subscriber_dropped_total", "stream" => self.name)
                    .increment(1);
            }
            items.push_back(value.clone());
            true
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("subscriber list poisoned")
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Total payloads dropped across all subscribers, past and present.
    pub fn total_dropped(&self) -> u64 {
        self.total_dropped.load(Ordering::Relaxed)
    }
}

// ── Alert dispatcher ─────────────────────────────────────────────────────────

pub struct AlertDispatcher {
    ring: Mutex<VecDeque<Alert>>,
    capacity: usize,
    replay: usize,
    hub: StreamHub,
}

impl AlertDispatcher {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            replay: REPLAY_COUNT,
            hub: StreamHub::new("alerts"),
        }
    }

    /// Append to the ring, then fan out to every live subscriber.
    pub fn publish(&self, alert: Alert) {
        metrics::counter!("argus_alerts_published_total", "severity" => alert.severity.label())
            .increment(1);

        let value = match serde_json::to_value(&alert) {
            Ok(value) => value,
            Err(err) => {
                tracing::error!("failed to serialise alert {}: {err}", alert.id);
                return;
            }
        };

        // The ring lock is held across the fan-out so a concurrent subscribe
        // cannot miss an alert between its replay snapshot and registration.
        let mut ring = self.ring.lock().expect("alert ring poisoned");
        ring.push_back(alert);
        if ring.len() > self.capacity {
            ring.pop_front();
        }
        self.hub.publish_json(value);
    }

    /// Subscribe, receiving the most recent ring entries first.
    pub fn subscribe(&self) -> Subscription {
        let ring = self.ring.lock().expect("alert ring poisoned");
        let seed: Vec<Value> = ring
            .iter()
            .rev()
            .take(self.replay)
            .rev()
            .filter_map(|alert| serde_json::to_value(alert).ok())
            .collect();
        self.hub.subscribe_seeded(seed)
    }

    /// Mark an alert read. Idempotent; returns whether the id was known.
    pub fn acknowledge(&self, id: Uuid) -> bool {
        let mut ring = self.ring.lock().expect("alert ring poisoned");
        match ring.iter_mut().find(|alert| alert.id == id) {
            Some(alert) => {
                alert.acknowledged = true;
                true
            }
            None => false,
        }
    }

    /// Page the ring, newest last. `limit` is clamped by the caller.
    pub fn query(
        &self,
        since: Option<DateTime<Utc>>,
        severity: Option<AlertSeverity>,
        limit: usize,
    ) -> Vec<Alert> {
        let ring = self.ring.lock().expect("alert ring poisoned");
        let mut selected: Vec<Alert> = ring
            .iter()
            .rev()
            .filter(|alert| since.map_or(true, |since| alert.timestamp >= since))
            .filter(|alert| severity.map_or(true, |severity| alert.severity == severity))
            .take(limit)
            .cloned()
            .collect();
        selected.reverse();
        selected
    }

    /// Severity histogram over the ring since a point in time.
    pub fn severity_counts_since(&self, since: DateTime<Utc>) -> Vec<(AlertSeverity, usize)> {
        let ring = self.ring.lock().expect("alert ring poisoned");
        let mut counts = [
            (AlertSeverity::Critical, 0usize),
            (AlertSeverity::Warning, 0),
            (AlertSeverity::Info, 0),
            (AlertSeverity::System, 0),
        ];
        for alert in ring.iter().filter(|alert| alert.timestamp >= since) {
            for entry in counts.iter_mut() {
                if entry.0 == alert.severity {
                    entry.1 += 1;
                }
            }
        }
        counts.to_vec()
    }

    pub fn subscriber_count(&self) -> usize {
        self.hub.subscriber_count()
    }

    pub fn total_dropped(&self) -> u64 {
        self.hub.total_dropped()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::data::AlertKind;

    fn alert(title: &str, severity: AlertSeverity) -> Alert {
        let mut alert = Alert::system(Some(0), severity, "test", title);
        alert.kind = AlertKind::Immediate;
        alert
    }

    // ── StreamHub ────────────────────────────────────────────────────────────

    #[test]
    fn test_fanout_reaches_all_subscribers() {
        let hub = StreamHub::new("test");
        let a = hub.subscribe();
        let b = hub.subscribe();

        hub.publish(&serde_json::json!({"n": 1}));

        assert_eq!(a.drain().len(), 1);
        assert_eq!(b.drain().len(), 1);
        assert_eq!(a.drain().len(), 0);
    }

    #[test]
    fn test_drop_oldest_never_reorders() {
        let hub = StreamHub::with_queue_capacity("test", 3);
        let sub = hub.subscribe();

        for n in 0..5 {
            hub.publish(&serde_json::json!({ "n": n }));
        }

        let items = sub.drain();
        let ns: Vec<i64> = items.iter().map(|v| v["n"].as_i64().unwrap()).collect();
        // Two oldest dropped, order preserved.
        assert_eq!(ns, vec![2, 3, 4]);
        assert_eq!(sub.dropped(), 2);
        assert_eq!(hub.total_dropped(), 2);
    }

    #[test]
    fn test_dropped_subscription_is_pruned() {
        let hub = StreamHub::new("test");
        let sub = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 1);

        drop(sub);
        hub.publish(&serde_json::json!({}));
        assert_eq!(hub.subscriber_count(), 0);
    }

    // ── AlertDispatcher ring ─────────────────────────────────────────────────

    #[test]
    fn test_ring_caps_at_capacity() {
        let dispatcher = AlertDispatcher::new(3);
        for n in 0..5 {
            dispatcher.publish(alert(&format!("a{n}"), AlertSeverity::Info));
        }
        let all = dispatcher.query(None, None, 100);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].message, "a2");
        assert_eq!(all[2].message, "a4");
    }

    #[test]
    fn test_late_subscriber_replays_recent_alerts() {
        let dispatcher = AlertDispatcher::new(200);
        for n in 0..30 {
            dispatcher.publish(alert(&format!("a{n}"), AlertSeverity::Warning));
        }

        let sub = dispatcher.subscribe();
        let replayed = sub.drain();
        assert_eq!(replayed.len(), REPLAY_COUNT);
        assert_eq!(replayed[0]["message"], "a10");
        assert_eq!(replayed[19]["message"], "a29");

        // Then the live stream.
        dispatcher.publish(alert("a30", AlertSeverity::Warning));
        let live = sub.drain();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0]["message"], "a30");
    }

    #[test]
    fn test_acknowledge_is_idempotent() {
        let dispatcher = AlertDispatcher::new(10);
        let a = alert("ack me", AlertSeverity::Critical);
        let id = a.id;
        dispatcher.publish(a);

        assert!(dispatcher.acknowledge(id));
        assert!(dispatcher.acknowledge(id));
        assert!(!dispatcher.acknowledge(Uuid::new_v4()));

        let stored = dispatcher.query(None, None, 10);
        assert!(stored[0].acknowledged);
    }

    #[test]
    fn test_query_filters_by_severity_and_limit() {
        let dispatcher = AlertDispatcher::new(50);
        for n in 0..6 {
            let severity = if n % 2 == 0 {
                AlertSeverity::Critical
            } else {
                AlertSeverity::Info
            };
            dispatcher.publish(alert(&format!("a{n}"), severity));
        }

        let critical = dispatcher.query(None, Some(AlertSeverity::Critical), 10);
        assert_eq!(critical.len(), 3);
        assert!(critical.iter().all(|a| a.severity == AlertSeverity::Critical));

        let limited = dispatcher.query(None, None, 2);
        assert_eq!(limited.len(), 2);
        // Newest are kept when limiting.
        assert_eq!(limited[1].message, "a5");
    }
}
