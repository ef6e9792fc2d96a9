//! Subscriber hub for the one-way event stream.
//!
//! Each subscriber owns a bounded channel; broadcast serializes the update
//! once and performs a non-blocking send per subscriber. A subscriber whose
//! buffer is full is skipped for that broadcast (slow-consumer policy: the
//! broadcaster never blocks, fast subscribers never wait). Subscribe and
//! unsubscribe take the write lock, so a broadcast never observes a
//! half-added entry and no send can race a removal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tracing::warn;

use crate::diff::Update;

/// Hard cap on concurrent subscribers; beyond it, subscription is refused.
pub const MAX_SUBSCRIBERS: usize = 1000;

/// Per-subscriber buffered messages before broadcasts skip the subscriber.
const CHANNEL_BUFFER: usize = 16;

pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<Arc<str>>,
}

#[derive(Default)]
pub struct EventHub {
    subscribers: RwLock<HashMap<u64, mpsc::Sender<Arc<str>>>>,
    next_id: AtomicU64,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber, or `None` once the client cap is reached.
    pub fn subscribe(&self) -> Option<Subscription> {
        let mut subscribers = self.subscribers.write().expect("subscriber lock poisoned");
        if subscribers.len() >= MAX_SUBSCRIBERS {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER);
        subscribers.insert(id, tx);
        gauge!("meshmap_event_subscribers").set(subscribers.len() as f64);
        Some(Subscription { id, rx })
    }

    /// Remove a subscriber and close its channel.
    pub fn unsubscribe(&self, id: u64) {
        let mut subscribers = self.subscribers.write().expect("subscriber lock poisoned");
        subscribers.remove(&id);
        gauge!("meshmap_event_subscribers").set(subscribers.len() as f64);
    }

    /// Serialize `update` once and fan it out to every subscriber.
    pub fn broadcast(&self, update: &Update) {
        let data: Arc<str> = match serde_json::to_string(update) {
            Ok(text) => text.into(),
            Err(err) => {
                warn!(?err, "failed to serialize event update");
                return;
            }
        };

        let subscribers = self.subscribers.read().expect("subscriber lock poisoned");
        let mut skipped = 0usize;
        for tx in subscribers.values() {
            if tx.try_send(data.clone()).is_err() {
                skipped += 1;
            }
        }
        counter!("meshmap_broadcasts_total").increment(1);
        if skipped > 0 {
            counter!("meshmap_broadcast_skips_total").increment(skipped as u64);
        }
    }

    pub fn client_count(&self) -> usize {
        self.subscribers.read().expect("subscriber lock poisoned").len()
    }

    /// Drop every subscriber channel so open streams terminate. Shutdown only.
    pub fn close_all(&self) {
        let mut subscribers = self.subscribers.write().expect("subscriber lock poisoned");
        subscribers.clear();
        gauge!("meshmap_event_subscribers").set(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::{NodeChange, UpdateKind};
    use crate::snapshot::Stats;

    fn update_with_marker(marker: &str) -> Update {
        Update {
            kind: UpdateKind::Diff,
            stats: Stats::default(),
            changed: vec![NodeChange {
                node_id: marker.to_string(),
                hostname: String::new(),
                is_online: true,
                clients: 0,
                load_avg: 0.0,
                mem_usage: 0.0,
            }],
            gone: Vec::new(),
            new: Vec::new(),
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_all_subscribers_in_order() {
        let hub = EventHub::new();
        let mut first = hub.subscribe().expect("subscribe");
        let mut second = hub.subscribe().expect("subscribe");
        assert_eq!(hub.client_count(), 2);

        hub.broadcast(&update_with_marker("m1"));
        hub.broadcast(&update_with_marker("m2"));

        for sub in [&mut first, &mut second] {
            let a = sub.rx.recv().await.expect("first message");
            let b = sub.rx.recv().await.expect("second message");
            assert!(a.contains("m1"));
            assert!(b.contains("m2"));
        }
    }

    #[tokio::test]
    async fn slow_subscriber_is_skipped_then_catches_up() {
        let hub = EventHub::new();
        let mut fast_a = hub.subscribe().expect("subscribe");
        let mut slow = hub.subscribe().expect("subscribe");
        let mut fast_c = hub.subscribe().expect("subscribe");

        // Fill the slow subscriber's buffer without draining it.
        for i in 0..CHANNEL_BUFFER {
            hub.broadcast(&update_with_marker(&format!("fill-{i}")));
            fast_a.rx.recv().await.expect("drain a");
            fast_c.rx.recv().await.expect("drain c");
        }

        // Buffer is full: this broadcast reaches A and C but skips the slow one.
        hub.broadcast(&update_with_marker("overflow"));
        assert!(fast_a.rx.recv().await.expect("a gets it").contains("overflow"));
        assert!(fast_c.rx.recv().await.expect("c gets it").contains("overflow"));

        // Drain the backlog: the skipped message never arrives.
        for i in 0..CHANNEL_BUFFER {
            let msg = slow.rx.recv().await.expect("backlog");
            assert!(msg.contains(&format!("fill-{i}")));
        }

        // Next broadcast is delivered to all three again.
        hub.broadcast(&update_with_marker("resumed"));
        assert!(fast_a.rx.recv().await.expect("a").contains("resumed"));
        assert!(slow.rx.recv().await.expect("slow").contains("resumed"));
        assert!(fast_c.rx.recv().await.expect("c").contains("resumed"));
    }

    #[tokio::test]
    async fn unsubscribe_closes_the_channel() {
        let hub = EventHub::new();
        let mut sub = hub.subscribe().expect("subscribe");
        hub.unsubscribe(sub.id);
        assert_eq!(hub.client_count(), 0);
        assert!(sub.rx.recv().await.is_none());
    }

    #[test]
    fn subscription_cap_is_enforced() {
        let hub = EventHub::new();
        let subs: Vec<_> = (0..MAX_SUBSCRIBERS)
            .map(|_| hub.subscribe().expect("under cap"))
            .collect();
        assert!(hub.subscribe().is_none());
        drop(subs);

        // Capacity does not free until unsubscribe runs.
        assert_eq!(hub.client_count(), MAX_SUBSCRIBERS);
    }
}
