use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::models::Tick;

/// Fan-out backpressure settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BroadcasterConfig {
    pub queue_capacity: usize,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64, // Doubles on each retry
    pub max_consecutive_failures: u32,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            max_retries: 3,
            retry_base_delay_ms: 10,
            max_consecutive_failures: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Delivered,
    Dropped,
    Closed,
}

struct Subscriber {
    tx: mpsc::Sender<Tick>,
    failures: u32,
}

/// Outcome of one broadcast
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
    pub evicted: Vec<String>,
}

/// Delivers each tick to every named subscriber through its own bounded queue
///
/// A full queue is retried with exponential backoff and then the tick is
/// dropped for that subscriber only. Deliveries run concurrently, so one slow
/// subscriber never delays another. Consecutive drops past the threshold, or a
/// closed receiver, evict the subscriber.
pub struct TickBroadcaster {
    config: BroadcasterConfig,
    subscribers: Mutex<HashMap<String, Subscriber>>,
}

impl TickBroadcaster {
    pub fn new(config: BroadcasterConfig) -> Self {
        Self {
            config,
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Register `name` with the default queue capacity
    ///
    /// Re-subscribing an existing name replaces its queue; the old receiver
    /// sees the channel close.
    pub fn subscribe(&self, name: &str) -> mpsc::Receiver<Tick> {
        self.subscribe_with_capacity(name, self.config.queue_capacity)
    }

    pub fn subscribe_with_capacity(&self, name: &str, capacity: usize) -> mpsc::Receiver<Tick> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let replaced = self
            .subscribers()
            .insert(name.to_string(), Subscriber { tx, failures: 0 })
            .is_some();

        if replaced {
            tracing::debug!(subscriber = name, "Replaced existing subscription");
        } else {
            tracing::debug!(subscriber = name, "Subscribed to tick stream");
        }
        rx
    }

    pub fn unsubscribe(&self, name: &str) -> bool {
        let removed = self.subscribers().remove(name).is_some();
        if removed {
            tracing::debug!(subscriber = name, "Unsubscribed from tick stream");
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers().len()
    }

    pub fn has_subscriber(&self, name: &str) -> bool {
        self.subscribers().contains_key(name)
    }

    /// Deliver `tick` to every current subscriber
    pub async fn broadcast(&self, tick: Tick) -> BroadcastReport {
        // Snapshot senders so the lock is never held across an await
        let targets: Vec<(String, mpsc::Sender<Tick>)> = self
            .subscribers()
            .iter()
            .map(|(name, sub)| (name.clone(), sub.tx.clone()))
            .collect();

        if targets.is_empty() {
            return BroadcastReport::default();
        }

        let outcomes = join_all(
            targets
                .iter()
                .map(|(_, tx)| self.deliver(tx, tick)),
        )
        .await;

        let mut report = BroadcastReport::default();
        let mut subscribers = self.subscribers();

        for ((name, tx), outcome) in targets.iter().zip(outcomes) {
            match outcome {
                Delivery::Delivered => report.delivered += 1,
                Delivery::Dropped | Delivery::Closed => report.dropped += 1,
            }

            // Skip if the name was unsubscribed or re-subscribed meanwhile
            let Some(sub) = subscribers.get_mut(name) else {
                continue;
            };
            if !sub.tx.same_channel(tx) {
                continue;
            }

            let evict = match outcome {
                Delivery::Delivered => {
                    sub.failures = 0;
                    false
                }
                Delivery::Dropped => {
                    sub.failures += 1;
                    tracing::debug!(
                        subscriber = %name,
                        failures = sub.failures,
                        "Dropped tick for slow subscriber"
                    );
                    sub.failures >= self.config.max_consecutive_failures
                }
                Delivery::Closed => true,
            };

            if evict {
                subscribers.remove(name);
                let reason = match outcome {
                    Delivery::Closed => "receiver closed",
                    _ => "too many consecutive failures",
                };
                tracing::warn!(subscriber = %name, reason, "Evicted tick subscriber");
                report.evicted.push(name.clone());
            }
        }

        report
    }

    async fn deliver(&self, tx: &mpsc::Sender<Tick>, tick: Tick) -> Delivery {
        let mut attempt = 0;
        loop {
            match tx.try_send(tick) {
                Ok(()) => return Delivery::Delivered,
                Err(TrySendError::Closed(_)) => return Delivery::Closed,
                Err(TrySendError::Full(_)) if attempt < self.config.max_retries => {
                    let delay = self.config.retry_base_delay_ms.saturating_mul(1 << attempt.min(16));
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(TrySendError::Full(_)) => return Delivery::Dropped,
            }
        }
    }

    fn subscribers(&self) -> MutexGuard<'_, HashMap<String, Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn fast_config() -> BroadcasterConfig {
        BroadcasterConfig {
            queue_capacity: 100,
            max_retries: 3,
            retry_base_delay_ms: 1,
            max_consecutive_failures: 10,
        }
    }

    fn tick(i: usize) -> Tick {
        let price = 2650.0 + i as f64 * 0.1;
        Tick::new(price - 0.2, price + 0.2, Utc::now())
    }

    #[tokio::test]
    async fn test_every_subscriber_gets_every_tick_in_order() {
        let broadcaster = TickBroadcaster::new(fast_config());
        let mut a = broadcaster.subscribe("a");
        let mut b = broadcaster.subscribe("b");

        for i in 0..5 {
            let report = broadcaster.broadcast(tick(i)).await;
            assert_eq!(report.delivered, 2);
        }

        for i in 0..5 {
            assert_eq!(a.recv().await.unwrap().mid, tick(i).mid);
            assert_eq!(b.recv().await.unwrap().mid, tick(i).mid);
        }
    }

    #[tokio::test]
    async fn test_full_subscriber_evicted_at_threshold() {
        let broadcaster = TickBroadcaster::new(fast_config());
        let _slow = broadcaster.subscribe_with_capacity("slow", 1);
        let mut fast = broadcaster.subscribe("fast");

        // Fill the slow queue
        broadcaster.broadcast(tick(0)).await;

        for i in 1..10 {
            let report = broadcaster.broadcast(tick(i)).await;
            assert!(report.evicted.is_empty());
        }
        assert!(broadcaster.has_subscriber("slow"));

        // 10th consecutive failure
        let report = broadcaster.broadcast(tick(10)).await;
        assert_eq!(report.evicted, vec!["slow".to_string()]);
        assert!(!broadcaster.has_subscriber("slow"));

        // Fast subscriber saw all 11 ticks
        let mut received = 0;
        while fast.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 11);
    }

    #[tokio::test]
    async fn test_successful_delivery_resets_failures() {
        let broadcaster = TickBroadcaster::new(BroadcasterConfig {
            max_consecutive_failures: 2,
            ..fast_config()
        });
        let mut rx = broadcaster.subscribe_with_capacity("s", 1);

        broadcaster.broadcast(tick(0)).await;
        broadcaster.broadcast(tick(1)).await; // failure 1
        rx.recv().await.unwrap();
        broadcaster.broadcast(tick(2)).await; // delivered, reset
        broadcaster.broadcast(tick(3)).await; // failure 1 again

        assert!(broadcaster.has_subscriber("s"));
    }

    #[tokio::test]
    async fn test_closed_receiver_is_evicted() {
        let broadcaster = TickBroadcaster::new(fast_config());
        let rx = broadcaster.subscribe("gone");
        drop(rx);

        let report = broadcaster.broadcast(tick(0)).await;
        assert_eq!(report.evicted, vec!["gone".to_string()]);
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let broadcaster = TickBroadcaster::new(fast_config());
        let _rx = broadcaster.subscribe("a");

        assert!(broadcaster.unsubscribe("a"));
        assert!(!broadcaster.unsubscribe("a"));
        assert_eq!(broadcaster.broadcast(tick(0)).await, BroadcastReport::default());
    }

    #[tokio::test]
    async fn test_resubscribe_replaces_queue() {
        let broadcaster = TickBroadcaster::new(fast_config());
        let mut old = broadcaster.subscribe("a");
        let mut new = broadcaster.subscribe("a");

        broadcaster.broadcast(tick(0)).await;

        assert!(old.recv().await.is_none());
        assert!(new.recv().await.is_some());
        assert_eq!(broadcaster.subscriber_count(), 1);
    }
}
