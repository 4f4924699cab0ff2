use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

const BASE_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(1000);

/// Items that can be deduplicated while queued.
pub trait Keyed {
    fn key(&self) -> String;
}

/// A typed rate-limiting work queue.
///
/// Guarantees: producers never block; while an item for a key is queued, a
/// newer item for the same key replaces its payload in place (most recent
/// event wins); pops are FIFO; failed items come back through `requeue` with
/// per-key exponential backoff; after `shut_down` nothing is accepted and
/// `pop` returns `None`.
pub struct RateLimitingQueue<T: Keyed> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
}

struct QueueState<T> {
    order: VecDeque<String>,
    items: HashMap<String, T>,
    failures: HashMap<String, u32>,
    shut_down: bool,
}

impl<T: Keyed + Send + 'static> RateLimitingQueue<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(RateLimitingQueue {
            state: Mutex::new(QueueState {
                order: VecDeque::new(),
                items: HashMap::new(),
                failures: HashMap::new(),
                shut_down: false,
            }),
            notify: Notify::new(),
        })
    }

    /// Enqueues an item. Non-blocking; safe from any task.
    pub fn add(&self, item: T) {
        let key = item.key();
        {
            let mut state = self.state.lock().expect("queue state poisoned");
            if state.shut_down {
                return;
            }
            if state.items.insert(key.clone(), item).is_none() {
                state.order.push_back(key);
            }
        }
        self.notify.notify_one();
    }

    /// Waits for the next item. Returns `None` once the queue is shut down.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().expect("queue state poisoned");
                if state.shut_down {
                    return None;
                }
                if let Some(key) = state.order.pop_front() {
                    return state.items.remove(&key);
                }
            }
            notified.await;
        }
    }

    /// Clears the failure history for a key after a successful run.
    pub fn forget(&self, key: &str) {
        self.state
            .lock()
            .expect("queue state poisoned")
            .failures
            .remove(key);
    }

    /// Schedules a failed item to come back after its per-key backoff delay.
    pub fn requeue(self: Arc<Self>, item: T) {
        let key = item.key();
        let delay = {
            let mut state = self.state.lock().expect("queue state poisoned");
            if state.shut_down {
                return;
            }
            let failures = state.failures.entry(key).or_insert(0);
            *failures += 1;
            backoff_delay(*failures)
        };

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            self.add(item);
        });
    }

    /// Stops accepting items and wakes every pending `pop` with `None`.
    pub fn shut_down(&self) {
        self.state.lock().expect("queue state poisoned").shut_down = true;
        self.notify.notify_waiters();
    }

    #[cfg(test)]
    fn failure_count(&self, key: &str) -> u32 {
        self.state
            .lock()
            .expect("queue state poisoned")
            .failures
            .get(key)
            .copied()
            .unwrap_or(0)
    }
}

/// 5ms doubling per failure, capped at 1000s.
fn backoff_delay(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(28);
    let delay = BASE_DELAY * 2u32.pow(exponent);
    delay.min(MAX_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        key: String,
        payload: u32,
    }

    impl Item {
        fn new(key: &str, payload: u32) -> Self {
            Item {
                key: key.to_string(),
                payload,
            }
        }
    }

    impl Keyed for Item {
        fn key(&self) -> String {
            self.key.clone()
        }
    }

    #[tokio::test]
    async fn pops_are_fifo() {
        let queue = RateLimitingQueue::new();
        queue.add(Item::new("a", 1));
        queue.add(Item::new("b", 2));
        queue.add(Item::new("c", 3));

        assert_eq!(queue.pop().await.unwrap().key, "a");
        assert_eq!(queue.pop().await.unwrap().key, "b");
        assert_eq!(queue.pop().await.unwrap().key, "c");
    }

    #[tokio::test]
    async fn same_key_dedups_and_newest_payload_wins() {
        let queue = RateLimitingQueue::new();
        queue.add(Item::new("a", 1));
        queue.add(Item::new("b", 2));
        queue.add(Item::new("a", 3));

        let first = queue.pop().await.unwrap();
        assert_eq!(first.key, "a");
        assert_eq!(first.payload, 3, "the collapsed item keeps the newest payload");
        assert_eq!(queue.pop().await.unwrap().key, "b");
    }

    #[tokio::test]
    async fn pop_waits_for_producers() {
        let queue = RateLimitingQueue::new();
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::task::yield_now().await;
        queue.add(Item::new("late", 1));
        assert_eq!(consumer.await.unwrap().unwrap().key, "late");
    }

    #[tokio::test(start_paused = true)]
    async fn requeue_applies_backoff() {
        let queue = RateLimitingQueue::new();
        Arc::clone(&queue).requeue(Item::new("a", 1));
        assert_eq!(queue.failure_count("a"), 1);

        // Not yet due.
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(queue.state.lock().unwrap().order.is_empty());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(queue.pop().await.unwrap().key, "a");

        queue.forget("a");
        assert_eq!(queue.failure_count("a"), 0);
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(backoff_delay(1), Duration::from_millis(5));
        assert_eq!(backoff_delay(2), Duration::from_millis(10));
        assert_eq!(backoff_delay(5), Duration::from_millis(80));
        assert_eq!(backoff_delay(40), MAX_DELAY);
    }

    #[tokio::test]
    async fn shutdown_stops_everything() {
        let queue = RateLimitingQueue::new();
        queue.add(Item::new("a", 1));
        queue.shut_down();
        queue.add(Item::new("b", 2));
        assert!(queue.pop().await.is_none());
    }
}
