//! Leaky-bucket rate limiter.
//!
//! One instance bounds outbound sends per shard, another paces identify
//! admissions per concurrency slot. A dedicated refill task ticks at the
//! configured interval and releases queued waiters front-first; the task
//! stops on its own once the bucket is dropped.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::trace;

struct BucketState {
    tokens: u32,
    waiters: VecDeque<oneshot::Sender<()>>,
}

/// Token bucket refilled by `refill_amount` every `refill_interval`.
///
/// `acquire` never fails and never times out; bounding the wait is the
/// caller's job (`tokio::time::timeout` around the acquire).
pub struct LeakyBucket {
    max: u32,
    refill_amount: u32,
    refill_interval: Duration,
    state: Mutex<BucketState>,
}

impl LeakyBucket {
    /// Create a bucket starting full. Must be called inside a tokio runtime
    /// because the refill task is spawned immediately.
    pub fn new(max: u32, refill_amount: u32, refill_interval: Duration) -> Arc<Self> {
        let bucket = Arc::new(Self {
            max,
            refill_amount,
            refill_interval,
            state: Mutex::new(BucketState {
                tokens: max,
                waiters: VecDeque::new(),
            }),
        });
        spawn_refill_task(&bucket);
        bucket
    }

    /// Wait for one token. High-priority callers enter the front of the wait
    /// queue; normal callers append.
    pub async fn acquire(&self, high_priority: bool) {
        let pending = {
            let mut state = self.state.lock();
            if state.waiters.is_empty() && state.tokens > 0 {
                state.tokens -= 1;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                if high_priority {
                    state.waiters.push_front(tx);
                } else {
                    state.waiters.push_back(tx);
                }
                Some(rx)
            }
        };
        if let Some(rx) = pending {
            // the refill task owns the other end; an error only means the
            // bucket was dropped mid-wait
            let _ = rx.await;
        }
    }

    /// Move every queued waiter from `old` to the front of this bucket's
    /// queue, preserving their order. Used when a shard's send bucket is
    /// replaced on session reset.
    pub fn migrate_from(&self, old: &LeakyBucket) {
        let moved = {
            let mut old_state = old.state.lock();
            std::mem::take(&mut old_state.waiters)
        };
        if moved.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        for tx in moved.into_iter().rev() {
            state.waiters.push_front(tx);
        }
        // tokens already available here serve the migrated line immediately
        // rather than holding it until the next refill tick
        while state.tokens > 0 {
            let Some(waiter) = state.waiters.pop_front() else {
                break;
            };
            if waiter.send(()).is_ok() {
                state.tokens -= 1;
            }
        }
    }

    /// Tokens currently available.
    pub fn available(&self) -> u32 {
        self.state.lock().tokens
    }

    /// Waiters currently queued.
    pub fn queued(&self) -> usize {
        self.state.lock().waiters.len()
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    fn refill(&self) {
        let mut state = self.state.lock();
        state.tokens = (state.tokens.saturating_add(self.refill_amount)).min(self.max);
        while state.tokens > 0 {
            let Some(waiter) = state.waiters.pop_front() else {
                break;
            };
            // a dropped receiver gave up waiting; its token stays available
            if waiter.send(()).is_ok() {
                state.tokens -= 1;
            }
        }
        trace!(tokens = state.tokens, queued = state.waiters.len(), "bucket refill");
    }
}

fn spawn_refill_task(bucket: &Arc<LeakyBucket>) {
    let weak: Weak<LeakyBucket> = Arc::downgrade(bucket);
    let interval = bucket.refill_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick fires immediately; skip it so a full refill cycle
        // always takes one whole interval
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(bucket) = weak.upgrade() else {
                break;
            };
            bucket.refill();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{advance, Instant};

    #[tokio::test(start_paused = true)]
    async fn burst_drains_then_waits_for_a_refill() {
        let interval = Duration::from_millis(500);
        let bucket = LeakyBucket::new(3, 3, interval);

        let start = Instant::now();
        for _ in 0..3 {
            bucket.acquire(false).await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(bucket.available(), 0);

        // the fourth acquire must block until the first refill tick
        bucket.acquire(false).await;
        assert!(start.elapsed() >= interval);
    }

    #[tokio::test(start_paused = true)]
    async fn high_priority_jumps_the_queue() {
        let bucket = LeakyBucket::new(1, 1, Duration::from_millis(100));
        bucket.acquire(false).await;

        let order = Arc::new(Mutex::new(Vec::new()));

        let normal = {
            let bucket = Arc::clone(&bucket);
            let order = Arc::clone(&order);
            tokio::spawn(async move {
                bucket.acquire(false).await;
                order.lock().push("normal");
            })
        };
        tokio::task::yield_now().await;

        let urgent = {
            let bucket = Arc::clone(&bucket);
            let order = Arc::clone(&order);
            tokio::spawn(async move {
                bucket.acquire(true).await;
                order.lock().push("urgent");
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(bucket.queued(), 2);

        normal.await.unwrap();
        urgent.await.unwrap();
        assert_eq!(*order.lock(), vec!["urgent", "normal"]);
    }

    #[tokio::test(start_paused = true)]
    async fn refill_never_exceeds_max() {
        let bucket = LeakyBucket::new(2, 5, Duration::from_millis(50));
        bucket.acquire(false).await;
        advance(Duration::from_millis(200)).await;
        tokio::task::yield_now().await;
        assert!(bucket.available() <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn migrated_waiters_keep_their_place_in_line() {
        let interval = Duration::from_millis(100);
        let old = LeakyBucket::new(1, 1, interval);
        old.acquire(false).await;

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut waiters = Vec::new();
        for i in 0..3 {
            let old = Arc::clone(&old);
            let order = Arc::clone(&order);
            waiters.push(tokio::spawn(async move {
                old.acquire(false).await;
                order.lock().push(i);
            }));
            tokio::task::yield_now().await;
        }
        assert_eq!(old.queued(), 3);

        let fresh = LeakyBucket::new(1, 1, interval);
        fresh.acquire(false).await;
        fresh.migrate_from(&old);
        assert_eq!(old.queued(), 0);
        assert_eq!(fresh.queued(), 3);

        for waiter in waiters {
            waiter.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }
}
