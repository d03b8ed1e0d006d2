//! Rate-limited work queue with per-key coalescing.
//!
//! Semantics:
//! - a key added while queued is coalesced into the queued entry;
//! - a key added while its reconciliation is in flight is delivered again
//!   after the current reconciliation completes (at-most-one in-flight per
//!   key — the only mutual exclusion between reconciliations of one object);
//! - failed keys are re-added through a per-key exponential backoff that
//!   doubles from a base delay up to a cap and resets on `forget`;
//! - `shut_down` drains the queue: remaining items are handed out, then
//!   `get` resolves to `None` and workers exit.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

/// Per-key exponential backoff: `base * 2^failures`, capped.
#[derive(Clone, Copy, Debug)]
pub struct RateLimiter {
    base: Duration,
    cap: Duration,
}

impl RateLimiter {
    /// Create a limiter with the given base and cap delays.
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Delay for a key that has failed `failures` times before.
    pub fn delay(&self, failures: u32) -> Duration {
        let exp = failures.min(62);
        let factor = 1u64.checked_shl(exp).unwrap_or(u64::MAX);
        self.base
            .checked_mul(factor.min(u32::MAX as u64) as u32)
            .map(|d| d.min(self.cap))
            .unwrap_or(self.cap)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(300))
    }
}

#[derive(Default)]
struct State {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
    shut_down: bool,
}

/// Work queue keyed by object name with rate-limited retries.
pub struct WorkQueue {
    limiter: RateLimiter,
    state: Mutex<State>,
    notify: Notify,
}

impl WorkQueue {
    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A panicked worker must not wedge the whole queue.
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Create a queue with the given retry rate limiter.
    pub fn new(limiter: RateLimiter) -> Arc<Self> {
        Arc::new(Self {
            limiter,
            state: Mutex::new(State::default()),
            notify: Notify::new(),
        })
    }

    /// Enqueue a key for reconciliation.
    pub fn add(&self, key: &str) {
        {
            let mut state = self.lock();
            if state.shut_down || state.dirty.contains(key) {
                return;
            }
            state.dirty.insert(key.to_string());
            if state.processing.contains(key) {
                // Delivered again once the in-flight reconciliation is done.
                return;
            }
            state.queue.push_back(key.to_string());
        }
        self.notify.notify_one();
    }

    /// Enqueue a key after a fixed delay.
    pub fn add_after(self: &Arc<Self>, key: &str, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Enqueue a key after its next backoff delay, incrementing the failure
    /// count.
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) {
        let delay = {
            let mut state = self.lock();
            let failures = state.failures.entry(key.to_string()).or_insert(0);
            *failures += 1;
            self.limiter.delay(*failures - 1)
        };
        self.add_after(key, delay);
    }

    /// Reset the failure count for a key after a successful reconciliation.
    pub fn forget(&self, key: &str) {
        self.lock().failures.remove(key);
    }

    /// Current failure count for a key.
    pub fn failures(&self, key: &str) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Wait for the next key. Resolves to `None` once the queue has been shut
    /// down and drained.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    if !state.queue.is_empty() {
                        // Chain the wakeup so sibling workers see the rest.
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                if state.shut_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark a key's reconciliation as finished. If the key was re-added while
    /// in flight it is queued again.
    pub fn done(&self, key: &str) {
        let requeued = {
            let mut state = self.lock();
            state.processing.remove(key);
            if state.dirty.contains(key) {
                state.queue.push_back(key.to_string());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Stop accepting new keys and wake all workers to drain and exit.
    pub fn shut_down(&self) {
        self.lock().shut_down = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Number of queued (not in-flight) keys.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Whether no keys are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
