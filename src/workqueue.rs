// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Per-controller work queue of reconcile keys.
//!
//! The queue guarantees:
//!
//! - **Coalescing** - a key added several times before a worker picks it up is
//!   processed once.
//! - **Exclusivity** - a key is never handed to two workers at once. A key re-added
//!   while it is being processed is parked and queued again when the worker calls
//!   [`WorkQueue::done`].
//! - **Failure backoff** - [`WorkQueue::add_rate_limited`] delays a key by an
//!   exponentially growing interval, reset by [`WorkQueue::forget`].
//!
//! # Example
//!
//! ```rust,no_run
//! use events_controller::cache::ObjectKey;
//! use events_controller::workqueue::WorkQueue;
//!
//! # async fn worker(queue: std::sync::Arc<WorkQueue>) {
//! while let Some(key) = queue.get().await {
//!     // reconcile `key` ...
//!     queue.forget(&key);
//!     queue.done(&key);
//! }
//! # }
//! ```

use crate::cache::ObjectKey;
use crate::constants::{FAILURE_BACKOFF_BASE_MILLIS, FAILURE_BACKOFF_MAX_SECS};
use crate::metrics;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::trace;

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FailureBackoff {
    /// Delay after the first failure
    pub base: Duration,
    /// Upper bound for any delay
    pub max: Duration,
}

impl Default for FailureBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(FAILURE_BACKOFF_BASE_MILLIS),
            max: Duration::from_secs(FAILURE_BACKOFF_MAX_SECS),
        }
    }
}

impl FailureBackoff {
    /// Delay for a key that has already failed `failures` times.
    #[must_use]
    pub fn delay(&self, failures: u32) -> Duration {
        // 2^31 * base overflows long before the cap matters
        let factor = 2u32.saturating_pow(failures.min(31));
        self.base
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<ObjectKey>,
    // Keys waiting to be processed, queued or parked behind a running worker
    dirty: HashSet<ObjectKey>,
    processing: HashSet<ObjectKey>,
    failures: HashMap<ObjectKey, u32>,
    shutting_down: bool,
}

/// Deduplicating, rate-limited queue of reconcile keys.
pub struct WorkQueue {
    name: String,
    backoff: FailureBackoff,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    /// An empty queue with the default failure backoff.
    ///
    /// `name` labels the queue in logs and metrics, usually the controller name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_backoff(name, FailureBackoff::default())
    }

    /// An empty queue with a custom failure backoff.
    #[must_use]
    pub fn with_backoff(name: impl Into<String>, backoff: FailureBackoff) -> Self {
        Self {
            name: name.into(),
            backoff,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    /// Queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a key. No-op if it is already waiting or the queue is shutting down.
    pub fn add(&self, key: ObjectKey) {
        let depth = {
            let mut state = self.state.lock();
            if state.shutting_down || state.dirty.contains(&key) {
                return;
            }
            state.dirty.insert(key.clone());
            if state.processing.contains(&key) {
                trace!(queue = %self.name, key = %key, "Key is being processed, deferring");
                return;
            }
            state.queue.push_back(key);
            state.queue.len()
        };
        metrics::record_queue_depth(&self.name, depth);
        self.notify.notify_one();
    }

    /// Add a key once `delay` has elapsed.
    pub fn add_after(self: &Arc<Self>, key: ObjectKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        if self.is_shutting_down() {
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Add a key after its failure backoff, and count one more failure for it.
    pub fn add_rate_limited(self: &Arc<Self>, key: ObjectKey) {
        let delay = {
            let mut state = self.state.lock();
            let failures = state.failures.entry(key.clone()).or_insert(0);
            let delay = self.backoff.delay(*failures);
            *failures = failures.saturating_add(1);
            delay
        };
        trace!(queue = %self.name, key = %key, delay_ms = delay.as_millis(), "Rate-limited requeue");
        self.add_after(key, delay);
    }

    /// Reset the failure count of a key.
    pub fn forget(&self, key: &ObjectKey) {
        self.state.lock().failures.remove(key);
    }

    /// Number of failures recorded for a key since it was last forgotten.
    #[must_use]
    pub fn num_requeues(&self, key: &ObjectKey) -> u32 {
        self.state.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    ///
    /// Every key returned must be passed back to [`WorkQueue::done`].
    pub async fn get(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking, so a concurrent shutdown cannot be missed
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let depth = state.queue.len();
                    drop(state);
                    metrics::record_queue_depth(&self.name, depth);
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Mark a key as no longer being processed, queueing it again if it was re-added
    /// in the meantime.
    pub fn done(&self, key: &ObjectKey) {
        let requeued = {
            let mut state = self.state.lock();
            state.processing.remove(key);
            if state.dirty.contains(key) && !state.shutting_down {
                state.queue.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Stop handing out keys and wake every waiting worker.
    pub fn shut_down(&self) {
        self.state.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    /// Whether [`WorkQueue::shut_down`] was called.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    /// Number of keys ready to be handed out.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Whether no key is ready to be handed out.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[path = "workqueue_tests.rs"]
mod workqueue_tests;
