// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Named reconciliation controllers.
//!
//! A [`Controller`] binds one [`Reconciler`] to a work queue and to a set of watches.
//! Each watch listens on the shared cache for one kind, filters events through a
//! [`Predicate`] and turns the survivors into queue keys with an [`EventHandler`].
//!
//! # Pipeline
//!
//! ```text
//! Informer<K> ──► predicate ──► handler ──► WorkQueue ──► worker ──► Reconciler::reconcile
//!                  (updates)    (self/owner)                 │
//!                                                            └─► Requeue / backoff
//! ```
//!
//! Workers only process keys while this replica leads; keys keep accumulating in the
//! queue on standby and are drained once leadership is acquired.
//!
//! # Example
//!
//! ```rust,no_run
//! use events_controller::controller::{Controller, WatchRegistration};
//! use events_controller::crd::EventSource;
//! use k8s_openapi::api::apps::v1::Deployment;
//! # fn wire(
//! #     manager: &mut events_controller::manager::ManagerContext,
//! #     reconciler: std::sync::Arc<dyn events_controller::controller::Reconciler>,
//! # ) -> anyhow::Result<()> {
//! let mut controller = Controller::new(
//!     "eventsource-controller",
//!     reconciler,
//!     tracing::info_span!("controller", controller = "eventsource-controller"),
//! );
//! controller.watch::<EventSource>(manager, WatchRegistration::primary())?;
//! controller.watch::<Deployment>(manager, WatchRegistration::owned_by::<EventSource>())?;
//! manager.add_controller(controller)?;
//! # Ok(())
//! # }
//! ```

use crate::cache::{ObjectEvent, ObjectKey, WatchedResource};
use crate::constants::DEFAULT_MAX_CONCURRENT_RECONCILES;
use crate::handler::EventHandler;
use crate::leader::LeaderState;
use crate::manager::ManagerContext;
use crate::metrics;
use crate::predicates::Predicate;
use crate::scheme::KindDescriptor;
use crate::workqueue::WorkQueue;
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument, Span};

/// What to do with a key after a successful reconcile.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Requeue {
    /// Nothing more to do until the next watch event
    #[default]
    Done,
    /// Reconcile again after the given delay
    After(Duration),
    /// Reconcile again soon, subject to the key's failure backoff
    Immediately,
}

/// Errors returned by a [`Reconciler`]. The key is retried with backoff.
#[derive(Error, Debug)]
pub enum ReconcileError {
    /// A Kubernetes API request failed
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// The object cannot be reconciled in its current state
    #[error("{0}")]
    Invalid(String),

    /// Any other failure
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Per-kind reconciliation entry point.
///
/// Reconcilers receive only the key: the current object state is read from the shared
/// cache or the API. A key whose object no longer exists must be treated as deleted.
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Drive the object named by `key` towards its desired state.
    async fn reconcile(&self, key: &ObjectKey) -> Result<Requeue, ReconcileError>;
}

/// Routing and filtering for one watch, before it is bound to a kind.
#[derive(Clone, Debug)]
pub struct WatchRegistration {
    /// Maps events to keys
    pub handler: EventHandler,
    /// Filters update events
    pub predicate: Predicate,
}

impl WatchRegistration {
    /// Watch on the controller's own kind: reconcile on spec or label changes.
    #[must_use]
    pub fn primary() -> Self {
        Self {
            handler: EventHandler::EnqueueSelf,
            predicate: Predicate::generation_changed().or(Predicate::label_changed()),
        }
    }

    /// Watch on a subordinate kind: reconcile the controller owner of kind `O` when
    /// the subordinate's spec changes.
    #[must_use]
    pub fn owned_by<O: WatchedResource>() -> Self {
        Self {
            handler: EventHandler::enqueue_owner::<O>(),
            predicate: Predicate::generation_changed(),
        }
    }

    /// Replace the predicate.
    #[must_use]
    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = predicate;
        self
    }
}

/// A watch bound to a controller.
#[derive(Clone, Debug)]
pub struct RegisteredWatch {
    /// Watched kind
    pub kind: KindDescriptor,
    /// Maps events to keys
    pub handler: EventHandler,
    /// Filters update events
    pub predicate: Predicate,
}

/// Errors returned by [`Controller::watch`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WatchError {
    /// The watched kind is missing from the manager's scheme
    #[error("controller {controller}: cannot watch {kind}: kind is not registered")]
    KindNotRegistered {
        /// Controller name
        controller: String,
        /// The unregistered kind
        kind: KindDescriptor,
    },

    /// The owner kind of a secondary watch is missing from the manager's scheme
    #[error("controller {controller}: cannot route {kind} events to owner {owner}: owner kind is not registered")]
    OwnerKindNotRegistered {
        /// Controller name
        controller: String,
        /// The watched kind
        kind: KindDescriptor,
        /// The unregistered owner kind
        owner: KindDescriptor,
    },
}

/// A named controller: one reconciler, one queue, many watches.
pub struct Controller {
    name: String,
    reconciler: Arc<dyn Reconciler>,
    span: Span,
    queue: Arc<WorkQueue>,
    watches: Vec<RegisteredWatch>,
    max_concurrent_reconciles: usize,
}

impl Controller {
    /// A controller without watches.
    ///
    /// `span` is entered around every reconcile and every log line of this controller.
    pub fn new(name: impl Into<String>, reconciler: Arc<dyn Reconciler>, span: Span) -> Self {
        let name = name.into();
        Self {
            queue: Arc::new(WorkQueue::new(name.clone())),
            name,
            reconciler,
            span,
            watches: Vec::new(),
            max_concurrent_reconciles: DEFAULT_MAX_CONCURRENT_RECONCILES,
        }
    }

    /// Set the number of concurrent workers (at least one).
    #[must_use]
    pub fn with_max_concurrent_reconciles(mut self, workers: usize) -> Self {
        self.max_concurrent_reconciles = workers.max(1);
        self
    }

    /// Controller name, unique within a manager.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registered watches, in registration order.
    pub fn watches(&self) -> &[RegisteredWatch] {
        &self.watches
    }

    /// The controller's work queue.
    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Number of concurrent workers.
    pub fn max_concurrent_reconciles(&self) -> usize {
        self.max_concurrent_reconciles
    }

    /// Watch kind `K` on the manager's shared cache.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError`] if `K`, or the owner kind of an owner-routed watch, is not
    /// registered in the manager's scheme. Nothing is wired in that case.
    pub fn watch<K: WatchedResource>(
        &mut self,
        manager: &ManagerContext,
        registration: WatchRegistration,
    ) -> Result<(), WatchError> {
        let kind = KindDescriptor::of::<K>();
        if !manager.scheme().recognizes(&kind) {
            return Err(WatchError::KindNotRegistered {
                controller: self.name.clone(),
                kind,
            });
        }
        if let EventHandler::EnqueueOwner(owner) = &registration.handler {
            if !manager.scheme().recognizes(owner) {
                return Err(WatchError::OwnerKindNotRegistered {
                    controller: self.name.clone(),
                    kind,
                    owner: owner.clone(),
                });
            }
        }

        let queue = Arc::clone(&self.queue);
        let controller = self.name.clone();
        let kind_name = kind.kind.clone();
        let handler = registration.handler.clone();
        let predicate = registration.predicate.clone();
        manager
            .cache()
            .informer::<K>()
            .add_listener(move |event: &ObjectEvent<K>| {
                if !predicate.evaluate(event) {
                    metrics::record_watch_event(&controller, &kind_name, "filtered");
                    return;
                }
                let keys = handler.keys_for(event);
                if keys.is_empty() {
                    metrics::record_watch_event(&controller, &kind_name, "unrouted");
                    return;
                }
                for key in keys {
                    queue.add(key);
                    metrics::record_watch_event(&controller, &kind_name, "enqueued");
                }
            });

        self.span.in_scope(|| {
            debug!(
                kind = %kind,
                handler = ?registration.handler,
                predicate = registration.predicate.name(),
                "Registered watch"
            );
        });
        self.watches.push(RegisteredWatch {
            kind,
            handler: registration.handler,
            predicate: registration.predicate,
        });
        Ok(())
    }

    /// Run the workers until `token` is cancelled. Workers only take keys while
    /// `leadership` reports [`LeaderState::Leading`].
    pub async fn run(self, leadership: watch::Receiver<LeaderState>, token: CancellationToken) {
        let span = self.span.clone();
        async move {
            info!(
                workers = self.max_concurrent_reconciles,
                watches = self.watches.len(),
                "Starting controller"
            );

            let worker = Worker {
                name: self.name.clone(),
                reconciler: Arc::clone(&self.reconciler),
                queue: Arc::clone(&self.queue),
            };
            let mut workers = Vec::with_capacity(self.max_concurrent_reconciles);
            for _ in 0..self.max_concurrent_reconciles {
                let worker = worker.clone();
                let leadership = leadership.clone();
                let token = token.clone();
                workers.push(tokio::spawn(
                    async move { worker.run(leadership, token).await }.in_current_span(),
                ));
            }

            token.cancelled().await;
            self.queue.shut_down();
            for handle in workers {
                if let Err(e) = handle.await {
                    error!(error = %e, "Controller worker task failed");
                }
            }
            info!("Controller stopped");
        }
        .instrument(span)
        .await;
    }
}

#[derive(Clone)]
struct Worker {
    name: String,
    reconciler: Arc<dyn Reconciler>,
    queue: Arc<WorkQueue>,
}

impl Worker {
    async fn run(&self, mut leadership: watch::Receiver<LeaderState>, token: CancellationToken) {
        loop {
            if !leadership.borrow().is_leading() {
                debug!("Waiting for leadership");
                tokio::select! {
                    () = token.cancelled() => return,
                    changed = leadership.wait_for(|state| state.is_leading()) => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }

            let key = tokio::select! {
                () = token.cancelled() => return,
                key = self.queue.get() => match key {
                    Some(key) => key,
                    None => return,
                },
            };

            // Leadership may have been lost while waiting for a key
            if !leadership.borrow().is_leading() {
                self.queue.done(&key);
                self.queue.add(key);
                continue;
            }

            self.process(key).await;
        }
    }

    async fn process(&self, key: ObjectKey) {
        let start = Instant::now();
        let outcome = AssertUnwindSafe(self.reconciler.reconcile(&key))
            .catch_unwind()
            .await;
        let elapsed = start.elapsed();

        match outcome {
            Ok(Ok(Requeue::Done)) => {
                debug!(key = %key, elapsed_ms = elapsed.as_millis(), "Reconciled");
                metrics::record_reconciliation_success(&self.name, elapsed);
                self.queue.forget(&key);
            }
            Ok(Ok(Requeue::After(delay))) => {
                debug!(key = %key, delay = ?delay, "Reconciled, requeue scheduled");
                metrics::record_reconciliation_success(&self.name, elapsed);
                metrics::record_reconciliation_requeue(&self.name, "scheduled");
                self.queue.forget(&key);
                self.queue.add_after(key.clone(), delay);
            }
            Ok(Ok(Requeue::Immediately)) => {
                debug!(key = %key, "Reconciled, requeue requested");
                metrics::record_reconciliation_success(&self.name, elapsed);
                metrics::record_reconciliation_requeue(&self.name, "requested");
                self.queue.add_rate_limited(key.clone());
            }
            Ok(Err(e)) => {
                warn!(
                    key = %key,
                    error = %e,
                    retries = self.queue.num_requeues(&key),
                    "Reconcile failed, retrying with backoff"
                );
                metrics::record_reconciliation_error(&self.name, elapsed, "reconcile_error");
                metrics::record_reconciliation_requeue(&self.name, "error");
                self.queue.add_rate_limited(key.clone());
            }
            Err(panic) => {
                error!(
                    key = %key,
                    panic = %panic_message(panic.as_ref()),
                    "Reconciler panicked, retrying with backoff"
                );
                metrics::record_reconciliation_error(&self.name, elapsed, "panic");
                metrics::record_reconciliation_requeue(&self.name, "panic");
                self.queue.add_rate_limited(key.clone());
            }
        }

        self.queue.done(&key);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

#[cfg(test)]
#[path = "controller_tests.rs"]
mod controller_tests;
