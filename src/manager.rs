// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Shared controller runtime.
//!
//! One [`ManagerContext`] per process owns everything the controllers share: the
//! kube client, the object cache, the scheme, the health probes and, when
//! configured, leader election. Controllers are added during bootstrap and started
//! together by [`ManagerContext::run`].
//!
//! # Run sequence
//!
//! 1. Bind the health and metrics listeners (a bind failure aborts the run)
//! 2. Start one watcher feed per informed kind
//! 3. Start leader election, or lead unconditionally when it is disabled
//! 4. Once the cache has synced, start every controller's workers, gated by leadership;
//!    the run fails if the cache has not synced within `cache_sync_timeout`
//! 5. On cancellation, let in-flight reconciles finish, then release the lease and
//!    stop the feeds and servers

use crate::cache::{CacheScope, Informer, ObjectCache, WatchedResource};
use crate::constants::DEFAULT_CACHE_SYNC_TIMEOUT_SECS;
use crate::controller::Controller;
use crate::health::HealthProbes;
use crate::leader::{KubeLeaseLock, LeaderElectionConfig, LeaderElector, LeaderState, LeaseLock};
use crate::metrics;
use crate::scheme::{KindDescriptor, Scheme};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use kube::Client;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument, Span};

/// Interval between cache sync checks before the controllers start.
const CACHE_SYNC_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Options the manager is built from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManagerOptions {
    /// Where to serve `/metrics`; `None` disables the endpoint
    pub metrics_bind_address: Option<SocketAddr>,
    /// Where to serve the health probes; `None` disables the endpoint
    pub health_bind_address: Option<SocketAddr>,
    /// Which objects the cache mirrors
    pub cache_scope: CacheScope,
    /// Lease settings; `None` runs the controllers unconditionally
    pub leader_election: Option<LeaderElectionConfig>,
    /// How long to wait for the informers to list before `run` fails
    pub cache_sync_timeout: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            metrics_bind_address: None,
            health_bind_address: None,
            cache_scope: CacheScope::default(),
            leader_election: None,
            cache_sync_timeout: Duration::from_secs(DEFAULT_CACHE_SYNC_TIMEOUT_SECS),
        }
    }
}

/// Errors returned by the manager.
#[derive(Error, Debug)]
pub enum ManagerError {
    /// Controller names must be unique
    #[error("a controller named {name:?} is already registered")]
    DuplicateController {
        /// The duplicated name
        name: String,
    },

    /// The requested kind is missing from the scheme
    #[error("kind {kind} is not registered")]
    KindNotRegistered {
        /// The unregistered kind
        kind: KindDescriptor,
    },

    /// An endpoint could not bind its address
    #[error("failed to bind {endpoint} endpoint on {address}: {source}")]
    Bind {
        /// `health` or `metrics`
        endpoint: &'static str,
        /// The requested address
        address: SocketAddr,
        /// The bind error
        #[source]
        source: std::io::Error,
    },

    /// Some informer did not complete its initial list in time
    #[error("timed out after {timeout:?} waiting for the cache to sync (unsynced kinds: {kinds})")]
    CacheSyncTimeout {
        /// The configured timeout
        timeout: Duration,
        /// Kinds that never listed, comma separated
        kinds: String,
    },

    /// An endpoint stopped serving before shutdown
    #[error("{endpoint} endpoint stopped unexpectedly: {source}")]
    Server {
        /// `health` or `metrics`
        endpoint: &'static str,
        /// The serve error
        #[source]
        source: std::io::Error,
    },
}

/// The shared runtime the controllers are registered with.
pub struct ManagerContext {
    options: ManagerOptions,
    client: Client,
    cache: ObjectCache,
    scheme: Scheme,
    health: HealthProbes,
    controllers: Vec<Controller>,
    lease_lock: Option<Arc<dyn LeaseLock>>,
    span: Span,
}

impl std::fmt::Debug for ManagerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerContext")
            .field("options", &self.options)
            .field("scheme", &self.scheme)
            .field(
                "controllers",
                &self.controllers.iter().map(Controller::name).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl ManagerContext {
    /// Build a manager. Nothing runs until [`ManagerContext::run`].
    ///
    /// Leader election timings violating `retry_period < renew_deadline <
    /// lease_duration` are logged as warnings and accepted.
    pub fn new(options: ManagerOptions, client: Client, span: Span) -> Self {
        if let Some(election) = &options.leader_election {
            span.in_scope(|| {
                for warning in election.timing_warnings() {
                    warn!(lease = %election.id, "Leader election timing: {warning}");
                }
            });
        }

        Self {
            cache: ObjectCache::new(options.cache_scope.clone()),
            scheme: Scheme::with_builtin_kinds(),
            health: HealthProbes::new(),
            controllers: Vec::new(),
            lease_lock: None,
            options,
            client,
            span,
        }
    }

    /// Use a custom lease lock instead of the Kubernetes Lease one.
    #[must_use]
    pub fn with_lease_lock(mut self, lock: Arc<dyn LeaseLock>) -> Self {
        self.lease_lock = Some(lock);
        self
    }

    /// Options the manager was built from.
    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    /// Shared kube client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Shared object cache.
    pub fn cache(&self) -> &ObjectCache {
        &self.cache
    }

    /// Registered kinds.
    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    /// Registered kinds, for registration during bootstrap.
    pub fn scheme_mut(&mut self) -> &mut Scheme {
        &mut self.scheme
    }

    /// Health probe registry.
    pub fn health(&self) -> &HealthProbes {
        &self.health
    }

    /// The manager's tracing span.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Registered controllers, in registration order.
    pub fn controllers(&self) -> &[Controller] {
        &self.controllers
    }

    /// Cache informer for a registered kind.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::KindNotRegistered`] if `K` is not in the scheme.
    pub fn informer<K: WatchedResource>(&self) -> Result<Arc<Informer<K>>, ManagerError> {
        let kind = KindDescriptor::of::<K>();
        if !self.scheme.recognizes(&kind) {
            return Err(ManagerError::KindNotRegistered { kind });
        }
        Ok(self.cache.informer::<K>())
    }

    /// Hand a fully wired controller to the manager.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::DuplicateController`] if the name is taken.
    pub fn add_controller(&mut self, controller: Controller) -> Result<(), ManagerError> {
        if self
            .controllers
            .iter()
            .any(|existing| existing.name() == controller.name())
        {
            return Err(ManagerError::DuplicateController {
                name: controller.name().to_string(),
            });
        }
        self.span.in_scope(|| {
            info!(
                controller = controller.name(),
                watches = controller.watches().len(),
                "Registered controller"
            );
        });
        self.controllers.push(controller);
        Ok(())
    }

    /// Run everything until `token` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Bind`] if an endpoint cannot bind,
    /// [`ManagerError::CacheSyncTimeout`] if the informers do not list in time, and
    /// [`ManagerError::Server`] if an endpoint stops serving before cancellation.
    pub async fn run(self, token: CancellationToken) -> Result<(), ManagerError> {
        let span = self.span.clone();
        self.run_inner(token).instrument(span).await
    }

    async fn run_inner(self, token: CancellationToken) -> Result<(), ManagerError> {
        let ManagerContext {
            options,
            client,
            cache,
            health,
            controllers,
            lease_lock,
            ..
        } = self;

        // Bind first: nothing is started if an endpoint is unusable
        let health_listener = bind("health", options.health_bind_address).await?;
        let metrics_listener = bind("metrics", options.metrics_bind_address).await?;

        let shutdown = token.child_token();
        let mut servers: FuturesUnordered<JoinHandle<(&'static str, std::io::Result<()>)>> =
            FuturesUnordered::new();
        if let Some(listener) = health_listener {
            let health = health.clone();
            let server_token = shutdown.clone();
            servers.push(tokio::spawn(
                async move { ("health", health.serve(listener, server_token).await) }
                    .in_current_span(),
            ));
        }
        if let Some(listener) = metrics_listener {
            let server_token = shutdown.clone();
            servers.push(tokio::spawn(
                async move { ("metrics", metrics::serve(listener, server_token).await) }
                    .in_current_span(),
            ));
        }

        info!(
            scope = ?options.cache_scope,
            kinds = ?cache.informed_kinds().iter().map(ToString::to_string).collect::<Vec<_>>(),
            "Starting informers"
        );
        let informers = cache.start(&client, &shutdown);

        // Leadership: elected, or unconditional
        let (leader_tx, leadership) = watch::channel(LeaderState::Leading);
        let elector = options.leader_election.clone().map(|config| {
            let lock = lease_lock.unwrap_or_else(|| {
                Arc::new(KubeLeaseLock::new(
                    client.clone(),
                    config.namespace.clone(),
                    config.id.clone(),
                ))
            });
            Arc::new(LeaderElector::new(config, lock))
        });
        // The lease outlives the controllers: it is released only once every
        // in-flight reconcile has finished
        let election_token = CancellationToken::new();
        let (leadership, elector_task) = match &elector {
            Some(elector) => {
                let receiver = elector.subscribe();
                let elector = Arc::clone(elector);
                let election_token = election_token.clone();
                let task = tokio::spawn(
                    async move { elector.run(election_token).await }.in_current_span(),
                );
                (receiver, Some(task))
            }
            None => {
                info!("Leader election disabled, running controllers unconditionally");
                (leadership, None)
            }
        };

        let sync_timeout = options.cache_sync_timeout;
        let mut controller_task = {
            let cache = cache.clone();
            let token = shutdown.clone();
            tokio::spawn(
                async move {
                    match tokio::time::timeout(sync_timeout, wait_for_cache_sync(&cache, &token))
                        .await
                    {
                        Ok(true) => {}
                        Ok(false) => return Ok(()),
                        Err(_) => {
                            let kinds = cache
                                .unsynced_kinds()
                                .iter()
                                .map(ToString::to_string)
                                .collect::<Vec<_>>()
                                .join(", ");
                            error!(timeout = ?sync_timeout, kinds = %kinds, "Cache sync timed out");
                            return Err(ManagerError::CacheSyncTimeout {
                                timeout: sync_timeout,
                                kinds,
                            });
                        }
                    }
                    info!(controllers = controllers.len(), "Cache synced, starting controllers");
                    let handles: Vec<JoinHandle<()>> = controllers
                        .into_iter()
                        .map(|controller| {
                            tokio::spawn(
                                controller
                                    .run(leadership.clone(), token.clone())
                                    .in_current_span(),
                            )
                        })
                        .collect();
                    for handle in handles {
                        if let Err(e) = handle.await {
                            error!(error = %e, "Controller task failed");
                        }
                    }
                    // Only a sync failure ends this task before shutdown
                    token.cancelled().await;
                    Ok(())
                }
                .in_current_span(),
            )
        };

        info!("Manager started");
        let mut result = Ok(());
        let mut controllers_stopped = false;
        tokio::select! {
            () = shutdown.cancelled() => {
                info!("Shutdown requested, stopping manager");
            }
            Some(finished) = servers.next() => {
                match finished {
                    Ok((endpoint, Err(source))) => {
                        error!(endpoint, error = %source, "Endpoint failed, stopping manager");
                        result = Err(ManagerError::Server { endpoint, source });
                    }
                    Ok((endpoint, Ok(()))) => {
                        error!(endpoint, "Endpoint stopped, stopping manager");
                        result = Err(ManagerError::Server {
                            endpoint,
                            source: std::io::Error::other("server exited"),
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Endpoint task failed, stopping manager");
                        result = Err(ManagerError::Server {
                            endpoint: "endpoint",
                            source: std::io::Error::other(e.to_string()),
                        });
                    }
                }
                shutdown.cancel();
            }
            joined = &mut controller_task => {
                controllers_stopped = true;
                match joined {
                    Ok(Err(e)) => result = Err(e),
                    Ok(Ok(())) => {}
                    Err(e) => error!(error = %e, "Controller supervisor task failed"),
                }
                shutdown.cancel();
            }
        }

        // Controllers drain first, then the lease is released
        if !controllers_stopped {
            match controller_task.await {
                Ok(Err(e)) => error!(error = %e, "Controllers stopped with an error"),
                Ok(Ok(())) => {}
                Err(e) => error!(error = %e, "Controller supervisor task failed"),
            }
        }
        election_token.cancel();
        if let Some(task) = elector_task {
            if let Err(e) = task.await {
                error!(error = %e, "Leader election task failed");
            }
        }
        for handle in informers {
            if let Err(e) = handle.await {
                error!(error = %e, "Informer task failed");
            }
        }
        while let Some(finished) = servers.next().await {
            if let Ok((endpoint, Err(e))) = finished {
                warn!(endpoint, error = %e, "Endpoint failed during shutdown");
            }
        }
        drop(leader_tx);

        info!("Manager stopped");
        result
    }
}

async fn bind(
    endpoint: &'static str,
    address: Option<SocketAddr>,
) -> Result<Option<TcpListener>, ManagerError> {
    let Some(address) = address else {
        debug!(endpoint, "Endpoint disabled");
        return Ok(None);
    };
    TcpListener::bind(address)
        .await
        .map(Some)
        .map_err(|source| ManagerError::Bind {
            endpoint,
            address,
            source,
        })
}

/// Wait until every informer has listed once. Returns `false` if cancelled first.
async fn wait_for_cache_sync(cache: &ObjectCache, token: &CancellationToken) -> bool {
    loop {
        if cache.has_synced() {
            return true;
        }
        tokio::select! {
            () = token.cancelled() => return false,
            () = tokio::time::sleep(CACHE_SYNC_POLL_INTERVAL) => {}
        }
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod manager_tests;
