// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Controller manager bootstrap.
//!
//! [`prepare`] builds a ready-to-run [`ManagerContext`] in a fixed order. The first
//! failing step aborts bootstrap and no later step runs:
//!
//! 1. Load the controller configuration
//! 2. Validate it
//! 3. Resolve the workload image from `ARGO_EVENTS_IMAGE`
//! 4. Assemble the manager options, including leader election timings
//! 5. Connect to the cluster
//! 6. Build the manager and register the `liveness` and `readiness` probes
//! 7. Register `EventBus`, `EventSource` and `Sensor` in the scheme
//! 8. Build the three controllers and their watches
//!
//! [`start`] runs the prepared manager until SIGINT or SIGTERM.
//!
//! | Controller | Primary | Owned kinds |
//! |------------|---------|-------------|
//! | `eventbus-controller` | `EventBus` | `ConfigMap`, `StatefulSet`, `Service` |
//! | `eventsource-controller` | `EventSource` | `Deployment`, `Service` |
//! | `sensor-controller` | `Sensor` | `Deployment` |

use crate::cache::CacheScope;
use crate::config::{ConfigError, ConfigLoader, ControllerOptions, FileConfigLoader};
use crate::constants::{
    DEFAULT_LEASE_DURATION_SECS, DEFAULT_LEASE_RENEW_DEADLINE_SECS,
    DEFAULT_LEASE_RETRY_PERIOD_SECS, EVENT_BUS_CONTROLLER, EVENT_SOURCE_CONTROLLER,
    HOSTNAME_ENV_VAR, IMAGE_ENV_VAR, LEADER_ELECTION_ID, LEASE_DURATION_ENV_VAR,
    LIVENESS_CHECK, POD_NAMESPACE_ENV_VAR, READINESS_CHECK, RENEW_DEADLINE_ENV_VAR,
    RETRY_PERIOD_ENV_VAR, SENSOR_CONTROLLER, SERVER_BIND_ADDRESS,
};
use crate::controller::{Controller, Reconciler, WatchError, WatchRegistration};
use crate::crd::{EventBus, EventSource, Sensor};
use crate::duration::resolve_duration;
use crate::env::{Environment, ProcessEnv};
use crate::health::{ping, HealthError};
use crate::leader::LeaderElectionConfig;
use crate::manager::{ManagerContext, ManagerError, ManagerOptions};
use crate::reconcilers::{DefaultReconcilerFactory, ReconcilerContext};
use crate::scheme::SchemeError;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::Client;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn};

/// Errors that abort bootstrap.
#[derive(Error, Debug)]
pub enum BootstrapError {
    /// The configuration could not be loaded
    #[error("failed to load controller configuration: {0}")]
    LoadConfig(#[source] ConfigError),

    /// The configuration loaded but is invalid
    #[error("controller configuration is invalid: {0}")]
    InvalidConfig(#[source] ConfigError),

    /// The workload image variable is not set
    #[error("required environment variable {var} is not set")]
    MissingImage {
        /// The variable name
        var: &'static str,
    },

    /// No kube client could be built
    #[error("failed to connect to the cluster: {0}")]
    Connect(#[source] kube::Error),

    /// A probe could not be registered
    #[error(transparent)]
    Health(#[from] HealthError),

    /// A kind could not be registered
    #[error(transparent)]
    Scheme(#[from] SchemeError),

    /// A controller watch could not be set up
    #[error(transparent)]
    Watch(#[from] WatchError),

    /// The manager rejected a controller or failed while running
    #[error(transparent)]
    Manager(#[from] ManagerError),
}

/// Builds the kube client.
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    /// Connect using whatever credentials the implementation resolves.
    async fn connect(&self) -> Result<Client, kube::Error>;
}

/// In-cluster config, falling back to the local kubeconfig.
#[derive(Clone, Copy, Debug, Default)]
pub struct KubeConnector;

#[async_trait]
impl ClusterConnector for KubeConnector {
    async fn connect(&self) -> Result<Client, kube::Error> {
        Client::try_default().await
    }
}

/// Builds one reconciler per managed kind.
pub trait ReconcilerFactory: Send + Sync {
    /// Reconciler for `EventBus` keys.
    fn event_bus(&self, context: &ReconcilerContext) -> Arc<dyn Reconciler>;

    /// Reconciler for `EventSource` keys.
    fn event_source(&self, context: &ReconcilerContext) -> Arc<dyn Reconciler>;

    /// Reconciler for `Sensor` keys.
    fn sensor(&self, context: &ReconcilerContext) -> Arc<dyn Reconciler>;
}

/// Collaborators used by bootstrap.
#[derive(Clone)]
pub struct Dependencies {
    /// Source of the controller configuration
    pub config_loader: Arc<dyn ConfigLoader>,
    /// Environment variables
    pub env: Arc<dyn Environment>,
    /// Builds the kube client
    pub connector: Arc<dyn ClusterConnector>,
    /// Builds the reconcilers
    pub reconcilers: Arc<dyn ReconcilerFactory>,
}

impl Dependencies {
    /// Production collaborators: the config file named in `options`, the process
    /// environment, the default kube connector and the default reconcilers.
    #[must_use]
    pub fn production(options: &ControllerOptions) -> Self {
        Self {
            config_loader: Arc::new(FileConfigLoader::new(options.config_path.clone())),
            env: Arc::new(ProcessEnv),
            connector: Arc::new(KubeConnector),
            reconcilers: Arc::new(DefaultReconcilerFactory),
        }
    }
}

/// Translate process options and environment into [`ManagerOptions`].
///
/// A port of `0` disables the endpoint. The lease namespace comes from
/// `POD_NAMESPACE`, then the managed namespace; it is left empty when both are unset
/// and [`prepare`] fills it from the client's default namespace.
#[must_use]
pub fn build_manager_options(
    options: &ControllerOptions,
    env: &dyn Environment,
) -> ManagerOptions {
    let cache_scope = if options.namespaced {
        CacheScope::Namespace(options.managed_namespace.clone())
    } else {
        CacheScope::Cluster
    };

    let leader_election = options.leader_election.then(|| LeaderElectionConfig {
        id: LEADER_ELECTION_ID.to_string(),
        namespace: non_empty(env.lookup(POD_NAMESPACE_ENV_VAR))
            .unwrap_or_else(|| options.managed_namespace.clone()),
        identity: leader_identity(env),
        lease_duration: resolve_duration(
            env,
            LEASE_DURATION_ENV_VAR,
            Duration::from_secs(DEFAULT_LEASE_DURATION_SECS),
        ),
        renew_deadline: resolve_duration(
            env,
            RENEW_DEADLINE_ENV_VAR,
            Duration::from_secs(DEFAULT_LEASE_RENEW_DEADLINE_SECS),
        ),
        retry_period: resolve_duration(
            env,
            RETRY_PERIOD_ENV_VAR,
            Duration::from_secs(DEFAULT_LEASE_RETRY_PERIOD_SECS),
        ),
    });

    ManagerOptions {
        metrics_bind_address: bind_address(options.metrics_port),
        health_bind_address: bind_address(options.health_port),
        cache_scope,
        leader_election,
        ..Default::default()
    }
}

fn bind_address(port: u16) -> Option<SocketAddr> {
    (port != 0).then(|| SocketAddr::from((SERVER_BIND_ADDRESS, port)))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// The lease holder identity: `HOSTNAME`, then the system hostname.
fn leader_identity(env: &dyn Environment) -> String {
    if let Some(identity) = non_empty(env.lookup(HOSTNAME_ENV_VAR)) {
        return identity;
    }
    match hostname::get() {
        Ok(name) if !name.is_empty() => name.to_string_lossy().into_owned(),
        Ok(_) => format!("{LEADER_ELECTION_ID}-{}", std::process::id()),
        Err(e) => {
            warn!("Failed to read system hostname, using process id: {e}");
            format!("{LEADER_ELECTION_ID}-{}", std::process::id())
        }
    }
}

/// Build the manager, its probes and its controllers without starting anything.
///
/// # Errors
///
/// Returns the [`BootstrapError`] of the first failing step.
pub async fn prepare(
    options: &ControllerOptions,
    deps: &Dependencies,
) -> Result<ManagerContext, BootstrapError> {
    let config = deps
        .config_loader
        .load()
        .await
        .map_err(BootstrapError::LoadConfig)?;
    config.validate().map_err(BootstrapError::InvalidConfig)?;
    debug!("Controller configuration loaded and validated");

    let image = deps
        .env
        .lookup(IMAGE_ENV_VAR)
        .ok_or(BootstrapError::MissingImage { var: IMAGE_ENV_VAR })?;

    let mut manager_options = build_manager_options(options, deps.env.as_ref());

    let client = deps
        .connector
        .connect()
        .await
        .map_err(BootstrapError::Connect)?;
    debug!("Kubernetes client initialized");

    if let Some(election) = manager_options.leader_election.as_mut() {
        if election.namespace.is_empty() {
            election.namespace = client.default_namespace().to_string();
        }
    }

    let mut manager =
        ManagerContext::new(manager_options, client.clone(), info_span!("manager"));
    manager.health().add_readyz_check(READINESS_CHECK, ping())?;
    manager.health().add_healthz_check(LIVENESS_CHECK, ping())?;

    let scheme = manager.scheme_mut();
    scheme.register_resource::<EventBus>()?;
    scheme.register_resource::<EventSource>()?;
    scheme.register_resource::<Sensor>()?;

    let context = ReconcilerContext {
        client,
        cache: manager.cache().clone(),
        config: Arc::new(config),
        image,
    };

    let event_bus = event_bus_controller(&manager, deps.reconcilers.event_bus(&context))?;
    manager.add_controller(event_bus)?;
    let event_source =
        event_source_controller(&manager, deps.reconcilers.event_source(&context))?;
    manager.add_controller(event_source)?;
    let sensor = sensor_controller(&manager, deps.reconcilers.sensor(&context))?;
    manager.add_controller(sensor)?;

    Ok(manager)
}

fn controller_span(name: &'static str) -> tracing::Span {
    info_span!("controller", controller = name)
}

fn event_bus_controller(
    manager: &ManagerContext,
    reconciler: Arc<dyn Reconciler>,
) -> Result<Controller, WatchError> {
    let mut controller = Controller::new(
        EVENT_BUS_CONTROLLER,
        reconciler,
        controller_span(EVENT_BUS_CONTROLLER),
    );
    controller.watch::<EventBus>(manager, WatchRegistration::primary())?;
    controller.watch::<ConfigMap>(manager, WatchRegistration::owned_by::<EventBus>())?;
    controller.watch::<StatefulSet>(manager, WatchRegistration::owned_by::<EventBus>())?;
    controller.watch::<Service>(manager, WatchRegistration::owned_by::<EventBus>())?;
    Ok(controller)
}

fn event_source_controller(
    manager: &ManagerContext,
    reconciler: Arc<dyn Reconciler>,
) -> Result<Controller, WatchError> {
    let mut controller = Controller::new(
        EVENT_SOURCE_CONTROLLER,
        reconciler,
        controller_span(EVENT_SOURCE_CONTROLLER),
    );
    controller.watch::<EventSource>(manager, WatchRegistration::primary())?;
    controller.watch::<Deployment>(manager, WatchRegistration::owned_by::<EventSource>())?;
    controller.watch::<Service>(manager, WatchRegistration::owned_by::<EventSource>())?;
    Ok(controller)
}

fn sensor_controller(
    manager: &ManagerContext,
    reconciler: Arc<dyn Reconciler>,
) -> Result<Controller, WatchError> {
    let mut controller =
        Controller::new(SENSOR_CONTROLLER, reconciler, controller_span(SENSOR_CONTROLLER));
    controller.watch::<Sensor>(manager, WatchRegistration::primary())?;
    controller.watch::<Deployment>(manager, WatchRegistration::owned_by::<Sensor>())?;
    Ok(controller)
}

/// Prepare the manager and run it until SIGINT or SIGTERM.
///
/// # Errors
///
/// Returns the bootstrap error, or the manager error that stopped the run.
pub async fn start(
    options: &ControllerOptions,
    deps: &Dependencies,
) -> Result<(), BootstrapError> {
    let manager = prepare(options, deps).await?;

    let token = CancellationToken::new();
    tokio::spawn(shutdown_signal(token.clone()));

    info!(
        version = env!("CARGO_PKG_VERSION"),
        namespaced = options.namespaced,
        leader_election = options.leader_election,
        "Starting controller manager"
    );
    manager.run(token).await?;
    info!("Controller manager stopped");
    Ok(())
}

/// Cancel `token` on SIGINT or SIGTERM.
pub async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for SIGINT: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
        () = token.cancelled() => return,
    }
    token.cancel();
}

#[cfg(test)]
#[path = "bootstrap_tests.rs"]
mod bootstrap_tests;
