// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Global constants for the events controller.
//!
//! This module contains all numeric and string constants used throughout the codebase.
//! Constants are organized by category for easy maintenance.

// ============================================================================
// API Constants
// ============================================================================

/// API group for all managed CRDs
pub const API_GROUP: &str = "argoproj.io";

/// API version for all managed CRDs
pub const API_VERSION: &str = "v1alpha1";

/// Fully qualified API version (group/version)
pub const API_GROUP_VERSION: &str = "argoproj.io/v1alpha1";

/// Kind name for the `EventBus` resource
pub const KIND_EVENT_BUS: &str = "EventBus";

/// Kind name for the `EventSource` resource
pub const KIND_EVENT_SOURCE: &str = "EventSource";

/// Kind name for the `Sensor` resource
pub const KIND_SENSOR: &str = "Sensor";

// ============================================================================
// Controller Names
// ============================================================================

/// Name of the controller reconciling `EventBus` resources
pub const EVENT_BUS_CONTROLLER: &str = "eventbus-controller";

/// Name of the controller reconciling `EventSource` resources
pub const EVENT_SOURCE_CONTROLLER: &str = "eventsource-controller";

/// Name of the controller reconciling `Sensor` resources
pub const SENSOR_CONTROLLER: &str = "sensor-controller";

// ============================================================================
// Environment Variables
// ============================================================================

/// Image used by the workloads the reconcilers create. Required.
pub const IMAGE_ENV_VAR: &str = "ARGO_EVENTS_IMAGE";

/// Override for the leader election lease duration
pub const LEASE_DURATION_ENV_VAR: &str = "LEADER_ELECTION_LEASE_DURATION";

/// Override for the leader election renew deadline
pub const RENEW_DEADLINE_ENV_VAR: &str = "LEADER_ELECTION_RENEW_DEADLINE";

/// Override for the leader election retry period
pub const RETRY_PERIOD_ENV_VAR: &str = "LEADER_ELECTION_RETRY_PERIOD";

/// Namespace the controller pod runs in (downward API)
pub const POD_NAMESPACE_ENV_VAR: &str = "POD_NAMESPACE";

/// Pod name, used as the leader election identity
pub const HOSTNAME_ENV_VAR: &str = "HOSTNAME";

// ============================================================================
// Leader Election Constants
// ============================================================================

/// Name of the Lease object shared by all controller replicas
pub const LEADER_ELECTION_ID: &str = "argo-events-controller";

/// Default leader election lease duration (15 seconds)
pub const DEFAULT_LEASE_DURATION_SECS: u64 = 15;

/// Default leader election renew deadline (10 seconds)
pub const DEFAULT_LEASE_RENEW_DEADLINE_SECS: u64 = 10;

/// Default leader election retry period (5 seconds)
pub const DEFAULT_LEASE_RETRY_PERIOD_SECS: u64 = 5;

// ============================================================================
// Controller Error Handling Constants
// ============================================================================

/// Base delay for per-key failure backoff (5 milliseconds)
pub const FAILURE_BACKOFF_BASE_MILLIS: u64 = 5;

/// Maximum delay for per-key failure backoff (1000 seconds)
pub const FAILURE_BACKOFF_MAX_SECS: u64 = 1000;

/// How long the manager waits for every informer to list before failing (2 minutes)
pub const DEFAULT_CACHE_SYNC_TIMEOUT_SECS: u64 = 120;

/// Default number of concurrent reconciles per controller
pub const DEFAULT_MAX_CONCURRENT_RECONCILES: usize = 1;

// ============================================================================
// Runtime Constants
// ============================================================================

/// Number of worker threads for Tokio runtime
pub const TOKIO_WORKER_THREADS: usize = 4;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default location of the controller configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/argo-events/controller-config.yaml";

/// Default namespace managed when running namespaced
pub const DEFAULT_MANAGED_NAMESPACE: &str = "argo-events";

// ============================================================================
// Health and Metrics Server Constants
// ============================================================================

/// Default port for the Prometheus metrics HTTP server
pub const DEFAULT_METRICS_PORT: u16 = 7777;

/// Default port for the liveness/readiness HTTP server
pub const DEFAULT_HEALTH_PORT: u16 = 8081;

/// Path for Prometheus metrics endpoint
pub const METRICS_SERVER_PATH: &str = "/metrics";

/// Bind address for the metrics and health HTTP servers (all interfaces)
pub const SERVER_BIND_ADDRESS: [u8; 4] = [0, 0, 0, 0];

/// Path for the aggregated liveness checks
pub const HEALTHZ_PATH: &str = "/healthz";

/// Path for the aggregated readiness checks
pub const READYZ_PATH: &str = "/readyz";

/// Name of the liveness check registered at bootstrap
pub const LIVENESS_CHECK: &str = "liveness";

/// Name of the readiness check registered at bootstrap
pub const READINESS_CHECK: &str = "readiness";
