// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Custom Resource Definitions (CRDs) managed by the controllers.
//!
//! # Resource Types
//!
//! - [`EventBus`] - The message bus that event sources publish to and sensors consume from
//! - [`EventSource`] - Consumes events from external systems and publishes them to a bus
//! - [`Sensor`] - Subscribes to events on a bus and fires triggers when dependencies resolve
//!
//! The specs are intentionally open: the controllers in this crate only route events
//! and never interpret spec contents, so the bus/source/sensor sections are kept as
//! free-form JSON and validated by the reconcilers that consume them.
//!
//! # Example
//!
//! ```rust,no_run
//! use events_controller::crd::{EventBus, EventBusSpec};
//!
//! let bus = EventBus::new(
//!     "default",
//!     EventBusSpec {
//!         jetstream: Some(serde_json::json!({ "version": "latest" })),
//!         ..Default::default()
//!     },
//! );
//! ```

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Condition represents an observation of a resource's current state.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition. Common types include: Deployed, Ready.
    pub r#type: String,

    /// Status of the condition: True, False, or Unknown.
    pub status: String,

    /// Brief CamelCase reason for the condition's last transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message indicating details about the transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Last time the condition transitioned from one status to another (RFC3339 format).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

/// Status shared by all three resource kinds.
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// Generation of the spec most recently processed by a controller
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// `EventBus` spec. Exactly one backend section is expected to be set.
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, Default, JsonSchema)]
#[kube(
    group = "argoproj.io",
    version = "v1alpha1",
    kind = "EventBus",
    plural = "eventbus",
    shortname = "eb",
    namespaced,
    doc = "EventBus is the transport layer between event sources and sensors."
)]
#[kube(status = "ResourceStatus")]
#[serde(rename_all = "camelCase")]
pub struct EventBusSpec {
    /// NATS streaming backed bus
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nats: Option<serde_json::Value>,

    /// JetStream backed bus
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jetstream: Option<serde_json::Value>,

    /// Externally managed Kafka bus
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kafka: Option<serde_json::Value>,
}

/// `EventSource` spec.
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, Default, JsonSchema)]
#[kube(
    group = "argoproj.io",
    version = "v1alpha1",
    kind = "EventSource",
    plural = "eventsources",
    shortname = "es",
    namespaced,
    doc = "EventSource consumes events from external systems and publishes them to an EventBus."
)]
#[kube(status = "ResourceStatus")]
#[serde(rename_all = "camelCase")]
#[schemars(extend("x-kubernetes-preserve-unknown-fields" = true))]
pub struct EventSourceSpec {
    /// Name of the `EventBus` to publish to (defaults to `default`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_bus_name: Option<String>,

    /// Number of replicas of the event source deployment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Event source definitions keyed by source type (e.g. `webhook`, `kafka`).
    /// They sit directly under `spec`; the schema preserves them as unknown fields.
    #[serde(flatten)]
    #[schemars(skip)]
    pub sources: BTreeMap<String, serde_json::Value>,
}

/// `Sensor` spec.
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, Default, JsonSchema)]
#[kube(
    group = "argoproj.io",
    version = "v1alpha1",
    kind = "Sensor",
    plural = "sensors",
    shortname = "sn",
    namespaced,
    doc = "Sensor listens to events on an EventBus and executes triggers when its dependencies resolve."
)]
#[kube(status = "ResourceStatus")]
#[serde(rename_all = "camelCase")]
pub struct SensorSpec {
    /// Name of the `EventBus` to subscribe to (defaults to `default`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_bus_name: Option<String>,

    /// Number of replicas of the sensor deployment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Event dependencies
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<serde_json::Value>,

    /// Triggers executed when dependencies resolve
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggers: Vec<serde_json::Value>,
}

/// Access to the status section common to all managed kinds.
pub trait HasStatus {
    /// The current status, if any.
    fn resource_status(&self) -> Option<&ResourceStatus>;
}

impl HasStatus for EventBus {
    fn resource_status(&self) -> Option<&ResourceStatus> {
        self.status.as_ref()
    }
}

impl HasStatus for EventSource {
    fn resource_status(&self) -> Option<&ResourceStatus> {
        self.status.as_ref()
    }
}

impl HasStatus for Sensor {
    fn resource_status(&self) -> Option<&ResourceStatus> {
        self.status.as_ref()
    }
}

#[cfg(test)]
#[path = "crd_tests.rs"]
mod crd_tests;
