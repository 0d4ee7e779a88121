// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

#![allow(unexpected_cfgs)]

//! # Events Controller - Controller Manager for Argo Events Resources
//!
//! This crate hosts the controllers for the `EventBus`, `EventSource` and `Sensor`
//! custom resources (`argoproj.io/v1alpha1`) in a single process.
//!
//! ## Overview
//!
//! One shared runtime feeds three independent controllers:
//!
//! - A shared object cache with one watch per kind, scoped cluster-wide or to a
//!   single namespace
//! - Per-controller work queues fed by change predicates and owner-reference routing
//! - Optional Lease-based leader election gating every controller
//! - Liveness/readiness probes and a Prometheus metrics endpoint
//!
//! ## Modules
//!
//! - [`bootstrap`] - Ordered startup, from configuration to a running manager
//! - [`manager`] - Shared runtime: client, cache, scheme, probes, leadership
//! - [`controller`] - Named controllers, watch registration and workers
//! - [`cache`] - Shared informers mirroring watched kinds
//! - [`predicates`] - Update event filters
//! - [`handler`] - Event to work queue key routing
//! - [`workqueue`] - Coalescing work queue with failure backoff
//! - [`leader`] - Lease-based leader election
//! - [`health`] - Named liveness and readiness checks
//! - [`metrics`] - Prometheus metrics
//! - [`config`] - Process options and the controller configuration file
//! - [`crd`] - Custom Resource Definition types
//! - [`reconcilers`] - Default reconcilers
//!
//! ## Example
//!
//! ```rust,no_run
//! use events_controller::bootstrap::{start, Dependencies};
//! use events_controller::config::ControllerOptions;
//!
//! # async fn run() -> Result<(), events_controller::bootstrap::BootstrapError> {
//! let options = ControllerOptions {
//!     leader_election: true,
//!     ..Default::default()
//! };
//! start(&options, &Dependencies::production(&options)).await
//! # }
//! ```

pub mod bootstrap;
pub mod cache;
pub mod config;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod duration;
pub mod env;
pub mod handler;
pub mod health;
pub mod leader;
pub mod manager;
pub mod metrics;
pub mod predicates;
pub mod reconcilers;
pub mod scheme;
pub mod workqueue;
