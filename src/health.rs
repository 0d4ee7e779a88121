// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Liveness and readiness probes served over HTTP.
//!
//! Checks are registered by name before the server starts. Endpoints:
//!
//! | Path | Meaning |
//! |---|---|
//! | `GET /healthz` | all liveness checks |
//! | `GET /readyz` | all readiness checks |
//! | `GET /healthz/{name}` | one liveness check |
//! | `GET /readyz/{name}` | one readiness check |
//!
//! A passing probe answers `200 ok`; a failing one answers `500` with a per-check
//! report. Adding `?verbose` returns the report on success too. Probes are served on
//! standby replicas as well, independently of leader election.

use crate::constants::{HEALTHZ_PATH, READYZ_PATH};
use axum::extract::{Path, RawQuery, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use parking_lot::RwLock;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Outcome of one health check; the error string explains the failure.
pub type CheckResult = Result<(), String>;

/// A named health check.
pub type Checker = Arc<dyn Fn() -> CheckResult + Send + Sync>;

/// A check that always passes, reporting that the process can serve HTTP.
#[must_use]
pub fn ping() -> Checker {
    Arc::new(|| Ok(()))
}

/// Errors returned when registering checks.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HealthError {
    /// Check names must not be empty
    #[error("{probe} check name must not be empty")]
    EmptyName {
        /// `healthz` or `readyz`
        probe: &'static str,
    },

    /// A check with this name is already registered
    #[error("{probe} check {name:?} is already registered")]
    Duplicate {
        /// `healthz` or `readyz`
        probe: &'static str,
        /// The duplicated name
        name: String,
    },

    /// The probe server is already running
    #[error("cannot add {probe} check {name:?}: the health server has already started")]
    AlreadyStarted {
        /// `healthz` or `readyz`
        probe: &'static str,
        /// The rejected name
        name: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Probe {
    Healthz,
    Readyz,
}

impl Probe {
    fn as_str(self) -> &'static str {
        match self {
            Probe::Healthz => "healthz",
            Probe::Readyz => "readyz",
        }
    }
}

#[derive(Default)]
struct ProbeState {
    healthz: RwLock<Vec<(String, Checker)>>,
    readyz: RwLock<Vec<(String, Checker)>>,
    started: AtomicBool,
}

/// Registry of liveness (`healthz`) and readiness (`readyz`) checks.
///
/// Cloning is cheap; all clones share the same checks.
#[derive(Clone, Default)]
pub struct HealthProbes {
    state: Arc<ProbeState>,
}

impl HealthProbes {
    /// A registry without any check.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a liveness check.
    ///
    /// # Errors
    ///
    /// Returns [`HealthError`] if the name is empty or taken, or the server already started.
    pub fn add_healthz_check(
        &self,
        name: impl Into<String>,
        checker: Checker,
    ) -> Result<(), HealthError> {
        self.add(Probe::Healthz, name.into(), checker)
    }

    /// Register a readiness check.
    ///
    /// # Errors
    ///
    /// Returns [`HealthError`] if the name is empty or taken, or the server already started.
    pub fn add_readyz_check(
        &self,
        name: impl Into<String>,
        checker: Checker,
    ) -> Result<(), HealthError> {
        self.add(Probe::Readyz, name.into(), checker)
    }

    /// Names of the registered liveness checks, in registration order.
    #[must_use]
    pub fn healthz_checks(&self) -> Vec<String> {
        names(&self.state.healthz)
    }

    /// Names of the registered readiness checks, in registration order.
    #[must_use]
    pub fn readyz_checks(&self) -> Vec<String> {
        names(&self.state.readyz)
    }

    /// Whether the probe server has started; checks can no longer be added.
    #[must_use]
    pub fn has_started(&self) -> bool {
        self.state.started.load(Ordering::Acquire)
    }

    fn checks(&self, probe: Probe) -> &RwLock<Vec<(String, Checker)>> {
        match probe {
            Probe::Healthz => &self.state.healthz,
            Probe::Readyz => &self.state.readyz,
        }
    }

    fn add(&self, probe: Probe, name: String, checker: Checker) -> Result<(), HealthError> {
        let kind = probe.as_str();
        if name.is_empty() {
            return Err(HealthError::EmptyName { probe: kind });
        }
        if self.has_started() {
            return Err(HealthError::AlreadyStarted { probe: kind, name });
        }

        let mut checks = self.checks(probe).write();
        if checks.iter().any(|(existing, _)| *existing == name) {
            return Err(HealthError::Duplicate { probe: kind, name });
        }
        debug!(probe = kind, check = %name, "Registered health check");
        checks.push((name, checker));
        Ok(())
    }

    /// Run the checks of `probe` (or only `only`) and render the HTTP answer.
    fn respond(
        &self,
        probe: Probe,
        only: Option<&str>,
        query: Option<&str>,
    ) -> (StatusCode, String) {
        let verbose = query.is_some_and(|query| {
            query
                .split('&')
                .any(|param| param == "verbose" || param.starts_with("verbose="))
        });
        let checks = self.checks(probe).read().clone();
        let selected: Vec<&(String, Checker)> = checks
            .iter()
            .filter(|(name, _)| only.is_none_or(|only| only == name))
            .collect();

        if let Some(only) = only {
            if selected.is_empty() {
                return (
                    StatusCode::NOT_FOUND,
                    format!("no such {} check: {only:?}\n", probe.as_str()),
                );
            }
        }

        let mut report = String::new();
        let mut healthy = true;
        for (name, checker) in selected {
            match checker() {
                Ok(()) => {
                    let _ = writeln!(report, "[+]{name} ok");
                }
                Err(reason) => {
                    healthy = false;
                    let _ = writeln!(report, "[-]{name} failed: {reason}");
                }
            }
        }

        if healthy {
            if verbose {
                let _ = writeln!(report, "{} check passed", probe.as_str());
                (StatusCode::OK, report)
            } else {
                (StatusCode::OK, "ok".to_string())
            }
        } else {
            let _ = writeln!(report, "{} check failed", probe.as_str());
            (StatusCode::INTERNAL_SERVER_ERROR, report)
        }
    }

    /// Router serving the probe endpoints.
    pub fn router(&self) -> Router {
        Router::new()
            .route(HEALTHZ_PATH, get(healthz))
            .route(&format!("{HEALTHZ_PATH}/{{name}}"), get(healthz_named))
            .route(READYZ_PATH, get(readyz))
            .route(&format!("{READYZ_PATH}/{{name}}"), get(readyz_named))
            .with_state(self.clone())
    }

    /// Serve the probes on an already bound listener until `token` is cancelled.
    ///
    /// Freezes the set of checks.
    ///
    /// # Errors
    ///
    /// Returns the I/O error that stopped the server.
    pub async fn serve(&self, listener: TcpListener, token: CancellationToken) -> std::io::Result<()> {
        self.state.started.store(true, Ordering::Release);
        if let Ok(addr) = listener.local_addr() {
            info!(
                address = %addr,
                healthz = ?self.healthz_checks(),
                readyz = ?self.readyz_checks(),
                "Health probe server listening"
            );
        }
        axum::serve(listener, self.router())
            .with_graceful_shutdown(token.cancelled_owned())
            .await
    }
}

fn names(checks: &RwLock<Vec<(String, Checker)>>) -> Vec<String> {
    checks.read().iter().map(|(name, _)| name.clone()).collect()
}

async fn healthz(State(probes): State<HealthProbes>, RawQuery(query): RawQuery) -> (StatusCode, String) {
    probes.respond(Probe::Healthz, None, query.as_deref())
}

async fn healthz_named(
    State(probes): State<HealthProbes>,
    Path(name): Path<String>,
    RawQuery(query): RawQuery,
) -> (StatusCode, String) {
    probes.respond(Probe::Healthz, Some(&name), query.as_deref())
}

async fn readyz(State(probes): State<HealthProbes>, RawQuery(query): RawQuery) -> (StatusCode, String) {
    probes.respond(Probe::Readyz, None, query.as_deref())
}

async fn readyz_named(
    State(probes): State<HealthProbes>,
    Path(name): Path<String>,
    RawQuery(query): RawQuery,
) -> (StatusCode, String) {
    probes.respond(Probe::Readyz, Some(&name), query.as_deref())
}

#[cfg(test)]
#[path = "health_tests.rs"]
mod health_tests;
