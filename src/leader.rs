// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Lease-based leader election.
//!
//! Redundant manager replicas compete for one `coordination.k8s.io/v1` Lease. The
//! replica holding it runs the controllers; the others stay on standby with their
//! caches warm and their probes served.
//!
//! # State machine
//!
//! ```text
//!            ┌────────────── renewal failed for renew_deadline ─────────────┐
//!            ▼                                                              │
//! Standby ─► Acquiring ── lease acquired ──► Leading ── renew every retry_period
//!            ▲    │
//!            └────┘ held by another replica, retry every retry_period
//! ```
//!
//! The current state is published on a `tokio::sync::watch` channel. Losing the
//! lease never restarts the process: controllers pause until it is reacquired.
//! On cancellation a held lease is released so a standby can take over at once.

use crate::metrics;
use async_trait::async_trait;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use k8s_openapi::jiff::{SignedDuration, Timestamp};
use kube::api::PostParams;
use kube::{Api, Client};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Leadership state of this replica.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaderState {
    /// Not leading and not trying
    Standby,
    /// Trying to acquire the lease
    Acquiring,
    /// Holding the lease; controllers are running
    Leading,
}

impl LeaderState {
    /// Whether controllers may process their queues.
    #[must_use]
    pub fn is_leading(self) -> bool {
        self == LeaderState::Leading
    }
}

/// Leader election settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaderElectionConfig {
    /// Lease name
    pub id: String,
    /// Lease namespace
    pub namespace: String,
    /// Holder identity of this replica, usually the pod name
    pub identity: String,
    /// How long a lease stays valid without renewal
    pub lease_duration: Duration,
    /// How long the leader keeps retrying renewal before giving up
    pub renew_deadline: Duration,
    /// Interval between acquire and renew attempts
    pub retry_period: Duration,
}

impl LeaderElectionConfig {
    /// Human-readable violations of `retry_period < renew_deadline < lease_duration`.
    ///
    /// The manager logs these and keeps going.
    #[must_use]
    pub fn timing_warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.renew_deadline >= self.lease_duration {
            warnings.push(format!(
                "renew deadline ({:?}) should be shorter than the lease duration ({:?})",
                self.renew_deadline, self.lease_duration
            ));
        }
        if self.retry_period >= self.renew_deadline {
            warnings.push(format!(
                "retry period ({:?}) should be shorter than the renew deadline ({:?})",
                self.retry_period, self.renew_deadline
            ));
        }
        warnings
    }
}

/// Errors from a lease lock.
#[derive(Error, Debug)]
pub enum LeaseError {
    /// The API server rejected or failed the request
    #[error("lease request failed: {0}")]
    Kube(#[from] kube::Error),

    /// The lease duration does not fit the Lease API field
    #[error("lease duration {0:?} is out of range")]
    InvalidDuration(Duration),
}

/// An exclusive, expiring lock shared by all replicas.
#[async_trait]
pub trait LeaseLock: Send + Sync {
    /// Acquire the lock for `identity`, or renew it if already held.
    ///
    /// Returns `Ok(false)` when another holder has a valid claim.
    async fn try_acquire_or_renew(
        &self,
        identity: &str,
        lease_duration: Duration,
    ) -> Result<bool, LeaseError>;

    /// Give the lock up if `identity` holds it.
    async fn release(&self, identity: &str) -> Result<(), LeaseError>;

    /// Description used in logs (e.g. `argo-events/argo-events-controller`).
    fn describe(&self) -> String;
}

/// [`LeaseLock`] backed by a `coordination.k8s.io/v1` Lease.
///
/// Writes use `replace` with the read `resourceVersion`, so two replicas racing for
/// the same lease cannot both win: the loser gets a 409 and reports `Ok(false)`.
pub struct KubeLeaseLock {
    api: Api<Lease>,
    namespace: String,
    name: String,
}

impl KubeLeaseLock {
    /// Lock on the Lease `name` in `namespace`.
    pub fn new(client: Client, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            api: Api::namespaced(client, &namespace),
            namespace,
            name: name.into(),
        }
    }

    async fn get(&self) -> Result<Option<Lease>, LeaseError> {
        match self.api.get(&self.name).await {
            Ok(lease) => Ok(Some(lease)),
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl LeaseLock for KubeLeaseLock {
    async fn try_acquire_or_renew(
        &self,
        identity: &str,
        lease_duration: Duration,
    ) -> Result<bool, LeaseError> {
        let now = Timestamp::now();
        let existing = self.get().await?;
        let Some(spec) = next_lease_spec(
            existing.as_ref().and_then(|lease| lease.spec.as_ref()),
            identity,
            lease_duration,
            now,
        )?
        else {
            return Ok(false);
        };

        let result = match existing {
            Some(mut lease) => {
                // metadata.resourceVersion is kept from the read
                lease.spec = Some(spec);
                self.api
                    .replace(&self.name, &PostParams::default(), &lease)
                    .await
            }
            None => {
                let lease = Lease {
                    metadata: ObjectMeta {
                        name: Some(self.name.clone()),
                        namespace: Some(self.namespace.clone()),
                        ..Default::default()
                    },
                    spec: Some(spec),
                };
                self.api.create(&PostParams::default(), &lease).await
            }
        };

        match result {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(err)) if err.code == 409 => {
                debug!(lease = %self.describe(), "Lost a lease update race");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn release(&self, identity: &str) -> Result<(), LeaseError> {
        let Some(mut lease) = self.get().await? else {
            return Ok(());
        };
        let Some(spec) = lease.spec.as_mut() else {
            return Ok(());
        };
        if spec.holder_identity.as_deref() != Some(identity) {
            return Ok(());
        }

        spec.holder_identity = None;
        spec.lease_duration_seconds = Some(1);
        spec.renew_time = Some(MicroTime(Timestamp::now()));
        self.api
            .replace(&self.name, &PostParams::default(), &lease)
            .await?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Whether a lease claim has lapsed at `now`. A lease without holder or renew time
/// is free.
#[must_use]
pub fn lease_expired(spec: &LeaseSpec, now: Timestamp) -> bool {
    if spec.holder_identity.as_deref().is_none_or(str::is_empty) {
        return true;
    }
    let Some(renewed) = spec.renew_time.as_ref().or(spec.acquire_time.as_ref()) else {
        return true;
    };
    let duration = SignedDuration::from_secs(i64::from(spec.lease_duration_seconds.unwrap_or(0)));
    renewed
        .0
        .checked_add(duration)
        .is_ok_and(|expiry| expiry <= now)
}

/// The lease spec `identity` should write to claim or renew the lease, or `None`
/// when another holder's claim is still valid.
///
/// # Errors
///
/// Returns [`LeaseError::InvalidDuration`] if `lease_duration` does not fit in seconds.
pub fn next_lease_spec(
    current: Option<&LeaseSpec>,
    identity: &str,
    lease_duration: Duration,
    now: Timestamp,
) -> Result<Option<LeaseSpec>, LeaseError> {
    let seconds = i32::try_from(lease_duration.as_secs().max(1))
        .map_err(|_| LeaseError::InvalidDuration(lease_duration))?;

    let Some(current) = current else {
        return Ok(Some(LeaseSpec {
            holder_identity: Some(identity.to_string()),
            acquire_time: Some(MicroTime(now)),
            renew_time: Some(MicroTime(now)),
            lease_duration_seconds: Some(seconds),
            lease_transitions: Some(0),
            ..Default::default()
        }));
    };

    if current.holder_identity.as_deref() == Some(identity) {
        return Ok(Some(LeaseSpec {
            renew_time: Some(MicroTime(now)),
            lease_duration_seconds: Some(seconds),
            ..current.clone()
        }));
    }

    if !lease_expired(current, now) {
        return Ok(None);
    }

    Ok(Some(LeaseSpec {
        holder_identity: Some(identity.to_string()),
        acquire_time: Some(MicroTime(now)),
        renew_time: Some(MicroTime(now)),
        lease_duration_seconds: Some(seconds),
        lease_transitions: Some(current.lease_transitions.unwrap_or(0) + 1),
        ..current.clone()
    }))
}

/// Runs the election loop and publishes the resulting [`LeaderState`].
pub struct LeaderElector {
    config: LeaderElectionConfig,
    lock: Arc<dyn LeaseLock>,
    state: watch::Sender<LeaderState>,
}

impl LeaderElector {
    /// An elector in the `Standby` state.
    pub fn new(config: LeaderElectionConfig, lock: Arc<dyn LeaseLock>) -> Self {
        let (state, _) = watch::channel(LeaderState::Standby);
        Self {
            config,
            lock,
            state,
        }
    }

    /// The election settings.
    pub fn config(&self) -> &LeaderElectionConfig {
        &self.config
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> LeaderState {
        *self.state.borrow()
    }

    /// A receiver following every state change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<LeaderState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: LeaderState) {
        self.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            debug!(from = ?*state, to = ?next, "Leader election state change");
            *state = next;
            true
        });
    }

    /// Compete for the lease until `token` is cancelled.
    pub async fn run(&self, token: CancellationToken) {
        let lease = self.lock.describe();
        info!(
            lease = %lease,
            identity = %self.config.identity,
            lease_duration = ?self.config.lease_duration,
            renew_deadline = ?self.config.renew_deadline,
            retry_period = ?self.config.retry_period,
            "Starting leader election"
        );

        loop {
            if !self.acquire(&token).await {
                break;
            }

            info!(lease = %lease, identity = %self.config.identity, "Acquired leadership");
            metrics::record_leader_elected(&self.config.identity);
            self.set_state(LeaderState::Leading);

            if !self.hold(&token).await {
                self.release().await;
                break;
            }

            warn!(
                lease = %lease,
                identity = %self.config.identity,
                "Lost leadership, pausing controllers"
            );
            metrics::record_leader_lost(&self.config.identity);
            self.set_state(LeaderState::Standby);
        }

        self.set_state(LeaderState::Standby);
        debug!(lease = %lease, "Leader election stopped");
    }

    /// Retry acquisition every `retry_period`. Returns `false` if cancelled first.
    async fn acquire(&self, token: &CancellationToken) -> bool {
        self.set_state(LeaderState::Acquiring);
        loop {
            match self
                .lock
                .try_acquire_or_renew(&self.config.identity, self.config.lease_duration)
                .await
            {
                Ok(true) => return true,
                Ok(false) => debug!(lease = %self.lock.describe(), "Lease is held by another replica"),
                Err(e) => warn!(lease = %self.lock.describe(), error = %e, "Failed to acquire lease"),
            }

            tokio::select! {
                () = token.cancelled() => return false,
                () = tokio::time::sleep(self.config.retry_period) => {}
            }
        }
    }

    /// Renew every `retry_period` while leading. Returns `false` if cancelled, `true`
    /// once leadership is lost.
    async fn hold(&self, token: &CancellationToken) -> bool {
        let mut last_renewal = Instant::now();
        loop {
            tokio::select! {
                () = token.cancelled() => return false,
                () = tokio::time::sleep(self.config.retry_period) => {}
            }

            let remaining = self
                .config
                .renew_deadline
                .saturating_sub(last_renewal.elapsed());
            if remaining.is_zero() {
                return true;
            }

            let attempt = self
                .lock
                .try_acquire_or_renew(&self.config.identity, self.config.lease_duration);
            match tokio::time::timeout(remaining, attempt).await {
                Ok(Ok(true)) => {
                    last_renewal = Instant::now();
                    metrics::record_leader_renewed();
                }
                Ok(Ok(false)) => return true,
                Ok(Err(e)) => warn!(lease = %self.lock.describe(), error = %e, "Failed to renew lease"),
                Err(_) => warn!(lease = %self.lock.describe(), "Lease renewal timed out"),
            }

            if last_renewal.elapsed() >= self.config.renew_deadline {
                return true;
            }
        }
    }

    async fn release(&self) {
        match self.lock.release(&self.config.identity).await {
            Ok(()) => info!(lease = %self.lock.describe(), "Released leadership"),
            Err(e) => warn!(lease = %self.lock.describe(), error = %e, "Failed to release lease"),
        }
        metrics::record_leader_lost(&self.config.identity);
    }
}

#[cfg(test)]
#[path = "leader_tests.rs"]
mod leader_tests;
