// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Default reconcilers for `EventBus`, `EventSource` and `Sensor`.
//!
//! These reconcilers acknowledge spec changes by recording the observed generation on
//! the resource status. They make the manager runnable on its own; deployments that
//! build the real subordinate objects plug their own reconcilers in through
//! [`crate::bootstrap::ReconcilerFactory`].

use crate::bootstrap::ReconcilerFactory;
use crate::cache::{ObjectCache, ObjectKey, WatchedResource};
use crate::config::ControllerConfig;
use crate::controller::{ReconcileError, Reconciler, Requeue};
use crate::crd::{EventBus, EventSource, HasStatus, Sensor};
use async_trait::async_trait;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, Resource};
use serde_json::json;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, info};

/// What every reconciler is built from.
#[derive(Clone)]
pub struct ReconcilerContext {
    /// Shared kube client
    pub client: Client,
    /// Shared object cache
    pub cache: ObjectCache,
    /// Validated controller configuration
    pub config: Arc<ControllerConfig>,
    /// Image used for the event source and sensor workloads
    pub image: String,
}

/// Records `status.observedGeneration` for kind `K`.
pub struct ObservedGenerationReconciler<K> {
    client: Client,
    cache: ObjectCache,
    _kind: PhantomData<fn() -> K>,
}

impl<K> ObservedGenerationReconciler<K> {
    /// A reconciler reading from `cache` and writing through `client`.
    pub fn new(client: Client, cache: ObjectCache) -> Self {
        Self {
            client,
            cache,
            _kind: PhantomData,
        }
    }
}

/// The generation to record, or `None` when the status is already current.
#[must_use]
pub fn pending_generation<K: Resource + HasStatus>(object: &K) -> Option<i64> {
    let generation = object.meta().generation?;
    let observed = object
        .resource_status()
        .and_then(|status| status.observed_generation);
    (observed != Some(generation)).then_some(generation)
}

#[async_trait]
impl<K> Reconciler for ObservedGenerationReconciler<K>
where
    K: WatchedResource + HasStatus,
{
    async fn reconcile(&self, key: &ObjectKey) -> Result<Requeue, ReconcileError> {
        let kind = K::kind(&());
        let Some(object) = self.cache.get::<K>(key) else {
            debug!(kind = %kind, key = %key, "Object no longer exists, nothing to do");
            return Ok(Requeue::Done);
        };
        let Some(generation) = pending_generation(object.as_ref()) else {
            debug!(kind = %kind, key = %key, "Status is up to date");
            return Ok(Requeue::Done);
        };
        let Some(namespace) = key.namespace.as_deref() else {
            return Err(ReconcileError::Invalid(format!(
                "{kind} {key} has no namespace"
            )));
        };

        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let status_patch = json!({
            "status": { "observedGeneration": generation }
        });
        api.patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&status_patch))
            .await?;

        info!(kind = %kind, key = %key, generation, "Recorded observed generation");
        Ok(Requeue::Done)
    }
}

/// Builds an [`ObservedGenerationReconciler`] for each kind.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultReconcilerFactory;

impl ReconcilerFactory for DefaultReconcilerFactory {
    fn event_bus(&self, context: &ReconcilerContext) -> Arc<dyn Reconciler> {
        Arc::new(ObservedGenerationReconciler::<EventBus>::new(
            context.client.clone(),
            context.cache.clone(),
        ))
    }

    fn event_source(&self, context: &ReconcilerContext) -> Arc<dyn Reconciler> {
        Arc::new(ObservedGenerationReconciler::<EventSource>::new(
            context.client.clone(),
            context.cache.clone(),
        ))
    }

    fn sensor(&self, context: &ReconcilerContext) -> Arc<dyn Reconciler> {
        Arc::new(ObservedGenerationReconciler::<Sensor>::new(
            context.client.clone(),
            context.cache.clone(),
        ))
    }
}

#[cfg(test)]
#[path = "reconcilers_tests.rs"]
mod reconcilers_tests;
