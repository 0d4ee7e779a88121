// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Mapping from cache events to reconcile keys.
//!
//! A primary watch enqueues the changed object itself. A secondary watch enqueues the
//! object's *controller owner*: the owner reference flagged `controller: true`, which
//! must point at the expected owner kind. Objects without a matching controller owner
//! produce no key.

use crate::cache::{ObjectEvent, ObjectKey};
use crate::scheme::KindDescriptor;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::Resource;

/// How events on a watched kind become reconcile keys.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventHandler {
    /// Enqueue the key of the object that changed
    EnqueueSelf,
    /// Enqueue the key of the object's controller owner, if it is of this kind
    EnqueueOwner(KindDescriptor),
}

impl EventHandler {
    /// Route to controller owners of kind `O`.
    #[must_use]
    pub fn enqueue_owner<O>() -> Self
    where
        O: Resource<DynamicType = ()>,
    {
        EventHandler::EnqueueOwner(KindDescriptor::of::<O>())
    }

    /// Reconcile key for a single object, or `None` when it does not route.
    #[must_use]
    pub fn key_for(&self, meta: &ObjectMeta) -> Option<ObjectKey> {
        match self {
            EventHandler::EnqueueSelf => ObjectKey::from_meta(meta),
            EventHandler::EnqueueOwner(owner_kind) => {
                let owner = controller_owner(meta)?;
                if !owner_kind.matches(&owner.api_version, &owner.kind) {
                    return None;
                }
                // Owners of namespaced objects live in the same namespace
                Some(ObjectKey {
                    namespace: meta.namespace.clone(),
                    name: owner.name.clone(),
                })
            }
        }
    }

    /// Reconcile keys for a cache event, without duplicates.
    ///
    /// Updates route both the old and the new object, so a change of owner
    /// reconciles the previous owner as well.
    #[must_use]
    pub fn keys_for<K: Resource>(&self, event: &ObjectEvent<K>) -> Vec<ObjectKey> {
        let mut keys = Vec::with_capacity(2);
        if let Some(old) = event.old() {
            keys.extend(self.key_for(old.meta()));
        }
        if let Some(key) = self.key_for(event.object().meta()) {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }
}

/// The owner reference flagged as the managing controller, if any.
#[must_use]
pub fn controller_owner(meta: &ObjectMeta) -> Option<&OwnerReference> {
    meta.owner_references
        .as_deref()?
        .iter()
        .find(|owner| owner.controller == Some(true))
}

#[cfg(test)]
#[path = "handler_tests.rs"]
mod handler_tests;
