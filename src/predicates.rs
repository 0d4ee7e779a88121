// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Event filters deciding whether a cache event should reach a work queue.
//!
//! A [`Predicate`] compares the old and new metadata of an updated object. Add and
//! delete events always pass: a new or vanished object is always worth a reconcile.
//!
//! # Example
//!
//! ```rust
//! use events_controller::predicates::Predicate;
//!
//! // Reconcile on spec changes or label changes, never on status-only writes
//! let primary = Predicate::generation_changed().or(Predicate::label_changed());
//! ```

use crate::cache::ObjectEvent;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

type UpdateFn = dyn Fn(&ObjectMeta, &ObjectMeta) -> bool + Send + Sync;

/// A named boolean function over (old, new) object metadata.
#[derive(Clone)]
pub struct Predicate {
    name: String,
    update: Arc<UpdateFn>,
}

impl Predicate {
    /// A custom predicate over update events.
    pub fn new<F>(name: impl Into<String>, update: F) -> Self
    where
        F: Fn(&ObjectMeta, &ObjectMeta) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            update: Arc::new(update),
        }
    }

    /// Passes every event.
    #[must_use]
    pub fn always() -> Self {
        Self::new("Always", |_, _| true)
    }

    /// Passes updates that bump `metadata.generation`, i.e. spec changes.
    ///
    /// Kinds without a generation (config maps, services) never pass on update.
    #[must_use]
    pub fn generation_changed() -> Self {
        Self::new("GenerationChanged", |old, new| {
            old.generation.unwrap_or_default() != new.generation.unwrap_or_default()
        })
    }

    /// Passes updates that change `metadata.labels`. Absent and empty label maps are equal.
    #[must_use]
    pub fn label_changed() -> Self {
        Self::new("LabelChanged", |old, new| labels(old) != labels(new))
    }

    /// Passes when either predicate passes.
    #[must_use]
    pub fn or(self, other: Predicate) -> Self {
        let name = format!("Or({}, {})", self.name, other.name);
        let (left, right) = (self.update, other.update);
        Self::new(name, move |old, new| left(old, new) || right(old, new))
    }

    /// Passes when both predicates pass.
    #[must_use]
    pub fn and(self, other: Predicate) -> Self {
        let name = format!("And({}, {})", self.name, other.name);
        let (left, right) = (self.update, other.update);
        Self::new(name, move |old, new| left(old, new) && right(old, new))
    }

    /// Human-readable description, used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether an update from `old` to `new` passes.
    #[must_use]
    pub fn update(&self, old: &ObjectMeta, new: &ObjectMeta) -> bool {
        (self.update)(old, new)
    }

    /// Whether a cache event passes.
    #[must_use]
    pub fn evaluate<K: Resource>(&self, event: &ObjectEvent<K>) -> bool {
        match event {
            ObjectEvent::Added(_) | ObjectEvent::Deleted(_) => true,
            ObjectEvent::Updated { old, new } => self.update(old.meta(), new.meta()),
        }
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Predicate").field(&self.name).finish()
    }
}

/// Passes when any of `predicates` passes; an empty list never passes.
#[must_use]
pub fn any_of(predicates: impl IntoIterator<Item = Predicate>) -> Predicate {
    predicates
        .into_iter()
        .reduce(Predicate::or)
        .unwrap_or_else(|| Predicate::new("Never", |_, _| false))
}

fn labels(meta: &ObjectMeta) -> &BTreeMap<String, String> {
    static EMPTY: BTreeMap<String, String> = BTreeMap::new();
    meta.labels.as_ref().unwrap_or(&EMPTY)
}

#[cfg(test)]
#[path = "predicates_tests.rs"]
mod predicates_tests;
