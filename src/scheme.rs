// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Registry of the resource kinds the shared cache and client understand.
//!
//! Every kind must be registered before any watch on it is set up. Built-in kinds
//! for the subordinate objects the controllers own are registered up front by
//! [`Scheme::with_builtin_kinds`]; custom kinds are added during bootstrap.

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::Resource;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Identifies one resource kind: API group, version, kind and plural resource name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KindDescriptor {
    /// API group, empty for the core group
    pub group: String,
    /// API version within the group (e.g. `v1alpha1`)
    pub version: String,
    /// Kind name (e.g. `EventBus`)
    pub kind: String,
    /// Plural resource name used in API paths (e.g. `eventbus`)
    pub plural: String,
}

impl KindDescriptor {
    /// Build a descriptor from its parts.
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        kind: impl Into<String>,
        plural: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
            plural: plural.into(),
        }
    }

    /// Derive the descriptor of a statically typed kube resource.
    #[must_use]
    pub fn of<K>() -> Self
    where
        K: Resource<DynamicType = ()>,
    {
        Self {
            group: K::group(&()).into_owned(),
            version: K::version(&()).into_owned(),
            kind: K::kind(&()).into_owned(),
            plural: K::plural(&()).into_owned(),
        }
    }

    /// The `apiVersion` string for this kind (`group/version`, or `version` for core).
    #[must_use]
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Whether an `apiVersion` + `kind` pair (as found in owner references) names this kind.
    ///
    /// Only the group is compared, not the version: the same object may be referenced
    /// through any served version.
    #[must_use]
    pub fn matches(&self, api_version: &str, kind: &str) -> bool {
        let group = api_version
            .rsplit_once('/')
            .map_or("", |(group, _version)| group);
        self.kind == kind && self.group == group
    }
}

impl fmt::Display for KindDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, Kind={}", self.api_version(), self.kind)
    }
}

/// Errors returned by [`Scheme::register`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemeError {
    /// The descriptor is missing its kind or version
    #[error("invalid kind descriptor {descriptor}: {reason}")]
    InvalidDescriptor {
        /// The rejected descriptor
        descriptor: KindDescriptor,
        /// What is wrong with it
        reason: &'static str,
    },

    /// The group/kind is already registered with a different version or plural
    #[error("kind {existing} is already registered, cannot register {requested}")]
    Conflict {
        /// The descriptor already in the scheme
        existing: KindDescriptor,
        /// The descriptor that was rejected
        requested: KindDescriptor,
    },
}

/// Set of registered kinds, keyed by group and kind.
#[derive(Clone, Debug, Default)]
pub struct Scheme {
    kinds: BTreeMap<(String, String), KindDescriptor>,
}

impl Scheme {
    /// An empty scheme.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A scheme with the built-in kinds the controllers watch or use:
    /// `ConfigMap`, `Service`, `Deployment`, `StatefulSet` and `Lease`.
    #[must_use]
    pub fn with_builtin_kinds() -> Self {
        let mut kinds = BTreeMap::new();
        for descriptor in [
            KindDescriptor::of::<ConfigMap>(),
            KindDescriptor::of::<Service>(),
            KindDescriptor::of::<Deployment>(),
            KindDescriptor::of::<StatefulSet>(),
            KindDescriptor::of::<Lease>(),
        ] {
            kinds.insert(
                (descriptor.group.clone(), descriptor.kind.clone()),
                descriptor,
            );
        }
        Self { kinds }
    }

    /// Register a kind.
    ///
    /// Registering the same descriptor twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`SchemeError::InvalidDescriptor`] if the kind or version is empty, and
    /// [`SchemeError::Conflict`] if the group/kind is registered with another version
    /// or plural.
    pub fn register(&mut self, descriptor: KindDescriptor) -> Result<(), SchemeError> {
        if descriptor.kind.is_empty() {
            return Err(SchemeError::InvalidDescriptor {
                descriptor,
                reason: "kind must not be empty",
            });
        }
        if descriptor.version.is_empty() {
            return Err(SchemeError::InvalidDescriptor {
                descriptor,
                reason: "version must not be empty",
            });
        }

        let key = (descriptor.group.clone(), descriptor.kind.clone());
        match self.kinds.get(&key) {
            Some(existing) if *existing == descriptor => Ok(()),
            Some(existing) => Err(SchemeError::Conflict {
                existing: existing.clone(),
                requested: descriptor,
            }),
            None => {
                self.kinds.insert(key, descriptor);
                Ok(())
            }
        }
    }

    /// Register a statically typed kube resource.
    ///
    /// # Errors
    ///
    /// See [`Scheme::register`].
    pub fn register_resource<K>(&mut self) -> Result<(), SchemeError>
    where
        K: Resource<DynamicType = ()>,
    {
        self.register(KindDescriptor::of::<K>())
    }

    /// Whether exactly this descriptor is registered.
    #[must_use]
    pub fn recognizes(&self, descriptor: &KindDescriptor) -> bool {
        self.kinds
            .get(&(descriptor.group.clone(), descriptor.kind.clone()))
            .is_some_and(|registered| registered == descriptor)
    }

    /// Number of registered kinds.
    #[must_use]
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    /// Whether no kind is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

#[cfg(test)]
#[path = "scheme_tests.rs"]
mod scheme_tests;
