// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Shared object cache.
//!
//! The cache holds one [`Informer`] per watched kind. An informer is a typed,
//! eventually-consistent local mirror of the cluster objects of that kind, fed by a
//! kube-rs `watcher` stream, which pushes [`ObjectEvent`]s to registered listeners.
//!
//! # Architecture
//!
//! ```text
//! watcher stream ──► Informer<K>::apply_watcher_event ──► store (HashMap<ObjectKey, Arc<K>>)
//!                                                   └──► listeners (predicate + handler + queue)
//! ```
//!
//! The cache is read-only from the controllers' point of view: writes go through the
//! kube client and come back through the watch.
//!
//! When the cache is scoped to a namespace, both the watch requests and the informer
//! itself ignore every object outside it, so nothing downstream branches on scope.

use crate::scheme::KindDescriptor;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::NamespaceResourceScope;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, Resource};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Uniquely identifies an object of a known kind by namespace and name.
///
/// This is the reconcile key placed on work queues.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    /// The object namespace, if any
    pub namespace: Option<String>,
    /// The object name
    pub name: String,
}

impl ObjectKey {
    /// A namespaced key.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Key of the object described by `meta`, or `None` if it has no name.
    #[must_use]
    pub fn from_meta(meta: &ObjectMeta) -> Option<Self> {
        Some(Self {
            namespace: meta.namespace.clone(),
            name: meta.name.clone()?,
        })
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{namespace}/{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// A change observed by an informer.
#[derive(Debug)]
pub enum ObjectEvent<K> {
    /// The object appeared in the cache
    Added(Arc<K>),
    /// The object was replaced in the cache
    Updated {
        /// The previously cached object
        old: Arc<K>,
        /// The newly observed object
        new: Arc<K>,
    },
    /// The object was removed from the cache
    Deleted(Arc<K>),
}

impl<K> ObjectEvent<K> {
    /// The current object: the new one for updates, the removed one for deletions.
    pub fn object(&self) -> &Arc<K> {
        match self {
            ObjectEvent::Added(object) | ObjectEvent::Deleted(object) => object,
            ObjectEvent::Updated { new, .. } => new,
        }
    }

    /// The previous object, for updates only.
    pub fn old(&self) -> Option<&Arc<K>> {
        match self {
            ObjectEvent::Updated { old, .. } => Some(old),
            _ => None,
        }
    }
}

/// Which objects the cache mirrors.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum CacheScope {
    /// Every namespace
    #[default]
    Cluster,
    /// A single namespace
    Namespace(String),
}

impl CacheScope {
    /// Whether an object in `namespace` falls within this scope.
    #[must_use]
    pub fn contains(&self, namespace: Option<&str>) -> bool {
        match self {
            CacheScope::Cluster => true,
            CacheScope::Namespace(scope) => namespace == Some(scope.as_str()),
        }
    }
}

/// Resource types the cache can mirror.
///
/// Every kind watched by the controllers is namespaced and statically typed.
pub trait WatchedResource:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> WatchedResource for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

type Listener<K> = Arc<dyn Fn(&ObjectEvent<K>) + Send + Sync>;

/// Typed local mirror of one kind.
pub struct Informer<K> {
    descriptor: KindDescriptor,
    scope: CacheScope,
    store: RwLock<HashMap<ObjectKey, Arc<K>>>,
    listeners: RwLock<Vec<Listener<K>>>,
    // Keys seen since the last `Init`, while a relist is in progress
    relist: Mutex<Option<HashSet<ObjectKey>>>,
    synced: AtomicBool,
}

impl<K> Informer<K>
where
    K: Resource<DynamicType = ()> + Send + Sync + 'static,
{
    /// An empty informer for kind `K` limited to `scope`.
    #[must_use]
    pub fn new(scope: CacheScope) -> Self {
        Self {
            descriptor: KindDescriptor::of::<K>(),
            scope,
            store: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            relist: Mutex::new(None),
            synced: AtomicBool::new(false),
        }
    }

    /// The kind this informer mirrors.
    pub fn descriptor(&self) -> &KindDescriptor {
        &self.descriptor
    }

    /// Register a listener. Listeners are called synchronously, in registration order,
    /// for every event; they must not block.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(&ObjectEvent<K>) + Send + Sync + 'static,
    {
        self.listeners.write().push(Arc::new(listener));
    }

    /// Cached object for `key`.
    #[must_use]
    pub fn get(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.store.read().get(key).cloned()
    }

    /// Snapshot of all cached objects.
    #[must_use]
    pub fn list(&self) -> Vec<Arc<K>> {
        self.store.read().values().cloned().collect()
    }

    /// Number of cached objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.store.read().len()
    }

    /// Whether the cache holds no object of this kind.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.store.read().is_empty()
    }

    /// Whether the initial list has completed at least once.
    #[must_use]
    pub fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    /// Apply one event from a kube-rs watcher stream.
    ///
    /// A relist (`Init`, `InitApply`..., `InitDone`) emits `Added`/`Updated` for every
    /// listed object and `Deleted` for cached objects missing from the new list.
    pub fn apply_watcher_event(&self, event: watcher::Event<K>) {
        match event {
            watcher::Event::Init => {
                *self.relist.lock() = Some(HashSet::new());
            }
            watcher::Event::InitApply(object) => {
                if let Some(key) = self.upsert(object) {
                    if let Some(seen) = self.relist.lock().as_mut() {
                        seen.insert(key);
                    }
                }
            }
            watcher::Event::InitDone => {
                let seen = self.relist.lock().take().unwrap_or_default();
                let stale: Vec<Arc<K>> = {
                    let mut store = self.store.write();
                    let missing: Vec<ObjectKey> = store
                        .keys()
                        .filter(|key| !seen.contains(*key))
                        .cloned()
                        .collect();
                    missing.iter().filter_map(|key| store.remove(key)).collect()
                };
                for object in stale {
                    self.dispatch(&ObjectEvent::Deleted(object));
                }
                if !self.synced.swap(true, Ordering::AcqRel) {
                    debug!(kind = %self.descriptor.kind, objects = self.len(), "Informer synced");
                }
            }
            watcher::Event::Apply(object) => {
                self.upsert(object);
            }
            watcher::Event::Delete(object) => {
                self.remove(object);
            }
        }
    }

    fn upsert(&self, object: K) -> Option<ObjectKey> {
        let meta = object.meta();
        if !self.scope.contains(meta.namespace.as_deref()) {
            trace!(
                kind = %self.descriptor.kind,
                namespace = ?meta.namespace,
                "Ignoring object outside cache scope"
            );
            return None;
        }
        let key = ObjectKey::from_meta(meta)?;

        let new = Arc::new(object);
        let old = self.store.write().insert(key.clone(), Arc::clone(&new));
        let event = match old {
            Some(old) => ObjectEvent::Updated { old, new },
            None => ObjectEvent::Added(new),
        };
        self.dispatch(&event);
        Some(key)
    }

    fn remove(&self, object: K) {
        let meta = object.meta();
        if !self.scope.contains(meta.namespace.as_deref()) {
            return;
        }
        let Some(key) = ObjectKey::from_meta(meta) else {
            return;
        };

        // Prefer the cached copy; fall back to the final state carried by the event
        let removed = self
            .store
            .write()
            .remove(&key)
            .unwrap_or_else(|| Arc::new(object));
        self.dispatch(&ObjectEvent::Deleted(removed));
    }

    fn dispatch(&self, event: &ObjectEvent<K>) {
        let listeners = self.listeners.read().clone();
        for listener in &listeners {
            listener(event);
        }
    }
}

impl<K> Informer<K>
where
    K: WatchedResource,
{
    /// Feed this informer from the cluster until `token` is cancelled.
    ///
    /// Watch errors are logged and retried with the watcher's default backoff.
    pub async fn run(self: Arc<Self>, client: Client, token: CancellationToken) {
        let api: Api<K> = match &self.scope {
            CacheScope::Cluster => Api::all(client),
            CacheScope::Namespace(namespace) => Api::namespaced(client, namespace),
        };
        info!(kind = %self.descriptor.kind, scope = ?self.scope, "Starting informer");

        let mut stream = watcher(api, watcher::Config::default())
            .default_backoff()
            .boxed();

        loop {
            tokio::select! {
                () = token.cancelled() => break,
                next = stream.next() => match next {
                    Some(Ok(event)) => self.apply_watcher_event(event),
                    Some(Err(e)) => warn!(
                        kind = %self.descriptor.kind,
                        error = %e,
                        "Watch failed, retrying with backoff"
                    ),
                    None => break,
                },
            }
        }

        debug!(kind = %self.descriptor.kind, "Informer stopped");
    }
}

/// Type-erased view of an informer, used by the cache to start feeds.
trait InformerHandle: Send + Sync {
    fn descriptor(&self) -> &KindDescriptor;
    fn has_synced(&self) -> bool;
    fn start(self: Arc<Self>, client: Client, token: CancellationToken) -> BoxFuture<'static, ()>;
}

impl<K: WatchedResource> InformerHandle for Informer<K> {
    fn descriptor(&self) -> &KindDescriptor {
        &self.descriptor
    }

    fn has_synced(&self) -> bool {
        Informer::has_synced(self)
    }

    fn start(self: Arc<Self>, client: Client, token: CancellationToken) -> BoxFuture<'static, ()> {
        self.run(client, token).boxed()
    }
}

struct CacheEntry {
    typed: Arc<dyn Any + Send + Sync>,
    handle: Arc<dyn InformerHandle>,
}

/// Shared, informer-backed cache of cluster objects.
///
/// Cloning is cheap; all clones share the same informers.
#[derive(Clone)]
pub struct ObjectCache {
    scope: CacheScope,
    informers: Arc<Mutex<HashMap<TypeId, CacheEntry>>>,
}

impl ObjectCache {
    /// An empty cache restricted to `scope`.
    #[must_use]
    pub fn new(scope: CacheScope) -> Self {
        Self {
            scope,
            informers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The scope every informer in this cache inherits.
    pub fn scope(&self) -> &CacheScope {
        &self.scope
    }

    /// The informer for kind `K`, created on first use.
    ///
    /// Informers created after [`ObjectCache::start`] are not fed.
    pub fn informer<K: WatchedResource>(&self) -> Arc<Informer<K>> {
        let mut informers = self.informers.lock();
        let entry = informers.entry(TypeId::of::<K>()).or_insert_with(|| {
            let informer = Arc::new(Informer::<K>::new(self.scope.clone()));
            CacheEntry {
                typed: Arc::clone(&informer) as Arc<dyn Any + Send + Sync>,
                handle: informer,
            }
        });
        match Arc::clone(&entry.typed).downcast::<Informer<K>>() {
            Ok(informer) => informer,
            // Entries are keyed by the TypeId of K, so the downcast cannot fail
            Err(_) => unreachable!("informer registered under a foreign TypeId"),
        }
    }

    /// Cached object of kind `K`, if that kind is informed and the object is present.
    #[must_use]
    pub fn get<K: WatchedResource>(&self, key: &ObjectKey) -> Option<Arc<K>> {
        let typed = {
            let informers = self.informers.lock();
            Arc::clone(&informers.get(&TypeId::of::<K>())?.typed)
        };
        typed.downcast::<Informer<K>>().ok()?.get(key)
    }

    /// Descriptors of all informed kinds.
    #[must_use]
    pub fn informed_kinds(&self) -> Vec<KindDescriptor> {
        let mut kinds: Vec<KindDescriptor> = self
            .informers
            .lock()
            .values()
            .map(|entry| entry.handle.descriptor().clone())
            .collect();
        kinds.sort();
        kinds
    }

    /// Whether every informer has completed its initial list.
    #[must_use]
    pub fn has_synced(&self) -> bool {
        self.informers
            .lock()
            .values()
            .all(|entry| entry.handle.has_synced())
    }

    /// Descriptors of the informers still waiting for their initial list.
    #[must_use]
    pub fn unsynced_kinds(&self) -> Vec<KindDescriptor> {
        let mut kinds: Vec<KindDescriptor> = self
            .informers
            .lock()
            .values()
            .filter(|entry| !entry.handle.has_synced())
            .map(|entry| entry.handle.descriptor().clone())
            .collect();
        kinds.sort();
        kinds
    }

    /// Spawn one watcher feed per informer.
    pub fn start(&self, client: &Client, token: &CancellationToken) -> Vec<JoinHandle<()>> {
        let handles: Vec<Arc<dyn InformerHandle>> = self
            .informers
            .lock()
            .values()
            .map(|entry| Arc::clone(&entry.handle))
            .collect();

        handles
            .into_iter()
            .map(|handle| tokio::spawn(handle.start(client.clone(), token.child_token())))
            .collect()
    }
}

#[cfg(test)]
#[path = "cache_tests.rs"]
mod cache_tests;
