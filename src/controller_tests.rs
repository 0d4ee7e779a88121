// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `controller.rs`

#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::crd::{EventBus, EventBusSpec, Sensor};
    use crate::manager::ManagerOptions;
    use k8s_openapi::api::apps::v1::StatefulSet;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
    use kube::runtime::watcher::Event;
    use kube::Client;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::timeout;

    /// Client pointing at a closed port; nothing in these tests talks to it.
    fn test_client() -> Client {
        let config = kube::Config::new("http://127.0.0.1:1".parse().unwrap());
        Client::try_from(config).unwrap()
    }

    fn test_manager() -> ManagerContext {
        ManagerContext::new(ManagerOptions::default(), test_client(), Span::none())
    }

    /// Records every key; fails or panics on the first attempts when asked to.
    #[derive(Default)]
    struct RecordingReconciler {
        seen: Mutex<Vec<ObjectKey>>,
        failures: AtomicUsize,
        panics: AtomicUsize,
        requeue: Mutex<Requeue>,
    }

    #[async_trait]
    impl Reconciler for RecordingReconciler {
        async fn reconcile(&self, key: &ObjectKey) -> Result<Requeue, ReconcileError> {
            self.seen.lock().push(key.clone());
            if self
                .panics
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                panic!("reconciler exploded on {key}");
            }
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ReconcileError::Invalid("not yet".to_string()));
            }
            // Requeue only once, then settle
            Ok(std::mem::take(&mut *self.requeue.lock()))
        }
    }

    impl RecordingReconciler {
        fn count(&self, name: &str) -> usize {
            self.seen.lock().iter().filter(|k| k.name == name).count()
        }
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        timeout(Duration::from_secs(3), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not met in time");
    }

    fn bus(name: &str, generation: i64, labels: &[(&str, &str)]) -> EventBus {
        let mut bus = EventBus::new(name, EventBusSpec::default());
        bus.metadata.namespace = Some("argo-events".to_string());
        bus.metadata.generation = Some(generation);
        if !labels.is_empty() {
            bus.metadata.labels = Some(
                labels
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                    .collect(),
            );
        }
        bus
    }

    fn owned_stateful_set(owner_kind: &str, owner: &str, generation: i64) -> StatefulSet {
        StatefulSet {
            metadata: ObjectMeta {
                name: Some(format!("{owner}-stan")),
                namespace: Some("argo-events".to_string()),
                generation: Some(generation),
                owner_references: Some(vec![OwnerReference {
                    api_version: "argoproj.io/v1alpha1".to_string(),
                    kind: owner_kind.to_string(),
                    name: owner.to_string(),
                    uid: "uid".to_string(),
                    controller: Some(true),
                    block_owner_deletion: Some(true),
                }]),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn start(
        controller: Controller,
        state: LeaderState,
    ) -> (watch::Sender<LeaderState>, CancellationToken, tokio::task::JoinHandle<()>) {
        let (tx, rx) = watch::channel(state);
        let token = CancellationToken::new();
        let task = tokio::spawn(controller.run(rx, token.clone()));
        (tx, token, task)
    }

    #[test]
    fn test_registration_defaults() {
        let primary = WatchRegistration::primary();
        assert_eq!(primary.handler, EventHandler::EnqueueSelf);
        assert_eq!(primary.predicate.name(), "Or(GenerationChanged, LabelChanged)");

        let secondary = WatchRegistration::owned_by::<EventBus>();
        assert_eq!(secondary.handler, EventHandler::enqueue_owner::<EventBus>());
        assert_eq!(secondary.predicate.name(), "GenerationChanged");
    }

    #[tokio::test]
    async fn test_watch_requires_registered_kind() {
        let manager = test_manager();
        let mut controller = Controller::new(
            "eventbus-controller",
            Arc::new(RecordingReconciler::default()),
            Span::none(),
        );

        let err = controller
            .watch::<EventBus>(&manager, WatchRegistration::primary())
            .unwrap_err();
        assert!(matches!(err, WatchError::KindNotRegistered { .. }));
        assert!(controller.watches().is_empty());
        assert!(manager.cache().informed_kinds().is_empty());
    }

    #[tokio::test]
    async fn test_watch_requires_registered_owner_kind() {
        let manager = test_manager();
        let mut controller = Controller::new(
            "eventbus-controller",
            Arc::new(RecordingReconciler::default()),
            Span::none(),
        );

        // StatefulSet is built in, EventBus is not registered yet
        let err = controller
            .watch::<StatefulSet>(&manager, WatchRegistration::owned_by::<EventBus>())
            .unwrap_err();
        assert!(matches!(err, WatchError::OwnerKindNotRegistered { .. }));
    }

    #[tokio::test]
    async fn test_primary_watch_filters_status_only_updates() {
        let mut manager = test_manager();
        manager.scheme_mut().register_resource::<EventBus>().unwrap();
        let mut controller = Controller::new(
            "eventbus-controller",
            Arc::new(RecordingReconciler::default()),
            Span::none(),
        );
        controller
            .watch::<EventBus>(&manager, WatchRegistration::primary())
            .unwrap();
        let queue = Arc::clone(controller.queue());
        let informer = manager.cache().informer::<EventBus>();

        // Add always passes
        informer.apply_watcher_event(Event::Apply(bus("default", 1, &[])));
        let key = queue.get().await.unwrap();
        assert_eq!(key, ObjectKey::new("argo-events", "default"));
        queue.done(&key);

        // Same generation, same labels: filtered
        informer.apply_watcher_event(Event::Apply(bus("default", 1, &[])));
        assert!(queue.is_empty());

        // Label change passes
        informer.apply_watcher_event(Event::Apply(bus("default", 1, &[("tier", "gold")])));
        assert_eq!(queue.len(), 1);
        let key = queue.get().await.unwrap();
        queue.done(&key);

        // Spec change passes
        informer.apply_watcher_event(Event::Apply(bus("default", 2, &[("tier", "gold")])));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_secondary_watch_routes_to_owner() {
        let mut manager = test_manager();
        manager.scheme_mut().register_resource::<EventBus>().unwrap();
        let mut controller = Controller::new(
            "eventbus-controller",
            Arc::new(RecordingReconciler::default()),
            Span::none(),
        );
        controller
            .watch::<StatefulSet>(&manager, WatchRegistration::owned_by::<EventBus>())
            .unwrap();
        let queue = Arc::clone(controller.queue());
        let informer = manager.cache().informer::<StatefulSet>();

        informer.apply_watcher_event(Event::Apply(owned_stateful_set("EventBus", "default", 1)));
        let key = queue.get().await.unwrap();
        assert_eq!(key, ObjectKey::new("argo-events", "default"));
        queue.done(&key);

        // Status-only change of the subordinate: filtered
        informer.apply_watcher_event(Event::Apply(owned_stateful_set("EventBus", "default", 1)));
        assert!(queue.is_empty());

        // Subordinate owned by a different kind: dropped
        informer.apply_watcher_event(Event::Apply(owned_stateful_set("Sensor", "other", 1)));
        assert!(queue.is_empty());

        // Deletion of an owned subordinate passes
        informer.apply_watcher_event(Event::Delete(owned_stateful_set("EventBus", "default", 1)));
        assert_eq!(queue.len(), 1);

        assert_eq!(controller.watches().len(), 1);
        assert_eq!(controller.watches()[0].kind.kind, "StatefulSet");
    }

    #[tokio::test]
    async fn test_watches_share_one_informer_per_kind() {
        let mut manager = test_manager();
        manager.scheme_mut().register_resource::<EventBus>().unwrap();
        manager.scheme_mut().register_resource::<Sensor>().unwrap();
        let mut buses = Controller::new(
            "eventbus-controller",
            Arc::new(RecordingReconciler::default()),
            Span::none(),
        );
        let mut sensors = Controller::new(
            "sensor-controller",
            Arc::new(RecordingReconciler::default()),
            Span::none(),
        );
        buses
            .watch::<StatefulSet>(&manager, WatchRegistration::owned_by::<EventBus>())
            .unwrap();
        sensors
            .watch::<StatefulSet>(&manager, WatchRegistration::owned_by::<Sensor>())
            .unwrap();

        assert_eq!(manager.cache().informed_kinds().len(), 1);
        manager
            .cache()
            .informer::<StatefulSet>()
            .apply_watcher_event(Event::Apply(owned_stateful_set("Sensor", "s1", 1)));
        assert!(buses.queue().is_empty());
        assert_eq!(sensors.queue().len(), 1);
    }

    #[tokio::test]
    async fn test_workers_reconcile_queued_keys() {
        let reconciler = Arc::new(RecordingReconciler::default());
        let controller = Controller::new("test-controller", reconciler.clone(), Span::none());
        let queue = Arc::clone(controller.queue());
        let (_tx, token, task) = start(controller, LeaderState::Leading);

        queue.add(ObjectKey::new("argo-events", "a"));
        queue.add(ObjectKey::new("argo-events", "b"));
        eventually(|| reconciler.count("a") == 1 && reconciler.count("b") == 1).await;

        token.cancel();
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert!(queue.is_shutting_down());
    }

    #[tokio::test]
    async fn test_workers_wait_for_leadership() {
        let reconciler = Arc::new(RecordingReconciler::default());
        let controller = Controller::new("test-controller", reconciler.clone(), Span::none());
        let queue = Arc::clone(controller.queue());
        let (tx, token, task) = start(controller, LeaderState::Standby);

        queue.add(ObjectKey::new("argo-events", "a"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(reconciler.count("a"), 0);

        tx.send(LeaderState::Leading).unwrap();
        eventually(|| reconciler.count("a") == 1).await;

        token.cancel();
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_errors_are_retried_with_backoff() {
        let reconciler = Arc::new(RecordingReconciler::default());
        reconciler.failures.store(2, Ordering::SeqCst);
        let controller = Controller::new("test-controller", reconciler.clone(), Span::none());
        let queue = Arc::clone(controller.queue());
        let (_tx, token, task) = start(controller, LeaderState::Leading);

        let key = ObjectKey::new("argo-events", "flaky");
        queue.add(key.clone());
        eventually(|| reconciler.count("flaky") == 3).await;
        // Success forgets the failure history
        eventually(|| queue.num_requeues(&key) == 0).await;

        token.cancel();
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_panics_are_isolated_to_the_key() {
        let reconciler = Arc::new(RecordingReconciler::default());
        reconciler.panics.store(1, Ordering::SeqCst);
        let controller = Controller::new("test-controller", reconciler.clone(), Span::none());
        let queue = Arc::clone(controller.queue());
        let (_tx, token, task) = start(controller, LeaderState::Leading);

        queue.add(ObjectKey::new("argo-events", "boom"));
        queue.add(ObjectKey::new("argo-events", "calm"));

        // The panicking key is retried; the worker survives and handles the other key
        eventually(|| reconciler.count("boom") == 2 && reconciler.count("calm") == 1).await;

        token.cancel();
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_requeue_after_reconciles_again() {
        let reconciler = Arc::new(RecordingReconciler::default());
        *reconciler.requeue.lock() = Requeue::After(Duration::from_millis(30));
        let controller = Controller::new("test-controller", reconciler.clone(), Span::none());
        let queue = Arc::clone(controller.queue());
        let (_tx, token, task) = start(controller, LeaderState::Leading);

        queue.add(ObjectKey::new("argo-events", "periodic"));
        eventually(|| reconciler.count("periodic") == 2).await;

        token.cancel();
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }

    /// Tracks how many reconciles overlap.
    #[derive(Default)]
    struct SlowReconciler {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        done: AtomicUsize,
    }

    #[async_trait]
    impl Reconciler for SlowReconciler {
        async fn reconcile(&self, _key: &ObjectKey) -> Result<Requeue, ReconcileError> {
            let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.done.fetch_add(1, Ordering::SeqCst);
            Ok(Requeue::Done)
        }
    }

    #[tokio::test]
    async fn test_concurrent_workers_reconcile_distinct_keys_in_parallel() {
        let reconciler = Arc::new(SlowReconciler::default());
        let controller = Controller::new("test-controller", reconciler.clone(), Span::none())
            .with_max_concurrent_reconciles(2);
        assert_eq!(controller.max_concurrent_reconciles(), 2);
        let queue = Arc::clone(controller.queue());
        let (_tx, token, task) = start(controller, LeaderState::Leading);

        queue.add(ObjectKey::new("argo-events", "a"));
        queue.add(ObjectKey::new("argo-events", "b"));
        eventually(|| reconciler.done.load(Ordering::SeqCst) == 2).await;
        assert_eq!(reconciler.peak.load(Ordering::SeqCst), 2);

        token.cancel();
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_single_worker_reconciles_one_key_at_a_time() {
        let reconciler = Arc::new(SlowReconciler::default());
        let controller = Controller::new("test-controller", reconciler.clone(), Span::none())
            .with_max_concurrent_reconciles(0);
        assert_eq!(controller.max_concurrent_reconciles(), 1);
        let queue = Arc::clone(controller.queue());
        let (_tx, token, task) = start(controller, LeaderState::Leading);

        queue.add(ObjectKey::new("argo-events", "a"));
        queue.add(ObjectKey::new("argo-events", "b"));
        eventually(|| reconciler.done.load(Ordering::SeqCst) == 2).await;
        assert_eq!(reconciler.peak.load(Ordering::SeqCst), 1);

        token.cancel();
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_custom_predicate_replaces_the_default() {
        let mut manager = test_manager();
        manager.scheme_mut().register_resource::<EventBus>().unwrap();
        let mut controller = Controller::new(
            "eventbus-controller",
            Arc::new(RecordingReconciler::default()),
            Span::none(),
        );
        let registration = WatchRegistration::primary().with_predicate(Predicate::always());
        assert_eq!(registration.handler, EventHandler::EnqueueSelf);
        assert_eq!(registration.predicate.name(), "Always");
        controller.watch::<EventBus>(&manager, registration).unwrap();
        let queue = Arc::clone(controller.queue());
        let informer = manager.cache().informer::<EventBus>();

        informer.apply_watcher_event(Event::Apply(bus("default", 1, &[])));
        let key = queue.get().await.unwrap();
        queue.done(&key);

        // Status-only update still passes
        informer.apply_watcher_event(Event::Apply(bus("default", 1, &[])));
        assert_eq!(queue.len(), 1);
        assert_eq!(controller.watches()[0].predicate.name(), "Always");
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(boxed.as_ref()), "static message");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned message"));
        assert_eq!(panic_message(boxed.as_ref()), "owned message");
        let boxed: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
