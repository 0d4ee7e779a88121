// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Integration tests for the events controller manager
//!
//! These tests run the manager against a real cluster with the `EventBus`,
//! `EventSource` and `Sensor` CRDs installed (`cargo run --bin crdgen` then
//! `kubectl apply -f deploy/crds/`).
//!
//! Run with: cargo test --test controller_integration -- --ignored

mod common;

use common::{crd_installed, create_test_namespace, delete_test_namespace, get_kube_client_or_skip};
use events_controller::bootstrap::{prepare, Dependencies, KubeConnector};
use events_controller::config::{ControllerOptions, FileConfigLoader};
use events_controller::constants::{HOSTNAME_ENV_VAR, IMAGE_ENV_VAR, LEADER_ELECTION_ID};
use events_controller::crd::{Sensor, SensorSpec};
use events_controller::reconcilers::DefaultReconcilerFactory;
use k8s_openapi::api::coordination::v1::Lease;
use kube::api::{Api, PostParams};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

const CONFIG: &str = r"
eventBus:
  jetstream:
    versions:
      - version: latest
        natsImage: nats:2.10.10
        metricsExporterImage: natsio/prometheus-nats-exporter:0.14.0
        configReloaderImage: natsio/nats-server-config-reloader:0.14.0
        startCommand: /nats-server
";

fn dependencies(config: &tempfile::NamedTempFile, identity: &str) -> Dependencies {
    let env: HashMap<String, String> = HashMap::from([
        (
            IMAGE_ENV_VAR.to_string(),
            "quay.io/argoproj/argo-events:latest".to_string(),
        ),
        (HOSTNAME_ENV_VAR.to_string(), identity.to_string()),
    ]);
    Dependencies {
        config_loader: Arc::new(FileConfigLoader::new(config.path())),
        env: Arc::new(env),
        connector: Arc::new(KubeConnector),
        reconcilers: Arc::new(DefaultReconcilerFactory),
    }
}

fn config_file() -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(CONFIG.as_bytes()).unwrap();
    file
}

#[tokio::test]
#[ignore] // Run with: cargo test --test controller_integration -- --ignored
async fn test_sensor_observed_generation_is_recorded() {
    let Some(client) = get_kube_client_or_skip().await else {
        return;
    };
    if !crd_installed(&client, "sensors.argoproj.io").await {
        eprintln!("Skipping: Sensor CRD is not installed");
        return;
    }

    let namespace = "events-controller-it-sensor";
    create_test_namespace(&client, namespace).await.unwrap();

    let options = ControllerOptions {
        namespaced: true,
        managed_namespace: namespace.to_string(),
        metrics_port: 0,
        health_port: 0,
        ..Default::default()
    };
    let config = config_file();
    let manager = prepare(&options, &dependencies(&config, "it-sensor"))
        .await
        .unwrap();

    let token = CancellationToken::new();
    let run = tokio::spawn(manager.run(token.clone()));

    let sensors: Api<Sensor> = Api::namespaced(client.clone(), namespace);
    let sensor = Sensor::new("webhook", SensorSpec::default());
    sensors.create(&PostParams::default(), &sensor).await.unwrap();

    let mut observed = None;
    for _ in 0..60 {
        let current = sensors.get("webhook").await.unwrap();
        observed = current.status.and_then(|status| status.observed_generation);
        if observed.is_some() {
            break;
        }
        sleep(Duration::from_millis(500)).await;
    }

    token.cancel();
    let result = run.await.unwrap();
    delete_test_namespace(&client, namespace).await;

    assert_eq!(observed, Some(1));
    assert!(result.is_ok(), "manager stopped with {result:?}");
}

#[tokio::test]
#[ignore]
async fn test_leader_election_takes_the_lease() {
    let Some(client) = get_kube_client_or_skip().await else {
        return;
    };
    if !crd_installed(&client, "eventbus.argoproj.io").await {
        eprintln!("Skipping: EventBus CRD is not installed");
        return;
    }

    let namespace = "events-controller-it-lease";
    create_test_namespace(&client, namespace).await.unwrap();

    let options = ControllerOptions {
        namespaced: true,
        managed_namespace: namespace.to_string(),
        leader_election: true,
        metrics_port: 0,
        health_port: 0,
        ..Default::default()
    };
    let config = config_file();
    let manager = prepare(&options, &dependencies(&config, "it-leader"))
        .await
        .unwrap();

    let token = CancellationToken::new();
    let run = tokio::spawn(manager.run(token.clone()));

    let leases: Api<Lease> = Api::namespaced(client.clone(), namespace);
    let mut holder = None;
    for _ in 0..40 {
        if let Ok(lease) = leases.get(LEADER_ELECTION_ID).await {
            holder = lease.spec.and_then(|spec| spec.holder_identity);
            if holder.is_some() {
                break;
            }
        }
        sleep(Duration::from_millis(500)).await;
    }

    token.cancel();
    let result = run.await.unwrap();

    // The lease is released on shutdown
    let released = leases
        .get(LEADER_ELECTION_ID)
        .await
        .ok()
        .and_then(|lease| lease.spec)
        .and_then(|spec| spec.holder_identity);
    delete_test_namespace(&client, namespace).await;

    assert_eq!(holder.as_deref(), Some("it-leader"));
    assert!(released.is_none());
    assert!(result.is_ok(), "manager stopped with {result:?}");
}
