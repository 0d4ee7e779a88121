// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Controller configuration.
//!
//! Two inputs configure the manager:
//!
//! - [`ControllerOptions`] - process entry options, parsed from the command line
//! - [`ControllerConfig`] - the controller configuration file, usually mounted from a
//!   `ConfigMap` at `/etc/argo-events/controller-config.yaml`
//!
//! # Configuration file
//!
//! ```yaml
//! eventBus:
//!   nats:
//!     versions:
//!       - version: 0.22.1
//!         natsStreamingImage: nats-streaming:0.22.1
//!         metricsExporterImage: natsio/prometheus-nats-exporter:0.8.0
//!   jetstream:
//!     settings: |
//!       max_memory_store: -1
//!     streamConfig: |
//!       maxMsgs: 1000000
//!     maxPayload: "1048576"
//!     versions:
//!       - version: latest
//!         natsImage: nats:2.10.10
//!         metricsExporterImage: natsio/prometheus-nats-exporter:0.14.0
//!         configReloaderImage: natsio/nats-server-config-reloader:0.14.0
//!         startCommand: /nats-server
//! ```

use crate::constants::{
    DEFAULT_CONFIG_PATH, DEFAULT_HEALTH_PORT, DEFAULT_MANAGED_NAMESPACE, DEFAULT_METRICS_PORT,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

/// Process entry options.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerOptions {
    /// Restrict the cache to `managed_namespace`
    pub namespaced: bool,
    /// Namespace watched when `namespaced` is set
    pub managed_namespace: String,
    /// Compete for a lease before running the controllers
    pub leader_election: bool,
    /// Metrics endpoint port, `0` disables it
    pub metrics_port: u16,
    /// Health probe port, `0` disables it
    pub health_port: u16,
    /// Controller configuration file
    pub config_path: PathBuf,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            namespaced: false,
            managed_namespace: DEFAULT_MANAGED_NAMESPACE.to_string(),
            leader_election: false,
            metrics_port: DEFAULT_METRICS_PORT,
            health_port: DEFAULT_HEALTH_PORT,
            config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
        }
    }
}

/// Errors loading or validating the configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read
    #[error("failed to read controller configuration {path}: {source}")]
    Read {
        /// The file path
        path: PathBuf,
        /// The I/O error
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid YAML for [`ControllerConfig`]
    #[error("failed to parse controller configuration {path}: {source}")]
    Parse {
        /// The file path
        path: PathBuf,
        /// The YAML error
        #[source]
        source: serde_yaml::Error,
    },

    /// The configuration parsed but is incomplete
    #[error("invalid controller configuration: {0}")]
    Invalid(String),
}

/// The controller configuration file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerConfig {
    /// Event bus settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_bus: Option<EventBusConfig>,
}

/// Supported event bus technologies.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventBusConfig {
    /// NATS streaming
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nats: Option<StanConfig>,
    /// NATS `JetStream`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jetstream: Option<JetStreamConfig>,
}

/// NATS streaming settings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StanConfig {
    /// Supported versions
    #[serde(default)]
    pub versions: Vec<StanVersion>,
}

/// Images for one NATS streaming version.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StanVersion {
    /// Version name referenced by `EventBus` objects
    #[serde(default)]
    pub version: String,
    /// NATS streaming server image
    #[serde(default)]
    pub nats_streaming_image: String,
    /// Prometheus exporter sidecar image
    #[serde(default)]
    pub metrics_exporter_image: String,
}

/// NATS `JetStream` settings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JetStreamConfig {
    /// Server settings appended to the generated configuration
    #[serde(default)]
    pub settings: String,
    /// Default stream configuration
    #[serde(default)]
    pub stream_config: String,
    /// Maximum message payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_payload: Option<String>,
    /// Supported versions
    #[serde(default)]
    pub versions: Vec<JetStreamVersion>,
}

/// Images and entry point for one `JetStream` version.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JetStreamVersion {
    /// Version name referenced by `EventBus` objects
    #[serde(default)]
    pub version: String,
    /// NATS server image
    #[serde(default)]
    pub nats_image: String,
    /// Prometheus exporter sidecar image
    #[serde(default)]
    pub metrics_exporter_image: String,
    /// Configuration reloader sidecar image
    #[serde(default)]
    pub config_reloader_image: String,
    /// NATS server start command
    #[serde(default)]
    pub start_command: String,
}

impl ControllerConfig {
    /// Parse a configuration document.
    ///
    /// # Errors
    ///
    /// Returns the YAML error if the document does not match the schema.
    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }

    /// Check that every configured event bus technology lists at least one complete
    /// version.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let Some(event_bus) = &self.event_bus else {
            return Err(invalid("eventBus is missing"));
        };
        if event_bus.nats.is_none() && event_bus.jetstream.is_none() {
            return Err(invalid("eventBus must configure nats or jetstream"));
        }

        if let Some(nats) = &event_bus.nats {
            if nats.versions.is_empty() {
                return Err(invalid("eventBus.nats.versions is empty"));
            }
            for (index, v) in nats.versions.iter().enumerate() {
                let path = "eventBus.nats.versions";
                require(&v.version, path, index, "version")?;
                require(&v.nats_streaming_image, path, index, "natsStreamingImage")?;
                require(&v.metrics_exporter_image, path, index, "metricsExporterImage")?;
            }
        }

        if let Some(jetstream) = &event_bus.jetstream {
            if jetstream.versions.is_empty() {
                return Err(invalid("eventBus.jetstream.versions is empty"));
            }
            for (index, v) in jetstream.versions.iter().enumerate() {
                let path = "eventBus.jetstream.versions";
                require(&v.version, path, index, "version")?;
                require(&v.nats_image, path, index, "natsImage")?;
                require(&v.metrics_exporter_image, path, index, "metricsExporterImage")?;
                require(&v.config_reloader_image, path, index, "configReloaderImage")?;
                require(&v.start_command, path, index, "startCommand")?;
            }
        }

        Ok(())
    }

    /// The NATS streaming images for `version`.
    #[must_use]
    pub fn stan_version(&self, version: &str) -> Option<&StanVersion> {
        self.event_bus
            .as_ref()?
            .nats
            .as_ref()?
            .versions
            .iter()
            .find(|v| v.version == version)
    }

    /// The `JetStream` images for `version`.
    #[must_use]
    pub fn jetstream_version(&self, version: &str) -> Option<&JetStreamVersion> {
        self.event_bus
            .as_ref()?
            .jetstream
            .as_ref()?
            .versions
            .iter()
            .find(|v| v.version == version)
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

fn require(value: &str, path: &str, index: usize, field: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(invalid(format!("{path}[{index}].{field} is required")));
    }
    Ok(())
}

/// Source of the controller configuration.
#[async_trait]
pub trait ConfigLoader: Send + Sync {
    /// Load and parse the configuration. Validation is a separate step.
    async fn load(&self) -> Result<ControllerConfig, ConfigError>;
}

/// Loads the configuration from a YAML file.
#[derive(Clone, Debug)]
pub struct FileConfigLoader {
    path: PathBuf,
}

impl FileConfigLoader {
    /// Loader for the file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The configured path.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl ConfigLoader for FileConfigLoader {
    async fn load(&self) -> Result<ControllerConfig, ConfigError> {
        debug!(path = %self.path.display(), "Loading controller configuration");
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| ConfigError::Read {
                path: self.path.clone(),
                source,
            })?;
        ControllerConfig::from_yaml(&content).map_err(|source| ConfigError::Parse {
            path: self.path.clone(),
            source,
        })
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod config_tests;
