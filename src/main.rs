// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

use anyhow::Result;
use clap::Parser;
use events_controller::{
    bootstrap::{self, Dependencies},
    config::ControllerOptions,
    constants::{
        DEFAULT_CONFIG_PATH, DEFAULT_HEALTH_PORT, DEFAULT_MANAGED_NAMESPACE,
        DEFAULT_METRICS_PORT, TOKIO_WORKER_THREADS,
    },
};
use std::path::PathBuf;
use tracing::{debug, error};

/// Controller manager for `EventBus`, `EventSource` and `Sensor` resources.
#[derive(Parser, Debug)]
#[command(name = "events-controller", version, about)]
struct Cli {
    /// Only watch objects in the managed namespace
    #[arg(long)]
    namespaced: bool,

    /// Namespace watched with --namespaced
    #[arg(long, env = "NAMESPACE", default_value = DEFAULT_MANAGED_NAMESPACE)]
    managed_namespace: String,

    /// Compete for a Lease before running the controllers
    #[arg(long)]
    leader_election: bool,

    /// Port for the /metrics endpoint, 0 disables it
    #[arg(long, default_value_t = DEFAULT_METRICS_PORT)]
    metrics_port: u16,

    /// Port for the /healthz and /readyz endpoints, 0 disables it
    #[arg(long, default_value_t = DEFAULT_HEALTH_PORT)]
    health_port: u16,

    /// Controller configuration file
    #[arg(long = "config", default_value = DEFAULT_CONFIG_PATH)]
    config_path: PathBuf,
}

impl From<Cli> for ControllerOptions {
    fn from(cli: Cli) -> Self {
        Self {
            namespaced: cli.namespaced,
            managed_namespace: cli.managed_namespace,
            leader_election: cli.leader_election,
            metrics_port: cli.metrics_port,
            health_port: cli.health_port,
            config_path: cli.config_path,
        }
    }
}

fn main() -> Result<()> {
    let options = ControllerOptions::from(Cli::parse());

    // Build Tokio runtime with custom thread names
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(TOKIO_WORKER_THREADS)
        .thread_name("events-controller")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(options))
}

async fn async_main(options: ControllerOptions) -> Result<()> {
    // Format: timestamp file:line LEVEL message
    // Respects RUST_LOG (default info) and RUST_LOG_FORMAT (text or json)
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let log_format = std::env::var("RUST_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    match log_format.to_lowercase().as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_file(true)
                .with_line_number(true)
                .with_thread_names(true)
                .with_target(false)
                .json()
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_file(true)
                .with_line_number(true)
                .with_thread_names(true)
                .with_target(false)
                .with_ansi(true)
                .compact()
                .init();
        }
    }

    debug!(?options, "Logging initialized");

    let deps = Dependencies::production(&options);
    if let Err(e) = bootstrap::start(&options, &deps).await {
        error!("Controller manager failed: {:#}", anyhow::Error::from(e));
        std::process::exit(1);
    }

    Ok(())
}
