//! Azure Load Balancer Controller
//!
//! Reconciles Kubernetes Services of type `LoadBalancer` onto Azure:
//! - Load balancers: frontends, backend pools, probes and rules
//! - The cluster network security group: inbound rules per Service port
//! - Public IPs owned or shared by Services
//! - Private link services attached to internal frontends

mod annotations;
mod backoff;
mod cloud;
mod config;
mod consts;
mod controller;
mod error;
mod events;
mod metrics;
mod naming;
mod reconciler;
mod service_view;
mod tags;
#[cfg(test)]
mod test_utils;
mod vmset;
mod watcher;

use crate::config::{CloudConfig, DEFAULT_CONFIG_FILE};
use crate::error::ControllerError;
use controller::Controller;
use std::env;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("A rustls crypto provider was already installed");
    }

    info!("Starting Azure Load Balancer Controller");

    let config_file = env::var("AZURE_CONFIG_FILE").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
    let config = CloudConfig::load(&config_file).await?;
    let namespace = env::var("WATCH_NAMESPACE").ok().filter(|ns| !ns.is_empty());
    let metrics_port = match env::var("METRICS_PORT") {
        Ok(port) => port
            .parse()
            .map_err(|e| ControllerError::InvalidConfig(format!("invalid METRICS_PORT {:?}: {}", port, e)))?,
        Err(_) => metrics::DEFAULT_METRICS_PORT,
    };

    info!("Configuration:");
    info!("  Config file: {}", config_file);
    info!("  Cluster: {}", config.cluster_name);
    info!("  Resource group: {} ({})", config.resource_group, config.location);
    info!("  Load balancer SKU: {}", config.load_balancer_sku);
    info!("  Namespace: {}", namespace.as_deref().unwrap_or("all namespaces"));
    info!("  Metrics port: {}", metrics_port);

    let controller = Controller::new(config, namespace, metrics_port).await?;
    controller.run().await?;

    Ok(())
}
