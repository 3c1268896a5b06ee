//! Main controller implementation.
//!
//! Builds the Kubernetes and Azure clients, the cloud façade, the VM set
//! collaborator and the [`Reconciler`], then runs three tasks until one of
//! them stops: the Node reflector, the Service watcher and the metrics
//! server.

use crate::cloud::Cloud;
use crate::config::CloudConfig;
use crate::consts::CONTROLLER_NAME;
use crate::error::ControllerError;
use crate::events::KubeEventRecorder;
use crate::metrics::{self, Metrics};
use crate::reconciler::Reconciler;
use crate::vmset::AvailabilitySet;
use crate::watcher::{self, Context};
use azure_client::{AzureClient, AzureClientTrait};
use k8s_openapi::api::core::v1::{Node, Service};
use kube::{Api, Client};
use kube_runtime::reflector;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Main controller for Service load balancers.
pub struct Controller {
    node_reflector: JoinHandle<Result<(), ControllerError>>,
    service_watcher: JoinHandle<Result<(), ControllerError>>,
    metrics_server: JoinHandle<Result<(), ControllerError>>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller").finish_non_exhaustive()
    }
}

impl Controller {
    /// Creates a new controller instance and starts its tasks.
    pub async fn new(
        config: CloudConfig,
        namespace: Option<String>,
        metrics_port: u16,
    ) -> Result<Self, ControllerError> {
        info!("Initializing Azure load balancer controller");

        let kube_client = Client::try_default().await?;

        let token = config.access_token.clone().ok_or_else(|| {
            ControllerError::InvalidConfig(
                "no ARM access token: set accessToken in the cloud config or AZURE_ACCESS_TOKEN".to_string(),
            )
        })?;
        let azure_client = AzureClient::new(
            config.resource_manager_endpoint.clone(),
            config.subscription_id.clone(),
            token,
            config.retry_policy(),
        )?;

        // Fail fast on bad credentials or an unreachable endpoint
        info!("Validating Azure credentials and connectivity...");
        azure_client
            .get_security_group(config.security_group_resource_group(), &config.security_group_name)
            .await
            .map_err(|e| {
                error!("Failed to read security group {}: {}", config.security_group_name, e);
                error!("Please ensure:");
                error!("  1. The access token is valid for subscription {}", config.subscription_id);
                error!("  2. {} is reachable", config.resource_manager_endpoint);
                error!("  3. securityGroupName and its resource group are correct");
                ControllerError::Azure(e)
            })?;
        info!("Azure credentials validated");

        let metrics = Arc::new(
            Metrics::new().map_err(|e| ControllerError::InvalidConfig(format!("failed to register metrics: {}", e)))?,
        );
        let cloud = Arc::new(Cloud::new(Arc::new(azure_client), Arc::new(config), metrics.clone()));
        let vm_set = Arc::new(AvailabilitySet::new(cloud.clone()));
        let events = Arc::new(KubeEventRecorder::new(kube_client.clone(), CONTROLLER_NAME));
        let reconciler = Arc::new(Reconciler::new(cloud, vm_set, events, metrics.clone()));

        let service_api: Api<Service> = match namespace.as_deref() {
            Some(ns) => Api::namespaced(kube_client.clone(), ns),
            None => Api::all(kube_client.clone()),
        };
        let node_api: Api<Node> = Api::all(kube_client.clone());

        let (nodes, node_writer) = reflector::store::<Node>();
        let ctx = Arc::new(Context::new(reconciler, kube_client, nodes));

        let node_reflector = tokio::spawn(watcher::reflect_nodes(node_api, node_writer));
        let service_watcher = tokio::spawn(watcher::watch_services(service_api, ctx));
        let metrics_server = tokio::spawn(metrics::serve(metrics, metrics_port));

        Ok(Self {
            node_reflector,
            service_watcher,
            metrics_server,
        })
    }

    /// Runs the controller until shutdown.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("Azure load balancer controller running");

        // Every task runs forever; the first one to stop ends the process
        tokio::select! {
            result = &mut self.node_reflector => {
                result.map_err(|e| ControllerError::Watch(format!("Node reflector panicked: {}", e)))?
                    .map_err(|e| ControllerError::Watch(format!("Node reflector error: {}", e)))?;
            }
            result = &mut self.service_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("Service watcher panicked: {}", e)))?
                    .map_err(|e| ControllerError::Watch(format!("Service watcher error: {}", e)))?;
            }
            result = &mut self.metrics_server => {
                result.map_err(|e| ControllerError::Watch(format!("Metrics server panicked: {}", e)))??;
            }
        }

        error!("A controller task exited unexpectedly");
        Err(ControllerError::Watch("controller task exited".to_string()))
    }
}
