//! Kubernetes resource watchers.
//!
//! Services are driven by a `kube_runtime::Controller`. Each reconcile
//! either converges the Service's load balancer (adding the cleanup
//! finalizer first and publishing the ingress addresses after) or tears it
//! down and releases the finalizer.
//!
//! Nodes are mirrored into a reflector store. A separate loop compares the
//! node set every [`NODE_SYNC_PERIOD`] and, when it changed, updates the
//! backend pools of every LoadBalancer Service without touching frontends.

use crate::backoff::BackoffRegistry;
use crate::consts::LOAD_BALANCER_CLEANUP_FINALIZER;
use crate::error::ControllerError;
use crate::reconciler::{LoadBalancerStatus, Reconciler};
use crate::service_view::{NodeView, ServiceView};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node, Service};
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use kube_runtime::reflector::{self, Store, store::Writer};
use kube_runtime::{Controller, WatchStreamExt, watcher, controller::{Action, Config as ControllerConfig}};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Requeue interval after a successful reconcile
pub const RESYNC_PERIOD: Duration = Duration::from_secs(600);

/// How often the node set is compared against the last one synced
pub const NODE_SYNC_PERIOD: Duration = Duration::from_secs(100);

/// State shared by every Service reconcile
pub struct Context {
    reconciler: Arc<Reconciler>,
    client: Client,
    nodes: Store<Node>,
    backoff: BackoffRegistry,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("reconciler", &self.reconciler)
            .field("nodes", &self.nodes.state().len())
            .finish_non_exhaustive()
    }
}

impl Context {
    pub fn new(reconciler: Arc<Reconciler>, client: Client, nodes: Store<Node>) -> Self {
        Self {
            reconciler,
            client,
            nodes,
            backoff: BackoffRegistry::default(),
        }
    }

    /// Current nodes, sorted by name so two snapshots compare equal when nothing moved
    fn node_views(&self) -> Vec<NodeView> {
        let mut nodes: Vec<NodeView> = self.nodes.state().iter().map(|n| NodeView::from_node(n)).collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        nodes
    }
}

/// Mirror Nodes into `writer` until the process exits
pub async fn reflect_nodes(api: Api<Node>, writer: Writer<Node>) -> Result<(), ControllerError> {
    info!("Starting Node reflector");
    reflector::reflector(writer, watcher::watcher(api, watcher::Config::default()))
        .default_backoff()
        .touched_objects()
        .for_each(|res| async move {
            if let Err(e) = res {
                warn!("Node watch error: {}", e);
            }
        })
        .await;
    Ok(())
}

/// Watch Services and keep their load balancers converged
pub async fn watch_services(api: Api<Service>, ctx: Arc<Context>) -> Result<(), ControllerError> {
    info!("Starting Service watcher");

    let controller_config = ControllerConfig::default()
        .debounce(Duration::from_secs(5))
        .concurrency(3);

    let controller = Controller::new(api, watcher::Config::default()).with_config(controller_config);
    let services = controller.store();

    let run = controller
        .run(reconcile_service, error_policy, ctx.clone())
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!("Reconciled Service {}/{}", obj.namespace.as_deref().unwrap_or_default(), obj.name),
                Err(e) => error!("Controller error for Service: {}", e),
            }
        });

    tokio::select! {
        () = run => Ok(()),
        result = sync_nodes(services, ctx) => result,
    }
}

fn error_policy(service: Arc<Service>, error: &ControllerError, ctx: Arc<Context>) -> Action {
    let key = service_key(&service);
    let (delay, failures) = ctx.backoff.record_failure(&key);
    error!(
        "Reconciliation error for Service {} (failure {}), retrying in {}s: {}",
        key,
        failures,
        delay.as_secs(),
        error
    );
    Action::requeue(delay)
}

async fn reconcile_service(service: Arc<Service>, ctx: Arc<Context>) -> Result<Action, ControllerError> {
    let key = service_key(&service);
    let has_finalizer = service.finalizers().iter().any(|f| f == LOAD_BALANCER_CLEANUP_FINALIZER);
    let view = match ServiceView::from_service(&service) {
        Ok(view) => view,
        Err(e) if !has_finalizer && !is_load_balancer_type(&service) => {
            debug!("Ignoring Service {}: {}", key, e);
            return Ok(Action::await_change());
        }
        Err(e) => return Err(e),
    };
    let api: Api<Service> = Api::namespaced(ctx.client.clone(), &view.namespace);

    if view.is_load_balancer && !view.deleting {
        if !has_finalizer {
            debug!("Adding finalizer to Service {}", key);
            patch_finalizers(&api, &service, with_finalizer(service.finalizers())).await?;
        }

        let nodes = ctx.node_views();
        let status = ctx.reconciler.ensure_load_balancer(&view, &nodes).await?;

        if status.ingress != view.ingress_ips {
            info!("Service {} load balancer ingress is now {:?}", key, status.ingress);
            patch_ingress(&api, &view.name, &status).await?;
        }
        ctx.backoff.record_success(&key);
        return Ok(Action::requeue(RESYNC_PERIOD));
    }

    if has_finalizer {
        ctx.reconciler.ensure_load_balancer_deleted(&view).await?;

        if !view.deleting && !view.ingress_ips.is_empty() {
            patch_ingress(&api, &view.name, &LoadBalancerStatus::default()).await?;
        }
        debug!("Removing finalizer from Service {}", key);
        patch_finalizers(&api, &service, without_finalizer(service.finalizers())).await?;
    }

    ctx.backoff.forget(&key);
    Ok(Action::await_change())
}

/// Update backend pools of every LoadBalancer Service whenever the node set changes
async fn sync_nodes(services: Store<Service>, ctx: Arc<Context>) -> Result<(), ControllerError> {
    ctx.nodes
        .wait_until_ready()
        .await
        .map_err(|e| ControllerError::Watch(format!("Node reflector stopped before the first sync: {}", e)))?;

    let mut synced = ctx.node_views();
    let mut ticker = tokio::time::interval(NODE_SYNC_PERIOD);
    loop {
        ticker.tick().await;
        let nodes = ctx.node_views();
        if nodes == synced {
            continue;
        }
        info!("Node set changed ({} nodes), updating load balancer backends", nodes.len());

        let mut failed = 0;
        for service in services.state() {
            let view = match ServiceView::from_service(&service) {
                Ok(view) => view,
                Err(e) => {
                    debug!("Skipping Service {}: {}", service_key(&service), e);
                    continue;
                }
            };
            if !view.is_load_balancer || view.deleting {
                continue;
            }
            if let Err(e) = ctx.reconciler.update_load_balancer(&view, &nodes).await {
                warn!("Failed to update backends of Service {}: {}", view.key(), e);
                failed += 1;
            }
        }

        // Keep the old snapshot so failed Services are retried on the next tick
        if failed == 0 {
            synced = nodes;
        }
    }
}

fn service_key(service: &Service) -> String {
    format!("{}/{}", service.namespace().unwrap_or_default(), service.name_any())
}

fn is_load_balancer_type(service: &Service) -> bool {
    service.spec.as_ref().and_then(|s| s.type_.as_deref()) == Some("LoadBalancer")
}

fn with_finalizer(finalizers: &[String]) -> Vec<String> {
    let mut finalizers = finalizers.to_vec();
    if !finalizers.iter().any(|f| f == LOAD_BALANCER_CLEANUP_FINALIZER) {
        finalizers.push(LOAD_BALANCER_CLEANUP_FINALIZER.to_string());
    }
    finalizers
}

fn without_finalizer(finalizers: &[String]) -> Vec<String> {
    finalizers
        .iter()
        .filter(|f| *f != LOAD_BALANCER_CLEANUP_FINALIZER)
        .cloned()
        .collect()
}

/// Body replacing `status.loadBalancer.ingress`
fn ingress_patch(status: &LoadBalancerStatus) -> serde_json::Value {
    let ingress: Vec<serde_json::Value> = status.ingress.iter().map(|ip| json!({ "ip": ip })).collect();
    json!({ "status": { "loadBalancer": { "ingress": ingress } } })
}

async fn patch_ingress(api: &Api<Service>, name: &str, status: &LoadBalancerStatus) -> Result<(), ControllerError> {
    api.patch_status(name, &PatchParams::default(), &Patch::Merge(&ingress_patch(status)))
        .await?;
    Ok(())
}

/// Replace the finalizer list, guarded by the resource version it was read at
async fn patch_finalizers(api: &Api<Service>, service: &Service, finalizers: Vec<String>) -> Result<(), ControllerError> {
    let patch = json!({
        "metadata": {
            "resourceVersion": service.resource_version(),
            "finalizers": finalizers,
        }
    });
    api.patch(&service.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finalizer_list_edits() {
        let others = vec!["example.com/other".to_string()];

        let added = with_finalizer(&others);
        assert_eq!(added, vec!["example.com/other", LOAD_BALANCER_CLEANUP_FINALIZER]);
        assert_eq!(with_finalizer(&added), added);

        assert_eq!(without_finalizer(&added), others);
        assert!(without_finalizer(&[]).is_empty());
    }

    #[test]
    fn test_ingress_patch_lists_every_address() {
        let status = LoadBalancerStatus {
            ingress: vec!["20.0.0.1".to_string(), "2001:db8::1".to_string()],
        };
        assert_eq!(
            ingress_patch(&status),
            json!({ "status": { "loadBalancer": { "ingress": [{ "ip": "20.0.0.1" }, { "ip": "2001:db8::1" }] } } })
        );
        assert_eq!(
            ingress_patch(&LoadBalancerStatus::default()),
            json!({ "status": { "loadBalancer": { "ingress": [] } } })
        );
    }
}
