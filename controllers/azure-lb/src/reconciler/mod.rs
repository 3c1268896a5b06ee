//! Service load balancer reconciliation.
//!
//! A [`Reconciler`] converges the cloud side of one Service at a time:
//!
//! 1. the load balancer: backend pool, frontend, probes and rules
//! 2. the cluster security group rules for the Service's addresses
//! 3. the private link service attached to an internal frontend
//! 4. the opposite (internal or external) load balancer, which must not keep a frontend for the Service
//! 5. the public IPs the Service owns
//!
//! Each step lives in its own file and is written to be idempotent: reading
//! the current state, computing the desired state, and writing only when the
//! two differ. Writes carry the ETag they were read with, so a concurrent
//! writer makes the step fail with a precondition error and the next
//! reconcile starts over from fresh reads.

mod backendpool;
mod frontend;
mod loadbalancer;
mod privatelink;
mod publicip;
mod rules;
mod securitygroup;
mod service;

#[cfg(test)]
mod privatelink_test;
#[cfg(test)]
mod publicip_test;
#[cfg(test)]
mod securitygroup_test;

use crate::cloud::Cloud;
use crate::config::CloudConfig;
use crate::events::EventRecorder;
use crate::metrics::Metrics;
use crate::service_view::ServiceView;
use crate::vmset::VMSet;
use kube::runtime::events::EventType;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tokio::sync::Mutex;

/// Addresses written into the Service's `status.loadBalancer.ingress`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadBalancerStatus {
    pub ingress: Vec<String>,
}

/// Converges the Azure resources of LoadBalancer Services
pub struct Reconciler {
    cloud: Arc<Cloud>,
    vm_set: Arc<dyn VMSet>,
    events: Arc<dyn EventRecorder>,
    metrics: Arc<Metrics>,
    /// Set once the primary load balancer has been cleaned of VM sets that
    /// moved onto it
    shared_lb_synced: AtomicBool,
    shared_lb_lock: Mutex<()>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("cloud", &self.cloud)
            .field("primary_vm_set", &self.vm_set.primary_vm_set_name())
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    pub fn new(
        cloud: Arc<Cloud>,
        vm_set: Arc<dyn VMSet>,
        events: Arc<dyn EventRecorder>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            cloud,
            vm_set,
            events,
            metrics,
            shared_lb_synced: AtomicBool::new(false),
            shared_lb_lock: Mutex::new(()),
        }
    }

    fn config(&self) -> &CloudConfig {
        self.cloud.config()
    }

    fn cluster_name(&self) -> &str {
        &self.config().cluster_name
    }

    async fn warn_event(&self, service: &ServiceView, reason: &str, action: &str, note: String) {
        self.events
            .publish(&service.object_ref(), EventType::Warning, reason, action, Some(note))
            .await;
    }

    async fn normal_event(&self, service: &ServiceView, reason: &str, action: &str, note: Option<String>) {
        self.events
            .publish(&service.object_ref(), EventType::Normal, reason, action, note)
            .await;
    }

    fn load_balancer_id(&self, lb_name: &str) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Network/loadBalancers/{}",
            self.cloud.subscription_id(),
            self.config().load_balancer_resource_group(),
            lb_name
        )
    }

    fn backend_pool_id(&self, lb_name: &str) -> String {
        format!(
            "{}/backendAddressPools/{}",
            self.load_balancer_id(lb_name),
            crate::naming::backend_pool_name(self.cluster_name())
        )
    }

    fn frontend_id(&self, lb_name: &str, fip_name: &str) -> String {
        format!("{}/frontendIPConfigurations/{}", self.load_balancer_id(lb_name), fip_name)
    }

    fn probe_id(&self, lb_name: &str, probe_name: &str) -> String {
        format!("{}/probes/{}", self.load_balancer_id(lb_name), probe_name)
    }

    /// Resource group holding the Service's public IPs
    fn public_ip_resource_group(&self, service: &ServiceView) -> String {
        service
            .options
            .pip_resource_group
            .clone()
            .unwrap_or_else(|| self.config().resource_group.clone())
    }
}
