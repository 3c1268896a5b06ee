//! Service-level entry points: ensure, update, delete and status.

use super::{LoadBalancerStatus, Reconciler};
use crate::error::ControllerError;
use crate::events::{actions, reasons};
use crate::service_view::{NodeView, ServiceView};
use std::time::Instant;
use tracing::{debug, info, warn};

impl Reconciler {
    /// Status of `service` on the load balancer currently serving it
    pub async fn get_load_balancer(&self, service: &ServiceView) -> Result<Option<LoadBalancerStatus>, ControllerError> {
        let (_, status, exists) = self.get_service_load_balancer(service, None, false).await?;
        Ok(status.filter(|_| exists))
    }

    /// Create or update everything `service` needs and return its ingress status
    pub async fn ensure_load_balancer(
        &self,
        service: &ServiceView,
        nodes: &[NodeView],
    ) -> Result<LoadBalancerStatus, ControllerError> {
        let start = Instant::now();
        info!("ensuring load balancer for {} with {} nodes", service.key(), nodes.len());
        self.normal_event(service, reasons::ENSURING_LOAD_BALANCER, actions::ENSURE, None)
            .await;

        let result = self.ensure_service(service, nodes).await;
        self.metrics
            .record_reconcile("ensure", result.is_ok(), start.elapsed());

        match &result {
            Ok(status) => {
                info!(
                    "ensured load balancer for {} in {:?}: {:?}",
                    service.key(),
                    start.elapsed(),
                    status.ingress
                );
                self.normal_event(service, reasons::ENSURED_LOAD_BALANCER, actions::ENSURE, None)
                    .await;
            }
            Err(e) => {
                self.warn_event(service, reasons::SYNC_LOAD_BALANCER_FAILED, actions::ENSURE, e.to_string())
                    .await;
            }
        }
        result
    }

    async fn ensure_service(&self, service: &ServiceView, nodes: &[NodeView]) -> Result<LoadBalancerStatus, ControllerError> {
        let lb = self
            .reconcile_load_balancer(service, Some(nodes), true)
            .await?
            .ok_or_else(|| ControllerError::Reconciliation(format!("no load balancer was kept for {}", service.key())))?;

        let (status, owned) = self.service_load_balancer_status(service, &lb).await?;
        let status = status.ok_or_else(|| {
            ControllerError::Reconciliation(format!("load balancer {} has no address for {} yet", lb.name, service.key()))
        })?;
        let service_ip = status.ingress.first().map(String::as_str);

        self.reconcile_security_group(service, service_ip, Some(&lb.name), true)
            .await?;

        if let Some(fip) = owned.first() {
            self.reconcile_private_link_service(service, fip, true).await?;
        }

        // A Service that switched between internal and external leaves a frontend behind
        self.reconcile_load_balancer(&service.flip_internal(), None, false)
            .await?;

        self.reconcile_public_ips(service, true).await?;
        Ok(status)
    }

    /// Apply node changes to a Service that already has a load balancer
    pub async fn update_load_balancer(&self, service: &ServiceView, nodes: &[NodeView]) -> Result<(), ControllerError> {
        if !service.is_load_balancer || service.deleting {
            debug!("{} is not an active LoadBalancer service, skipping update", service.key());
            return Ok(());
        }
        if self.get_load_balancer(service).await?.is_none() {
            debug!("{} has no load balancer yet, skipping update", service.key());
            return Ok(());
        }
        self.ensure_load_balancer(service, nodes).await.map(|_| ())
    }

    /// Remove everything `service` created. Resources shared with other
    /// Services and user-assigned public IPs are left in place.
    pub async fn ensure_load_balancer_deleted(&self, service: &ServiceView) -> Result<(), ControllerError> {
        let start = Instant::now();
        info!("deleting load balancer resources of {}", service.key());
        self.normal_event(service, reasons::DELETING_LOAD_BALANCER, actions::DELETE, None)
            .await;

        let result = self.delete_service(service).await;
        self.metrics
            .record_reconcile("delete", result.is_ok(), start.elapsed());

        match &result {
            Ok(()) => {
                self.normal_event(service, reasons::DELETED_LOAD_BALANCER, actions::DELETE, None)
                    .await;
            }
            Err(e) => {
                self.warn_event(service, reasons::DELETE_LOAD_BALANCER_FAILED, actions::DELETE, e.to_string())
                    .await;
            }
        }
        result
    }

    async fn delete_service(&self, service: &ServiceView) -> Result<(), ControllerError> {
        let service_ip = match service
            .load_balancer_ip
            .clone()
            .or_else(|| service.ingress_ips.first().cloned())
        {
            Some(ip) => Some(ip),
            None => match self.get_load_balancer(service).await {
                Ok(status) => status.and_then(|s| s.ingress.into_iter().next()),
                Err(e) if e.is_forbidden_or_ignored() => {
                    warn!("cannot read the load balancer of {}, continuing: {}", service.key(), e);
                    None
                }
                Err(e) => return Err(e),
            },
        };

        self.reconcile_security_group(service, service_ip.as_deref(), None, false)
            .await?;

        match self.reconcile_load_balancer(service, None, false).await {
            Ok(_) => {}
            Err(e) if e.is_forbidden_or_ignored() => {
                warn!("load balancer of {} cannot be changed, continuing: {}", service.key(), e);
            }
            Err(e) => return Err(e),
        }

        self.reconcile_public_ips(service, false).await?;
        Ok(())
    }
}
