//! Cached access to the cloud resources the reconcilers read and write.
//!
//! Every read goes through a [`TimedCache`]; every write invalidates the
//! entries it touched, whether it succeeded or failed in a way that means the
//! cached copy is stale (a 412 or a write canceled by a newer one). Getters
//! return `Ok(None)` for resources that do not exist.

mod compute;
mod loadbalancer;
mod privatelink;
mod publicip;
mod securitygroup;


use crate::config::CloudConfig;
use crate::metrics::Metrics;
use azure_client::{
    AzureClientTrait, AzureError, Getter, GetterFuture, LoadBalancer, PrivateLinkService, PublicIPAddress,
    SecurityGroup, TimedCache, VirtualMachine,
};
use std::sync::Arc;
use std::time::Duration;

/// Cloud façade shared by every reconcile
pub struct Cloud {
    client: Arc<dyn AzureClientTrait>,
    config: Arc<CloudConfig>,
    metrics: Arc<Metrics>,
    lb_cache: TimedCache<LoadBalancer>,
    nsg_cache: TimedCache<SecurityGroup>,
    /// Public IPs are cached per resource group, as one list
    pip_cache: TimedCache<Vec<PublicIPAddress>>,
    /// Private link services are cached per resource group, as one list
    pls_cache: TimedCache<Vec<PrivateLinkService>>,
    vm_cache: TimedCache<VirtualMachine>,
}

impl std::fmt::Debug for Cloud {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cloud")
            .field("subscription_id", &self.client.subscription_id())
            .finish_non_exhaustive()
    }
}

/// `resource_group/name` cache key
pub(crate) fn cache_key(resource_group: &str, name: &str) -> String {
    format!("{}/{}", resource_group.to_lowercase(), name.to_lowercase())
}

fn split_key(key: &str) -> (String, String) {
    match key.split_once('/') {
        Some((rg, name)) => (rg.to_string(), name.to_string()),
        None => (String::new(), key.to_string()),
    }
}

/// Map a not-found read to `None`
fn found<T>(result: Result<T, AzureError>) -> Result<Option<T>, AzureError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

fn ttl(seconds: u64) -> Duration {
    Duration::from_secs(seconds)
}

impl Cloud {
    pub fn new(client: Arc<dyn AzureClientTrait>, config: Arc<CloudConfig>, metrics: Arc<Metrics>) -> Self {
        let c = client.clone();
        let lb_getter: Getter<LoadBalancer> = Arc::new(move |key: String| -> GetterFuture<LoadBalancer> {
            let client = c.clone();
            Box::pin(async move {
                let (rg, name) = split_key(&key);
                found(client.get_load_balancer(&rg, &name).await)
            })
        });

        let c = client.clone();
        let nsg_getter: Getter<SecurityGroup> = Arc::new(move |key: String| -> GetterFuture<SecurityGroup> {
            let client = c.clone();
            Box::pin(async move {
                let (rg, name) = split_key(&key);
                found(client.get_security_group(&rg, &name).await)
            })
        });

        let c = client.clone();
        let pip_getter: Getter<Vec<PublicIPAddress>> =
            Arc::new(move |resource_group: String| -> GetterFuture<Vec<PublicIPAddress>> {
                let client = c.clone();
                Box::pin(async move { found(client.list_public_ips(&resource_group).await) })
            });

        let c = client.clone();
        let pls_getter: Getter<Vec<PrivateLinkService>> =
            Arc::new(move |resource_group: String| -> GetterFuture<Vec<PrivateLinkService>> {
                let client = c.clone();
                Box::pin(async move { found(client.list_private_link_services(&resource_group).await) })
            });

        let c = client.clone();
        let vm_getter: Getter<VirtualMachine> = Arc::new(move |key: String| -> GetterFuture<VirtualMachine> {
            let client = c.clone();
            Box::pin(async move {
                let (rg, name) = split_key(&key);
                found(client.get_virtual_machine(&rg, &name).await)
            })
        });

        Self {
            lb_cache: TimedCache::new("load balancer", ttl(config.load_balancer_cache_ttl_in_seconds), lb_getter),
            nsg_cache: TimedCache::new("security group", ttl(config.nsg_cache_ttl_in_seconds), nsg_getter),
            pip_cache: TimedCache::new("public IP", ttl(config.public_ip_cache_ttl_in_seconds), pip_getter),
            pls_cache: TimedCache::new("private link service", ttl(config.pls_cache_ttl_in_seconds), pls_getter),
            vm_cache: TimedCache::new("virtual machine", ttl(config.vm_cache_ttl_in_seconds), vm_getter),
            client,
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &CloudConfig {
        &self.config
    }

    pub fn subscription_id(&self) -> &str {
        self.client.subscription_id()
    }

    fn record<T>(&self, resource: &str, operation: &str, result: &Result<T, AzureError>) {
        self.metrics.record_cloud_operation(resource, operation, result.is_ok());
    }
}
