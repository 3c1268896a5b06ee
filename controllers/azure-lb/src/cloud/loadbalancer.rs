//! Load balancer and backend pool access.

use super::{Cloud, cache_key};
use azure_client::{AzureError, BackendAddressPool, CacheReadType, LoadBalancer};
use tracing::{debug, info, warn};

impl Cloud {
    /// Load balancer `name` in the configured load balancer resource group
    pub async fn get_load_balancer(&self, name: &str, read: CacheReadType) -> Result<Option<LoadBalancer>, AzureError> {
        let rg = self.config.load_balancer_resource_group();
        self.lb_cache.get(&cache_key(rg, name), read).await
    }

    /// Every load balancer in the load balancer resource group, read from ARM
    pub async fn list_load_balancers(&self) -> Result<Vec<LoadBalancer>, AzureError> {
        let rg = self.config.load_balancer_resource_group();
        match self.client.list_load_balancers(rg).await {
            Ok(lbs) => Ok(lbs),
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// PUT `lb` guarded by the ETag it was read with.
    ///
    /// A failure caused by a public IP that is still provisioning triggers an
    /// unchanged PUT of that IP so ARM finishes it; the original error is
    /// returned either way and the caller retries.
    pub async fn create_or_update_load_balancer(&self, lb: &LoadBalancer) -> Result<LoadBalancer, AzureError> {
        let rg = self.config.load_balancer_resource_group();
        let key = cache_key(rg, &lb.name);
        let result = self.client.create_or_update_load_balancer(rg, lb, lb.etag.as_deref()).await;
        self.record("loadBalancer", "createOrUpdate", &result);
        self.lb_cache.delete(&key);

        match result {
            Ok(updated) => {
                debug!("create_or_update_load_balancer({}): success", lb.name);
                Ok(updated)
            }
            Err(e) => {
                warn!(
                    "create_or_update_load_balancer({}) failed: {}; request body: {}",
                    lb.name,
                    e,
                    serde_json::to_string(lb).unwrap_or_default()
                );
                if let Some((pip_rg, pip_name)) = e.referenced_public_ip() {
                    warn!(
                        "load balancer {} references public IP {}/{} which is not provisioned, updating it",
                        lb.name, pip_rg, pip_name
                    );
                    if let Err(pip_err) = self.touch_public_ip(&pip_rg, &pip_name).await {
                        warn!("updating public IP {}/{} failed: {}", pip_rg, pip_name, pip_err);
                    }
                }
                Err(e)
            }
        }
    }

    /// PUT one backend pool of load balancer `lb_name`
    pub async fn create_or_update_backend_pool(
        &self,
        lb_name: &str,
        pool: &BackendAddressPool,
        etag: Option<&str>,
    ) -> Result<(), AzureError> {
        let rg = self.config.load_balancer_resource_group();
        let result = self.client.create_or_update_backend_pool(rg, lb_name, pool, etag).await;
        self.record("backendPool", "createOrUpdate", &result);
        self.lb_cache.delete(&cache_key(rg, lb_name));
        if let Err(e) = &result {
            warn!(
                "create_or_update_backend_pool({}/{}) failed: {}; request body: {}",
                lb_name,
                pool.name,
                e,
                serde_json::to_string(pool).unwrap_or_default()
            );
        }
        result
    }

    /// Drop the cached copy of `name`; NIC writes change pool membership behind it
    pub fn invalidate_load_balancer(&self, name: &str) {
        let rg = self.config.load_balancer_resource_group();
        self.lb_cache.delete(&cache_key(rg, name));
    }

    pub async fn delete_load_balancer(&self, name: &str) -> Result<(), AzureError> {
        let rg = self.config.load_balancer_resource_group();
        let result = match self.client.delete_load_balancer(rg, name).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        };
        self.record("loadBalancer", "delete", &result);
        self.lb_cache.delete(&cache_key(rg, name));
        if result.is_ok() {
            info!("deleted load balancer {}", name);
        }
        result
    }
}
