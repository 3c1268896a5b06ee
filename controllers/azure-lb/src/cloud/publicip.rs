//! Public IP access. The cache holds one list per resource group.

use super::Cloud;
use azure_client::{AzureError, CacheReadType, PublicIPAddress};
use tracing::{info, warn};

impl Cloud {
    /// Public IPs of `resource_group`
    pub async fn list_public_ips(
        &self,
        resource_group: &str,
        read: CacheReadType,
    ) -> Result<Vec<PublicIPAddress>, AzureError> {
        Ok(self
            .pip_cache
            .get(&resource_group.to_lowercase(), read)
            .await?
            .unwrap_or_default())
    }

    pub async fn get_public_ip(
        &self,
        resource_group: &str,
        name: &str,
        read: CacheReadType,
    ) -> Result<Option<PublicIPAddress>, AzureError> {
        Ok(self
            .list_public_ips(resource_group, read)
            .await?
            .into_iter()
            .find(|pip| pip.name.eq_ignore_ascii_case(name)))
    }

    pub async fn create_or_update_public_ip(
        &self,
        resource_group: &str,
        pip: &PublicIPAddress,
    ) -> Result<PublicIPAddress, AzureError> {
        let result = self.client.create_or_update_public_ip(resource_group, pip).await;
        self.record("publicIP", "createOrUpdate", &result);
        self.pip_cache.delete(&resource_group.to_lowercase());
        if let Err(e) = &result {
            warn!(
                "create_or_update_public_ip({}/{}) failed: {}; request body: {}",
                resource_group,
                pip.name,
                e,
                serde_json::to_string(pip).unwrap_or_default()
            );
        }
        result
    }

    /// Delete a public IP. An IP that something still references is left for
    /// a later reconcile and reported as deleted.
    pub async fn delete_public_ip(&self, resource_group: &str, name: &str) -> Result<(), AzureError> {
        let result = match self.client.delete_public_ip(resource_group, name).await {
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) if e.is_cannot_delete_public_ip() => {
                warn!("public IP {}/{} is still referenced, leaving it: {}", resource_group, name, e);
                Ok(())
            }
            other => other,
        };
        self.record("publicIP", "delete", &result);
        self.pip_cache.delete(&resource_group.to_lowercase());
        if result.is_ok() {
            info!("deleted public IP {}/{}", resource_group, name);
        }
        result
    }

    /// PUT a public IP unchanged so ARM finishes provisioning it
    pub(super) async fn touch_public_ip(&self, resource_group: &str, name: &str) -> Result<(), AzureError> {
        let pip = self.client.get_public_ip(resource_group, name).await?;
        let result = self.client.create_or_update_public_ip(resource_group, &pip).await.map(|_| ());
        self.record("publicIP", "createOrUpdate", &result);
        self.pip_cache.delete(&resource_group.to_lowercase());
        result
    }
}
