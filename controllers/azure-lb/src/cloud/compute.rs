use super::{Cloud, cache_key, found};
use azure_client::{AzureError, CacheReadType, Interface, VirtualMachine};
use tracing::warn;

impl Cloud {
    /// VM backing node `name` in the cluster resource group
    pub async fn get_virtual_machine(&self, name: &str, read: CacheReadType) -> Result<Option<VirtualMachine>, AzureError> {
        self.vm_cache
            .get(&cache_key(&self.config.resource_group, name), read)
            .await
    }

    pub async fn get_network_interface(&self, resource_group: &str, name: &str) -> Result<Option<Interface>, AzureError> {
        found(self.client.get_network_interface(resource_group, name).await)
    }

    pub async fn create_or_update_network_interface(
        &self,
        resource_group: &str,
        nic: &Interface,
    ) -> Result<Interface, AzureError> {
        let result = self.client.create_or_update_network_interface(resource_group, nic).await;
        self.record("networkInterface", "createOrUpdate", &result);
        if let Err(e) = &result {
            warn!("create_or_update_network_interface({}/{}) failed: {}", resource_group, nic.name, e);
        }
        result
    }
}
