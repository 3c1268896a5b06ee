use super::{Cloud, cache_key};
use azure_client::{AzureError, CacheReadType, SecurityGroup};
use tracing::warn;

impl Cloud {
    /// The cluster security group
    pub async fn get_security_group(&self, read: CacheReadType) -> Result<Option<SecurityGroup>, AzureError> {
        let rg = self.config.security_group_resource_group();
        self.nsg_cache
            .get(&cache_key(rg, &self.config.security_group_name), read)
            .await
    }

    /// PUT the security group guarded by its ETag
    pub async fn create_or_update_security_group(&self, nsg: &SecurityGroup) -> Result<SecurityGroup, AzureError> {
        let rg = self.config.security_group_resource_group();
        let result = self
            .client
            .create_or_update_security_group(rg, nsg, nsg.etag.as_deref())
            .await;
        self.record("securityGroup", "createOrUpdate", &result);
        self.nsg_cache.delete(&cache_key(rg, &nsg.name));
        if let Err(e) = &result {
            warn!(
                "create_or_update_security_group({}) failed: {}; request body: {}",
                nsg.name,
                e,
                serde_json::to_string(nsg).unwrap_or_default()
            );
        }
        result
    }
}
