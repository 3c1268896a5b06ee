//! Private link services and the subnets they take addresses from.

use super::{Cloud, found};
use azure_client::{AzureError, CacheReadType, PrivateLinkService, Subnet};
use tracing::{info, warn};

impl Cloud {
    /// The private link service attached to frontend `frontend_id`, if any
    pub async fn get_private_link_service_by_frontend(
        &self,
        frontend_id: &str,
        read: CacheReadType,
    ) -> Result<Option<PrivateLinkService>, AzureError> {
        let rg = self.config.private_link_service_resource_group().to_lowercase();
        let services = self.pls_cache.get(&rg, read).await?.unwrap_or_default();
        Ok(services.into_iter().find(|pls| {
            pls.properties
                .load_balancer_frontend_ip_configurations
                .iter()
                .any(|fip| fip.id().eq_ignore_ascii_case(frontend_id))
        }))
    }

    pub async fn create_or_update_private_link_service(
        &self,
        pls: &PrivateLinkService,
    ) -> Result<PrivateLinkService, AzureError> {
        let rg = self.config.private_link_service_resource_group();
        let result = self
            .client
            .create_or_update_private_link_service(rg, pls, pls.etag.as_deref())
            .await;
        self.record("privateLinkService", "createOrUpdate", &result);
        self.pls_cache.delete(&rg.to_lowercase());
        if let Err(e) = &result {
            warn!(
                "create_or_update_private_link_service({}) failed: {}; request body: {}",
                pls.name,
                e,
                serde_json::to_string(pls).unwrap_or_default()
            );
        }
        result
    }

    /// Delete a private link service after removing its endpoint connections
    pub async fn delete_private_link_service(&self, pls: &PrivateLinkService) -> Result<(), AzureError> {
        let rg = self.config.private_link_service_resource_group();
        for connection in &pls.properties.private_endpoint_connections {
            let result = match self
                .client
                .delete_private_endpoint_connection(rg, &pls.name, &connection.name)
                .await
            {
                Err(e) if e.is_not_found() => Ok(()),
                other => other,
            };
            self.record("privateEndpointConnection", "delete", &result);
            result?;
        }

        let result = match self.client.delete_private_link_service(rg, &pls.name).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        };
        self.record("privateLinkService", "delete", &result);
        self.pls_cache.delete(&rg.to_lowercase());
        if result.is_ok() {
            info!("deleted private link service {}", pls.name);
        }
        result
    }

    /// Subnet `name` of the cluster virtual network
    pub async fn get_subnet(&self, name: &str) -> Result<Option<Subnet>, AzureError> {
        found(
            self.client
                .get_subnet(self.config.vnet_resource_group(), &self.config.vnet_name, name)
                .await,
        )
    }

    pub async fn create_or_update_subnet(&self, subnet: &Subnet) -> Result<Subnet, AzureError> {
        let result = self
            .client
            .create_or_update_subnet(self.config.vnet_resource_group(), &self.config.vnet_name, subnet)
            .await;
        self.record("subnet", "createOrUpdate", &result);
        result
    }
}
