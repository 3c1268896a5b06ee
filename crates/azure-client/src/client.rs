//! Azure Resource Manager client
//!
//! Implements [`AzureClientTrait`] over the ARM REST API. Every call goes
//! through [`with_retry`], so transient failures are retried here and callers
//! only see terminal errors.

use crate::azure_trait::AzureClientTrait;
use crate::common::HttpClient;
use crate::error::AzureError;
use crate::models::*;
use crate::retry::{RetryPolicy, with_retry};
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

/// API version used for `Microsoft.Network`
pub const NETWORK_API_VERSION: &str = "2022-07-01";
/// API version used for `Microsoft.Compute`
pub const COMPUTE_API_VERSION: &str = "2022-08-01";

/// Public-cloud ARM endpoint
pub const DEFAULT_RESOURCE_MANAGER_ENDPOINT: &str = "https://management.azure.com";

/// Azure Resource Manager client
#[derive(Debug)]
pub struct AzureClient {
    http: HttpClient,
    subscription_id: String,
    retry: RetryPolicy,
}

impl AzureClient {
    /// Create a new ARM client
    ///
    /// # Arguments
    /// * `endpoint` - Resource manager endpoint (e.g., "https://management.azure.com")
    /// * `subscription_id` - Subscription that owns every resource this client touches
    /// * `token` - Bearer token for ARM
    /// * `retry` - Backoff applied to transient failures
    pub fn new(endpoint: String, subscription_id: String, token: String, retry: RetryPolicy) -> Result<Self, AzureError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(AzureError::Http)?;

        Ok(Self {
            http: HttpClient::new(client, endpoint, token),
            subscription_id,
            retry,
        })
    }

    /// Get the ARM endpoint
    pub fn base_url(&self) -> &str {
        self.http.base_url()
    }

    fn network_path(&self, resource_group: &str, resource: &str) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Network/{}",
            self.subscription_id,
            urlencoding::encode(resource_group),
            resource
        )
    }

    fn compute_path(&self, resource_group: &str, resource: &str) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Compute/{}",
            self.subscription_id,
            urlencoding::encode(resource_group),
            resource
        )
    }

    async fn get_network<T: serde::de::DeserializeOwned>(&self, op: &str, path: String) -> Result<T, AzureError> {
        with_retry(&self.retry, op, || self.http.get::<T>(&path, NETWORK_API_VERSION)).await
    }

    async fn list_network<T: serde::de::DeserializeOwned>(&self, op: &str, path: String) -> Result<Vec<T>, AzureError> {
        match with_retry(&self.retry, op, || self.http.list::<T>(&path, NETWORK_API_VERSION)).await {
            // A missing resource group simply has nothing in it
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            other => other,
        }
    }

    async fn put_network<B, T>(&self, op: &str, path: String, body: &B, etag: Option<&str>) -> Result<T, AzureError>
    where
        B: serde::Serialize + Sync,
        T: serde::de::DeserializeOwned,
    {
        with_retry(&self.retry, op, || self.http.put::<B, T>(&path, NETWORK_API_VERSION, body, etag)).await
    }

    async fn delete_network(&self, op: &str, path: String) -> Result<(), AzureError> {
        with_retry(&self.retry, op, || self.http.delete(&path, NETWORK_API_VERSION)).await
    }
}

#[async_trait::async_trait]
impl AzureClientTrait for AzureClient {
    fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    async fn get_load_balancer(&self, resource_group: &str, name: &str) -> Result<LoadBalancer, AzureError> {
        let path = self.network_path(resource_group, &format!("loadBalancers/{}", urlencoding::encode(name)));
        self.get_network("LoadBalancers.Get", path).await
    }

    async fn list_load_balancers(&self, resource_group: &str) -> Result<Vec<LoadBalancer>, AzureError> {
        let path = self.network_path(resource_group, "loadBalancers");
        let lbs: Vec<LoadBalancer> = self.list_network("LoadBalancers.List", path).await?;
        debug!("Listed {} load balancers in {}", lbs.len(), resource_group);
        Ok(lbs)
    }

    async fn create_or_update_load_balancer(&self, resource_group: &str, lb: &LoadBalancer, etag: Option<&str>) -> Result<LoadBalancer, AzureError> {
        let path = self.network_path(resource_group, &format!("loadBalancers/{}", urlencoding::encode(&lb.name)));
        self.put_network("LoadBalancers.CreateOrUpdate", path, lb, etag).await
    }

    async fn create_or_update_backend_pool(&self, resource_group: &str, lb_name: &str, pool: &BackendAddressPool, etag: Option<&str>) -> Result<(), AzureError> {
        let path = self.network_path(
            resource_group,
            &format!(
                "loadBalancers/{}/backendAddressPools/{}",
                urlencoding::encode(lb_name),
                urlencoding::encode(&pool.name)
            ),
        );
        let _: BackendAddressPool = self.put_network("LoadBalancers.CreateOrUpdateBackendPool", path, pool, etag).await?;
        Ok(())
    }

    async fn delete_load_balancer(&self, resource_group: &str, name: &str) -> Result<(), AzureError> {
        let path = self.network_path(resource_group, &format!("loadBalancers/{}", urlencoding::encode(name)));
        self.delete_network("LoadBalancers.Delete", path).await
    }

    async fn get_public_ip(&self, resource_group: &str, name: &str) -> Result<PublicIPAddress, AzureError> {
        let path = self.network_path(resource_group, &format!("publicIPAddresses/{}", urlencoding::encode(name)));
        self.get_network("PublicIPAddresses.Get", path).await
    }

    async fn list_public_ips(&self, resource_group: &str) -> Result<Vec<PublicIPAddress>, AzureError> {
        let path = self.network_path(resource_group, "publicIPAddresses");
        self.list_network("PublicIPAddresses.List", path).await
    }

    async fn create_or_update_public_ip(&self, resource_group: &str, pip: &PublicIPAddress) -> Result<PublicIPAddress, AzureError> {
        let path = self.network_path(resource_group, &format!("publicIPAddresses/{}", urlencoding::encode(&pip.name)));
        self.put_network("PublicIPAddresses.CreateOrUpdate", path, pip, None).await
    }

    async fn delete_public_ip(&self, resource_group: &str, name: &str) -> Result<(), AzureError> {
        let path = self.network_path(resource_group, &format!("publicIPAddresses/{}", urlencoding::encode(name)));
        self.delete_network("PublicIPAddresses.Delete", path).await
    }

    async fn get_security_group(&self, resource_group: &str, name: &str) -> Result<SecurityGroup, AzureError> {
        let path = self.network_path(resource_group, &format!("networkSecurityGroups/{}", urlencoding::encode(name)));
        self.get_network("SecurityGroups.Get", path).await
    }

    async fn create_or_update_security_group(&self, resource_group: &str, nsg: &SecurityGroup, etag: Option<&str>) -> Result<SecurityGroup, AzureError> {
        let path = self.network_path(resource_group, &format!("networkSecurityGroups/{}", urlencoding::encode(&nsg.name)));
        self.put_network("SecurityGroups.CreateOrUpdate", path, nsg, etag).await
    }

    async fn list_private_link_services(&self, resource_group: &str) -> Result<Vec<PrivateLinkService>, AzureError> {
        let path = self.network_path(resource_group, "privateLinkServices");
        self.list_network("PrivateLinkServices.List", path).await
    }

    async fn create_or_update_private_link_service(&self, resource_group: &str, pls: &PrivateLinkService, etag: Option<&str>) -> Result<PrivateLinkService, AzureError> {
        let path = self.network_path(resource_group, &format!("privateLinkServices/{}", urlencoding::encode(&pls.name)));
        self.put_network("PrivateLinkServices.CreateOrUpdate", path, pls, etag).await
    }

    async fn delete_private_link_service(&self, resource_group: &str, name: &str) -> Result<(), AzureError> {
        let path = self.network_path(resource_group, &format!("privateLinkServices/{}", urlencoding::encode(name)));
        self.delete_network("PrivateLinkServices.Delete", path).await
    }

    async fn delete_private_endpoint_connection(&self, resource_group: &str, pls_name: &str, connection_name: &str) -> Result<(), AzureError> {
        let path = self.network_path(
            resource_group,
            &format!(
                "privateLinkServices/{}/privateEndpointConnections/{}",
                urlencoding::encode(pls_name),
                urlencoding::encode(connection_name)
            ),
        );
        self.delete_network("PrivateLinkServices.DeletePEConnection", path).await
    }

    async fn get_subnet(&self, resource_group: &str, vnet_name: &str, name: &str) -> Result<Subnet, AzureError> {
        let path = self.network_path(
            resource_group,
            &format!("virtualNetworks/{}/subnets/{}", urlencoding::encode(vnet_name), urlencoding::encode(name)),
        );
        self.get_network("Subnets.Get", path).await
    }

    async fn create_or_update_subnet(&self, resource_group: &str, vnet_name: &str, subnet: &Subnet) -> Result<Subnet, AzureError> {
        let path = self.network_path(
            resource_group,
            &format!("virtualNetworks/{}/subnets/{}", urlencoding::encode(vnet_name), urlencoding::encode(&subnet.name)),
        );
        self.put_network("Subnets.CreateOrUpdate", path, subnet, None).await
    }

    async fn get_virtual_machine(&self, resource_group: &str, name: &str) -> Result<VirtualMachine, AzureError> {
        let path = self.compute_path(resource_group, &format!("virtualMachines/{}", urlencoding::encode(name)));
        with_retry(&self.retry, "VirtualMachines.Get", || self.http.get::<VirtualMachine>(&path, COMPUTE_API_VERSION)).await
    }

    async fn get_network_interface(&self, resource_group: &str, name: &str) -> Result<Interface, AzureError> {
        let path = self.network_path(resource_group, &format!("networkInterfaces/{}", urlencoding::encode(name)));
        self.get_network("Interfaces.Get", path).await
    }

    async fn create_or_update_network_interface(&self, resource_group: &str, nic: &Interface) -> Result<Interface, AzureError> {
        let path = self.network_path(resource_group, &format!("networkInterfaces/{}", urlencoding::encode(&nic.name)));
        self.put_network("Interfaces.CreateOrUpdate", path, nic, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> AzureClient {
        AzureClient::new(server.uri(), "sub".to_string(), "token".to_string(), RetryPolicy::no_retry()).unwrap()
    }

    #[tokio::test]
    async fn test_get_load_balancer() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Network/loadBalancers/kubernetes"))
            .and(header("Authorization", "Bearer token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "kubernetes",
                "etag": "W/\"1\"",
                "sku": {"name": "Standard"},
                "properties": {
                    "frontendIPConfigurations": [{"name": "default-web", "properties": {"publicIPAddress": {"id": "/pip"}}}]
                }
            })))
            .mount(&server)
            .await;

        let lb = client_for(&server).get_load_balancer("rg", "kubernetes").await.unwrap();
        assert_eq!(lb.name, "kubernetes");
        assert_eq!(lb.etag.as_deref(), Some("W/\"1\""));
        assert!(lb.is_standard());
        assert_eq!(lb.properties.frontend_ip_configurations[0].properties.public_ip_address, Some(SubResource::new("/pip")));
    }

    #[tokio::test]
    async fn test_get_missing_resource_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
                "error": {"code": "ResourceNotFound", "message": "not found"}
            })))
            .mount(&server)
            .await;

        let err = client_for(&server).get_public_ip("rg", "pip").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_put_sends_if_match_and_maps_412() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(header("If-Match", "stale"))
            .respond_with(ResponseTemplate::new(412).set_body_json(serde_json::json!({
                "error": {"code": "PreconditionFailed", "message": "etag mismatch"}
            })))
            .mount(&server)
            .await;

        let lb = LoadBalancer {
            name: "kubernetes".to_string(),
            ..Default::default()
        };
        let err = client_for(&server)
            .create_or_update_load_balancer("rg", &lb, Some("stale"))
            .await
            .unwrap_err();
        assert!(err.is_precondition_failed());
    }

    #[tokio::test]
    async fn test_list_follows_next_link() {
        let server = MockServer::start().await;
        let next = format!("{}/page2", server.uri());
        Mock::given(method("GET"))
            .and(path("/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Network/publicIPAddresses"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "value": [{"name": "a"}],
                "nextLink": next,
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/page2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "value": [{"name": "b"}]
            })))
            .mount(&server)
            .await;

        let pips = client_for(&server).list_public_ips("rg").await.unwrap();
        let names: Vec<_> = pips.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_delete_missing_resource_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        assert!(client_for(&server).delete_load_balancer("rg", "gone").await.is_ok());
    }
}
