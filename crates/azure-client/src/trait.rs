//! AzureClient trait for mocking
//!
//! The concrete [`AzureClient`](crate::AzureClient) implements this trait and
//! tests use [`MockAzureClient`](crate::MockAzureClient).

use crate::error::AzureError;
use crate::models::*;

/// Trait for Azure Resource Manager operations used by the load balancer controller
///
/// Getters return [`AzureError::NotFound`] for missing resources. Writes that
/// take an `etag` send it as `If-Match`, so a concurrent writer makes them fail
/// with HTTP 412.
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait AzureClientTrait: Send + Sync {
    /// Subscription all resource IDs are built in
    fn subscription_id(&self) -> &str;

    // Load balancers
    async fn get_load_balancer(&self, resource_group: &str, name: &str) -> Result<LoadBalancer, AzureError>;
    async fn list_load_balancers(&self, resource_group: &str) -> Result<Vec<LoadBalancer>, AzureError>;
    async fn create_or_update_load_balancer(&self, resource_group: &str, lb: &LoadBalancer, etag: Option<&str>) -> Result<LoadBalancer, AzureError>;
    async fn create_or_update_backend_pool(&self, resource_group: &str, lb_name: &str, pool: &BackendAddressPool, etag: Option<&str>) -> Result<(), AzureError>;
    async fn delete_load_balancer(&self, resource_group: &str, name: &str) -> Result<(), AzureError>;

    // Public IPs
    async fn get_public_ip(&self, resource_group: &str, name: &str) -> Result<PublicIPAddress, AzureError>;
    async fn list_public_ips(&self, resource_group: &str) -> Result<Vec<PublicIPAddress>, AzureError>;
    async fn create_or_update_public_ip(&self, resource_group: &str, pip: &PublicIPAddress) -> Result<PublicIPAddress, AzureError>;
    async fn delete_public_ip(&self, resource_group: &str, name: &str) -> Result<(), AzureError>;

    // Network security groups
    async fn get_security_group(&self, resource_group: &str, name: &str) -> Result<SecurityGroup, AzureError>;
    async fn create_or_update_security_group(&self, resource_group: &str, nsg: &SecurityGroup, etag: Option<&str>) -> Result<SecurityGroup, AzureError>;

    // Private link services
    async fn list_private_link_services(&self, resource_group: &str) -> Result<Vec<PrivateLinkService>, AzureError>;
    async fn create_or_update_private_link_service(&self, resource_group: &str, pls: &PrivateLinkService, etag: Option<&str>) -> Result<PrivateLinkService, AzureError>;
    async fn delete_private_link_service(&self, resource_group: &str, name: &str) -> Result<(), AzureError>;
    async fn delete_private_endpoint_connection(&self, resource_group: &str, pls_name: &str, connection_name: &str) -> Result<(), AzureError>;

    // Virtual networks
    async fn get_subnet(&self, resource_group: &str, vnet_name: &str, name: &str) -> Result<Subnet, AzureError>;
    async fn create_or_update_subnet(&self, resource_group: &str, vnet_name: &str, subnet: &Subnet) -> Result<Subnet, AzureError>;

    // Compute
    async fn get_virtual_machine(&self, resource_group: &str, name: &str) -> Result<VirtualMachine, AzureError>;
    async fn get_network_interface(&self, resource_group: &str, name: &str) -> Result<Interface, AzureError>;
    async fn create_or_update_network_interface(&self, resource_group: &str, nic: &Interface) -> Result<Interface, AzureError>;
}
