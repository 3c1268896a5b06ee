//! Mock AzureClient for unit testing
//!
//! This module provides a mock implementation of AzureClientTrait that can be used
//! in unit tests without talking to Azure Resource Manager.
//!
//! The mock is organized into resource-specific modules:
//! - `network.rs` - load balancers, backend pools, public IPs, NSGs, private link services, subnets
//! - `compute.rs` - virtual machines and network interfaces
//!
//! Writes behave like ARM where it matters to callers: every successful write
//! assigns a fresh ETag, a write carrying a stale ETag fails with 412, and
//! resource IDs are filled in. Errors can be queued per operation with
//! [`MockAzureClient::fail_next`].

mod compute;
mod network;

use crate::azure_trait::AzureClientTrait;
use crate::error::AzureError;
use crate::models::*;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// Mock AzureClient for testing
///
/// This mock stores resources in memory, keyed case-insensitively by resource
/// group and name, and records every mutating call.
#[derive(Clone, Debug)]
pub struct MockAzureClient {
    pub(crate) subscription_id: String,
    // In-memory storage for resources
    pub(crate) load_balancers: Arc<Mutex<HashMap<String, LoadBalancer>>>,
    pub(crate) public_ips: Arc<Mutex<HashMap<String, PublicIPAddress>>>,
    pub(crate) security_groups: Arc<Mutex<HashMap<String, SecurityGroup>>>,
    pub(crate) private_link_services: Arc<Mutex<HashMap<String, PrivateLinkService>>>,
    pub(crate) subnets: Arc<Mutex<HashMap<String, Subnet>>>,
    pub(crate) virtual_machines: Arc<Mutex<HashMap<String, VirtualMachine>>>,
    pub(crate) network_interfaces: Arc<Mutex<HashMap<String, Interface>>>,
    // Queued failures per operation name
    pub(crate) failures: Arc<Mutex<HashMap<String, VecDeque<AzureError>>>>,
    // Mutating calls in order, e.g. "create_or_update_load_balancer rg/kubernetes"
    pub(crate) calls: Arc<Mutex<Vec<String>>>,
    // Counter for allocating addresses
    pub(crate) next_id: Arc<Mutex<u32>>,
}

impl MockAzureClient {
    /// Create a new mock client
    pub fn new(subscription_id: impl Into<String>) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            load_balancers: Arc::new(Mutex::new(HashMap::new())),
            public_ips: Arc::new(Mutex::new(HashMap::new())),
            security_groups: Arc::new(Mutex::new(HashMap::new())),
            private_link_services: Arc::new(Mutex::new(HashMap::new())),
            subnets: Arc::new(Mutex::new(HashMap::new())),
            virtual_machines: Arc::new(Mutex::new(HashMap::new())),
            network_interfaces: Arc::new(Mutex::new(HashMap::new())),
            failures: Arc::new(Mutex::new(HashMap::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            next_id: Arc::new(Mutex::new(1)),
        }
    }

    /// Add a load balancer to the mock store (for test setup)
    pub fn add_load_balancer(&self, resource_group: &str, mut lb: LoadBalancer) {
        network::fill_load_balancer_ids(self, resource_group, &mut lb);
        if lb.etag.is_none() {
            lb.etag = Some(new_etag());
        }
        self.load_balancers.lock().unwrap().insert(key(resource_group, &lb.name), lb);
    }

    /// Add a public IP to the mock store (for test setup)
    pub fn add_public_ip(&self, resource_group: &str, mut pip: PublicIPAddress) {
        pip.id.get_or_insert_with(|| self.network_id(resource_group, "publicIPAddresses", &pip.name));
        pip.etag.get_or_insert_with(new_etag);
        self.public_ips.lock().unwrap().insert(key(resource_group, &pip.name), pip);
    }

    /// Add a network security group to the mock store (for test setup)
    pub fn add_security_group(&self, resource_group: &str, mut nsg: SecurityGroup) {
        nsg.id.get_or_insert_with(|| self.network_id(resource_group, "networkSecurityGroups", &nsg.name));
        nsg.etag.get_or_insert_with(new_etag);
        self.security_groups.lock().unwrap().insert(key(resource_group, &nsg.name), nsg);
    }

    /// Add a private link service to the mock store (for test setup)
    pub fn add_private_link_service(&self, resource_group: &str, mut pls: PrivateLinkService) {
        pls.id.get_or_insert_with(|| self.network_id(resource_group, "privateLinkServices", &pls.name));
        pls.etag.get_or_insert_with(new_etag);
        self.private_link_services.lock().unwrap().insert(key(resource_group, &pls.name), pls);
    }

    /// Add a subnet to the mock store (for test setup)
    pub fn add_subnet(&self, resource_group: &str, vnet_name: &str, mut subnet: Subnet) {
        subnet.id.get_or_insert_with(|| {
            self.network_id(resource_group, "virtualNetworks", &format!("{}/subnets/{}", vnet_name, subnet.name))
        });
        self.subnets
            .lock()
            .unwrap()
            .insert(subnet_key(resource_group, vnet_name, &subnet.name), subnet);
    }

    /// Add a virtual machine to the mock store (for test setup)
    pub fn add_virtual_machine(&self, resource_group: &str, mut vm: VirtualMachine) {
        vm.id.get_or_insert_with(|| {
            format!(
                "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Compute/virtualMachines/{}",
                self.subscription_id, resource_group, vm.name
            )
        });
        self.virtual_machines.lock().unwrap().insert(key(resource_group, &vm.name), vm);
    }

    /// Add a network interface to the mock store (for test setup)
    pub fn add_network_interface(&self, resource_group: &str, mut nic: Interface) {
        compute::fill_interface_ids(self, resource_group, &mut nic);
        nic.etag.get_or_insert_with(new_etag);
        compute::sync_pool_membership(self, &nic);
        self.network_interfaces.lock().unwrap().insert(key(resource_group, &nic.name), nic);
    }

    /// Make the next call of `operation` (a trait method name such as
    /// `"create_or_update_load_balancer"`) fail with `error`
    pub fn fail_next(&self, operation: &str, error: AzureError) {
        self.failures
            .lock()
            .unwrap()
            .entry(operation.to_string())
            .or_default()
            .push_back(error);
    }

    /// Mutating calls made so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of calls made to one operation
    pub fn call_count(&self, operation: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.split_whitespace().next() == Some(operation))
            .count()
    }

    /// Forget recorded calls
    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Read a load balancer straight from the store (for assertions)
    pub fn load_balancer(&self, resource_group: &str, name: &str) -> Option<LoadBalancer> {
        self.load_balancers.lock().unwrap().get(&key(resource_group, name)).cloned()
    }

    /// Read a public IP straight from the store (for assertions)
    pub fn public_ip(&self, resource_group: &str, name: &str) -> Option<PublicIPAddress> {
        self.public_ips.lock().unwrap().get(&key(resource_group, name)).cloned()
    }

    /// Read a security group straight from the store (for assertions)
    pub fn security_group(&self, resource_group: &str, name: &str) -> Option<SecurityGroup> {
        self.security_groups.lock().unwrap().get(&key(resource_group, name)).cloned()
    }

    /// Read a private link service straight from the store (for assertions)
    pub fn private_link_service(&self, resource_group: &str, name: &str) -> Option<PrivateLinkService> {
        self.private_link_services.lock().unwrap().get(&key(resource_group, name)).cloned()
    }

    /// Read a network interface straight from the store (for assertions)
    pub fn network_interface(&self, resource_group: &str, name: &str) -> Option<Interface> {
        self.network_interfaces.lock().unwrap().get(&key(resource_group, name)).cloned()
    }

    /// Record a call and return the queued failure for it, if any
    pub(crate) fn enter(&self, operation: &str, target: &str, mutating: bool) -> Result<(), AzureError> {
        if mutating {
            self.calls.lock().unwrap().push(format!("{} {}", operation, target));
        }
        let queued = self
            .failures
            .lock()
            .unwrap()
            .get_mut(operation)
            .and_then(VecDeque::pop_front);
        match queued {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub(crate) fn next_id(&self) -> u32 {
        let mut id = self.next_id.lock().unwrap();
        let current = *id;
        *id += 1;
        current
    }

    pub(crate) fn network_id(&self, resource_group: &str, resource_type: &str, name: &str) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Network/{}/{}",
            self.subscription_id, resource_group, resource_type, name
        )
    }
}

pub(crate) fn key(resource_group: &str, name: &str) -> String {
    format!("{}/{}", resource_group.to_lowercase(), name.to_lowercase())
}

pub(crate) fn subnet_key(resource_group: &str, vnet_name: &str, name: &str) -> String {
    format!(
        "{}/{}/{}",
        resource_group.to_lowercase(),
        vnet_name.to_lowercase(),
        name.to_lowercase()
    )
}

pub(crate) fn new_etag() -> String {
    format!("W/\"{}\"", uuid::Uuid::new_v4())
}

/// Fail with 412 when the caller sent an ETag that no longer matches
pub(crate) fn check_etag(sent: Option<&str>, current: Option<&str>) -> Result<(), AzureError> {
    match sent.filter(|e| !e.is_empty()) {
        Some(sent) if Some(sent) != current => Err(AzureError::api(
            412,
            "PreconditionFailed",
            "The ETag provided in the If-Match header does not match the current ETag",
        )),
        _ => Ok(()),
    }
}

#[async_trait::async_trait]
impl AzureClientTrait for MockAzureClient {
    fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    async fn get_load_balancer(&self, resource_group: &str, name: &str) -> Result<LoadBalancer, AzureError> {
        network::get_load_balancer(self, resource_group, name).await
    }

    async fn list_load_balancers(&self, resource_group: &str) -> Result<Vec<LoadBalancer>, AzureError> {
        network::list_load_balancers(self, resource_group).await
    }

    async fn create_or_update_load_balancer(&self, resource_group: &str, lb: &LoadBalancer, etag: Option<&str>) -> Result<LoadBalancer, AzureError> {
        network::create_or_update_load_balancer(self, resource_group, lb, etag).await
    }

    async fn create_or_update_backend_pool(&self, resource_group: &str, lb_name: &str, pool: &BackendAddressPool, etag: Option<&str>) -> Result<(), AzureError> {
        network::create_or_update_backend_pool(self, resource_group, lb_name, pool, etag).await
    }

    async fn delete_load_balancer(&self, resource_group: &str, name: &str) -> Result<(), AzureError> {
        network::delete_load_balancer(self, resource_group, name).await
    }

    async fn get_public_ip(&self, resource_group: &str, name: &str) -> Result<PublicIPAddress, AzureError> {
        network::get_public_ip(self, resource_group, name).await
    }

    async fn list_public_ips(&self, resource_group: &str) -> Result<Vec<PublicIPAddress>, AzureError> {
        network::list_public_ips(self, resource_group).await
    }

    async fn create_or_update_public_ip(&self, resource_group: &str, pip: &PublicIPAddress) -> Result<PublicIPAddress, AzureError> {
        network::create_or_update_public_ip(self, resource_group, pip).await
    }

    async fn delete_public_ip(&self, resource_group: &str, name: &str) -> Result<(), AzureError> {
        network::delete_public_ip(self, resource_group, name).await
    }

    async fn get_security_group(&self, resource_group: &str, name: &str) -> Result<SecurityGroup, AzureError> {
        network::get_security_group(self, resource_group, name).await
    }

    async fn create_or_update_security_group(&self, resource_group: &str, nsg: &SecurityGroup, etag: Option<&str>) -> Result<SecurityGroup, AzureError> {
        network::create_or_update_security_group(self, resource_group, nsg, etag).await
    }

    async fn list_private_link_services(&self, resource_group: &str) -> Result<Vec<PrivateLinkService>, AzureError> {
        network::list_private_link_services(self, resource_group).await
    }

    async fn create_or_update_private_link_service(&self, resource_group: &str, pls: &PrivateLinkService, etag: Option<&str>) -> Result<PrivateLinkService, AzureError> {
        network::create_or_update_private_link_service(self, resource_group, pls, etag).await
    }

    async fn delete_private_link_service(&self, resource_group: &str, name: &str) -> Result<(), AzureError> {
        network::delete_private_link_service(self, resource_group, name).await
    }

    async fn delete_private_endpoint_connection(&self, resource_group: &str, pls_name: &str, connection_name: &str) -> Result<(), AzureError> {
        network::delete_private_endpoint_connection(self, resource_group, pls_name, connection_name).await
    }

    async fn get_subnet(&self, resource_group: &str, vnet_name: &str, name: &str) -> Result<Subnet, AzureError> {
        network::get_subnet(self, resource_group, vnet_name, name).await
    }

    async fn create_or_update_subnet(&self, resource_group: &str, vnet_name: &str, subnet: &Subnet) -> Result<Subnet, AzureError> {
        network::create_or_update_subnet(self, resource_group, vnet_name, subnet).await
    }

    async fn get_virtual_machine(&self, resource_group: &str, name: &str) -> Result<VirtualMachine, AzureError> {
        compute::get_virtual_machine(self, resource_group, name).await
    }

    async fn get_network_interface(&self, resource_group: &str, name: &str) -> Result<Interface, AzureError> {
        compute::get_network_interface(self, resource_group, name).await
    }

    async fn create_or_update_network_interface(&self, resource_group: &str, nic: &Interface) -> Result<Interface, AzureError> {
        compute::create_or_update_network_interface(self, resource_group, nic).await
    }
}
