//! Test utilities for unit testing reconcilers
//!
//! This module provides helpers for creating test data and setting up test scenarios.

#[cfg(test)]
use crate::cloud::Cloud;
#[cfg(test)]
use crate::config::CloudConfig;
#[cfg(test)]
use crate::events::RecordingEventRecorder;
#[cfg(test)]
use crate::metrics::Metrics;
#[cfg(test)]
use crate::reconciler::Reconciler;
#[cfg(test)]
use crate::service_view::{NodeView, ServiceView};
#[cfg(test)]
use crate::vmset::{AvailabilitySet, VMSet};
#[cfg(test)]
use azure_client::*;
#[cfg(test)]
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
#[cfg(test)]
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
#[cfg(test)]
use std::sync::Arc;

#[cfg(test)]
pub const TEST_SUBSCRIPTION: &str = "sub";
#[cfg(test)]
pub const TEST_RESOURCE_GROUP: &str = "rg";
#[cfg(test)]
pub const TEST_CLUSTER: &str = "kubernetes";
#[cfg(test)]
pub const TEST_LOCATION: &str = "eastus";
#[cfg(test)]
pub const TEST_VNET: &str = "vnet";
#[cfg(test)]
pub const TEST_SUBNET: &str = "subnet";
#[cfg(test)]
pub const TEST_SECURITY_GROUP: &str = "nsg";
#[cfg(test)]
pub const TEST_PRIMARY_VM_SET: &str = "agentpool0";

/// Standard SKU, single load balancer, NIC based pools
#[cfg(test)]
pub fn create_test_config() -> CloudConfig {
    CloudConfig {
        subscription_id: TEST_SUBSCRIPTION.to_string(),
        resource_group: TEST_RESOURCE_GROUP.to_string(),
        location: TEST_LOCATION.to_string(),
        vnet_name: TEST_VNET.to_string(),
        subnet_name: TEST_SUBNET.to_string(),
        security_group_name: TEST_SECURITY_GROUP.to_string(),
        primary_availability_set_name: TEST_PRIMARY_VM_SET.to_string(),
        cluster_name: TEST_CLUSTER.to_string(),
        load_balancer_sku: "standard".to_string(),
        ..CloudConfig::default()
    }
}

#[cfg(test)]
pub fn create_test_cloud(mock: &MockAzureClient, config: CloudConfig) -> Cloud {
    let metrics = Arc::new(Metrics::new().unwrap());
    Cloud::new(Arc::new(mock.clone()), Arc::new(config), metrics)
}

/// An empty standard load balancer that does not exist in the cloud yet
#[cfg(test)]
pub fn create_test_load_balancer(name: &str) -> LoadBalancer {
    LoadBalancer {
        name: name.to_string(),
        location: Some(TEST_LOCATION.to_string()),
        sku: Some(Sku {
            name: SkuName::Standard,
        }),
        ..Default::default()
    }
}

#[cfg(test)]
pub fn create_test_public_ip(name: &str, address: Option<&str>) -> PublicIPAddress {
    PublicIPAddress {
        name: name.to_string(),
        location: Some(TEST_LOCATION.to_string()),
        sku: Some(Sku {
            name: SkuName::Standard,
        }),
        properties: PublicIPAddressProperties {
            public_ip_allocation_method: Some(IPAllocationMethod::Static),
            public_ip_address_version: Some(IPVersion::IPv4),
            ip_address: address.map(str::to_string),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// A LoadBalancer Service in `default` exposing tcp/80 on node port 8080
#[cfg(test)]
pub fn create_test_k8s_service(name: &str, annotations: &[(&str, &str)]) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            annotations: Some(
                annotations
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("LoadBalancer".to_string()),
            cluster_ip: Some("10.0.100.10".to_string()),
            ip_families: Some(vec!["IPv4".to_string()]),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: 80,
                node_port: Some(8080),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    }
}

#[cfg(test)]
pub fn create_test_service(name: &str, annotations: &[(&str, &str)]) -> ServiceView {
    ServiceView::from_service(&create_test_k8s_service(name, annotations)).unwrap()
}

#[cfg(test)]
pub fn create_test_node(name: &str, ip: &str) -> NodeView {
    NodeView {
        name: name.to_string(),
        internal_ips: vec![ip.to_string()],
        ..Default::default()
    }
}

#[cfg(test)]
pub fn vm_id(name: &str) -> String {
    format!(
        "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Compute/virtualMachines/{}",
        TEST_SUBSCRIPTION, TEST_RESOURCE_GROUP, name
    )
}

#[cfg(test)]
pub fn nic_id(node: &str) -> String {
    format!(
        "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Network/networkInterfaces/{}-nic",
        TEST_SUBSCRIPTION, TEST_RESOURCE_GROUP, node
    )
}

#[cfg(test)]
pub fn ip_configuration_id(node: &str) -> String {
    format!("{}/ipConfigurations/ipconfig1", nic_id(node))
}

#[cfg(test)]
pub fn availability_set_id(name: &str) -> String {
    format!(
        "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Compute/availabilitySets/{}",
        TEST_SUBSCRIPTION, TEST_RESOURCE_GROUP, name
    )
}

/// Seed the security group and the cluster subnet
#[cfg(test)]
pub fn seed_network(mock: &MockAzureClient) {
    mock.add_security_group(
        TEST_RESOURCE_GROUP,
        SecurityGroup {
            name: TEST_SECURITY_GROUP.to_string(),
            location: Some(TEST_LOCATION.to_string()),
            ..Default::default()
        },
    );
    mock.add_subnet(
        TEST_RESOURCE_GROUP,
        TEST_VNET,
        Subnet {
            name: TEST_SUBNET.to_string(),
            properties: SubnetProperties {
                address_prefix: Some("10.240.0.0/16".to_string()),
                ..Default::default()
            },
            ..Default::default()
        },
    );
}

/// Seed a VM in availability set `vm_set` with a single-IP primary NIC
#[cfg(test)]
pub fn seed_node(mock: &MockAzureClient, node: &str, ip: &str, vm_set: &str) {
    mock.add_virtual_machine(
        TEST_RESOURCE_GROUP,
        VirtualMachine {
            name: node.to_string(),
            properties: VirtualMachineProperties {
                availability_set: Some(SubResource::new(availability_set_id(vm_set))),
                network_profile: NetworkProfile {
                    network_interfaces: vec![NetworkInterfaceReference {
                        id: Some(nic_id(node)),
                        properties: Some(NetworkInterfaceReferenceProperties { primary: Some(true) }),
                    }],
                },
            },
            ..Default::default()
        },
    );
    mock.add_network_interface(
        TEST_RESOURCE_GROUP,
        Interface {
            name: format!("{}-nic", node),
            location: Some(TEST_LOCATION.to_string()),
            properties: InterfaceProperties {
                virtual_machine: Some(SubResource::new(vm_id(node))),
                ip_configurations: vec![InterfaceIPConfiguration {
                    name: "ipconfig1".to_string(),
                    properties: InterfaceIPConfigurationProperties {
                        primary: Some(true),
                        private_ip_address: Some(ip.to_string()),
                        private_ip_address_version: Some(IPVersion::IPv4),
                        subnet: Some(SubResource::new(format!(
                            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Network/virtualNetworks/{}/subnets/{}",
                            TEST_SUBSCRIPTION, TEST_RESOURCE_GROUP, TEST_VNET, TEST_SUBNET
                        ))),
                        ..Default::default()
                    },
                    ..Default::default()
                }],
                ..Default::default()
            },
            ..Default::default()
        },
    );
}

/// Reconciler over the mock with the availability set VM set
#[cfg(test)]
pub fn create_test_reconciler(
    mock: &MockAzureClient,
    config: CloudConfig,
) -> (Reconciler, Arc<RecordingEventRecorder>) {
    let cloud = Arc::new(create_test_cloud(mock, config));
    let vm_set: Arc<dyn VMSet> = Arc::new(AvailabilitySet::new(cloud.clone()));
    reconciler_with(cloud, vm_set)
}

/// Reconciler over the mock with a caller-provided VM set
#[cfg(test)]
pub fn create_test_reconciler_with_vm_set(
    mock: &MockAzureClient,
    config: CloudConfig,
    vm_set: Arc<dyn VMSet>,
) -> (Reconciler, Arc<RecordingEventRecorder>) {
    let cloud = Arc::new(create_test_cloud(mock, config));
    reconciler_with(cloud, vm_set)
}

#[cfg(test)]
fn reconciler_with(cloud: Arc<Cloud>, vm_set: Arc<dyn VMSet>) -> (Reconciler, Arc<RecordingEventRecorder>) {
    let events = Arc::new(RecordingEventRecorder::default());
    let metrics = Arc::new(Metrics::new().unwrap());
    let reconciler = Reconciler::new(cloud, vm_set, events.clone(), metrics);
    (reconciler, events)
}
