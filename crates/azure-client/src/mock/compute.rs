//! Compute operations for MockAzureClient
//!
//! Handles virtual machines and network interfaces. A NIC write is mirrored
//! into the `backendIPConfigurations` of the pools it references, the same
//! way ARM reports pool membership.

use super::{MockAzureClient, key, new_etag};
use crate::error::AzureError;
use crate::models::*;

pub(crate) fn fill_interface_ids(client: &MockAzureClient, resource_group: &str, nic: &mut Interface) {
    let nic_id = nic
        .id
        .get_or_insert_with(|| client.network_id(resource_group, "networkInterfaces", &nic.name))
        .clone();
    for config in &mut nic.properties.ip_configurations {
        config.id.get_or_insert_with(|| format!("{}/ipConfigurations/{}", nic_id, config.name));
    }
}

/// Make every load balancer pool list exactly the IP configurations of `nic`
/// that reference it
pub(crate) fn sync_pool_membership(client: &MockAzureClient, nic: &Interface) {
    let mut lbs = client.load_balancers.lock().unwrap();
    for config in &nic.properties.ip_configurations {
        let Some(config_id) = config.id.as_deref() else {
            continue;
        };
        for lb in lbs.values_mut() {
            for pool in &mut lb.properties.backend_address_pools {
                let pool_id = pool.id.clone().unwrap_or_default();
                let members = &mut pool.properties.backend_ip_configurations;
                members.retain(|m| !m.id().eq_ignore_ascii_case(config_id));
                let referenced = config
                    .properties
                    .load_balancer_backend_address_pools
                    .iter()
                    .any(|p| p.id().eq_ignore_ascii_case(&pool_id));
                if referenced {
                    members.push(SubResource::new(config_id));
                }
            }
        }
    }
}

pub async fn get_virtual_machine(client: &MockAzureClient, resource_group: &str, name: &str) -> Result<VirtualMachine, AzureError> {
    client.enter("get_virtual_machine", &key(resource_group, name), false)?;
    client
        .virtual_machines
        .lock()
        .unwrap()
        .get(&key(resource_group, name))
        .cloned()
        .ok_or_else(|| AzureError::NotFound(format!("Virtual machine {} not found", name)))
}

pub async fn get_network_interface(client: &MockAzureClient, resource_group: &str, name: &str) -> Result<Interface, AzureError> {
    client.enter("get_network_interface", &key(resource_group, name), false)?;
    client
        .network_interfaces
        .lock()
        .unwrap()
        .get(&key(resource_group, name))
        .cloned()
        .ok_or_else(|| AzureError::NotFound(format!("Network interface {} not found", name)))
}

pub async fn create_or_update_network_interface(client: &MockAzureClient, resource_group: &str, nic: &Interface) -> Result<Interface, AzureError> {
    let k = key(resource_group, &nic.name);
    client.enter("create_or_update_network_interface", &k, true)?;

    let mut stored = nic.clone();
    fill_interface_ids(client, resource_group, &mut stored);
    stored.etag = Some(new_etag());
    stored.properties.provisioning_state = Some("Succeeded".to_string());
    sync_pool_membership(client, &stored);
    client.network_interfaces.lock().unwrap().insert(k, stored.clone());
    Ok(stored)
}
