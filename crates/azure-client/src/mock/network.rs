//! Network operations for MockAzureClient
//!
//! Handles load balancers, backend pools, public IPs, security groups,
//! private link services and subnets

use super::{MockAzureClient, check_etag, key, new_etag, subnet_key};
use crate::error::AzureError;
use crate::models::*;
use std::collections::HashMap;

const SUCCEEDED: &str = "Succeeded";

fn in_group<'a, T: 'a>(store: impl IntoIterator<Item = (&'a String, &'a T)>, resource_group: &str) -> Vec<&'a T> {
    let prefix = format!("{}/", resource_group.to_lowercase());
    store
        .into_iter()
        .filter(|(k, _)| k.starts_with(&prefix))
        .map(|(_, v)| v)
        .collect()
}

/// Fill in the IDs ARM would assign to a load balancer and its children
pub(crate) fn fill_load_balancer_ids(client: &MockAzureClient, resource_group: &str, lb: &mut LoadBalancer) {
    let lb_id = lb
        .id
        .get_or_insert_with(|| client.network_id(resource_group, "loadBalancers", &lb.name))
        .clone();
    for fip in &mut lb.properties.frontend_ip_configurations {
        fip.id.get_or_insert_with(|| format!("{}/frontendIPConfigurations/{}", lb_id, fip.name));
    }
    for pool in &mut lb.properties.backend_address_pools {
        pool.id.get_or_insert_with(|| format!("{}/backendAddressPools/{}", lb_id, pool.name));
    }
    for probe in &mut lb.properties.probes {
        probe.id.get_or_insert_with(|| format!("{}/probes/{}", lb_id, probe.name));
    }
    for rule in &mut lb.properties.load_balancing_rules {
        rule.id.get_or_insert_with(|| format!("{}/loadBalancingRules/{}", lb_id, rule.name));
    }
    for rule in &mut lb.properties.outbound_rules {
        rule.id.get_or_insert_with(|| format!("{}/outboundRules/{}", lb_id, rule.name));
    }
}

/// Give dynamically allocated internal frontends an address, as ARM does
fn allocate_private_ips(client: &MockAzureClient, lb: &mut LoadBalancer) {
    for fip in &mut lb.properties.frontend_ip_configurations {
        let props = &mut fip.properties;
        if props.subnet.is_some() && props.private_ip_address.is_none() {
            let n = client.next_id();
            props.private_ip_address = Some(match props.private_ip_address_version {
                Some(IPVersion::IPv6) => format!("fd00::{:x}", n + 4),
                _ => format!("10.240.{}.{}", n / 250, n % 250 + 4),
            });
        }
    }
}

/// Point each public IP used by `lb` back at the frontend using it, and
/// release the ones it no longer uses
fn link_public_ips(client: &MockAzureClient, lb: &LoadBalancer, removed: bool) {
    let lb_id = lb.id.clone().unwrap_or_default().to_lowercase();
    let frontend_prefix = format!("{}/frontendipconfigurations/", lb_id);
    let mut in_use: HashMap<String, String> = HashMap::new();
    if !removed {
        for fip in &lb.properties.frontend_ip_configurations {
            if let (Some(pip), Some(fip_id)) = (&fip.properties.public_ip_address, &fip.id) {
                in_use.insert(pip.id().to_lowercase(), fip_id.clone());
            }
        }
    }

    let mut pips = client.public_ips.lock().unwrap();
    for pip in pips.values_mut() {
        let pip_id = pip.id.clone().unwrap_or_default().to_lowercase();
        if let Some(fip_id) = in_use.get(&pip_id) {
            pip.properties.ip_configuration = Some(SubResource::new(fip_id.clone()));
        } else if pip
            .properties
            .ip_configuration
            .as_ref()
            .is_some_and(|c| c.id().to_lowercase().starts_with(&frontend_prefix))
        {
            pip.properties.ip_configuration = None;
        }
    }
}

pub async fn get_load_balancer(client: &MockAzureClient, resource_group: &str, name: &str) -> Result<LoadBalancer, AzureError> {
    client.enter("get_load_balancer", &key(resource_group, name), false)?;
    client
        .load_balancers
        .lock()
        .unwrap()
        .get(&key(resource_group, name))
        .cloned()
        .ok_or_else(|| AzureError::NotFound(format!("Load balancer {} not found", name)))
}

pub async fn list_load_balancers(client: &MockAzureClient, resource_group: &str) -> Result<Vec<LoadBalancer>, AzureError> {
    client.enter("list_load_balancers", resource_group, false)?;
    let store = client.load_balancers.lock().unwrap();
    Ok(in_group(store.iter(), resource_group).into_iter().cloned().collect())
}

pub async fn create_or_update_load_balancer(client: &MockAzureClient, resource_group: &str, lb: &LoadBalancer, etag: Option<&str>) -> Result<LoadBalancer, AzureError> {
    let k = key(resource_group, &lb.name);
    client.enter("create_or_update_load_balancer", &k, true)?;

    let stored = {
        let mut store = client.load_balancers.lock().unwrap();
        check_etag(etag, store.get(&k).and_then(|c| c.etag.as_deref()))?;

        let mut stored = lb.clone();
        fill_load_balancer_ids(client, resource_group, &mut stored);
        allocate_private_ips(client, &mut stored);
        // Read-only on the wire: pool membership is owned by the NICs
        let current = store.get(&k);
        for pool in &mut stored.properties.backend_address_pools {
            pool.properties.backend_ip_configurations = current
                .and_then(|c| {
                    c.properties
                        .backend_address_pools
                        .iter()
                        .find(|p| p.name.eq_ignore_ascii_case(&pool.name))
                })
                .map(|p| p.properties.backend_ip_configurations.clone())
                .unwrap_or_default();
        }
        stored.etag = Some(new_etag());
        stored.properties.provisioning_state = Some(SUCCEEDED.to_string());
        store.insert(k, stored.clone());
        stored
    };

    link_public_ips(client, &stored, false);
    Ok(stored)
}

pub async fn create_or_update_backend_pool(client: &MockAzureClient, resource_group: &str, lb_name: &str, pool: &BackendAddressPool, etag: Option<&str>) -> Result<(), AzureError> {
    let k = key(resource_group, lb_name);
    client.enter("create_or_update_backend_pool", &format!("{}/{}", k, pool.name.to_lowercase()), true)?;

    let mut store = client.load_balancers.lock().unwrap();
    let lb = store
        .get_mut(&k)
        .ok_or_else(|| AzureError::NotFound(format!("Load balancer {} not found", lb_name)))?;
    let lb_id = lb.id.clone().unwrap_or_default();

    let existing = lb
        .properties
        .backend_address_pools
        .iter()
        .position(|p| p.name.eq_ignore_ascii_case(&pool.name));
    check_etag(
        etag,
        existing.and_then(|i| lb.properties.backend_address_pools[i].etag.as_deref()),
    )?;

    let mut stored = pool.clone();
    stored.id.get_or_insert_with(|| format!("{}/backendAddressPools/{}", lb_id, pool.name));
    stored.properties.backend_ip_configurations = existing
        .map(|i| lb.properties.backend_address_pools[i].properties.backend_ip_configurations.clone())
        .unwrap_or_default();
    stored.etag = Some(new_etag());
    match existing {
        Some(i) => lb.properties.backend_address_pools[i] = stored,
        None => lb.properties.backend_address_pools.push(stored),
    }
    lb.etag = Some(new_etag());
    Ok(())
}

pub async fn delete_load_balancer(client: &MockAzureClient, resource_group: &str, name: &str) -> Result<(), AzureError> {
    let k = key(resource_group, name);
    client.enter("delete_load_balancer", &k, true)?;
    let removed = client.load_balancers.lock().unwrap().remove(&k);
    if let Some(lb) = removed {
        link_public_ips(client, &lb, true);
    }
    Ok(())
}

pub async fn get_public_ip(client: &MockAzureClient, resource_group: &str, name: &str) -> Result<PublicIPAddress, AzureError> {
    client.enter("get_public_ip", &key(resource_group, name), false)?;
    client
        .public_ips
        .lock()
        .unwrap()
        .get(&key(resource_group, name))
        .cloned()
        .ok_or_else(|| AzureError::NotFound(format!("Public IP {} not found", name)))
}

pub async fn list_public_ips(client: &MockAzureClient, resource_group: &str) -> Result<Vec<PublicIPAddress>, AzureError> {
    client.enter("list_public_ips", resource_group, false)?;
    let store = client.public_ips.lock().unwrap();
    Ok(in_group(store.iter(), resource_group).into_iter().cloned().collect())
}

pub async fn create_or_update_public_ip(client: &MockAzureClient, resource_group: &str, pip: &PublicIPAddress) -> Result<PublicIPAddress, AzureError> {
    let k = key(resource_group, &pip.name);
    client.enter("create_or_update_public_ip", &k, true)?;

    let mut store = client.public_ips.lock().unwrap();
    let existing = store.get(&k).cloned();

    let mut stored = pip.clone();
    stored
        .id
        .get_or_insert_with(|| client.network_id(resource_group, "publicIPAddresses", &pip.name));
    stored.etag = Some(new_etag());
    stored.properties.provisioning_state = Some(SUCCEEDED.to_string());
    // Read-only on the wire: ARM keeps the current user of the address
    stored.properties.ip_configuration = existing.as_ref().and_then(|e| e.properties.ip_configuration.clone());
    let version_changed = existing
        .as_ref()
        .is_some_and(|e| e.properties.public_ip_address_version != stored.properties.public_ip_address_version);
    if version_changed {
        stored.properties.ip_address = None;
    }
    if stored.properties.ip_address.is_none() {
        stored.properties.ip_address = existing
            .as_ref()
            .filter(|_| !version_changed)
            .and_then(|e| e.properties.ip_address.clone())
            .or_else(|| {
                let n = client.next_id();
                Some(match stored.properties.public_ip_address_version {
                    Some(IPVersion::IPv6) => format!("2001:db8::{:x}", n),
                    _ => format!("20.0.{}.{}", n / 256, n % 256),
                })
            });
    }
    if let Some(dns) = stored.properties.dns_settings.as_mut() {
        dns.fqdn = dns.domain_name_label.as_ref().map(|label| {
            format!(
                "{}.{}.cloudapp.azure.com",
                label,
                stored.location.as_deref().unwrap_or("eastus")
            )
        });
    }
    store.insert(k, stored.clone());
    Ok(stored)
}

pub async fn delete_public_ip(client: &MockAzureClient, resource_group: &str, name: &str) -> Result<(), AzureError> {
    let k = key(resource_group, name);
    client.enter("delete_public_ip", &k, true)?;

    let mut store = client.public_ips.lock().unwrap();
    if let Some(pip) = store.get(&k) {
        if let Some(user) = &pip.properties.ip_configuration {
            return Err(AzureError::api(
                400,
                crate::error::CANNOT_DELETE_PUBLIC_IP_CODE,
                format!("Public IP address {} is in use by {}", name, user.id()),
            ));
        }
    }
    store.remove(&k);
    Ok(())
}

pub async fn get_security_group(client: &MockAzureClient, resource_group: &str, name: &str) -> Result<SecurityGroup, AzureError> {
    client.enter("get_security_group", &key(resource_group, name), false)?;
    client
        .security_groups
        .lock()
        .unwrap()
        .get(&key(resource_group, name))
        .cloned()
        .ok_or_else(|| AzureError::NotFound(format!("Security group {} not found", name)))
}

pub async fn create_or_update_security_group(client: &MockAzureClient, resource_group: &str, nsg: &SecurityGroup, etag: Option<&str>) -> Result<SecurityGroup, AzureError> {
    let k = key(resource_group, &nsg.name);
    client.enter("create_or_update_security_group", &k, true)?;

    let mut store = client.security_groups.lock().unwrap();
    check_etag(etag, store.get(&k).and_then(|c| c.etag.as_deref()))?;

    let mut stored = nsg.clone();
    let nsg_id = stored
        .id
        .get_or_insert_with(|| client.network_id(resource_group, "networkSecurityGroups", &nsg.name))
        .clone();
    for rule in &mut stored.properties.security_rules {
        rule.id.get_or_insert_with(|| format!("{}/securityRules/{}", nsg_id, rule.name));
    }
    stored.etag = Some(new_etag());
    store.insert(k, stored.clone());
    Ok(stored)
}

pub async fn list_private_link_services(client: &MockAzureClient, resource_group: &str) -> Result<Vec<PrivateLinkService>, AzureError> {
    client.enter("list_private_link_services", resource_group, false)?;
    let store = client.private_link_services.lock().unwrap();
    Ok(in_group(store.iter(), resource_group).into_iter().cloned().collect())
}

pub async fn create_or_update_private_link_service(client: &MockAzureClient, resource_group: &str, pls: &PrivateLinkService, etag: Option<&str>) -> Result<PrivateLinkService, AzureError> {
    let k = key(resource_group, &pls.name);
    client.enter("create_or_update_private_link_service", &k, true)?;

    let mut store = client.private_link_services.lock().unwrap();
    let existing = store.get(&k).cloned();
    check_etag(etag, existing.as_ref().and_then(|c| c.etag.as_deref()))?;

    let mut stored = pls.clone();
    stored
        .id
        .get_or_insert_with(|| client.network_id(resource_group, "privateLinkServices", &pls.name));
    stored.etag = Some(new_etag());
    stored.properties.provisioning_state = Some(SUCCEEDED.to_string());
    // Endpoint connections are managed through their own API
    stored.properties.private_endpoint_connections = existing
        .map(|e| e.properties.private_endpoint_connections)
        .unwrap_or_default();
    store.insert(k, stored.clone());
    Ok(stored)
}

pub async fn delete_private_link_service(client: &MockAzureClient, resource_group: &str, name: &str) -> Result<(), AzureError> {
    let k = key(resource_group, name);
    client.enter("delete_private_link_service", &k, true)?;
    client.private_link_services.lock().unwrap().remove(&k);
    Ok(())
}

pub async fn delete_private_endpoint_connection(client: &MockAzureClient, resource_group: &str, pls_name: &str, connection_name: &str) -> Result<(), AzureError> {
    let k = key(resource_group, pls_name);
    client.enter("delete_private_endpoint_connection", &format!("{}/{}", k, connection_name), true)?;

    let mut store = client.private_link_services.lock().unwrap();
    let pls = store
        .get_mut(&k)
        .ok_or_else(|| AzureError::NotFound(format!("Private link service {} not found", pls_name)))?;
    pls.properties
        .private_endpoint_connections
        .retain(|c| !c.name.eq_ignore_ascii_case(connection_name));
    Ok(())
}

pub async fn get_subnet(client: &MockAzureClient, resource_group: &str, vnet_name: &str, name: &str) -> Result<Subnet, AzureError> {
    let k = subnet_key(resource_group, vnet_name, name);
    client.enter("get_subnet", &k, false)?;
    client
        .subnets
        .lock()
        .unwrap()
        .get(&k)
        .cloned()
        .ok_or_else(|| AzureError::NotFound(format!("Subnet {}/{} not found", vnet_name, name)))
}

pub async fn create_or_update_subnet(client: &MockAzureClient, resource_group: &str, vnet_name: &str, subnet: &Subnet) -> Result<Subnet, AzureError> {
    let k = subnet_key(resource_group, vnet_name, &subnet.name);
    client.enter("create_or_update_subnet", &k, true)?;

    let mut stored = subnet.clone();
    stored.id.get_or_insert_with(|| {
        client.network_id(
            resource_group,
            "virtualNetworks",
            &format!("{}/subnets/{}", vnet_name, subnet.name),
        )
    });
    stored.etag = Some(new_etag());
    client.subnets.lock().unwrap().insert(k, stored.clone());
    Ok(stored)
}
