//! VM set implementation for availability sets.
//!
//! Nodes are VMs named after the node. Pool membership lives on the primary
//! NIC's IP configuration, so joining or leaving a pool is a NIC write.

use super::{VMSet, is_node_excluded};
use crate::cloud::Cloud;
use crate::consts::PROVISIONING_STATE_FAILED;
use crate::error::ControllerError;
use crate::naming::{last_segment, parent_name, resource_group_of, trim_internal_suffix};
use crate::service_view::{NodeView, ServiceView};
use async_trait::async_trait;
use azure_client::{CacheReadType, IPVersion, Interface, SubResource, VirtualMachine};
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Nodes grouped by availability set
#[derive(Debug)]
pub struct AvailabilitySet {
    cloud: Arc<Cloud>,
}

impl AvailabilitySet {
    pub fn new(cloud: Arc<Cloud>) -> Self {
        Self { cloud }
    }

    async fn vm(&self, name: &str) -> Result<Option<VirtualMachine>, ControllerError> {
        Ok(self.cloud.get_virtual_machine(name, CacheReadType::Default).await?)
    }

    /// Add the primary NIC of one node to `pool_id`
    async fn ensure_host_in_pool(
        &self,
        service: &ServiceView,
        node: &NodeView,
        pool_id: &str,
        vm_set_name: &str,
        sharing_primary: &HashSet<String>,
    ) -> Result<(), ControllerError> {
        let config = self.cloud.config();
        let Some(vm) = self.vm(&node.name).await? else {
            warn!("ensure_host_in_pool: VM for node {} not found, skipping", node.name);
            return Ok(());
        };
        let node_vm_set = vm_set_of(&vm).unwrap_or_default();

        // Basic SKU and multiple standard load balancers keep every VM set on its own pool
        let mut need_check = !config.use_standard_load_balancer() || config.use_multiple_standard_load_balancers();
        if vm_set_name.eq_ignore_ascii_case(self.primary_vm_set_name()) && sharing_primary.contains(&node_vm_set) {
            need_check = false;
        }
        if need_check && !node_vm_set.eq_ignore_ascii_case(vm_set_name) {
            debug!(
                "ensure_host_in_pool: node {} is in VM set {}, not {}, skipping",
                node.name, node_vm_set, vm_set_name
            );
            return Ok(());
        }

        let Some(nic_id) = primary_nic_id(&vm) else {
            warn!("ensure_host_in_pool: VM {} has no network interface", vm.name);
            return Ok(());
        };
        let nic_rg = resource_group_of(&nic_id).unwrap_or(&config.resource_group).to_string();
        let Some(mut nic) = self.cloud.get_network_interface(&nic_rg, last_segment(&nic_id)).await? else {
            warn!("ensure_host_in_pool: network interface {} not found", nic_id);
            return Ok(());
        };
        if nic.properties.provisioning_state.as_deref() == Some(PROVISIONING_STATE_FAILED) {
            warn!(
                "ensure_host_in_pool: network interface {} is in a failed state, skipping node {}",
                nic.name, node.name
            );
            return Ok(());
        }

        let Some(index) = ip_configuration_index(&nic, service.ipv6) else {
            warn!("ensure_host_in_pool: no usable IP configuration on {}", nic.name);
            return Ok(());
        };
        let pools = &nic.properties.ip_configurations[index]
            .properties
            .load_balancer_backend_address_pools;
        if pools.iter().any(|p| p.id().eq_ignore_ascii_case(pool_id)) {
            return Ok(());
        }
        if config.use_standard_load_balancer() {
            let wanted_lb = trim_internal_suffix(parent_name(pool_id, "loadBalancers").unwrap_or_default());
            let other = pools.iter().find(|p| {
                !trim_internal_suffix(parent_name(p.id(), "loadBalancers").unwrap_or_default())
                    .eq_ignore_ascii_case(wanted_lb)
            });
            if let Some(other) = other {
                info!(
                    "ensure_host_in_pool: node {} is already in backend pool {} of another load balancer, skipping",
                    node.name,
                    other.id()
                );
                return Ok(());
            }
        }

        nic.properties.ip_configurations[index]
            .properties
            .load_balancer_backend_address_pools
            .push(SubResource::new(pool_id));
        info!("ensure_host_in_pool: adding node {} to backend pool {}", node.name, pool_id);
        self.cloud.create_or_update_network_interface(&nic_rg, &nic).await?;
        Ok(())
    }
}

/// Lowercased availability set name of a VM
fn vm_set_of(vm: &VirtualMachine) -> Option<String> {
    vm.properties
        .availability_set
        .as_ref()
        .map(|set| last_segment(set.id()).to_lowercase())
}

/// The NIC marked primary, or the only one
fn primary_nic_id(vm: &VirtualMachine) -> Option<String> {
    let nics = &vm.properties.network_profile.network_interfaces;
    nics.iter()
        .find(|n| n.properties.as_ref().and_then(|p| p.primary).unwrap_or(false))
        .or_else(|| nics.first())
        .and_then(|n| n.id.clone())
}

/// IPv6 services use the IPv6 configuration, everything else the primary one
fn ip_configuration_index(nic: &Interface, ipv6: bool) -> Option<usize> {
    let configs = &nic.properties.ip_configurations;
    if ipv6 {
        return configs
            .iter()
            .position(|c| c.properties.private_ip_address_version == Some(IPVersion::IPv6));
    }
    if configs.len() == 1 {
        return Some(0);
    }
    configs.iter().position(|c| c.properties.primary.unwrap_or(false))
}

#[async_trait]
impl VMSet for AvailabilitySet {
    fn primary_vm_set_name(&self) -> &str {
        &self.cloud.config().primary_availability_set_name
    }

    async fn get_agent_pool_vm_set_names(&self, nodes: &[NodeView]) -> Result<Vec<String>, ControllerError> {
        let mut names = BTreeSet::new();
        for node in nodes.iter().filter(|n| !n.is_control_plane()) {
            match self.vm(&node.name).await? {
                Some(vm) => {
                    if let Some(set) = vm_set_of(&vm) {
                        names.insert(set);
                    }
                }
                None => debug!("get_agent_pool_vm_set_names: VM for node {} not found", node.name),
            }
        }
        Ok(names.into_iter().collect())
    }

    async fn get_node_vm_set_name(&self, node: &NodeView) -> Result<Option<String>, ControllerError> {
        Ok(self.vm(&node.name).await?.and_then(|vm| vm_set_of(&vm)))
    }

    async fn get_node_name_by_ip_configuration_id(
        &self,
        ip_configuration_id: &str,
    ) -> Result<Option<(String, String)>, ControllerError> {
        let Some(nic_name) = parent_name(ip_configuration_id, "networkInterfaces") else {
            return Err(ControllerError::Reconciliation(format!(
                "{} is not a network interface IP configuration ID",
                ip_configuration_id
            )));
        };
        let rg = resource_group_of(ip_configuration_id).unwrap_or(&self.cloud.config().resource_group);
        let Some(nic) = self.cloud.get_network_interface(rg, nic_name).await? else {
            return Ok(None);
        };
        let Some(vm_ref) = nic.properties.virtual_machine.as_ref() else {
            return Ok(None);
        };
        let Some(vm) = self.vm(last_segment(vm_ref.id())).await? else {
            return Ok(None);
        };
        let vm_set = vm_set_of(&vm).unwrap_or_default();
        Ok(Some((vm.name, vm_set)))
    }

    async fn ensure_hosts_in_pool(
        &self,
        service: &ServiceView,
        nodes: &[NodeView],
        pool_id: &str,
        vm_set_name: &str,
    ) -> Result<(), ControllerError> {
        let config = self.cloud.config();
        let sharing_primary = config.vm_sets_sharing_primary_slb();
        let updates = nodes
            .iter()
            .filter(|node| !is_node_excluded(config, node))
            .map(|node| self.ensure_host_in_pool(service, node, pool_id, vm_set_name, &sharing_primary));

        let errors: Vec<String> = join_all(updates)
            .await
            .into_iter()
            .filter_map(Result::err)
            .map(|e| e.to_string())
            .collect();
        if !errors.is_empty() {
            return Err(ControllerError::Reconciliation(format!(
                "failed to add {} node(s) to backend pool {}: {}",
                errors.len(),
                pool_id,
                errors.join("; ")
            )));
        }
        Ok(())
    }

    async fn ensure_backend_pool_deleted(
        &self,
        pool_id: &str,
        vm_set_name: &str,
        ip_configuration_ids: &[String],
    ) -> Result<bool, ControllerError> {
        let config = self.cloud.config();
        // (resource group, NIC name) -> IP configuration IDs on it
        let mut by_nic: BTreeMap<(String, String), Vec<&str>> = BTreeMap::new();
        for id in ip_configuration_ids {
            let Some(nic_name) = parent_name(id, "networkInterfaces") else {
                warn!("ensure_backend_pool_deleted: skipping {}, not a NIC IP configuration", id);
                continue;
            };
            let rg = resource_group_of(id).unwrap_or(&config.resource_group);
            by_nic
                .entry((rg.to_lowercase(), nic_name.to_lowercase()))
                .or_default()
                .push(id);
        }

        let mut changed_nics = Vec::new();
        for ((rg, nic_name), ids) in by_nic {
            let Some(mut nic) = self.cloud.get_network_interface(&rg, &nic_name).await? else {
                debug!("ensure_backend_pool_deleted: network interface {} not found", nic_name);
                continue;
            };
            if !vm_set_name.is_empty() {
                if let Some(vm_ref) = nic.properties.virtual_machine.as_ref() {
                    let node_vm_set = self.vm(last_segment(vm_ref.id())).await?.and_then(|vm| vm_set_of(&vm));
                    if node_vm_set.is_some_and(|set| !set.eq_ignore_ascii_case(vm_set_name)) {
                        debug!(
                            "ensure_backend_pool_deleted: {} is not in VM set {}, skipping",
                            nic_name, vm_set_name
                        );
                        continue;
                    }
                }
            }

            let mut removed = false;
            for ip_config in &mut nic.properties.ip_configurations {
                let matches = ip_config
                    .id
                    .as_deref()
                    .is_some_and(|cid| ids.iter().any(|id| id.eq_ignore_ascii_case(cid)));
                if !matches {
                    continue;
                }
                let pools = &mut ip_config.properties.load_balancer_backend_address_pools;
                let before = pools.len();
                pools.retain(|p| !p.id().eq_ignore_ascii_case(pool_id));
                removed |= pools.len() != before;
            }
            if removed {
                changed_nics.push((rg, nic));
            }
        }

        if changed_nics.is_empty() {
            return Ok(false);
        }
        info!(
            "ensure_backend_pool_deleted: removing backend pool {} from {} network interface(s)",
            pool_id,
            changed_nics.len()
        );
        let writes = changed_nics
            .iter()
            .map(|(rg, nic)| self.cloud.create_or_update_network_interface(rg, nic));
        for result in join_all(writes).await {
            result?;
        }
        Ok(true)
    }

    async fn ensure_backend_pool_deleted_from_vm_sets(
        &self,
        vm_set_names: &HashSet<String>,
        pool_id: &str,
    ) -> Result<(), ControllerError> {
        // Availability sets hold no pool references of their own; only scale
        // sets do, and this implementation does not manage them
        let mut names: Vec<&str> = vm_set_names.iter().map(String::as_str).collect();
        names.sort_unstable();
        Err(ControllerError::Unsupported(format!(
            "cannot detach {} from VM sets {}: availability sets do not manage scale set pool references",
            pool_id,
            names.join(",")
        )))
    }
}
