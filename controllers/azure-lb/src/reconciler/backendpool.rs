//! Backend pool reconciliation.
//!
//! Two strategies exist. With NIC IP configurations the pool membership is
//! held by the NICs and written through the [`VMSet`](crate::vmset::VMSet);
//! with node IPs the pool itself lists `{name, ip, vnet}` entries. Switching
//! strategy migrates an existing pool by clearing the other kind of entry.

use super::Reconciler;
use crate::config::BackendPoolType;
use crate::error::ControllerError;
use crate::naming::{backend_pool_name, trim_internal_suffix};
use crate::service_view::{NodeView, ServiceView};
use crate::vmset::is_node_excluded;
use azure_client::{
    BackendAddressPool, CacheReadType, LoadBalancer, LoadBalancerBackendAddress, LoadBalancerBackendAddressProperties,
    SubResource,
};
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, info, warn};

impl Reconciler {
    /// VM set served by load balancer `lb_name`
    pub(crate) fn map_load_balancer_name_to_vm_set(&self, lb_name: &str) -> String {
        let trimmed = trim_internal_suffix(lb_name);
        if trimmed.eq_ignore_ascii_case(self.cluster_name()) {
            self.vm_set.primary_vm_set_name().to_string()
        } else {
            trimmed.to_lowercase()
        }
    }

    /// Bring the cluster backend pool of `lb` in line with the configured
    /// strategy and drop nodes that must not be in it.
    ///
    /// Returns `(pre_configured, changed)`; `changed` means `lb` was modified
    /// in memory and needs a PUT. Pool writes done here refresh `lb`.
    pub(crate) async fn reconcile_backend_pools(
        &self,
        lb: &mut LoadBalancer,
        service: &ServiceView,
        nodes: &[NodeView],
    ) -> Result<(bool, bool), ControllerError> {
        let pool_name = backend_pool_name(self.cluster_name());
        let pre_configured = self.config().is_backend_pool_pre_configured(service.internal());
        let Some(index) = lb
            .properties
            .backend_address_pools
            .iter()
            .position(|p| p.name.eq_ignore_ascii_case(&pool_name))
        else {
            if pre_configured {
                warn!(
                    "reconcile_backend_pools: load balancer {} has no pre-configured backend pool {}, creating it",
                    lb.name, pool_name
                );
            }
            lb.properties.backend_address_pools.push(BackendAddressPool {
                name: pool_name,
                ..Default::default()
            });
            return Ok((false, true));
        };

        match self.config().backend_pool_type() {
            BackendPoolType::NodeIpConfiguration => {
                self.reconcile_ip_configuration_pool(lb, index, nodes, pre_configured).await?;
                Ok((pre_configured, false))
            }
            BackendPoolType::NodeIp => {
                let changed = self.reconcile_node_ip_pool(lb, index, nodes).await?;
                Ok((pre_configured, changed))
            }
        }
    }

    async fn reconcile_ip_configuration_pool(
        &self,
        lb: &mut LoadBalancer,
        index: usize,
        nodes: &[NodeView],
        pre_configured: bool,
    ) -> Result<(), ControllerError> {
        let lb_name = lb.name.clone();
        let pool_id = self.backend_pool_id(&lb_name);
        let mut refresh = false;

        let pool = &mut lb.properties.backend_address_pools[index];
        if !pool.properties.load_balancer_backend_addresses.is_empty() {
            info!(
                "reconcile_backend_pools: migrating backend pool {} of {} from node IPs to IP configurations",
                pool.name, lb_name
            );
            pool.properties.load_balancer_backend_addresses.clear();
            self.cloud
                .create_or_update_backend_pool(&lb_name, pool, pool.etag.as_deref())
                .await?;
            refresh = true;
        }

        let mut unwanted = Vec::new();
        for member in &pool.properties.backend_ip_configurations {
            let id = member.id();
            match self.vm_set.get_node_name_by_ip_configuration_id(id).await {
                Ok(None) => {
                    info!("reconcile_backend_pools: VM behind {} is gone, removing it from {}", id, lb_name);
                    unwanted.push(id.to_string());
                }
                Ok(Some((node_name, _))) => {
                    let excluded = nodes
                        .iter()
                        .find(|n| n.name.eq_ignore_ascii_case(&node_name))
                        .is_some_and(|n| is_node_excluded(self.config(), n));
                    if excluded {
                        info!(
                            "reconcile_backend_pools: node {} is excluded, removing it from {}",
                            node_name, lb_name
                        );
                        unwanted.push(id.to_string());
                    }
                }
                Err(e) => warn!("reconcile_backend_pools: cannot resolve {}: {}", id, e),
            }
        }

        if !unwanted.is_empty() && !pre_configured {
            refresh |= self.vm_set.ensure_backend_pool_deleted(&pool_id, "", &unwanted).await?;
        }

        if refresh {
            match self.cloud.get_load_balancer(&lb_name, CacheReadType::ForceRefresh).await? {
                Some(fresh) => *lb = fresh,
                None => lb.etag = None,
            }
        }
        Ok(())
    }

    async fn reconcile_node_ip_pool(
        &self,
        lb: &mut LoadBalancer,
        index: usize,
        nodes: &[NodeView],
    ) -> Result<bool, ControllerError> {
        let lb_name = lb.name.clone();
        let pool_id = self.backend_pool_id(&lb_name);
        let pool = &mut lb.properties.backend_address_pools[index];

        if !pool.properties.backend_ip_configurations.is_empty() {
            info!(
                "reconcile_backend_pools: migrating backend pool {} of {} from IP configurations to node IPs",
                pool.name, lb_name
            );
            let ids: Vec<String> = pool
                .properties
                .backend_ip_configurations
                .iter()
                .map(|c| c.id().to_string())
                .collect();
            self.vm_set.ensure_backend_pool_deleted(&pool_id, "", &ids).await?;
            pool.properties.backend_ip_configurations.clear();
            pool.etag = None;
            lb.etag = None;
            return Ok(true);
        }

        let excluded: HashSet<&str> = nodes
            .iter()
            .filter(|n| is_node_excluded(self.config(), n))
            .flat_map(|n| n.internal_ips.iter().map(String::as_str))
            .collect();
        if excluded.is_empty() {
            return Ok(false);
        }
        let before = pool.properties.load_balancer_backend_addresses.len();
        pool.properties.load_balancer_backend_addresses.retain(|entry| {
            !entry
                .properties
                .ip_address
                .as_deref()
                .is_some_and(|ip| excluded.contains(ip))
        });
        if pool.properties.load_balancer_backend_addresses.len() == before {
            return Ok(false);
        }

        info!(
            "reconcile_backend_pools: removing {} excluded node address(es) from {}",
            before - pool.properties.load_balancer_backend_addresses.len(),
            lb_name
        );
        self.cloud
            .create_or_update_backend_pool(&lb_name, pool, pool.etag.as_deref())
            .await?;
        match self.cloud.get_load_balancer(&lb_name, CacheReadType::ForceRefresh).await? {
            Some(fresh) => *lb = fresh,
            None => lb.etag = None,
        }
        Ok(false)
    }

    /// Make every eligible node a member of the cluster pool of `lb_name`
    pub(crate) async fn ensure_hosts_in_pool(
        &self,
        service: &ServiceView,
        nodes: &[NodeView],
        lb_name: &str,
    ) -> Result<(), ControllerError> {
        let pool_id = self.backend_pool_id(lb_name);
        let vm_set_name = self.map_load_balancer_name_to_vm_set(lb_name);
        match self.config().backend_pool_type() {
            BackendPoolType::NodeIpConfiguration => {
                self.vm_set
                    .ensure_hosts_in_pool(service, nodes, &pool_id, &vm_set_name)
                    .await
            }
            BackendPoolType::NodeIp => self.ensure_node_ips_in_pool(service, nodes, lb_name, &vm_set_name).await,
        }
    }

    async fn ensure_node_ips_in_pool(
        &self,
        service: &ServiceView,
        nodes: &[NodeView],
        lb_name: &str,
        vm_set_name: &str,
    ) -> Result<(), ControllerError> {
        let config = self.config();
        let pool_name = backend_pool_name(self.cluster_name());
        let Some(lb) = self.cloud.get_load_balancer(lb_name, CacheReadType::Default).await? else {
            return Err(ControllerError::Reconciliation(format!(
                "load balancer {} not found while adding nodes",
                lb_name
            )));
        };
        let Some(mut pool) = lb
            .properties
            .backend_address_pools
            .into_iter()
            .find(|p| p.name.eq_ignore_ascii_case(&pool_name))
        else {
            return Err(ControllerError::Reconciliation(format!(
                "backend pool {} not found on load balancer {}",
                pool_name, lb_name
            )));
        };

        let single = config.use_single_standard_load_balancer();
        let sharing_primary = config.vm_sets_sharing_primary_slb();
        let is_primary = vm_set_name.eq_ignore_ascii_case(self.vm_set.primary_vm_set_name());
        let vnet = SubResource::new(config.vnet_id());

        let mut added = 0;
        for node in nodes {
            if node.is_control_plane() || is_node_excluded(config, node) {
                continue;
            }
            if !single {
                let node_vm_set = self.vm_set.get_node_vm_set_name(node).await?.unwrap_or_default();
                let shares = config.use_multiple_standard_load_balancers()
                    && is_primary
                    && sharing_primary.contains(&node_vm_set.to_lowercase());
                if !node_vm_set.eq_ignore_ascii_case(vm_set_name) && !shares {
                    debug!(
                        "ensure_hosts_in_pool: node {} is in VM set {}, not {}, skipping",
                        node.name, node_vm_set, vm_set_name
                    );
                    continue;
                }
            }
            let Some(ip) = node.ips(service.ipv6).next() else {
                warn!("ensure_hosts_in_pool: node {} has no address of the Service's family", node.name);
                continue;
            };
            let entries = &mut pool.properties.load_balancer_backend_addresses;
            if entries.iter().any(|e| e.properties.ip_address.as_deref() == Some(ip.as_str())) {
                continue;
            }
            let name = if service.ipv6 {
                format!("{}{}", node.name, crate::consts::IPV6_SUFFIX)
            } else {
                node.name.clone()
            };
            entries.push(LoadBalancerBackendAddress {
                name,
                properties: LoadBalancerBackendAddressProperties {
                    ip_address: Some(ip.clone()),
                    virtual_network: Some(vnet.clone()),
                },
            });
            added += 1;
        }

        if added > 0 {
            info!("ensure_hosts_in_pool: adding {} node address(es) to {}/{}", added, lb_name, pool.name);
            self.cloud
                .create_or_update_backend_pool(lb_name, &pool, pool.etag.as_deref())
                .await?;
        }
        Ok(())
    }

    /// Drop from the pool of `lb` the nodes whose VM set matches `should_remove`.
    /// Used on the primary load balancer when VM sets get their own.
    pub(crate) async fn cleanup_vm_set_from_backend_pool_by_condition(
        &self,
        lb: &mut LoadBalancer,
        nodes: &[NodeView],
        should_remove: impl Fn(&str) -> bool,
    ) -> Result<(), ControllerError> {
        let lb_name = lb.name.clone();
        let pool_name = backend_pool_name(self.cluster_name());
        let pool_id = self.backend_pool_id(&lb_name);
        let Some(pool) = lb
            .properties
            .backend_address_pools
            .iter_mut()
            .find(|p| p.name.eq_ignore_ascii_case(&pool_name))
        else {
            return Ok(());
        };

        match self.config().backend_pool_type() {
            BackendPoolType::NodeIpConfiguration => {
                let mut by_vm_set: Vec<(String, String)> = Vec::new();
                for member in &pool.properties.backend_ip_configurations {
                    if let Ok(Some((_, vm_set))) = self.vm_set.get_node_name_by_ip_configuration_id(member.id()).await {
                        if should_remove(&vm_set) {
                            by_vm_set.push((vm_set, member.id().to_string()));
                        }
                    }
                }
                if by_vm_set.is_empty() {
                    return Ok(());
                }
                let vm_sets: BTreeSet<&str> = by_vm_set.iter().map(|(set, _)| set.as_str()).collect();
                let mut changed = false;
                for vm_set in vm_sets {
                    let ids: Vec<String> = by_vm_set
                        .iter()
                        .filter(|(set, _)| set == vm_set)
                        .map(|(_, id)| id.clone())
                        .collect();
                    info!(
                        "cleanup_vm_set_from_backend_pool: removing VM set {} from {}",
                        vm_set, lb_name
                    );
                    changed |= self.vm_set.ensure_backend_pool_deleted(&pool_id, vm_set, &ids).await?;
                }
                if changed {
                    if let Some(fresh) = self.cloud.get_load_balancer(&lb_name, CacheReadType::ForceRefresh).await? {
                        *lb = fresh;
                    }
                }
            }
            BackendPoolType::NodeIp => {
                let mut remove: HashSet<&str> = HashSet::new();
                for node in nodes {
                    let vm_set = self.vm_set.get_node_vm_set_name(node).await?.unwrap_or_default();
                    if should_remove(&vm_set) {
                        remove.extend(node.internal_ips.iter().map(String::as_str));
                    }
                }
                let before = pool.properties.load_balancer_backend_addresses.len();
                pool.properties.load_balancer_backend_addresses.retain(|e| {
                    !e.properties
                        .ip_address
                        .as_deref()
                        .is_some_and(|ip| remove.contains(ip))
                });
                if pool.properties.load_balancer_backend_addresses.len() != before {
                    info!("cleanup_vm_set_from_backend_pool: removing node addresses from {}", lb_name);
                    self.cloud
                        .create_or_update_backend_pool(&lb_name, pool, pool.etag.as_deref())
                        .await?;
                    if let Some(fresh) = self.cloud.get_load_balancer(&lb_name, CacheReadType::ForceRefresh).await? {
                        *lb = fresh;
                    }
                }
            }
        }
        Ok(())
    }

    /// Private addresses of the cluster pool members of `lb`, as `(ipv4, ipv6)`
    pub(crate) async fn get_backend_private_ips(
        &self,
        lb: &LoadBalancer,
    ) -> Result<(Vec<String>, Vec<String>), ControllerError> {
        let pool_name = backend_pool_name(self.cluster_name());
        let Some(pool) = lb
            .properties
            .backend_address_pools
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(&pool_name))
        else {
            return Ok((Vec::new(), Vec::new()));
        };

        let mut ips = BTreeSet::new();
        match self.config().backend_pool_type() {
            BackendPoolType::NodeIp => {
                ips.extend(
                    pool.properties
                        .load_balancer_backend_addresses
                        .iter()
                        .filter_map(|e| e.properties.ip_address.clone()),
                );
            }
            BackendPoolType::NodeIpConfiguration => {
                for member in &pool.properties.backend_ip_configurations {
                    let id = member.id();
                    let Some(nic_name) = crate::naming::parent_name(id, "networkInterfaces") else {
                        continue;
                    };
                    let rg = crate::naming::resource_group_of(id).unwrap_or(&self.config().resource_group);
                    let Some(nic) = self.cloud.get_network_interface(rg, nic_name).await? else {
                        continue;
                    };
                    ips.extend(
                        nic.properties
                            .ip_configurations
                            .iter()
                            .filter(|c| c.id.as_deref().is_some_and(|cid| cid.eq_ignore_ascii_case(id)))
                            .filter_map(|c| c.properties.private_ip_address.clone()),
                    );
                }
            }
        }

        Ok(ips.into_iter().partition(|ip| !ip.contains(':')))
    }
}
