//! VM sets: the groups of nodes backend pools are built from.
//!
//! The load balancer reconcilers only talk to the [`VMSet`] trait. It knows
//! which VM set a node belongs to, how to find the node behind a NIC IP
//! configuration, and how to add or remove NIC IP configurations from a
//! backend pool. [`AvailabilitySet`] is the implementation for clusters built
//! on availability sets.

mod availability_set;
#[cfg(test)]
mod mock;


pub use availability_set::AvailabilitySet;
#[cfg(test)]
pub use mock::MockVMSet;

use crate::annotations::LoadBalancerMode;
use crate::config::CloudConfig;
use crate::error::ControllerError;
use crate::service_view::{NodeView, ServiceView};
use async_trait::async_trait;
use std::collections::HashSet;

/// Node grouping and NIC-level backend pool membership
#[async_trait]
pub trait VMSet: Send + Sync {
    /// VM set served by the load balancer named after the cluster
    fn primary_vm_set_name(&self) -> &str;

    /// Lowercased, sorted VM set names of the agent nodes in `nodes`
    async fn get_agent_pool_vm_set_names(&self, nodes: &[NodeView]) -> Result<Vec<String>, ControllerError>;

    /// VM set of one node, `None` when its VM is unknown
    async fn get_node_vm_set_name(&self, node: &NodeView) -> Result<Option<String>, ControllerError>;

    /// `(node name, VM set name)` behind a NIC IP configuration ID.
    /// `None` when the NIC or the VM no longer exists.
    async fn get_node_name_by_ip_configuration_id(
        &self,
        ip_configuration_id: &str,
    ) -> Result<Option<(String, String)>, ControllerError>;

    /// Make the NIC IP configuration of every eligible node in `nodes` reference `pool_id`
    async fn ensure_hosts_in_pool(
        &self,
        service: &ServiceView,
        nodes: &[NodeView],
        pool_id: &str,
        vm_set_name: &str,
    ) -> Result<(), ControllerError>;

    /// Remove `pool_id` from the given NIC IP configurations. An empty
    /// `vm_set_name` matches every VM set. Returns whether any NIC was written.
    async fn ensure_backend_pool_deleted(
        &self,
        pool_id: &str,
        vm_set_name: &str,
        ip_configuration_ids: &[String],
    ) -> Result<bool, ControllerError>;

    /// Detach `pool_id` from whole VM sets, used when a delete is refused
    /// because a VM set still references the pool. Implementations that keep
    /// no pool references at VM set level return [`ControllerError::Unsupported`].
    async fn ensure_backend_pool_deleted_from_vm_sets(
        &self,
        vm_set_names: &HashSet<String>,
        pool_id: &str,
    ) -> Result<(), ControllerError>;
}

/// Whether `node` must never be placed in a backend pool
pub fn is_node_excluded(config: &CloudConfig, node: &NodeView) -> bool {
    node.is_excluded()
        || (config.use_standard_load_balancer() && config.exclude_master_from_standard_lb && node.is_control_plane())
}

/// VM sets a Service may be placed on.
///
/// Without a mode annotation, or with a single standard load balancer, only
/// the primary VM set is eligible. `__auto__` allows every agent pool;
/// explicit names must each match an agent pool.
pub fn select_vm_set_names(
    mode: &LoadBalancerMode,
    agent_pools: &[String],
    primary_vm_set: &str,
    single_standard: bool,
) -> Result<Vec<String>, ControllerError> {
    if single_standard {
        return Ok(vec![primary_vm_set.to_string()]);
    }
    match mode {
        LoadBalancerMode::Unset => Ok(vec![primary_vm_set.to_string()]),
        LoadBalancerMode::Auto => {
            if agent_pools.is_empty() {
                return Err(ControllerError::Reconciliation(
                    "no agent pool VM sets found for load balancer mode __auto__".to_string(),
                ));
            }
            let mut names = agent_pools.to_vec();
            names.sort();
            Ok(names)
        }
        LoadBalancerMode::VmSets(requested) => requested
            .iter()
            .map(|name| {
                agent_pools
                    .iter()
                    .find(|pool| pool.eq_ignore_ascii_case(name))
                    .cloned()
                    .ok_or_else(|| ControllerError::Reconciliation(format!("availability set {} not found", name)))
            })
            .collect(),
    }
}
