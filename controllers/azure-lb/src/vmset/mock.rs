//! Mock VM set for reconciler tests
//!
//! Node and IP configuration placement is declared up front with the
//! builder methods; attach and detach calls are recorded instead of writing
//! NICs.

use super::VMSet;
use crate::error::ControllerError;
use crate::service_view::{NodeView, ServiceView};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;

#[derive(Debug)]
pub struct MockVMSet {
    primary: String,
    /// node name (lowercase) -> VM set
    nodes: HashMap<String, String>,
    /// IP configuration ID (lowercase) -> (node, VM set)
    ip_configurations: HashMap<String, (String, String)>,
    calls: Mutex<Vec<String>>,
}

impl MockVMSet {
    pub fn new(primary: &str) -> Self {
        Self {
            primary: primary.to_string(),
            nodes: HashMap::new(),
            ip_configurations: HashMap::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_node(mut self, node: &str, vm_set: &str) -> Self {
        self.nodes.insert(node.to_lowercase(), vm_set.to_lowercase());
        self
    }

    pub fn with_ip_configuration(mut self, id: &str, node: &str, vm_set: &str) -> Self {
        self.ip_configurations
            .insert(id.to_lowercase(), (node.to_string(), vm_set.to_lowercase()));
        self
    }

    /// Recorded calls, e.g. `ensure_hosts_in_pool {pool} {vm set}`
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl VMSet for MockVMSet {
    fn primary_vm_set_name(&self) -> &str {
        &self.primary
    }

    async fn get_agent_pool_vm_set_names(&self, nodes: &[NodeView]) -> Result<Vec<String>, ControllerError> {
        let names: BTreeSet<String> = nodes
            .iter()
            .filter(|n| !n.is_control_plane())
            .filter_map(|n| self.nodes.get(&n.name.to_lowercase()).cloned())
            .collect();
        Ok(names.into_iter().collect())
    }

    async fn get_node_vm_set_name(&self, node: &NodeView) -> Result<Option<String>, ControllerError> {
        Ok(self.nodes.get(&node.name.to_lowercase()).cloned())
    }

    async fn get_node_name_by_ip_configuration_id(
        &self,
        ip_configuration_id: &str,
    ) -> Result<Option<(String, String)>, ControllerError> {
        Ok(self.ip_configurations.get(&ip_configuration_id.to_lowercase()).cloned())
    }

    async fn ensure_hosts_in_pool(
        &self,
        _service: &ServiceView,
        _nodes: &[NodeView],
        pool_id: &str,
        vm_set_name: &str,
    ) -> Result<(), ControllerError> {
        self.record(format!("ensure_hosts_in_pool {} {}", pool_id, vm_set_name));
        Ok(())
    }

    async fn ensure_backend_pool_deleted(
        &self,
        pool_id: &str,
        vm_set_name: &str,
        ip_configuration_ids: &[String],
    ) -> Result<bool, ControllerError> {
        self.record(format!(
            "ensure_backend_pool_deleted {} {} {}",
            pool_id,
            vm_set_name,
            ip_configuration_ids.join(",")
        ));
        Ok(!ip_configuration_ids.is_empty())
    }

    async fn ensure_backend_pool_deleted_from_vm_sets(
        &self,
        vm_set_names: &HashSet<String>,
        pool_id: &str,
    ) -> Result<(), ControllerError> {
        let mut names: Vec<&String> = vm_set_names.iter().collect();
        names.sort();
        let names: Vec<&str> = names.into_iter().map(String::as_str).collect();
        self.record(format!(
            "ensure_backend_pool_deleted_from_vm_sets {} {}",
            names.join(","),
            pool_id
        ));
        Ok(())
    }
}
