//! Cloud configuration.
//!
//! The controller reads the same YAML document the rest of the cluster's
//! Azure integration uses (`/etc/kubernetes/azure.yaml` by default), then lets
//! a handful of environment variables override it. Everything the reconcilers
//! need to know about topology (SKU, single vs multiple standard load
//! balancers, backend pool model) lives here.

use crate::error::ControllerError;
use azure_client::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

/// Default location of the cloud configuration file
pub const DEFAULT_CONFIG_FILE: &str = "/etc/kubernetes/azure.yaml";

const SKU_BASIC: &str = "basic";
const SKU_STANDARD: &str = "standard";

/// How nodes are placed into backend pools
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendPoolType {
    /// Pool membership is held by NIC IP configurations
    NodeIpConfiguration,
    /// Pool holds node addresses directly
    NodeIp,
}

/// Which load balancers use pools that were configured outside the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreConfiguredBackendPools {
    None,
    Internal,
    External,
    All,
}

/// Process-wide Azure configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CloudConfig {
    pub resource_manager_endpoint: String,
    pub subscription_id: String,
    /// Bearer token for ARM. Acquiring it is left to the environment.
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
    pub resource_group: String,
    pub location: String,
    pub vnet_name: String,
    pub vnet_resource_group: Option<String>,
    pub subnet_name: String,
    pub security_group_name: String,
    pub security_group_resource_group: Option<String>,
    pub load_balancer_resource_group: Option<String>,
    pub private_link_service_resource_group: Option<String>,
    pub primary_availability_set_name: String,
    pub cluster_name: String,

    pub load_balancer_sku: String,
    pub enable_multiple_standard_load_balancers: bool,
    /// Comma separated VM set names that share the primary load balancer
    #[serde(rename = "nodePoolsWithoutDedicatedSLB")]
    pub node_pools_without_dedicated_slb: String,
    pub pre_configured_backend_pool_load_balancer_types: String,
    pub load_balancer_backend_pool_configuration_type: String,
    #[serde(rename = "disableOutboundSNAT")]
    pub disable_outbound_snat: bool,
    #[serde(rename = "excludeMasterFromStandardLB")]
    pub exclude_master_from_standard_lb: bool,
    pub maximum_load_balancer_rule_count: i32,

    /// `k=v` pairs separated by commas
    pub tags: String,
    pub tags_map: BTreeMap<String, String>,
    /// Comma separated tag keys the controller may delete
    pub system_tags: String,

    pub availability_zones: Vec<String>,
    pub extended_location_name: Option<String>,
    pub extended_location_type: Option<String>,

    #[serde(rename = "vmCacheTTLInSeconds")]
    pub vm_cache_ttl_in_seconds: u64,
    #[serde(rename = "loadBalancerCacheTTLInSeconds")]
    pub load_balancer_cache_ttl_in_seconds: u64,
    #[serde(rename = "nsgCacheTTLInSeconds")]
    pub nsg_cache_ttl_in_seconds: u64,
    #[serde(rename = "publicIPCacheTTLInSeconds")]
    pub public_ip_cache_ttl_in_seconds: u64,
    #[serde(rename = "plsCacheTTLInSeconds")]
    pub pls_cache_ttl_in_seconds: u64,

    pub cloud_provider_backoff_retries: u32,
    pub cloud_provider_backoff_exponent: f64,
    pub cloud_provider_backoff_duration: u64,
    pub cloud_provider_backoff_jitter: f64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            resource_manager_endpoint: azure_client::DEFAULT_RESOURCE_MANAGER_ENDPOINT.to_string(),
            subscription_id: String::new(),
            access_token: None,
            resource_group: String::new(),
            location: String::new(),
            vnet_name: String::new(),
            vnet_resource_group: None,
            subnet_name: String::new(),
            security_group_name: String::new(),
            security_group_resource_group: None,
            load_balancer_resource_group: None,
            private_link_service_resource_group: None,
            primary_availability_set_name: String::new(),
            cluster_name: "kubernetes".to_string(),
            load_balancer_sku: SKU_BASIC.to_string(),
            enable_multiple_standard_load_balancers: false,
            node_pools_without_dedicated_slb: String::new(),
            pre_configured_backend_pool_load_balancer_types: String::new(),
            load_balancer_backend_pool_configuration_type: "nodeIPConfiguration".to_string(),
            disable_outbound_snat: false,
            exclude_master_from_standard_lb: true,
            maximum_load_balancer_rule_count: 250,
            tags: String::new(),
            tags_map: BTreeMap::new(),
            system_tags: String::new(),
            availability_zones: Vec::new(),
            extended_location_name: None,
            extended_location_type: None,
            vm_cache_ttl_in_seconds: 60,
            load_balancer_cache_ttl_in_seconds: 120,
            nsg_cache_ttl_in_seconds: 120,
            public_ip_cache_ttl_in_seconds: 120,
            pls_cache_ttl_in_seconds: 120,
            cloud_provider_backoff_retries: azure_client::retry::DEFAULT_BACKOFF_STEPS,
            cloud_provider_backoff_exponent: azure_client::retry::DEFAULT_BACKOFF_EXPONENT,
            cloud_provider_backoff_duration: azure_client::retry::DEFAULT_BACKOFF_DURATION.as_secs(),
            cloud_provider_backoff_jitter: azure_client::retry::DEFAULT_BACKOFF_JITTER,
        }
    }
}

impl CloudConfig {
    /// Parse a YAML document and validate it
    pub fn from_yaml(content: &str) -> Result<Self, ControllerError> {
        let config: CloudConfig = serde_yaml::from_str(content)
            .map_err(|e| ControllerError::InvalidConfig(format!("failed to parse cloud config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load the file at `path`, apply environment overrides, validate.
    ///
    /// A missing file is not an error: a cluster may configure the controller
    /// through environment variables alone.
    pub async fn load(path: &str) -> Result<Self, ControllerError> {
        let mut config = match tokio::fs::read_to_string(path).await {
            Ok(content) => serde_yaml::from_str(&content).map_err(|e| {
                ControllerError::InvalidConfig(format!("failed to parse cloud config {}: {}", path, e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CloudConfig::default(),
            Err(e) => {
                return Err(ControllerError::InvalidConfig(format!(
                    "failed to read cloud config {}: {}",
                    path, e
                )));
            }
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `lookup`, which maps environment variable names to values
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(v) = non_empty("AZURE_SUBSCRIPTION_ID") {
            self.subscription_id = v;
        }
        if let Some(v) = non_empty("AZURE_RESOURCE_GROUP") {
            self.resource_group = v;
        }
        if let Some(v) = non_empty("AZURE_LOCATION") {
            self.location = v;
        }
        if let Some(v) = non_empty("AZURE_ACCESS_TOKEN") {
            self.access_token = Some(v);
        }
        if let Some(v) = non_empty("CLUSTER_NAME") {
            self.cluster_name = v;
        }
    }

    /// Reject settings the reconcilers cannot act on
    pub fn validate(&self) -> Result<(), ControllerError> {
        let sku = self.load_balancer_sku.to_lowercase();
        if !sku.is_empty() && sku != SKU_BASIC && sku != SKU_STANDARD {
            return Err(ControllerError::InvalidConfig(format!(
                "unknown loadBalancerSku {:?}, expected basic or standard",
                self.load_balancer_sku
            )));
        }
        parse_backend_pool_type(&self.load_balancer_backend_pool_configuration_type)?;
        parse_pre_configured(&self.pre_configured_backend_pool_load_balancer_types)?;
        if self.maximum_load_balancer_rule_count <= 0 {
            return Err(ControllerError::InvalidConfig(format!(
                "maximumLoadBalancerRuleCount must be positive, got {}",
                self.maximum_load_balancer_rule_count
            )));
        }
        if self.cluster_name.trim().is_empty() {
            return Err(ControllerError::InvalidConfig("clusterName must not be empty".to_string()));
        }
        if self.enable_multiple_standard_load_balancers && !self.use_standard_load_balancer() {
            return Err(ControllerError::InvalidConfig(
                "enableMultipleStandardLoadBalancers requires the standard load balancer SKU".to_string(),
            ));
        }
        Ok(())
    }

    pub fn use_standard_load_balancer(&self) -> bool {
        self.load_balancer_sku.eq_ignore_ascii_case(SKU_STANDARD)
    }

    /// All VM sets share one standard load balancer per direction
    pub fn use_single_standard_load_balancer(&self) -> bool {
        self.use_standard_load_balancer() && !self.enable_multiple_standard_load_balancers
    }

    pub fn use_multiple_standard_load_balancers(&self) -> bool {
        self.use_standard_load_balancer() && self.enable_multiple_standard_load_balancers
    }

    /// Lowercased VM set names that are kept on the primary load balancer
    pub fn vm_sets_sharing_primary_slb(&self) -> HashSet<String> {
        split_list(&self.node_pools_without_dedicated_slb)
            .into_iter()
            .map(|s| s.to_lowercase())
            .collect()
    }

    pub fn backend_pool_type(&self) -> BackendPoolType {
        parse_backend_pool_type(&self.load_balancer_backend_pool_configuration_type)
            .unwrap_or(BackendPoolType::NodeIpConfiguration)
    }

    /// Whether the backend pool of an internal or external load balancer is
    /// managed outside the controller
    pub fn is_backend_pool_pre_configured(&self, internal: bool) -> bool {
        match parse_pre_configured(&self.pre_configured_backend_pool_load_balancer_types)
            .unwrap_or(PreConfiguredBackendPools::None)
        {
            PreConfiguredBackendPools::All => true,
            PreConfiguredBackendPools::Internal => internal,
            PreConfiguredBackendPools::External => !internal,
            PreConfiguredBackendPools::None => false,
        }
    }

    pub fn load_balancer_resource_group(&self) -> &str {
        non_empty_or(&self.load_balancer_resource_group, &self.resource_group)
    }

    pub fn security_group_resource_group(&self) -> &str {
        non_empty_or(&self.security_group_resource_group, &self.resource_group)
    }

    pub fn vnet_resource_group(&self) -> &str {
        non_empty_or(&self.vnet_resource_group, &self.resource_group)
    }

    pub fn private_link_service_resource_group(&self) -> &str {
        non_empty_or(&self.private_link_service_resource_group, &self.resource_group)
    }

    /// Edge zone deployments carry an extended location and have no zones
    pub fn has_extended_location(&self) -> bool {
        self.extended_location_name.as_deref().is_some_and(|n| !n.is_empty())
    }

    pub fn extended_location(&self) -> Option<azure_client::ExtendedLocation> {
        let name = self.extended_location_name.as_deref().filter(|n| !n.is_empty())?;
        Some(azure_client::ExtendedLocation {
            name: name.to_string(),
            location_type: self
                .extended_location_type
                .clone()
                .unwrap_or_else(|| "EdgeZone".to_string()),
        })
    }

    pub fn system_tag_keys(&self) -> Vec<String> {
        split_list(&self.system_tags)
    }

    pub fn vnet_id(&self) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Network/virtualNetworks/{}",
            self.subscription_id,
            self.vnet_resource_group(),
            self.vnet_name
        )
    }

    pub fn subnet_id(&self, subnet: &str) -> String {
        format!("{}/subnets/{}", self.vnet_id(), subnet)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            steps: self.cloud_provider_backoff_retries.max(1),
            exponent: self.cloud_provider_backoff_exponent,
            duration: Duration::from_secs(self.cloud_provider_backoff_duration),
            jitter: self.cloud_provider_backoff_jitter,
            ..RetryPolicy::default()
        }
    }
}

fn non_empty_or<'a>(value: &'a Option<String>, fallback: &'a str) -> &'a str {
    value.as_deref().filter(|v| !v.is_empty()).unwrap_or(fallback)
}

/// Split a comma separated list, dropping blanks
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_backend_pool_type(value: &str) -> Result<BackendPoolType, ControllerError> {
    match value.to_lowercase().as_str() {
        "" | "nodeipconfiguration" => Ok(BackendPoolType::NodeIpConfiguration),
        "nodeip" => Ok(BackendPoolType::NodeIp),
        other => Err(ControllerError::InvalidConfig(format!(
            "unknown loadBalancerBackendPoolConfigurationType {:?}",
            other
        ))),
    }
}

fn parse_pre_configured(value: &str) -> Result<PreConfiguredBackendPools, ControllerError> {
    match value.to_lowercase().as_str() {
        "" | "none" => Ok(PreConfiguredBackendPools::None),
        "internal" => Ok(PreConfiguredBackendPools::Internal),
        "external" => Ok(PreConfiguredBackendPools::External),
        "all" => Ok(PreConfiguredBackendPools::All),
        other => Err(ControllerError::InvalidConfig(format!(
            "unknown preConfiguredBackendPoolLoadBalancerTypes {:?}",
            other
        ))),
    }
}
