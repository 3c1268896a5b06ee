//! Reconciler-facing views of Kubernetes Services and Nodes.
//!
//! The reconcilers never look at `k8s_openapi` types directly. A Service is
//! turned into a [`ServiceView`] once per reconcile, with its annotations
//! already parsed, and every Node into a [`NodeView`].

use crate::annotations::{ServiceOptions, parse_cidr};
use crate::consts::*;
use crate::error::ControllerError;
use azure_client::{ProbeProtocol, SecurityRuleProtocol, TransportProtocol};
use k8s_openapi::api::core::v1::{Node, ObjectReference, Service};
use std::collections::BTreeMap;

/// Protocol of a Service port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortProtocol {
    Tcp,
    Udp,
    Sctp,
}

impl PortProtocol {
    fn parse(value: Option<&str>) -> Result<Self, ControllerError> {
        match value.unwrap_or("TCP").to_ascii_uppercase().as_str() {
            "TCP" => Ok(PortProtocol::Tcp),
            "UDP" => Ok(PortProtocol::Udp),
            "SCTP" => Ok(PortProtocol::Sctp),
            other => Err(ControllerError::Reconciliation(format!(
                "unsupported service port protocol {}",
                other
            ))),
        }
    }

    /// Spelling used in rule names
    pub fn as_str(&self) -> &'static str {
        match self {
            PortProtocol::Tcp => "TCP",
            PortProtocol::Udp => "UDP",
            PortProtocol::Sctp => "SCTP",
        }
    }

    pub fn transport(&self) -> TransportProtocol {
        match self {
            PortProtocol::Tcp => TransportProtocol::Tcp,
            PortProtocol::Udp => TransportProtocol::Udp,
            PortProtocol::Sctp => TransportProtocol::All,
        }
    }

    pub fn security(&self) -> SecurityRuleProtocol {
        match self {
            PortProtocol::Tcp => SecurityRuleProtocol::Tcp,
            PortProtocol::Udp => SecurityRuleProtocol::Udp,
            PortProtocol::Sctp => SecurityRuleProtocol::Asterisk,
        }
    }

    /// Default probe protocol; UDP and SCTP ports are not probed
    pub fn probe(&self) -> Option<ProbeProtocol> {
        match self {
            PortProtocol::Tcp => Some(ProbeProtocol::Tcp),
            PortProtocol::Udp | PortProtocol::Sctp => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicePortView {
    pub name: Option<String>,
    pub protocol: PortProtocol,
    pub port: i32,
    pub node_port: i32,
    pub app_protocol: Option<String>,
}

/// A LoadBalancer Service as the reconcilers see it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceView {
    pub namespace: String,
    pub name: String,
    pub options: ServiceOptions,
    pub ports: Vec<ServicePortView>,
    pub ipv6: bool,
    pub client_ip_affinity: bool,
    pub external_traffic_local: bool,
    pub health_check_node_port: Option<i32>,
    pub source_ranges: Vec<String>,
    pub load_balancer_ip: Option<String>,
    pub ingress_ips: Vec<String>,
    pub is_load_balancer: bool,
    pub deleting: bool,
}

impl ServiceView {
    pub fn from_service(service: &Service) -> Result<Self, ControllerError> {
        let metadata = &service.metadata;
        let spec = service.spec.clone().unwrap_or_default();
        let annotations = metadata.annotations.clone().unwrap_or_default();

        let ports = spec
            .ports
            .unwrap_or_default()
            .into_iter()
            .map(|p| {
                Ok(ServicePortView {
                    protocol: PortProtocol::parse(p.protocol.as_deref())?,
                    name: p.name.filter(|n| !n.is_empty()),
                    port: p.port,
                    node_port: p.node_port.unwrap_or_default(),
                    app_protocol: p.app_protocol,
                })
            })
            .collect::<Result<Vec<_>, ControllerError>>()?;

        let ipv6 = match spec.ip_families.as_deref().and_then(|f| f.first()) {
            Some(family) => family.eq_ignore_ascii_case("IPv6"),
            None => spec.cluster_ip.as_deref().is_some_and(|ip| ip.contains(':')),
        };

        let source_ranges: Vec<String> = spec
            .load_balancer_source_ranges
            .unwrap_or_default()
            .into_iter()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect();
        if let Some(bad) = source_ranges.iter().find(|r| parse_cidr(r).is_none()) {
            return Err(ControllerError::annotation(
                "spec.loadBalancerSourceRanges",
                format!("{} is not a valid CIDR", bad),
            ));
        }

        let ingress_ips = service
            .status
            .as_ref()
            .and_then(|s| s.load_balancer.as_ref())
            .and_then(|lb| lb.ingress.as_ref())
            .map(|ingress| ingress.iter().filter_map(|i| i.ip.clone()).collect())
            .unwrap_or_default();

        Ok(Self {
            namespace: metadata.namespace.clone().unwrap_or_else(|| "default".to_string()),
            name: metadata.name.clone().unwrap_or_default(),
            options: ServiceOptions::parse(&annotations)?,
            ports,
            ipv6,
            client_ip_affinity: spec.session_affinity.as_deref() == Some("ClientIP"),
            external_traffic_local: spec.external_traffic_policy.as_deref() == Some("Local"),
            health_check_node_port: spec.health_check_node_port.filter(|p| *p > 0),
            source_ranges,
            load_balancer_ip: spec.load_balancer_ip.filter(|ip| !ip.trim().is_empty()),
            ingress_ips,
            is_load_balancer: spec.type_.as_deref() == Some("LoadBalancer"),
            deleting: metadata.deletion_timestamp.is_some(),
        })
    }

    /// `namespace/name`, the form written into ownership tags
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    pub fn internal(&self) -> bool {
        self.options.internal
    }

    /// Reference events are attached to
    pub fn object_ref(&self) -> ObjectReference {
        ObjectReference {
            api_version: Some("v1".to_string()),
            kind: Some("Service".to_string()),
            namespace: Some(self.namespace.clone()),
            name: Some(self.name.clone()),
            ..Default::default()
        }
    }

    /// The same Service on the other side of the internal/external split
    pub fn flip_internal(&self) -> Self {
        let mut flipped = self.clone();
        flipped.options.internal = !self.options.internal;
        flipped
    }

    /// Services with externalTrafficPolicy=Local are probed on the health check node port
    pub fn needs_health_check(&self) -> bool {
        self.external_traffic_local && self.health_check_node_port.is_some()
    }

    pub fn find_port(&self, port: i32) -> Option<&ServicePortView> {
        self.ports.iter().find(|p| p.port == port)
    }

    /// Resolve a port given by number or name
    pub fn find_port_by_number_or_name(&self, value: &str) -> Option<&ServicePortView> {
        match value.parse::<i32>() {
            Ok(number) => self.find_port(number),
            Err(_) => self.ports.iter().find(|p| p.name.as_deref() == Some(value)),
        }
    }
}

/// A cluster node as a backend candidate
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeView {
    pub name: String,
    pub internal_ips: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub provider_id: Option<String>,
}

impl NodeView {
    pub fn from_node(node: &Node) -> Self {
        let internal_ips = node
            .status
            .as_ref()
            .and_then(|s| s.addresses.as_ref())
            .map(|addresses| {
                addresses
                    .iter()
                    .filter(|a| a.type_ == "InternalIP")
                    .map(|a| a.address.clone())
                    .collect()
            })
            .unwrap_or_default();
        Self {
            name: node.metadata.name.clone().unwrap_or_default(),
            internal_ips,
            labels: node.metadata.labels.clone().unwrap_or_default(),
            provider_id: node.spec.as_ref().and_then(|s| s.provider_id.clone()),
        }
    }

    pub fn is_control_plane(&self) -> bool {
        self.labels.contains_key(LABEL_CONTROL_PLANE) || self.labels.contains_key(LABEL_LEGACY_MASTER)
    }

    pub fn is_excluded(&self) -> bool {
        self.labels.contains_key(LABEL_EXCLUDE_FROM_LOAD_BALANCERS)
    }

    /// Internal IPs of one family
    pub fn ips(&self, ipv6: bool) -> impl Iterator<Item = &String> {
        self.internal_ips.iter().filter(move |ip| ip.contains(':') == ipv6)
    }
}
