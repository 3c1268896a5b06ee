//! Cloud resource names derived from Services and the cluster.
//!
//! Ownership of frontends, rules, probes and security rules is decided from
//! these names, so every parser here is the inverse of a builder next to it.

use crate::consts::*;
use crate::service_view::{PortProtocol, ServiceView};

const RULE_PROTOCOLS: [&str; 4] = ["TCP", "UDP", "SCTP", "All"];

/// `namespace_name`, shared by all frontends of a Service.
///
/// Namespace and Service names never contain `_`, so no two Services map to
/// the same base name.
pub fn frontend_base_name(service: &ServiceView) -> String {
    format!("{}_{}", service.namespace, service.name)
}

/// Frontend IP configuration name; internal Services pinned to a subnet get it as a suffix
pub fn frontend_name(service: &ServiceView) -> String {
    let base = frontend_base_name(service);
    match (&service.options.internal_subnet, service.internal()) {
        (Some(subnet), true) => format!("{}.{}", base, subnet),
        _ => base,
    }
}

/// Whether `fip_name` was created for `service`
pub fn is_service_frontend(service: &ServiceView, fip_name: &str) -> bool {
    let base = frontend_base_name(service).to_lowercase();
    let name = fip_name.to_lowercase();
    name == base || name.starts_with(&format!("{}.", base))
}

/// Load balancing rule and health probe name for one port
pub fn rule_name(fip_name: &str, protocol: PortProtocol, port: i32) -> String {
    format!("{}-{}-{}", fip_name, protocol.as_str(), port)
}

/// The frontend name a rule or probe was built from
pub fn rule_frontend(rule_name: &str) -> Option<&str> {
    let mut parts = rule_name.rsplitn(3, '-');
    let port = parts.next()?;
    let protocol = parts.next()?;
    let frontend = parts.next()?;
    (port.parse::<i32>().is_ok() && RULE_PROTOCOLS.contains(&protocol)).then_some(frontend)
}

/// Whether a rule or probe belongs to one of the frontends `service` owns
pub fn is_service_rule(service: &ServiceView, rule_name: &str) -> bool {
    rule_frontend(rule_name).is_some_and(|fip| is_service_frontend(service, fip))
}

pub fn public_ip_name(fip_name: &str) -> String {
    format!("pip-{}", fip_name)
}

/// Default private link service name for a frontend
pub fn private_link_service_name(fip_name: &str) -> String {
    format!("pls-{}", fip_name)
}

/// Backend pools are named after the cluster
pub fn backend_pool_name(cluster_name: &str) -> String {
    cluster_name.to_string()
}

/// Name of the load balancer serving `vm_set`.
///
/// The primary VM set, VM sets configured to share the primary load balancer,
/// and every VM set in single standard load balancer mode use the cluster
/// name.
pub fn load_balancer_name(
    cluster_name: &str,
    vm_set: &str,
    primary_vm_set: &str,
    sharing_primary: bool,
    single_standard: bool,
    internal: bool,
) -> String {
    let prefix = if vm_set.eq_ignore_ascii_case(primary_vm_set) || single_standard || sharing_primary {
        cluster_name.to_lowercase()
    } else {
        vm_set.to_lowercase()
    };
    if internal {
        format!("{}{}", prefix, INTERNAL_LOAD_BALANCER_SUFFIX)
    } else {
        prefix
    }
}

pub fn is_internal_load_balancer_name(name: &str) -> bool {
    name.to_lowercase().ends_with(INTERNAL_LOAD_BALANCER_SUFFIX)
}

/// Load balancer name without the internal suffix
pub fn trim_internal_suffix(name: &str) -> &str {
    if is_internal_load_balancer_name(name) {
        &name[..name.len() - INTERNAL_LOAD_BALANCER_SUFFIX.len()]
    } else {
        name
    }
}

/// Prefix of the security rules a Service owns
pub fn security_rule_prefix(service: &ServiceView) -> String {
    if service.options.shared_security_rule {
        SHARED_SECURITY_RULE_PREFIX.to_string()
    } else {
        frontend_base_name(service)
    }
}

/// `{prefix}-{Protocol}-{port}-{source}` with `/` and `:` made name-safe
pub fn security_rule_name(prefix: &str, protocol: PortProtocol, port: i32, source: &str) -> String {
    let source = source.replace('/', "_").replace(':', ".");
    format!("{}-{}-{}-{}", prefix, protocol.as_str(), port, source)
}

/// Whether a security rule name is `{prefix}-{Protocol}-{port}-{source}`.
///
/// The protocol is matched exactly as [`security_rule_name`] writes it.
/// Service names are lowercase, so a longer prefix can never leave a tail
/// that parses here.
pub fn is_rule_with_prefix(prefix: &str, rule_name: &str) -> bool {
    let Some(rest) = rule_name
        .get(..prefix.len() + 1)
        .filter(|head| head.eq_ignore_ascii_case(&format!("{}-", prefix)))
        .and_then(|head| rule_name.get(head.len()..))
    else {
        return false;
    };
    let mut parts = rest.splitn(3, '-');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(protocol), Some(port), Some(source)) => {
            RULE_PROTOCOLS.contains(&protocol)
                && !port.is_empty()
                && port.bytes().all(|b| b.is_ascii_digit())
                && !source.is_empty()
        }
        _ => false,
    }
}

/// Last segment of an ARM resource ID
pub fn last_segment(id: &str) -> &str {
    id.rsplit('/').next().unwrap_or(id)
}

/// Resource group segment of an ARM resource ID
pub fn resource_group_of(id: &str) -> Option<&str> {
    let mut segments = id.split('/');
    while let Some(segment) = segments.next() {
        if segment.eq_ignore_ascii_case("resourceGroups") {
            return segments.next();
        }
    }
    None
}

/// Name of the resource that owns a child ID such as
/// `.../loadBalancers/{lb}/backendAddressPools/{pool}`
pub fn parent_name<'a>(id: &'a str, parent_type: &str) -> Option<&'a str> {
    let mut segments = id.split('/');
    while let Some(segment) = segments.next() {
        if segment.eq_ignore_ascii_case(parent_type) {
            return segments.next();
        }
    }
    None
}
