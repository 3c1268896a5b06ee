//! Frontend IP configurations.
//!
//! A Service owns the frontend named after it (its primary frontend) and, when
//! it pins an address, any frontend already carrying that address.

use super::Reconciler;
use crate::annotations::parse_cidr;
use crate::error::ControllerError;
use crate::events::{actions, reasons};
use crate::naming::{frontend_name, is_service_frontend, is_service_rule, last_segment};
use crate::service_view::ServiceView;
use azure_client::{
    CacheReadType, FrontendIPConfiguration, FrontendIPConfigurationProperties, IPAllocationMethod, IPVersion,
    LoadBalancerProperties, SubResource, Subnet,
};
use std::net::IpAddr;
use tracing::{debug, info};

/// Result of [`Reconciler::reconcile_frontends`]
#[derive(Debug, Default)]
pub(crate) struct FrontendOutcome {
    /// Frontend the Service's rules attach to
    pub owned: Option<FrontendIPConfiguration>,
    /// The load balancer was changed in memory
    pub dirty: bool,
    /// IDs of frontends removed from the load balancer
    pub removed_ids: Vec<String>,
}

/// Whether `ip` falls inside `cidr`
pub(crate) fn ip_in_cidr(ip: &str, cidr: &str) -> bool {
    let (Ok(ip), Some((network, prefix))) = (ip.parse::<IpAddr>(), parse_cidr(cidr)) else {
        return false;
    };
    match (ip, network) {
        (IpAddr::V4(ip), IpAddr::V4(network)) => {
            let mask = u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0);
            u32::from(ip) & mask == u32::from(network) & mask
        }
        (IpAddr::V6(ip), IpAddr::V6(network)) => {
            let mask = u128::MAX.checked_shl(128 - u32::from(prefix)).unwrap_or(0);
            u128::from(ip) & mask == u128::from(network) & mask
        }
        _ => false,
    }
}

fn subnet_contains(subnet: &Subnet, ip: &str) -> bool {
    subnet
        .properties
        .address_prefix
        .iter()
        .chain(&subnet.properties.address_prefixes)
        .any(|prefix| ip_in_cidr(ip, prefix))
}

/// Whether rules that do not belong to `service`, outbound rules, or inbound
/// NAT rules and pools still point at frontend `fip_id`
fn frontend_in_use(props: &LoadBalancerProperties, fip_id: &str, service: &ServiceView) -> bool {
    let refers = |r: Option<&SubResource>| r.is_some_and(|r| r.id().eq_ignore_ascii_case(fip_id));
    props
        .load_balancing_rules
        .iter()
        .any(|rule| !is_service_rule(service, &rule.name) && refers(rule.properties.frontend_ip_configuration.as_ref()))
        || props.outbound_rules.iter().any(|rule| {
            rule.properties
                .frontend_ip_configurations
                .iter()
                .any(|r| r.id().eq_ignore_ascii_case(fip_id))
        })
        || props
            .inbound_nat_rules
            .iter()
            .any(|rule| refers(rule.properties.frontend_ip_configuration.as_ref()))
        || props
            .inbound_nat_pools
            .iter()
            .any(|pool| refers(pool.properties.frontend_ip_configuration.as_ref()))
}

impl Reconciler {
    /// `(owns, primary)` for frontend `fip` as seen by `service`
    pub(crate) async fn service_owns_frontend(
        &self,
        fip: &FrontendIPConfiguration,
        service: &ServiceView,
    ) -> Result<(bool, bool), ControllerError> {
        if is_service_frontend(service, &fip.name) {
            return Ok((true, true));
        }
        let Some(ip) = service.load_balancer_ip.as_deref() else {
            return Ok((false, false));
        };

        if service.internal() {
            return Ok((fip.properties.private_ip_address.as_deref() == Some(ip), false));
        }
        let Some(pip_id) = fip.properties.public_ip_address.as_ref().map(SubResource::id) else {
            return Ok((false, false));
        };
        let pips = self
            .cloud
            .list_public_ips(&self.public_ip_resource_group(service), CacheReadType::Default)
            .await?;
        let owns = pips.iter().any(|pip| {
            pip.properties.ip_address.as_deref() == Some(ip)
                && pip.id.as_deref().is_some_and(|id| id.eq_ignore_ascii_case(pip_id))
        });
        Ok((owns, false))
    }

    /// Whether an owned frontend no longer matches what the Service asks for
    /// and must be recreated
    fn is_frontend_ip_changed(
        &self,
        fip: &FrontendIPConfiguration,
        service: &ServiceView,
        primary: bool,
        desired_pip: Option<&str>,
    ) -> bool {
        if primary && !fip.name.eq_ignore_ascii_case(&frontend_name(service)) {
            return true;
        }
        if !service.internal() {
            return match (desired_pip, fip.properties.public_ip_address.as_ref()) {
                (Some(want), Some(have)) => !last_segment(have.id()).eq_ignore_ascii_case(want),
                (Some(_), None) => true,
                (None, _) => false,
            };
        }

        let config = self.config();
        let subnet_name = service.options.internal_subnet.as_deref().unwrap_or(&config.subnet_name);
        let subnet_matches = fip
            .properties
            .subnet
            .as_ref()
            .is_some_and(|s| s.id().eq_ignore_ascii_case(&config.subnet_id(subnet_name)));
        if !subnet_matches {
            return true;
        }
        match service.load_balancer_ip.as_deref() {
            None => false,
            Some(ip) => {
                fip.properties.private_ip_allocation_method != Some(IPAllocationMethod::Static)
                    || fip.properties.private_ip_address.as_deref() != Some(ip)
            }
        }
    }

    async fn new_internal_frontend(
        &self,
        service: &ServiceView,
        id: String,
        name: String,
        old_zones: Option<Vec<String>>,
    ) -> Result<FrontendIPConfiguration, ControllerError> {
        let config = self.config();
        let subnet_name = service
            .options
            .internal_subnet
            .clone()
            .unwrap_or_else(|| config.subnet_name.clone());
        let subnet = self.cloud.get_subnet(&subnet_name).await?.ok_or_else(|| {
            ControllerError::InvalidConfig(format!("subnet {} not found in virtual network {}", subnet_name, config.vnet_name))
        })?;

        let reused = service
            .ingress_ips
            .iter()
            .find(|ip| ip.contains(':') == service.ipv6 && subnet_contains(&subnet, ip));
        let (method, address) = match (service.load_balancer_ip.as_ref(), reused) {
            (Some(ip), _) => (IPAllocationMethod::Static, Some(ip.clone())),
            (None, Some(ip)) => {
                debug!("keeping ingress address {} for new frontend {}", ip, name);
                (IPAllocationMethod::Static, Some(ip.clone()))
            }
            (None, None) => (IPAllocationMethod::Dynamic, None),
        };

        let zones = old_zones.or_else(|| {
            (config.use_standard_load_balancer() && !config.has_extended_location() && !config.availability_zones.is_empty())
                .then(|| config.availability_zones.clone())
        });

        Ok(FrontendIPConfiguration {
            id: Some(id),
            name,
            zones,
            properties: FrontendIPConfigurationProperties {
                private_ip_address: address,
                private_ip_allocation_method: Some(method),
                private_ip_address_version: service.ipv6.then_some(IPVersion::IPv6),
                subnet: Some(SubResource::new(subnet.id.unwrap_or_else(|| config.subnet_id(&subnet_name)))),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    /// Converge the frontends of `lb` for `service`.
    ///
    /// Without `want_lb`, owned frontends are removed unless something outside
    /// the Service still references them. With it, stale owned frontends are
    /// replaced and a missing one is created.
    pub(crate) async fn reconcile_frontends(
        &self,
        lb: &mut azure_client::LoadBalancer,
        service: &ServiceView,
        want_lb: bool,
    ) -> Result<FrontendOutcome, ControllerError> {
        let lb_name = lb.name.clone();
        let desired_pip = if want_lb && !service.internal() {
            Some(self.determine_public_ip_name(service).await?)
        } else {
            None
        };

        let mut outcome = FrontendOutcome::default();
        let mut kept = Vec::new();
        let mut old_zones = None;
        for fip in std::mem::take(&mut lb.properties.frontend_ip_configurations) {
            let (owns, primary) = self.service_owns_frontend(&fip, service).await?;
            if !owns {
                kept.push(fip);
                continue;
            }
            let fip_id = fip.id.clone().unwrap_or_else(|| self.frontend_id(&lb_name, &fip.name));

            if !want_lb {
                if frontend_in_use(&lb.properties, &fip_id, service) {
                    self.warn_event(
                        service,
                        reasons::FRONTEND_IN_USE,
                        actions::DELETE,
                        format!("frontend {} of {} is still referenced by other rules, keeping it", fip.name, lb_name),
                    )
                    .await;
                    kept.push(fip);
                    continue;
                }
                info!("removing frontend {} from {}", fip.name, lb_name);
                outcome.removed_ids.push(fip_id);
                outcome.dirty = true;
                continue;
            }

            if self.is_frontend_ip_changed(&fip, service, primary, desired_pip.as_ref().map(|(n, _)| n.as_str())) {
                info!("frontend {} of {} changed, recreating it", fip.name, lb_name);
                old_zones = fip.zones.clone();
                outcome.removed_ids.push(fip_id);
                outcome.dirty = true;
                continue;
            }
            if outcome.owned.is_none() {
                outcome.owned = Some(fip.clone());
            }
            kept.push(fip);
        }
        lb.properties.frontend_ip_configurations = kept;

        if !want_lb || outcome.owned.is_some() {
            return Ok(outcome);
        }

        let name = frontend_name(service);
        let id = self.frontend_id(&lb_name, &name);
        // A frontend recreated under the same name is not a removal
        outcome.removed_ids.retain(|removed| !removed.eq_ignore_ascii_case(&id));

        let fip = match desired_pip {
            None => self.new_internal_frontend(service, id, name, old_zones).await?,
            Some((pip_name, must_exist)) => {
                let pip = self.ensure_public_ip_exists(service, &pip_name, must_exist).await?;
                let pip_id = pip.id.ok_or_else(|| {
                    ControllerError::Reconciliation(format!("public IP {} has no resource ID", pip_name))
                })?;
                FrontendIPConfiguration {
                    id: Some(id),
                    name,
                    properties: FrontendIPConfigurationProperties {
                        public_ip_address: Some(SubResource::new(pip_id)),
                        ..Default::default()
                    },
                    ..Default::default()
                }
            }
        };
        info!("adding frontend {} to {}", fip.name, lb_name);
        outcome.owned = Some(fip.clone());
        outcome.dirty = true;
        lb.properties.frontend_ip_configurations.push(fip);
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_in_cidr() {
        assert!(ip_in_cidr("10.240.3.4", "10.240.0.0/16"));
        assert!(!ip_in_cidr("10.241.0.1", "10.240.0.0/16"));
        assert!(ip_in_cidr("1.2.3.4", "0.0.0.0/0"));
        assert!(ip_in_cidr("fd00::5", "fd00::/64"));
        assert!(!ip_in_cidr("fd00::5", "10.0.0.0/8"));
        assert!(!ip_in_cidr("garbage", "10.0.0.0/8"));
    }
}
