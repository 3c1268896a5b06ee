//! Public IPs of external Services.
//!
//! A public IP belongs to the Services listed in its service tag. IPs with
//! no service tag were created by the user and are only ever selected, never
//! tagged, released or deleted by the controller.

use super::Reconciler;
use crate::consts::*;
use crate::error::ControllerError;
use crate::events::{actions, reasons};
use crate::naming::{frontend_base_name, last_segment, parent_name, public_ip_name};
use crate::service_view::ServiceView;
use crate::tags::{
    bind_service, cluster_tag, dns_label_service_tag, find_key, lists_service, parse_tags, reconcile_tags, service_names,
    service_tag, unbind_service,
};
use azure_client::{
    CacheReadType, FrontendIPConfiguration, IPAllocationMethod, IPVersion, IpTag, LoadBalancingRule, PublicIPAddress,
    PublicIPAddressDnsSettings, PublicIPAddressProperties, Sku, SkuName, SubResource, Tags,
};
use futures::future::join_all;
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Tag keys the controller writes itself; tag reconciliation never drops them
const MANAGED_TAG_KEYS: [&str; 6] = [
    SERVICE_TAG_KEY,
    LEGACY_SERVICE_TAG_KEY,
    CLUSTER_NAME_TAG_KEY,
    LEGACY_CLUSTER_NAME_TAG_KEY,
    SERVICE_USING_DNS_TAG_KEY,
    LEGACY_SERVICE_USING_DNS_TAG_KEY,
];

fn sorted_ip_tags(tags: Option<&Vec<IpTag>>) -> Vec<IpTag> {
    let mut tags = tags.cloned().unwrap_or_default();
    tags.sort_by(|a, b| {
        (a.ip_tag_type.to_lowercase(), a.tag.to_lowercase()).cmp(&(b.ip_tag_type.to_lowercase(), b.tag.to_lowercase()))
    });
    tags
}

fn ip_tags_equal(a: Option<&Vec<IpTag>>, b: Option<&Vec<IpTag>>) -> bool {
    let (a, b) = (sorted_ip_tags(a), sorted_ip_tags(b));
    a.len() == b.len()
        && a.iter().zip(&b).all(|(x, y)| {
            x.ip_tag_type.eq_ignore_ascii_case(&y.ip_tag_type) && x.tag.eq_ignore_ascii_case(&y.tag)
        })
}

impl Reconciler {
    /// Name of the public IP an external Service should use, and whether it
    /// must already exist
    pub(crate) async fn determine_public_ip_name(&self, service: &ServiceView) -> Result<(String, bool), ControllerError> {
        if let Some(name) = &service.options.pip_name {
            return Ok((name.clone(), true));
        }
        let Some(ip) = service.load_balancer_ip.as_deref().filter(|_| service.options.pip_prefix_id.is_none()) else {
            let mut name = public_ip_name(&frontend_base_name(service));
            if service.ipv6 {
                name.push_str(IPV6_SUFFIX);
            }
            return Ok((name, false));
        };

        let rg = self.public_ip_resource_group(service);
        let pips = self.cloud.list_public_ips(&rg, CacheReadType::Default).await?;
        match pips.into_iter().find(|pip| pip.properties.ip_address.as_deref() == Some(ip)) {
            Some(pip) => Ok((pip.name, true)),
            None => Err(ControllerError::PublicIpNotFound(format!(
                "no public IP with address {} in resource group {}",
                ip, rg
            ))),
        }
    }

    /// `(owns, user_assigned)` for `pip` as seen by `service`
    pub(crate) fn public_ip_ownership(&self, service: &ServiceView, pip: &PublicIPAddress) -> (bool, bool) {
        let selects = service
            .options
            .pip_name
            .as_deref()
            .is_some_and(|n| n.eq_ignore_ascii_case(&pip.name))
            || (service.load_balancer_ip.is_some()
                && service.load_balancer_ip.as_deref() == pip.properties.ip_address.as_deref());

        if service_tag(&pip.tags).is_none() {
            return (selects, true);
        }
        if lists_service(&pip.tags, &service.key()) {
            let same_cluster = cluster_tag(&pip.tags).is_none_or(|c| c.eq_ignore_ascii_case(self.cluster_name()));
            return (same_cluster, false);
        }
        (selects, false)
    }

    /// Desired tags for a controller-owned public IP, keeping the keys the
    /// controller writes itself
    fn desired_public_ip_tags(&self, service: &ServiceView, current: &Tags) -> Tags {
        let config = self.config();
        let mut desired = parse_tags(&config.tags, &config.tags_map);
        for (key, value) in &service.options.pip_tags {
            if let Some(existing) = find_key(&desired, key).map(str::to_string) {
                desired.remove(&existing);
            }
            desired.insert(key.clone(), value.clone());
        }
        for key in MANAGED_TAG_KEYS {
            if let Some(value) = current.get(key) {
                desired.insert(key.to_string(), value.clone());
            }
        }
        desired
    }

    fn new_public_ip(&self, service: &ServiceView, name: &str) -> PublicIPAddress {
        let config = self.config();
        let standard = config.use_standard_load_balancer();
        let mut tags = Tags::new();
        tags.insert(SERVICE_TAG_KEY.to_string(), service.key());
        tags.insert(CLUSTER_NAME_TAG_KEY.to_string(), self.cluster_name().to_string());
        PublicIPAddress {
            name: name.to_string(),
            location: Some(config.location.clone()),
            tags,
            sku: Some(Sku {
                name: if standard { SkuName::Standard } else { SkuName::Basic },
            }),
            zones: (standard && !config.has_extended_location() && !config.availability_zones.is_empty())
                .then(|| config.availability_zones.clone()),
            extended_location: config.extended_location(),
            properties: PublicIPAddressProperties {
                public_ip_allocation_method: Some(IPAllocationMethod::Static),
                public_ip_address_version: Some(if service.ipv6 { IPVersion::IPv6 } else { IPVersion::IPv4 }),
                ip_tags: service.options.ip_tags.clone(),
                public_ip_prefix: service.options.pip_prefix_id.clone().map(SubResource::new),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Apply the DNS label annotation. Returns whether `pip` changed.
    fn reconcile_dns_label(
        &self,
        service: &ServiceView,
        pip: &mut PublicIPAddress,
        user_assigned: bool,
    ) -> Result<bool, ControllerError> {
        let Some(label) = service.options.dns_label.as_deref() else {
            return Ok(false);
        };
        let key = service.key();
        let current = pip
            .properties
            .dns_settings
            .as_ref()
            .and_then(|d| d.domain_name_label.clone())
            .filter(|l| !l.is_empty());

        if let Some(holder) = dns_label_service_tag(&pip.tags).filter(|h| !h.eq_ignore_ascii_case(&key)) {
            if current.as_deref() == Some(label) {
                debug!(
                    "public IP {} already carries DNS label {} for {}, leaving it",
                    pip.name, label, holder
                );
                return Ok(false);
            }
            return Err(ControllerError::DnsLabelInUse(format!(
                "public IP {} has DNS label {:?} held by service {}, {} cannot set {:?}",
                pip.name,
                current.unwrap_or_default(),
                holder,
                key,
                label
            )));
        }

        let mut changed = false;
        if label.is_empty() {
            if current.is_some() {
                info!("clearing DNS label of public IP {}", pip.name);
                pip.properties.dns_settings = None;
                changed = true;
            }
            if !user_assigned && dns_label_service_tag(&pip.tags).is_some() {
                pip.tags.remove(SERVICE_USING_DNS_TAG_KEY);
                pip.tags.remove(LEGACY_SERVICE_USING_DNS_TAG_KEY);
                changed = true;
            }
            return Ok(changed);
        }

        if current.as_deref() != Some(label) {
            info!("setting DNS label {} on public IP {}", label, pip.name);
            pip.properties.dns_settings = Some(PublicIPAddressDnsSettings {
                domain_name_label: Some(label.to_string()),
                fqdn: None,
            });
            changed = true;
        }
        if !user_assigned && dns_label_service_tag(&pip.tags).is_none_or(|h| !h.eq_ignore_ascii_case(&key)) {
            pip.tags.insert(SERVICE_USING_DNS_TAG_KEY.to_string(), key);
            changed = true;
        }
        Ok(changed)
    }

    /// Create or update public IP `name` for `service` and return it as ARM has it
    pub(crate) async fn ensure_public_ip_exists(
        &self,
        service: &ServiceView,
        name: &str,
        must_exist: bool,
    ) -> Result<PublicIPAddress, ControllerError> {
        let rg = self.public_ip_resource_group(service);
        let key = service.key();
        let existing = self.cloud.get_public_ip(&rg, name, CacheReadType::Default).await?;

        let (mut pip, user_assigned, mut changed) = match existing {
            Some(mut pip) => {
                let (_, user_assigned) = self.public_ip_ownership(service, &pip);
                let bound = !user_assigned && bind_service(&mut pip.tags, &key);
                if bound {
                    info!("adding service {} to the owners of public IP {}", key, pip.name);
                }
                (pip, user_assigned, bound)
            }
            None if must_exist => {
                return Err(ControllerError::PublicIpNotFound(format!(
                    "public IP {} in resource group {} does not exist",
                    name, rg
                )));
            }
            None => {
                info!("creating public IP {}/{} for {}", rg, name, key);
                (self.new_public_ip(service, name), false, true)
            }
        };

        if !user_assigned {
            let desired = self.desired_public_ip_tags(service, &pip.tags);
            changed |= reconcile_tags(&mut pip.tags, &desired, &self.config().system_tag_keys());
        }
        changed |= self.reconcile_dns_label(service, &mut pip, user_assigned)?;

        let must_be_static = self.config().use_standard_load_balancer() || service.ipv6;
        if must_be_static && pip.properties.public_ip_allocation_method != Some(IPAllocationMethod::Static) {
            pip.properties.public_ip_allocation_method = Some(IPAllocationMethod::Static);
            changed = true;
        }

        let version = if service.ipv6 { IPVersion::IPv6 } else { IPVersion::IPv4 };
        if pip.properties.public_ip_address_version != Some(version) {
            info!("switching public IP {} to {:?} for {}", pip.name, version, key);
            pip.properties.public_ip_address_version = Some(version);
            changed = true;
        }

        if changed {
            if let Err(e) = self.cloud.create_or_update_public_ip(&rg, &pip).await {
                self.warn_event(service, reasons::CREATE_PUBLIC_IP_FAILED, actions::ENSURE, e.to_string())
                    .await;
                return Err(e.into());
            }
        }

        self.cloud
            .get_public_ip(&rg, name, CacheReadType::ForceRefresh)
            .await?
            .ok_or_else(|| ControllerError::Reconciliation(format!("public IP {}/{} disappeared after update", rg, name)))
    }

    /// Release public IPs the Service no longer uses and make sure the one it
    /// wants exists. Returns the wanted IP for external Services.
    pub(crate) async fn reconcile_public_ips(
        &self,
        service: &ServiceView,
        want_lb: bool,
    ) -> Result<Option<PublicIPAddress>, ControllerError> {
        let rg = self.public_ip_resource_group(service);
        let key = service.key();
        let internal = service.internal();
        let action = if want_lb { actions::ENSURE } else { actions::DELETE };
        let desired = if want_lb && !internal {
            Some(self.determine_public_ip_name(service).await?)
        } else {
            None
        };

        let mut to_update = Vec::new();
        let mut to_delete = Vec::new();
        for mut pip in self.cloud.list_public_ips(&rg, CacheReadType::Default).await? {
            let (owns, user_assigned) = self.public_ip_ownership(service, &pip);
            if !owns {
                continue;
            }
            let is_desired = desired.as_ref().is_some_and(|(n, _)| n.eq_ignore_ascii_case(&pip.name));
            let ip_tags_changed = service
                .options
                .ip_tags
                .as_ref()
                .is_some_and(|want| !ip_tags_equal(Some(want), pip.properties.ip_tags.as_ref()));
            let release = !want_lb || internal || !is_desired || (ip_tags_changed && !user_assigned);
            if !release {
                continue;
            }

            let before = pip.tags.clone();
            unbind_service(&mut pip.tags, &key, user_assigned);
            if !user_assigned && service_names(&pip.tags).is_empty() {
                info!("public IP {} has no owner left after releasing {}, deleting it", pip.name, key);
                to_delete.push(pip);
            } else if pip.tags != before {
                info!("releasing public IP {} from {}", pip.name, key);
                to_update.push(pip);
            }
        }

        let updates = to_update.iter().map(|pip| self.cloud.create_or_update_public_ip(&rg, pip));
        for result in join_all(updates).await {
            if let Err(e) = result {
                self.warn_event(service, reasons::CREATE_PUBLIC_IP_FAILED, action, e.to_string())
                    .await;
                return Err(e.into());
            }
        }

        for pip in &to_delete {
            self.detach_public_ip_from_load_balancer(service, pip).await?;
            if let Err(e) = self.cloud.delete_public_ip(&rg, &pip.name).await {
                self.warn_event(service, reasons::DELETE_PUBLIC_IP_FAILED, action, e.to_string())
                    .await;
                return Err(e.into());
            }
        }

        match desired {
            Some((name, must_exist)) => Ok(Some(self.ensure_public_ip_exists(service, &name, must_exist).await?)),
            None => Ok(None),
        }
    }

    /// Remove the frontend using `pip`, and the rules on it, from its load balancer
    async fn detach_public_ip_from_load_balancer(
        &self,
        service: &ServiceView,
        pip: &PublicIPAddress,
    ) -> Result<(), ControllerError> {
        let (Some(pip_id), Some(config_id)) = (pip.id.as_deref(), pip.properties.ip_configuration.as_ref()) else {
            return Ok(());
        };
        let Some(lb_name) = parent_name(config_id.id(), "loadBalancers") else {
            debug!("public IP {} is used by {}, not a load balancer", pip.name, config_id.id());
            return Ok(());
        };
        let Some(mut lb) = self.cloud.get_load_balancer(lb_name, CacheReadType::ForceRefresh).await? else {
            return Ok(());
        };

        // The cached IP may point at a frontend since recreated on another address
        let uses_pip = |fip: &FrontendIPConfiguration| {
            fip.properties
                .public_ip_address
                .as_ref()
                .is_some_and(|r| r.id().eq_ignore_ascii_case(pip_id))
        };
        let Some(fip) = lb.properties.frontend_ip_configurations.iter().find(|f| uses_pip(f)) else {
            return Ok(());
        };
        let fip_name = fip.name.clone();
        let fip_id = fip.id.clone().unwrap_or_else(|| self.frontend_id(&lb.name, &fip_name));
        warn!(
            "public IP {} is still used by frontend {} of {}, removing the frontend first",
            pip.name, fip_name, lb.name
        );

        let props = &mut lb.properties;
        props.frontend_ip_configurations.retain(|f| !uses_pip(f));
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut props.load_balancing_rules)
            .into_iter()
            .partition(|rule| {
                rule.properties
                    .frontend_ip_configuration
                    .as_ref()
                    .is_some_and(|f| f.id().eq_ignore_ascii_case(&fip_id))
            });
        props.load_balancing_rules = kept;

        // Health checks only the removed rules pointed at go with them
        let health_check_of = |rule: &LoadBalancingRule| {
            rule.properties
                .probe
                .as_ref()
                .map(|p| last_segment(p.id()).to_lowercase())
        };
        let still_used: HashSet<String> = props.load_balancing_rules.iter().filter_map(health_check_of).collect();
        let orphaned: HashSet<String> = removed
            .iter()
            .filter_map(health_check_of)
            .filter(|name| !still_used.contains(name))
            .collect();
        props
            .probes
            .retain(|check| !orphaned.contains(&check.name.to_lowercase()));

        if lb.properties.frontend_ip_configurations.is_empty() {
            self.clean_orphaned_load_balancer(&lb, service).await?;
        } else {
            self.cloud.create_or_update_load_balancer(&lb).await?;
        }
        Ok(())
    }
}
