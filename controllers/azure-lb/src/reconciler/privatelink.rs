//! Private link service attached to an internal Service's frontend.

use super::Reconciler;
use crate::consts::*;
use crate::error::ControllerError;
use crate::events::{actions, reasons};
use crate::naming::private_link_service_name;
use crate::service_view::ServiceView;
use crate::tags::cluster_tag;
use azure_client::{
    CacheReadType, FrontendIPConfiguration, IPAllocationMethod, IPVersion, PrivateLinkService,
    PrivateLinkServiceIPConfiguration, PrivateLinkServiceIPConfigurationProperties, SubResource, SubscriptionList,
};
use tracing::{debug, info};

fn owner_tag(pls: &PrivateLinkService) -> Option<&str> {
    pls.tags
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(OWNER_SERVICE_TAG_KEY))
        .map(|(_, v)| v.as_str())
}

fn subscription_list(subscriptions: &[String]) -> Option<SubscriptionList> {
    (!subscriptions.is_empty()).then(|| SubscriptionList {
        subscriptions: subscriptions.to_vec(),
    })
}

/// Identity of an IP configuration for comparison: dynamic addresses are
/// assigned by ARM and ignored
fn ip_configuration_key(config: &PrivateLinkServiceIPConfiguration) -> (String, bool, Option<String>, String, bool) {
    let props = &config.properties;
    let is_static = props.private_ip_allocation_method == Some(IPAllocationMethod::Static);
    (
        config.name.to_lowercase(),
        is_static,
        props.private_ip_address.clone().filter(|_| is_static),
        props.subnet.as_ref().map(|s| s.id().to_lowercase()).unwrap_or_default(),
        props.primary.unwrap_or(false),
    )
}

fn sorted_lower(values: &[String]) -> Vec<String> {
    let mut values: Vec<String> = values.iter().map(|v| v.to_lowercase()).collect();
    values.sort();
    values
}

impl Reconciler {
    fn pls_ip_configurations(
        &self,
        service: &ServiceView,
        subnet_name: &str,
        subnet_id: &str,
        pls_name: &str,
    ) -> Result<Vec<PrivateLinkServiceIPConfiguration>, ControllerError> {
        let options = &service.options.pls;
        let count = options.ip_configuration_count.unwrap_or(PLS_IP_CONFIG_COUNT_MIN);
        if count < options.static_ips.len() {
            return Err(ControllerError::annotation(
                ANNOTATION_PLS_IP_CONFIGURATION_IP_COUNT,
                format!(
                    "{} IP configurations cannot hold {} static addresses",
                    count,
                    options.static_ips.len()
                ),
            ));
        }

        let config = |name: String, address: Option<String>, primary: bool| PrivateLinkServiceIPConfiguration {
            name,
            properties: PrivateLinkServiceIPConfigurationProperties {
                private_ip_allocation_method: Some(if address.is_some() {
                    IPAllocationMethod::Static
                } else {
                    IPAllocationMethod::Dynamic
                }),
                private_ip_address: address,
                subnet: Some(SubResource::new(subnet_id)),
                primary: Some(primary),
                private_ip_address_version: Some(IPVersion::IPv4),
            },
        };

        let mut configs: Vec<PrivateLinkServiceIPConfiguration> = options
            .static_ips
            .iter()
            .enumerate()
            .map(|(i, ip)| config(format!("{}-{}-static-{}", subnet_name, pls_name, ip), Some(ip.clone()), i == 0))
            .collect();
        let statics = configs.len();
        configs.extend(
            (0..count - statics)
                .map(|i| config(format!("{}-{}-dynamic-{}", subnet_name, pls_name, i), None, statics == 0 && i == 0)),
        );
        Ok(configs)
    }

    /// Private link services need network policies disabled on their subnet
    async fn prepare_pls_subnet(&self, subnet_name: &str) -> Result<String, ControllerError> {
        let config = self.config();
        let mut subnet = self.cloud.get_subnet(subnet_name).await?.ok_or_else(|| {
            ControllerError::InvalidConfig(format!(
                "subnet {} not found in virtual network {}",
                subnet_name, config.vnet_name
            ))
        })?;
        if subnet.properties.private_link_service_network_policies.as_deref() != Some(PLS_NETWORK_POLICIES_DISABLED) {
            info!("disabling private link service network policies on subnet {}", subnet_name);
            subnet.properties.private_link_service_network_policies = Some(PLS_NETWORK_POLICIES_DISABLED.to_string());
            subnet = self.cloud.create_or_update_subnet(&subnet).await?;
        }
        Ok(subnet.id.unwrap_or_else(|| config.subnet_id(subnet_name)))
    }

    /// Create, update or remove the private link service on frontend `fip`.
    ///
    /// With `want_pls` the service is created only when the Service asks for
    /// it; without, the one this Service owns is deleted. A private link
    /// service owned by another Service is shared as is, unless this Service
    /// tries to shape it with annotations of its own.
    pub(crate) async fn reconcile_private_link_service(
        &self,
        service: &ServiceView,
        fip: &FrontendIPConfiguration,
        want_pls: bool,
    ) -> Result<(), ControllerError> {
        let key = service.key();
        let action = if want_pls { actions::ENSURE } else { actions::DELETE };
        let options = &service.options.pls;
        let create = want_pls && options.create;
        if create {
            if !service.internal() && !service.options.disable_floating_ip {
                return Err(ControllerError::PrivateLinkService(format!(
                    "{} must be internal or disable floating IP to get a private link service",
                    key
                )));
            }
            if service.ipv6 {
                return Err(ControllerError::PrivateLinkService(format!(
                    "{} has an IPv6 frontend, private link services only support IPv4",
                    key
                )));
            }
        }

        let fip_id = fip
            .id
            .clone()
            .ok_or_else(|| ControllerError::Reconciliation(format!("frontend {} has no resource ID", fip.name)))?;
        let existing = self
            .cloud
            .get_private_link_service_by_frontend(&fip_id, CacheReadType::Default)
            .await?;

        if let Some(pls) = &existing {
            if !cluster_tag(&pls.tags).is_some_and(|c| c.eq_ignore_ascii_case(self.cluster_name())) {
                if create {
                    return Err(ControllerError::PrivateLinkService(format!(
                        "frontend {} already has private link service {} not managed by this cluster",
                        fip.name, pls.name
                    )));
                }
                return Ok(());
            }
            if let Some(owner) = owner_tag(pls).filter(|o| !o.eq_ignore_ascii_case(&key)) {
                if create && options.has_additional_configs {
                    return Err(ControllerError::PrivateLinkService(format!(
                        "private link service {} on frontend {} is owned by service {}",
                        pls.name, fip.name, owner
                    )));
                }
                debug!("{} shares private link service {} owned by {}", key, pls.name, owner);
                return Ok(());
            }
        }

        if !create {
            if let Some(pls) = existing {
                info!("deleting private link service {} of {}", pls.name, key);
                if let Err(e) = self.cloud.delete_private_link_service(&pls).await {
                    self.warn_event(service, reasons::PRIVATE_LINK_SERVICE_FAILED, action, e.to_string())
                        .await;
                    return Err(e.into());
                }
            }
            return Ok(());
        }

        let config = self.config();
        let mut dirty = existing.is_none();
        let mut pls = match existing {
            Some(pls) => {
                if let Some(name) = options.name.as_deref().filter(|n| !n.eq_ignore_ascii_case(&pls.name)) {
                    return Err(ControllerError::PrivateLinkService(format!(
                        "private link service {} cannot be renamed to {}",
                        pls.name, name
                    )));
                }
                if pls.properties.provisioning_state.as_deref() == Some(PROVISIONING_STATE_FAILED) {
                    info!("private link service {} is in a failed state, updating it", pls.name);
                    dirty = true;
                }
                pls
            }
            None => PrivateLinkService {
                name: options
                    .name
                    .clone()
                    .unwrap_or_else(|| private_link_service_name(&fip.name)),
                location: Some(config.location.clone()),
                extended_location: config.extended_location(),
                ..Default::default()
            },
        };

        let props = &mut pls.properties;
        if !props
            .load_balancer_frontend_ip_configurations
            .iter()
            .any(|f| f.id().eq_ignore_ascii_case(&fip_id))
        {
            props.load_balancer_frontend_ip_configurations = vec![SubResource::new(fip_id.clone())];
            dirty = true;
        }

        let subnet_name = options
            .ip_configuration_subnet
            .clone()
            .or_else(|| service.options.internal_subnet.clone())
            .unwrap_or_else(|| config.subnet_name.clone());
        let subnet_id = self.prepare_pls_subnet(&subnet_name).await?;
        let desired = self.pls_ip_configurations(service, &subnet_name, &subnet_id, &pls.name)?;
        let props = &mut pls.properties;
        let mut have: Vec<_> = props.ip_configurations.iter().map(ip_configuration_key).collect();
        let mut want: Vec<_> = desired.iter().map(ip_configuration_key).collect();
        have.sort();
        want.sort();
        if have != want {
            debug!("ip configurations of private link service {} changed", pls.name);
            props.ip_configurations = desired;
            dirty = true;
        }

        if props.enable_proxy_protocol.unwrap_or(false) != options.proxy_protocol {
            props.enable_proxy_protocol = Some(options.proxy_protocol);
            dirty = true;
        }
        if sorted_lower(&props.fqdns) != sorted_lower(&options.fqdns) {
            props.fqdns = options.fqdns.clone();
            dirty = true;
        }
        let visibility = subscription_list(&options.visibility);
        if props.visibility != visibility {
            props.visibility = visibility;
            dirty = true;
        }
        let auto_approval = subscription_list(&options.auto_approval);
        if props.auto_approval != auto_approval {
            props.auto_approval = auto_approval;
            dirty = true;
        }

        for (tag, value) in [
            (CLUSTER_NAME_TAG_KEY, self.cluster_name().to_string()),
            (OWNER_SERVICE_TAG_KEY, key.clone()),
        ] {
            if pls.tags.get(tag) != Some(&value) {
                pls.tags.insert(tag.to_string(), value);
                dirty = true;
            }
        }

        if !dirty {
            debug!("private link service {} is up to date", pls.name);
            return Ok(());
        }
        info!("updating private link service {} for {}", pls.name, key);
        // Load balancer writes bump the etag on ARM's side
        pls.etag = None;
        if let Err(e) = self.cloud.create_or_update_private_link_service(&pls).await {
            self.warn_event(service, reasons::PRIVATE_LINK_SERVICE_FAILED, action, e.to_string())
                .await;
            return Err(e.into());
        }
        Ok(())
    }
}
