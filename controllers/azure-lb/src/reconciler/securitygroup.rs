//! Security rules opening the Service's ports on the cluster security group.
//!
//! Rules are named `{prefix}-{Protocol}-{port}-{source}`; the prefix is the
//! Service's frontend base name, or `shared` when the Service opts into
//! rules shared with other Services, in which case destinations are merged.

use super::Reconciler;
use crate::annotations::parse_cidr;
use crate::consts::*;
use crate::error::ControllerError;
use crate::events::{actions, reasons};
use crate::naming::{is_rule_with_prefix, security_rule_name, security_rule_prefix};
use crate::service_view::ServiceView;
use crate::tags::{parse_tags, reconcile_tags};
use azure_client::{
    CacheReadType, SecurityRule, SecurityRuleAccess, SecurityRuleDirection, SecurityRuleProperties,
    SecurityRuleProtocol,
};
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, info};

fn prefixes(props: &SecurityRuleProperties) -> BTreeSet<String> {
    props
        .destination_address_prefix
        .iter()
        .chain(&props.destination_address_prefixes)
        .map(|p| p.to_lowercase())
        .collect()
}

fn set_destinations(props: &mut SecurityRuleProperties, destinations: &BTreeSet<String>) {
    if destinations.len() == 1 {
        props.destination_address_prefix = destinations.iter().next().cloned();
        props.destination_address_prefixes = Vec::new();
    } else {
        props.destination_address_prefix = None;
        props.destination_address_prefixes = destinations.iter().cloned().collect();
    }
}

fn rule_matches(a: &SecurityRule, b: &SecurityRule) -> bool {
    let (x, y) = (&a.properties, &b.properties);
    let eq = |l: &Option<String>, r: &Option<String>| match (l, r) {
        (Some(l), Some(r)) => l.eq_ignore_ascii_case(r),
        (l, r) => l.is_none() && r.is_none(),
    };
    a.name.eq_ignore_ascii_case(&b.name)
        && x.protocol == y.protocol
        && x.access == y.access
        && x.direction == y.direction
        && eq(&x.source_port_range, &y.source_port_range)
        && eq(&x.destination_port_range, &y.destination_port_range)
        && eq(&x.source_address_prefix, &y.source_address_prefix)
        && prefixes(x) == prefixes(y)
}

fn is_allow_all(range: &str) -> bool {
    range == DEFAULT_SOURCE_RANGE_V4 || range == DEFAULT_SOURCE_RANGE_V6
}

/// Lowest priority in the allowed band not already taken
fn next_priority(taken: &HashSet<i32>) -> Option<i32> {
    (SECURITY_RULE_PRIORITY_MIN..SECURITY_RULE_PRIORITY_MAX).find(|p| !taken.contains(p))
}

impl Reconciler {
    /// Traffic sources allowed to reach the Service
    fn security_sources(&self, service: &ServiceView) -> Vec<String> {
        let ranges: Vec<&String> = if service.source_ranges.is_empty() {
            service.options.allowed_ip_ranges.iter().collect()
        } else {
            service.source_ranges.iter().collect()
        };
        let ranges_given = !ranges.is_empty();
        let allow_all = ranges.is_empty() || ranges.iter().any(|r| is_allow_all(r));
        let service_tags = &service.options.allowed_service_tags;

        if allow_all {
            if !service_tags.is_empty() {
                return service_tags.clone();
            }
            if !service.internal() || ranges_given {
                return vec![INTERNET_SOURCE.to_string()];
            }
            return Vec::new();
        }

        let mut sources: Vec<String> = ranges
            .into_iter()
            .filter(|r| parse_cidr(r).is_some_and(|(addr, _)| addr.is_ipv6() == service.ipv6))
            .cloned()
            .collect();
        sources.extend(service_tags.iter().cloned());
        sources
    }

    /// Addresses the Service's rules let traffic through to
    async fn security_destinations(
        &self,
        service: &ServiceView,
        service_ip: Option<&str>,
        lb_name: Option<&str>,
    ) -> Result<BTreeSet<String>, ControllerError> {
        if service.options.disable_floating_ip {
            let Some(lb_name) = lb_name else {
                return Ok(BTreeSet::new());
            };
            let Some(lb) = self.cloud.get_load_balancer(lb_name, CacheReadType::Default).await? else {
                return Ok(BTreeSet::new());
            };
            let (v4, v6) = self.get_backend_private_ips(&lb).await?;
            return Ok(if service.ipv6 { v6 } else { v4 }.into_iter().collect());
        }

        let mut destinations: BTreeSet<String> = service_ip.map(str::to_string).into_iter().collect();
        if !service.internal() {
            destinations.extend(service.options.additional_public_ips.iter().cloned());
        }
        Ok(destinations)
    }

    fn expected_security_rules(
        &self,
        service: &ServiceView,
        prefix: &str,
        destinations: &BTreeSet<String>,
    ) -> Vec<SecurityRule> {
        let sources = self.security_sources(service);
        let mut expected: Vec<SecurityRule> = Vec::new();
        let mut push = |rule: SecurityRule| {
            if !expected.iter().any(|r| r.name.eq_ignore_ascii_case(&rule.name)) {
                expected.push(rule);
            }
        };
        let rule = |name: String, protocol: SecurityRuleProtocol, port: i32, source: &str, access: SecurityRuleAccess| {
            let mut properties = SecurityRuleProperties {
                protocol,
                source_port_range: Some("*".to_string()),
                destination_port_range: Some(port.to_string()),
                source_address_prefix: Some(source.to_string()),
                source_address_prefixes: Vec::new(),
                destination_address_prefix: None,
                destination_address_prefixes: Vec::new(),
                access,
                priority: 0,
                direction: SecurityRuleDirection::Inbound,
                description: None,
            };
            set_destinations(&mut properties, destinations);
            SecurityRule {
                id: None,
                name,
                etag: None,
                properties,
            }
        };

        for port in &service.ports {
            let destination_port = if service.options.disable_floating_ip {
                port.node_port
            } else {
                port.port
            };
            for source in &sources {
                push(rule(
                    security_rule_name(prefix, port.protocol, port.port, source),
                    port.protocol.security(),
                    destination_port,
                    source.as_str(),
                    SecurityRuleAccess::Allow,
                ));
            }
            if service.options.deny_all_except_source_ranges {
                push(rule(
                    security_rule_name(prefix, port.protocol, port.port, "deny_all"),
                    port.protocol.security(),
                    destination_port,
                    "*",
                    SecurityRuleAccess::Deny,
                ));
            }
        }
        expected
    }

    /// Converge the cluster security group for `service`.
    ///
    /// `service_ip` is the frontend address; `lb_name` is needed when floating
    /// IP is disabled and the rules target the backend node addresses.
    pub(crate) async fn reconcile_security_group(
        &self,
        service: &ServiceView,
        service_ip: Option<&str>,
        lb_name: Option<&str>,
        want_lb: bool,
    ) -> Result<(), ControllerError> {
        let config = self.config();
        let action = if want_lb { actions::ENSURE } else { actions::DELETE };
        let Some(mut nsg) = self.cloud.get_security_group(CacheReadType::Default).await? else {
            return Err(ControllerError::InvalidConfig(format!(
                "security group {} not found",
                config.security_group_name
            )));
        };

        let destinations = self.security_destinations(service, service_ip, lb_name).await?;
        if want_lb && destinations.is_empty() {
            return Err(ControllerError::Reconciliation(format!(
                "no destination address for the security rules of {}",
                service.key()
            )));
        }
        let prefix = security_rule_prefix(service);
        let expected = if want_lb {
            self.expected_security_rules(service, &prefix, &destinations)
        } else {
            Vec::new()
        };
        let ours: BTreeSet<String> = destinations.iter().map(|d| d.to_lowercase()).collect();

        let rules = &mut nsg.properties.security_rules;
        let mut dirty = false;
        let mut released = Vec::new();

        if service.options.shared_security_rule {
            // Addresses last published for the Service that it no longer serves
            let previous: BTreeSet<String> = service
                .ingress_ips
                .iter()
                .map(|ip| ip.to_lowercase())
                .filter(|ip| !ours.contains(ip))
                .collect();
            let everything: BTreeSet<String> = ours.union(&previous).cloned().collect();
            for rule in rules.iter_mut() {
                if !is_rule_with_prefix(&prefix, &rule.name) {
                    continue;
                }
                let wanted = expected.iter().any(|e| e.name.eq_ignore_ascii_case(&rule.name));
                let release = if wanted { &previous } else { &everything };
                let current = prefixes(&rule.properties);
                let remaining: BTreeSet<String> = current.difference(release).cloned().collect();
                if remaining.len() != current.len() {
                    info!("removing {} from shared security rule {}", service.key(), rule.name);
                    set_destinations(&mut rule.properties, &remaining);
                    dirty = true;
                }
            }
            let before = rules.len();
            rules.retain(|rule| !is_rule_with_prefix(&prefix, &rule.name) || !prefixes(&rule.properties).is_empty());
            dirty |= rules.len() != before;
        } else {
            rules.retain(|rule| {
                if !is_rule_with_prefix(&prefix, &rule.name) || expected.iter().any(|e| rule_matches(e, rule)) {
                    return true;
                }
                debug!("security rule {} of {} is stale", rule.name, service.key());
                released.push((rule.name.clone(), rule.properties.priority));
                dirty = true;
                false
            });
        }

        let mut taken: HashSet<i32> = rules.iter().map(|r| r.properties.priority).collect();
        for mut want in expected {
            if let Some(existing) = rules.iter_mut().find(|r| r.name.eq_ignore_ascii_case(&want.name)) {
                if service.options.shared_security_rule {
                    let current = prefixes(&existing.properties);
                    let merged: BTreeSet<String> = current.union(&ours).cloned().collect();
                    if merged != current {
                        info!("adding {} to shared security rule {}", service.key(), existing.name);
                        set_destinations(&mut existing.properties, &merged);
                        dirty = true;
                    }
                }
                continue;
            }

            let reused = released
                .iter()
                .find(|(name, priority)| name.eq_ignore_ascii_case(&want.name) && !taken.contains(priority))
                .map(|(_, priority)| *priority);
            let Some(priority) = reused.or_else(|| next_priority(&taken)) else {
                return Err(ControllerError::SecurityRulePriorityExhausted(format!(
                    "security group {} has no free priority for rule {}",
                    nsg.name, want.name
                )));
            };
            taken.insert(priority);
            want.properties.priority = priority;
            info!("adding security rule {} with priority {}", want.name, priority);
            rules.push(want);
            dirty = true;
        }

        if !config.tags.is_empty() || !config.tags_map.is_empty() {
            let desired = parse_tags(&config.tags, &config.tags_map);
            dirty |= reconcile_tags(&mut nsg.tags, &desired, &config.system_tag_keys());
        }

        if !dirty {
            debug!("security group {} is up to date for {}", nsg.name, service.key());
            return Ok(());
        }
        if let Err(e) = self.cloud.create_or_update_security_group(&nsg).await {
            self.warn_event(service, reasons::CREATE_SECURITY_GROUP_FAILED, action, e.to_string())
                .await;
            return Err(e.into());
        }
        Ok(())
    }
}
