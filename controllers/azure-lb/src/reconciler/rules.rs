//! Health probes and load balancing rules.
//!
//! One rule and at most one probe per Service port, all named
//! `{frontend}-{protocol}-{port}`. The frontend prefix is what marks them as
//! owned by the Service, so rules other Services attached to a shared
//! frontend are never touched here.

use super::Reconciler;
use crate::consts::*;
use crate::error::ControllerError;
use crate::naming::{frontend_name, is_service_rule, rule_name};
use crate::service_view::{PortProtocol, ServicePortView, ServiceView};
use azure_client::{
    LoadBalancer, LoadBalancingRule, LoadBalancingRuleProperties, LoadDistribution, Probe, ProbeProperties,
    ProbeProtocol, SubResource, TransportProtocol,
};
use tracing::{debug, info, warn};

/// Probes and rules a Service wants on its load balancer
#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct ExpectedRules {
    pub probes: Vec<Probe>,
    pub rules: Vec<LoadBalancingRule>,
}

fn port_annotation(port: i32, setting: &str) -> String {
    format!("{}{}_{}", PORT_ANNOTATION_PREFIX, port, setting)
}

/// Parse a probe protocol annotation value
fn parse_probe_protocol(value: &str, annotation: &str) -> Result<ProbeProtocol, ControllerError> {
    match value.to_ascii_lowercase().as_str() {
        "tcp" => Ok(ProbeProtocol::Tcp),
        "http" => Ok(ProbeProtocol::Http),
        "https" => Ok(ProbeProtocol::Https),
        _ => Err(ControllerError::annotation(
            annotation,
            format!("unsupported health probe protocol {:?}, expected Tcp, Http or Https", value),
        )),
    }
}

/// `appProtocol` is free-form; only the values a probe understands count
fn app_protocol_probe(port: &ServicePortView) -> Option<ProbeProtocol> {
    match port.app_protocol.as_deref()?.to_ascii_lowercase().as_str() {
        "tcp" => Some(ProbeProtocol::Tcp),
        "http" => Some(ProbeProtocol::Http),
        "https" => Some(ProbeProtocol::Https),
        _ => None,
    }
}

fn ids_equal(a: Option<&SubResource>, b: Option<&SubResource>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.id().eq_ignore_ascii_case(b.id()),
        (None, None) => true,
        _ => false,
    }
}

fn rule_equal(a: &LoadBalancingRule, b: &LoadBalancingRule) -> bool {
    let (x, y) = (&a.properties, &b.properties);
    a.name.eq_ignore_ascii_case(&b.name)
        && x.protocol == y.protocol
        && x.frontend_port == y.frontend_port
        && x.backend_port == y.backend_port
        && x.idle_timeout_in_minutes == y.idle_timeout_in_minutes
        && x.load_distribution == y.load_distribution
        && x.enable_floating_ip == y.enable_floating_ip
        && x.enable_tcp_reset == y.enable_tcp_reset
        && x.disable_outbound_snat.unwrap_or(false) == y.disable_outbound_snat.unwrap_or(false)
        && ids_equal(x.frontend_ip_configuration.as_ref(), y.frontend_ip_configuration.as_ref())
        && ids_equal(x.backend_address_pool.as_ref(), y.backend_address_pool.as_ref())
        && ids_equal(x.probe.as_ref(), y.probe.as_ref())
}

fn probe_equal(a: &Probe, b: &Probe) -> bool {
    a.name.eq_ignore_ascii_case(&b.name) && a.properties == b.properties
}

impl Reconciler {
    /// Probes and rules for `service` on frontend `fip_id` of `lb_name`
    pub(crate) fn expected_rules_and_probes(
        &self,
        service: &ServiceView,
        lb_name: &str,
        fip_id: &str,
    ) -> Result<ExpectedRules, ControllerError> {
        let standard = self.config().use_standard_load_balancer();
        let internal = service.internal();
        let fip_name = frontend_name(service);
        let pool_id = self.backend_pool_id(lb_name);
        let mut expected = ExpectedRules::default();

        if internal && standard && service.options.ha_ports {
            let Some(port) = service.ports.first() else {
                return Ok(expected);
            };
            let name = rule_name(&fip_name, port.protocol, port.port);
            let probe = self.expected_probe(service, port, &name)?;
            let probe_id = probe.as_ref().map(|p| self.probe_id(lb_name, &p.name));
            expected.probes.extend(probe);
            expected
                .rules
                .push(self.build_rule(service, port, name, fip_id, &pool_id, probe_id, true));
            return Ok(expected);
        }

        let mut sctp_rule = false;
        for port in &service.ports {
            if service.options.port(port.port).is_some_and(|o| o.no_lb_rule) {
                debug!("skipping rule for port {} of {}: no_lb_rule is set", port.port, service.key());
                continue;
            }
            let all_ports = port.protocol == PortProtocol::Sctp;
            if all_ports {
                if !(standard && internal) {
                    return Err(ControllerError::InvalidService(format!(
                        "SCTP port {} of {} needs an internal standard load balancer",
                        port.port,
                        service.key()
                    )));
                }
                if sctp_rule {
                    warn!(
                        "{} has more than one SCTP port, port {} is already covered by the all-ports rule",
                        service.key(),
                        port.port
                    );
                    continue;
                }
                sctp_rule = true;
            }

            let name = rule_name(&fip_name, port.protocol, port.port);
            let probe = self.expected_probe(service, port, &name)?;
            let probe_id = probe.as_ref().map(|p| self.probe_id(lb_name, &p.name));
            expected.probes.extend(probe);
            expected
                .rules
                .push(self.build_rule(service, port, name, fip_id, &pool_id, probe_id, all_ports));
        }
        Ok(expected)
    }

    #[allow(clippy::too_many_arguments, reason = "every argument is a distinct part of the rule")]
    fn build_rule(
        &self,
        service: &ServiceView,
        port: &ServicePortView,
        name: String,
        fip_id: &str,
        pool_id: &str,
        probe_id: Option<String>,
        all_ports: bool,
    ) -> LoadBalancingRule {
        let standard = self.config().use_standard_load_balancer();
        let internal = service.internal();
        let direct_to_node = (internal && service.ipv6) || service.options.disable_floating_ip;

        let (protocol, frontend_port, backend_port) = if all_ports {
            (TransportProtocol::All, 0, 0)
        } else if direct_to_node {
            (port.protocol.transport(), port.port, port.node_port)
        } else {
            (port.protocol.transport(), port.port, port.port)
        };

        LoadBalancingRule {
            id: None,
            name,
            properties: LoadBalancingRuleProperties {
                frontend_ip_configuration: Some(SubResource::new(fip_id)),
                backend_address_pool: Some(SubResource::new(pool_id)),
                probe: probe_id.map(SubResource::new),
                protocol,
                frontend_port,
                backend_port,
                idle_timeout_in_minutes: (port.protocol == PortProtocol::Tcp)
                    .then(|| service.options.idle_timeout.unwrap_or(IDLE_TIMEOUT_MIN)),
                load_distribution: Some(if service.client_ip_affinity {
                    LoadDistribution::SourceIp
                } else {
                    LoadDistribution::Default
                }),
                enable_floating_ip: Some(!direct_to_node),
                enable_tcp_reset: standard.then_some(true),
                disable_outbound_snat: (self.config().disable_outbound_snat && standard && !internal).then_some(true),
            },
        }
    }

    /// The probe for one port, `None` when the port is not probed
    fn expected_probe(
        &self,
        service: &ServiceView,
        port: &ServicePortView,
        name: &str,
    ) -> Result<Option<Probe>, ControllerError> {
        let options = &service.options;
        let port_options = options.port(port.port).cloned().unwrap_or_default();

        let interval = port_options
            .probe_interval
            .or(options.probe_interval)
            .unwrap_or(PROBE_INTERVAL_DEFAULT);
        let count = port_options
            .probe_num_of_probe
            .or(options.probe_num_of_probe)
            .unwrap_or(PROBE_NUM_DEFAULT);
        if interval * count >= PROBE_TOTAL_LIMIT_SECONDS {
            return Err(ControllerError::annotation(
                ANNOTATION_PROBE_INTERVAL,
                format!(
                    "probe interval {}s times {} probes must stay below {} seconds",
                    interval, count, PROBE_TOTAL_LIMIT_SECONDS
                ),
            ));
        }

        if service.needs_health_check() {
            let Some(health_port) = service.health_check_node_port else {
                return Ok(None);
            };
            return Ok(Some(Probe {
                id: None,
                name: name.to_string(),
                properties: ProbeProperties {
                    protocol: ProbeProtocol::Http,
                    port: health_port,
                    interval_in_seconds: Some(interval),
                    number_of_probes: Some(count),
                    request_path: Some(HEALTH_CHECK_PATH.to_string()),
                },
            }));
        }

        if port_options.no_probe_rule {
            return Ok(None);
        }

        let protocol = match port_options.probe_protocol.as_deref() {
            Some(value) => Some(parse_probe_protocol(
                value,
                &port_annotation(port.port, "health-probe_protocol"),
            )?),
            None if port.protocol != PortProtocol::Tcp => None,
            None => match app_protocol_probe(port) {
                Some(protocol) => Some(protocol),
                None => match options.probe_protocol.as_deref() {
                    Some(value) => Some(parse_probe_protocol(value, ANNOTATION_PROBE_PROTOCOL)?),
                    None => port.protocol.probe(),
                },
            },
        };
        let Some(mut protocol) = protocol else {
            return Ok(None);
        };
        if protocol == ProbeProtocol::Https && !self.config().use_standard_load_balancer() {
            debug!("basic load balancers cannot probe over HTTPS, using TCP for {}", name);
            protocol = ProbeProtocol::Tcp;
        }

        let probe_port = match port_options.probe_port.as_deref() {
            None => port.node_port,
            Some(value) => match service.find_port_by_number_or_name(value) {
                Some(target) => target.node_port,
                None => value.parse::<i32>().map_err(|_| {
                    ControllerError::annotation(
                        &port_annotation(port.port, "health-probe_port"),
                        format!("{:?} is neither a port number nor a port name of the service", value),
                    )
                })?,
            },
        };

        let request_path = matches!(protocol, ProbeProtocol::Http | ProbeProtocol::Https).then(|| {
            port_options
                .probe_request_path
                .clone()
                .or_else(|| options.probe_request_path.clone())
                .unwrap_or_else(|| HEALTH_PROBE_DEFAULT_REQUEST_PATH.to_string())
        });

        Ok(Some(Probe {
            id: None,
            name: name.to_string(),
            properties: ProbeProperties {
                protocol,
                port: probe_port,
                interval_in_seconds: Some(interval),
                number_of_probes: Some(count),
                request_path,
            },
        }))
    }

    /// Replace the Service's probes and rules on `lb` with `expected`.
    /// Returns whether `lb` changed.
    pub(crate) fn reconcile_rules_and_probes(
        &self,
        lb: &mut LoadBalancer,
        service: &ServiceView,
        expected: &ExpectedRules,
    ) -> bool {
        let props = &mut lb.properties;
        let mut dirty = false;

        let before = props.load_balancing_rules.len();
        props.load_balancing_rules.retain(|rule| {
            let keep = !is_service_rule(service, &rule.name) || expected.rules.iter().any(|e| rule_equal(e, rule));
            if !keep {
                info!("removing load balancing rule {} of {} from {}", rule.name, service.key(), lb.name);
            }
            keep
        });
        dirty |= props.load_balancing_rules.len() != before;

        let before = props.probes.len();
        props.probes.retain(|probe| {
            let keep = !is_service_rule(service, &probe.name) || expected.probes.iter().any(|e| probe_equal(e, probe));
            if !keep {
                info!("removing health probe {} of {} from {}", probe.name, service.key(), lb.name);
            }
            keep
        });
        dirty |= props.probes.len() != before;

        for probe in &expected.probes {
            if !props.probes.iter().any(|p| probe_equal(p, probe)) {
                info!("adding health probe {} to {}", probe.name, lb.name);
                props.probes.push(probe.clone());
                dirty = true;
            }
        }
        for rule in &expected.rules {
            if !props.load_balancing_rules.iter().any(|r| rule_equal(r, rule)) {
                info!("adding load balancing rule {} to {}", rule.name, lb.name);
                props.load_balancing_rules.push(rule.clone());
                dirty = true;
            }
        }
        dirty
    }
}

/// `All` collides with every transport protocol
fn protocols_overlap(a: TransportProtocol, b: TransportProtocol) -> bool {
    a == b || a == TransportProtocol::All || b == TransportProtocol::All
}

/// HA ports rules listen on port 0, which covers every port
fn ports_overlap(a: i32, b: i32) -> bool {
    a == b || a == 0 || b == 0
}

/// Refuse rules whose frontend, protocol and port are taken by something the
/// Service does not own
pub(crate) fn check_rule_conflicts(
    lb: &LoadBalancer,
    service: &ServiceView,
    expected: &[LoadBalancingRule],
) -> Result<(), ControllerError> {
    for rule in expected {
        let props = &rule.properties;
        let Some(fip) = props.frontend_ip_configuration.as_ref() else {
            continue;
        };
        let same_frontend = |other: Option<&SubResource>| other.is_some_and(|o| o.id().eq_ignore_ascii_case(fip.id()));

        for existing in &lb.properties.load_balancing_rules {
            if is_service_rule(service, &existing.name) {
                continue;
            }
            let other = &existing.properties;
            if same_frontend(other.frontend_ip_configuration.as_ref())
                && protocols_overlap(other.protocol, props.protocol)
                && ports_overlap(other.frontend_port, props.frontend_port)
            {
                warn!(
                    "{}: port {} conflicts with load balancing rule {}",
                    service.key(),
                    props.frontend_port,
                    existing.name
                );
                return Err(ControllerError::Conflict(format!(
                    "port {} is being referenced by an existing loadBalancing rule {}",
                    props.frontend_port, existing.name
                )));
            }
        }

        for nat in &lb.properties.inbound_nat_rules {
            let other = &nat.properties;
            if same_frontend(other.frontend_ip_configuration.as_ref())
                && protocols_overlap(other.protocol, props.protocol)
                && ports_overlap(other.frontend_port, props.frontend_port)
            {
                return Err(ControllerError::Conflict(format!(
                    "port {} is being referenced by an existing inbound NAT rule {}",
                    props.frontend_port, nat.name
                )));
            }
        }

        for pool in &lb.properties.inbound_nat_pools {
            let other = &pool.properties;
            if same_frontend(other.frontend_ip_configuration.as_ref())
                && protocols_overlap(other.protocol, props.protocol)
                && (props.frontend_port == 0
                    || (other.frontend_port_range_start..=other.frontend_port_range_end).contains(&props.frontend_port))
            {
                return Err(ControllerError::Conflict(format!(
                    "port {} is being referenced by an existing inbound NAT pool {}",
                    props.frontend_port, pool.name
                )));
            }
        }
    }
    Ok(())
}
