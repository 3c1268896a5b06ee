//! Typed Service annotations.
//!
//! Every annotation the reconcilers look at is parsed once into
//! [`ServiceOptions`]. Range and format checks happen here, so a malformed
//! value fails the reconcile with an `InvalidAnnotation` error naming the key
//! instead of surfacing later as a cloud error.

use crate::consts::*;
use crate::error::ControllerError;
use azure_client::{IpTag, Tags};
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;

/// How the Service picks its VM set
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LoadBalancerMode {
    /// No mode annotation
    #[default]
    Unset,
    /// `__auto__`: any VM set, fewest rules wins
    Auto,
    /// Explicit VM set names
    VmSets(Vec<String>),
}

/// Health probe and rule overrides for one service port
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortOptions {
    pub probe_protocol: Option<String>,
    /// A port number or port name of the same Service
    pub probe_port: Option<String>,
    pub probe_request_path: Option<String>,
    pub probe_interval: Option<i32>,
    pub probe_num_of_probe: Option<i32>,
    pub no_lb_rule: bool,
    pub no_probe_rule: bool,
}

/// Private link service settings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrivateLinkOptions {
    pub create: bool,
    pub name: Option<String>,
    pub ip_configuration_subnet: Option<String>,
    pub ip_configuration_count: Option<usize>,
    /// Static IPv4 addresses, the first one is primary
    pub static_ips: Vec<String>,
    pub fqdns: Vec<String>,
    pub proxy_protocol: bool,
    pub visibility: Vec<String>,
    pub auto_approval: Vec<String>,
    /// Any PLS shaping annotation besides `pls-create` is present
    pub has_additional_configs: bool,
}

/// All Service annotations the controller understands
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceOptions {
    pub internal: bool,
    pub internal_subnet: Option<String>,
    /// `Some("")` asks to clear the label
    pub dns_label: Option<String>,
    pub pip_name: Option<String>,
    pub pip_prefix_id: Option<String>,
    pub pip_resource_group: Option<String>,
    /// `Some` when the IP tag annotation is present, even if empty
    pub ip_tags: Option<Vec<IpTag>>,
    pub pip_tags: Tags,
    pub allowed_service_tags: Vec<String>,
    pub allowed_ip_ranges: Vec<String>,
    pub deny_all_except_source_ranges: bool,
    pub shared_security_rule: bool,
    pub mode: LoadBalancerMode,
    pub idle_timeout: Option<i32>,
    pub ha_ports: bool,
    pub additional_public_ips: Vec<String>,
    pub disable_floating_ip: bool,
    pub probe_protocol: Option<String>,
    pub probe_request_path: Option<String>,
    pub probe_interval: Option<i32>,
    pub probe_num_of_probe: Option<i32>,
    pub ports: HashMap<i32, PortOptions>,
    pub pls: PrivateLinkOptions,
}

impl ServiceOptions {
    /// Parse and validate the annotations of one Service
    pub fn parse(annotations: &BTreeMap<String, String>) -> Result<Self, ControllerError> {
        let get = |key: &str| annotations.get(key).map(|v| v.trim());
        let non_empty = |key: &str| get(key).filter(|v| !v.is_empty()).map(str::to_string);
        let flag = |key: &str| get(key).is_some_and(|v| v.eq_ignore_ascii_case("true"));

        let mut options = ServiceOptions {
            internal: flag(ANNOTATION_INTERNAL),
            internal_subnet: non_empty(ANNOTATION_INTERNAL_SUBNET),
            dns_label: get(ANNOTATION_DNS_LABEL_NAME).map(str::to_string),
            pip_name: non_empty(ANNOTATION_PIP_NAME),
            pip_prefix_id: non_empty(ANNOTATION_PIP_PREFIX_ID),
            pip_resource_group: non_empty(ANNOTATION_PIP_RESOURCE_GROUP)
                .or_else(|| non_empty(ANNOTATION_LOAD_BALANCER_RESOURCE_GROUP)),
            ip_tags: get(ANNOTATION_IP_TAGS).map(parse_ip_tags),
            pip_tags: get(ANNOTATION_PIP_TAGS)
                .map(|v| crate::tags::parse_tags(v, &Tags::new()))
                .unwrap_or_default(),
            allowed_service_tags: get(ANNOTATION_ALLOWED_SERVICE_TAGS).map(split_commas).unwrap_or_default(),
            allowed_ip_ranges: Vec::new(),
            deny_all_except_source_ranges: flag(ANNOTATION_DENY_ALL_EXCEPT_SOURCE_RANGES),
            shared_security_rule: flag(ANNOTATION_SHARED_SECURITY_RULE),
            mode: parse_mode(get(ANNOTATION_LOAD_BALANCER_MODE)),
            idle_timeout: parse_i32(annotations, ANNOTATION_IDLE_TIMEOUT, |v| {
                (IDLE_TIMEOUT_MIN..=IDLE_TIMEOUT_MAX).contains(&v).then_some(()).ok_or_else(|| {
                    format!(
                        "idle timeout must be a whole number of minutes between {} and {}, got {}",
                        IDLE_TIMEOUT_MIN, IDLE_TIMEOUT_MAX, v
                    )
                })
            })?,
            ha_ports: flag(ANNOTATION_HA_PORTS),
            additional_public_ips: Vec::new(),
            disable_floating_ip: flag(ANNOTATION_DISABLE_FLOATING_IP),
            probe_protocol: non_empty(ANNOTATION_PROBE_PROTOCOL),
            probe_request_path: non_empty(ANNOTATION_PROBE_REQUEST_PATH),
            probe_interval: parse_i32(annotations, ANNOTATION_PROBE_INTERVAL, validate_probe_interval)?,
            probe_num_of_probe: parse_i32(annotations, ANNOTATION_PROBE_NUM_OF_PROBE, validate_num_of_probe)?,
            ports: parse_port_options(annotations)?,
            pls: parse_private_link(annotations)?,
        };

        if let Some(ranges) = get(ANNOTATION_ALLOWED_IP_RANGES) {
            for range in split_commas(ranges) {
                if parse_cidr(&range).is_none() {
                    return Err(ControllerError::annotation(
                        ANNOTATION_ALLOWED_IP_RANGES,
                        format!("{} is not a valid CIDR", range),
                    ));
                }
                options.allowed_ip_ranges.push(range);
            }
        }

        if let Some(ips) = get(ANNOTATION_ADDITIONAL_PUBLIC_IPS) {
            for ip in split_commas(ips) {
                if ip.parse::<IpAddr>().is_err() {
                    return Err(ControllerError::annotation(
                        ANNOTATION_ADDITIONAL_PUBLIC_IPS,
                        format!("{} is not a valid IP address", ip),
                    ));
                }
                options.additional_public_ips.push(ip);
            }
        }

        Ok(options)
    }

    pub fn port(&self, port: i32) -> Option<&PortOptions> {
        self.ports.get(&port)
    }
}

fn split_commas(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn split_spaces(value: &str) -> Vec<String> {
    value.split_whitespace().map(str::to_string).collect()
}

fn parse_mode(value: Option<&str>) -> LoadBalancerMode {
    match value {
        None => LoadBalancerMode::Unset,
        Some(v) if v.eq_ignore_ascii_case(LOAD_BALANCER_MODE_AUTO) => LoadBalancerMode::Auto,
        Some(v) => LoadBalancerMode::VmSets(split_commas(v)),
    }
}

/// `type=value` pairs, sorted so equal sets compare equal
fn parse_ip_tags(value: &str) -> Vec<IpTag> {
    let mut tags: Vec<IpTag> = split_commas(value)
        .into_iter()
        .filter_map(|pair| {
            let (ip_tag_type, tag) = pair.split_once('=')?;
            let (ip_tag_type, tag) = (ip_tag_type.trim(), tag.trim());
            (!ip_tag_type.is_empty() && !tag.is_empty()).then(|| IpTag {
                ip_tag_type: ip_tag_type.to_string(),
                tag: tag.to_string(),
            })
        })
        .collect();
    tags.sort_by(|a, b| (&a.ip_tag_type, &a.tag).cmp(&(&b.ip_tag_type, &b.tag)));
    tags.dedup();
    tags
}

fn parse_i32(
    annotations: &BTreeMap<String, String>,
    key: &str,
    validate: impl Fn(i32) -> Result<(), String>,
) -> Result<Option<i32>, ControllerError> {
    let Some(raw) = annotations.get(key).map(|v| v.trim()) else {
        return Ok(None);
    };
    let value: i32 = raw
        .parse()
        .map_err(|_| ControllerError::annotation(key, format!("{:?} is not a whole number", raw)))?;
    validate(value).map_err(|message| ControllerError::annotation(key, message))?;
    Ok(Some(value))
}

fn validate_probe_interval(v: i32) -> Result<(), String> {
    if v < PROBE_INTERVAL_DEFAULT {
        return Err(format!("the minimum probe interval is {} seconds, got {}", PROBE_INTERVAL_DEFAULT, v));
    }
    Ok(())
}

fn validate_num_of_probe(v: i32) -> Result<(), String> {
    if v < PROBE_NUM_DEFAULT {
        return Err(format!("the minimum number of probes is {}, got {}", PROBE_NUM_DEFAULT, v));
    }
    Ok(())
}

/// Collect `port_{port}_{setting}` annotations
fn parse_port_options(annotations: &BTreeMap<String, String>) -> Result<HashMap<i32, PortOptions>, ControllerError> {
    let mut ports: HashMap<i32, PortOptions> = HashMap::new();
    for (key, value) in annotations {
        let Some(rest) = key.strip_prefix(PORT_ANNOTATION_PREFIX) else {
            continue;
        };
        let Some((port, setting)) = rest.split_once('_') else {
            continue;
        };
        let Ok(port) = port.parse::<i32>() else {
            continue;
        };
        let value = value.trim();
        let entry = ports.entry(port).or_default();
        let int = |validate: fn(i32) -> Result<(), String>| -> Result<i32, ControllerError> {
            let parsed: i32 = value
                .parse()
                .map_err(|_| ControllerError::annotation(key, format!("{:?} is not a whole number", value)))?;
            validate(parsed).map_err(|message| ControllerError::annotation(key, message))?;
            Ok(parsed)
        };
        match setting {
            "health-probe_protocol" => entry.probe_protocol = Some(value.to_string()),
            "health-probe_port" => entry.probe_port = Some(value.to_string()),
            "health-probe_request-path" => entry.probe_request_path = Some(value.to_string()),
            "health-probe_interval" => entry.probe_interval = Some(int(validate_probe_interval)?),
            "health-probe_num-of-probe" => entry.probe_num_of_probe = Some(int(validate_num_of_probe)?),
            "no_lb_rule" => entry.no_lb_rule = value.eq_ignore_ascii_case("true"),
            "no_probe_rule" => entry.no_probe_rule = value.eq_ignore_ascii_case("true"),
            _ => {}
        }
    }
    Ok(ports)
}

fn parse_private_link(annotations: &BTreeMap<String, String>) -> Result<PrivateLinkOptions, ControllerError> {
    let get = |key: &str| annotations.get(key).map(|v| v.trim());
    let non_empty = |key: &str| get(key).filter(|v| !v.is_empty()).map(str::to_string);

    let ip_configuration_count = match get(ANNOTATION_PLS_IP_CONFIGURATION_IP_COUNT) {
        None => None,
        Some(raw) => {
            let count: usize = raw.parse().map_err(|_| {
                ControllerError::annotation(
                    ANNOTATION_PLS_IP_CONFIGURATION_IP_COUNT,
                    format!("{:?} is not a whole number", raw),
                )
            })?;
            if !(PLS_IP_CONFIG_COUNT_MIN..=PLS_IP_CONFIG_COUNT_MAX).contains(&count) {
                return Err(ControllerError::annotation(
                    ANNOTATION_PLS_IP_CONFIGURATION_IP_COUNT,
                    format!(
                        "the number of IP configurations must be between {} and {}, got {}",
                        PLS_IP_CONFIG_COUNT_MIN, PLS_IP_CONFIG_COUNT_MAX, count
                    ),
                ));
            }
            Some(count)
        }
    };

    let mut static_ips: Vec<String> = Vec::new();
    for ip in get(ANNOTATION_PLS_IP_CONFIGURATION_IPS).map(split_spaces).unwrap_or_default() {
        match ip.parse::<IpAddr>() {
            Ok(IpAddr::V4(_)) => {
                if !static_ips.contains(&ip) {
                    static_ips.push(ip);
                }
            }
            Ok(IpAddr::V6(_)) => {
                return Err(ControllerError::annotation(
                    ANNOTATION_PLS_IP_CONFIGURATION_IPS,
                    format!("private link service IP configurations only support IPv4, got {}", ip),
                ));
            }
            Err(_) => {
                return Err(ControllerError::annotation(
                    ANNOTATION_PLS_IP_CONFIGURATION_IPS,
                    format!("{} is not a valid IP address", ip),
                ));
            }
        }
    }

    let mut visibility = get(ANNOTATION_PLS_VISIBILITY).map(split_spaces).unwrap_or_default();
    if visibility.iter().any(|v| v == "*") {
        visibility = vec!["*".to_string()];
    }

    let shaping_keys = [
        ANNOTATION_PLS_NAME,
        ANNOTATION_PLS_IP_CONFIGURATION_SUBNET,
        ANNOTATION_PLS_IP_CONFIGURATION_IP_COUNT,
        ANNOTATION_PLS_IP_CONFIGURATION_IPS,
        ANNOTATION_PLS_FQDNS,
        ANNOTATION_PLS_PROXY_PROTOCOL,
        ANNOTATION_PLS_VISIBILITY,
        ANNOTATION_PLS_AUTO_APPROVAL,
    ];

    Ok(PrivateLinkOptions {
        create: get(ANNOTATION_PLS_CREATE).is_some_and(|v| v.eq_ignore_ascii_case("true")),
        name: non_empty(ANNOTATION_PLS_NAME),
        ip_configuration_subnet: non_empty(ANNOTATION_PLS_IP_CONFIGURATION_SUBNET),
        ip_configuration_count,
        static_ips,
        fqdns: get(ANNOTATION_PLS_FQDNS).map(split_spaces).unwrap_or_default(),
        proxy_protocol: get(ANNOTATION_PLS_PROXY_PROTOCOL).is_some_and(|v| v.eq_ignore_ascii_case("true")),
        visibility,
        auto_approval: get(ANNOTATION_PLS_AUTO_APPROVAL).map(split_spaces).unwrap_or_default(),
        has_additional_configs: shaping_keys.iter().any(|k| annotations.contains_key(*k)),
    })
}

/// Parse `address/prefix`, rejecting prefixes longer than the address family allows
pub fn parse_cidr(value: &str) -> Option<(IpAddr, u8)> {
    let (addr, prefix) = value.trim().split_once('/')?;
    let addr: IpAddr = addr.parse().ok()?;
    let prefix: u8 = prefix.parse().ok()?;
    let max = if addr.is_ipv4() { 32 } else { 128 };
    (prefix <= max).then_some((addr, prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annotations(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_defaults_without_annotations() {
        let options = ServiceOptions::parse(&BTreeMap::new()).unwrap();
        assert!(!options.internal);
        assert_eq!(options.mode, LoadBalancerMode::Unset);
        assert!(options.ip_tags.is_none());
        assert!(options.dns_label.is_none());
        assert!(!options.pls.has_additional_configs);
    }

    #[test]
    fn test_flags_and_lists() {
        let options = ServiceOptions::parse(&annotations(&[
            (ANNOTATION_INTERNAL, "True"),
            (ANNOTATION_LOAD_BALANCER_MODE, "pool1, pool2"),
            (ANNOTATION_ALLOWED_SERVICE_TAGS, "AzureCloud,Storage"),
            (ANNOTATION_IP_TAGS, "RoutingPreference=Internet, FirstPartyUsage=/NonProd"),
            (ANNOTATION_DNS_LABEL_NAME, ""),
        ]))
        .unwrap();
        assert!(options.internal);
        assert_eq!(
            options.mode,
            LoadBalancerMode::VmSets(vec!["pool1".to_string(), "pool2".to_string()])
        );
        assert_eq!(options.allowed_service_tags, vec!["AzureCloud", "Storage"]);
        let ip_tags = options.ip_tags.unwrap();
        assert_eq!(ip_tags[0].ip_tag_type, "FirstPartyUsage");
        assert_eq!(options.dns_label.as_deref(), Some(""));
    }

    #[test]
    fn test_auto_mode() {
        let options = ServiceOptions::parse(&annotations(&[(ANNOTATION_LOAD_BALANCER_MODE, "__AUTO__")])).unwrap();
        assert_eq!(options.mode, LoadBalancerMode::Auto);
    }

    #[test]
    fn test_idle_timeout_range() {
        assert!(ServiceOptions::parse(&annotations(&[(ANNOTATION_IDLE_TIMEOUT, "30")])).is_ok());
        let err = ServiceOptions::parse(&annotations(&[(ANNOTATION_IDLE_TIMEOUT, "31")])).unwrap_err();
        assert!(matches!(err, ControllerError::InvalidAnnotation { ref annotation, .. } if annotation == ANNOTATION_IDLE_TIMEOUT));
        assert!(ServiceOptions::parse(&annotations(&[(ANNOTATION_IDLE_TIMEOUT, "ten")])).is_err());
    }

    #[test]
    fn test_probe_minimums() {
        assert!(ServiceOptions::parse(&annotations(&[(ANNOTATION_PROBE_INTERVAL, "4")])).is_err());
        assert!(ServiceOptions::parse(&annotations(&[(ANNOTATION_PROBE_NUM_OF_PROBE, "1")])).is_err());
        let err = ServiceOptions::parse(&annotations(&[(
            "service.beta.kubernetes.io/port_80_health-probe_interval",
            "2",
        )]))
        .unwrap_err();
        assert!(err.to_string().contains("port_80_health-probe_interval"));
    }

    #[test]
    fn test_port_options() {
        let options = ServiceOptions::parse(&annotations(&[
            ("service.beta.kubernetes.io/port_443_health-probe_protocol", "Https"),
            ("service.beta.kubernetes.io/port_443_health-probe_request-path", "/ready"),
            ("service.beta.kubernetes.io/port_443_no_probe_rule", "true"),
            ("service.beta.kubernetes.io/port_53_no_lb_rule", "true"),
            ("service.beta.kubernetes.io/port_abc_no_lb_rule", "true"),
        ]))
        .unwrap();
        let https = options.port(443).unwrap();
        assert_eq!(https.probe_protocol.as_deref(), Some("Https"));
        assert_eq!(https.probe_request_path.as_deref(), Some("/ready"));
        assert!(https.no_probe_rule);
        assert!(options.port(53).unwrap().no_lb_rule);
        assert_eq!(options.ports.len(), 2);
    }

    #[test]
    fn test_invalid_addresses_are_rejected() {
        assert!(ServiceOptions::parse(&annotations(&[(ANNOTATION_ADDITIONAL_PUBLIC_IPS, "1.2.3.4,nope")])).is_err());
        assert!(ServiceOptions::parse(&annotations(&[(ANNOTATION_ALLOWED_IP_RANGES, "10.0.0.0/33")])).is_err());
        let options = ServiceOptions::parse(&annotations(&[
            (ANNOTATION_ADDITIONAL_PUBLIC_IPS, "1.2.3.4, 2001:db8::1"),
            (ANNOTATION_ALLOWED_IP_RANGES, "10.0.0.0/8"),
        ]))
        .unwrap();
        assert_eq!(options.additional_public_ips.len(), 2);
        assert_eq!(options.allowed_ip_ranges, vec!["10.0.0.0/8"]);
    }

    #[test]
    fn test_private_link_options() {
        let options = ServiceOptions::parse(&annotations(&[
            (ANNOTATION_PLS_CREATE, "true"),
            (ANNOTATION_PLS_IP_CONFIGURATION_IPS, "10.0.0.9 10.0.0.10 10.0.0.9"),
            (ANNOTATION_PLS_IP_CONFIGURATION_IP_COUNT, "3"),
            (ANNOTATION_PLS_VISIBILITY, "sub1 * sub2"),
            (ANNOTATION_PLS_FQDNS, " a.example.com  b.example.com "),
        ]))
        .unwrap();
        assert!(options.pls.create);
        assert!(options.pls.has_additional_configs);
        assert_eq!(options.pls.static_ips, vec!["10.0.0.9", "10.0.0.10"]);
        assert_eq!(options.pls.ip_configuration_count, Some(3));
        assert_eq!(options.pls.visibility, vec!["*"]);
        assert_eq!(options.pls.fqdns, vec!["a.example.com", "b.example.com"]);
    }

    #[test]
    fn test_private_link_rejects_ipv6_and_bad_counts() {
        assert!(ServiceOptions::parse(&annotations(&[(ANNOTATION_PLS_IP_CONFIGURATION_IPS, "fd00::1")])).is_err());
        assert!(ServiceOptions::parse(&annotations(&[(ANNOTATION_PLS_IP_CONFIGURATION_IP_COUNT, "9")])).is_err());
        assert!(ServiceOptions::parse(&annotations(&[(ANNOTATION_PLS_IP_CONFIGURATION_IP_COUNT, "0")])).is_err());
    }

    #[test]
    fn test_parse_cidr() {
        assert_eq!(parse_cidr("10.0.0.0/8").map(|(_, p)| p), Some(8));
        assert!(parse_cidr("::/0").is_some());
        assert!(parse_cidr("10.0.0.0").is_none());
        assert!(parse_cidr("fd00::/129").is_none());
    }
}
