//! Annotation keys, tag keys and fixed values shared by the reconcilers.

pub const ANNOTATION_INTERNAL: &str = "service.beta.kubernetes.io/azure-load-balancer-internal";
pub const ANNOTATION_INTERNAL_SUBNET: &str = "service.beta.kubernetes.io/azure-load-balancer-internal-subnet";
pub const ANNOTATION_LOAD_BALANCER_MODE: &str = "service.beta.kubernetes.io/azure-load-balancer-mode";
pub const ANNOTATION_LOAD_BALANCER_RESOURCE_GROUP: &str = "service.beta.kubernetes.io/azure-load-balancer-resource-group";
pub const ANNOTATION_PIP_RESOURCE_GROUP: &str = "service.beta.kubernetes.io/azure-pip-resource-group";
pub const ANNOTATION_DNS_LABEL_NAME: &str = "service.beta.kubernetes.io/azure-dns-label-name";
pub const ANNOTATION_SHARED_SECURITY_RULE: &str = "service.beta.kubernetes.io/azure-shared-securityrule";
pub const ANNOTATION_PIP_NAME: &str = "service.beta.kubernetes.io/azure-pip-name";
pub const ANNOTATION_PIP_PREFIX_ID: &str = "service.beta.kubernetes.io/azure-pip-prefix-id";
pub const ANNOTATION_IP_TAGS: &str = "service.beta.kubernetes.io/azure-pip-ip-tags";
pub const ANNOTATION_PIP_TAGS: &str = "service.beta.kubernetes.io/azure-pip-tags";
pub const ANNOTATION_ALLOWED_SERVICE_TAGS: &str = "service.beta.kubernetes.io/azure-allowed-service-tags";
pub const ANNOTATION_ALLOWED_IP_RANGES: &str = "service.beta.kubernetes.io/azure-allowed-ip-ranges";
pub const ANNOTATION_DENY_ALL_EXCEPT_SOURCE_RANGES: &str =
    "service.beta.kubernetes.io/azure-deny-all-except-load-balancer-source-ranges";
pub const ANNOTATION_IDLE_TIMEOUT: &str = "service.beta.kubernetes.io/azure-load-balancer-tcp-idle-timeout";
pub const ANNOTATION_HA_PORTS: &str = "service.beta.kubernetes.io/azure-load-balancer-enable-high-availability-ports";
pub const ANNOTATION_ADDITIONAL_PUBLIC_IPS: &str = "service.beta.kubernetes.io/azure-additional-public-ips";
pub const ANNOTATION_DISABLE_FLOATING_IP: &str = "service.beta.kubernetes.io/azure-disable-load-balancer-floating-ip";

pub const ANNOTATION_PROBE_PROTOCOL: &str = "service.beta.kubernetes.io/azure-load-balancer-health-probe-protocol";
pub const ANNOTATION_PROBE_REQUEST_PATH: &str = "service.beta.kubernetes.io/azure-load-balancer-health-probe-request-path";
pub const ANNOTATION_PROBE_INTERVAL: &str = "service.beta.kubernetes.io/azure-load-balancer-health-probe-interval";
pub const ANNOTATION_PROBE_NUM_OF_PROBE: &str = "service.beta.kubernetes.io/azure-load-balancer-health-probe-num-of-probe";

pub const ANNOTATION_PLS_CREATE: &str = "service.beta.kubernetes.io/azure-pls-create";
pub const ANNOTATION_PLS_NAME: &str = "service.beta.kubernetes.io/azure-pls-name";
pub const ANNOTATION_PLS_IP_CONFIGURATION_SUBNET: &str = "service.beta.kubernetes.io/azure-pls-ip-configuration-subnet";
pub const ANNOTATION_PLS_IP_CONFIGURATION_IP_COUNT: &str =
    "service.beta.kubernetes.io/azure-pls-ip-configuration-ip-address-count";
pub const ANNOTATION_PLS_IP_CONFIGURATION_IPS: &str = "service.beta.kubernetes.io/azure-pls-ip-configuration-ip-address";
pub const ANNOTATION_PLS_FQDNS: &str = "service.beta.kubernetes.io/azure-pls-fqdns";
pub const ANNOTATION_PLS_PROXY_PROTOCOL: &str = "service.beta.kubernetes.io/azure-pls-proxy-protocol";
pub const ANNOTATION_PLS_VISIBILITY: &str = "service.beta.kubernetes.io/azure-pls-visibility";
pub const ANNOTATION_PLS_AUTO_APPROVAL: &str = "service.beta.kubernetes.io/azure-pls-auto-approval";

/// Per-port annotations look like `service.beta.kubernetes.io/port_80_health-probe_interval`
pub const PORT_ANNOTATION_PREFIX: &str = "service.beta.kubernetes.io/port_";

/// Value of the mode annotation that lets the controller pick the VM set
pub const LOAD_BALANCER_MODE_AUTO: &str = "__auto__";

// Tags written on cloud resources. The legacy keys are still read.
pub const SERVICE_TAG_KEY: &str = "k8s-azure-service";
pub const LEGACY_SERVICE_TAG_KEY: &str = "service";
pub const CLUSTER_NAME_TAG_KEY: &str = "k8s-azure-cluster-name";
pub const LEGACY_CLUSTER_NAME_TAG_KEY: &str = "kubernetes-cluster-name";
pub const SERVICE_USING_DNS_TAG_KEY: &str = "k8s-azure-dns-label-service";
pub const LEGACY_SERVICE_USING_DNS_TAG_KEY: &str = "kubernetes-dns-label-service";
pub const OWNER_SERVICE_TAG_KEY: &str = "k8s-azure-owner-service";

pub const INTERNAL_LOAD_BALANCER_SUFFIX: &str = "-internal";
pub const IPV6_SUFFIX: &str = "-ipv6";

pub const SECURITY_RULE_PRIORITY_MIN: i32 = 500;
pub const SECURITY_RULE_PRIORITY_MAX: i32 = 4096;
pub const SHARED_SECURITY_RULE_PREFIX: &str = "shared";
pub const INTERNET_SOURCE: &str = "Internet";
pub const DEFAULT_SOURCE_RANGE_V4: &str = "0.0.0.0/0";
pub const DEFAULT_SOURCE_RANGE_V6: &str = "::/0";

pub const IDLE_TIMEOUT_MIN: i32 = 4;
pub const IDLE_TIMEOUT_MAX: i32 = 30;
pub const PROBE_INTERVAL_DEFAULT: i32 = 5;
pub const PROBE_NUM_DEFAULT: i32 = 2;
/// interval × count must stay below this many seconds
pub const PROBE_TOTAL_LIMIT_SECONDS: i32 = 120;
pub const HEALTH_CHECK_PATH: &str = "/healthz";
pub const HEALTH_PROBE_DEFAULT_REQUEST_PATH: &str = "/";

pub const PLS_IP_CONFIG_COUNT_MIN: usize = 1;
pub const PLS_IP_CONFIG_COUNT_MAX: usize = 8;
pub const PLS_NETWORK_POLICIES_DISABLED: &str = "Disabled";

pub const PROVISIONING_STATE_FAILED: &str = "Failed";

/// Finalizer guarding cloud cleanup of LoadBalancer Services
pub const LOAD_BALANCER_CLEANUP_FINALIZER: &str = "service.kubernetes.io/load-balancer-cleanup";
pub const LABEL_EXCLUDE_FROM_LOAD_BALANCERS: &str = "node.kubernetes.io/exclude-from-external-load-balancers";
pub const LABEL_CONTROL_PLANE: &str = "node-role.kubernetes.io/control-plane";
pub const LABEL_LEGACY_MASTER: &str = "node-role.kubernetes.io/master";

/// Name the controller reports events under
pub const CONTROLLER_NAME: &str = "azure-lb-controller";
