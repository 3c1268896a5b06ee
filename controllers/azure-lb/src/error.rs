//! Controller-specific error types.
//!
//! Cloud failures arrive as [`AzureError`] and keep their classification
//! helpers; everything the reconciler itself refuses to do is one of the
//! variants below.

use azure_client::AzureError;
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the Azure load balancer controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Azure Resource Manager error
    #[error("Azure error: {0}")]
    Azure(#[from] AzureError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A Service annotation could not be parsed or is out of range
    #[error("Invalid annotation {annotation}: {message}")]
    InvalidAnnotation { annotation: String, message: String },

    /// The Service asks for something its load balancer cannot provide
    #[error("Invalid service: {0}")]
    InvalidService(String),

    /// Another Service already uses the requested frontend, port and protocol
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The DNS label on the public IP belongs to another Service
    #[error("DNS label in use: {0}")]
    DnsLabelInUse(String),

    /// A public IP named by annotation does not exist
    #[error("Public IP not found: {0}")]
    PublicIpNotFound(String),

    /// The private link service cannot be reconciled as requested
    #[error("Private link service error: {0}")]
    PrivateLinkService(String),

    /// Every candidate load balancer is at the configured rule limit
    #[error("Load balancer rule limit reached: {0}")]
    LoadBalancerRuleLimit(String),

    /// No free priority is left in the security group
    #[error("No security rule priority available: {0}")]
    SecurityRulePriorityExhausted(String),

    /// The VM set implementation cannot do what was asked of it
    #[error("Unsupported by VM set: {0}")]
    Unsupported(String),

    /// Reconciliation failed
    #[error("Reconciliation failed: {0}")]
    Reconciliation(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}

impl ControllerError {
    pub(crate) fn annotation(annotation: &str, message: impl Into<String>) -> Self {
        ControllerError::InvalidAnnotation {
            annotation: annotation.to_string(),
            message: message.into(),
        }
    }

    /// User errors that will not heal by retrying
    pub fn is_bad_request(&self) -> bool {
        match self {
            ControllerError::InvalidAnnotation { .. }
            | ControllerError::InvalidService(_)
            | ControllerError::Conflict(_)
            | ControllerError::DnsLabelInUse(_)
            | ControllerError::PublicIpNotFound(_)
            | ControllerError::PrivateLinkService(_) => true,
            ControllerError::Azure(e) => e.is_bad_request(),
            _ => false,
        }
    }

    /// Delete-path errors that mean there is nothing left to do
    pub fn is_forbidden_or_ignored(&self) -> bool {
        matches!(self, ControllerError::Azure(e) if e.is_forbidden_or_ignored())
    }

    /// Short reason used on Kubernetes events
    pub fn reason(&self) -> &'static str {
        match self {
            ControllerError::InvalidAnnotation { .. } => "InvalidAnnotation",
            ControllerError::InvalidService(_) => "InvalidService",
            ControllerError::Conflict(_) => "PortConflict",
            ControllerError::DnsLabelInUse(_) => "DnsLabelInUse",
            ControllerError::PublicIpNotFound(_) => "PublicIpNotFound",
            ControllerError::PrivateLinkService(_) => "PrivateLinkService",
            ControllerError::LoadBalancerRuleLimit(_) => "RuleLimitReached",
            ControllerError::SecurityRulePriorityExhausted(_) => "PriorityExhausted",
            ControllerError::Azure(_) => "CloudError",
            _ => "ReconcileFailed",
        }
    }
}
