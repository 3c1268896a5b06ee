//! Kubernetes Events on Services.
//!
//! User-visible failures (load balancer create, list, security group,
//! public IP, private link service) and the ensure/delete milestones are
//! reported as Events on the Service. Publishing is fire-and-forget: a
//! failed event is logged and never fails the reconcile.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::Client;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use tracing::warn;

/// Publishes Events about a Service
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn publish(
        &self,
        service: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Recorder backed by the events API
pub struct KubeEventRecorder {
    recorder: Recorder,
}

impl std::fmt::Debug for KubeEventRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeEventRecorder").finish_non_exhaustive()
    }
}

impl KubeEventRecorder {
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn publish(
        &self,
        service: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, service).await {
            warn!(
                "Failed to publish {} event for service {}/{}: {}",
                reason,
                service.namespace.as_deref().unwrap_or_default(),
                service.name.as_deref().unwrap_or_default(),
                e
            );
        }
    }
}

/// One event captured by [`RecordingEventRecorder`]
#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub service: String,
    pub warning: bool,
    pub reason: String,
    pub action: String,
    pub note: Option<String>,
}

/// In-memory recorder for tests
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingEventRecorder {
    events: std::sync::Mutex<Vec<RecordedEvent>>,
}

#[cfg(test)]
impl RecordingEventRecorder {
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }
}

#[cfg(test)]
#[async_trait]
impl EventRecorder for RecordingEventRecorder {
    async fn publish(
        &self,
        service: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        self.events.lock().unwrap().push(RecordedEvent {
            service: format!(
                "{}/{}",
                service.namespace.as_deref().unwrap_or_default(),
                service.name.as_deref().unwrap_or_default()
            ),
            warning: matches!(type_, EventType::Warning),
            reason: reason.to_string(),
            action: action.to_string(),
            note,
        });
    }
}

/// Event reasons, shown in the REASON column
pub mod reasons {
    pub const ENSURING_LOAD_BALANCER: &str = "EnsuringLoadBalancer";
    pub const ENSURED_LOAD_BALANCER: &str = "EnsuredLoadBalancer";
    pub const SYNC_LOAD_BALANCER_FAILED: &str = "SyncLoadBalancerFailed";
    pub const DELETING_LOAD_BALANCER: &str = "DeletingLoadBalancer";
    pub const DELETED_LOAD_BALANCER: &str = "DeletedLoadBalancer";
    pub const DELETE_LOAD_BALANCER_FAILED: &str = "DeleteLoadBalancerFailed";
    pub const CREATE_LOAD_BALANCER_FAILED: &str = "CreateOrUpdateLoadBalancer";
    pub const LIST_LOAD_BALANCERS_FAILED: &str = "ListLoadBalancers";
    pub const CREATE_SECURITY_GROUP_FAILED: &str = "CreateOrUpdateSecurityGroup";
    pub const CREATE_PUBLIC_IP_FAILED: &str = "CreateOrUpdatePublicIPAddress";
    pub const DELETE_PUBLIC_IP_FAILED: &str = "DeletePublicIPAddress";
    pub const PRIVATE_LINK_SERVICE_FAILED: &str = "ReconcilePrivateLinkService";
    /// A frontend stayed because other load balancer parts still use it
    pub const FRONTEND_IN_USE: &str = "FrontendIPConfigurationInUse";
}

/// Event actions, shown in the ACTION column
pub mod actions {
    pub const ENSURE: &str = "EnsureLoadBalancer";
    pub const DELETE: &str = "EnsureLoadBalancerDeleted";
}
