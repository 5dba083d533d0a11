//! Kubernetes Event recording for deprovisioning decisions.
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so the orchestrator can emit standard Kubernetes Events visible via
//! `kubectl describe node` and `kubectl get events`.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break a pass.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
///
/// Implementations are expected to be fire-and-forget: `publish()` logs a
/// warning on failure but never returns an error.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "Expiration")
    /// * `action` - What action was taken (e.g. "Deprovision")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher for the given controller name.
    ///
    /// The controller name appears as the "reportingComponent" on Events.
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation for tests.
///
/// All calls are silently ignored - no Kubernetes API interaction.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
        // intentionally empty
    }
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column.
pub mod reasons {
    /// Node deleted or replaced because its expiration TTL elapsed
    pub const EXPIRATION: &str = "Expiration";
    /// Consolidation deleted a node without replacement
    pub const CONSOLIDATION_DELETE: &str = "ConsolidationDelete";
    /// Consolidation replaced nodes with cheaper capacity
    pub const CONSOLIDATION_REPLACE: &str = "ConsolidationReplace";
    /// Empty node deleted
    pub const EMPTY_NODE_DELETE: &str = "EmptyNodeDelete";
    /// A computed command no longer held after the validation delay
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
    /// A replacement node failed to launch; the command rolled back
    pub const REPLACEMENT_LAUNCH_FAILED: &str = "ReplacementLaunchFailed";
}

/// Well-known event action strings.
pub mod actions {
    /// The deprovisioning pass
    pub const DEPROVISION: &str = "Deprovision";
}
