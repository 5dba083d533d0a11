//! Provisioner Custom Resource Definition
//!
//! A Provisioner owns a subset of the cluster's nodes and governs their
//! deprovisioning policies: expiration TTL, empty-node TTL, and whether
//! cost consolidation may touch them.

use chrono::Duration;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::keys;
use super::types::{ConsolidationSpec, Requirement};

/// Specification for a Provisioner
///
/// At most one of `consolidation.enabled` and `ttlSecondsAfterEmpty` may
/// be set: consolidation already deletes empty nodes without a quiescence
/// wait, so combining the two is a configuration error.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "pruner.dev",
    version = "v1alpha1",
    kind = "Provisioner",
    plural = "provisioners",
    namespaced = false,
    printcolumn = r#"{"name":"Expiry TTL","type":"integer","jsonPath":".spec.ttlSecondsUntilExpired"}"#,
    printcolumn = r#"{"name":"Empty TTL","type":"integer","jsonPath":".spec.ttlSecondsAfterEmpty"}"#,
    printcolumn = r#"{"name":"Consolidation","type":"boolean","jsonPath":".spec.consolidation.enabled"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionerSpec {
    /// Seconds after creation at which a node expires and is replaced.
    /// Unset disables expiration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_until_expired: Option<i64>,

    /// Seconds a node must remain empty before it is deleted.
    /// Unset disables the empty-node sub-reconciler for this provisioner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_after_empty: Option<i64>,

    /// Cost-consolidation policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consolidation: Option<ConsolidationSpec>,

    /// Scheduling requirements on owned nodes (allowed capacity types,
    /// zones, ...)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requirements: Vec<Requirement>,
}

impl ProvisionerSpec {
    /// Whether consolidation may delete or replace this provisioner's
    /// nodes.
    pub fn consolidation_enabled(&self) -> bool {
        self.consolidation.as_ref().is_some_and(|c| c.enabled)
    }

    /// Expiration TTL as a duration, when configured.
    pub fn expiration_ttl(&self) -> Option<Duration> {
        self.ttl_seconds_until_expired.map(Duration::seconds)
    }

    /// Empty-node TTL as a duration, when configured.
    pub fn empty_ttl(&self) -> Option<Duration> {
        self.ttl_seconds_after_empty.map(Duration::seconds)
    }

    /// Capacity types this provisioner may launch, derived from its
    /// requirements. Unconstrained provisioners may use both.
    pub fn allowed_capacity_types(&self) -> Vec<String> {
        let all = [
            keys::CAPACITY_TYPE_ON_DEMAND.to_string(),
            keys::CAPACITY_TYPE_SPOT.to_string(),
        ];
        let constraints: Vec<&Requirement> = self
            .requirements
            .iter()
            .filter(|r| r.key == keys::CAPACITY_TYPE_LABEL)
            .collect();
        if constraints.is_empty() {
            return all.to_vec();
        }
        all.into_iter()
            .filter(|ct| constraints.iter().all(|r| r.matches(Some(ct))))
            .collect()
    }

    /// Whether this provisioner may launch the given capacity type.
    pub fn allows_capacity_type(&self, capacity_type: &str) -> bool {
        self.allowed_capacity_types()
            .iter()
            .any(|ct| ct == capacity_type)
    }

    /// Validate the provisioner specification.
    pub fn validate(&self, name: &str) -> crate::Result<()> {
        if let Some(ttl) = self.ttl_seconds_until_expired {
            if ttl < 0 {
                return Err(crate::Error::invalid_provisioner(
                    name,
                    "ttlSecondsUntilExpired must be non-negative",
                ));
            }
        }
        if let Some(ttl) = self.ttl_seconds_after_empty {
            if ttl < 0 {
                return Err(crate::Error::invalid_provisioner(
                    name,
                    "ttlSecondsAfterEmpty must be non-negative",
                ));
            }
        }
        if self.consolidation_enabled() && self.ttl_seconds_after_empty.is_some() {
            return Err(crate::Error::invalid_provisioner(
                name,
                "consolidation.enabled and ttlSecondsAfterEmpty are mutually exclusive",
            ));
        }
        Ok(())
    }
}
