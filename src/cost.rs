//! Pricing and disruption-cost model.
//!
//! Every deprovisioning decision ranks candidates by how disruptive their
//! removal would be: the sum of their pods' eviction costs, discounted by
//! how close the node is to its expiration TTL.

use k8s_openapi::api::core::v1::{Node, Pod};
use kube::ResourceExt;
use tracing::warn;

use crate::clock::Clock;
use crate::crd::{keys, Provisioner};
use crate::pods;

/// Cost of evicting a pod with no annotation and no priority.
pub const BASE_POD_EVICTION_COST: f64 = 1.0;

/// Scalar eviction cost of a pod; higher means more disruptive to evict.
///
/// The pod-deletion-cost annotation and the pod priority both shift the
/// cost monotonically, scaled so that the full +/- 2^31 annotation range
/// maps onto roughly one base cost unit.
pub fn pod_eviction_cost(pod: &Pod) -> f64 {
    let mut cost = BASE_POD_EVICTION_COST;
    if let Some(raw) = pod.annotations().get(keys::POD_DELETION_COST_ANNOTATION) {
        match raw.parse::<f64>() {
            Ok(value) => cost += value / (i32::MAX as f64),
            Err(_) => warn!(
                pod = %pods::qualified_name(pod),
                value = %raw,
                "Ignoring unparseable pod-deletion-cost annotation"
            ),
        }
    }
    if let Some(priority) = pod.spec.as_ref().and_then(|s| s.priority) {
        cost += f64::from(priority) / (i32::MAX as f64);
    }
    cost
}

/// Fraction of the node's configured lifetime that remains, in [0, 1].
///
/// Nodes close to expiration are discounted so they are preferentially
/// removed. Without an expiration TTL the factor is 1.0.
pub fn lifetime_remaining(clock: &dyn Clock, provisioner: &Provisioner, node: &Node) -> f64 {
    let Some(ttl) = provisioner.spec.expiration_ttl() else {
        return 1.0;
    };
    let Some(created) = node.creation_timestamp() else {
        return 1.0;
    };
    let ttl_seconds = ttl.num_seconds() as f64;
    if ttl_seconds <= 0.0 {
        return 0.0;
    }
    let age = (clock.now() - created.0).num_seconds() as f64;
    (1.0 - age / ttl_seconds).clamp(0.0, 1.0)
}

/// Disruption cost of removing a node: the eviction costs of its
/// reschedulable pods, discounted by remaining lifetime.
pub fn disruption_cost(
    clock: &dyn Clock,
    provisioner: &Provisioner,
    node: &Node,
    node_pods: &[Pod],
) -> f64 {
    let pod_costs: f64 = node_pods
        .iter()
        .filter(|p| pods::is_reschedulable(p))
        .map(pod_eviction_cost)
        .sum();
    pod_costs * lifetime_remaining(clock, provisioner, node)
}
