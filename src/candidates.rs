//! Candidate construction: which live nodes may be considered for
//! deprovisioning in this pass.
//!
//! Candidates are value records built once per pass and discarded at pass
//! end; they reference the live node, its owning provisioner, the pods
//! bound to it, and the pricing data needed by the consolidation rules.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::ResourceExt;
use tracing::debug;

use crate::cloud::{CloudProvider, InstanceType};
use crate::clock::Clock;
use crate::cost;
use crate::crd::{keys, Provisioner};
use crate::pods;
use crate::state::ClusterState;
use crate::Result;

/// A live node under consideration in the current pass, with everything a
/// sub-reconciler needs attached.
#[derive(Clone)]
pub struct CandidateNode {
    /// The live node object
    pub node: Node,
    /// The provisioner owning the node
    pub provisioner: Provisioner,
    /// Pods currently bound to the node
    pub pods: Vec<Pod>,
    /// Resolved instance type of the node
    pub instance_type: InstanceType,
    /// Capacity type the node was launched with
    pub capacity_type: String,
    /// Zone the node runs in
    pub zone: String,
    /// Precomputed disruption cost (pod eviction costs x lifetime factor)
    pub disruption_cost: f64,
}

impl CandidateNode {
    /// Node name.
    pub fn name(&self) -> String {
        self.node.name_any()
    }

    /// Pods that would need rescheduling if this node were removed.
    pub fn reschedulable_pods(&self) -> Vec<&Pod> {
        self.pods
            .iter()
            .filter(|p| pods::is_reschedulable(p))
            .collect()
    }

    /// True when no non-daemon pods are bound to the node.
    pub fn is_empty(&self) -> bool {
        self.reschedulable_pods().is_empty()
    }

    /// Price of the offering this node is currently running on.
    pub fn current_price(&self) -> Option<f64> {
        self.instance_type
            .offering_for(&self.capacity_type, &self.zone)
            .map(|o| o.price)
    }

    /// When the node expires under its provisioner's TTL, if any.
    pub fn expiration_time(&self) -> Option<DateTime<Utc>> {
        let ttl = self.provisioner.spec.expiration_ttl()?;
        let created = self.node.creation_timestamp()?;
        Some(created.0 + ttl)
    }

    /// True when the node carries the do-not-consolidate annotation.
    pub fn is_do_not_consolidate(&self) -> bool {
        self.node
            .annotations()
            .get(keys::DO_NOT_CONSOLIDATE_ANNOTATION)
            .map(|v| v == "true")
            .unwrap_or(false)
    }

    /// True when the node is cordoned.
    pub fn is_unschedulable(&self) -> bool {
        self.node
            .spec
            .as_ref()
            .and_then(|s| s.unschedulable)
            .unwrap_or(false)
    }
}

fn node_label<'a>(node: &'a Node, key: &str) -> Option<&'a str> {
    node.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(key))
        .map(String::as_str)
}

fn is_initialized(node: &Node) -> bool {
    node_label(node, keys::INITIALIZED_LABEL).is_some_and(|v| v == "true")
}

fn is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// Build the pass's candidate list from the cluster-state snapshot.
///
/// Exclusion rules: uninitialized or not-Ready nodes, nodes already being
/// deleted (API deletion timestamp or orchestrator mark), and nodes whose
/// provisioner label is missing or names an unknown provisioner. Cordoned
/// nodes are included here; sub-reconcilers that disallow them filter on
/// [`CandidateNode::is_unschedulable`].
pub async fn build_candidates(
    clock: &dyn Clock,
    state: &ClusterState,
    provisioners: &BTreeMap<String, Provisioner>,
    cloud: &Arc<dyn CloudProvider>,
) -> Result<Vec<CandidateNode>> {
    // One catalog fetch per provisioner per pass.
    let mut catalogs: BTreeMap<String, Vec<InstanceType>> = BTreeMap::new();
    for (name, provisioner) in provisioners {
        catalogs.insert(name.clone(), cloud.instance_types(provisioner).await?);
    }

    let mut candidates = Vec::new();
    for node in state.nodes() {
        let name = node.name_any();
        if !is_initialized(&node) || !is_ready(&node) {
            debug!(node = %name, "Skipping candidate: not initialized or not ready");
            continue;
        }
        if node.metadata.deletion_timestamp.is_some() || state.is_marked_for_deletion(&name) {
            debug!(node = %name, "Skipping candidate: already deleting");
            continue;
        }
        let Some(provisioner_name) = node_label(&node, keys::PROVISIONER_NAME_LABEL) else {
            debug!(node = %name, "Skipping candidate: no provisioner label");
            continue;
        };
        let Some(provisioner) = provisioners.get(provisioner_name) else {
            debug!(
                node = %name,
                provisioner = %provisioner_name,
                "Skipping candidate: unknown provisioner"
            );
            continue;
        };
        let Some(instance_type_name) = node_label(&node, keys::INSTANCE_TYPE_LABEL) else {
            debug!(node = %name, "Skipping candidate: no instance-type label");
            continue;
        };
        let Some(instance_type) = catalogs
            .get(provisioner_name)
            .and_then(|c| c.iter().find(|it| it.name == instance_type_name))
            .cloned()
        else {
            debug!(
                node = %name,
                instance_type = %instance_type_name,
                "Skipping candidate: instance type not in provisioner catalog"
            );
            continue;
        };

        let capacity_type = node_label(&node, keys::CAPACITY_TYPE_LABEL)
            .unwrap_or(keys::CAPACITY_TYPE_ON_DEMAND)
            .to_string();
        let zone = node_label(&node, keys::ZONE_LABEL).unwrap_or_default().to_string();
        let node_pods = state.pods_on_node(&name);
        let disruption_cost = cost::disruption_cost(clock, provisioner, &node, &node_pods);

        candidates.push(CandidateNode {
            provisioner: provisioner.clone(),
            pods: node_pods,
            instance_type,
            capacity_type,
            zone,
            disruption_cost,
            node,
        });
    }
    Ok(candidates)
}
