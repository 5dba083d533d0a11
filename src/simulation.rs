//! Scheduling simulation: what would happen if these nodes were removed?
//!
//! The simulator hands the external scheduler a hypothetical cluster: the
//! pods of the nodes to be removed become pending, merged with the live
//! pending set, against the remaining inventory plus the owning
//! provisioners' instance-type catalogs. The scheduler answers with the
//! synthetic new nodes it would launch and the pods it cannot place.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::ResourceExt;

use crate::candidates::CandidateNode;
use crate::cloud::{CloudProvider, InstanceType, Offering};
use crate::crd::Provisioner;
use crate::state::ClusterState;
use crate::{Error, Result};

#[cfg(test)]
use mockall::automock;

/// Identity of a pod in scheduler results.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodIdentity {
    /// Pod namespace
    pub namespace: String,
    /// Pod name
    pub name: String,
}

/// A node the scheduler would launch, described by the instance types that
/// could back it. The orchestrator picks the concrete type and offering at
/// launch time.
#[derive(Clone, Debug)]
pub struct SyntheticNode {
    /// Provisioner the node would belong to
    pub provisioner: String,
    /// Instance types capable of holding the pods assigned to this node
    pub instance_type_options: Vec<InstanceType>,
}

impl SyntheticNode {
    /// The cheapest launchable backing for this node: minimum
    /// cheapest-offering price, breaking price ties toward the type with
    /// the most CPU headroom.
    pub fn cheapest_option(&self) -> Option<(&InstanceType, &Offering)> {
        self.instance_type_options
            .iter()
            .filter_map(|it| it.cheapest_offering().map(|o| (it, o)))
            .min_by(|(a_it, a), (b_it, b)| {
                a.price
                    .total_cmp(&b.price)
                    .then(b_it.cpu_capacity().total_cmp(&a_it.cpu_capacity()))
            })
    }

    /// Price of the cheapest launchable backing.
    pub fn price(&self) -> Option<f64> {
        self.cheapest_option().map(|(_, o)| o.price)
    }
}

/// An existing node and its pods, as scheduler inventory.
#[derive(Clone, Debug)]
pub struct NodeInventory {
    /// The node
    pub node: Node,
    /// Pods currently bound to it
    pub pods: Vec<Pod>,
}

/// A provisioner and the instance types it may launch.
#[derive(Clone, Debug)]
pub struct ProvisionerCatalog {
    /// The provisioner
    pub provisioner: Provisioner,
    /// Its instance-type catalog
    pub instance_types: Vec<InstanceType>,
}

/// Input to the external scheduler.
#[derive(Clone, Debug)]
pub struct SchedulingRequest {
    /// Pods needing placement
    pub pending_pods: Vec<Pod>,
    /// Existing nodes that remain in the cluster
    pub remaining_nodes: Vec<NodeInventory>,
    /// Provisioners whose catalogs may be used for new nodes
    pub provisioners: Vec<ProvisionerCatalog>,
}

/// Output of the external scheduler.
#[derive(Clone, Debug, Default)]
pub struct SchedulingDecision {
    /// New nodes required to place the pending pods
    pub new_nodes: Vec<SyntheticNode>,
    /// Pods that fit nowhere, even on new nodes
    pub unplaceable: Vec<PodIdentity>,
}

/// External pod scheduler consumed for simulation. Must be deterministic
/// for identical requests.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Compute placements for the pending pods.
    async fn schedule(&self, request: SchedulingRequest) -> Result<SchedulingDecision>;
}

/// Outcome of simulating the removal of a candidate set.
#[derive(Clone, Debug)]
pub struct SimulationResult {
    /// Nodes that would have to be launched
    pub new_nodes: Vec<SyntheticNode>,
    /// Pods that fit nowhere, even on new nodes
    pub unschedulable: Vec<PodIdentity>,
}

impl SimulationResult {
    /// Whether every pod found a place.
    pub fn all_pods_schedulable(&self) -> bool {
        self.unschedulable.is_empty()
    }

    /// Classify an incomplete placement as the simulation-infeasible
    /// error. Consolidation skips the candidate on this; expiration logs
    /// it and expires the node anyway.
    pub fn ensure_feasible(&self) -> Result<()> {
        if self.unschedulable.is_empty() {
            return Ok(());
        }
        Err(Error::SimulationInfeasible {
            unschedulable: self.unschedulable.len(),
        })
    }
}

/// Simulate removing `to_remove` from the cluster.
///
/// Fails with [`Error::CandidateDeleting`] when any of the candidates
/// started deleting since it was built; the caller skips that candidate
/// and continues.
pub async fn simulate(
    scheduler: &Arc<dyn Scheduler>,
    state: &ClusterState,
    cloud: &Arc<dyn CloudProvider>,
    to_remove: &[CandidateNode],
) -> Result<SimulationResult> {
    for candidate in to_remove {
        let name = candidate.name();
        if state.is_marked_for_deletion(&name) || state.node(&name).is_none() {
            return Err(Error::candidate_deleting(name));
        }
    }

    let removed: BTreeSet<String> = to_remove.iter().map(|c| c.name()).collect();

    // Pods on the removed nodes become pending, merged with the live
    // pending set.
    let mut pending_pods: Vec<Pod> = state.pending_pods();
    for candidate in to_remove {
        pending_pods.extend(candidate.reschedulable_pods().into_iter().cloned());
    }

    let remaining_nodes: Vec<NodeInventory> = state
        .nodes()
        .into_iter()
        .filter(|n| {
            let name = n.name_any();
            !removed.contains(&name) && !state.is_marked_for_deletion(&name)
        })
        .map(|node| {
            let pods = state.pods_on_node(&node.name_any());
            NodeInventory { node, pods }
        })
        .collect();

    // Catalogs of the owning provisioners, deduplicated.
    let mut seen = BTreeSet::new();
    let mut provisioners = Vec::new();
    for candidate in to_remove {
        let name = candidate.provisioner.name_any();
        if seen.insert(name) {
            let instance_types = cloud.instance_types(&candidate.provisioner).await?;
            provisioners.push(ProvisionerCatalog {
                provisioner: candidate.provisioner.clone(),
                instance_types,
            });
        }
    }

    let decision = scheduler
        .schedule(SchedulingRequest {
            pending_pods,
            remaining_nodes,
            provisioners,
        })
        .await?;

    Ok(SimulationResult {
        new_nodes: decision.new_nodes,
        unschedulable: decision.unplaceable,
    })
}

/// Deterministic CPU-only first-fit scheduler.
///
/// Places pods on the remaining nodes first-fit by CPU request, then
/// packs overflow onto synthetic nodes backed by every catalog type that
/// fits the accumulated load. Deployments with a richer scheduler
/// (affinity, topology spread, taints) supply their own [`Scheduler`];
/// this one is deliberately conservative and is the default the binary
/// wires when none is configured.
pub struct FirstFitScheduler;

struct OpenNode {
    load: f64,
    provisioner: String,
}

fn fits_some_type(catalog: &[&InstanceType], load: f64) -> bool {
    catalog
        .iter()
        .any(|it| it.cheapest_offering().is_some() && it.cpu_capacity() >= load)
}

#[async_trait]
impl Scheduler for FirstFitScheduler {
    async fn schedule(&self, request: SchedulingRequest) -> Result<SchedulingDecision> {
        let catalog: Vec<&InstanceType> = request
            .provisioners
            .iter()
            .flat_map(|p| p.instance_types.iter())
            .collect();
        let default_provisioner = request
            .provisioners
            .first()
            .map(|p| p.provisioner.name_any())
            .unwrap_or_default();

        // Free CPU on each schedulable remaining node.
        let mut free: Vec<f64> = request
            .remaining_nodes
            .iter()
            .filter(|inv| {
                !inv.node
                    .spec
                    .as_ref()
                    .and_then(|s| s.unschedulable)
                    .unwrap_or(false)
            })
            .map(|inv| {
                let used: f64 = inv.pods.iter().map(crate::resources::pod_cpu_request).sum();
                crate::resources::node_allocatable_cpu(&inv.node) - used
            })
            .collect();

        // Largest pods first keeps the packing deterministic.
        let mut pending = request.pending_pods;
        pending.sort_by(|a, b| {
            crate::resources::pod_cpu_request(b)
                .total_cmp(&crate::resources::pod_cpu_request(a))
                .then_with(|| a.name_any().cmp(&b.name_any()))
        });

        let mut open: Vec<OpenNode> = Vec::new();
        let mut unplaceable = Vec::new();
        for pod in &pending {
            let request_cpu = crate::resources::pod_cpu_request(pod);
            if let Some(slot) = free.iter_mut().find(|f| **f >= request_cpu) {
                *slot -= request_cpu;
                continue;
            }
            if let Some(node) = open
                .iter_mut()
                .find(|n| fits_some_type(&catalog, n.load + request_cpu))
            {
                node.load += request_cpu;
                continue;
            }
            if fits_some_type(&catalog, request_cpu) {
                open.push(OpenNode {
                    load: request_cpu,
                    provisioner: default_provisioner.clone(),
                });
            } else {
                unplaceable.push(PodIdentity {
                    namespace: pod.namespace().unwrap_or_default(),
                    name: pod.name_any(),
                });
            }
        }

        let new_nodes = open
            .into_iter()
            .map(|n| SyntheticNode {
                provisioner: n.provisioner,
                instance_type_options: catalog
                    .iter()
                    .filter(|it| it.cheapest_offering().is_some() && it.cpu_capacity() >= n.load)
                    .map(|it| (*it).clone())
                    .collect(),
            })
            .collect();

        Ok(SchedulingDecision {
            new_nodes,
            unplaceable,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::fake::FakeCloudProvider;
    use crate::fixtures::{candidate_on, instance_type, node, pod, PodSpecExt};

    fn cloud_with(types: Vec<InstanceType>) -> Arc<dyn CloudProvider> {
        Arc::new(FakeCloudProvider::new(types))
    }

    #[tokio::test]
    async fn empty_node_removal_needs_no_new_capacity() {
        let state = ClusterState::new();
        let n1 = node("n1", "default", "small", "on-demand", "z1", 4.0);
        state.upsert_node(n1.clone());

        let cloud = cloud_with(vec![instance_type("small", 0.3, 4.0)]);
        let scheduler: Arc<dyn Scheduler> = Arc::new(FirstFitScheduler);
        let candidate = candidate_on(n1, "default", instance_type("small", 0.3, 4.0), vec![]);

        let result = simulate(&scheduler, &state, &cloud, &[candidate])
            .await
            .unwrap();
        assert!(result.new_nodes.is_empty());
        assert!(result.all_pods_schedulable());
    }

    #[tokio::test]
    async fn deleting_candidate_fails_with_candidate_deleting() {
        let state = ClusterState::new();
        let n1 = node("n1", "default", "small", "on-demand", "z1", 4.0);
        state.upsert_node(n1.clone());
        state.mark_for_deletion(&["n1".to_string()]);

        let cloud = cloud_with(vec![instance_type("small", 0.3, 4.0)]);
        let scheduler: Arc<dyn Scheduler> = Arc::new(FirstFitScheduler);
        let candidate = candidate_on(n1, "default", instance_type("small", 0.3, 4.0), vec![]);

        let err = simulate(&scheduler, &state, &cloud, &[candidate])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CandidateDeleting { .. }));
    }

    #[tokio::test]
    async fn pods_of_removed_nodes_are_handed_to_the_scheduler_as_pending() {
        let state = ClusterState::new();
        let n1 = node("n1", "default", "small", "on-demand", "z1", 4.0);
        state.upsert_node(n1.clone());
        let bound = pod("p1", "default")
            .owned_by("ReplicaSet", "app")
            .with_cpu_request(1.0)
            .bound_to("n1");
        state.upsert_pod(bound.clone());

        let cloud = cloud_with(vec![instance_type("small", 0.3, 4.0)]);
        let scheduler: Arc<dyn Scheduler> = Arc::new(FirstFitScheduler);
        let candidate = candidate_on(
            n1,
            "default",
            instance_type("small", 0.3, 4.0),
            vec![bound],
        );

        // No remaining nodes, so the pod forces a synthetic node.
        let result = simulate(&scheduler, &state, &cloud, &[candidate])
            .await
            .unwrap();
        assert_eq!(result.new_nodes.len(), 1);
        assert!(result.all_pods_schedulable());
    }

    #[tokio::test]
    async fn scheduler_sees_remaining_inventory_without_the_removed_nodes() {
        let state = ClusterState::new();
        let keep = node("keep", "default", "small", "on-demand", "z1", 4.0);
        let gone = node("gone", "default", "small", "on-demand", "z1", 4.0);
        state.upsert_node(keep);
        state.upsert_node(gone.clone());

        let mut mock = MockScheduler::new();
        mock.expect_schedule()
            .withf(|request| {
                request.remaining_nodes.len() == 1
                    && request.remaining_nodes[0].node.name_any() == "keep"
                    && request.provisioners.len() == 1
            })
            .returning(|_| Ok(SchedulingDecision::default()));

        let cloud = cloud_with(vec![instance_type("small", 0.3, 4.0)]);
        let scheduler: Arc<dyn Scheduler> = Arc::new(mock);
        let candidate = candidate_on(gone, "default", instance_type("small", 0.3, 4.0), vec![]);
        simulate(&scheduler, &state, &cloud, &[candidate])
            .await
            .unwrap();
    }

    #[test]
    fn incomplete_placement_classifies_as_simulation_infeasible() {
        let result = SimulationResult {
            new_nodes: vec![],
            unschedulable: vec![PodIdentity {
                namespace: "default".into(),
                name: "web-0".into(),
            }],
        };
        let err = result.ensure_feasible().unwrap_err();
        assert!(matches!(err, Error::SimulationInfeasible { unschedulable: 1 }));
        // Infeasibility skips the candidate rather than failing the pass.
        assert!(err.is_candidate_local());
    }

    #[test]
    fn cheapest_option_breaks_price_ties_by_headroom() {
        let synthetic = SyntheticNode {
            provisioner: "default".into(),
            instance_type_options: vec![
                instance_type("narrow", 0.3, 4.0),
                instance_type("wide", 0.3, 16.0),
            ],
        };
        let (it, offering) = synthetic.cheapest_option().unwrap();
        assert_eq!(it.name, "wide");
        assert_eq!(offering.price, 0.3);
    }
}
