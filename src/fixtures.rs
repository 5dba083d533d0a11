//! Shared test fixtures: object builders, a first-fit test scheduler, and
//! a recording Kubernetes API fake.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    Container, Node, NodeCondition, NodeSpec, NodeStatus, Pod, PodSpec, ResourceRequirements,
};
use k8s_openapi::api::policy::v1::{
    PodDisruptionBudget, PodDisruptionBudgetSpec, PodDisruptionBudgetStatus,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference, Time};
use kube::api::ObjectMeta;
use kube::ResourceExt;

use crate::api::KubeApi;
use crate::candidates::CandidateNode;
use crate::clock::FakeClock;
use crate::cloud::fake::FakeCloudProvider;
use crate::cloud::{InstanceType, Offering};
use crate::crd::{keys, Provisioner, ProvisionerSpec};
use crate::deprovisioning::PassContext;
use crate::gate::PdbSnapshot;
use crate::simulation::SyntheticNode;
use crate::state::ClusterState;
use crate::Result;

// =============================================================================
// Object builders
// =============================================================================

/// A Ready, initialized node owned by the named provisioner.
pub fn node(
    name: &str,
    provisioner: &str,
    instance_type: &str,
    capacity_type: &str,
    zone: &str,
    cpu: f64,
) -> Node {
    let labels = BTreeMap::from([
        (keys::PROVISIONER_NAME_LABEL.to_string(), provisioner.to_string()),
        (keys::INITIALIZED_LABEL.to_string(), "true".to_string()),
        (keys::INSTANCE_TYPE_LABEL.to_string(), instance_type.to_string()),
        (keys::CAPACITY_TYPE_LABEL.to_string(), capacity_type.to_string()),
        (keys::ZONE_LABEL.to_string(), zone.to_string()),
    ]);
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels),
            creation_timestamp: Some(Time(Utc::now())),
            ..Default::default()
        },
        spec: Some(NodeSpec::default()),
        status: Some(NodeStatus {
            allocatable: Some(BTreeMap::from([
                ("cpu".to_string(), Quantity(cpu.to_string())),
                ("pods".to_string(), Quantity("110".to_string())),
            ])),
            conditions: Some(vec![NodeCondition {
                type_: "Ready".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

/// A bare pod in the given namespace.
pub fn pod(name: &str, namespace: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "app".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Builder-style extensions for pod fixtures.
pub trait PodSpecExt: Sized {
    /// Add a controlling owner reference.
    fn owned_by(self, kind: &str, name: &str) -> Self;
    /// Add an annotation.
    fn with_annotation(self, key: &str, value: &str) -> Self;
    /// Add a label.
    fn with_label(self, key: &str, value: &str) -> Self;
    /// Set the CPU request on the first container.
    fn with_cpu_request(self, cpu: f64) -> Self;
    /// Set the pod priority.
    fn with_priority(self, priority: i32) -> Self;
    /// Bind the pod to a node.
    fn bound_to(self, node: &str) -> Self;
}

impl PodSpecExt for Pod {
    fn owned_by(mut self, kind: &str, name: &str) -> Self {
        self.metadata
            .owner_references
            .get_or_insert_default()
            .push(OwnerReference {
                api_version: "apps/v1".to_string(),
                kind: kind.to_string(),
                name: name.to_string(),
                uid: format!("{kind}-{name}-uid"),
                controller: Some(true),
                block_owner_deletion: Some(true),
            });
        self
    }

    fn with_annotation(mut self, key: &str, value: &str) -> Self {
        self.metadata
            .annotations
            .get_or_insert_default()
            .insert(key.to_string(), value.to_string());
        self
    }

    fn with_label(mut self, key: &str, value: &str) -> Self {
        self.metadata
            .labels
            .get_or_insert_default()
            .insert(key.to_string(), value.to_string());
        self
    }

    fn with_cpu_request(mut self, cpu: f64) -> Self {
        let spec = self.spec.get_or_insert_default();
        if let Some(container) = spec.containers.first_mut() {
            container.resources = Some(ResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "cpu".to_string(),
                    Quantity(cpu.to_string()),
                )])),
                ..Default::default()
            });
        }
        self
    }

    fn with_priority(mut self, priority: i32) -> Self {
        self.spec.get_or_insert_default().priority = Some(priority);
        self
    }

    fn bound_to(mut self, node: &str) -> Self {
        self.spec.get_or_insert_default().node_name = Some(node.to_string());
        self
    }
}

/// A provisioner with an empty (all-disabled) spec.
pub fn provisioner(name: &str) -> Provisioner {
    provisioner_with(name, |_| {})
}

/// A provisioner whose spec is adjusted by the given closure.
pub fn provisioner_with(name: &str, f: impl FnOnce(&mut ProvisionerSpec)) -> Provisioner {
    let mut spec = ProvisionerSpec::default();
    f(&mut spec);
    let mut p = Provisioner::new(name, spec);
    p.metadata.creation_timestamp = Some(Time(Utc::now()));
    p
}

/// An instance type with a single available on-demand offering in
/// test-zone-1a.
pub fn instance_type(name: &str, price: f64, cpu: f64) -> InstanceType {
    InstanceType {
        name: name.to_string(),
        offerings: vec![Offering {
            capacity_type: keys::CAPACITY_TYPE_ON_DEMAND.to_string(),
            zone: "test-zone-1a".to_string(),
            price,
            available: true,
        }],
        capacity: BTreeMap::from([
            ("cpu".to_string(), Quantity(cpu.to_string())),
            ("pods".to_string(), Quantity("110".to_string())),
        ]),
    }
}

/// An instance type with only spot offerings, one per (zone, price) pair.
pub fn spot_instance_type(name: &str, zones: &[(&str, f64)]) -> InstanceType {
    InstanceType {
        name: name.to_string(),
        offerings: zones
            .iter()
            .map(|(zone, price)| Offering {
                capacity_type: keys::CAPACITY_TYPE_SPOT.to_string(),
                zone: zone.to_string(),
                price: *price,
                available: true,
            })
            .collect(),
        capacity: BTreeMap::from([("cpu".to_string(), Quantity("4".to_string()))]),
    }
}

/// A PDB matching the given labels with the given remaining disruptions.
pub fn pdb(
    namespace: &str,
    name: &str,
    match_labels: &[(&str, &str)],
    disruptions_allowed: i32,
) -> PodDisruptionBudget {
    PodDisruptionBudget {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(PodDisruptionBudgetSpec {
            selector: Some(LabelSelector {
                match_labels: Some(
                    match_labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                match_expressions: None,
            }),
            ..Default::default()
        }),
        status: Some(PodDisruptionBudgetStatus {
            disruptions_allowed,
            ..Default::default()
        }),
    }
}

/// A synthetic replacement node proposal.
pub fn synthetic(provisioner: &str, options: Vec<InstanceType>) -> SyntheticNode {
    SyntheticNode {
        provisioner: provisioner.to_string(),
        instance_type_options: options,
    }
}

// =============================================================================
// Candidate builders
// =============================================================================

/// A candidate over an explicit node and instance type; capacity type and
/// zone are read from the node's labels.
pub fn candidate_on(
    node: Node,
    provisioner_name: &str,
    instance_type: InstanceType,
    pods: Vec<Pod>,
) -> CandidateNode {
    let labels = node.metadata.labels.clone().unwrap_or_default();
    let disruption_cost = pods
        .iter()
        .filter(|p| crate::pods::is_reschedulable(p))
        .map(crate::cost::pod_eviction_cost)
        .sum();
    CandidateNode {
        node,
        provisioner: provisioner(provisioner_name),
        pods,
        instance_type,
        capacity_type: labels
            .get(keys::CAPACITY_TYPE_LABEL)
            .cloned()
            .unwrap_or_else(|| keys::CAPACITY_TYPE_ON_DEMAND.to_string()),
        zone: labels.get(keys::ZONE_LABEL).cloned().unwrap_or_default(),
        disruption_cost,
    }
}

/// A candidate on a fresh node of the named instance type priced at
/// `price` (on-demand, test-zone-1a).
pub fn candidate(
    name: &str,
    provisioner_name: &str,
    instance_type_name: &str,
    price: f64,
    pods: Vec<Pod>,
) -> CandidateNode {
    let n = node(
        name,
        provisioner_name,
        instance_type_name,
        keys::CAPACITY_TYPE_ON_DEMAND,
        "test-zone-1a",
        4.0,
    );
    candidate_on(n, provisioner_name, instance_type(instance_type_name, price, 4.0), pods)
}

/// A candidate whose provisioner has consolidation enabled.
pub fn consolidating_candidate(
    name: &str,
    instance_type_name: &str,
    price: f64,
    pods: Vec<Pod>,
) -> CandidateNode {
    let mut c = candidate(name, "default", instance_type_name, price, pods);
    c.provisioner = provisioner_with("default", |spec| {
        spec.consolidation = Some(crate::crd::ConsolidationSpec { enabled: true });
    });
    c
}

/// A candidate with an explicit provisioner and node creation time, on a
/// "small" instance priced 0.5.
pub fn candidate_with_provisioner(
    name: &str,
    provisioner: Provisioner,
    created_at: DateTime<Utc>,
    pods: Vec<Pod>,
) -> CandidateNode {
    let mut n = node(
        name,
        &provisioner.name_any(),
        "small",
        keys::CAPACITY_TYPE_ON_DEMAND,
        "test-zone-1a",
        4.0,
    );
    n.metadata.creation_timestamp = Some(Time(created_at));
    let mut c = candidate_on(n, &provisioner.name_any(), instance_type("small", 0.5, 4.0), pods);
    c.provisioner = provisioner;
    c
}

/// A pass context over empty state, an empty catalog, and the first-fit
/// scheduler.
pub fn pass_context() -> PassContext {
    PassContext {
        clock: Arc::new(FakeClock::default()),
        state: Arc::new(ClusterState::new()),
        cloud: Arc::new(FakeCloudProvider::new(vec![])),
        scheduler: Arc::new(FirstFitScheduler),
        pdbs: PdbSnapshot::default(),
    }
}

pub use crate::simulation::FirstFitScheduler;

// =============================================================================
// Recording Kubernetes API fake
// =============================================================================

/// Kubernetes API fake that applies mutations to a shared
/// [`ClusterState`] and records them for assertions. Created nodes are
/// always Ready; deletions take effect immediately.
pub struct FakeKubeApi {
    state: Arc<ClusterState>,
    pdbs: RwLock<Vec<PodDisruptionBudget>>,
    cordoned: Mutex<Vec<String>>,
    evictions: Mutex<Vec<String>>,
}

impl FakeKubeApi {
    /// Create a fake over the given shared state.
    pub fn new(state: Arc<ClusterState>) -> Self {
        Self {
            state,
            pdbs: RwLock::new(Vec::new()),
            cordoned: Mutex::new(Vec::new()),
            evictions: Mutex::new(Vec::new()),
        }
    }

    /// Serve these PDBs from `list_pdbs`.
    pub fn set_pdbs(&self, pdbs: Vec<PodDisruptionBudget>) {
        *self.pdbs.write().unwrap() = pdbs;
    }

    /// Evicted pods, as "namespace/name", in eviction order.
    pub fn evictions(&self) -> Vec<String> {
        self.evictions.lock().unwrap().clone()
    }

    /// Whether the node is currently cordoned.
    pub fn is_cordoned(&self, name: &str) -> bool {
        self.cordoned.lock().unwrap().iter().any(|n| n == name)
    }

    fn set_unschedulable(&self, name: &str, value: bool) {
        if let Some(mut node) = self.state.node(name) {
            node.spec.get_or_insert_default().unschedulable = Some(value);
            self.state.upsert_node(node);
        }
    }
}

#[async_trait]
impl KubeApi for FakeKubeApi {
    async fn cordon(&self, node: &str) -> Result<()> {
        self.set_unschedulable(node, true);
        self.cordoned.lock().unwrap().push(node.to_string());
        Ok(())
    }

    async fn uncordon(&self, node: &str) -> Result<()> {
        self.set_unschedulable(node, false);
        self.cordoned.lock().unwrap().retain(|n| n != node);
        Ok(())
    }

    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<()> {
        self.evictions
            .lock()
            .unwrap()
            .push(format!("{namespace}/{name}"));
        self.state.delete_pod(namespace, name);
        Ok(())
    }

    async fn delete_node(&self, node: &str) -> Result<()> {
        self.state.delete_node(node);
        Ok(())
    }

    async fn node_exists(&self, node: &str) -> Result<bool> {
        Ok(self.state.node(node).is_some())
    }

    async fn node_is_ready(&self, _node: &str) -> Result<bool> {
        Ok(true)
    }

    async fn list_pdbs(&self) -> Result<Vec<PodDisruptionBudget>> {
        Ok(self.pdbs.read().unwrap().clone())
    }
}
