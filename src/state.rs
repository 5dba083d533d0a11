//! In-memory view of live cluster state.
//!
//! The cache is fed by watchers (or directly by tests) and read by the
//! deprovisioning pass. The orchestrator never mutates nodes or pods here
//! except through the mark-for-deletion primitive; object changes arrive
//! through the watch stream.
//!
//! Accessors return owned clones so a pass operates on a consistent
//! snapshot even while watchers keep updating the cache.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

use k8s_openapi::api::core::v1::{Node, Pod};
use kube::ResourceExt;

use crate::crd::Provisioner;

#[derive(Default)]
struct Inner {
    nodes: BTreeMap<String, Node>,
    // key: "namespace/name"
    pods: BTreeMap<String, Pod>,
    provisioners: BTreeMap<String, Provisioner>,
    marked_for_deletion: BTreeSet<String>,
}

/// Shared cluster-state cache.
#[derive(Default)]
pub struct ClusterState {
    inner: RwLock<Inner>,
}

fn pod_key(pod: &Pod) -> String {
    format!(
        "{}/{}",
        pod.namespace().unwrap_or_default(),
        pod.name_any()
    )
}

impl ClusterState {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update a node.
    pub fn upsert_node(&self, node: Node) {
        let mut inner = self.inner.write().unwrap();
        inner.nodes.insert(node.name_any(), node);
    }

    /// Remove a node once its object is gone from the API server. Clears
    /// any deletion mark so the name can be reused.
    pub fn delete_node(&self, name: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.nodes.remove(name);
        inner.marked_for_deletion.remove(name);
    }

    /// Insert or update a pod.
    pub fn upsert_pod(&self, pod: Pod) {
        let mut inner = self.inner.write().unwrap();
        inner.pods.insert(pod_key(&pod), pod);
    }

    /// Remove a pod.
    pub fn delete_pod(&self, namespace: &str, name: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.pods.remove(&format!("{namespace}/{name}"));
    }

    /// Insert or update a provisioner.
    pub fn upsert_provisioner(&self, provisioner: Provisioner) {
        let mut inner = self.inner.write().unwrap();
        inner
            .provisioners
            .insert(provisioner.name_any(), provisioner);
    }

    /// Remove a provisioner.
    pub fn delete_provisioner(&self, name: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.provisioners.remove(name);
    }

    /// Snapshot of all live nodes.
    pub fn nodes(&self) -> Vec<Node> {
        self.inner.read().unwrap().nodes.values().cloned().collect()
    }

    /// Look up a single node by name.
    pub fn node(&self, name: &str) -> Option<Node> {
        self.inner.read().unwrap().nodes.get(name).cloned()
    }

    /// Snapshot of all known provisioners, keyed by name.
    pub fn provisioners(&self) -> BTreeMap<String, Provisioner> {
        self.inner.read().unwrap().provisioners.clone()
    }

    /// Pods currently bound to the named node.
    pub fn pods_on_node(&self, node_name: &str) -> Vec<Pod> {
        self.inner
            .read()
            .unwrap()
            .pods
            .values()
            .filter(|p| {
                p.spec
                    .as_ref()
                    .and_then(|s| s.node_name.as_deref())
                    .is_some_and(|n| n == node_name)
            })
            .cloned()
            .collect()
    }

    /// Pods awaiting scheduling (no node assignment yet).
    pub fn pending_pods(&self) -> Vec<Pod> {
        self.inner
            .read()
            .unwrap()
            .pods
            .values()
            .filter(|p| {
                p.spec
                    .as_ref()
                    .and_then(|s| s.node_name.as_deref())
                    .is_none()
            })
            .cloned()
            .collect()
    }

    /// Mark nodes as being deleted by the orchestrator. Marked nodes are
    /// excluded from candidacy until the node object disappears.
    pub fn mark_for_deletion(&self, names: &[String]) {
        let mut inner = self.inner.write().unwrap();
        inner.marked_for_deletion.extend(names.iter().cloned());
    }

    /// Roll back a deletion mark, e.g. after a failed replacement launch.
    pub fn unmark_for_deletion(&self, names: &[String]) {
        let mut inner = self.inner.write().unwrap();
        for name in names {
            inner.marked_for_deletion.remove(name);
        }
    }

    /// Whether the named node is currently marked for deletion.
    pub fn is_marked_for_deletion(&self, name: &str) -> bool {
        self.inner
            .read()
            .unwrap()
            .marked_for_deletion
            .contains(name)
    }
}
