//! Disruption gate: may a node be terminated right now?
//!
//! The gate is consulted twice per decision: a fast check before the
//! expensive scheduling simulation, and an authoritative check right
//! before termination is issued. It enforces the do-not-evict annotation
//! and a per-pass PodDisruptionBudget snapshot, accounting hypothetical
//! evictions set-wise so multi-node decisions cannot over-disrupt.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::ResourceExt;
use tracing::{debug, warn};

use crate::candidates::CandidateNode;
use crate::pods;

/// Per-sub-reconciler gate behavior.
#[derive(Clone, Copy, Debug, Default)]
pub struct GatePolicy {
    /// Evict pods despite the do-not-evict annotation (expiration only;
    /// a warning is logged for each such pod).
    pub ignore_do_not_evict: bool,
}

#[derive(Clone, Debug)]
struct PdbEntry {
    namespace: String,
    name: String,
    selector: LabelSelector,
    disruptions_allowed: i32,
}

/// Snapshot of every PDB's remaining allowed disruptions, captured once
/// per pass.
#[derive(Clone, Debug, Default)]
pub struct PdbSnapshot {
    entries: Vec<PdbEntry>,
}

/// Whether a label selector matches the given labels (matchLabels plus
/// In/NotIn/Exists/DoesNotExist expressions).
fn selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    if let Some(match_labels) = &selector.match_labels {
        for (k, v) in match_labels {
            if labels.get(k) != Some(v) {
                return false;
            }
        }
    }
    if let Some(expressions) = &selector.match_expressions {
        for expr in expressions {
            let value = labels.get(&expr.key).map(String::as_str);
            let values = expr.values.as_deref().unwrap_or_default();
            let ok = match expr.operator.as_str() {
                "In" => value.is_some_and(|v| values.iter().any(|x| x == v)),
                "NotIn" => value.is_none_or(|v| !values.iter().any(|x| x == v)),
                "Exists" => value.is_some(),
                "DoesNotExist" => value.is_none(),
                _ => false,
            };
            if !ok {
                return false;
            }
        }
    }
    true
}

impl PdbSnapshot {
    /// Build a snapshot from the PDBs live at the start of the pass.
    pub fn new(pdbs: Vec<PodDisruptionBudget>) -> Self {
        let entries = pdbs
            .into_iter()
            .filter_map(|pdb| {
                let namespace = pdb.namespace()?;
                let name = pdb.name_any();
                let selector = pdb.spec.as_ref()?.selector.clone()?;
                let disruptions_allowed = pdb
                    .status
                    .as_ref()
                    .map(|s| s.disruptions_allowed)
                    .unwrap_or(0);
                Some(PdbEntry {
                    namespace,
                    name,
                    selector,
                    disruptions_allowed,
                })
            })
            .collect();
        Self { entries }
    }

    fn matching_entries<'a>(&'a self, pod: &Pod) -> impl Iterator<Item = &'a PdbEntry> + 'a {
        let namespace = pod.namespace().unwrap_or_default();
        let labels = pod.metadata.labels.clone().unwrap_or_default();
        self.entries
            .iter()
            .filter(move |e| e.namespace == namespace && selector_matches(&e.selector, &labels))
    }

    /// Whether evicting this whole set of pods at once stays within every
    /// budget. Pods matched by the same PDB are counted cumulatively, so a
    /// multi-node command cannot disrupt a budget twice over.
    pub fn allows_eviction_of(&self, pods_to_evict: &[&Pod]) -> bool {
        let mut charged: BTreeMap<(String, String), i32> = BTreeMap::new();
        for pod in pods_to_evict {
            for entry in self.matching_entries(pod) {
                let key = (entry.namespace.clone(), entry.name.clone());
                let count = charged.entry(key).or_insert(0);
                *count += 1;
                if *count > entry.disruptions_allowed {
                    debug!(
                        pdb = %format!("{}/{}", entry.namespace, entry.name),
                        pod = %pods::qualified_name(pod),
                        allowed = entry.disruptions_allowed,
                        "Eviction set exceeds PodDisruptionBudget"
                    );
                    return false;
                }
            }
        }
        true
    }
}

/// Whether every pod on the candidate may be disrupted right now.
///
/// Daemon pods and already-terminal pods are not counted. Ownerless pods
/// are allowed through with a warning: nothing will recreate them after
/// the eviction.
pub fn can_be_terminated(
    candidate: &CandidateNode,
    pdbs: &PdbSnapshot,
    policy: &GatePolicy,
) -> bool {
    can_terminate_all(std::slice::from_ref(candidate), pdbs, policy)
}

/// Set-wise variant of [`can_be_terminated`] for multi-node commands: the
/// PDB budget must accommodate every reschedulable pod across all
/// candidates at once.
pub fn can_terminate_all(
    candidates: &[CandidateNode],
    pdbs: &PdbSnapshot,
    policy: &GatePolicy,
) -> bool {
    let mut evictable = Vec::new();
    for candidate in candidates {
        for pod in candidate.reschedulable_pods() {
            if pods::is_do_not_evict(pod) {
                if policy.ignore_do_not_evict {
                    warn!(
                        node = %candidate.name(),
                        pod = %pods::qualified_name(pod),
                        "Evicting pod despite do-not-evict annotation"
                    );
                } else {
                    debug!(
                        node = %candidate.name(),
                        pod = %pods::qualified_name(pod),
                        "Node cannot be terminated: pod carries do-not-evict"
                    );
                    return false;
                }
            }
            if !pods::has_controller(pod) {
                warn!(
                    node = %candidate.name(),
                    pod = %pods::qualified_name(pod),
                    "Pod has no owner controller and will not be recreated after eviction"
                );
            }
            evictable.push(pod);
        }
    }
    pdbs.allows_eviction_of(&evictable)
}
