//! Deprovisioning decision engine.
//!
//! Four sub-reconcilers cooperate under a single orchestrator, consulted
//! in fixed priority order each pass: expiration, emptiness, single-node
//! consolidation, multi-node consolidation. Each computes a [`Command`];
//! the first non-empty command is validated after a stabilization delay
//! and then executed.

mod consolidation;
mod controller;
mod emptiness;
mod expiration;
mod multi_node;
mod single_node;

pub use controller::{DeprovisioningController, PassOutcome};
pub use emptiness::Emptiness;
pub use expiration::Expiration;
pub use multi_node::MultiNodeConsolidation;
pub use single_node::SingleNodeConsolidation;

use std::sync::Arc;

use async_trait::async_trait;

use crate::candidates::CandidateNode;
use crate::clock::Clock;
use crate::cloud::CloudProvider;
use crate::gate::{GatePolicy, PdbSnapshot};
use crate::simulation::{Scheduler, SyntheticNode};
use crate::state::ClusterState;
use crate::Result;

/// What a command does to the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// No candidate yielded a decision
    DoNothing,
    /// Remove the nodes; their pods fit on remaining capacity
    Delete,
    /// Launch the replacement nodes, then remove the originals
    Replace,
}

/// The engine's output: which nodes to remove and what, if anything, to
/// launch in their place.
#[derive(Clone)]
pub struct Command {
    /// What to do
    pub action: Action,
    /// Candidates to remove, a subset of the pass's candidates
    pub nodes_to_remove: Vec<CandidateNode>,
    /// Replacements to launch before removal; non-empty iff `action` is
    /// [`Action::Replace`]
    pub replacement_nodes: Vec<SyntheticNode>,
}

impl Command {
    /// A pass with nothing to do.
    pub fn do_nothing() -> Self {
        Self {
            action: Action::DoNothing,
            nodes_to_remove: Vec::new(),
            replacement_nodes: Vec::new(),
        }
    }

    /// Delete the given nodes without replacement.
    pub fn delete(nodes: Vec<CandidateNode>) -> Self {
        Self {
            action: Action::Delete,
            nodes_to_remove: nodes,
            replacement_nodes: Vec::new(),
        }
    }

    /// Replace the given nodes with the given launches.
    pub fn replace(nodes: Vec<CandidateNode>, replacements: Vec<SyntheticNode>) -> Self {
        Self {
            action: Action::Replace,
            nodes_to_remove: nodes,
            replacement_nodes: replacements,
        }
    }

    /// Whether this command has any effect.
    pub fn is_actionable(&self) -> bool {
        self.action != Action::DoNothing
    }

    /// Names of the nodes this command removes.
    pub fn node_names(&self) -> Vec<String> {
        self.nodes_to_remove.iter().map(|c| c.name()).collect()
    }
}

/// Everything a sub-reconciler needs for one pass. The PDB snapshot is
/// owned by the pass; candidates and commands never outlive it.
pub struct PassContext {
    /// Injectable clock
    pub clock: Arc<dyn Clock>,
    /// Live cluster-state cache (read-only during the pass)
    pub state: Arc<ClusterState>,
    /// Cloud-provider seam
    pub cloud: Arc<dyn CloudProvider>,
    /// External scheduler seam
    pub scheduler: Arc<dyn Scheduler>,
    /// PDB snapshot captured at pass start
    pub pdbs: PdbSnapshot,
}

/// A sub-reconciler: filters candidates, orders them, and computes a
/// command. Implementations must be side-effect free; only the
/// orchestrator mutates the cluster.
#[async_trait]
pub trait Deprovisioner: Send + Sync {
    /// Event reason emitted when this sub-reconciler's command executes.
    fn reason(&self, action: Action) -> &'static str;

    /// How the disruption gate treats this sub-reconciler's evictions.
    fn gate_policy(&self) -> GatePolicy {
        GatePolicy::default()
    }

    /// Whether already-cordoned nodes remain eligible.
    fn allows_unschedulable(&self) -> bool {
        false
    }

    /// Whether the candidate is eligible for this sub-reconciler at all.
    fn should_deprovision(&self, clock: &dyn Clock, candidate: &CandidateNode) -> bool;

    /// Compute a command over the eligible candidates. Returns a
    /// do-nothing command when no candidate yields a valid decision.
    async fn compute_command(
        &self,
        ctx: &PassContext,
        candidates: Vec<CandidateNode>,
    ) -> Result<Command>;

    /// Re-check a previously computed command against fresh state after
    /// the validation delay. Returns false when the command no longer
    /// holds; the orchestrator then discards it without side effects.
    async fn validate_command(
        &self,
        ctx: &PassContext,
        command: &Command,
        fresh_candidates: &[CandidateNode],
    ) -> Result<bool>;
}

/// Look up the fresh incarnation of a commanded node after the validation
/// delay. A missing entry means the node stopped being a candidate.
pub(crate) fn find_fresh<'a>(
    fresh_candidates: &'a [CandidateNode],
    name: &str,
) -> Option<&'a CandidateNode> {
    fresh_candidates.iter().find(|c| c.name() == name)
}
