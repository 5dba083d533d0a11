//! Multi-node consolidation sub-reconciler.
//!
//! Looks for a set of nodes whose combined replacement is strictly
//! cheaper than the sum removed. Candidates are ordered by ascending
//! disruption cost and evaluated as prefixes: the full set is tried
//! first (aggregate merges are often only profitable whole), then the
//! largest workable smaller prefix is found by binary search.

use async_trait::async_trait;
use tracing::{debug, info};

use super::consolidation::{filter_same_type, replacement_is_cheaper};
use super::single_node::consolidatable;
use super::{find_fresh, Action, Command, Deprovisioner, PassContext};
use crate::candidates::CandidateNode;
use crate::clock::Clock;
use crate::events::reasons;
use crate::gate;
use crate::simulation::simulate;
use crate::{Error, Result};

/// Consolidates several nodes at once when the aggregate is cheaper.
#[derive(Default)]
pub struct MultiNodeConsolidation;

impl MultiNodeConsolidation {
    /// Evaluate removing the first `k` candidates. Returns a command when
    /// the prefix is feasible and strictly cheaper, `None` otherwise.
    async fn try_prefix(
        &self,
        ctx: &PassContext,
        sorted: &[CandidateNode],
        k: usize,
    ) -> Result<Option<Command>> {
        let prefix = &sorted[..k];
        if !gate::can_terminate_all(prefix, &ctx.pdbs, &self.gate_policy()) {
            return Ok(None);
        }

        let result = match simulate(&ctx.scheduler, &ctx.state, &ctx.cloud, prefix).await {
            Ok(result) => result,
            Err(Error::CandidateDeleting { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        if let Err(e) = result.ensure_feasible() {
            debug!(prefix = k, error = %e, "Prefix invalid: incomplete placement");
            return Ok(None);
        }

        if result.new_nodes.is_empty() {
            return Ok(Some(Command::delete(prefix.to_vec())));
        }

        // A replacement that merely relaunches a removed type is a
        // degenerate no-op; losing all options invalidates the prefix.
        let Some(new_nodes) = filter_same_type(result.new_nodes, prefix) else {
            debug!(
                prefix = k,
                "Prefix invalid: replacement collapses to a same-type relaunch"
            );
            return Ok(None);
        };

        if new_nodes.is_empty() {
            return Ok(Some(Command::delete(prefix.to_vec())));
        }
        if replacement_is_cheaper(prefix, &new_nodes) {
            return Ok(Some(Command::replace(prefix.to_vec(), new_nodes)));
        }
        Ok(None)
    }
}

#[async_trait]
impl Deprovisioner for MultiNodeConsolidation {
    fn reason(&self, action: Action) -> &'static str {
        match action {
            Action::Replace => reasons::CONSOLIDATION_REPLACE,
            _ => reasons::CONSOLIDATION_DELETE,
        }
    }

    fn should_deprovision(&self, _clock: &dyn Clock, candidate: &CandidateNode) -> bool {
        consolidatable(candidate)
    }

    async fn compute_command(
        &self,
        ctx: &PassContext,
        mut candidates: Vec<CandidateNode>,
    ) -> Result<Command> {
        // A gate-blocked candidate must not sit at the front of the sort
        // and block every prefix behind it.
        candidates.retain(|c| gate::can_be_terminated(c, &ctx.pdbs, &self.gate_policy()));
        candidates.sort_by(|a, b| a.disruption_cost.total_cmp(&b.disruption_cost));
        let n = candidates.len();
        if n < 2 {
            // A single node is single-node consolidation's business, and
            // it has already declined this pass.
            return Ok(Command::do_nothing());
        }

        // Whole-set merges are frequently profitable where no sub-prefix
        // is, so the full set gets the first look.
        if let Some(command) = self.try_prefix(ctx, &candidates, n).await? {
            info!(nodes = n, "Multi-node consolidation over the full candidate set");
            return Ok(command);
        }

        // Largest workable smaller prefix.
        let mut best = None;
        let (mut lo, mut hi) = (1usize, n - 1);
        while lo <= hi {
            let mid = lo + (hi - lo) / 2;
            match self.try_prefix(ctx, &candidates, mid).await? {
                Some(command) => {
                    best = Some(command);
                    lo = mid + 1;
                }
                None => hi = mid - 1,
            }
        }
        match best {
            Some(command) => {
                info!(
                    nodes = command.nodes_to_remove.len(),
                    replacements = command.replacement_nodes.len(),
                    "Multi-node consolidation found a cheaper prefix"
                );
                Ok(command)
            }
            None => Ok(Command::do_nothing()),
        }
    }

    async fn validate_command(
        &self,
        ctx: &PassContext,
        command: &Command,
        fresh_candidates: &[CandidateNode],
    ) -> Result<bool> {
        let mut fresh_set = Vec::with_capacity(command.nodes_to_remove.len());
        for name in command.node_names() {
            let Some(fresh) = find_fresh(fresh_candidates, &name) else {
                return Ok(false);
            };
            if !self.should_deprovision(ctx.clock.as_ref(), fresh) {
                return Ok(false);
            }
            fresh_set.push(fresh.clone());
        }
        if !gate::can_terminate_all(&fresh_set, &ctx.pdbs, &self.gate_policy()) {
            return Ok(false);
        }

        let result = match simulate(&ctx.scheduler, &ctx.state, &ctx.cloud, &fresh_set).await {
            Ok(result) => result,
            Err(Error::CandidateDeleting { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };
        if result.ensure_feasible().is_err() {
            return Ok(false);
        }
        match command.action {
            Action::Delete => Ok(result.new_nodes.is_empty()),
            Action::Replace => {
                let Some(new_nodes) = filter_same_type(result.new_nodes, &fresh_set) else {
                    return Ok(false);
                };
                Ok(!new_nodes.is_empty() && replacement_is_cheaper(&fresh_set, &new_nodes))
            }
            Action::DoNothing => Ok(false),
        }
    }
}
