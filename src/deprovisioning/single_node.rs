//! Single-node consolidation sub-reconciler.
//!
//! Considers one candidate at a time, least disruptive first. A candidate
//! whose pods fit on the remaining cluster is deleted outright; one whose
//! pods need new capacity is replaced only when the replacement is
//! strictly cheaper under both the aggregate and the per-capacity-type
//! price rules.

use async_trait::async_trait;
use tracing::{debug, info};

use super::consolidation::{capacity_rules_allow, replacement_is_cheaper};
use super::{find_fresh, Command, Deprovisioner, PassContext};
use crate::candidates::CandidateNode;
use crate::clock::Clock;
use crate::events::reasons;
use crate::gate;
use crate::simulation::simulate;
use crate::{Error, Result};

/// Deletes or replaces one cost-suboptimal node per pass.
#[derive(Default)]
pub struct SingleNodeConsolidation;

fn sort_by_disruption_cost(mut candidates: Vec<CandidateNode>) -> Vec<CandidateNode> {
    candidates.sort_by(|a, b| a.disruption_cost.total_cmp(&b.disruption_cost));
    candidates
}

pub(super) fn consolidatable(candidate: &CandidateNode) -> bool {
    candidate.provisioner.spec.consolidation_enabled() && !candidate.is_do_not_consolidate()
}

#[async_trait]
impl Deprovisioner for SingleNodeConsolidation {
    fn reason(&self, action: super::Action) -> &'static str {
        match action {
            super::Action::Replace => reasons::CONSOLIDATION_REPLACE,
            _ => reasons::CONSOLIDATION_DELETE,
        }
    }

    fn should_deprovision(&self, _clock: &dyn Clock, candidate: &CandidateNode) -> bool {
        consolidatable(candidate)
    }

    async fn compute_command(
        &self,
        ctx: &PassContext,
        candidates: Vec<CandidateNode>,
    ) -> Result<Command> {
        let policy = self.gate_policy();
        for candidate in sort_by_disruption_cost(candidates) {
            if !gate::can_be_terminated(&candidate, &ctx.pdbs, &policy) {
                continue;
            }

            let result = match simulate(
                &ctx.scheduler,
                &ctx.state,
                &ctx.cloud,
                std::slice::from_ref(&candidate),
            )
            .await
            {
                Ok(result) => result,
                Err(Error::CandidateDeleting { .. }) => continue,
                Err(e) => return Err(e),
            };

            if let Err(e) = result.ensure_feasible() {
                debug!(node = %candidate.name(), error = %e, "Skipping candidate");
                continue;
            }

            if result.new_nodes.is_empty() {
                info!(
                    node = %candidate.name(),
                    "Consolidating node: pods fit on remaining capacity"
                );
                return Ok(Command::delete(vec![candidate]));
            }

            let removed = std::slice::from_ref(&candidate);
            if replacement_is_cheaper(removed, &result.new_nodes)
                && capacity_rules_allow(&candidate, &result.new_nodes)
            {
                info!(
                    node = %candidate.name(),
                    current_price = candidate.current_price(),
                    "Consolidating node: replacing with cheaper capacity"
                );
                return Ok(Command::replace(vec![candidate], result.new_nodes));
            }
        }
        Ok(Command::do_nothing())
    }

    async fn validate_command(
        &self,
        ctx: &PassContext,
        command: &Command,
        fresh_candidates: &[CandidateNode],
    ) -> Result<bool> {
        let [name] = command.node_names().try_into().map_err(|_| {
            Error::validation_failure("single-node command must target exactly one node")
        })?;
        let Some(fresh) = find_fresh(fresh_candidates, &name) else {
            return Ok(false);
        };
        if !self.should_deprovision(ctx.clock.as_ref(), fresh)
            || !gate::can_be_terminated(fresh, &ctx.pdbs, &self.gate_policy())
        {
            return Ok(false);
        }

        // Re-simulate against fresh state: pending pods may have landed,
        // offerings may have flipped.
        let result = match simulate(
            &ctx.scheduler,
            &ctx.state,
            &ctx.cloud,
            std::slice::from_ref(fresh),
        )
        .await
        {
            Ok(result) => result,
            Err(Error::CandidateDeleting { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };
        if result.ensure_feasible().is_err() {
            return Ok(false);
        }
        match command.action {
            super::Action::Delete => Ok(result.new_nodes.is_empty()),
            super::Action::Replace => Ok(!result.new_nodes.is_empty()
                && replacement_is_cheaper(std::slice::from_ref(fresh), &result.new_nodes)
                && capacity_rules_allow(fresh, &result.new_nodes)),
            super::Action::DoNothing => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::keys;
    use crate::fixtures::{candidate, consolidating_candidate};

    #[test]
    fn only_consolidation_enabled_provisioners_are_eligible() {
        let clock = crate::clock::FakeClock::default();
        let plain = candidate("n1", "default", "small", 0.5, vec![]);
        assert!(!SingleNodeConsolidation.should_deprovision(&clock, &plain));

        let enabled = consolidating_candidate("n2", "small", 0.5, vec![]);
        assert!(SingleNodeConsolidation.should_deprovision(&clock, &enabled));
    }

    #[test]
    fn do_not_consolidate_annotation_excludes() {
        let clock = crate::clock::FakeClock::default();
        let mut c = consolidating_candidate("n1", "small", 0.5, vec![]);
        c.node
            .metadata
            .annotations
            .get_or_insert_default()
            .insert(keys::DO_NOT_CONSOLIDATE_ANNOTATION.to_string(), "true".to_string());
        assert!(!SingleNodeConsolidation.should_deprovision(&clock, &c));
    }

    #[test]
    fn least_disruptive_candidate_is_tried_first() {
        let mut cheap = consolidating_candidate("cheap", "small", 0.5, vec![]);
        cheap.disruption_cost = 1.0;
        let mut costly = consolidating_candidate("costly", "small", 0.5, vec![]);
        costly.disruption_cost = 3.0;

        let sorted = sort_by_disruption_cost(vec![costly, cheap]);
        assert_eq!(sorted[0].name(), "cheap");
    }
}
