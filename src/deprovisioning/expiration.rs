//! Expiration sub-reconciler.
//!
//! Deletes or replaces nodes whose provisioner-configured lifetime has
//! elapsed, one candidate at a time, most-expired first. Expiration is
//! forced: an infeasible simulation or a do-not-evict pod produces a
//! warning, not a veto.

use async_trait::async_trait;
use tracing::{info, warn};

use super::{find_fresh, Command, Deprovisioner, PassContext};
use crate::candidates::CandidateNode;
use crate::clock::Clock;
use crate::events::reasons;
use crate::gate::{self, GatePolicy};
use crate::simulation::simulate;
use crate::{Error, Result};

/// Expires nodes past their `ttlSecondsUntilExpired`.
#[derive(Default)]
pub struct Expiration;

impl Expiration {
    fn sort_candidates(mut candidates: Vec<CandidateNode>) -> Vec<CandidateNode> {
        // Most expired first. Candidates without an expiration time cannot
        // be eligible; sort them last for safety.
        candidates.sort_by_key(|c| c.expiration_time().unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC));
        candidates
    }
}

#[async_trait]
impl Deprovisioner for Expiration {
    fn reason(&self, _action: super::Action) -> &'static str {
        reasons::EXPIRATION
    }

    fn gate_policy(&self) -> GatePolicy {
        GatePolicy {
            ignore_do_not_evict: true,
        }
    }

    fn allows_unschedulable(&self) -> bool {
        // An expired node must go even if something already cordoned it.
        true
    }

    fn should_deprovision(&self, clock: &dyn Clock, candidate: &CandidateNode) -> bool {
        candidate
            .expiration_time()
            .is_some_and(|expires| expires <= clock.now())
    }

    async fn compute_command(
        &self,
        ctx: &PassContext,
        candidates: Vec<CandidateNode>,
    ) -> Result<Command> {
        let policy = self.gate_policy();
        for candidate in Self::sort_candidates(candidates) {
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
                // The candidate started deleting under us; try the next.
                Err(Error::CandidateDeleting { .. }) => continue,
                Err(e) => return Err(e),
            };

            // Expiration is forced: infeasibility is logged, not obeyed.
            if let Err(e) = result.ensure_feasible() {
                warn!(
                    node = %candidate.name(),
                    error = %e,
                    "Continuing to expire node despite incomplete placement"
                );
            }
            info!(
                node = %candidate.name(),
                ttl_seconds = candidate.provisioner.spec.ttl_seconds_until_expired,
                "Triggering termination of expired node"
            );
            if result.new_nodes.is_empty() {
                return Ok(Command::delete(vec![candidate]));
            }
            return Ok(Command::replace(vec![candidate], result.new_nodes));
        }
        Ok(Command::do_nothing())
    }

    async fn validate_command(
        &self,
        ctx: &PassContext,
        command: &Command,
        fresh_candidates: &[CandidateNode],
    ) -> Result<bool> {
        // Expiration never un-expires; the command only dies if the node
        // stopped being a candidate or its gate closed.
        let policy = self.gate_policy();
        for name in command.node_names() {
            let Some(fresh) = find_fresh(fresh_candidates, &name) else {
                return Ok(false);
            };
            if !self.should_deprovision(ctx.clock.as_ref(), fresh)
                || !gate::can_be_terminated(fresh, &ctx.pdbs, &policy)
            {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
