//! Empty-node sub-reconciler.
//!
//! Deletes nodes with zero non-daemon pods. Provisioners using
//! `ttlSecondsAfterEmpty` additionally require the emptiness-timestamp
//! annotation to be at least that old, so briefly idle nodes survive a
//! quiescence window. Consolidation-enabled provisioners get their empty
//! nodes deleted without a quiescence wait.

use async_trait::async_trait;
use chrono::DateTime;
use kube::ResourceExt;
use tracing::{debug, info};

use super::{find_fresh, Command, Deprovisioner, PassContext};
use crate::candidates::CandidateNode;
use crate::clock::Clock;
use crate::crd::keys;
use crate::events::reasons;
use crate::Result;

/// Deletes empty nodes, honoring the per-provisioner quiescence TTL.
#[derive(Default)]
pub struct Emptiness;

impl Emptiness {
    /// Whether the emptiness-timestamp annotation is old enough under the
    /// provisioner's quiescence TTL.
    fn emptiness_aged(clock: &dyn Clock, candidate: &CandidateNode) -> bool {
        let Some(ttl) = candidate.provisioner.spec.empty_ttl() else {
            return true;
        };
        let Some(raw) = candidate
            .node
            .annotations()
            .get(keys::EMPTINESS_TIMESTAMP_ANNOTATION)
        else {
            // Emptiness has not been observed long enough to be stamped.
            return false;
        };
        match DateTime::parse_from_rfc3339(raw) {
            Ok(since) => clock.now() - since.with_timezone(&chrono::Utc) >= ttl,
            Err(e) => {
                debug!(
                    node = %candidate.name(),
                    value = %raw,
                    error = %e,
                    "Ignoring unparseable emptiness timestamp"
                );
                false
            }
        }
    }
}

#[async_trait]
impl Deprovisioner for Emptiness {
    fn reason(&self, _action: super::Action) -> &'static str {
        reasons::EMPTY_NODE_DELETE
    }

    fn should_deprovision(&self, clock: &dyn Clock, candidate: &CandidateNode) -> bool {
        let spec = &candidate.provisioner.spec;
        if !spec.consolidation_enabled() && spec.empty_ttl().is_none() {
            return false;
        }
        candidate.is_empty() && Self::emptiness_aged(clock, candidate)
    }

    async fn compute_command(
        &self,
        _ctx: &PassContext,
        candidates: Vec<CandidateNode>,
    ) -> Result<Command> {
        if candidates.is_empty() {
            return Ok(Command::do_nothing());
        }
        info!(
            nodes = ?candidates.iter().map(CandidateNode::name).collect::<Vec<_>>(),
            "Deleting empty nodes"
        );
        // Empty nodes host nothing reschedulable, so no simulation and
        // never a replacement.
        Ok(Command::delete(candidates))
    }

    async fn validate_command(
        &self,
        ctx: &PassContext,
        command: &Command,
        fresh_candidates: &[CandidateNode],
    ) -> Result<bool> {
        // A pod landing on any commanded node during the delay invalidates
        // the whole command.
        for name in command.node_names() {
            let Some(fresh) = find_fresh(fresh_candidates, &name) else {
                return Ok(false);
            };
            if !self.should_deprovision(ctx.clock.as_ref(), fresh) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
