//! The deprovisioning orchestrator.
//!
//! One `process_cluster` pass walks Idle -> Planning -> Validating ->
//! Executing -> Idle. Sub-reconcilers are consulted in fixed priority
//! order and the first non-empty command wins the pass; commands from
//! different sub-reconcilers are never coalesced. The pass is
//! single-threaded per cluster; concurrent triggers must be serialized by
//! the caller.
//!
//! Execution is ordered for safety: cordon the doomed nodes (the visible
//! commit point), launch replacements, wait for them to report Ready,
//! drain, delete, and wait for the API server to confirm each deletion.
//! A partial replacement launch rolls the cordon back; instances that did
//! launch stay alive and are reclaimed by the emptiness sub-reconciler on
//! a later pass. Cancellation (dropping the pass future) after the cordon
//! leaves nodes cordoned for the next pass to reconcile.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::{info, warn};

use super::{
    Action, Command, Deprovisioner, Emptiness, Expiration, MultiNodeConsolidation, PassContext,
    SingleNodeConsolidation,
};
use crate::api::KubeApi;
use crate::candidates::{build_candidates, CandidateNode};
use crate::clock::Clock;
use crate::cloud::{CloudProvider, CreatedNode, NodeDescriptor};
use crate::events::{actions, reasons, EventPublisher};
use crate::gate::PdbSnapshot;
use crate::pods;
use crate::retry::{evict_with_retries, EvictionBackoff};
use crate::simulation::Scheduler;
use crate::state::ClusterState;
use crate::{Error, Result};

/// Poll interval while waiting for replacement readiness.
const READINESS_POLL: Duration = Duration::from_secs(2);
/// Poll interval while waiting for a deleted node object to disappear.
const DELETION_POLL: Duration = Duration::from_secs(1);

/// What a pass accomplished.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PassOutcome {
    /// Every sub-reconciler returned do-nothing
    NothingToDo,
    /// A command was computed but failed re-validation; no side effects
    Invalidated,
    /// A command executed to completion
    Executed {
        /// Event reason of the executed command
        reason: &'static str,
        /// Names of the removed nodes
        removed: Vec<String>,
        /// Number of replacement nodes launched
        launched: usize,
    },
}

/// Runs the deprovisioning pass over a cluster.
pub struct DeprovisioningController {
    clock: Arc<dyn Clock>,
    state: Arc<ClusterState>,
    cloud: Arc<dyn CloudProvider>,
    scheduler: Arc<dyn Scheduler>,
    api: Arc<dyn KubeApi>,
    events: Arc<dyn EventPublisher>,
    deprovisioners: Vec<Box<dyn Deprovisioner>>,
    validation_delay: Duration,
    readiness_timeout: Duration,
    eviction_backoff: EvictionBackoff,
}

fn node_ref(name: &str) -> ObjectReference {
    ObjectReference {
        api_version: Some("v1".into()),
        kind: Some("Node".into()),
        name: Some(name.into()),
        ..Default::default()
    }
}

impl DeprovisioningController {
    /// Create a controller with the standard sub-reconciler priority
    /// order: expiration, emptiness, single-node consolidation,
    /// multi-node consolidation.
    pub fn new(
        clock: Arc<dyn Clock>,
        state: Arc<ClusterState>,
        cloud: Arc<dyn CloudProvider>,
        scheduler: Arc<dyn Scheduler>,
        api: Arc<dyn KubeApi>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            clock,
            state,
            cloud,
            scheduler,
            api,
            events,
            deprovisioners: vec![
                Box::new(Expiration),
                Box::new(Emptiness),
                Box::new(SingleNodeConsolidation),
                Box::new(MultiNodeConsolidation),
            ],
            validation_delay: crate::DEFAULT_VALIDATION_DELAY,
            readiness_timeout: crate::DEFAULT_READINESS_TIMEOUT,
            eviction_backoff: EvictionBackoff::default(),
        }
    }

    /// Override the validation delay (tests use a short one alongside a
    /// fake clock).
    pub fn with_validation_delay(mut self, delay: Duration) -> Self {
        self.validation_delay = delay;
        self
    }

    /// Override the replacement readiness timeout.
    pub fn with_readiness_timeout(mut self, timeout: Duration) -> Self {
        self.readiness_timeout = timeout;
        self
    }

    async fn capture_context(&self) -> Result<(PassContext, Vec<CandidateNode>)> {
        let pdbs = PdbSnapshot::new(self.api.list_pdbs().await?);
        let mut provisioners = self.state.provisioners();
        provisioners.retain(|name, p| match p.spec.validate(name) {
            Ok(()) => true,
            Err(e) => {
                warn!(provisioner = %name, error = %e, "Ignoring misconfigured provisioner");
                false
            }
        });
        let candidates = build_candidates(
            self.clock.as_ref(),
            &self.state,
            &provisioners,
            &self.cloud,
        )
        .await?;
        let ctx = PassContext {
            clock: self.clock.clone(),
            state: self.state.clone(),
            cloud: self.cloud.clone(),
            scheduler: self.scheduler.clone(),
            pdbs,
        };
        Ok((ctx, candidates))
    }

    /// Run one deprovisioning pass.
    pub async fn process_cluster(&self) -> Result<PassOutcome> {
        let (ctx, candidates) = self.capture_context().await?;

        for deprovisioner in &self.deprovisioners {
            let eligible: Vec<CandidateNode> = candidates
                .iter()
                .filter(|c| deprovisioner.allows_unschedulable() || !c.is_unschedulable())
                .filter(|c| deprovisioner.should_deprovision(self.clock.as_ref(), c))
                .cloned()
                .collect();
            if eligible.is_empty() {
                continue;
            }

            let command = match deprovisioner.compute_command(&ctx, eligible).await {
                Ok(command) => command,
                Err(e) if e.is_candidate_local() => continue,
                Err(e) => return Err(e),
            };
            if !command.is_actionable() {
                continue;
            }

            let reason = deprovisioner.reason(command.action);
            info!(
                reason,
                nodes = ?command.node_names(),
                replacements = command.replacement_nodes.len(),
                "Waiting out the validation delay before executing"
            );
            self.clock.sleep(self.validation_delay).await;

            let (fresh_ctx, fresh_candidates) = self.capture_context().await?;
            let still_valid = deprovisioner
                .validate_command(&fresh_ctx, &command, &fresh_candidates)
                .await?;
            if !still_valid {
                info!(
                    reason,
                    nodes = ?command.node_names(),
                    "Discarding command: cluster state changed during the validation delay"
                );
                if let Some(name) = command.node_names().first() {
                    self.events
                        .publish(
                            &node_ref(name),
                            EventType::Warning,
                            reasons::VALIDATION_FAILED,
                            actions::DEPROVISION,
                            Some("deprovisioning command invalidated during stabilization".into()),
                        )
                        .await;
                }
                return Ok(PassOutcome::Invalidated);
            }

            return self.execute(deprovisioner.as_ref(), command).await;
        }
        Ok(PassOutcome::NothingToDo)
    }

    async fn execute(
        &self,
        deprovisioner: &dyn Deprovisioner,
        command: Command,
    ) -> Result<PassOutcome> {
        let names = command.node_names();
        let reason = deprovisioner.reason(command.action);

        // Commit point: the doomed nodes stop accepting pods.
        let mut cordoned: Vec<String> = Vec::with_capacity(names.len());
        for name in &names {
            if let Err(e) = self.api.cordon(name).await {
                self.rollback_cordon(&cordoned).await;
                return Err(e);
            }
            cordoned.push(name.clone());
        }
        self.state.mark_for_deletion(&names);

        let mut launched = 0;
        if command.action == Action::Replace {
            match self.launch_replacements(&command).await {
                Ok(created) => {
                    launched = created.len();
                    self.wait_for_readiness(&created).await;
                }
                Err(e) => {
                    // Roll back to schedulable. Instances that did launch
                    // stay alive; they join as empty nodes and are
                    // reclaimed by the emptiness sub-reconciler later.
                    self.rollback_cordon(&names).await;
                    self.state.unmark_for_deletion(&names);
                    if let Some(name) = names.first() {
                        self.events
                            .publish(
                                &node_ref(name),
                                EventType::Warning,
                                reasons::REPLACEMENT_LAUNCH_FAILED,
                                actions::DEPROVISION,
                                Some(e.to_string()),
                            )
                            .await;
                    }
                    return Err(e);
                }
            }
        }

        for candidate in &command.nodes_to_remove {
            self.drain(deprovisioner, candidate).await?;
            let name = candidate.name();
            self.api.delete_node(&name).await?;
            self.wait_for_deletion(&name).await?;
            self.events
                .publish(
                    &node_ref(&name),
                    EventType::Normal,
                    reason,
                    actions::DEPROVISION,
                    Some(format!("deprovisioned node {name}")),
                )
                .await;
        }

        info!(reason, nodes = ?names, launched, "Deprovisioning command complete");
        Ok(PassOutcome::Executed {
            reason,
            removed: names,
            launched,
        })
    }

    async fn rollback_cordon(&self, names: &[String]) {
        for name in names {
            if let Err(e) = self.api.uncordon(name).await {
                warn!(node = %name, error = %e, "Failed to uncordon during rollback");
            }
        }
    }

    async fn launch_replacements(&self, command: &Command) -> Result<Vec<CreatedNode>> {
        let mut created = Vec::new();
        let mut failures: Vec<String> = Vec::new();
        for synthetic in &command.replacement_nodes {
            let Some((instance_type, offering)) = synthetic.cheapest_option() else {
                failures.push("replacement has no launchable instance type".into());
                continue;
            };
            let descriptor = NodeDescriptor {
                provisioner: synthetic.provisioner.clone(),
                instance_type: instance_type.name.clone(),
                capacity_type: offering.capacity_type.clone(),
                zone: offering.zone.clone(),
            };
            match self.cloud.create(&descriptor).await {
                Ok(node) => {
                    info!(
                        node = %node.name,
                        instance_type = %descriptor.instance_type,
                        zone = %descriptor.zone,
                        "Launched replacement node"
                    );
                    created.push(node);
                }
                Err(e) => failures.push(e.to_string()),
            }
        }
        if !failures.is_empty() {
            return Err(Error::LaunchFailure {
                requested: command.replacement_nodes.len(),
                failed: failures.len(),
                message: failures.swap_remove(0),
            });
        }
        Ok(created)
    }

    /// Wait until every launched replacement reports Ready, bounded by the
    /// readiness timeout; on timeout the pass proceeds so the cluster is
    /// not wedged behind a slow node.
    async fn wait_for_readiness(&self, created: &[CreatedNode]) {
        let deadline = self.clock.now()
            + chrono::Duration::from_std(self.readiness_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));
        for node in created {
            loop {
                match self.api.node_is_ready(&node.name).await {
                    Ok(true) => break,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(node = %node.name, error = %e, "Readiness check failed; retrying")
                    }
                }
                if self.clock.now() >= deadline {
                    warn!(
                        node = %node.name,
                        "Timed out waiting for replacement readiness; proceeding"
                    );
                    break;
                }
                self.clock.sleep(READINESS_POLL).await;
            }
        }
    }

    /// Evict every reschedulable pod off the node. The disruption gate
    /// already admitted these evictions; a do-not-evict pod surfacing here
    /// (outside of forced expiration) is a bug and fails the command.
    async fn drain(
        &self,
        deprovisioner: &dyn Deprovisioner,
        candidate: &CandidateNode,
    ) -> Result<()> {
        let policy = deprovisioner.gate_policy();
        let node_name = candidate.name();
        for pod in candidate.reschedulable_pods() {
            if pods::is_do_not_evict(pod) && !policy.ignore_do_not_evict {
                return Err(Error::drain_failure(
                    &node_name,
                    format!(
                        "pod {} carries do-not-evict; the gate should have rejected this node",
                        pods::qualified_name(pod)
                    ),
                ));
            }
            let namespace = pod.namespace().unwrap_or_default();
            let name = pod.name_any();
            evict_with_retries(&self.eviction_backoff, &pods::qualified_name(pod), || {
                self.api.evict_pod(&namespace, &name)
            })
            .await
            .map_err(|e| {
                Error::drain_failure(&node_name, format!("evicting pod {namespace}/{name}: {e}"))
            })?;
        }
        Ok(())
    }

    /// Block until the API server confirms the node object is gone. A
    /// finalizer may hold the object indefinitely; the wait only ends when
    /// whoever owns the finalizer removes it.
    async fn wait_for_deletion(&self, name: &str) -> Result<()> {
        loop {
            if !self.api.node_exists(name).await? {
                self.state.delete_node(name);
                return Ok(());
            }
            self.clock.sleep(DELETION_POLL).await;
        }
    }
}
