//! Error types for the deprovisioning controller
//!
//! Errors are structured with fields to aid debugging in production. Each
//! variant corresponds to a distinct failure kind with its own propagation
//! policy: some are local to a candidate and merely skip it, some discard
//! the in-flight command, and some surface to the trigger loop.

use thiserror::Error;

/// Main error type for deprovisioning operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A candidate node transitioned to marked-for-deletion mid-pass.
    /// Local: the sub-reconciler skips the candidate and continues.
    #[error("candidate node {node} is deleting")]
    CandidateDeleting {
        /// Name of the node that started deleting
        node: String,
    },

    /// The scheduling simulation could not place every pod. Local except in
    /// expiration, which proceeds with a warning.
    #[error("simulation infeasible: {unschedulable} pod(s) cannot be placed")]
    SimulationInfeasible {
        /// Number of pods the simulated scheduler could not place
        unschedulable: usize,
    },

    /// The cloud provider rejected a replacement launch. Triggers rollback
    /// of the cordon and surfaces to the trigger loop.
    #[error("launch failure: {failed} of {requested} replacement(s) failed: {message}")]
    LaunchFailure {
        /// How many launches were requested
        requested: usize,
        /// How many launches failed
        failed: usize,
        /// First underlying launch error
        message: String,
    },

    /// A pod eviction was denied after the disruption gate had passed.
    /// Fatal for the in-flight command; cordoned nodes remain cordoned.
    #[error("drain failure on node {node}: {message}")]
    DrainFailure {
        /// Node being drained
        node: String,
        /// Description of the eviction failure
        message: String,
    },

    /// Cluster state changed during the validation delay; the command is
    /// discarded without side effects.
    #[error("validation failure: {message}")]
    ValidationFailure {
        /// What changed under the command
        message: String,
    },

    /// The disruption gate forbids terminating a node. Local: the
    /// candidate is skipped.
    #[error("gate failure for node {node}: {message}")]
    GateFailure {
        /// Node that may not be terminated
        node: String,
        /// Which rule forbids the termination
        message: String,
    },

    /// Cloud-provider error outside of replacement launches
    #[error("cloud provider error: {message}")]
    CloudProvider {
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Invalid Provisioner configuration
    #[error("validation error for provisioner {provisioner}: {message}")]
    InvalidProvisioner {
        /// Name of the misconfigured provisioner
        provisioner: String,
        /// Description of what's invalid
        message: String,
    },
}

impl Error {
    /// Create a candidate-deleting error for the given node
    pub fn candidate_deleting(node: impl Into<String>) -> Self {
        Self::CandidateDeleting { node: node.into() }
    }

    /// Create a drain-failure error for the given node
    pub fn drain_failure(node: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::DrainFailure {
            node: node.into(),
            message: msg.into(),
        }
    }

    /// Create a validation-failure error with the given message
    pub fn validation_failure(msg: impl Into<String>) -> Self {
        Self::ValidationFailure {
            message: msg.into(),
        }
    }

    /// Create a gate-failure error for the given node
    pub fn gate_failure(node: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::GateFailure {
            node: node.into(),
            message: msg.into(),
        }
    }

    /// Create a cloud-provider error with the given message
    pub fn cloud_provider(msg: impl Into<String>) -> Self {
        Self::CloudProvider {
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an invalid-provisioner error
    pub fn invalid_provisioner(provisioner: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidProvisioner {
            provisioner: provisioner.into(),
            message: msg.into(),
        }
    }

    /// Whether this error is local to a single candidate.
    ///
    /// Local errors skip the candidate and let the pass continue; they are
    /// never surfaced to the trigger loop.
    pub fn is_candidate_local(&self) -> bool {
        matches!(
            self,
            Error::CandidateDeleting { .. }
                | Error::GateFailure { .. }
                | Error::SimulationInfeasible { .. }
        )
    }

    /// Whether the trigger loop should retry after backoff.
    ///
    /// Launch and drain failures are transient: the next pass re-evaluates
    /// the cluster from scratch. Configuration errors are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // 4xx means the request itself is wrong and a retry cannot
                // fix it, with one exception: the eviction subresource
                // answers 429 when a PodDisruptionBudget cannot currently
                // be disrupted, which clears once replacement pods are up.
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 429
                )
            }
            Error::CandidateDeleting { .. } => true,
            Error::SimulationInfeasible { .. } => true,
            Error::LaunchFailure { .. } => true,
            Error::DrainFailure { .. } => true,
            Error::ValidationFailure { .. } => true,
            Error::GateFailure { .. } => true,
            Error::CloudProvider { .. } => true,
            Error::Serialization { .. } => false,
            Error::InvalidProvisioner { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: candidate-local errors never abort a pass
    ///
    /// When a candidate starts deleting mid-pass or its PDBs forbid
    /// termination, the sub-reconciler moves on to the next candidate
    /// instead of failing the whole pass.
    #[test]
    fn story_candidate_local_errors_skip_and_continue() {
        assert!(Error::candidate_deleting("node-1").is_candidate_local());
        assert!(Error::gate_failure("node-1", "pdb exhausted").is_candidate_local());
        assert!(Error::SimulationInfeasible { unschedulable: 2 }.is_candidate_local());

        // Execution failures are not candidate-local: they abort the command.
        assert!(!Error::LaunchFailure {
            requested: 3,
            failed: 1,
            message: "create call budget exceeded".into(),
        }
        .is_candidate_local());
        assert!(!Error::drain_failure("node-1", "eviction denied").is_candidate_local());
    }

    /// Story: the trigger loop retries transient failures
    ///
    /// A partial replacement launch rolls back and is retried on the next
    /// pass; a misconfigured provisioner is not retried until the user
    /// fixes it.
    #[test]
    fn story_transience_drives_trigger_loop_backoff() {
        let err = Error::LaunchFailure {
            requested: 2,
            failed: 2,
            message: "instance capacity exhausted".into(),
        };
        assert!(err.is_transient());
        assert!(Error::drain_failure("n", "timed out").is_transient());
        assert!(Error::validation_failure("node no longer empty").is_transient());

        assert!(!Error::invalid_provisioner("default", "negative TTL").is_transient());
        assert!(!Error::serialization("bad emptiness timestamp").is_transient());
    }

    /// Story: PDB backpressure on the eviction subresource is retryable
    ///
    /// The API server answers 429 while a disruption budget cannot be
    /// disrupted; the drain must keep retrying that, while other 4xx
    /// answers stay final.
    #[test]
    fn story_eviction_backpressure_is_transient() {
        let backpressure = Error::from(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".into(),
            message: "Cannot evict pod as it would violate the pod's disruption budget.".into(),
            reason: "TooManyRequests".into(),
            code: 429,
        }));
        assert!(backpressure.is_transient());

        let gone = Error::from(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".into(),
            message: "pods \"web-0\" not found".into(),
            reason: "NotFound".into(),
            code: 404,
        }));
        assert!(!gone.is_transient());
    }

    #[test]
    fn test_error_messages_carry_context() {
        let err = Error::candidate_deleting("ip-10-0-0-1");
        assert!(err.to_string().contains("ip-10-0-0-1"));

        let err = Error::drain_failure("ip-10-0-0-2", "pod guarded by do-not-evict");
        assert!(err.to_string().contains("ip-10-0-0-2"));
        assert!(err.to_string().contains("do-not-evict"));

        let err = Error::LaunchFailure {
            requested: 3,
            failed: 1,
            message: "zone exhausted".into(),
        };
        assert!(err.to_string().contains("1 of 3"));
    }
}
