//! Pruner - cluster-node deprovisioning controller for autoscaled fleets
//!
//! Pruner continuously evaluates the worker nodes owned by `Provisioner`
//! objects and deletes or replaces those that are expired, empty, or
//! cost-suboptimal, while preserving the scheduling invariants of the
//! workloads running on them.
//!
//! # Architecture
//!
//! Every trigger runs one *process-cluster* pass:
//! - the candidate builder filters live nodes into candidates,
//! - sub-reconcilers (expiration, emptiness, single-node consolidation,
//!   multi-node consolidation) are consulted in fixed priority order,
//! - the first non-empty command is re-validated after a stabilization
//!   delay and then executed with ordered safety: cordon, launch
//!   replacements, wait for readiness, drain, delete.
//!
//! Decisions are checked against a scheduling simulation before any node
//! is touched: the pods of the nodes to be removed are treated as pending
//! and handed to the external scheduler together with the remaining
//! cluster inventory.
//!
//! # Modules
//!
//! - [`crd`] - The `Provisioner` custom resource and well-known label keys
//! - [`cloud`] - Cloud-provider seam: instance types, offerings, pricing
//! - [`state`] - In-memory cluster-state cache (nodes, pods, deletion marks)
//! - [`cost`] - Pod eviction cost and node disruption cost model
//! - [`candidates`] - Per-pass candidate construction and exclusion rules
//! - [`gate`] - Disruption gate: PDB accounting and do-not-evict handling
//! - [`simulation`] - Scheduling-simulator seam and removal simulation
//! - [`deprovisioning`] - Sub-reconcilers and the orchestrating controller
//! - [`api`] - Kubernetes API seam (cordon, evict, delete)
//! - [`clock`] - Injectable clock with a steppable fake for tests
//! - [`events`] - Kubernetes Event publishing
//! - [`retry`] - Backoff helper for eviction retries
//! - [`error`] - Error types for the controller

#![deny(missing_docs)]

pub mod api;
pub mod candidates;
pub mod clock;
pub mod cloud;
pub mod cost;
pub mod crd;
pub mod deprovisioning;
pub mod error;
pub mod events;
pub mod gate;
pub mod pods;
pub mod resources;
pub mod retry;
pub mod simulation;
pub mod state;

#[cfg(test)]
pub(crate) mod fixtures;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Delay between a command being computed and it being re-validated and
/// executed. Gives the cluster time to contradict the decision.
pub const DEFAULT_VALIDATION_DELAY: std::time::Duration = std::time::Duration::from_secs(30);

/// How long the orchestrator waits for launched replacement nodes to
/// become Ready before proceeding with the deletions anyway.
pub const DEFAULT_READINESS_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(300);
