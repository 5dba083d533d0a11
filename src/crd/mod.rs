//! Custom Resource Definitions and well-known object keys

mod provisioner;
mod types;

pub use provisioner::{Provisioner, ProvisionerSpec};
pub use types::{ConsolidationSpec, Requirement, RequirementOperator};

/// Well-known labels and annotations recognized by the controller.
pub mod keys {
    /// Node label naming the owning provisioner
    pub const PROVISIONER_NAME_LABEL: &str = "pruner.dev/provisioner-name";

    /// Node label set once the node has completed initialization
    pub const INITIALIZED_LABEL: &str = "pruner.dev/initialized";

    /// Node label carrying the capacity type of the backing offering
    pub const CAPACITY_TYPE_LABEL: &str = "pruner.dev/capacity-type";

    /// Node annotation excluding the node from consolidation (expiration
    /// still applies)
    pub const DO_NOT_CONSOLIDATE_ANNOTATION: &str = "pruner.dev/do-not-consolidate";

    /// Pod annotation forbidding eviction by this controller
    pub const DO_NOT_EVICT_ANNOTATION: &str = "pruner.dev/do-not-evict";

    /// Node annotation recording when emptiness was first observed
    /// (RFC 3339)
    pub const EMPTINESS_TIMESTAMP_ANNOTATION: &str = "pruner.dev/emptiness-timestamp";

    /// Upstream pod annotation that raises or lowers eviction cost
    pub const POD_DELETION_COST_ANNOTATION: &str = "controller.kubernetes.io/pod-deletion-cost";

    /// Standard node label naming the instance type
    pub const INSTANCE_TYPE_LABEL: &str = "node.kubernetes.io/instance-type";

    /// Standard node label naming the topology zone
    pub const ZONE_LABEL: &str = "topology.kubernetes.io/zone";

    /// Reserved (non-interruptible) capacity
    pub const CAPACITY_TYPE_ON_DEMAND: &str = "on-demand";

    /// Interruptible capacity
    pub const CAPACITY_TYPE_SPOT: &str = "spot";
}
