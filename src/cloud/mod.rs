//! Cloud-provider seam: instance types, offerings, and node launches.
//!
//! The controller never talks to a cloud directly; it consumes this trait
//! for the instance-type catalog (with per-offering pricing used by the
//! consolidation decisions) and for launching replacement nodes.

pub mod fake;

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::{Deserialize, Serialize};

use crate::crd::Provisioner;
use crate::resources;
use crate::Result;

#[cfg(test)]
use mockall::automock;

/// A concrete purchase option of an instance type: capacity type and zone
/// at a price. `available` may flip between calls as cloud inventory
/// changes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Offering {
    /// Capacity type (`on-demand` or `spot`)
    pub capacity_type: String,
    /// Topology zone
    pub zone: String,
    /// Price per hour
    pub price: f64,
    /// Whether this offering can currently be launched
    pub available: bool,
}

/// An instance type with its offerings and resource capacity.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceType {
    /// Cloud-provider name of the type
    pub name: String,
    /// Purchase options for this type
    pub offerings: Vec<Offering>,
    /// Allocatable resources of a node of this type
    pub capacity: BTreeMap<String, Quantity>,
}

impl InstanceType {
    /// The minimum-price offering whose `available` flag is set.
    pub fn cheapest_offering(&self) -> Option<&Offering> {
        self.offerings
            .iter()
            .filter(|o| o.available)
            .min_by(|a, b| a.price.total_cmp(&b.price))
    }

    /// The offering for a specific capacity type and zone, regardless of
    /// availability. Used to price the offering a live node was launched
    /// with.
    pub fn offering_for(&self, capacity_type: &str, zone: &str) -> Option<&Offering> {
        self.offerings
            .iter()
            .find(|o| o.capacity_type == capacity_type && o.zone == zone)
    }

    /// CPU capacity used as the headroom tie-break between equal-priced
    /// replacements.
    pub fn cpu_capacity(&self) -> f64 {
        resources::get(Some(&self.capacity), resources::CPU)
    }
}

/// What the orchestrator asks the cloud provider to launch.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeDescriptor {
    /// Provisioner the new node will belong to
    pub provisioner: String,
    /// Instance type to launch
    pub instance_type: String,
    /// Capacity type of the chosen offering
    pub capacity_type: String,
    /// Zone of the chosen offering
    pub zone: String,
}

/// Identity of a node the cloud provider has created.
#[derive(Clone, Debug, PartialEq)]
pub struct CreatedNode {
    /// Node name the instance will register under
    pub name: String,
}

/// Cloud-provider operations consumed by the controller.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Launch a node matching the descriptor.
    async fn create(&self, descriptor: &NodeDescriptor) -> Result<CreatedNode>;

    /// The instance-type catalog available to a provisioner.
    async fn instance_types(&self, provisioner: &Provisioner) -> Result<Vec<InstanceType>>;
}

/// Provider that serves a fixed catalog and declines every launch.
///
/// The standalone binary wires this when no real cloud integration is
/// configured: the engine can still price decisions against the catalog
/// and perform delete-only deprovisioning, while any replace command
/// fails its launch step and rolls back safely.
pub struct StaticCloudProvider {
    catalog: Vec<InstanceType>,
}

impl StaticCloudProvider {
    /// Serve the given catalog.
    pub fn new(catalog: Vec<InstanceType>) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl CloudProvider for StaticCloudProvider {
    async fn create(&self, descriptor: &NodeDescriptor) -> Result<CreatedNode> {
        Err(crate::Error::cloud_provider(format!(
            "no cloud integration configured; cannot launch {}",
            descriptor.instance_type
        )))
    }

    async fn instance_types(&self, _provisioner: &Provisioner) -> Result<Vec<InstanceType>> {
        Ok(self.catalog.clone())
    }
}
