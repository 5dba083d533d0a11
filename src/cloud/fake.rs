//! In-memory cloud provider for tests and local runs.
//!
//! Records every create call, enforces an externally imposed create-call
//! budget, and serves a settable instance-type catalog. All calls are
//! silently successful until the budget is exhausted.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{CloudProvider, CreatedNode, InstanceType, NodeDescriptor};
use crate::crd::Provisioner;
use crate::{Error, Result};

/// Fake cloud provider with a recording create path.
pub struct FakeCloudProvider {
    catalog: Mutex<Vec<InstanceType>>,
    create_calls: Mutex<Vec<NodeDescriptor>>,
    allowed_create_calls: AtomicUsize,
    next_id: AtomicU64,
}

impl FakeCloudProvider {
    /// Create a fake provider serving the given catalog with an unlimited
    /// create budget.
    pub fn new(catalog: Vec<InstanceType>) -> Self {
        Self {
            catalog: Mutex::new(catalog),
            create_calls: Mutex::new(Vec::new()),
            allowed_create_calls: AtomicUsize::new(usize::MAX),
            next_id: AtomicU64::new(0),
        }
    }

    /// Replace the instance-type catalog.
    pub fn set_catalog(&self, catalog: Vec<InstanceType>) {
        *self.catalog.lock().unwrap() = catalog;
    }

    /// Cap the number of create calls that will succeed.
    pub fn set_allowed_create_calls(&self, allowed: usize) {
        self.allowed_create_calls.store(allowed, Ordering::SeqCst);
    }

    /// Every create call seen so far, including ones that failed the
    /// budget.
    pub fn create_calls(&self) -> Vec<NodeDescriptor> {
        self.create_calls.lock().unwrap().clone()
    }

    /// Forget recorded create calls.
    pub fn reset(&self) {
        self.create_calls.lock().unwrap().clear();
        self.next_id.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl CloudProvider for FakeCloudProvider {
    async fn create(&self, descriptor: &NodeDescriptor) -> Result<CreatedNode> {
        let calls = {
            let mut calls = self.create_calls.lock().unwrap();
            calls.push(descriptor.clone());
            calls.len()
        };
        if calls > self.allowed_create_calls.load(Ordering::SeqCst) {
            return Err(Error::cloud_provider("create call budget exceeded"));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(CreatedNode {
            name: format!("{}-{}", descriptor.instance_type, id),
        })
    }

    async fn instance_types(&self, _provisioner: &Provisioner) -> Result<Vec<InstanceType>> {
        Ok(self.catalog.lock().unwrap().clone())
    }
}
