//! Kubernetes API seam for node and pod mutations.
//!
//! All cluster mutations the orchestrator performs (cordon, evict, delete)
//! flow through this trait so tests can substitute a recording fake and
//! production uses the real API server.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::api::{Api, DeleteParams, EvictParams, ListParams};
use kube::Client;

use crate::Result;

#[cfg(test)]
use mockall::automock;

/// API-server operations consumed by the orchestrator.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeApi: Send + Sync {
    /// Mark a node unschedulable.
    async fn cordon(&self, node: &str) -> Result<()>;

    /// Mark a node schedulable again.
    async fn uncordon(&self, node: &str) -> Result<()>;

    /// Evict a pod through the eviction subresource, honoring PDBs.
    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<()>;

    /// Delete a node object.
    async fn delete_node(&self, node: &str) -> Result<()>;

    /// Whether the node object still exists (it may linger behind
    /// finalizers after deletion).
    async fn node_exists(&self, node: &str) -> Result<bool>;

    /// Whether the node reports the Ready condition.
    async fn node_is_ready(&self, node: &str) -> Result<bool>;

    /// All PodDisruptionBudgets in the cluster, for the per-pass snapshot.
    async fn list_pdbs(&self) -> Result<Vec<PodDisruptionBudget>>;
}

/// Production implementation backed by a kube client.
pub struct KubeApiClient {
    client: Client,
}

impl KubeApiClient {
    /// Create a new API client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl KubeApi for KubeApiClient {
    async fn cordon(&self, node: &str) -> Result<()> {
        self.nodes().cordon(node).await?;
        Ok(())
    }

    async fn uncordon(&self, node: &str) -> Result<()> {
        self.nodes().uncordon(node).await?;
        Ok(())
    }

    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        pods.evict(name, &EvictParams::default()).await?;
        Ok(())
    }

    async fn delete_node(&self, node: &str) -> Result<()> {
        match self.nodes().delete(node, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            // Already gone is success for our purposes.
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn node_exists(&self, node: &str) -> Result<bool> {
        match self.nodes().get_opt(node).await? {
            Some(_) => Ok(true),
            None => Ok(false),
        }
    }

    async fn node_is_ready(&self, node: &str) -> Result<bool> {
        let Some(node) = self.nodes().get_opt(node).await? else {
            return Ok(false);
        };
        Ok(node
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .map(|conditions| {
                conditions
                    .iter()
                    .any(|c| c.type_ == "Ready" && c.status == "True")
            })
            .unwrap_or(false))
    }

    async fn list_pdbs(&self) -> Result<Vec<PodDisruptionBudget>> {
        let pdbs: Api<PodDisruptionBudget> = Api::all(self.client.clone());
        Ok(pdbs.list(&ListParams::default()).await?.items)
    }
}
