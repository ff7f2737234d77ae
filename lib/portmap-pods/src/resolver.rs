//! Pod resolution against the orchestrator inventory

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::{Api, Client};
use portmap_core::{CoreError, Result};
use tracing::debug;

use crate::pod::PodInfo;

/// Which pods the gateway considers at all.
#[derive(Clone, Debug)]
pub struct PodSelector {
    pub namespace: String,
    pub label_selector: String,
}

impl Default for PodSelector {
    fn default() -> Self {
        Self {
            namespace: "jhub".to_string(),
            label_selector: "component=singleuser-server".to_string(),
        }
    }
}

/// Live-pod lookup seam consumed by the proxy router and the mapping
/// API. Returned snapshots are request-scoped; never cache them.
#[async_trait]
pub trait PodResolver: Send + Sync {
    /// All live pods belonging to an owner. An inventory-query failure
    /// is `PodInventory`, never an empty list.
    async fn list_pods(&self, owner_key: &str) -> Result<Vec<PodInfo>>;

    /// The owner's pod matching the identifier against the FULL
    /// candidate list, so mappings created under an older identifier
    /// scheme keep resolving.
    async fn find_pod(&self, owner_key: &str, pod_identifier: &str) -> Result<Option<PodInfo>> {
        let pods = self.list_pods(owner_key).await?;
        Ok(pods.into_iter().find(|p| p.matches_identifier(pod_identifier)))
    }
}

/// Kubernetes-backed resolver: one namespaced label-selector list per
/// call, filtered down to the requesting owner.
pub struct KubePodResolver {
    client: Client,
    selector: PodSelector,
}

impl KubePodResolver {
    pub async fn new(selector: PodSelector) -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| CoreError::PodInventory(e.to_string()))?;
        Ok(Self { client, selector })
    }

    pub fn with_client(client: Client, selector: PodSelector) -> Self {
        Self { client, selector }
    }

    async fn fetch_pods(&self) -> Result<Vec<Pod>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.selector.namespace);
        let params = ListParams::default().labels(&self.selector.label_selector);
        let list = pods
            .list(&params)
            .await
            .map_err(|e| CoreError::PodInventory(e.to_string()))?;
        debug!(
            "Listed {} pods in {} matching {}",
            list.items.len(),
            self.selector.namespace,
            self.selector.label_selector
        );
        Ok(list.items)
    }
}

#[async_trait]
impl PodResolver for KubePodResolver {
    async fn list_pods(&self, owner_key: &str) -> Result<Vec<PodInfo>> {
        let pods = self.fetch_pods().await?;
        Ok(pods
            .iter()
            .map(PodInfo::from_pod)
            .filter(|info| info.owner_key == owner_key)
            .collect())
    }
}
