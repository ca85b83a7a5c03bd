//! Finalizer guard on the StorageCluster resource.

use crate::controller::retry::{poll, PollError, RetryPolicy};
use crate::crd::StorageCluster;
use crate::domain::ClusterStoreRef;
use crate::error::{Error, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Finalizer name: `<plural>.<group>`
pub const FINALIZER: &str = "storageclusters.storage.billyronks.io";

/// Whether `latest` is still the object `cluster` was read from
fn same_object(cluster: &StorageCluster, latest: &StorageCluster) -> bool {
    match (cluster.metadata.uid.as_deref(), latest.metadata.uid.as_deref()) {
        (Some(ours), Some(theirs)) => ours == theirs,
        _ => true,
    }
}

fn holds_finalizer(cluster: &StorageCluster) -> bool {
    cluster
        .metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|f| f == FINALIZER))
}

pub struct FinalizerManager {
    store: ClusterStoreRef,
    removal_policy: RetryPolicy,
}

impl FinalizerManager {
    pub fn new(store: ClusterStoreRef, removal_policy: RetryPolicy) -> Self {
        Self {
            store,
            removal_policy,
        }
    }

    /// Add the guard to the latest revision of the resource. Returns false
    /// when it was already present. The write carries the revision it was
    /// computed from, so a concurrent change fails it instead of being lost.
    pub async fn add(&self, namespace: &str, name: &str) -> Result<bool> {
        let cluster = self.store.get(namespace, name).await?;
        if holds_finalizer(&cluster) {
            info!(namespace = %namespace, "Finalizer already set on cluster {}", name);
            return Ok(false);
        }

        let mut finalizers = cluster.metadata.finalizers.clone().unwrap_or_default();
        finalizers.push(FINALIZER.to_string());
        self.store
            .set_finalizers(
                namespace,
                name,
                finalizers,
                cluster.metadata.resource_version.as_deref(),
            )
            .await?;
        info!(namespace = %namespace, "Added finalizer to cluster {}", name);
        Ok(true)
    }

    /// Whether the stored object `cluster` refers to still carries the guard.
    /// Read failures other than not-found count as held.
    pub async fn is_held(&self, cluster: &StorageCluster) -> bool {
        match self.store.get(cluster.namespace_str(), cluster.name()).await {
            Ok(latest) => same_object(cluster, &latest) && holds_finalizer(&latest),
            Err(Error::ResourceNotFound { .. }) => false,
            Err(e) => {
                debug!(namespace = %cluster.namespace_str(), "Failed to read cluster: {}", e);
                true
            }
        }
    }

    /// Remove the guard, retrying a bounded number of times. Every attempt
    /// re-reads the resource and writes against that revision. Gives up
    /// with a warning rather than failing; returns whether it was removed.
    pub async fn remove(&self, cluster: &StorageCluster) -> bool {
        let namespace = cluster.namespace_str();
        let name = cluster.name();

        let never = CancellationToken::new();
        let result = poll(&self.removal_policy, "finalizer removal", &never, |_| async move {
            let latest = match self.store.get(namespace, name).await {
                Ok(latest) => latest,
                Err(Error::ResourceNotFound { .. }) => return Ok(false),
                Err(e) => return Err(backoff::Error::transient(e)),
            };
            if !same_object(cluster, &latest) || !holds_finalizer(&latest) {
                return Ok(false);
            }

            let remaining: Vec<String> = latest
                .metadata
                .finalizers
                .iter()
                .flatten()
                .filter(|f| f.as_str() != FINALIZER)
                .cloned()
                .collect();
            self.store
                .set_finalizers(
                    namespace,
                    name,
                    remaining,
                    latest.metadata.resource_version.as_deref(),
                )
                .await
                .map_err(backoff::Error::transient)?;
            Ok(true)
        })
        .await;

        match result {
            Ok(true) => {
                info!(
                    namespace = %namespace,
                    "Removed finalizer {} from cluster {}",
                    FINALIZER,
                    name
                );
                true
            }
            Ok(false) => {
                info!(
                    namespace = %namespace,
                    "Finalizer {} not found on cluster {}",
                    FINALIZER,
                    name
                );
                false
            }
            Err(PollError::Exhausted { last, .. } | PollError::TimedOut { last, .. }) => {
                warn!(
                    namespace = %namespace,
                    "Giving up removing finalizer {} from cluster {}: {}",
                    FINALIZER,
                    name,
                    last
                );
                false
            }
            Err(e) => {
                warn!(namespace = %namespace, "Finalizer removal stopped: {}", e);
                false
            }
        }
    }
}
