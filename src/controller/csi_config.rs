//! CSI cluster configuration.
//!
//! The volume plugin reads one JSON array listing every known cluster and
//! its monitor endpoints. Each cluster's pass rewrites only its own entry,
//! so the read-modify-write of the shared payload runs under one lock.

use crate::domain::{CsiConfigStoreRef, MonInfo};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// One cluster's entry in the shared payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsiClusterConfigEntry {
    #[serde(rename = "clusterID")]
    pub cluster_id: String,
    pub monitors: Vec<String>,
}

/// Parse the shared payload; empty input reads as no clusters.
pub fn parse_csi_cluster_config(payload: &str) -> Result<Vec<CsiClusterConfigEntry>> {
    if payload.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(payload).map_err(|e| Error::CsiConfigParse(e.to_string()))
}

/// Replace (or append) the entry for `cluster_id` with the given monitors.
/// An empty monitor set removes the entry.
pub fn update_csi_cluster_config(
    current: &str,
    cluster_id: &str,
    monitors: &BTreeMap<String, MonInfo>,
) -> Result<String> {
    let mut entries = parse_csi_cluster_config(current)?;
    let endpoints: Vec<String> = monitors.values().map(|m| m.endpoint.clone()).collect();

    match entries.iter().position(|e| e.cluster_id == cluster_id) {
        Some(idx) if endpoints.is_empty() => {
            entries.remove(idx);
        }
        Some(idx) => entries[idx].monitors = endpoints,
        None if endpoints.is_empty() => {}
        None => entries.push(CsiClusterConfigEntry {
            cluster_id: cluster_id.to_string(),
            monitors: endpoints,
        }),
    }

    Ok(serde_json::to_string(&entries)?)
}

/// Serialized updates of the shared payload
pub struct CsiConfigUpdater {
    store: CsiConfigStoreRef,
    lock: Mutex<()>,
}

impl CsiConfigUpdater {
    pub fn new(store: CsiConfigStoreRef) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
        }
    }

    /// Write the cluster's current monitors; a no-op when unchanged
    pub async fn update(
        &self,
        cluster_id: &str,
        monitors: &BTreeMap<String, MonInfo>,
    ) -> Result<()> {
        let _guard = self.lock.lock().await;

        let current = self.store.load().await?;
        let updated = update_csi_cluster_config(&current, cluster_id, monitors)?;
        if parse_csi_cluster_config(&current)? == parse_csi_cluster_config(&updated)? {
            debug!(namespace = %cluster_id, "CSI cluster config unchanged");
            return Ok(());
        }

        self.store.save(updated).await?;
        info!(
            namespace = %cluster_id,
            "Updated CSI cluster config with {} monitors",
            monitors.len()
        );
        Ok(())
    }

    /// Drop the cluster's entry
    pub async fn remove(&self, cluster_id: &str) -> Result<()> {
        self.update(cluster_id, &BTreeMap::new()).await
    }
}
