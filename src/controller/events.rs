//! Controller Events
//!
//! Every watched source produces one tagged [`ClusterEvent`]; the router
//! matches on the tag instead of inspecting payload types.

use crate::crd::{StorageCluster, StorageClusterSpec};
use crate::domain::{device_lists_equal, DEVICES_DATA_KEY};
use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::{ConfigMap, Node};

/// Label on discovery config maps naming the node they describe
pub const DISCOVERY_NODE_LABEL: &str = "storage.billyronks.io/node";

/// Change of one watched object
#[derive(Debug, Clone)]
pub enum ResourceChange<K> {
    Added(K),
    Updated { old: K, new: K },
    Deleted(K),
}

impl<K> ResourceChange<K> {
    pub fn action(&self) -> &'static str {
        match self {
            ResourceChange::Added(_) => "added",
            ResourceChange::Updated { .. } => "updated",
            ResourceChange::Deleted(_) => "deleted",
        }
    }
}

/// Event delivered to the router
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    /// StorageCluster resource changed
    Cluster(ResourceChange<StorageCluster>),
    /// Node changed
    Node(ResourceChange<Node>),
    /// Device inventory config map changed
    Devices(ResourceChange<ConfigMap>),
}

impl ClusterEvent {
    pub fn source(&self) -> &'static str {
        match self {
            ClusterEvent::Cluster(_) => "cluster",
            ClusterEvent::Node(_) => "node",
            ClusterEvent::Devices(_) => "devices",
        }
    }
}

// =============================================================================
// Relevance Filters
// =============================================================================

/// Whether a resource update changes anything worth reconciling.
///
/// Storage node lists are compared order-insensitively.
pub fn spec_changed(old: &StorageClusterSpec, new: &StorageClusterSpec) -> bool {
    old.normalized() != new.normalized()
}

/// Serialized device list carried by a discovery config map
pub fn device_inventory(config_map: &ConfigMap) -> Option<&str> {
    config_map
        .data
        .as_ref()
        .and_then(|d| d.get(DEVICES_DATA_KEY))
        .map(String::as_str)
}

/// Node a discovery config map describes
pub fn device_node_name(config_map: &ConfigMap) -> String {
    config_map
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(DISCOVERY_NODE_LABEL).cloned())
        .or_else(|| config_map.metadata.name.clone())
        .unwrap_or_default()
}

/// Whether two revisions of a discovery config map list different devices
pub fn devices_changed(old: &ConfigMap, new: &ConfigMap) -> Result<bool> {
    let missing = || Error::DeviceInventoryParse(format!("no '{}' data key", DEVICES_DATA_KEY));
    let old = device_inventory(old).ok_or_else(missing)?;
    let new = device_inventory(new).ok_or_else(missing)?;
    Ok(!device_lists_equal(old, new)?)
}
