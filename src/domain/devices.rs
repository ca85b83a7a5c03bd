//! Device Inventory Model
//!
//! The discovery daemon publishes each node's raw devices as a JSON list
//! under a single data key of a per-node config map. Only the comparison
//! of two revisions matters here; how the list is gathered is not this
//! crate's concern.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Data key of the discovery config map holding the device list
pub const DEVICES_DATA_KEY: &str = "devices";

/// One raw device as reported by the discovery daemon
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalDisk {
    pub name: String,
    #[serde(default)]
    pub parent: String,
    #[serde(default)]
    pub has_children: bool,
    #[serde(default)]
    pub dev_links: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub serial: String,
    #[serde(default, rename = "type")]
    pub device_type: String,
    #[serde(default)]
    pub rotational: bool,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub filesystem: String,
    #[serde(default)]
    pub vendor: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub wwn: String,
    #[serde(default)]
    pub empty: bool,
}

/// Parse a serialized device list
pub fn parse_device_list(raw: &str) -> Result<Vec<LocalDisk>> {
    serde_json::from_str(raw).map_err(|e| Error::DeviceInventoryParse(e.to_string()))
}

/// Compare two serialized device lists as sets; ordering is irrelevant.
pub fn device_lists_equal(old: &str, new: &str) -> Result<bool> {
    let old: HashSet<LocalDisk> = parse_device_list(old)?.into_iter().collect();
    let new: HashSet<LocalDisk> = parse_device_list(new)?.into_iter().collect();
    Ok(old == new)
}
