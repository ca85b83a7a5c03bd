//! Domain layer - Core models and port definitions
//!
//! This module defines the core traits (ports) that adapters implement,
//! following hexagonal architecture principles, plus the value types the
//! controller reasons about: engine versions, observed cluster facts and
//! device inventories.

pub mod cluster_info;
pub mod devices;
pub mod ports;
pub mod version;

pub use cluster_info::{flatten_mon_endpoints, parse_mon_endpoints, MonInfo, ObservedClusterInfo};
pub use devices::{device_lists_equal, LocalDisk, DEVICES_DATA_KEY};
pub use ports::*;
pub use version::{diff_image_and_running, DaemonVersions, EngineVersion, UpgradeDecision};
