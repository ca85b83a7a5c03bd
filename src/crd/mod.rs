//! Custom Resource Definitions for the Storage Cluster Operator
//!
//! This module contains all CRD types:
//! - StorageCluster: Desired state of one storage cluster per namespace
//! - Volume: Attachment records kept by the volume plugin

pub mod storage_cluster;
pub mod volume;

pub use storage_cluster::*;
pub use volume::*;
