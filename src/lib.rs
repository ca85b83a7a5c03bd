//! Storage Cluster Operator
//!
//! A Kubernetes operator that reconciles `StorageCluster` resources: one
//! distributed storage cluster per namespace, either deployed locally or
//! connected to as an external cluster.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              Event Sources                                  │
//! │   StorageCluster watch      Node watch      Device inventory config maps    │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                               EventRouter                                   │
//! │                                    │                                        │
//! │              ┌─────────────────────┴─────────────────────┐                  │
//! │              │   ClusterRegistry (one entry/namespace)   │                  │
//! │              │   per-namespace work queue + worker       │                  │
//! │              └─────────────────────┬─────────────────────┘                  │
//! │                                    │                                        │
//! │                               Reconciler                                    │
//! │   ┌──────────────┐  ┌──────────────┐  ┌──────────────┐  ┌───────────────┐   │
//! │   │ VersionGate  │  │ Create/Conn. │  │ DeletionDrain│  │  Finalizers   │   │
//! │   └──────────────┘  └──────────────┘  └──────────────┘  └───────────────┘   │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                 Sub-Controllers          Health Supervisors                 │
//! │     pool, object store, object store user, filesystem, NFS export           │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controller`]: Registry, reconciler, router and supervisors
//! - [`adapters`]: Kubernetes-backed implementations of the ports
//! - [`crd`]: Custom Resource Definitions
//! - [`domain`]: Core domain types and traits
//! - [`error`]: Error types and handling

pub mod adapters;
pub mod controller;
pub mod crd;
pub mod domain;
pub mod error;

// Re-export commonly used types
pub use controller::{
    hotplug_enabled, ClusterEvent, ClusterRegistry, ControllerConfig, ControllerMetrics,
    EventRouter, Reconciler, ReconcilerDeps,
};

pub use crd::{
    ClusterState, EngineHealthStatus, StorageCluster, StorageClusterSpec, StorageClusterStatus,
    Volume, VolumeSpec,
};

pub use domain::{EngineVersion, ObservedClusterInfo};

pub use error::{Error, ErrorAction, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
