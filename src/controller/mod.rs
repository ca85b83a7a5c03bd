//! Cluster Controller
//!
//! Watches StorageCluster resources, nodes and device inventories, and
//! drives each namespace's cluster through creation, connection, update,
//! hotplug orchestration and deletion.

pub mod admission;
pub mod config;
pub mod csi_config;
pub mod drain;
pub mod events;
pub mod finalizer;
pub mod metrics;
pub mod reconciler;
pub mod registry;
pub mod retry;
pub mod router;
pub mod supervisor;
pub mod version_gate;

#[cfg(test)]
pub mod testing;

pub use config::{hotplug_enabled, ControllerConfig};
pub use events::{ClusterEvent, ResourceChange};
pub use finalizer::FINALIZER;
pub use metrics::ControllerMetrics;
pub use reconciler::{Reconciler, ReconcilerDeps};
pub use registry::{ClusterHandle, ClusterRegistry, LifecyclePhase};
pub use router::{Dispatch, EventRouter};
