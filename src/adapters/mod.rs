//! Adapters - Kubernetes-backed implementations of the domain ports
//!
//! - [`kube_store`]: StorageCluster reads and status/finalizer patches
//! - [`attachments`]: Volume attachment records
//! - [`csi_configmap`]: CSI cluster config map
//! - [`watch`]: Watch streams feeding the event router
//! - [`external`]: Connection info and config files of a running cluster
//! - [`version_probe`]: Job-based image version probe
//! - [`daemon_cli`]: Daemon queries through the engine client
//! - [`deployer`]: Local cluster deployment
//! - [`subcontrollers`]: Role resource sub-controllers

pub mod attachments;
pub mod csi_configmap;
pub mod daemon_cli;
pub mod deployer;
pub mod external;
pub mod kube_store;
pub mod subcontrollers;
pub mod version_probe;
pub mod watch;

pub use attachments::KubeAttachmentSource;
pub use csi_configmap::{ConfigMapCsiStore, CSI_CONFIG_KEY, CSI_CONFIG_MAP};
pub use daemon_cli::CliDaemonInspector;
pub use deployer::ManifestDeployer;
pub use external::KubeConnectionSource;
pub use kube_store::KubeClusterStore;
pub use subcontrollers::{default_subcontrollers, ResourceSubController};
pub use version_probe::JobVersionProbe;
pub use watch::{cluster_events, DeviceWatch};
