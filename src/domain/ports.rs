//! Domain Ports - Core trait definitions for the cluster controller
//!
//! These traits define the boundaries between the reconciliation logic and
//! the systems it drives: the resource store, the engine image, the running
//! daemons, the volume plugin and the sub-controllers. Adapters implement
//! these traits to provide concrete functionality.

use crate::crd::{ClusterState, EngineHealthStatus, StorageCluster, StorageClusterSpec, Volume};
use crate::domain::cluster_info::ObservedClusterInfo;
use crate::domain::version::{DaemonVersions, EngineVersion};
use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Cluster Store Port
// =============================================================================

/// Port for reading and patching the desired-state resource
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Fetch the latest revision of a cluster resource
    async fn get(&self, namespace: &str, name: &str) -> Result<StorageCluster>;

    /// Replace the finalizer list of a cluster resource. Given a
    /// `resource_version`, the write is refused with a conflict once the
    /// resource has moved past that revision.
    async fn set_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
        resource_version: Option<&str>,
    ) -> Result<()>;

    /// Write lifecycle state and message into the status
    async fn set_state(
        &self,
        namespace: &str,
        name: &str,
        state: ClusterState,
        message: &str,
    ) -> Result<()>;

    /// Write engine health into the status, leaving state and message alone
    async fn set_engine_health(
        &self,
        namespace: &str,
        name: &str,
        health: EngineHealthStatus,
    ) -> Result<()>;
}

// =============================================================================
// Version Probe Port
// =============================================================================

/// Request to run an image and report its engine version
#[derive(Debug, Clone)]
pub struct ProbeRequest {
    /// Namespace the probe runs in
    pub namespace: String,
    /// Image whose version is wanted
    pub image: String,
    /// Owner of any object created for the probe
    pub owner: Option<OwnerReference>,
}

/// Port for probing the engine version shipped in an image
#[async_trait]
pub trait ImageVersionProbe: Send + Sync {
    /// Run the image's version command and return its raw output
    async fn probe(&self, request: &ProbeRequest) -> Result<String>;
}

// =============================================================================
// Deployment Port
// =============================================================================

/// Everything the creation routine needs for one attempt
#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub namespace: String,
    pub resource_name: String,
    pub spec: StorageClusterSpec,
    pub version: EngineVersion,
    pub owner: Option<OwnerReference>,
    /// Facts from a previous successful pass, if any
    pub previous: Option<ObservedClusterInfo>,
}

/// Port for the idempotent creation routine of a local cluster
///
/// Deploys the consensus role and the storage-role daemons for the desired
/// state. Re-applying the same request must be safe.
#[async_trait]
pub trait ClusterDeployer: Send + Sync {
    async fn deploy(&self, request: &DeployRequest) -> Result<ObservedClusterInfo>;
}

// =============================================================================
// External Connection Port
// =============================================================================

/// Port for connecting to a cluster managed outside the operator
#[async_trait]
pub trait ConnectionInfoSource: Send + Sync {
    /// Load endpoints and credentials of the external cluster
    async fn load(&self, namespace: &str) -> Result<ObservedClusterInfo>;

    /// Load info persisted by a previous pass, if there is any
    async fn load_existing(&self, namespace: &str) -> Result<Option<ObservedClusterInfo>>;

    /// Write the local connection config used by the daemon commands
    async fn write_connection_config(
        &self,
        namespace: &str,
        info: &ObservedClusterInfo,
    ) -> Result<()>;
}

// =============================================================================
// Daemon Inspection Port
// =============================================================================

/// Consensus quorum as reported by the monitors
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumStatus {
    #[serde(default)]
    pub quorum_names: Vec<String>,
    #[serde(default)]
    pub leader: Option<String>,
}

/// Storage-role daemon counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsdSummary {
    pub total: u32,
    pub up: u32,
    pub in_cluster: u32,
}

impl OsdSummary {
    pub fn down(&self) -> u32 {
        self.total.saturating_sub(self.up)
    }
}

/// Overall engine health with its failing checks
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineHealth {
    /// HEALTH_OK, HEALTH_WARN or HEALTH_ERR
    pub status: String,
    #[serde(default)]
    pub checks: BTreeMap<String, String>,
}

impl EngineHealth {
    pub const OK: &'static str = "HEALTH_OK";

    pub fn is_ok(&self) -> bool {
        self.status == Self::OK
    }
}

/// Port for querying the running daemons of a cluster
#[async_trait]
pub trait DaemonInspector: Send + Sync {
    /// Version reported by the consensus role
    async fn mon_version(&self, namespace: &str) -> Result<EngineVersion>;

    /// Versions reported by every running daemon
    async fn daemon_versions(&self, namespace: &str) -> Result<DaemonVersions>;

    /// Overall health of the cluster
    async fn health(&self, namespace: &str) -> Result<EngineHealth>;

    /// Current consensus quorum
    async fn quorum_status(&self, namespace: &str) -> Result<QuorumStatus>;

    /// Storage-role daemon counts
    async fn osd_summary(&self, namespace: &str) -> Result<OsdSummary>;
}

// =============================================================================
// Volume Attachment Port
// =============================================================================

/// Port for listing volume attachment records
#[async_trait]
pub trait AttachmentSource: Send + Sync {
    /// List every attachment record in the operator namespace
    async fn list(&self, operator_namespace: &str) -> Result<Vec<Volume>>;
}

// =============================================================================
// CSI Config Port
// =============================================================================

/// Port for the shared CSI cluster configuration payload
#[async_trait]
pub trait CsiConfigStore: Send + Sync {
    /// Current payload; an absent payload reads as empty
    async fn load(&self) -> Result<String>;

    async fn save(&self, payload: String) -> Result<()>;
}

// =============================================================================
// Sub-Controller Port
// =============================================================================

/// What a sub-controller is handed when its cluster becomes usable
#[derive(Debug, Clone)]
pub struct SubControllerContext {
    pub namespace: String,
    pub resource_name: String,
    pub info: ObservedClusterInfo,
    pub owner: Option<OwnerReference>,
}

/// A per-role controller started and stopped by the cluster controller
#[async_trait]
pub trait SubController: Send + Sync {
    /// Resource kind this controller reconciles
    fn kind(&self) -> &'static str;

    /// Run until `cancel` fires
    async fn run(&self, context: SubControllerContext, cancel: CancellationToken) -> Result<()>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ClusterStoreRef = Arc<dyn ClusterStore>;
pub type ImageVersionProbeRef = Arc<dyn ImageVersionProbe>;
pub type ClusterDeployerRef = Arc<dyn ClusterDeployer>;
pub type ConnectionInfoSourceRef = Arc<dyn ConnectionInfoSource>;
pub type DaemonInspectorRef = Arc<dyn DaemonInspector>;
pub type AttachmentSourceRef = Arc<dyn AttachmentSource>;
pub type CsiConfigStoreRef = Arc<dyn CsiConfigStore>;
pub type SubControllerRef = Arc<dyn SubController>;

/// Callback run with the external-mode flag whenever a cluster is added
pub type ClusterAddedHook = Arc<dyn Fn(bool) -> Result<()> + Send + Sync>;
