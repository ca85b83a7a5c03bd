//! StorageCluster CRD
//!
//! The desired-state resource for one storage cluster. Exactly one
//! StorageCluster may exist per namespace; the controller drives the
//! cluster toward this description and reports lifecycle state back
//! through the status subresource.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// API group of every resource owned by the operator
pub const API_GROUP: &str = "storage.billyronks.io";

/// Plural name of the StorageCluster resource
pub const STORAGE_CLUSTER_PLURAL: &str = "storageclusters";

// =============================================================================
// StorageCluster CRD
// =============================================================================

/// StorageCluster describes a distributed storage cluster: which nodes and
/// devices it may use, how many monitors form the quorum, which engine image
/// runs the daemons, and whether the cluster is managed locally or only
/// connected to as an external cluster.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.billyronks.io",
    version = "v1",
    kind = "StorageCluster",
    plural = "storageclusters",
    shortname = "stc",
    status = "StorageClusterStatus",
    printcolumn = r#"{"name": "Image", "type": "string", "jsonPath": ".spec.engineVersion.image"}"#,
    printcolumn = r#"{"name": "Mons", "type": "integer", "jsonPath": ".spec.mon.count"}"#,
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    printcolumn = r#"{"name": "Health", "type": "string", "jsonPath": ".status.engine.health"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct StorageClusterSpec {
    /// Engine image and version policy
    #[serde(default)]
    pub engine_version: EngineVersionSpec,

    /// Monitor (consensus role) settings
    #[serde(default)]
    pub mon: MonSpec,

    /// Node and device selection for the storage role
    #[serde(default)]
    pub storage: StorageScopeSpec,

    /// Per-role placement rules
    #[serde(default)]
    pub placement: PlacementSpec,

    /// Connect to an externally managed cluster instead of deploying one
    #[serde(default)]
    pub external: ExternalSpec,

    /// Per-role resource overrides keyed by role name (mon, osd, mgr, ...)
    #[serde(default)]
    pub resources: BTreeMap<String, RoleResources>,

    /// Host path where daemons keep their configuration and data
    #[serde(default = "default_data_dir_host_path")]
    pub data_dir_host_path: String,
}

// =============================================================================
// Sub-Types
// =============================================================================

/// Engine image and version policy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EngineVersionSpec {
    /// Container image running the cluster daemons
    #[serde(default)]
    pub image: String,

    /// Permit engine releases outside the supported set
    #[serde(default)]
    pub allow_unsupported: bool,
}

/// Monitor quorum settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MonSpec {
    /// Number of monitors; 0 means "use the default"
    #[serde(default)]
    pub count: u32,

    /// Allow more than one monitor on the same node
    #[serde(default)]
    pub allow_multiple_per_node: bool,
}

/// Which nodes and devices the storage role consumes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageScopeSpec {
    /// Admit every eligible node in the cluster
    #[serde(default)]
    pub use_all_nodes: bool,

    /// Consume every available device on admitted nodes
    #[serde(default)]
    pub use_all_devices: Option<bool>,

    /// Regex-style filter applied to device names
    #[serde(default)]
    pub device_filter: Option<String>,

    /// Explicit per-node selection (ignored when useAllNodes is set)
    #[serde(default)]
    pub nodes: Vec<StorageNodeSelection>,
}

/// Explicit storage node entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageNodeSelection {
    /// Node hostname
    pub name: String,

    /// Consume every available device on this node
    #[serde(default)]
    pub use_all_devices: Option<bool>,

    /// Explicit device names
    #[serde(default)]
    pub devices: Vec<String>,
}

/// External-mode settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExternalSpec {
    /// Connect to an existing cluster rather than deploying one
    #[serde(default)]
    pub enable: bool,
}

/// Resource requests/limits for a daemon role
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RoleResources {
    #[serde(default)]
    pub requests: BTreeMap<String, String>,
    #[serde(default)]
    pub limits: BTreeMap<String, String>,
}

/// Placement rules per daemon role; `all` applies to every role
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlacementSpec {
    #[serde(default)]
    pub all: Option<Placement>,
    #[serde(default)]
    pub mon: Option<Placement>,
    #[serde(default)]
    pub osd: Option<Placement>,
    #[serde(default)]
    pub mgr: Option<Placement>,
}

/// Node affinity and taint tolerations for one role
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Placement {
    /// Required node label expressions; all must match
    #[serde(default)]
    pub node_affinity: Vec<NodeSelectorRequirement>,

    /// Taints this role tolerates
    #[serde(default)]
    pub tolerations: Vec<Toleration>,
}

/// A single node label expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeSelectorRequirement {
    pub key: String,
    pub operator: SelectorOperator,
    #[serde(default)]
    pub values: Vec<String>,
}

/// Label expression operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum SelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// Taint toleration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Toleration {
    /// Taint key; empty with operator Exists tolerates everything
    #[serde(default)]
    pub key: Option<String>,

    #[serde(default)]
    pub operator: TolerationOperator,

    #[serde(default)]
    pub value: Option<String>,

    /// Effect to match; empty matches every effect
    #[serde(default)]
    pub effect: Option<String>,
}

/// Toleration operators
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum TolerationOperator {
    #[default]
    Equal,
    Exists,
}

// =============================================================================
// Status
// =============================================================================

/// Status of the StorageCluster
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageClusterStatus {
    /// Lifecycle state written by the reconciler
    #[serde(default)]
    pub state: Option<ClusterState>,

    /// Free-text detail for the current state
    #[serde(default)]
    pub message: String,

    /// Engine health written by the status checker
    #[serde(default)]
    pub engine: Option<EngineHealthStatus>,
}

/// Lifecycle state reported on the resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ClusterState {
    Creating,
    Created,
    Updating,
    Connecting,
    Connected,
    Error,
}

impl std::fmt::Display for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterState::Creating => write!(f, "Creating"),
            ClusterState::Created => write!(f, "Created"),
            ClusterState::Updating => write!(f, "Updating"),
            ClusterState::Connecting => write!(f, "Connecting"),
            ClusterState::Connected => write!(f, "Connected"),
            ClusterState::Error => write!(f, "Error"),
        }
    }
}

/// Engine health as last observed by the status checker
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EngineHealthStatus {
    /// HEALTH_OK, HEALTH_WARN or HEALTH_ERR
    #[serde(default)]
    pub health: String,

    /// Health check names mapped to their summaries
    #[serde(default)]
    pub details: BTreeMap<String, String>,

    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_checked: Option<DateTime<Utc>>,
}

// =============================================================================
// Default Value Functions
// =============================================================================

fn default_data_dir_host_path() -> String {
    "/var/lib/rook".to_string()
}

// =============================================================================
// Implementations
// =============================================================================

impl StorageCluster {
    /// Get the name of this cluster resource
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("unknown")
    }

    /// Get the namespace of this cluster resource
    pub fn namespace_str(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or("default")
    }

    /// Whether deletion has been requested
    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Whether the given finalizer is present
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .map_or(false, |f| f.iter().any(|name| name == finalizer))
    }
}

impl StorageClusterSpec {
    /// Whether any part of the storage selection consumes all devices
    pub fn any_use_all_devices(&self) -> bool {
        self.storage.use_all_devices.unwrap_or(false)
            || self
                .storage
                .nodes
                .iter()
                .any(|n| n.use_all_devices.unwrap_or(false))
    }

    /// Whether this cluster only connects to an external cluster
    pub fn is_external(&self) -> bool {
        self.external.enable
    }

    /// Copy with storage nodes sorted by name, for order-insensitive diffs
    pub fn normalized(&self) -> Self {
        let mut spec = self.clone();
        spec.storage.nodes.sort_by(|a, b| a.name.cmp(&b.name));
        spec
    }
}

impl PlacementSpec {
    /// Placement for the storage role: `all` merged with `osd`
    pub fn osd_placement(&self) -> Placement {
        Placement::merged(self.all.as_ref(), self.osd.as_ref())
    }

    /// Placement for the monitor role: `all` merged with `mon`
    pub fn mon_placement(&self) -> Placement {
        Placement::merged(self.all.as_ref(), self.mon.as_ref())
    }
}

impl Placement {
    /// Combine a base placement with a role-specific one
    pub fn merged(base: Option<&Placement>, role: Option<&Placement>) -> Placement {
        let mut merged = base.cloned().unwrap_or_default();
        if let Some(role) = role {
            merged.node_affinity.extend(role.node_affinity.iter().cloned());
            merged.tolerations.extend(role.tolerations.iter().cloned());
        }
        merged
    }
}
