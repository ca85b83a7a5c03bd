//! Volume CRD
//!
//! Records which consumers have attached a cluster-provided volume. The
//! volume plugin creates one Volume per attached volume in the operator
//! namespace; each attachment is tagged with the namespace of the storage
//! cluster that serves it.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Volume attachment record maintained by the volume plugin
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.billyronks.io",
    version = "v1",
    kind = "Volume",
    plural = "volumes",
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpec {
    /// Active attachments of this volume
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// One consumer's attachment to a volume
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    /// Node where the volume is attached
    pub node: String,
    /// Namespace of the consuming pod
    #[serde(default)]
    pub pod_namespace: String,
    /// Name of the consuming pod
    #[serde(default)]
    pub pod_name: String,
    /// Namespace of the storage cluster serving the volume
    pub cluster_name: String,
    /// Mount directory on the node
    #[serde(default)]
    pub mount_dir: String,
    #[serde(default)]
    pub read_only: bool,
}

impl Volume {
    /// Whether any attachment references the given cluster namespace
    pub fn attached_to_cluster(&self, cluster_namespace: &str) -> bool {
        self.spec
            .attachments
            .iter()
            .any(|a| a.cluster_name == cluster_namespace)
    }
}
