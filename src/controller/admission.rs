//! Node admission rules for clusters that use every node.

use crate::crd::{
    NodeSelectorRequirement, SelectorOperator, StorageClusterSpec, Toleration, TolerationOperator,
};
use k8s_openapi::api::core::v1::{Node, Taint};

pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

const NO_SCHEDULE: &str = "NoSchedule";
const NO_EXECUTE: &str = "NoExecute";

/// Hostname label, falling back to the object name
pub fn node_hostname(node: &Node) -> String {
    node.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(HOSTNAME_LABEL).cloned())
        .or_else(|| node.metadata.name.clone())
        .unwrap_or_default()
}

fn taints(node: &Node) -> &[Taint] {
    node.spec
        .as_ref()
        .and_then(|s| s.taints.as_deref())
        .unwrap_or_default()
}

/// Not cordoned and no NoSchedule taint
pub fn node_schedulable(node: &Node) -> bool {
    let cordoned = node
        .spec
        .as_ref()
        .and_then(|s| s.unschedulable)
        .unwrap_or(false);
    !cordoned && !taints(node).iter().any(|t| t.effect == NO_SCHEDULE)
}

/// Whether an update moved the node between schedulable and unschedulable
pub fn schedulability_flipped(old: &Node, new: &Node) -> bool {
    node_schedulable(old) != node_schedulable(new)
}

fn tolerates(toleration: &Toleration, taint: &Taint) -> bool {
    if let Some(effect) = toleration.effect.as_deref().filter(|e| !e.is_empty()) {
        if effect != taint.effect {
            return false;
        }
    }
    match toleration.key.as_deref().filter(|k| !k.is_empty()) {
        None => toleration.operator == TolerationOperator::Exists,
        Some(key) if key != taint.key => false,
        Some(_) => match toleration.operator {
            TolerationOperator::Exists => true,
            TolerationOperator::Equal => {
                toleration.value.as_deref().unwrap_or_default()
                    == taint.value.as_deref().unwrap_or_default()
            }
        },
    }
}

/// Every NoSchedule and NoExecute taint is tolerated
pub fn node_tolerable(node: &Node, tolerations: &[Toleration]) -> bool {
    taints(node)
        .iter()
        .filter(|t| t.effect == NO_SCHEDULE || t.effect == NO_EXECUTE)
        .all(|t| tolerations.iter().any(|tol| tolerates(tol, t)))
}

/// Ready condition is True
pub fn node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map_or(false, |conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// Every required label expression matches
pub fn node_matches_affinity(node: &Node, requirements: &[NodeSelectorRequirement]) -> bool {
    let labels = node.metadata.labels.clone().unwrap_or_default();
    requirements.iter().all(|req| {
        let value = labels.get(&req.key);
        match req.operator {
            SelectorOperator::In => value.map_or(false, |v| req.values.contains(v)),
            SelectorOperator::NotIn => value.map_or(true, |v| !req.values.contains(v)),
            SelectorOperator::Exists => value.is_some(),
            SelectorOperator::DoesNotExist => value.is_none(),
        }
    })
}

/// Outcome of evaluating a node for one cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeAdmission {
    Admitted,
    /// The cluster lists its nodes explicitly
    NotAllNodes,
    /// A taint is not tolerated by the storage role
    NotTolerable,
    /// Not ready, not schedulable, or outside the node affinity
    NotValid,
}

/// Decide whether `node` joins a cluster that uses every node
pub fn evaluate_node(node: &Node, spec: &StorageClusterSpec) -> NodeAdmission {
    if !spec.storage.use_all_nodes {
        return NodeAdmission::NotAllNodes;
    }
    let placement = spec.placement.osd_placement();
    if !node_tolerable(node, &placement.tolerations) {
        return NodeAdmission::NotTolerable;
    }
    if !node_ready(node)
        || !node_schedulable(node)
        || !node_matches_affinity(node, &placement.node_affinity)
    {
        return NodeAdmission::NotValid;
    }
    NodeAdmission::Admitted
}
