//! Cluster Registry
//!
//! Maps each namespace to the runtime state of its single storage cluster.
//! Lookup, register and remove run under one lock that is never held across
//! an await. Each entry owns a work queue drained by one worker task, which
//! serializes reconciliation passes for that namespace. Deletion is taken
//! once per entry and closes the queue before anything else happens.

use crate::crd::{StorageCluster, StorageClusterSpec};
use crate::domain::ObservedClusterInfo;
use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::Resource;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

// =============================================================================
// Lifecycle Phase
// =============================================================================

/// Where a cluster is in its lifecycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LifecyclePhase {
    #[default]
    Unconfigured,
    Initializing,
    Creating,
    Connecting,
    Created,
    Connected,
    Updating,
    Error,
    Deleting,
    Removed,
}

impl std::fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LifecyclePhase::Unconfigured => "unconfigured",
            LifecyclePhase::Initializing => "initializing",
            LifecyclePhase::Creating => "creating",
            LifecyclePhase::Connecting => "connecting",
            LifecyclePhase::Created => "created",
            LifecyclePhase::Connected => "connected",
            LifecyclePhase::Updating => "updating",
            LifecyclePhase::Error => "error",
            LifecyclePhase::Deleting => "deleting",
            LifecyclePhase::Removed => "removed",
        };
        write!(f, "{}", name)
    }
}

// =============================================================================
// Work Queue
// =============================================================================

/// One reconciliation pass queued for a cluster
#[derive(Debug, Clone)]
pub enum ClusterWork {
    /// Full initialization: version gate then create or connect
    Initialize(StorageCluster),
    /// Desired state changed
    Update {
        old: Box<StorageCluster>,
        new: Box<StorageCluster>,
    },
    /// A node became schedulable or unschedulable
    NodeChanged(Box<Node>),
    /// A node's device inventory changed
    DevicesChanged { node: String },
}

impl ClusterWork {
    /// Short label for logs and metrics
    pub fn trigger(&self) -> &'static str {
        match self {
            ClusterWork::Initialize(_) => "add",
            ClusterWork::Update { .. } => "update",
            ClusterWork::NodeChanged(_) => "node",
            ClusterWork::DevicesChanged { .. } => "devices",
        }
    }
}

pub type WorkReceiver = mpsc::UnboundedReceiver<ClusterWork>;

// =============================================================================
// Cluster Handle
// =============================================================================

/// Mutable part of a cluster's runtime state
#[derive(Debug, Clone, Default)]
pub struct ClusterRuntimeState {
    /// Desired state of the latest accepted revision
    pub spec: StorageClusterSpec,
    /// Facts about the running cluster, set once creation or connection succeeds
    pub observed: Option<ObservedClusterInfo>,
    /// Whether the creation or connection flow has completed once
    pub initialized: bool,
    pub phase: LifecyclePhase,
    /// Stops the current generation of sub-controllers
    pub subcontrollers: Option<CancellationToken>,
}

/// Runtime state of one registered cluster
#[derive(Debug)]
pub struct ClusterHandle {
    namespace: String,
    resource_name: String,
    uid: Option<String>,
    owner: Option<OwnerReference>,
    /// Fired once the cluster is torn down; stops health loops and sub-controllers
    cancel: CancellationToken,
    /// Child of `cancel`; fired when deletion starts and aborts queued passes
    passes: CancellationToken,
    deleting: AtomicBool,
    queue: mpsc::UnboundedSender<ClusterWork>,
    state: Mutex<ClusterRuntimeState>,
}

impl ClusterHandle {
    /// Create a handle for the given resource, with the receiving end of
    /// its work queue.
    pub fn new(cluster: &StorageCluster) -> (Self, WorkReceiver) {
        let (queue, receiver) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let handle = Self {
            namespace: cluster.namespace_str().to_string(),
            resource_name: cluster.name().to_string(),
            uid: cluster.metadata.uid.clone(),
            owner: cluster.controller_owner_ref(&()),
            passes: cancel.child_token(),
            cancel,
            deleting: AtomicBool::new(false),
            queue,
            state: Mutex::new(ClusterRuntimeState {
                spec: cluster.spec.clone(),
                ..Default::default()
            }),
        };
        (handle, receiver)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    pub fn owner(&self) -> Option<OwnerReference> {
        self.owner.clone()
    }

    /// Whether this entry was registered for `cluster`: same name, and the
    /// same uid when both sides carry one.
    pub fn belongs_to(&self, cluster: &StorageCluster) -> bool {
        if self.resource_name != cluster.name() {
            return false;
        }
        match (self.uid.as_deref(), cluster.metadata.uid.as_deref()) {
            (Some(ours), Some(theirs)) => ours == theirs,
            _ => true,
        }
    }

    /// Cancellation signal shared by every task of this cluster
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancellation signal of reconciliation passes only
    pub fn pass_token(&self) -> &CancellationToken {
        &self.passes
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_deleting(&self) -> bool {
        self.deleting.load(Ordering::SeqCst)
    }

    /// Start deletion: close the queue, abort the pass in flight and enter
    /// [`LifecyclePhase::Deleting`]. Only the first caller gets `true`.
    pub fn begin_delete(&self) -> bool {
        if self.deleting.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.passes.cancel();
        self.set_phase(LifecyclePhase::Deleting);
        true
    }

    /// Queue a pass; returns false once deletion started or the worker stopped
    pub fn enqueue(&self, work: ClusterWork) -> bool {
        if self.is_deleting() || self.passes.is_cancelled() {
            return false;
        }
        self.queue.send(work).is_ok()
    }

    /// Snapshot of the mutable state
    pub fn snapshot(&self) -> ClusterRuntimeState {
        self.state.lock().clone()
    }

    pub fn spec(&self) -> StorageClusterSpec {
        self.state.lock().spec.clone()
    }

    pub fn observed(&self) -> Option<ObservedClusterInfo> {
        self.state.lock().observed.clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.state.lock().phase
    }

    /// Move to `phase`. Once deleting, only [`LifecyclePhase::Removed`] is
    /// accepted.
    pub fn set_phase(&self, phase: LifecyclePhase) {
        let mut state = self.state.lock();
        if state.phase == LifecyclePhase::Deleting && phase != LifecyclePhase::Removed {
            return;
        }
        if state.phase != phase {
            debug!(namespace = %self.namespace, "Cluster phase {} -> {}", state.phase, phase);
            state.phase = phase;
        }
    }

    /// Mutate the state under its lock; `f` must not block
    pub fn update<R>(&self, f: impl FnOnce(&mut ClusterRuntimeState) -> R) -> R {
        f(&mut self.state.lock())
    }
}

// =============================================================================
// Cluster Registry
// =============================================================================

/// Namespace to cluster mapping plus the process-wide device claim
#[derive(Debug, Default)]
pub struct ClusterRegistry {
    clusters: Mutex<HashMap<String, Arc<ClusterHandle>>>,
    /// Namespace currently consuming all devices, if any
    all_devices_holder: Mutex<Option<String>>,
}

impl ClusterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, namespace: &str) -> Option<Arc<ClusterHandle>> {
        self.clusters.lock().get(namespace).cloned()
    }

    /// Register a cluster; a namespace already holding one is left untouched.
    pub fn register(&self, handle: ClusterHandle) -> Result<Arc<ClusterHandle>> {
        let mut clusters = self.clusters.lock();
        if let Some(existing) = clusters.get(handle.namespace()) {
            return Err(Error::ClusterAlreadyExists {
                namespace: handle.namespace().to_string(),
                existing: existing.resource_name().to_string(),
                requested: handle.resource_name().to_string(),
            });
        }

        let handle = Arc::new(handle);
        clusters.insert(handle.namespace().to_string(), handle.clone());
        info!(
            namespace = %handle.namespace(),
            "Registered cluster {} ({} total)",
            handle.resource_name(),
            clusters.len()
        );
        Ok(handle)
    }

    /// Remove the entry of `namespace` only if `matches` accepts it
    pub fn remove_if(
        &self,
        namespace: &str,
        matches: impl FnOnce(&Arc<ClusterHandle>) -> bool,
    ) -> Option<Arc<ClusterHandle>> {
        let mut clusters = self.clusters.lock();
        if !clusters.get(namespace).is_some_and(matches) {
            return None;
        }
        let removed = clusters.remove(namespace);
        info!(namespace = %namespace, "Removed cluster from registry");
        removed
    }

    /// Every registered cluster
    pub fn handles(&self) -> Vec<Arc<ClusterHandle>> {
        self.clusters.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.clusters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.lock().is_empty()
    }

    // =========================================================================
    // All-Devices Exclusivity
    // =========================================================================

    /// Claim the "use all devices" policy for a namespace.
    ///
    /// Re-claiming by the holder succeeds; any other namespace is refused.
    pub fn claim_all_devices(&self, namespace: &str) -> Result<()> {
        let mut holder = self.all_devices_holder.lock();
        match holder.as_deref() {
            None => {
                *holder = Some(namespace.to_string());
                Ok(())
            }
            Some(current) if current == namespace => Ok(()),
            Some(current) => Err(Error::DevicesInUse {
                namespace: namespace.to_string(),
                holder: current.to_string(),
            }),
        }
    }

    /// Release the claim if `namespace` holds it
    pub fn release_all_devices(&self, namespace: &str) -> bool {
        let mut holder = self.all_devices_holder.lock();
        if holder.as_deref() == Some(namespace) {
            *holder = None;
            true
        } else {
            false
        }
    }

    pub fn all_devices_holder(&self) -> Option<String> {
        self.all_devices_holder.lock().clone()
    }

    /// Fire every cluster's cancellation signal and empty the registry
    pub fn stop_all(&self) -> usize {
        let drained: Vec<_> = self.clusters.lock().drain().collect();
        for (namespace, handle) in &drained {
            info!(namespace = %namespace, "Stopping cluster {}", handle.resource_name());
            handle.cancel_token().cancel();
        }
        *self.all_devices_holder.lock() = None;
        drained.len()
    }
}
