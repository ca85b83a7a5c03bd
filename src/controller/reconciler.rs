//! Cluster Reconciler
//!
//! Per-namespace lifecycle of a storage cluster:
//!
//! ```text
//! Unconfigured -> Initializing -> Creating   -> Created   -> Updating -> Created
//!                              -> Connecting -> Connected
//!                              -> Error (for that pass)
//! Deleting -> Removed
//! ```
//!
//! Event handlers register the cluster and queue passes; one worker task
//! per cluster runs them in order. Deletion runs outside the queue: it
//! closes the queue and aborts the pass in flight before draining, and
//! fires the cluster's cancellation token once the drain is over.

use crate::controller::config::{ControllerConfig, DEFAULT_MON_COUNT};
use crate::controller::csi_config::CsiConfigUpdater;
use crate::controller::drain::{DeletionDrain, DrainOutcome};
use crate::controller::events::spec_changed;
use crate::controller::admission::{evaluate_node, node_hostname, NodeAdmission};
use crate::controller::finalizer::FinalizerManager;
use crate::controller::metrics::{ControllerMetrics, PassOutcome};
use crate::controller::registry::{
    ClusterHandle, ClusterRegistry, ClusterWork, LifecyclePhase, WorkReceiver,
};
use crate::controller::retry::{classify, poll, PollError};
use crate::controller::supervisor::{HealthIntervals, HealthSupervisor, SubControllerSupervisor};
use crate::controller::version_gate::VersionGate;
use crate::crd::{ClusterState, StorageCluster, StorageClusterSpec};
use crate::domain::{
    AttachmentSourceRef, ClusterAddedHook, ClusterDeployerRef, ClusterStoreRef,
    ConnectionInfoSourceRef, CsiConfigStoreRef, DaemonInspectorRef, DeployRequest,
    EngineVersion, ImageVersionProbeRef, ObservedClusterInfo, ProbeRequest,
    SubControllerContext, SubControllerRef,
};
use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::Node;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Collaborators of the reconciler
pub struct ReconcilerDeps {
    pub store: ClusterStoreRef,
    pub probe: ImageVersionProbeRef,
    pub deployer: ClusterDeployerRef,
    pub connection: ConnectionInfoSourceRef,
    pub inspector: DaemonInspectorRef,
    pub attachments: AttachmentSourceRef,
    pub csi_store: CsiConfigStoreRef,
    pub subcontrollers: Vec<SubControllerRef>,
    pub added_hook: Option<ClusterAddedHook>,
}

pub struct Reconciler {
    config: ControllerConfig,
    registry: Arc<ClusterRegistry>,
    store: ClusterStoreRef,
    deployer: ClusterDeployerRef,
    connection: ConnectionInfoSourceRef,
    gate: VersionGate,
    drain: DeletionDrain,
    finalizers: FinalizerManager,
    csi: CsiConfigUpdater,
    subcontrollers: SubControllerSupervisor,
    health: HealthSupervisor,
    metrics: ControllerMetrics,
    added_hook: Option<ClusterAddedHook>,
}

/// Apply defaults to a freshly accepted desired state
fn with_defaults(mut spec: StorageClusterSpec, namespace: &str) -> StorageClusterSpec {
    if spec.mon.count == 0 {
        warn!(
            namespace = %namespace,
            "Mon count should be at least 1, using default of {}",
            DEFAULT_MON_COUNT
        );
        spec.mon.count = DEFAULT_MON_COUNT;
    }
    if spec.mon.count % 2 == 0 {
        warn!(
            namespace = %namespace,
            "Mon count is even (given: {}), should be odd, continuing",
            spec.mon.count
        );
    }
    spec
}

impl Reconciler {
    pub fn new(
        config: ControllerConfig,
        registry: Arc<ClusterRegistry>,
        deps: ReconcilerDeps,
        metrics: ControllerMetrics,
    ) -> Self {
        let gate = VersionGate::new(
            deps.probe,
            deps.inspector.clone(),
            config.version_probe_timeout,
        );
        let drain = DeletionDrain::new(
            deps.attachments,
            config.operator_namespace.clone(),
            config.drain_policy(),
        );
        let finalizers = FinalizerManager::new(deps.store.clone(), config.finalizer_policy());
        let health = HealthSupervisor::new(
            deps.inspector,
            deps.store.clone(),
            HealthIntervals {
                mon: config.mon_health_interval,
                osd: config.osd_health_interval,
                status: config.status_interval,
            },
            metrics.clone(),
        );

        Self {
            registry,
            store: deps.store,
            deployer: deps.deployer,
            connection: deps.connection,
            gate,
            drain,
            finalizers,
            csi: CsiConfigUpdater::new(deps.csi_store),
            subcontrollers: SubControllerSupervisor::new(deps.subcontrollers),
            health,
            metrics,
            added_hook: deps.added_hook,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<ClusterRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    // =========================================================================
    // Event Entry Points
    // =========================================================================

    /// Register a new cluster and queue its initialization
    pub fn on_add(self: &Arc<Self>, cluster: StorageCluster) -> Result<Arc<ClusterHandle>> {
        let (handle, receiver) = ClusterHandle::new(&cluster);
        let handle = match self.registry.register(handle) {
            Ok(handle) => handle,
            Err(e) => {
                error!(namespace = %cluster.namespace_str(), "Failed to add cluster: {}", e);
                self.metrics.record_rejected();
                return Err(e);
            }
        };
        self.metrics.set_clusters(self.registry.len());
        info!(namespace = %handle.namespace(), "Starting cluster {}", handle.resource_name());

        if let Some(hook) = &self.added_hook {
            if let Err(e) = hook(cluster.spec.is_external()) {
                error!(namespace = %handle.namespace(), "Cluster added hook failed: {}", e);
            }
        }

        self.spawn_worker(handle.clone(), receiver);
        handle.enqueue(ClusterWork::Initialize(cluster));
        Ok(handle)
    }

    /// Route a resource update. Deletion requests run at once on their own
    /// task; everything else is queued behind earlier passes.
    pub fn on_update(
        self: &Arc<Self>,
        old: StorageCluster,
        new: StorageCluster,
    ) -> Option<JoinHandle<()>> {
        let namespace = new.namespace_str().to_string();
        debug!(namespace = %namespace, "Update event for cluster {}", new.name());

        if let Some(existing) = self.registry.lookup(&namespace) {
            if existing.resource_name() != new.name() {
                error!(
                    namespace = %namespace,
                    "Skipping update of cluster {}: cluster {} already exists in this namespace",
                    new.name(),
                    existing.resource_name()
                );
                self.metrics.record_rejected();
                return None;
            }
        }

        if new.is_being_deleted() {
            info!(namespace = %namespace, "Cluster {} has a deletion timestamp", new.name());
            let this = self.clone();
            return Some(tokio::spawn(async move { this.delete(new).await }));
        }

        let Some(handle) = self.registry.lookup(&namespace) else {
            error!(
                namespace = %namespace,
                "Cannot update cluster {} that does not exist",
                new.name()
            );
            return None;
        };
        handle.enqueue(ClusterWork::Update {
            old: Box::new(old),
            new: Box::new(new),
        });
        None
    }

    /// Route a delete notification of the resource itself
    pub fn on_delete(self: &Arc<Self>, cluster: StorageCluster) -> Option<JoinHandle<()>> {
        let namespace = cluster.namespace_str();
        match self.registry.lookup(namespace) {
            Some(existing) if existing.resource_name() != cluster.name() => {
                error!(
                    namespace = %namespace,
                    "Skipping deletion of cluster {}: cluster {} already exists in this namespace",
                    cluster.name(),
                    existing.resource_name()
                );
                None
            }
            Some(_) => {
                let this = self.clone();
                Some(tokio::spawn(async move { this.delete(cluster).await }))
            }
            None => {
                debug!(namespace = %namespace, "Cluster {} already removed", cluster.name());
                self.registry.release_all_devices(namespace);
                None
            }
        }
    }

    /// Queue node evaluation for every cluster; returns how many were queued
    pub fn on_node(&self, node: &Node) -> usize {
        self.registry
            .handles()
            .iter()
            .filter(|h| h.enqueue(ClusterWork::NodeChanged(Box::new(node.clone()))))
            .count()
    }

    /// Queue hotplug orchestration for every cluster
    pub fn on_devices_changed(&self, node: &str) -> usize {
        self.registry
            .handles()
            .iter()
            .filter(|h| {
                h.enqueue(ClusterWork::DevicesChanged {
                    node: node.to_string(),
                })
            })
            .count()
    }

    /// Cancel every cluster and empty the registry
    pub fn stop_all(&self) {
        let stopped = self.registry.stop_all();
        self.metrics.set_clusters(0);
        info!("Stopped {} clusters", stopped);
    }

    // =========================================================================
    // Worker
    // =========================================================================

    fn spawn_worker(self: &Arc<Self>, handle: Arc<ClusterHandle>, mut receiver: WorkReceiver) {
        let this = self.clone();
        tokio::spawn(async move {
            let cancel = handle.pass_token().clone();
            loop {
                let work = tokio::select! {
                    _ = cancel.cancelled() => break,
                    work = receiver.recv() => match work {
                        Some(work) => work,
                        None => break,
                    },
                };

                let trigger = work.trigger();
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => PassOutcome::Cancelled,
                    outcome = this.run_pass(&handle, work) => outcome,
                };
                this.metrics.record_pass(trigger, outcome);
            }
            debug!(namespace = %handle.namespace(), "Cluster worker stopped");
        });
    }

    async fn run_pass(&self, handle: &ClusterHandle, work: ClusterWork) -> PassOutcome {
        match work {
            ClusterWork::Initialize(cluster) => self.initialize(handle, &cluster).await,
            ClusterWork::Update { old, new } => self.update(handle, &old, &new).await,
            ClusterWork::NodeChanged(node) => self.orchestrate_node(handle, &node).await,
            ClusterWork::DevicesChanged { node } => self.orchestrate_devices(handle, &node).await,
        }
    }

    // =========================================================================
    // Initialization
    // =========================================================================

    async fn initialize(&self, handle: &ClusterHandle, cluster: &StorageCluster) -> PassOutcome {
        let namespace = handle.namespace();
        handle.set_phase(LifecyclePhase::Initializing);

        let spec = with_defaults(cluster.spec.clone(), namespace);
        handle.update(|s| s.spec = spec.clone());
        self.ensure_finalizer(handle).await;

        // Info left by an earlier run of the controller
        let existing = match self.connection.load_existing(namespace).await {
            Ok(existing) => existing,
            Err(e) => {
                debug!(namespace = %namespace, "No existing cluster info: {}", e);
                None
            }
        };
        if let Some(info) = &existing {
            if let Err(e) = self.connection.write_connection_config(namespace, info).await {
                return self.fail_pass(handle, e).await;
            }
        }

        let result = if spec.is_external() {
            self.connect_external(handle, &spec).await
        } else {
            self.create_local(handle, &spec, existing.clone()).await
        };

        match result {
            Ok(info) => {
                self.complete_initialization(handle, spec, info).await;
                PassOutcome::Success
            }
            Err(e) => self.fail_pass(handle, e).await,
        }
    }

    async fn create_local(
        &self,
        handle: &ClusterHandle,
        spec: &StorageClusterSpec,
        existing: Option<ObservedClusterInfo>,
    ) -> Result<ObservedClusterInfo> {
        let namespace = handle.namespace();

        let claimed = spec.any_use_all_devices();
        if claimed {
            self.registry.claim_all_devices(namespace)?;
        }

        let policy = self.config.create_policy();
        let request = self.probe_request(handle, spec);
        let cluster_running = existing.is_some();

        let result = poll(&policy, "cluster creation", handle.pass_token(), |attempt| {
            let request = request.clone();
            let previous = existing.clone();
            async move {
                let version = self
                    .gate
                    .detect_and_validate(&request, spec, cluster_running)
                    .await
                    .map_err(|e| {
                        error!(namespace = %namespace, "Failed the engine version check: {}", e);
                        classify(e)
                    })?;

                handle.set_phase(LifecyclePhase::Creating);
                self.set_status(handle, ClusterState::Creating, "").await;
                debug!(namespace = %namespace, "Creation attempt {}", attempt);

                let mut info = self
                    .deployer
                    .deploy(&self.deploy_request(handle, spec, version, previous))
                    .await
                    .map_err(|e| {
                        error!(namespace = %namespace, "Failed to create cluster: {}", e);
                        classify(e)
                    })?;
                info.version = Some(version);
                Ok(info)
            }
        })
        .await;

        result.map_err(|e| {
            if claimed {
                self.registry.release_all_devices(namespace);
            }
            e.into_error("cluster creation", &policy, namespace)
        })
    }

    async fn connect_external(
        &self,
        handle: &ClusterHandle,
        spec: &StorageClusterSpec,
    ) -> Result<ObservedClusterInfo> {
        let namespace = handle.namespace();
        handle.set_phase(LifecyclePhase::Connecting);
        self.set_status(handle, ClusterState::Connecting, "").await;

        let policy = self.config.external_connect_policy();
        let cancel = handle.pass_token();
        let mut info = poll(&policy, "external connection info", cancel, |_| async move {
            self.connection.load(namespace).await.map_err(|e| {
                warn!(
                    namespace = %namespace,
                    "Waiting for the connection info of the external cluster: {}",
                    e
                );
                backoff::Error::transient(e)
            })
        })
        .await
        .map_err(|e| e.into_error("external connection info", &policy, namespace))?;

        info!(
            namespace = %namespace,
            "Found connection info of the external cluster, mons={:?}",
            info.monitors.keys().collect::<Vec<_>>()
        );
        self.connection.write_connection_config(namespace, &info).await?;

        let image_version = self
            .gate
            .detect_and_validate(&self.probe_request(handle, spec), spec, false)
            .await?;
        let running = self.gate.check_external(namespace, &image_version).await?;
        info.version = Some(running);

        self.set_status(handle, ClusterState::Connected, "").await;
        Ok(info)
    }

    async fn complete_initialization(
        &self,
        handle: &ClusterHandle,
        spec: StorageClusterSpec,
        info: ObservedClusterInfo,
    ) {
        let external = spec.is_external();
        let phase = if external {
            LifecyclePhase::Connected
        } else {
            LifecyclePhase::Created
        };
        handle.update(|s| {
            s.spec = spec;
            s.observed = Some(info.clone());
            s.initialized = true;
        });
        if !external {
            self.set_status(handle, ClusterState::Created, "").await;
        }

        self.update_csi(handle, &info).await;
        self.restart_subcontrollers(handle, &info);
        self.health.start(
            handle.namespace(),
            handle.resource_name(),
            &info,
            external,
            handle.cancel_token(),
        );
        self.ensure_finalizer(handle).await;
        handle.set_phase(phase);
        info!(namespace = %handle.namespace(), "Cluster {} is {}", handle.resource_name(), phase);
    }

    // =========================================================================
    // Update
    // =========================================================================

    async fn update(
        &self,
        handle: &ClusterHandle,
        old: &StorageCluster,
        new: &StorageCluster,
    ) -> PassOutcome {
        let namespace = handle.namespace();

        if !handle.is_initialized() {
            info!(namespace = %namespace, "Update event for uninitialized cluster, initializing");
            return self.initialize(handle, new).await;
        }
        if !spec_changed(&old.spec, &new.spec) {
            debug!(namespace = %namespace, "Update event for cluster is not supported");
            return PassOutcome::Skipped;
        }
        info!(
            namespace = %namespace,
            "Update event for cluster is supported, orchestrating update"
        );

        let spec = with_defaults(new.spec.clone(), namespace);
        let Some(mut info) = handle.observed() else {
            return PassOutcome::Skipped;
        };

        // Gate the new image before accepting anything from this revision
        let version_changed = old.spec.engine_version.image != new.spec.engine_version.image;
        if version_changed {
            info!(
                namespace = %namespace,
                "Engine image changed from {} to {}",
                old.spec.engine_version.image,
                new.spec.engine_version.image
            );
            match self.gate_new_image(handle, &spec).await {
                Ok(version) => info.version = Some(version),
                Err(e) => return self.fail_pass(handle, e).await,
            }
        }
        if let Err(e) = self.update_device_claim(handle, &old.spec, &spec) {
            return self.fail_pass(handle, e).await;
        }

        handle.update(|s| s.spec = spec.clone());
        handle.set_phase(LifecyclePhase::Updating);

        let result = if spec.is_external() {
            self.connect_external(handle, &spec).await
        } else {
            self.redeploy_with_retry(handle, &spec, &info).await
        };

        match result {
            Ok(observed) => {
                let phase = if spec.is_external() {
                    LifecyclePhase::Connected
                } else {
                    LifecyclePhase::Created
                };
                handle.update(|s| s.observed = Some(observed.clone()));
                handle.set_phase(phase);
                self.update_csi(handle, &observed).await;

                if version_changed {
                    self.gate.report_running_version(namespace).await;
                    self.restart_subcontrollers(handle, &observed);
                }
                info!(namespace = %namespace, "Succeeded updating cluster");
                PassOutcome::Success
            }
            Err(e) => self.fail_pass(handle, e).await,
        }
    }

    async fn gate_new_image(
        &self,
        handle: &ClusterHandle,
        spec: &StorageClusterSpec,
    ) -> Result<EngineVersion> {
        let version = self
            .gate
            .detect_and_validate(&self.probe_request(handle, spec), spec, false)
            .await?;
        if !spec.is_external() {
            self.gate.check_upgrade(handle.namespace(), &version).await?;
        }
        Ok(version)
    }

    fn update_device_claim(
        &self,
        handle: &ClusterHandle,
        old: &StorageClusterSpec,
        new: &StorageClusterSpec,
    ) -> Result<()> {
        if new.is_external() {
            return Ok(());
        }
        if new.any_use_all_devices() {
            self.registry.claim_all_devices(handle.namespace())?;
        } else if old.any_use_all_devices() {
            self.registry.release_all_devices(handle.namespace());
        }
        Ok(())
    }

    async fn redeploy_with_retry(
        &self,
        handle: &ClusterHandle,
        spec: &StorageClusterSpec,
        info: &ObservedClusterInfo,
    ) -> Result<ObservedClusterInfo> {
        let namespace = handle.namespace();
        let policy = self.config.update_policy();
        let version = info.version.unwrap_or_default();

        let result = poll(&policy, "cluster update", handle.pass_token(), |_| async move {
            self.set_status(handle, ClusterState::Updating, "").await;
            let mut observed = self
                .deployer
                .deploy(&self.deploy_request(handle, spec, version, Some(info.clone())))
                .await
                .map_err(|e| {
                    error!(namespace = %namespace, "Failed to update cluster: {}", e);
                    classify(e)
                })?;
            observed.version = Some(version);
            self.set_status(handle, ClusterState::Created, "").await;
            Ok(observed)
        })
        .await;

        result.map_err(|e| match e {
            PollError::TimedOut { last, attempts } => Error::Deployment {
                namespace: namespace.to_string(),
                reason: format!(
                    "giving up trying to update cluster after {:?} ({} attempts): {}",
                    self.config.update_timeout, attempts, last
                ),
            },
            other => other.into_error("cluster update", &policy, namespace),
        })
    }

    // =========================================================================
    // Hotplug Orchestration
    // =========================================================================

    async fn orchestrate_node(&self, handle: &ClusterHandle, node: &Node) -> PassOutcome {
        let namespace = handle.namespace();
        let hostname = node_hostname(node);
        let state = handle.snapshot();

        let Some(info) = state.observed else {
            info!(
                namespace = %namespace,
                "Cluster is not ready, skipping orchestration for node {}",
                hostname
            );
            return PassOutcome::Skipped;
        };
        if state.spec.is_external() {
            return PassOutcome::Skipped;
        }

        match evaluate_node(node, &state.spec) {
            NodeAdmission::Admitted => {}
            NodeAdmission::NotAllNodes => {
                debug!(
                    namespace = %namespace,
                    "Cluster does not use all nodes, skipping {}",
                    hostname
                );
                return PassOutcome::Skipped;
            }
            NodeAdmission::NotTolerable => {
                debug!(namespace = %namespace, "Node {} is not tolerable for cluster", hostname);
                return PassOutcome::Skipped;
            }
            NodeAdmission::NotValid => {
                info!(namespace = %namespace, "Node {} is not valid for cluster", hostname);
                return PassOutcome::Skipped;
            }
        }

        info!(namespace = %namespace, "Adding node {} to cluster", hostname);
        self.redeploy_once(handle, &state.spec, &info, &format!("node {}", hostname))
            .await
    }

    async fn orchestrate_devices(&self, handle: &ClusterHandle, node: &str) -> PassOutcome {
        let namespace = handle.namespace();
        let state = handle.snapshot();

        let Some(info) = state.observed else {
            info!(
                namespace = %namespace,
                "Cluster is not ready, skipping orchestration on device change"
            );
            return PassOutcome::Skipped;
        };
        if state.spec.is_external() {
            return PassOutcome::Skipped;
        }

        info!(namespace = %namespace, "Running orchestration after device change on node {}", node);
        self.redeploy_once(handle, &state.spec, &info, &format!("devices on {}", node))
            .await
    }

    async fn redeploy_once(
        &self,
        handle: &ClusterHandle,
        spec: &StorageClusterSpec,
        info: &ObservedClusterInfo,
        reason: &str,
    ) -> PassOutcome {
        let namespace = handle.namespace();
        let version = info.version.unwrap_or_default();
        let request = self.deploy_request(handle, spec, version, Some(info.clone()));

        match self.deployer.deploy(&request).await {
            Ok(mut observed) => {
                observed.version = Some(version);
                handle.update(|s| s.observed = Some(observed.clone()));
                self.update_csi(handle, &observed).await;
                info!(namespace = %namespace, "Orchestrated cluster for {}", reason);
                PassOutcome::Success
            }
            Err(e) => {
                error!(namespace = %namespace, "Failed orchestration for {}: {}", reason, e);
                PassOutcome::Failed
            }
        }
    }

    // =========================================================================
    // Deletion
    // =========================================================================

    /// Drain, stop, unregister, then release the finalizer.
    ///
    /// Only the entry registered for this resource is torn down, and only by
    /// the first deletion event that reaches it; later events for the same
    /// entry return at once.
    pub async fn delete(&self, cluster: StorageCluster) {
        let namespace = cluster.namespace_str();
        let registered = self.registry.lookup(namespace);

        let Some(handle) = registered.clone().filter(|h| h.belongs_to(&cluster)) else {
            return self.delete_unregistered(&cluster, registered.is_some()).await;
        };
        if !handle.begin_delete() {
            debug!(
                namespace = %namespace,
                "Deletion of cluster {} already running",
                cluster.name()
            );
            return;
        }
        info!(namespace = %namespace, "Delete event for cluster {}", cluster.name());

        if let DrainOutcome::GaveUp { .. } = self.drain.drain(namespace).await {
            self.metrics.record_drain_give_up();
        }

        if self.registry.release_all_devices(namespace) {
            debug!(namespace = %namespace, "Released all-devices claim");
        }
        self.registry.remove_if(namespace, |current| Arc::ptr_eq(current, &handle));
        handle.cancel_token().cancel();
        handle.set_phase(LifecyclePhase::Removed);
        self.metrics.set_clusters(self.registry.len());

        if let Err(e) = self.csi.remove(namespace).await {
            warn!(namespace = %namespace, "Failed to remove cluster from CSI config: {}", e);
        }

        if cluster.is_being_deleted() {
            self.finalizers.remove(&cluster).await;
        }
        info!(namespace = %namespace, "Cluster {} removed", cluster.name());
    }

    /// Deletion of a resource with no registry entry of its own. Another
    /// cluster occupying the namespace is left alone; otherwise leftovers
    /// are cleaned up and, while the finalizer is still held, attachments
    /// are drained first.
    async fn delete_unregistered(&self, cluster: &StorageCluster, namespace_taken: bool) {
        let namespace = cluster.namespace_str();
        if namespace_taken {
            info!(
                namespace = %namespace,
                "Cluster {} does not own this namespace, only releasing its finalizer",
                cluster.name()
            );
        } else {
            if cluster.is_being_deleted() && self.finalizers.is_held(cluster).await {
                if let DrainOutcome::GaveUp { .. } = self.drain.drain(namespace).await {
                    self.metrics.record_drain_give_up();
                }
            }
            self.registry.release_all_devices(namespace);
            if let Err(e) = self.csi.remove(namespace).await {
                warn!(namespace = %namespace, "Failed to remove cluster from CSI config: {}", e);
            }
        }

        if cluster.is_being_deleted() {
            self.finalizers.remove(cluster).await;
        }
        debug!(namespace = %namespace, "Cluster {} already removed", cluster.name());
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn probe_request(&self, handle: &ClusterHandle, spec: &StorageClusterSpec) -> ProbeRequest {
        ProbeRequest {
            namespace: handle.namespace().to_string(),
            image: spec.engine_version.image.clone(),
            owner: handle.owner(),
        }
    }

    fn deploy_request(
        &self,
        handle: &ClusterHandle,
        spec: &StorageClusterSpec,
        version: EngineVersion,
        previous: Option<ObservedClusterInfo>,
    ) -> DeployRequest {
        DeployRequest {
            namespace: handle.namespace().to_string(),
            resource_name: handle.resource_name().to_string(),
            spec: spec.clone(),
            version,
            owner: handle.owner(),
            previous,
        }
    }

    fn restart_subcontrollers(&self, handle: &ClusterHandle, info: &ObservedClusterInfo) {
        let context = SubControllerContext {
            namespace: handle.namespace().to_string(),
            resource_name: handle.resource_name().to_string(),
            info: info.clone(),
            owner: handle.owner(),
        };
        let tasks = self.subcontrollers.start(context, handle.cancel_token());
        let previous = handle.update(|s| s.subcontrollers.replace(tasks.token));
        if let Some(previous) = previous {
            debug!(namespace = %handle.namespace(), "Restarting sub-controllers");
            previous.cancel();
        }
    }

    async fn update_csi(&self, handle: &ClusterHandle, info: &ObservedClusterInfo) {
        if let Err(e) = self.csi.update(handle.namespace(), &info.monitors).await {
            error!(namespace = %handle.namespace(), "Failed to update CSI cluster config: {}", e);
        }
    }

    async fn ensure_finalizer(&self, handle: &ClusterHandle) {
        if let Err(e) = self
            .finalizers
            .add(handle.namespace(), handle.resource_name())
            .await
        {
            error!(namespace = %handle.namespace(), "Failed to add finalizer to cluster: {}", e);
        }
    }

    /// Log, surface in status and mark the pass failed
    async fn fail_pass(&self, handle: &ClusterHandle, err: Error) -> PassOutcome {
        if let Error::Cancelled { .. } = err {
            debug!(namespace = %handle.namespace(), "Pass cancelled");
            return PassOutcome::Cancelled;
        }
        error!(namespace = %handle.namespace(), "Reconciliation failed: {}", err);
        self.set_status(handle, ClusterState::Error, &err.to_string()).await;
        handle.set_phase(LifecyclePhase::Error);
        PassOutcome::Failed
    }

    /// Write lifecycle state; skipped once passes are cancelled
    async fn set_status(&self, handle: &ClusterHandle, state: ClusterState, message: &str) {
        if handle.pass_token().is_cancelled() {
            debug!(
                namespace = %handle.namespace(),
                "Skipping status {} for cancelled cluster",
                state
            );
            return;
        }
        info!(
            namespace = %handle.namespace(),
            "Cluster {} status: {}. {}",
            handle.resource_name(),
            state,
            message
        );
        if let Err(e) = self
            .store
            .set_state(handle.namespace(), handle.resource_name(), state, message)
            .await
        {
            error!(namespace = %handle.namespace(), "Failed to update cluster status: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::finalizer::FINALIZER;
    use crate::controller::testing::{cluster, node, observed_info, volume, wait_for, Harness};
    use crate::crd::ClusterState;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use std::time::Duration;

    fn marked_for_deletion(mut resource: StorageCluster) -> StorageCluster {
        resource.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        resource
    }

    #[tokio::test]
    async fn test_add_creates_cluster() {
        let h = Harness::new();
        let resource = h.add_cluster(cluster("storage", "primary"));
        let handle = h.reconciler.on_add(resource).unwrap();

        wait_for(|| handle.phase() == LifecyclePhase::Created).await;

        assert_eq!(h.store.state("storage", "primary"), Some(ClusterState::Created));
        assert_eq!(h.store.finalizers("storage", "primary"), vec![FINALIZER.to_string()]);
        assert_eq!(h.deployer.calls(), 1);
        assert!(h.csi.payload().contains(r#""clusterID":"storage""#));

        let state = handle.snapshot();
        assert!(state.initialized);
        assert_eq!(state.spec.mon.count, DEFAULT_MON_COUNT);
        assert_eq!(state.observed.unwrap().version, Some(EngineVersion::new(14, 2, 2, 0)));
        wait_for(|| h.subcontrollers.iter().all(|c| c.runs() == 1)).await;
    }

    #[tokio::test]
    async fn test_unsupported_version_is_not_retried() {
        let h = Harness::new();
        h.probe.set_output("ceph version 12.2.0 luminous");
        let handle = h
            .reconciler
            .on_add(h.add_cluster(cluster("storage", "primary")))
            .unwrap();

        wait_for(|| handle.phase() == LifecyclePhase::Error).await;
        assert_eq!(h.probe.calls(), 1);
        assert_eq!(h.deployer.calls(), 0);
        assert_eq!(h.store.state("storage", "primary"), Some(ClusterState::Error));
        assert!(handle.observed().is_none());
    }

    #[tokio::test]
    async fn test_probe_failures_are_retried() {
        let h = Harness::new();
        h.probe.fail_times(2);
        let handle = h
            .reconciler
            .on_add(h.add_cluster(cluster("storage", "primary")))
            .unwrap();

        wait_for(|| handle.phase() == LifecyclePhase::Created).await;
        assert_eq!(h.probe.calls(), 3);
        assert_eq!(h.deployer.calls(), 1);
    }

    #[tokio::test]
    async fn test_creation_times_out() {
        let mut config = Harness::fast_config();
        config.create_timeout = Duration::from_millis(40);
        let h = Harness::with_config(config);
        h.deployer.fail_times(u32::MAX);

        let handle = h
            .reconciler
            .on_add(h.add_cluster(cluster("storage", "primary")))
            .unwrap();
        wait_for(|| handle.phase() == LifecyclePhase::Error).await;

        assert!(h.deployer.calls() > 1);
        assert!(!handle.is_initialized());
        assert_eq!(h.store.state("storage", "primary"), Some(ClusterState::Error));
    }

    #[tokio::test]
    async fn test_all_devices_exclusive_across_namespaces() {
        let h = Harness::new();
        let mut first = cluster("a", "c");
        first.spec.storage.use_all_devices = Some(true);
        let mut second = cluster("b", "c");
        second.spec.storage.use_all_devices = Some(true);

        let a = h.reconciler.on_add(h.add_cluster(first)).unwrap();
        wait_for(|| a.phase() == LifecyclePhase::Created).await;

        let b = h.reconciler.on_add(h.add_cluster(second)).unwrap();
        wait_for(|| b.phase() == LifecyclePhase::Error).await;

        assert_eq!(h.deployer.calls(), 1);
        assert!(h.store.message("b", "c").contains("all devices"));
        assert_eq!(h.reconciler.registry().all_devices_holder().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_external_cluster_connects() {
        let h = Harness::new();
        h.connection.unavailable_times(2);
        let mut resource = cluster("storage", "external");
        resource.spec.external.enable = true;

        let handle = h.reconciler.on_add(h.add_cluster(resource)).unwrap();
        wait_for(|| handle.phase() == LifecyclePhase::Connected).await;

        assert_eq!(h.connection.loads(), 3);
        assert_eq!(h.connection.written(), vec!["storage".to_string()]);
        assert_eq!(h.deployer.calls(), 0);
        assert_eq!(h.store.state("storage", "external"), Some(ClusterState::Connected));
    }

    #[tokio::test]
    async fn test_external_version_mismatch_is_fatal() {
        let h = Harness::new();
        h.inspector.set_mon_version("14.2.1");
        let mut resource = cluster("storage", "external");
        resource.spec.external.enable = true;

        let handle = h.reconciler.on_add(h.add_cluster(resource)).unwrap();
        wait_for(|| handle.phase() == LifecyclePhase::Error).await;

        assert!(h.store.message("storage", "external").contains("must match"));
        assert!(handle.observed().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_add_rejected() {
        let h = Harness::new();
        let handle = h
            .reconciler
            .on_add(h.add_cluster(cluster("storage", "primary")))
            .unwrap();
        assert!(h.reconciler.on_add(cluster("storage", "secondary")).is_err());

        wait_for(|| handle.phase() == LifecyclePhase::Created).await;
        assert_eq!(
            h.reconciler.registry().lookup("storage").unwrap().resource_name(),
            "primary"
        );
    }

    #[tokio::test]
    async fn test_update_without_change_is_skipped() {
        let h = Harness::new();
        let resource = h.add_cluster(cluster("storage", "primary"));
        let handle = h.reconciler.on_add(resource.clone()).unwrap();
        wait_for(|| handle.phase() == LifecyclePhase::Created).await;

        h.reconciler.on_update(resource.clone(), resource.clone());
        let mut changed = resource.clone();
        changed.spec.mon.count = 5;
        h.reconciler.on_update(resource, changed);

        wait_for(|| h.deployer.calls() == 2).await;
        wait_for(|| h.store.state("storage", "primary") == Some(ClusterState::Created)).await;
        assert_eq!(handle.spec().mon.count, 5);
    }

    #[tokio::test]
    async fn test_upgrade_refused_when_unhealthy() {
        let h = Harness::new();
        let resource = h.add_cluster(cluster("storage", "primary"));
        let handle = h.reconciler.on_add(resource.clone()).unwrap();
        wait_for(|| handle.phase() == LifecyclePhase::Created).await;

        h.inspector.set_running(&["ceph version 14.2.2 (abc) nautilus (stable)"]);
        h.inspector.set_health("HEALTH_WARN", &[("MON_DOWN", "1/3 mons down")]);
        h.probe.set_output("ceph version 14.2.4 (def) nautilus (stable)");

        let mut upgraded = resource.clone();
        upgraded.spec.engine_version.image = "ceph/ceph:v14.2.4".into();
        h.reconciler.on_update(resource, upgraded);

        wait_for(|| handle.phase() == LifecyclePhase::Error).await;
        assert_eq!(h.deployer.calls(), 1);
        assert_eq!(handle.spec().engine_version.image, "ceph/ceph:v14.2.2");
        assert_eq!(
            handle.observed().unwrap().version,
            Some(EngineVersion::new(14, 2, 2, 0))
        );
    }

    #[tokio::test]
    async fn test_upgrade_restarts_subcontrollers() {
        let h = Harness::new();
        let resource = h.add_cluster(cluster("storage", "primary"));
        let handle = h.reconciler.on_add(resource.clone()).unwrap();
        wait_for(|| handle.phase() == LifecyclePhase::Created).await;

        h.inspector.set_running(&["ceph version 14.2.2 (abc) nautilus (stable)"]);
        h.probe.set_output("ceph version 14.2.4 (def) nautilus (stable)");
        let mut upgraded = resource.clone();
        upgraded.spec.engine_version.image = "ceph/ceph:v14.2.4".into();
        h.reconciler.on_update(resource, upgraded);

        wait_for(|| h.deployer.calls() == 2).await;
        wait_for(|| {
            handle.observed().and_then(|i| i.version) == Some(EngineVersion::new(14, 2, 4, 0))
        })
        .await;
        wait_for(|| h.subcontrollers.iter().all(|c| c.runs() == 2 && c.running() == 1)).await;
    }

    #[tokio::test]
    async fn test_restart_refuses_upgrade_of_unhealthy_cluster() {
        let h = Harness::new();
        h.connection.set_existing(Some(observed_info()));
        h.inspector.set_running(&["ceph version 14.2.2 (abc) nautilus (stable)"]);
        h.inspector.set_health("HEALTH_WARN", &[("MON_DOWN", "1/3 mons down")]);
        h.probe.set_output("ceph version 14.2.4 (def) nautilus (stable)");
        let mut resource = cluster("storage", "primary");
        resource.spec.engine_version.image = "ceph/ceph:v14.2.4".into();

        let handle = h.reconciler.on_add(h.add_cluster(resource)).unwrap();
        wait_for(|| handle.phase() == LifecyclePhase::Error).await;

        assert_eq!(h.connection.written(), vec!["storage".to_string()]);
        assert_eq!(h.probe.calls(), 1);
        assert_eq!(h.deployer.calls(), 0);
        assert_eq!(h.store.state("storage", "primary"), Some(ClusterState::Error));
        assert!(h.store.message("storage", "primary").contains("MON_DOWN"));
        assert!(!handle.is_initialized());
    }

    #[tokio::test]
    async fn test_restart_upgrades_healthy_cluster() {
        let h = Harness::new();
        h.connection.set_existing(Some(observed_info()));
        h.inspector.set_running(&["ceph version 14.2.2 (abc) nautilus (stable)"]);
        h.probe.set_output("ceph version 14.2.4 (def) nautilus (stable)");
        let mut resource = cluster("storage", "primary");
        resource.spec.engine_version.image = "ceph/ceph:v14.2.4".into();

        let handle = h.reconciler.on_add(h.add_cluster(resource)).unwrap();
        wait_for(|| handle.phase() == LifecyclePhase::Created).await;

        assert_eq!(h.connection.written(), vec!["storage".to_string()]);
        assert_eq!(h.deployer.calls(), 1);
        assert_eq!(h.store.state("storage", "primary"), Some(ClusterState::Created));
        assert_eq!(
            handle.observed().unwrap().version,
            Some(EngineVersion::new(14, 2, 4, 0))
        );
    }

    #[tokio::test]
    async fn test_update_of_uninitialized_cluster_reinitializes() {
        let h = Harness::new();
        h.probe.set_output("garbage");
        let resource = h.add_cluster(cluster("storage", "primary"));
        let handle = h.reconciler.on_add(resource.clone()).unwrap();
        wait_for(|| handle.phase() == LifecyclePhase::Error).await;

        h.probe.set_output("ceph version 14.2.2 (abc) nautilus (stable)");
        h.reconciler.on_update(resource.clone(), resource);
        wait_for(|| handle.phase() == LifecyclePhase::Created).await;
        assert!(handle.is_initialized());
    }

    #[tokio::test]
    async fn test_delete_gives_up_on_drain_and_completes() {
        let h = Harness::new();
        h.attachments.set(vec![volume("pvc-1", "storage")]);
        let resource = h.add_cluster(cluster("storage", "primary"));
        let handle = h.reconciler.on_add(resource.clone()).unwrap();
        wait_for(|| handle.phase() == LifecyclePhase::Created).await;

        let deleting = marked_for_deletion(h.store.get_cluster("storage", "primary"));
        let task = h.reconciler.on_update(resource, deleting).unwrap();
        task.await.unwrap();

        assert_eq!(h.attachments.list_calls(), h.reconciler.config().drain_max_retries);
        assert!(handle.is_cancelled());
        assert_eq!(handle.phase(), LifecyclePhase::Removed);
        assert!(h.reconciler.registry().lookup("storage").is_none());
        assert!(h.store.finalizers("storage", "primary").is_empty());
        assert!(!h.csi.payload().contains("storage"));
        wait_for(|| h.subcontrollers.iter().all(|c| c.running() == 0)).await;
    }

    #[tokio::test]
    async fn test_delete_aborts_inflight_creation() {
        let h = Harness::new();
        h.deployer.fail_times(u32::MAX);
        let resource = h.add_cluster(cluster("storage", "primary"));
        let handle = h.reconciler.on_add(resource.clone()).unwrap();
        wait_for(|| h.deployer.calls() > 0).await;

        h.reconciler.on_delete(resource).unwrap().await.unwrap();
        assert!(handle.is_cancelled());

        let calls = h.deployer.calls();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(h.deployer.calls(), calls);
    }

    #[tokio::test]
    async fn test_passes_stop_while_deletion_drains() {
        let mut config = Harness::fast_config();
        config.drain_interval = Duration::from_millis(10);
        let h = Harness::with_config(config);
        h.deployer.fail_times(u32::MAX);
        h.attachments.set(vec![volume("pvc-1", "storage")]);
        let resource = h.add_cluster(cluster("storage", "primary"));
        let handle = h.reconciler.on_add(resource.clone()).unwrap();
        wait_for(|| h.deployer.calls() > 0).await;

        let task = h.reconciler.on_delete(resource).unwrap();
        wait_for(|| handle.phase() == LifecyclePhase::Deleting).await;
        let calls = h.deployer.calls();
        assert!(!handle.is_cancelled());
        assert_eq!(h.reconciler.on_devices_changed("n1"), 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.phase(), LifecyclePhase::Deleting);
        assert_eq!(h.deployer.calls(), calls);
        assert_eq!(h.store.state("storage", "primary"), Some(ClusterState::Creating));

        task.await.unwrap();
        assert!(handle.is_cancelled());
        assert_eq!(handle.phase(), LifecyclePhase::Removed);
        assert_eq!(h.deployer.calls(), calls);
    }

    #[tokio::test]
    async fn test_repeated_deletion_leaves_replacement_running() {
        let h = Harness::new();
        h.attachments.set(vec![volume("pvc-1", "storage")]);
        let resource = h.add_cluster(cluster("storage", "primary"));
        let handle = h.reconciler.on_add(resource.clone()).unwrap();
        wait_for(|| handle.phase() == LifecyclePhase::Created).await;

        let deleting = marked_for_deletion(h.store.get_cluster("storage", "primary"));
        let first = h.reconciler.on_update(resource.clone(), deleting.clone()).unwrap();
        let second = h.reconciler.on_update(resource.clone(), deleting.clone()).unwrap();
        first.await.unwrap();
        second.await.unwrap();

        let drains = h.reconciler.config().drain_max_retries;
        assert_eq!(h.attachments.list_calls(), drains);
        assert_eq!(handle.phase(), LifecyclePhase::Removed);
        assert!(h.reconciler.registry().lookup("storage").is_none());

        // same name, new object
        let mut recreated = cluster("storage", "primary");
        recreated.metadata.uid = Some("uid-recreated".into());
        let current = h.reconciler.on_add(h.add_cluster(recreated)).unwrap();
        wait_for(|| current.phase() == LifecyclePhase::Created).await;

        let late = h.reconciler.on_update(resource, deleting).unwrap();
        late.await.unwrap();

        assert!(!current.is_cancelled());
        assert_eq!(current.phase(), LifecyclePhase::Created);
        let registered = h.reconciler.registry().lookup("storage").unwrap();
        assert!(Arc::ptr_eq(&registered, &current));
        assert_eq!(h.attachments.list_calls(), drains);
        assert_eq!(h.store.finalizers("storage", "primary"), vec![FINALIZER.to_string()]);
        assert!(h.csi.payload().contains(r#""clusterID":"storage""#));
    }

    #[tokio::test]
    async fn test_node_admitted_only_for_all_nodes_clusters() {
        let h = Harness::new();
        let mut all_nodes = cluster("a", "c");
        all_nodes.spec.storage.use_all_nodes = true;
        let a = h.reconciler.on_add(h.add_cluster(all_nodes)).unwrap();
        let b = h
            .reconciler
            .on_add(h.add_cluster(cluster("b", "c")))
            .unwrap();
        wait_for(|| a.phase() == LifecyclePhase::Created && b.phase() == LifecyclePhase::Created)
            .await;

        assert_eq!(h.reconciler.on_node(&node("n1", true)), 2);
        wait_for(|| h.deployer.calls_for("a") == 2).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.deployer.calls_for("b"), 1);
    }

    #[tokio::test]
    async fn test_stop_all_cancels_clusters() {
        let h = Harness::new();
        let handle = h
            .reconciler
            .on_add(h.add_cluster(cluster("storage", "primary")))
            .unwrap();
        wait_for(|| handle.phase() == LifecyclePhase::Created).await;

        h.reconciler.stop_all();
        assert!(handle.is_cancelled());
        assert!(h.reconciler.registry().is_empty());
        wait_for(|| h.subcontrollers.iter().all(|c| c.running() == 0)).await;
    }
}
