//! In-memory fakes of every port plus resource fixtures for controller tests.

use crate::controller::admission::HOSTNAME_LABEL;
use crate::controller::config::ControllerConfig;
use crate::controller::events::DISCOVERY_NODE_LABEL;
use crate::controller::metrics::ControllerMetrics;
use crate::controller::reconciler::{Reconciler, ReconcilerDeps};
use crate::controller::registry::ClusterRegistry;
use crate::crd::{
    Attachment, ClusterState, EngineHealthStatus, EngineVersionSpec, StorageCluster,
    StorageClusterSpec, Volume, VolumeSpec,
};
use crate::domain::{
    AttachmentSource, ClusterDeployer, ClusterStore, ConnectionInfoSource, CsiConfigStore,
    DaemonInspector, DaemonVersions, DeployRequest, EngineHealth, EngineVersion,
    ImageVersionProbe, MonInfo, ObservedClusterInfo, OsdSummary, ProbeRequest, QuorumStatus,
    SubController, SubControllerContext, SubControllerRef, DEVICES_DATA_KEY,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Node, NodeCondition, NodeSpec, NodeStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Fixtures
// =============================================================================

pub fn cluster(namespace: &str, name: &str) -> StorageCluster {
    let mut cluster = StorageCluster::new(
        name,
        StorageClusterSpec {
            engine_version: EngineVersionSpec {
                image: "ceph/ceph:v14.2.2".into(),
                allow_unsupported: false,
            },
            ..Default::default()
        },
    );
    cluster.metadata.namespace = Some(namespace.into());
    cluster.metadata.uid = Some(format!("uid-{}-{}", namespace, name));
    cluster
}

/// Ready node carrying its hostname label
pub fn node(name: &str, schedulable: bool) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.into()),
            labels: Some(BTreeMap::from([(HOSTNAME_LABEL.to_string(), name.to_string())])),
            ..Default::default()
        },
        spec: Some(NodeSpec {
            unschedulable: Some(!schedulable),
            ..Default::default()
        }),
        status: Some(NodeStatus {
            conditions: Some(vec![NodeCondition {
                type_: "Ready".into(),
                status: "True".into(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

/// Attachment record in the operator namespace served by `cluster_namespace`
pub fn volume(name: &str, cluster_namespace: &str) -> Volume {
    let mut volume = Volume::new(
        name,
        VolumeSpec {
            attachments: vec![Attachment {
                node: "node-a".into(),
                pod_namespace: "apps".into(),
                pod_name: "web-0".into(),
                cluster_name: cluster_namespace.into(),
                ..Default::default()
            }],
        },
    );
    volume.metadata.namespace = Some("storage-system".into());
    volume
}

pub fn devices_config_map(node: &str, devices: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(format!("local-device-{}", node)),
            labels: Some(BTreeMap::from([(
                DISCOVERY_NODE_LABEL.to_string(),
                node.to_string(),
            )])),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            DEVICES_DATA_KEY.to_string(),
            devices.to_string(),
        )])),
        ..Default::default()
    }
}

/// Three monitors on 14.2.2
pub fn observed_info() -> ObservedClusterInfo {
    let monitors = [("a", "10.0.0.1:6789"), ("b", "10.0.0.2:6789"), ("c", "10.0.0.3:6789")]
        .into_iter()
        .map(|(name, endpoint)| (name.to_string(), MonInfo::new(name, endpoint)))
        .collect();
    ObservedClusterInfo {
        fsid: "5a2c0b1e-7f3d-4b8e-9c61-0d2e4f6a8b10".into(),
        admin_secret: "AQBvaBFZAAAAABAA".into(),
        monitors,
        version: Some(EngineVersion::new(14, 2, 2, 0)),
    }
}

fn version_output(version: &str) -> String {
    format!("ceph version {} (0123456789abcdef) nautilus (stable)", version)
}

/// Poll `condition` until it holds, failing the test after five seconds
pub async fn wait_for(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not met within 5s");
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

fn injected(what: &str) -> Error {
    Error::Internal(format!("injected {} failure", what))
}

// =============================================================================
// Cluster Store
// =============================================================================

/// Keeps a resource version per object, bumped on every write. Finalizer
/// writes pinned to an older version fail with 409 Conflict.
#[derive(Default)]
pub struct FakeStore {
    clusters: Mutex<HashMap<(String, String), StorageCluster>>,
    finalizer_writes: AtomicU32,
    fail_finalizers: AtomicBool,
    /// Finalizer another writer adds just ahead of the next finalizer write
    interleaved: Mutex<Option<String>>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, mut cluster: StorageCluster) {
        let key = (cluster.namespace_str().to_string(), cluster.name().to_string());
        cluster.metadata.resource_version.get_or_insert_with(|| "1".to_string());
        self.clusters.lock().insert(key, cluster);
    }

    /// Change a stored object as another writer would
    pub fn modify(&self, namespace: &str, name: &str, f: impl FnOnce(&mut StorageCluster)) {
        self.write_cluster(namespace, name, f)
            .unwrap_or_else(|e| panic!("{}", e));
    }

    /// Let another writer add `finalizer` right before the next finalizer write
    pub fn interleave_finalizer(&self, finalizer: &str) {
        *self.interleaved.lock() = Some(finalizer.to_string());
    }

    pub fn get_cluster(&self, namespace: &str, name: &str) -> StorageCluster {
        self.clusters
            .lock()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .unwrap_or_else(|| panic!("no cluster {}/{}", namespace, name))
    }

    pub fn finalizers(&self, namespace: &str, name: &str) -> Vec<String> {
        self.get_cluster(namespace, name)
            .metadata
            .finalizers
            .unwrap_or_default()
    }

    pub fn finalizer_writes(&self) -> u32 {
        self.finalizer_writes.load(Ordering::SeqCst)
    }

    pub fn fail_finalizer_writes(&self, fail: bool) {
        self.fail_finalizers.store(fail, Ordering::SeqCst);
    }

    pub fn state(&self, namespace: &str, name: &str) -> Option<ClusterState> {
        self.get_cluster(namespace, name).status.and_then(|s| s.state)
    }

    pub fn message(&self, namespace: &str, name: &str) -> String {
        self.get_cluster(namespace, name)
            .status
            .map(|s| s.message)
            .unwrap_or_default()
    }

    pub fn get_health(&self, namespace: &str, name: &str) -> Option<EngineHealthStatus> {
        self.get_cluster(namespace, name).status.and_then(|s| s.engine)
    }

    fn with_cluster<R>(
        &self,
        namespace: &str,
        name: &str,
        f: impl FnOnce(&mut StorageCluster) -> R,
    ) -> Result<R> {
        let mut clusters = self.clusters.lock();
        let cluster = clusters
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "StorageCluster".into(),
                name: format!("{}/{}", namespace, name),
            })?;
        Ok(f(cluster))
    }

    /// Write through `f` and bump the resource version
    fn write_cluster<R>(
        &self,
        namespace: &str,
        name: &str,
        f: impl FnOnce(&mut StorageCluster) -> R,
    ) -> Result<R> {
        self.with_cluster(namespace, name, |cluster| {
            let result = f(cluster);
            let version = cluster
                .metadata
                .resource_version
                .as_deref()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0);
            cluster.metadata.resource_version = Some((version + 1).to_string());
            result
        })
    }
}

fn conflict(name: &str) -> Error {
    Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".into(),
        message: format!("the object {} has been modified", name),
        reason: "Conflict".into(),
        code: 409,
    }))
}

#[async_trait]
impl ClusterStore for FakeStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<StorageCluster> {
        self.with_cluster(namespace, name, |c| c.clone())
    }

    async fn set_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
        resource_version: Option<&str>,
    ) -> Result<()> {
        self.finalizer_writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_finalizers.load(Ordering::SeqCst) {
            return Err(injected("finalizer write"));
        }
        if let Some(other) = self.interleaved.lock().take() {
            self.write_cluster(namespace, name, |c| {
                c.metadata.finalizers.get_or_insert_with(Vec::new).push(other)
            })?;
        }

        let current =
            self.with_cluster(namespace, name, |c| c.metadata.resource_version.clone())?;
        if resource_version.is_some_and(|v| current.as_deref() != Some(v)) {
            return Err(conflict(name));
        }
        self.write_cluster(namespace, name, |c| c.metadata.finalizers = Some(finalizers))
    }

    async fn set_state(
        &self,
        namespace: &str,
        name: &str,
        state: ClusterState,
        message: &str,
    ) -> Result<()> {
        self.write_cluster(namespace, name, |c| {
            let status = c.status.get_or_insert_with(Default::default);
            status.state = Some(state);
            status.message = message.to_string();
        })
    }

    async fn set_engine_health(
        &self,
        namespace: &str,
        name: &str,
        health: EngineHealthStatus,
    ) -> Result<()> {
        self.write_cluster(namespace, name, |c| {
            c.status.get_or_insert_with(Default::default).engine = Some(health);
        })
    }
}

// =============================================================================
// Version Probe
// =============================================================================

pub struct FakeProbe {
    output: Mutex<String>,
    always_fail: Option<String>,
    fail_remaining: Mutex<u32>,
    hang: bool,
    calls: AtomicU32,
}

impl FakeProbe {
    fn with(output: String, always_fail: Option<String>, hang: bool) -> Self {
        Self {
            output: Mutex::new(output),
            always_fail,
            fail_remaining: Mutex::new(0),
            hang,
            calls: AtomicU32::new(0),
        }
    }

    pub fn version(version: &str) -> Self {
        Self::with(version_output(version), None, false)
    }

    pub fn failing(message: &str) -> Self {
        Self::with(String::new(), Some(message.to_string()), false)
    }

    /// Never answers
    pub fn hanging() -> Self {
        Self::with(String::new(), None, true)
    }

    pub fn set_output(&self, output: &str) {
        *self.output.lock() = output.to_string();
    }

    /// Fail the next `n` probes
    pub fn fail_times(&self, n: u32) {
        *self.fail_remaining.lock() = n;
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageVersionProbe for FakeProbe {
    async fn probe(&self, request: &ProbeRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang {
            std::future::pending::<()>().await;
        }
        if let Some(message) = &self.always_fail {
            return Err(Error::CommandFailed {
                command: format!("probe {}", request.image),
                reason: message.clone(),
            });
        }
        {
            let mut remaining = self.fail_remaining.lock();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(injected("probe"));
            }
        }
        Ok(self.output.lock().clone())
    }
}

// =============================================================================
// Daemon Inspector
// =============================================================================

pub struct FakeInspector {
    mon_version: Mutex<String>,
    running: Mutex<Vec<String>>,
    health: Mutex<EngineHealth>,
    fail_quorum: AtomicBool,
}

impl FakeInspector {
    /// Every daemon on `version`, HEALTH_OK
    pub fn healthy(version: &str) -> Self {
        Self {
            mon_version: Mutex::new(version.to_string()),
            running: Mutex::new(vec![version_output(version)]),
            health: Mutex::new(EngineHealth {
                status: EngineHealth::OK.to_string(),
                checks: BTreeMap::new(),
            }),
            fail_quorum: AtomicBool::new(false),
        }
    }

    pub fn set_health(&self, status: &str, checks: &[(&str, &str)]) {
        *self.health.lock() = EngineHealth {
            status: status.to_string(),
            checks: checks
                .iter()
                .map(|(name, summary)| (name.to_string(), summary.to_string()))
                .collect(),
        };
    }

    pub fn set_mon_version(&self, version: &str) {
        *self.mon_version.lock() = version.to_string();
    }

    /// Raw version strings of the running daemons
    pub fn set_running(&self, versions: &[&str]) {
        *self.running.lock() = versions.iter().map(|v| v.to_string()).collect();
    }

    pub fn fail_quorum(&self, fail: bool) {
        self.fail_quorum.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl DaemonInspector for FakeInspector {
    async fn mon_version(&self, _namespace: &str) -> Result<EngineVersion> {
        EngineVersion::extract(&self.mon_version.lock())
    }

    async fn daemon_versions(&self, _namespace: &str) -> Result<DaemonVersions> {
        let overall = self.running.lock().iter().map(|v| (v.clone(), 3)).collect();
        Ok(DaemonVersions {
            overall,
            ..Default::default()
        })
    }

    async fn health(&self, _namespace: &str) -> Result<EngineHealth> {
        Ok(self.health.lock().clone())
    }

    async fn quorum_status(&self, _namespace: &str) -> Result<QuorumStatus> {
        if self.fail_quorum.load(Ordering::SeqCst) {
            return Err(injected("quorum"));
        }
        Ok(QuorumStatus {
            quorum_names: vec!["a".into(), "b".into(), "c".into()],
            leader: Some("a".into()),
        })
    }

    async fn osd_summary(&self, _namespace: &str) -> Result<OsdSummary> {
        Ok(OsdSummary {
            total: 3,
            up: 3,
            in_cluster: 3,
        })
    }
}

// =============================================================================
// Deployer
// =============================================================================

#[derive(Default)]
pub struct FakeDeployer {
    calls: Mutex<Vec<String>>,
    fail_remaining: Mutex<u32>,
}

impl FakeDeployer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_times(&self, n: u32) {
        *self.fail_remaining.lock() = n;
    }

    pub fn calls(&self) -> u32 {
        self.calls.lock().len() as u32
    }

    pub fn calls_for(&self, namespace: &str) -> u32 {
        self.calls.lock().iter().filter(|ns| *ns == namespace).count() as u32
    }
}

#[async_trait]
impl ClusterDeployer for FakeDeployer {
    async fn deploy(&self, request: &DeployRequest) -> Result<ObservedClusterInfo> {
        self.calls.lock().push(request.namespace.clone());
        {
            let mut remaining = self.fail_remaining.lock();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::Deployment {
                    namespace: request.namespace.clone(),
                    reason: "mons not ready".into(),
                });
            }
        }
        Ok(ObservedClusterInfo {
            version: None,
            ..observed_info()
        })
    }
}

// =============================================================================
// External Connection
// =============================================================================

#[derive(Default)]
pub struct FakeConnection {
    unavailable: Mutex<u32>,
    loads: AtomicU32,
    existing: Mutex<Option<ObservedClusterInfo>>,
    written: Mutex<Vec<String>>,
}

impl FakeConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` loads find nothing
    pub fn unavailable_times(&self, n: u32) {
        *self.unavailable.lock() = n;
    }

    pub fn set_existing(&self, info: Option<ObservedClusterInfo>) {
        *self.existing.lock() = info;
    }

    pub fn loads(&self) -> u32 {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn written(&self) -> Vec<String> {
        self.written.lock().clone()
    }
}

#[async_trait]
impl ConnectionInfoSource for FakeConnection {
    async fn load(&self, namespace: &str) -> Result<ObservedClusterInfo> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let mut unavailable = self.unavailable.lock();
        if *unavailable > 0 {
            *unavailable -= 1;
            return Err(Error::ExternalConnection {
                namespace: namespace.to_string(),
                reason: "secret not found".into(),
            });
        }
        Ok(ObservedClusterInfo {
            version: None,
            ..observed_info()
        })
    }

    async fn load_existing(&self, _namespace: &str) -> Result<Option<ObservedClusterInfo>> {
        Ok(self.existing.lock().clone())
    }

    async fn write_connection_config(
        &self,
        namespace: &str,
        _info: &ObservedClusterInfo,
    ) -> Result<()> {
        self.written.lock().push(namespace.to_string());
        Ok(())
    }
}

// =============================================================================
// Volume Attachments
// =============================================================================

#[derive(Default)]
pub struct FakeAttachments {
    volumes: Mutex<Vec<Volume>>,
    failing: bool,
    release_after: Mutex<Option<u32>>,
    calls: AtomicU32,
    last_namespace: Mutex<Option<String>>,
}

impl FakeAttachments {
    pub fn new(volumes: Vec<Volume>) -> Self {
        Self {
            volumes: Mutex::new(volumes),
            ..Default::default()
        }
    }

    /// Every list call fails
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Default::default()
        }
    }

    /// Report no volumes once `n` list calls have been served
    pub fn release_after(&self, n: u32) {
        *self.release_after.lock() = Some(n);
    }

    pub fn set(&self, volumes: Vec<Volume>) {
        *self.volumes.lock() = volumes;
    }

    pub fn list_calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_namespace(&self) -> Option<String> {
        self.last_namespace.lock().clone()
    }
}

#[async_trait]
impl AttachmentSource for FakeAttachments {
    async fn list(&self, operator_namespace: &str) -> Result<Vec<Volume>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        *self.last_namespace.lock() = Some(operator_namespace.to_string());
        if self.failing {
            return Err(injected("list"));
        }
        if self.release_after.lock().is_some_and(|n| call > n) {
            return Ok(Vec::new());
        }
        Ok(self.volumes.lock().clone())
    }
}

// =============================================================================
// CSI Config
// =============================================================================

pub struct FakeCsiStore {
    payload: Mutex<String>,
    saves: AtomicU32,
}

impl FakeCsiStore {
    pub fn new(initial: &str) -> Self {
        Self {
            payload: Mutex::new(initial.to_string()),
            saves: AtomicU32::new(0),
        }
    }

    pub fn payload(&self) -> String {
        self.payload.lock().clone()
    }

    pub fn saves(&self) -> u32 {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CsiConfigStore for FakeCsiStore {
    async fn load(&self) -> Result<String> {
        Ok(self.payload())
    }

    async fn save(&self, payload: String) -> Result<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        *self.payload.lock() = payload;
        Ok(())
    }
}

// =============================================================================
// Sub-Controllers
// =============================================================================

pub struct FakeSubController {
    kind: &'static str,
    runs: AtomicU32,
    running: AtomicU32,
}

impl FakeSubController {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            runs: AtomicU32::new(0),
            running: AtomicU32::new(0),
        }
    }

    /// Times the controller was started
    pub fn runs(&self) -> u32 {
        self.runs.load(Ordering::SeqCst)
    }

    /// Instances currently running
    pub fn running(&self) -> u32 {
        self.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SubController for FakeSubController {
    fn kind(&self) -> &'static str {
        self.kind
    }

    async fn run(&self, _context: SubControllerContext, cancel: CancellationToken) -> Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.running.fetch_add(1, Ordering::SeqCst);
        cancel.cancelled().await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// Harness
// =============================================================================

/// A reconciler wired to fakes, with fast polling intervals
pub struct Harness {
    pub reconciler: Arc<Reconciler>,
    pub store: Arc<FakeStore>,
    pub probe: Arc<FakeProbe>,
    pub deployer: Arc<FakeDeployer>,
    pub connection: Arc<FakeConnection>,
    pub inspector: Arc<FakeInspector>,
    pub attachments: Arc<FakeAttachments>,
    pub csi: Arc<FakeCsiStore>,
    pub subcontrollers: Vec<Arc<FakeSubController>>,
    pub metrics: ControllerMetrics,
}

impl Harness {
    pub fn fast_config() -> ControllerConfig {
        ControllerConfig {
            create_interval: Duration::from_millis(1),
            create_timeout: Duration::from_secs(5),
            update_interval: Duration::from_millis(1),
            update_timeout: Duration::from_secs(5),
            external_connect_interval: Duration::from_millis(1),
            version_probe_timeout: Duration::from_secs(1),
            drain_interval: Duration::from_millis(1),
            finalizer_retry_interval: Duration::from_millis(1),
            mon_health_interval: Duration::from_secs(3600),
            osd_health_interval: Duration::from_secs(3600),
            status_interval: Duration::from_secs(3600),
            ..Default::default()
        }
    }

    pub fn new() -> Self {
        Self::with_config(Self::fast_config())
    }

    pub fn with_config(config: ControllerConfig) -> Self {
        let store = Arc::new(FakeStore::new());
        let probe = Arc::new(FakeProbe::version("14.2.2"));
        let deployer = Arc::new(FakeDeployer::new());
        let connection = Arc::new(FakeConnection::new());
        let inspector = Arc::new(FakeInspector::healthy("14.2.2"));
        let attachments = Arc::new(FakeAttachments::new(Vec::new()));
        let csi = Arc::new(FakeCsiStore::new(""));
        let subcontrollers: Vec<Arc<FakeSubController>> = ["pool", "objectstore", "filesystem"]
            .into_iter()
            .map(|kind| Arc::new(FakeSubController::new(kind)))
            .collect();
        let metrics = ControllerMetrics::new().unwrap();

        let deps = ReconcilerDeps {
            store: store.clone(),
            probe: probe.clone(),
            deployer: deployer.clone(),
            connection: connection.clone(),
            inspector: inspector.clone(),
            attachments: attachments.clone(),
            csi_store: csi.clone(),
            subcontrollers: subcontrollers
                .iter()
                .map(|c| c.clone() as SubControllerRef)
                .collect(),
            added_hook: None,
        };
        let reconciler = Arc::new(Reconciler::new(
            config,
            Arc::new(ClusterRegistry::new()),
            deps,
            metrics.clone(),
        ));

        Self {
            reconciler,
            store,
            probe,
            deployer,
            connection,
            inspector,
            attachments,
            csi,
            subcontrollers,
            metrics,
        }
    }

    /// Store the resource so status and finalizer writes land, and hand it back
    pub fn add_cluster(&self, cluster: StorageCluster) -> StorageCluster {
        self.store.insert(cluster.clone());
        cluster
    }
}
