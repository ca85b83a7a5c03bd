//! Sub-Controller and Health Supervision
//!
//! Once a cluster is created or connected, its sub-controllers and health
//! loops are spawned with the cluster's cancellation token. Sub-controllers
//! run on a child token so they can be restarted after an upgrade without
//! touching the health loops.

use crate::controller::metrics::ControllerMetrics;
use crate::crd::EngineHealthStatus;
use crate::domain::{
    ClusterStoreRef, DaemonInspectorRef, ObservedClusterInfo, SubControllerContext,
    SubControllerRef,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// Sub-Controllers
// =============================================================================

/// Tasks of one sub-controller generation
pub struct SupervisedTasks {
    /// Fires to stop this generation only
    pub token: CancellationToken,
    pub handles: Vec<JoinHandle<()>>,
}

pub struct SubControllerSupervisor {
    controllers: Vec<SubControllerRef>,
}

impl SubControllerSupervisor {
    pub fn new(controllers: Vec<SubControllerRef>) -> Self {
        Self { controllers }
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.controllers.iter().map(|c| c.kind()).collect()
    }

    /// Spawn every sub-controller on a child of `cluster_cancel`
    pub fn start(
        &self,
        context: SubControllerContext,
        cluster_cancel: &CancellationToken,
    ) -> SupervisedTasks {
        let token = cluster_cancel.child_token();
        let handles = self
            .controllers
            .iter()
            .map(|controller| {
                let controller = controller.clone();
                let context = context.clone();
                let token = token.clone();
                tokio::spawn(async move {
                    let namespace = context.namespace.clone();
                    let kind = controller.kind();
                    info!(namespace = %namespace, "Starting {} controller", kind);
                    if let Err(e) = controller.run(context, token).await {
                        error!(
                            namespace = %namespace,
                            "{} controller stopped with error: {}",
                            kind,
                            e
                        );
                    } else {
                        debug!(namespace = %namespace, "{} controller stopped", kind);
                    }
                })
            })
            .collect();

        SupervisedTasks { token, handles }
    }
}

// =============================================================================
// Health Checks
// =============================================================================

#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &'static str;

    async fn check(&self) -> Result<()>;
}

/// Consensus members missing from the quorum
struct MonHealthCheck {
    inspector: DaemonInspectorRef,
    namespace: String,
    expected: Vec<String>,
}

#[async_trait]
impl HealthCheck for MonHealthCheck {
    fn name(&self) -> &'static str {
        "mon"
    }

    async fn check(&self) -> Result<()> {
        let status = self.inspector.quorum_status(&self.namespace).await?;
        if status.quorum_names.is_empty() {
            return Err(Error::CommandFailed {
                command: "quorum_status".to_string(),
                reason: "no monitors in quorum".to_string(),
            });
        }

        let missing: Vec<&String> = self
            .expected
            .iter()
            .filter(|m| !status.quorum_names.contains(m))
            .collect();
        if missing.is_empty() {
            debug!(namespace = %self.namespace, "All monitors in quorum");
        } else {
            warn!(namespace = %self.namespace, "Monitors out of quorum: {:?}", missing);
        }
        Ok(())
    }
}

/// Storage-role daemons that are down
struct OsdHealthCheck {
    inspector: DaemonInspectorRef,
    namespace: String,
}

#[async_trait]
impl HealthCheck for OsdHealthCheck {
    fn name(&self) -> &'static str {
        "osd"
    }

    async fn check(&self) -> Result<()> {
        let summary = self.inspector.osd_summary(&self.namespace).await?;
        if summary.down() > 0 {
            warn!(
                namespace = %self.namespace,
                "{} of {} OSDs are down",
                summary.down(),
                summary.total
            );
        }
        Ok(())
    }
}

/// Writes overall engine health into the resource status
struct StatusCheck {
    inspector: DaemonInspectorRef,
    store: ClusterStoreRef,
    namespace: String,
    resource_name: String,
}

#[async_trait]
impl HealthCheck for StatusCheck {
    fn name(&self) -> &'static str {
        "status"
    }

    async fn check(&self) -> Result<()> {
        let health = self.inspector.health(&self.namespace).await?;
        if !health.is_ok() {
            debug!(
                namespace = %self.namespace,
                "Cluster health {}: {:?}",
                health.status,
                health.checks
            );
        }
        self.store
            .set_engine_health(
                &self.namespace,
                &self.resource_name,
                EngineHealthStatus {
                    health: health.status,
                    details: health.checks,
                    last_checked: Some(Utc::now()),
                },
            )
            .await
    }
}

// =============================================================================
// Health Supervisor
// =============================================================================

/// Intervals of the three health loops
#[derive(Debug, Clone, Copy)]
pub struct HealthIntervals {
    pub mon: Duration,
    pub osd: Duration,
    pub status: Duration,
}

pub struct HealthSupervisor {
    inspector: DaemonInspectorRef,
    store: ClusterStoreRef,
    intervals: HealthIntervals,
    metrics: ControllerMetrics,
}

impl HealthSupervisor {
    pub fn new(
        inspector: DaemonInspectorRef,
        store: ClusterStoreRef,
        intervals: HealthIntervals,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            inspector,
            store,
            intervals,
            metrics,
        }
    }

    /// Spawn the health loops of one cluster. The storage-role loop only
    /// runs for locally managed clusters.
    pub fn start(
        &self,
        namespace: &str,
        resource_name: &str,
        info: &ObservedClusterInfo,
        external: bool,
        cancel: &CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let mut checks: Vec<(Arc<dyn HealthCheck>, Duration)> = vec![(
            Arc::new(MonHealthCheck {
                inspector: self.inspector.clone(),
                namespace: namespace.to_string(),
                expected: info.monitors.keys().cloned().collect(),
            }),
            self.intervals.mon,
        )];
        if !external {
            checks.push((
                Arc::new(OsdHealthCheck {
                    inspector: self.inspector.clone(),
                    namespace: namespace.to_string(),
                }),
                self.intervals.osd,
            ));
        }
        checks.push((
            Arc::new(StatusCheck {
                inspector: self.inspector.clone(),
                store: self.store.clone(),
                namespace: namespace.to_string(),
                resource_name: resource_name.to_string(),
            }),
            self.intervals.status,
        ));

        checks
            .into_iter()
            .map(|(check, period)| {
                tokio::spawn(run_health_loop(
                    check,
                    period,
                    namespace.to_string(),
                    cancel.clone(),
                    self.metrics.clone(),
                ))
            })
            .collect()
    }
}

async fn run_health_loop(
    check: Arc<dyn HealthCheck>,
    period: Duration,
    namespace: String,
    cancel: CancellationToken,
    metrics: ControllerMetrics,
) {
    info!(namespace = %namespace, "Starting {} health checker every {:?}", check.name(), period);
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = check.check() => {
                if let Err(e) = result {
                    warn!(namespace = %namespace, "{} health check failed: {}", check.name(), e);
                    metrics.record_health_failure(check.name());
                }
            }
        }
    }
    info!(namespace = %namespace, "Stopping {} health checker", check.name());
}
