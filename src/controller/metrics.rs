//! Controller Metrics
//!
//! Prometheus collectors for reconciliation passes, registered clusters,
//! drain give-ups and health-check failures.

use crate::error::{Error, Result};
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

/// Outcome label of a reconciliation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    Success,
    Skipped,
    Failed,
    Cancelled,
}

impl PassOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PassOutcome::Success => "success",
            PassOutcome::Skipped => "skipped",
            PassOutcome::Failed => "failed",
            PassOutcome::Cancelled => "cancelled",
        }
    }
}

#[derive(Clone)]
pub struct ControllerMetrics {
    passes: IntCounterVec,
    clusters: IntGauge,
    rejected: IntCounter,
    drain_give_ups: IntCounter,
    health_failures: IntCounterVec,
}

fn metric_err(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}

impl ControllerMetrics {
    pub fn new() -> Result<Self> {
        Ok(Self {
            passes: IntCounterVec::new(
                Opts::new(
                    "storage_cluster_reconcile_passes_total",
                    "Reconciliation passes by trigger and outcome",
                ),
                &["trigger", "outcome"],
            )
            .map_err(metric_err)?,
            clusters: IntGauge::new(
                "storage_cluster_registered_clusters",
                "Clusters currently registered with the controller",
            )
            .map_err(metric_err)?,
            rejected: IntCounter::new(
                "storage_cluster_rejected_total",
                "Cluster resources rejected because their namespace already has one",
            )
            .map_err(metric_err)?,
            drain_give_ups: IntCounter::new(
                "storage_cluster_drain_give_ups_total",
                "Deletions that proceeded with volume attachments outstanding",
            )
            .map_err(metric_err)?,
            health_failures: IntCounterVec::new(
                Opts::new(
                    "storage_cluster_health_check_failures_total",
                    "Failed health checks by checker",
                ),
                &["checker"],
            )
            .map_err(metric_err)?,
        })
    }

    /// Register every collector with `registry`
    pub fn register(&self, registry: &Registry) -> Result<()> {
        registry.register(Box::new(self.passes.clone())).map_err(metric_err)?;
        registry.register(Box::new(self.clusters.clone())).map_err(metric_err)?;
        registry.register(Box::new(self.rejected.clone())).map_err(metric_err)?;
        registry
            .register(Box::new(self.drain_give_ups.clone()))
            .map_err(metric_err)?;
        registry
            .register(Box::new(self.health_failures.clone()))
            .map_err(metric_err)?;
        Ok(())
    }

    pub fn record_pass(&self, trigger: &str, outcome: PassOutcome) {
        self.passes
            .with_label_values(&[trigger, outcome.as_str()])
            .inc();
    }

    pub fn passes(&self, trigger: &str, outcome: PassOutcome) -> u64 {
        self.passes
            .with_label_values(&[trigger, outcome.as_str()])
            .get()
    }

    pub fn set_clusters(&self, count: usize) {
        self.clusters.set(count as i64);
    }

    pub fn record_rejected(&self) {
        self.rejected.inc();
    }

    pub fn record_drain_give_up(&self) {
        self.drain_give_ups.inc();
    }

    pub fn record_health_failure(&self, checker: &str) {
        self.health_failures.with_label_values(&[checker]).inc();
    }

    pub fn health_failures(&self, checker: &str) -> u64 {
        self.health_failures.with_label_values(&[checker]).get()
    }
}
