//! Version Gate
//!
//! Decides whether the engine version carried by the configured image may
//! run. Probing the image can fail transiently and is retried by the
//! caller; a malformed or unsupported version, a mismatch with an external
//! cluster, a downgrade, or an upgrade of an unhealthy cluster is fatal for
//! the pass.

use crate::crd::StorageClusterSpec;
use crate::domain::{
    diff_image_and_running, DaemonInspectorRef, EngineVersion, ImageVersionProbeRef,
    ProbeRequest, UpgradeDecision,
};
use crate::error::{Error, Result};
use std::time::Duration;
use tracing::{info, warn};

pub struct VersionGate {
    probe: ImageVersionProbeRef,
    inspector: DaemonInspectorRef,
    probe_timeout: Duration,
}

impl VersionGate {
    pub fn new(
        probe: ImageVersionProbeRef,
        inspector: DaemonInspectorRef,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            probe,
            inspector,
            probe_timeout,
        }
    }

    /// Run the image and extract the engine version it ships.
    ///
    /// Probe failures and timeouts come back as [`Error::VersionProbe`];
    /// output without a recognizable version is [`Error::VersionParse`].
    pub async fn detect(&self, request: &ProbeRequest) -> Result<EngineVersion> {
        info!(
            namespace = %request.namespace,
            "Detecting engine version of image {}",
            request.image
        );

        let output = match tokio::time::timeout(self.probe_timeout, self.probe.probe(request)).await
        {
            Err(_) => {
                return Err(Error::VersionProbe {
                    image: request.image.clone(),
                    reason: format!("no result within {:?}", self.probe_timeout),
                })
            }
            Ok(Err(e)) => {
                return Err(Error::VersionProbe {
                    image: request.image.clone(),
                    reason: e.to_string(),
                })
            }
            Ok(Ok(output)) => output,
        };

        let version = EngineVersion::extract(&output)?;
        info!(
            namespace = %request.namespace,
            "Detected engine version {} in image {}",
            version,
            request.image
        );
        Ok(version)
    }

    /// Supportability rules, plus the upgrade check when daemons are
    /// already running for this namespace.
    pub async fn validate(
        &self,
        namespace: &str,
        version: &EngineVersion,
        spec: &StorageClusterSpec,
        cluster_running: bool,
    ) -> Result<()> {
        version.validate(spec.engine_version.allow_unsupported)?;
        if cluster_running && !spec.is_external() {
            self.check_upgrade(namespace, version).await?;
        }
        Ok(())
    }

    /// Detect then validate
    pub async fn detect_and_validate(
        &self,
        request: &ProbeRequest,
        spec: &StorageClusterSpec,
        cluster_running: bool,
    ) -> Result<EngineVersion> {
        let version = self.detect(request).await?;
        self.validate(&request.namespace, &version, spec, cluster_running)
            .await?;
        Ok(version)
    }

    /// Compare the image version with the running daemons. Upgrades
    /// require a healthy cluster; downgrades are refused outright.
    pub async fn check_upgrade(
        &self,
        namespace: &str,
        image_version: &EngineVersion,
    ) -> Result<UpgradeDecision> {
        let running = self.inspector.daemon_versions(namespace).await?;
        let decision = diff_image_and_running(image_version, &running)?;

        if decision.requires_healthy_cluster() {
            let health = self.inspector.health(namespace).await?;
            if !health.is_ok() {
                let checks: Vec<String> = health
                    .checks
                    .iter()
                    .map(|(name, summary)| format!("{}: {}", name, summary))
                    .collect();
                return Err(Error::UpgradeRefused {
                    namespace: namespace.to_string(),
                    reason: format!(
                        "cluster health is {} [{}]; fix the cluster and edit the resource to retry",
                        health.status,
                        checks.join("; ")
                    ),
                });
            }
            info!(namespace = %namespace, "Cluster is healthy, {:?} permitted", decision);
        }
        Ok(decision)
    }

    /// The external cluster's consensus role must run exactly the image
    /// version.
    pub async fn check_external(
        &self,
        namespace: &str,
        image_version: &EngineVersion,
    ) -> Result<EngineVersion> {
        let running = self.inspector.mon_version(namespace).await?;
        if !running.is_identical(image_version) {
            return Err(Error::VersionMismatch {
                image: image_version.to_string(),
                running: running.to_string(),
            });
        }
        Ok(running)
    }

    /// Log the versions running after an upgrade
    pub async fn report_running_version(&self, namespace: &str) {
        let versions = match self.inspector.daemon_versions(namespace).await {
            Ok(v) => v,
            Err(e) => {
                warn!(namespace = %namespace, "Failed to get daemon versions: {}", e);
                return;
            }
        };

        match versions.overall.keys().collect::<Vec<_>>().as_slice() {
            [single] => match EngineVersion::extract(single) {
                Ok(v) => info!(namespace = %namespace, "Cluster upgraded to version {}", v),
                Err(e) => warn!(namespace = %namespace, "Failed to extract running version: {}", e),
            },
            _ => warn!(
                namespace = %namespace,
                "Upgrade completed but several versions are still running: {:?}",
                versions.overall
            ),
        }
    }
}
