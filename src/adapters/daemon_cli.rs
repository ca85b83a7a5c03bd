//! Daemon inspection through the engine's command-line client.
//!
//! Every query runs the client binary against the connection config of the
//! cluster namespace with JSON output, then decodes the reply.

use crate::adapters::external::config_path;
use crate::domain::{DaemonInspector, DaemonVersions, EngineHealth, EngineVersion, OsdSummary, QuorumStatus};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

pub struct CliDaemonInspector {
    binary: String,
    config_dir: PathBuf,
    timeout: Duration,
}

impl CliDaemonInspector {
    pub fn new(binary: impl Into<String>, config_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            config_dir: config_dir.into(),
            timeout,
        }
    }

    async fn run(&self, namespace: &str, args: &[&str]) -> Result<String> {
        let command = format!("{} {}", self.binary, args.join(" "));
        debug!(namespace = %namespace, "Running {}", command);

        let mut cmd = Command::new(&self.binary);
        cmd.arg("--conf")
            .arg(config_path(&self.config_dir, namespace))
            .args(["--format", "json"])
            .args(args)
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| Error::CommandFailed {
                command: command.clone(),
                reason: format!("no reply within {:?}", self.timeout),
            })??;

        if !output.status.success() {
            return Err(Error::CommandFailed {
                command,
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

// =============================================================================
// Reply Decoding
// =============================================================================

#[derive(Deserialize)]
struct VersionReply {
    version: String,
}

pub fn parse_version(reply: &str) -> Result<EngineVersion> {
    let reply: VersionReply = serde_json::from_str(reply)?;
    EngineVersion::extract(&reply.version)
}

pub fn parse_versions(reply: &str) -> Result<DaemonVersions> {
    Ok(serde_json::from_str(reply)?)
}

#[derive(Deserialize)]
struct HealthReply {
    status: String,
    #[serde(default)]
    checks: BTreeMap<String, HealthCheckReply>,
}

#[derive(Deserialize)]
struct HealthCheckReply {
    summary: HealthSummary,
}

#[derive(Deserialize)]
struct HealthSummary {
    message: String,
}

pub fn parse_health(reply: &str) -> Result<EngineHealth> {
    let reply: HealthReply = serde_json::from_str(reply)?;
    Ok(EngineHealth {
        status: reply.status,
        checks: reply
            .checks
            .into_iter()
            .map(|(name, check)| (name, check.summary.message))
            .collect(),
    })
}

#[derive(Deserialize)]
struct QuorumReply {
    #[serde(default)]
    quorum_names: Vec<String>,
    #[serde(default)]
    quorum_leader_name: Option<String>,
}

pub fn parse_quorum(reply: &str) -> Result<QuorumStatus> {
    let reply: QuorumReply = serde_json::from_str(reply)?;
    Ok(QuorumStatus {
        quorum_names: reply.quorum_names,
        leader: reply.quorum_leader_name.filter(|l| !l.is_empty()),
    })
}

#[derive(Deserialize)]
struct OsdStatReply {
    num_osds: u32,
    num_up_osds: u32,
    num_in_osds: u32,
}

pub fn parse_osd_stat(reply: &str) -> Result<OsdSummary> {
    let reply: OsdStatReply = serde_json::from_str(reply)?;
    Ok(OsdSummary {
        total: reply.num_osds,
        up: reply.num_up_osds,
        in_cluster: reply.num_in_osds,
    })
}

#[async_trait]
impl DaemonInspector for CliDaemonInspector {
    async fn mon_version(&self, namespace: &str) -> Result<EngineVersion> {
        parse_version(&self.run(namespace, &["tell", "mon.*", "version"]).await?)
    }

    async fn daemon_versions(&self, namespace: &str) -> Result<DaemonVersions> {
        parse_versions(&self.run(namespace, &["versions"]).await?)
    }

    async fn health(&self, namespace: &str) -> Result<EngineHealth> {
        parse_health(&self.run(namespace, &["health"]).await?)
    }

    async fn quorum_status(&self, namespace: &str) -> Result<QuorumStatus> {
        parse_quorum(&self.run(namespace, &["quorum_status"]).await?)
    }

    async fn osd_summary(&self, namespace: &str) -> Result<OsdSummary> {
        parse_osd_stat(&self.run(namespace, &["osd", "stat"]).await?)
    }
}
