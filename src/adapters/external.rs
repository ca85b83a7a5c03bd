//! Connection info of a running cluster
//!
//! Monitor endpoints live in a config map and the cluster identity in a
//! secret of the cluster namespace. For an external cluster both are
//! provided by the administrator; for a local one they are written by the
//! deployment routine and read back on controller restart. The daemon
//! commands use a config file and keyring rendered from the same info.

use crate::domain::{flatten_mon_endpoints, parse_mon_endpoints, ConnectionInfoSource, ObservedClusterInfo};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::{Api, Client};
use std::path::{Path, PathBuf};
use tracing::info;

pub const MON_ENDPOINTS_CONFIG_MAP: &str = "storage-mon-endpoints";
pub const MON_ENDPOINTS_KEY: &str = "data";
pub const MON_SECRET: &str = "storage-mon";
pub const FSID_KEY: &str = "fsid";
pub const ADMIN_SECRET_KEY: &str = "admin-secret";

/// Config file of a cluster namespace under `config_dir`
pub fn config_path(config_dir: &Path, namespace: &str) -> PathBuf {
    config_dir.join(namespace).join(format!("{}.config", namespace))
}

pub fn keyring_path(config_dir: &Path, namespace: &str) -> PathBuf {
    config_dir.join(namespace).join("client.admin.keyring")
}

fn secret_value(secret: &Secret, key: &str) -> Result<String> {
    let bytes = secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .ok_or_else(|| Error::Configuration(format!("secret is missing key {}", key)))?;
    String::from_utf8(bytes.0.clone())
        .map_err(|e| Error::Configuration(format!("secret key {} is not UTF-8: {}", key, e)))
}

/// Build connection info from the endpoints config map and the secret
pub fn info_from(config_map: &ConfigMap, secret: &Secret) -> Result<ObservedClusterInfo> {
    let flattened = config_map
        .data
        .as_ref()
        .and_then(|d| d.get(MON_ENDPOINTS_KEY))
        .map(String::as_str)
        .unwrap_or_default();
    let monitors = parse_mon_endpoints(flattened)?;
    if monitors.is_empty() {
        return Err(Error::Configuration("no monitor endpoints".to_string()));
    }

    Ok(ObservedClusterInfo {
        fsid: secret_value(secret, FSID_KEY)?,
        admin_secret: secret_value(secret, ADMIN_SECRET_KEY)?,
        monitors,
        version: None,
    })
}

pub fn render_config(info: &ObservedClusterInfo, keyring: &Path) -> String {
    let members: Vec<&str> = info.monitors.keys().map(String::as_str).collect();
    format!(
        "[global]\nfsid = {}\nmon initial members = {}\nmon host = {}\n\n[client.admin]\nkeyring = {}\n",
        info.fsid,
        members.join(" "),
        info.mon_endpoints().join(","),
        keyring.display()
    )
}

pub fn render_keyring(info: &ObservedClusterInfo) -> String {
    format!("[client.admin]\nkey = {}\n", info.admin_secret)
}

/// Write the config file and keyring; returns the config file path
pub async fn write_config_files(
    config_dir: &Path,
    namespace: &str,
    info: &ObservedClusterInfo,
) -> Result<PathBuf> {
    let config = config_path(config_dir, namespace);
    let keyring = keyring_path(config_dir, namespace);
    tokio::fs::create_dir_all(config_dir.join(namespace)).await?;
    tokio::fs::write(&keyring, render_keyring(info)).await?;
    tokio::fs::write(&config, render_config(info, &keyring)).await?;
    Ok(config)
}

pub struct KubeConnectionSource {
    client: Client,
    config_dir: PathBuf,
}

impl KubeConnectionSource {
    pub fn new(client: Client, config_dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            config_dir: config_dir.into(),
        }
    }

    async fn read(&self, namespace: &str) -> Result<Option<ObservedClusterInfo>> {
        let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);

        let Some(config_map) = config_maps.get_opt(MON_ENDPOINTS_CONFIG_MAP).await? else {
            return Ok(None);
        };
        let Some(secret) = secrets.get_opt(MON_SECRET).await? else {
            return Ok(None);
        };
        info_from(&config_map, &secret).map(Some)
    }
}

#[async_trait]
impl ConnectionInfoSource for KubeConnectionSource {
    async fn load(&self, namespace: &str) -> Result<ObservedClusterInfo> {
        match self.read(namespace).await {
            Ok(Some(info)) => Ok(info),
            Ok(None) => Err(Error::ExternalConnection {
                namespace: namespace.to_string(),
                reason: format!(
                    "config map {} or secret {} not found",
                    MON_ENDPOINTS_CONFIG_MAP, MON_SECRET
                ),
            }),
            Err(e) => Err(Error::ExternalConnection {
                namespace: namespace.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn load_existing(&self, namespace: &str) -> Result<Option<ObservedClusterInfo>> {
        self.read(namespace).await
    }

    async fn write_connection_config(
        &self,
        namespace: &str,
        info: &ObservedClusterInfo,
    ) -> Result<()> {
        let path = write_config_files(&self.config_dir, namespace, info).await?;
        info!(
            namespace = %namespace,
            "Wrote connection config {} for monitors {}",
            path.display(),
            flatten_mon_endpoints(&info.monitors)
        );
        Ok(())
    }
}
