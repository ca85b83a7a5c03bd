//! CSI cluster config kept in a config map of the operator namespace.

use crate::domain::CsiConfigStore;
use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Patch, PatchParams, PostParams};
use kube::{Api, Client};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::info;

/// Default name of the config map read by the CSI drivers
pub const CSI_CONFIG_MAP: &str = "storage-csi-config";

/// Data key holding the JSON array of clusters
pub const CSI_CONFIG_KEY: &str = "csi-cluster-config-json";

pub struct ConfigMapCsiStore {
    client: Client,
    namespace: String,
    name: String,
}

impl ConfigMapCsiStore {
    pub fn new(client: Client, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    fn api(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

/// Payload carried by the config map; missing data reads as empty
pub fn payload_of(config_map: &ConfigMap) -> String {
    config_map
        .data
        .as_ref()
        .and_then(|d| d.get(CSI_CONFIG_KEY))
        .cloned()
        .unwrap_or_default()
}

pub fn csi_config_map(namespace: &str, name: &str, payload: String) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(CSI_CONFIG_KEY.to_string(), payload)])),
        ..Default::default()
    }
}

#[async_trait]
impl CsiConfigStore for ConfigMapCsiStore {
    async fn load(&self) -> Result<String> {
        Ok(self
            .api()
            .get_opt(&self.name)
            .await?
            .map(|cm| payload_of(&cm))
            .unwrap_or_default())
    }

    async fn save(&self, payload: String) -> Result<()> {
        let api = self.api();
        if api.get_opt(&self.name).await?.is_some() {
            let patch = json!({ "data": { CSI_CONFIG_KEY: payload } });
            api.patch(&self.name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
        } else {
            info!(namespace = %self.namespace, "Creating CSI config map {}", self.name);
            api.create(
                &PostParams::default(),
                &csi_config_map(&self.namespace, &self.name, payload),
            )
            .await?;
        }
        Ok(())
    }
}
