//! Local cluster deployment through a desired-state config map.
//!
//! The daemon manifests themselves are rendered by the engine's own
//! deployment tooling, which reads the desired state this deployer applies.
//! A pass succeeds once that tooling has published the monitor endpoints
//! and cluster identity back into the namespace.

use crate::adapters::external::{info_from, MON_ENDPOINTS_CONFIG_MAP, MON_SECRET};
use crate::domain::{flatten_mon_endpoints, ClusterDeployer, DeployRequest, ObservedClusterInfo};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use std::collections::BTreeMap;
use tracing::{debug, info};

pub const DESIRED_STATE_CONFIG_MAP: &str = "storage-cluster-desired";
pub const SPEC_KEY: &str = "spec";
pub const VERSION_KEY: &str = "version";
pub const PREVIOUS_MONITORS_KEY: &str = "previous-monitors";

const FIELD_MANAGER: &str = "storage-cluster-operator";

pub struct ManifestDeployer {
    client: Client,
}

impl ManifestDeployer {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Desired-state config map for one deploy request
pub fn desired_state(request: &DeployRequest) -> Result<ConfigMap> {
    let mut data = BTreeMap::from([
        (SPEC_KEY.to_string(), serde_json::to_string(&request.spec)?),
        (VERSION_KEY.to_string(), request.version.to_string()),
    ]);
    if let Some(previous) = &request.previous {
        data.insert(
            PREVIOUS_MONITORS_KEY.to_string(),
            flatten_mon_endpoints(&previous.monitors),
        );
    }

    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(DESIRED_STATE_CONFIG_MAP.to_string()),
            namespace: Some(request.namespace.clone()),
            owner_references: request.owner.clone().map(|owner| vec![owner]),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    })
}

#[async_trait]
impl ClusterDeployer for ManifestDeployer {
    async fn deploy(&self, request: &DeployRequest) -> Result<ObservedClusterInfo> {
        let namespace = request.namespace.as_str();
        let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);

        let desired = desired_state(request)?;
        config_maps
            .patch(
                DESIRED_STATE_CONFIG_MAP,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&desired),
            )
            .await?;
        debug!(namespace = %namespace, "Applied desired state for version {}", request.version);

        let not_ready = |what: &str| Error::Deployment {
            namespace: namespace.to_string(),
            reason: format!("monitors not ready: {} not published", what),
        };
        let endpoints = config_maps
            .get_opt(MON_ENDPOINTS_CONFIG_MAP)
            .await?
            .ok_or_else(|| not_ready(MON_ENDPOINTS_CONFIG_MAP))?;
        let secret = secrets
            .get_opt(MON_SECRET)
            .await?
            .ok_or_else(|| not_ready(MON_SECRET))?;

        let mut info = info_from(&endpoints, &secret).map_err(|e| Error::Deployment {
            namespace: namespace.to_string(),
            reason: e.to_string(),
        })?;
        info.version = Some(request.version);

        info!(
            namespace = %namespace,
            "Cluster {} deployed with monitors {}",
            request.resource_name,
            flatten_mon_endpoints(&info.monitors)
        );
        Ok(info)
    }
}
