//! StorageCluster store backed by the Kubernetes API.

use crate::crd::{ClusterState, EngineHealthStatus, StorageCluster};
use crate::domain::ClusterStore;
use crate::error::{Error, Result};
use async_trait::async_trait;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use serde_json::{json, Value};
use tracing::debug;

pub struct KubeClusterStore {
    client: Client,
}

impl KubeClusterStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<StorageCluster> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Map a 404 onto [`Error::ResourceNotFound`]
pub(crate) fn not_found(err: kube::Error, kind: &str, name: &str) -> Error {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => Error::ResourceNotFound {
            kind: kind.to_string(),
            name: name.to_string(),
        },
        other => other.into(),
    }
}

/// Finalizer list patch; a resource version makes the API server reject it
/// with 409 Conflict if the object changed since that revision
pub fn finalizer_patch(finalizers: &[String], resource_version: Option<&str>) -> Value {
    match resource_version {
        Some(version) => json!({
            "metadata": { "finalizers": finalizers, "resourceVersion": version }
        }),
        None => json!({ "metadata": { "finalizers": finalizers } }),
    }
}

pub fn state_patch(state: ClusterState, message: &str) -> Value {
    json!({ "status": { "state": state, "message": message } })
}

pub fn health_patch(health: &EngineHealthStatus) -> Value {
    json!({ "status": { "engine": health } })
}

#[async_trait]
impl ClusterStore for KubeClusterStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<StorageCluster> {
        self.api(namespace)
            .get(name)
            .await
            .map_err(|e| not_found(e, "StorageCluster", name))
    }

    async fn set_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
        resource_version: Option<&str>,
    ) -> Result<()> {
        self.api(namespace)
            .patch(
                name,
                &PatchParams::default(),
                &Patch::Merge(&finalizer_patch(&finalizers, resource_version)),
            )
            .await
            .map_err(|e| not_found(e, "StorageCluster", name))?;
        debug!(namespace = %namespace, "Set finalizers of {} to {:?}", name, finalizers);
        Ok(())
    }

    async fn set_state(
        &self,
        namespace: &str,
        name: &str,
        state: ClusterState,
        message: &str,
    ) -> Result<()> {
        self.api(namespace)
            .patch_status(
                name,
                &PatchParams::default(),
                &Patch::Merge(&state_patch(state, message)),
            )
            .await
            .map_err(|e| not_found(e, "StorageCluster", name))?;
        Ok(())
    }

    async fn set_engine_health(
        &self,
        namespace: &str,
        name: &str,
        health: EngineHealthStatus,
    ) -> Result<()> {
        self.api(namespace)
            .patch_status(
                name,
                &PatchParams::default(),
                &Patch::Merge(&health_patch(&health)),
            )
            .await
            .map_err(|e| not_found(e, "StorageCluster", name))?;
        Ok(())
    }
}
