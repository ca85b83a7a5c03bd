//! Role sub-controllers watching their own resource kinds.
//!
//! Each sub-controller watches one resource kind of the operator's API
//! group in the cluster namespace and follows its changes until the
//! cluster's token fires. Reconciling the role itself belongs to the
//! engine tooling that consumes these resources.

use crate::adapters::watch::watch_changes;
use crate::controller::events::ResourceChange;
use crate::crd::storage_cluster::API_GROUP;
use crate::domain::{SubController, SubControllerContext, SubControllerRef};
use crate::error::Result;
use async_trait::async_trait;
use futures::StreamExt;
use kube::api::{ApiResource, DynamicObject};
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const API_VERSION: &str = "v1";

/// Kind and plural of every role resource, in start order
pub const ROLE_RESOURCES: &[(&str, &str)] = &[
    ("StoragePool", "storagepools"),
    ("ObjectStore", "objectstores"),
    ("ObjectStoreUser", "objectstoreusers"),
    ("Filesystem", "filesystems"),
    ("NfsExport", "nfsexports"),
];

pub fn api_resource(kind: &str, plural: &str) -> ApiResource {
    ApiResource {
        group: API_GROUP.to_string(),
        version: API_VERSION.to_string(),
        api_version: format!("{}/{}", API_GROUP, API_VERSION),
        kind: kind.to_string(),
        plural: plural.to_string(),
    }
}

pub struct ResourceSubController {
    client: Client,
    kind: &'static str,
    plural: &'static str,
}

impl ResourceSubController {
    pub fn new(client: Client, kind: &'static str, plural: &'static str) -> Self {
        Self {
            client,
            kind,
            plural,
        }
    }
}

#[async_trait]
impl SubController for ResourceSubController {
    fn kind(&self) -> &'static str {
        self.kind
    }

    async fn run(&self, context: SubControllerContext, cancel: CancellationToken) -> Result<()> {
        let resource = api_resource(self.kind, self.plural);
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), &context.namespace, &resource);
        let mut changes = watch_changes(api, watcher::Config::default());

        info!(
            namespace = %context.namespace,
            "Watching {} resources of cluster {} ({} monitors)",
            self.kind,
            context.resource_name,
            context.info.monitors.len()
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                change = changes.next() => {
                    let Some(change) = change else { break };
                    let name = match &change {
                        ResourceChange::Added(obj)
                        | ResourceChange::Deleted(obj)
                        | ResourceChange::Updated { new: obj, .. } => obj.name_any(),
                    };
                    info!(
                        namespace = %context.namespace,
                        "{} {} {}",
                        self.kind,
                        name,
                        change.action()
                    );
                }
            }
        }

        debug!(namespace = %context.namespace, "Stopped watching {} resources", self.kind);
        Ok(())
    }
}

/// One sub-controller per role resource
pub fn default_subcontrollers(client: Client) -> Vec<SubControllerRef> {
    ROLE_RESOURCES
        .iter()
        .map(|&(kind, plural)| {
            Arc::new(ResourceSubController::new(client.clone(), kind, plural)) as SubControllerRef
        })
        .collect()
}
