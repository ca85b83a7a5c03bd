//! Watch streams feeding the event router.
//!
//! kube watchers only report the new revision of an object; a local cache
//! pairs each update with the revision seen before it so the relevance
//! filters can compare old and new.

use crate::controller::events::{ClusterEvent, ResourceChange};
use crate::crd::StorageCluster;
use futures::stream::BoxStream;
use futures::{future, stream, StreamExt};
use k8s_openapi::api::core::v1::{ConfigMap, Node};
use kube::runtime::watcher::{self, watcher, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt::Debug;
use tracing::{info, warn};

fn object_key<K: Resource>(obj: &K) -> String {
    format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any())
}

/// Pairs watcher events with the previously seen revision
#[derive(Debug)]
pub struct ChangeTracker<K> {
    seen: HashMap<String, K>,
}

impl<K> Default for ChangeTracker<K> {
    fn default() -> Self {
        Self {
            seen: HashMap::new(),
        }
    }
}

impl<K: Resource + Clone> ChangeTracker<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: Event<K>) -> Vec<ResourceChange<K>> {
        match event {
            Event::Applied(obj) => vec![self.applied(obj)],
            Event::Deleted(obj) => {
                self.seen.remove(&object_key(&obj));
                vec![ResourceChange::Deleted(obj)]
            }
            Event::Restarted(objs) => {
                // Objects missing from the relist were deleted while disconnected
                let mut previous = std::mem::take(&mut self.seen);
                let mut changes: Vec<_> = objs
                    .into_iter()
                    .map(|obj| match previous.remove(&object_key(&obj)) {
                        Some(old) => {
                            self.seen.insert(object_key(&obj), obj.clone());
                            ResourceChange::Updated { old, new: obj }
                        }
                        None => self.applied(obj),
                    })
                    .collect();
                changes.extend(previous.into_values().map(ResourceChange::Deleted));
                changes
            }
        }
    }

    fn applied(&mut self, obj: K) -> ResourceChange<K> {
        match self.seen.insert(object_key(&obj), obj.clone()) {
            Some(old) => ResourceChange::Updated { old, new: obj },
            None => ResourceChange::Added(obj),
        }
    }
}

/// Watch `api` and emit changes, retrying watch errors with backoff
pub fn watch_changes<K>(
    api: Api<K>,
    config: watcher::Config,
) -> BoxStream<'static, ResourceChange<K>>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let mut tracker = ChangeTracker::new();
    watcher(api, config)
        .default_backoff()
        .filter_map(|event| {
            future::ready(match event {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!("Watch error: {}", e);
                    None
                }
            })
        })
        .flat_map(move |event| stream::iter(tracker.apply(event)))
        .boxed()
}

/// Where to find device discovery config maps
#[derive(Debug, Clone)]
pub struct DeviceWatch {
    pub namespace: String,
    pub label_selector: String,
}

/// Merged stream of every source the controller reacts to
pub fn cluster_events(
    client: Client,
    watch_namespace: Option<&str>,
    devices: Option<DeviceWatch>,
) -> BoxStream<'static, ClusterEvent> {
    let clusters: Api<StorageCluster> = match watch_namespace {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    };
    let nodes: Api<Node> = Api::all(client.clone());

    let mut streams = vec![
        watch_changes(clusters, watcher::Config::default())
            .map(ClusterEvent::Cluster)
            .boxed(),
        watch_changes(nodes, watcher::Config::default())
            .map(ClusterEvent::Node)
            .boxed(),
    ];

    if let Some(devices) = devices {
        info!(
            namespace = %devices.namespace,
            "Watching device inventories with selector {}",
            devices.label_selector
        );
        let config_maps: Api<ConfigMap> = Api::namespaced(client, &devices.namespace);
        streams.push(
            watch_changes(
                config_maps,
                watcher::Config::default().labels(&devices.label_selector),
            )
            .map(ClusterEvent::Devices)
            .boxed(),
        );
    }

    stream::select_all(streams).boxed()
}
