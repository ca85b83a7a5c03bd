//! Event Router
//!
//! Receives every watched change as a [`ClusterEvent`], applies the
//! relevance filters and hands the survivors to the reconciler.

use crate::controller::admission::{node_hostname, node_schedulable, schedulability_flipped};
use crate::controller::events::{device_node_name, devices_changed, ClusterEvent, ResourceChange};
use crate::controller::reconciler::Reconciler;
use crate::crd::StorageCluster;
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::{ConfigMap, Node};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What the router did with one event
#[derive(Debug)]
pub enum Dispatch {
    /// Filtered out
    Ignored,
    /// Passed to the reconciler
    Handled,
    /// Work queued for this many clusters
    Queued(usize),
    /// Deletion running on its own task
    Deleting(JoinHandle<()>),
}

pub struct EventRouter {
    reconciler: Arc<Reconciler>,
    device_hotplug: bool,
}

impl EventRouter {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        let device_hotplug = reconciler.config().device_hotplug;
        if !device_hotplug {
            info!("Device hotplug reconciliation disabled");
        }
        Self {
            reconciler,
            device_hotplug,
        }
    }

    pub fn dispatch(&self, event: ClusterEvent) -> Dispatch {
        debug!(source = event.source(), "Dispatching event");
        match event {
            ClusterEvent::Cluster(change) => self.cluster_changed(change),
            ClusterEvent::Node(change) => self.node_changed(change),
            ClusterEvent::Devices(change) => self.devices_changed(change),
        }
    }

    /// Dispatch events until the stream ends or `shutdown` fires, then stop
    /// every cluster.
    pub async fn run<S>(&self, mut events: S, shutdown: CancellationToken)
    where
        S: Stream<Item = ClusterEvent> + Unpin,
    {
        info!("Event router started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.next() => match event {
                    Some(event) => {
                        self.dispatch(event);
                    }
                    None => {
                        warn!("Event stream ended");
                        break;
                    }
                },
            }
        }
        self.reconciler.stop_all();
        info!("Event router stopped");
    }

    fn cluster_changed(&self, change: ResourceChange<StorageCluster>) -> Dispatch {
        match change {
            ResourceChange::Added(cluster) => match self.reconciler.on_add(cluster) {
                Ok(_) => Dispatch::Handled,
                Err(_) => Dispatch::Ignored,
            },
            ResourceChange::Updated { old, new } => match self.reconciler.on_update(old, new) {
                Some(task) => Dispatch::Deleting(task),
                None => Dispatch::Handled,
            },
            ResourceChange::Deleted(cluster) => match self.reconciler.on_delete(cluster) {
                Some(task) => Dispatch::Deleting(task),
                None => Dispatch::Ignored,
            },
        }
    }

    fn node_changed(&self, change: ResourceChange<Node>) -> Dispatch {
        let node = match change {
            ResourceChange::Added(node) => node,
            ResourceChange::Updated { old, new } => {
                if old == new {
                    return Dispatch::Ignored;
                }
                if !schedulability_flipped(&old, &new) {
                    return Dispatch::Ignored;
                }
                info!(
                    "Node {} schedulability changed to {}",
                    node_hostname(&new),
                    node_schedulable(&new)
                );
                new
            }
            ResourceChange::Deleted(_) => return Dispatch::Ignored,
        };

        if !node_schedulable(&node) {
            debug!("Skipping cluster update, node {} is unschedulable", node_hostname(&node));
            return Dispatch::Ignored;
        }
        Dispatch::Queued(self.reconciler.on_node(&node))
    }

    fn devices_changed(&self, change: ResourceChange<ConfigMap>) -> Dispatch {
        if !self.device_hotplug {
            return Dispatch::Ignored;
        }
        let ResourceChange::Updated { old, new } = change else {
            return Dispatch::Ignored;
        };

        let node = device_node_name(&new);
        match devices_changed(&old, &new) {
            Ok(true) => {
                info!("Device inventory on node {} changed", node);
                Dispatch::Queued(self.reconciler.on_devices_changed(&node))
            }
            Ok(false) => {
                debug!("Device inventory on node {} unchanged", node);
                Dispatch::Ignored
            }
            Err(e) => {
                warn!("Failed to compare device inventories of node {}: {}", node, e);
                Dispatch::Ignored
            }
        }
    }
}
