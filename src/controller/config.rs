//! Controller configuration.

use crate::controller::retry::RetryPolicy;
use std::time::Duration;

/// Default number of consensus members when the resource asks for none
pub const DEFAULT_MON_COUNT: u32 = 3;

/// Tunables of the cluster controller
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Namespace the operator runs in; attachment records live here
    pub operator_namespace: String,

    /// Reconcile when a node's device inventory changes
    pub device_hotplug: bool,

    /// Local creation poll
    pub create_interval: Duration,
    pub create_timeout: Duration,

    /// Update poll
    pub update_interval: Duration,
    pub update_timeout: Duration,

    /// Wait between attempts to load external connection info
    pub external_connect_interval: Duration,

    /// Bound on a single image version probe
    pub version_probe_timeout: Duration,

    /// Deletion drain
    pub drain_interval: Duration,
    pub drain_max_retries: u32,

    /// Finalizer removal
    pub finalizer_retry_interval: Duration,
    pub finalizer_max_retries: u32,

    /// Health loop intervals
    pub mon_health_interval: Duration,
    pub osd_health_interval: Duration,
    pub status_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            operator_namespace: "storage-system".to_string(),
            device_hotplug: true,
            create_interval: Duration::from_secs(6),
            create_timeout: Duration::from_secs(60 * 60),
            update_interval: Duration::from_secs(30),
            update_timeout: Duration::from_secs(60 * 60),
            external_connect_interval: Duration::from_secs(10),
            version_probe_timeout: Duration::from_secs(15 * 60),
            drain_interval: Duration::from_secs(2),
            drain_max_retries: 15,
            finalizer_retry_interval: Duration::from_secs(5),
            finalizer_max_retries: 5,
            mon_health_interval: Duration::from_secs(45),
            osd_health_interval: Duration::from_secs(60),
            status_interval: Duration::from_secs(60),
        }
    }
}

impl ControllerConfig {
    pub fn create_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.create_interval, self.create_timeout)
    }

    pub fn update_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.update_interval, self.update_timeout)
    }

    pub fn external_connect_policy(&self) -> RetryPolicy {
        RetryPolicy::forever(self.external_connect_interval)
    }

    pub fn drain_policy(&self) -> RetryPolicy {
        RetryPolicy::attempts(self.drain_interval, self.drain_max_retries)
    }

    pub fn finalizer_policy(&self) -> RetryPolicy {
        RetryPolicy::attempts(self.finalizer_retry_interval, self.finalizer_max_retries)
    }
}

/// Device hotplug stays on unless the variable is exactly `true`.
pub fn hotplug_enabled(disable_var: Option<&str>) -> bool {
    disable_var != Some("true")
}
