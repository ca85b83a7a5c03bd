//! Error types for the Storage Cluster Operator
//!
//! Provides structured error types for the reconciliation controller,
//! the version gate, deletion drain and the kube-backed adapters.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error(
        "Cluster {requested} rejected in namespace {namespace}: cluster {existing} already exists \
         and only one cluster per namespace is supported"
    )]
    ClusterAlreadyExists {
        namespace: String,
        existing: String,
        requested: String,
    },

    #[error("Cluster not registered in namespace {namespace}")]
    ClusterNotRegistered { namespace: String },

    // =========================================================================
    // Version Gate Errors
    // =========================================================================
    #[error("Failed to detect engine version of image {image}: {reason}")]
    VersionProbe { image: String, reason: String },

    #[error("Malformed engine version string: {0}")]
    VersionParse(String),

    #[error("Unsupported engine version {version}: {reason}")]
    UnsupportedVersion { version: String, reason: String },

    #[error("Engine version mismatch: image has {image}, running cluster has {running}, they must match")]
    VersionMismatch { image: String, running: String },

    #[error("Refusing to upgrade cluster in namespace {namespace}: {reason}")]
    UpgradeRefused { namespace: String, reason: String },

    #[error("Image version {image} is lower than the running cluster version {running}, downgrading is not supported")]
    DowngradeRefused { image: String, running: String },

    // =========================================================================
    // Cluster Lifecycle Errors
    // =========================================================================
    #[error("Using all devices in more than one namespace is not supported (held by {holder}, requested by {namespace})")]
    DevicesInUse { namespace: String, holder: String },

    #[error("Deployment failed in namespace {namespace}: {reason}")]
    Deployment { namespace: String, reason: String },

    #[error("External cluster connection info unavailable in namespace {namespace}: {reason}")]
    ExternalConnection { namespace: String, reason: String },

    #[error("Command failed: {command} - {reason}")]
    CommandFailed { command: String, reason: String },

    #[error("Timed out after {duration:?} waiting for {operation}")]
    Timeout { operation: String, duration: Duration },

    #[error("Operation cancelled for cluster in namespace {namespace}")]
    Cancelled { namespace: String },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("CSI cluster config parse error: {0}")]
    CsiConfigParse(String),

    #[error("Device inventory parse error: {0}")]
    DeviceInventoryParse(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Kube(_)
            | Error::VersionProbe { .. }
            | Error::Deployment { .. }
            | Error::CommandFailed { .. }
            | Error::Io(_) => ErrorAction::RequeueWithBackoff,

            // Waiting on someone else - fixed retry
            Error::ExternalConnection { .. } => ErrorAction::RequeueAfter(Duration::from_secs(10)),

            // Timeouts - longer retry
            Error::Timeout { .. } => ErrorAction::RequeueAfter(Duration::from_secs(300)),

            // Fatal for the current pass - wait for the resource to change
            Error::Configuration(_)
            | Error::ClusterAlreadyExists { .. }
            | Error::VersionParse(_)
            | Error::UnsupportedVersion { .. }
            | Error::VersionMismatch { .. }
            | Error::UpgradeRefused { .. }
            | Error::DowngradeRefused { .. }
            | Error::DevicesInUse { .. }
            | Error::CsiConfigParse(_)
            | Error::DeviceInventoryParse(_)
            | Error::Cancelled { .. } => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Kube(_)
                | Error::VersionProbe { .. }
                | Error::Deployment { .. }
                | Error::ExternalConnection { .. }
                | Error::CommandFailed { .. }
        )
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        let err = Error::ExternalConnection {
            namespace: "rook".into(),
            reason: "secret missing".into(),
        };
        assert_eq!(
            err.action(),
            ErrorAction::RequeueAfter(Duration::from_secs(10))
        );

        let err = Error::Configuration("bad config".into());
        assert_eq!(err.action(), ErrorAction::NoRequeue);

        let err = Error::DevicesInUse {
            namespace: "b".into(),
            holder: "a".into(),
        };
        assert_eq!(err.action(), ErrorAction::NoRequeue);
    }

    #[test]
    fn test_version_errors_split_retryable_and_fatal() {
        let probe = Error::VersionProbe {
            image: "ceph/ceph:v14".into(),
            reason: "job failed".into(),
        };
        assert!(probe.is_retryable());
        assert!(probe.is_transient());

        let unsupported = Error::UnsupportedVersion {
            version: "11.2.0".into(),
            reason: "below minimum".into(),
        };
        assert!(!unsupported.is_retryable());
        assert!(!unsupported.is_transient());

        let mismatch = Error::VersionMismatch {
            image: "14.2.1".into(),
            running: "14.2.2".into(),
        };
        assert!(!mismatch.is_retryable());
    }
}
