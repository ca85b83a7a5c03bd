//! Deletion drain: wait for consumers to release a cluster's volumes.

use crate::controller::retry::{poll, PollError, RetryPolicy};
use crate::domain::AttachmentSourceRef;
use crate::error::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How a drain ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// No attachment references the cluster any more
    Drained { attempts: u32 },
    /// Retries ran out; deletion proceeds anyway
    GaveUp { attempts: u32 },
}

pub struct DeletionDrain {
    attachments: AttachmentSourceRef,
    operator_namespace: String,
    policy: RetryPolicy,
}

impl DeletionDrain {
    pub fn new(
        attachments: AttachmentSourceRef,
        operator_namespace: impl Into<String>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            attachments,
            operator_namespace: operator_namespace.into(),
            policy,
        }
    }

    /// Poll until no attachment record references `cluster_namespace`.
    ///
    /// Records are listed from the operator namespace and filtered here.
    /// A failed listing counts as an attempt. Never fails: running out of
    /// attempts is reported as [`DrainOutcome::GaveUp`].
    pub async fn drain(&self, cluster_namespace: &str) -> DrainOutcome {
        // A drain always runs to its own bound
        let never = CancellationToken::new();

        let result = poll(&self.policy, "deletion drain", &never, |attempt| async move {
            let volumes = self
                .attachments
                .list(&self.operator_namespace)
                .await
                .map_err(backoff::Error::transient)?;

            let outstanding: Vec<String> = volumes
                .iter()
                .filter(|v| v.attached_to_cluster(cluster_namespace))
                .filter_map(|v| v.metadata.name.clone())
                .collect();

            if outstanding.is_empty() {
                return Ok(attempt);
            }
            info!(
                namespace = %cluster_namespace,
                "Waiting for volume attachments to be cleaned up: {:?}",
                outstanding
            );
            Err(backoff::Error::transient(Error::Internal(format!(
                "{} volumes still attached",
                outstanding.len()
            ))))
        })
        .await;

        match result {
            Ok(attempts) => {
                info!(namespace = %cluster_namespace, "No volume attachments left for cluster");
                DrainOutcome::Drained { attempts }
            }
            Err(
                PollError::Exhausted { last, attempts } | PollError::TimedOut { last, attempts },
            ) => {
                warn!(
                    namespace = %cluster_namespace,
                    "Giving up waiting for volume attachments after {} attempts, deleting anyway: {}",
                    attempts,
                    last
                );
                DrainOutcome::GaveUp { attempts }
            }
            Err(PollError::Aborted(e)) => {
                warn!(namespace = %cluster_namespace, "Volume attachment drain aborted: {}", e);
                DrainOutcome::GaveUp { attempts: 0 }
            }
            Err(PollError::Cancelled) => DrainOutcome::GaveUp { attempts: 0 },
        }
    }
}
