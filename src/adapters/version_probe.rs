//! Image version probe run as a one-shot job in the cluster namespace.
//!
//! The job runs the engine's version command inside the requested image;
//! its pod log is the probe output. Any job left over from an earlier probe
//! is replaced.

use crate::domain::{ImageVersionProbe, ProbeRequest};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, ListParams, LogParams, PostParams};
use kube::{Api, Client, ResourceExt};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

pub const JOB_NAME: &str = "storage-detect-version";
const CONTAINER_NAME: &str = "version";
const APP_LABEL: &str = "app";

pub struct JobVersionProbe {
    client: Client,
    poll_interval: Duration,
}

impl JobVersionProbe {
    pub fn new(client: Client, poll_interval: Duration) -> Self {
        Self {
            client,
            poll_interval,
        }
    }

    async fn delete_job(&self, jobs: &Api<Job>) -> Result<()> {
        match jobs.delete(JOB_NAME, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Wait for the job to finish; true when it succeeded
    async fn wait_for_completion(&self, jobs: &Api<Job>) -> Result<bool> {
        loop {
            let job = jobs.get(JOB_NAME).await?;
            let status = job.status.unwrap_or_default();
            if status.succeeded.unwrap_or(0) > 0 {
                return Ok(true);
            }
            if status.failed.unwrap_or(0) > 0 {
                return Ok(false);
            }
            debug!("Version job {} still running", JOB_NAME);
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn job_log(&self, namespace: &str) -> Result<String> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let selector = format!("job-name={}", JOB_NAME);
        let pod = pods
            .list(&ListParams::default().labels(&selector))
            .await?
            .items
            .into_iter()
            .next()
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "Pod".to_string(),
                name: selector.clone(),
            })?;

        let params = LogParams {
            container: Some(CONTAINER_NAME.to_string()),
            ..Default::default()
        };
        Ok(pods.logs(&pod.name_any(), &params).await?)
    }
}

/// Job that prints the engine version shipped in `request.image`
pub fn version_job(request: &ProbeRequest) -> Job {
    let labels = BTreeMap::from([(APP_LABEL.to_string(), JOB_NAME.to_string())]);
    Job {
        metadata: ObjectMeta {
            name: Some(JOB_NAME.to_string()),
            namespace: Some(request.namespace.clone()),
            labels: Some(labels.clone()),
            owner_references: request.owner.clone().map(|owner| vec![owner]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    containers: vec![Container {
                        name: CONTAINER_NAME.to_string(),
                        image: Some(request.image.clone()),
                        command: Some(vec!["ceph".to_string()]),
                        args: Some(vec!["--version".to_string()]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl ImageVersionProbe for JobVersionProbe {
    async fn probe(&self, request: &ProbeRequest) -> Result<String> {
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), &request.namespace);
        self.delete_job(&jobs).await?;

        info!(
            namespace = %request.namespace,
            "Detecting engine version of image {}", request.image
        );
        jobs.create(&PostParams::default(), &version_job(request)).await?;

        let succeeded = self.wait_for_completion(&jobs).await?;
        let output = if succeeded {
            self.job_log(&request.namespace).await
        } else {
            Err(Error::VersionProbe {
                image: request.image.clone(),
                reason: format!("job {} failed", JOB_NAME),
            })
        };

        self.delete_job(&jobs).await?;
        output
    }
}
