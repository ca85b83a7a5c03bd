//! Volume attachment records read from the operator namespace.

use crate::crd::Volume;
use crate::domain::AttachmentSource;
use crate::error::Result;
use async_trait::async_trait;
use kube::api::ListParams;
use kube::{Api, Client};

pub struct KubeAttachmentSource {
    client: Client,
}

impl KubeAttachmentSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AttachmentSource for KubeAttachmentSource {
    async fn list(&self, operator_namespace: &str) -> Result<Vec<Volume>> {
        let api: Api<Volume> = Api::namespaced(self.client.clone(), operator_namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }
}
