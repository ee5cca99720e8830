// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::consumer::{Consumer, Forward, Ingress};
use crate::endpoint::Endpoint;
use crate::entry::Entry;
use crate::error::ClientError;
use crate::metrics::Registry;

/// Name identifying a client in metrics, logs and WAL marker paths: the configured
/// name, or the first 6 hex characters of a SHA-256 over the config.
pub fn client_name(config: &Config) -> String {
    if let Some(name) = config.name.as_deref().filter(|name| !name.is_empty()) {
        return name.to_string();
    }
    let mut hasher = Sha256::new();
    hasher.update(format!("{config:?}").as_bytes());
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(6);
    digest
}

/// A bare, non durable client: one endpoint fed through its own entry channel.
pub struct Client {
    endpoint: Arc<Endpoint>,
    ingress: Ingress,
}

impl Client {
    pub fn new(registry: &Registry, config: Config) -> Result<Self, ClientError> {
        let endpoint = Arc::new(Endpoint::new(registry, config, None)?);
        Ok(Self::from_endpoint(endpoint))
    }

    pub(crate) fn from_endpoint(endpoint: Arc<Endpoint>) -> Self {
        let ingress = Ingress::spawn(Arc::clone(&endpoint) as Arc<dyn Forward>);
        Client { endpoint, ingress }
    }

    pub fn name(&self) -> &str {
        self.endpoint.name()
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    /// Stops without draining the shard queues.
    pub async fn stop_now(&self) {
        self.ingress.close().await;
        self.endpoint.stop_now().await;
    }
}

#[async_trait]
impl Forward for Endpoint {
    async fn forward(&self, entry: Entry) {
        self.handle(entry).await;
    }
}

#[async_trait]
impl Consumer for Client {
    fn chan(&self) -> mpsc::Sender<Entry> {
        self.ingress.chan()
    }

    async fn stop(&self) {
        self.ingress.close().await;
        self.endpoint.stop().await;
    }
}
