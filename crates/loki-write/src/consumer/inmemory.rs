// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::mpsc;

use super::{unique_names, Consumer, Forward, Ingress};
use crate::config::Config;
use crate::endpoint::Endpoint;
use crate::entry::Entry;
use crate::error::ClientError;
use crate::metrics::{ClientMetrics, Registry};

/// Feeds every configured endpoint from a single fan-in task, without a per-client
/// channel in between.
pub struct InMemoryConsumer {
    endpoints: Arc<Endpoints>,
    ingress: Ingress,
}

struct Endpoints(Vec<Arc<Endpoint>>);

#[async_trait]
impl Forward for Endpoints {
    async fn forward(&self, entry: Entry) {
        join_all(self.0.iter().map(|endpoint| endpoint.handle(entry.clone()))).await;
    }
}

impl InMemoryConsumer {
    pub fn new(registry: &Registry, configs: Vec<Config>) -> Result<Self, ClientError> {
        unique_names(&configs)?;
        let metrics = ClientMetrics::new(registry);
        let endpoints = configs
            .into_iter()
            .map(|config| Endpoint::with_metrics(metrics.clone(), config, None).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;

        let endpoints = Arc::new(Endpoints(endpoints));
        let ingress = Ingress::spawn(Arc::clone(&endpoints) as Arc<dyn Forward>);
        Ok(InMemoryConsumer { endpoints, ingress })
    }

    pub fn endpoints(&self) -> &[Arc<Endpoint>] {
        &self.endpoints.0
    }
}

#[async_trait]
impl Consumer for InMemoryConsumer {
    fn chan(&self) -> mpsc::Sender<Entry> {
        self.ingress.chan()
    }

    async fn stop(&self) {
        self.ingress.close().await;
        join_all(self.endpoints.0.iter().map(|endpoint| endpoint.stop())).await;
    }
}
