// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::debug;

use super::{unique_names, Consumer, Forward, Ingress};
use crate::client::Client;
use crate::config::Config;
use crate::entry::Entry;
use crate::error::ClientError;
use crate::metrics::{ClientMetrics, Registry};

/// Forwards a copy of every entry to one bare client per config.
pub struct FanoutConsumer {
    clients: Arc<Vec<Client>>,
    ingress: Ingress,
}

struct Targets(Vec<mpsc::Sender<Entry>>);

#[async_trait]
impl Forward for Targets {
    async fn forward(&self, entry: Entry) {
        join_all(self.0.iter().map(|tx| {
            let entry = entry.clone();
            async move {
                if tx.send(entry).await.is_err() {
                    debug!("client stopped, dropping fanned out entry");
                }
            }
        }))
        .await;
    }
}

impl FanoutConsumer {
    pub fn new(registry: &Registry, configs: Vec<Config>) -> Result<Self, ClientError> {
        unique_names(&configs)?;
        let metrics = ClientMetrics::new(registry);
        let clients = configs
            .into_iter()
            .map(|config| {
                let endpoint = crate::endpoint::Endpoint::with_metrics(metrics.clone(), config, None)?;
                Ok(Client::from_endpoint(Arc::new(endpoint)))
            })
            .collect::<Result<Vec<_>, ClientError>>()?;

        let targets = Targets(clients.iter().map(|client| client.chan()).collect());
        Ok(FanoutConsumer {
            clients: Arc::new(clients),
            ingress: Ingress::spawn(Arc::new(targets)),
        })
    }

    pub fn clients(&self) -> &[Client] {
        &self.clients
    }
}

#[async_trait]
impl Consumer for FanoutConsumer {
    fn chan(&self) -> mpsc::Sender<Entry> {
        self.ingress.chan()
    }

    async fn stop(&self) {
        self.ingress.close().await;
        join_all(self.clients.iter().map(|client| client.stop())).await;
    }
}
