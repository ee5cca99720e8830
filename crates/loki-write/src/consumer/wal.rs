// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::debug;

use super::{unique_names, Consumer};
use crate::config::Config;
use crate::endpoint::Endpoint;
use crate::entry::Entry;
use crate::error::ClientError;
use crate::metrics::{ClientMetrics, MarkerMetrics, Registry, WatcherMetrics};
use crate::wal::{
    self, Marker, MarkerFileHandler, MarkerHandler, WalClient, Watcher, WriteSubscriber,
    WriteTo, Writer,
};

struct WatcherEndpointPair {
    watcher: Arc<Watcher>,
    client: Arc<WalClient>,
}

impl WatcherEndpointPair {
    async fn stop(&self, drain: bool) {
        if drain {
            self.watcher.drain().await;
        }
        self.watcher.stop().await;
        self.client.endpoint().stop().await;
        self.client.marker().stop().await;
    }
}

/// Writes every entry to the WAL first; one watcher per client replays it into that
/// client's endpoint.
pub struct WalConsumer {
    writer: Writer,
    pairs: Vec<WatcherEndpointPair>,
}

impl WalConsumer {
    pub fn new(
        registry: &Registry,
        wal_config: &wal::Config,
        configs: Vec<Config>,
    ) -> Result<Self, ClientError> {
        wal_config.validate()?;
        let names = unique_names(&configs)?;
        for config in &configs {
            config.validate()?;
        }
        let writer = Writer::new(wal_config, registry)?;

        let metrics = ClientMetrics::new(registry);
        let watcher_metrics = WatcherMetrics::new(registry);
        let marker_metrics = MarkerMetrics::new(registry);

        let mut pairs = Vec::with_capacity(configs.len());
        for (config, name) in configs.into_iter().zip(names) {
            let file = MarkerFileHandler::new(&wal_config.dir, &name)?;
            let marker = Marker::start(
                &name,
                file,
                wal_config.max_segment_age,
                marker_metrics.clone(),
            );
            let handler: Arc<dyn MarkerHandler> = marker.clone();
            let endpoint = Endpoint::with_metrics(metrics.clone(), config, Some(handler))?;
            let client = Arc::new(WalClient::new(Arc::new(endpoint), Arc::clone(&marker)));

            writer.subscribe_cleanup(Arc::clone(&client) as Arc<dyn WriteTo>);
            writer.track_marker(Arc::clone(&marker));

            debug!(client = %name, "starting WAL watcher for client");
            let watcher = Watcher::start(
                wal_config.dir.clone(),
                &name,
                wal_config.watch,
                Arc::clone(&client) as Arc<dyn WriteTo>,
                marker.last_marked_segment(),
                watcher_metrics.clone(),
            );
            writer.subscribe_write(Arc::clone(&watcher) as Arc<dyn WriteSubscriber>);

            pairs.push(WatcherEndpointPair { watcher, client });
        }

        Ok(WalConsumer { writer, pairs })
    }

    pub fn writer(&self) -> &Writer {
        &self.writer
    }

    pub fn clients(&self) -> impl Iterator<Item = &Arc<WalClient>> {
        self.pairs.iter().map(|pair| &pair.client)
    }

    async fn shutdown(&self, drain: bool) {
        self.writer.stop().await;
        join_all(self.pairs.iter().map(|pair| pair.stop(drain))).await;
    }
}

#[async_trait]
impl Consumer for WalConsumer {
    fn chan(&self) -> mpsc::Sender<Entry> {
        self.writer.chan()
    }

    async fn stop(&self) {
        self.shutdown(false).await;
    }

    async fn stop_and_drain(&self) {
        self.shutdown(true).await;
    }
}
