// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::info;

use crate::config::Config;
use crate::consumer::{unique_names, Consumer, FanoutConsumer, WalConsumer};
use crate::entry::Entry;
use crate::error::ClientError;
use crate::metrics::Registry;
use crate::wal;

/// Entry point of the library: builds the consumer matching the WAL settings and owns
/// its shutdown.
pub struct Manager {
    names: Vec<String>,
    inner: Box<dyn Consumer>,
    wal_enabled: bool,
}

impl Manager {
    /// Must be called from within a Tokio runtime.
    pub fn new(
        registry: &Registry,
        wal_config: wal::Config,
        configs: Vec<Config>,
    ) -> Result<Self, ClientError> {
        let names = unique_names(&configs)?;
        let inner: Box<dyn Consumer> = if wal_config.enabled {
            Box::new(WalConsumer::new(registry, &wal_config, configs)?)
        } else {
            Box::new(FanoutConsumer::new(registry, configs)?)
        };
        info!(
            clients = ?names,
            wal = wal_config.enabled,
            "started loki-write manager"
        );
        Ok(Manager {
            names,
            inner,
            wal_enabled: wal_config.enabled,
        })
    }

    /// Names of the configured clients, in configuration order.
    pub fn client_names(&self) -> &[String] {
        &self.names
    }

    pub fn wal_enabled(&self) -> bool {
        self.wal_enabled
    }
}

#[async_trait]
impl Consumer for Manager {
    fn chan(&self) -> mpsc::Sender<Entry> {
        self.inner.chan()
    }

    async fn stop(&self) {
        self.inner.stop().await;
        info!("stopped loki-write manager");
    }

    async fn stop_and_drain(&self) {
        self.inner.stop_and_drain().await;
        info!("drained and stopped loki-write manager");
    }
}
