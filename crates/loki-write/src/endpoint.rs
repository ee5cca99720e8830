// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backoff::Backoff;
use crate::client::client_name;
use crate::config::{BackoffConfig, Config};
use crate::entry::{tenant_of, Entry};
use crate::error::{ClientError, EnqueueError};
use crate::http::build_client;
use crate::metrics::{ClientMetrics, DropReason, HostLabels, Registry};
use crate::sender::Sender;
use crate::shards::{Overflow, Shards};
use crate::wal::marker::MarkerHandler;

/// Attempts `handle` makes to queue an entry on a full shard before dropping it.
const MAX_ENQUEUE_RETRIES: u32 = 3;

/// One configured delivery target and its shard pool.
pub struct Endpoint {
    name: String,
    config: Config,
    host: String,
    shards: Shards,
    metrics: ClientMetrics,
    tenants: Mutex<HashSet<String>>,
    cancel: CancellationToken,
}

impl Endpoint {
    /// Validates `config` and starts the shard workers. Must be called from within a
    /// Tokio runtime.
    pub fn new(
        registry: &Registry,
        config: Config,
        marker: Option<Arc<dyn MarkerHandler>>,
    ) -> Result<Self, ClientError> {
        Self::with_metrics(ClientMetrics::new(registry), config, marker)
    }

    pub fn with_metrics(
        metrics: ClientMetrics,
        config: Config,
        marker: Option<Arc<dyn MarkerHandler>>,
    ) -> Result<Self, ClientError> {
        config.validate()?;
        let name = client_name(&config);
        let http = build_client(&config)?;
        let cancel = CancellationToken::new();
        let sender = Arc::new(Sender::new(&config, metrics.clone(), http, cancel.clone())?);
        let shards = Shards::start(&config, sender, metrics.clone(), marker, cancel.clone());

        info!(
            client = %name,
            host = %config.host(),
            shards = shards.len(),
            "started endpoint"
        );
        Ok(Endpoint {
            name,
            host: config.host(),
            config,
            shards,
            metrics,
            tenants: Mutex::new(HashSet::new()),
            cancel,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> &ClientMetrics {
        &self.metrics
    }

    /// Overflow policy for producers that do not need WAL semantics.
    pub fn overflow(&self) -> Overflow {
        if self.config.queue.block_on_overflow {
            Overflow::Wait(self.config.queue.max_block)
        } else {
            Overflow::Reject
        }
    }

    /// Queues `entry` on the shard owning its stream.
    ///
    /// `segment` is the WAL segment the entry was replayed from, if any.
    pub async fn enqueue(
        &self,
        entry: Entry,
        segment: Option<u64>,
        overflow: Overflow,
    ) -> Result<(), EnqueueError> {
        let (entry, tenant) = tenant_of(entry, &self.config.tenant_id);
        self.init_tenant(&tenant);
        self.shards.enqueue(&tenant, entry, segment, overflow).await
    }

    /// Enqueues with the configured overflow policy. A full queue is retried with the
    /// configured backoff, at most `MAX_ENQUEUE_RETRIES` times, then the entry is
    /// dropped and counted. Returns `false` when the entry was not queued.
    pub async fn handle(&self, entry: Entry) -> bool {
        let (mut entry, tenant) = tenant_of(entry, &self.config.tenant_id);
        self.init_tenant(&tenant);
        let size = entry.size();
        let overflow = self.overflow();
        let mut backoff = Backoff::new(
            BackoffConfig {
                max_retries: MAX_ENQUEUE_RETRIES,
                ..self.config.backoff
            },
            self.cancel.clone(),
        );

        loop {
            match self.shards.offer(&tenant, entry, None, overflow).await {
                Ok(()) => return true,
                Err((EnqueueError::Stopping, _)) => return false,
                Err((EnqueueError::QueueFull, rejected)) => entry = rejected,
            }
            if !backoff.ongoing() {
                break;
            }
            self.metrics
                .enqueue_retries
                .get_or_create(&HostLabels {
                    host: self.host.clone(),
                })
                .inc();
            backoff.wait().await;
        }

        self.metrics
            .record_drop(&self.host, &tenant, DropReason::QueueFull, 1, size);
        debug!(client = %self.name, tenant, "shard queue is full, dropping entry");
        false
    }

    /// Drains queued batches for up to `queue.drain_timeout`, then cancels.
    pub async fn stop(&self) {
        self.shards.stop(self.config.queue.drain_timeout).await;
        info!(client = %self.name, "stopped endpoint");
    }

    /// Cancels in-flight deliveries without draining.
    pub async fn stop_now(&self) {
        self.shards.stop_now().await;
    }

    fn init_tenant(&self, tenant: &str) {
        let mut tenants = self.tenants.lock();
        if !tenants.contains(tenant) {
            self.metrics.init_tenant(&self.host, tenant);
            tenants.insert(tenant.to_string());
        }
    }
}
