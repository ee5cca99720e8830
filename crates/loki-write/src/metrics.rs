// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Metrics for the shipping pipeline.
//!
//! Every component receives a [`Registry`] at construction instead of reaching for a
//! process global. Registration goes through [`Registry::get_or_register`], so building
//! the same component twice against one registry (a restart, or two managers sharing a
//! registry) hands back the collectors that already exist.

use std::any::Any;
use std::collections::HashMap;

use parking_lot::Mutex;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::{Metric, Registry as PromRegistry};
use tracing::warn;

/// Shared metrics registry with get-or-create registration.
#[derive(Default)]
pub struct Registry {
    inner: Mutex<PromRegistry>,
    collectors: Mutex<HashMap<String, Box<dyn Any + Send + Sync>>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("collectors", &self.collectors.lock().len())
            .finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the collector registered under `name`, registering the one built by
    /// `make` if there is none yet.
    pub fn get_or_register<M, F>(&self, name: &str, help: &str, make: F) -> M
    where
        M: Metric + Clone,
        F: FnOnce() -> M,
    {
        let mut collectors = self.collectors.lock();
        if let Some(existing) = collectors.get(name) {
            if let Some(metric) = existing.downcast_ref::<M>() {
                return metric.clone();
            }
            warn!(
                metric = name,
                "metric already registered with another type, using an unregistered collector"
            );
            return make();
        }

        let metric = make();
        self.inner.lock().register(name, help, metric.clone());
        collectors.insert(name.to_string(), Box::new(metric.clone()));
        metric
    }

    /// Renders every registered collector in the Prometheus text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.inner.lock())?;
        Ok(buffer)
    }
}

/// Why a batch or entry was given up on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DropReason {
    IngesterError,
    RateLimited,
    StreamLimited,
    QueueFull,
}

impl DropReason {
    pub const ALL: [DropReason; 4] = [
        DropReason::IngesterError,
        DropReason::RateLimited,
        DropReason::StreamLimited,
        DropReason::QueueFull,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DropReason::IngesterError => "ingester_error",
            DropReason::RateLimited => "rate_limited",
            DropReason::StreamLimited => "stream_limited",
            DropReason::QueueFull => "queue_full",
        }
    }
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HostLabels {
    pub host: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HostTenantLabels {
    pub host: String,
    pub tenant: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HostTenantReasonLabels {
    pub host: String,
    pub tenant: String,
    pub reason: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub status_code: String,
    pub host: String,
    pub tenant: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ClientLabels {
    pub client: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct KindLabels {
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ClientKindLabels {
    pub client: String,
    pub kind: String,
}

type HistogramFamily<L> = Family<L, Histogram, fn() -> Histogram>;

fn request_duration_histogram() -> Histogram {
    Histogram::new(exponential_buckets(0.005, 2.0, 12))
}

/// Delivery metrics shared by every endpoint built on the same registry.
#[derive(Clone, Debug)]
pub struct ClientMetrics {
    pub encoded_bytes: Family<HostTenantLabels, Counter>,
    pub sent_bytes: Family<HostTenantLabels, Counter>,
    pub sent_entries: Family<HostTenantLabels, Counter>,
    pub dropped_bytes: Family<HostTenantReasonLabels, Counter>,
    pub dropped_entries: Family<HostTenantReasonLabels, Counter>,
    pub batch_retries: Family<HostTenantLabels, Counter>,
    pub enqueue_retries: Family<HostLabels, Counter>,
    pub request_duration: HistogramFamily<RequestLabels>,
}

impl ClientMetrics {
    pub fn new(registry: &Registry) -> Self {
        ClientMetrics {
            encoded_bytes: registry.get_or_register(
                "loki_write_encoded_bytes",
                "Number of bytes encoded and ready to send.",
                Family::default,
            ),
            sent_bytes: registry.get_or_register(
                "loki_write_sent_bytes",
                "Number of bytes sent.",
                Family::default,
            ),
            sent_entries: registry.get_or_register(
                "loki_write_sent_entries",
                "Number of log entries sent to the ingester.",
                Family::default,
            ),
            dropped_bytes: registry.get_or_register(
                "loki_write_dropped_bytes",
                "Number of bytes dropped because of failed delivery or admission.",
                Family::default,
            ),
            dropped_entries: registry.get_or_register(
                "loki_write_dropped_entries",
                "Number of log entries dropped because of failed delivery or admission.",
                Family::default,
            ),
            batch_retries: registry.get_or_register(
                "loki_write_batch_retries",
                "Number of times batches have had to be retried.",
                Family::default,
            ),
            enqueue_retries: registry.get_or_register(
                "loki_write_enqueue_retries",
                "Number of times an entry could not be enqueued because a shard queue was full.",
                Family::default,
            ),
            request_duration: registry.get_or_register(
                "loki_write_request_duration_seconds",
                "Duration of push requests.",
                || {
                    HistogramFamily::<RequestLabels>::new_with_constructor(
                        request_duration_histogram,
                    )
                },
            ),
        }
    }

    /// Zero-initializes every series for a newly seen tenant so that rates are defined
    /// from the first scrape.
    pub fn init_tenant(&self, host: &str, tenant: &str) {
        let labels = host_tenant(host, tenant);
        for family in [
            &self.encoded_bytes,
            &self.sent_bytes,
            &self.sent_entries,
            &self.batch_retries,
        ] {
            family.get_or_create(&labels);
        }
        for reason in DropReason::ALL {
            let labels = host_tenant_reason(host, tenant, reason);
            self.dropped_bytes.get_or_create(&labels);
            self.dropped_entries.get_or_create(&labels);
        }
    }

    pub fn record_drop(
        &self,
        host: &str,
        tenant: &str,
        reason: DropReason,
        entries: usize,
        bytes: usize,
    ) {
        let labels = host_tenant_reason(host, tenant, reason);
        self.dropped_entries
            .get_or_create(&labels)
            .inc_by(entries as u64);
        self.dropped_bytes.get_or_create(&labels).inc_by(bytes as u64);
    }

    pub fn dropped_entries_total(&self, host: &str, tenant: &str, reason: DropReason) -> u64 {
        self.dropped_entries
            .get_or_create(&host_tenant_reason(host, tenant, reason))
            .get()
    }

    pub fn sent_entries_total(&self, host: &str, tenant: &str) -> u64 {
        self.sent_entries
            .get_or_create(&host_tenant(host, tenant))
            .get()
    }

    pub fn batch_retries_total(&self, host: &str, tenant: &str) -> u64 {
        self.batch_retries
            .get_or_create(&host_tenant(host, tenant))
            .get()
    }
}

pub(crate) fn host_tenant(host: &str, tenant: &str) -> HostTenantLabels {
    HostTenantLabels {
        host: host.to_string(),
        tenant: tenant.to_string(),
    }
}

pub(crate) fn host_tenant_reason(
    host: &str,
    tenant: &str,
    reason: DropReason,
) -> HostTenantReasonLabels {
    HostTenantReasonLabels {
        host: host.to_string(),
        tenant: tenant.to_string(),
        reason: reason.as_str().to_string(),
    }
}

/// WAL writer metrics.
#[derive(Clone, Debug)]
pub struct WriterMetrics {
    pub segments_created: Counter,
    pub segments_deleted: Counter,
    pub records_written: Family<KindLabels, Counter>,
    pub current_segment: Gauge,
}

impl WriterMetrics {
    pub fn new(registry: &Registry) -> Self {
        WriterMetrics {
            segments_created: registry.get_or_register(
                "loki_write_wal_segments_created",
                "Number of WAL segments created.",
                Counter::default,
            ),
            segments_deleted: registry.get_or_register(
                "loki_write_wal_segments_deleted",
                "Number of WAL segments reclaimed.",
                Counter::default,
            ),
            records_written: registry.get_or_register(
                "loki_write_wal_records_written",
                "Number of WAL records written, by record kind.",
                Family::default,
            ),
            current_segment: registry.get_or_register(
                "loki_write_wal_writer_current_segment",
                "Segment the WAL writer is appending to.",
                Gauge::default,
            ),
        }
    }
}

/// WAL watcher metrics, labelled by client name.
#[derive(Clone, Debug)]
pub struct WatcherMetrics {
    pub records_read: Family<ClientKindLabels, Counter>,
    pub current_segment: Family<ClientLabels, Gauge>,
    pub replay_errors: Family<ClientLabels, Counter>,
}

impl WatcherMetrics {
    pub fn new(registry: &Registry) -> Self {
        WatcherMetrics {
            records_read: registry.get_or_register(
                "loki_write_wal_watcher_records_read",
                "Number of WAL records read by a watcher, by record kind.",
                Family::default,
            ),
            current_segment: registry.get_or_register(
                "loki_write_wal_watcher_current_segment",
                "Segment a watcher is currently reading.",
                Family::default,
            ),
            replay_errors: registry.get_or_register(
                "loki_write_wal_watcher_replay_errors",
                "Number of WAL segment read or decode errors seen by a watcher.",
                Family::default,
            ),
        }
    }
}

/// Marker progress, labelled by client name.
#[derive(Clone, Debug)]
pub struct MarkerMetrics {
    pub last_marked_segment: Family<ClientLabels, Gauge>,
}

impl MarkerMetrics {
    pub fn new(registry: &Registry) -> Self {
        MarkerMetrics {
            last_marked_segment: registry.get_or_register(
                "loki_write_wal_marker_last_marked_segment",
                "Last segment fully delivered by a client.",
                Family::default,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registering_twice_returns_the_same_collector() {
        let registry = Registry::new();
        let first = ClientMetrics::new(&registry);
        let second = ClientMetrics::new(&registry);

        first
            .sent_entries
            .get_or_create(&host_tenant("localhost", ""))
            .inc();
        assert_eq!(second.sent_entries_total("localhost", ""), 1);

        let encoded = registry.encode().unwrap();
        assert_eq!(
            encoded
                .matches("# HELP loki_write_sent_entries ")
                .count(),
            1
        );
    }

    #[test]
    fn mismatched_type_does_not_panic() {
        let registry = Registry::new();
        let counter: Counter = registry.get_or_register("x", "help", Counter::default);
        counter.inc();
        let gauge: Gauge = registry.get_or_register("x", "help", Gauge::default);
        gauge.set(3);
        assert_eq!(counter.get(), 1);
    }

    #[test]
    fn tenant_initialization_creates_every_reason() {
        let registry = Registry::new();
        let metrics = ClientMetrics::new(&registry);
        metrics.init_tenant("localhost:3100", "team-a");

        let encoded = registry.encode().unwrap();
        for reason in DropReason::ALL {
            assert!(encoded.contains(&format!(
                "loki_write_dropped_entries_total{{host=\"localhost:3100\",tenant=\"team-a\",reason=\"{reason}\"}} 0"
            )));
        }
    }
}
