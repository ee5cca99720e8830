// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::warn;

use super::marker::{Marker, MarkerHandler};
use super::record::{RefEntries, RefSeries};
use super::WriteTo;
use crate::endpoint::Endpoint;
use crate::entry::LabelSet;
use crate::error::EnqueueError;
use crate::shards::Overflow;

#[derive(Debug, Clone)]
struct CachedSeries {
    labels: LabelSet,
    segment: u64,
}

/// Replays WAL records into an endpoint, reporting received entries to the marker.
pub struct WalClient {
    endpoint: Arc<Endpoint>,
    marker: Arc<Marker>,
    series: RwLock<HashMap<u64, CachedSeries>>,
}

impl WalClient {
    pub fn new(endpoint: Arc<Endpoint>, marker: Arc<Marker>) -> Self {
        WalClient {
            endpoint,
            marker,
            series: RwLock::new(HashMap::new()),
        }
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    pub fn marker(&self) -> &Arc<Marker> {
        &self.marker
    }

    /// Number of cached series.
    pub fn series_count(&self) -> usize {
        self.series.read().len()
    }

    fn labels(&self, series_ref: u64) -> Option<LabelSet> {
        self.series
            .read()
            .get(&series_ref)
            .map(|cached| cached.labels.clone())
    }
}

#[async_trait]
impl WriteTo for WalClient {
    fn store_series(&self, series: &[RefSeries], segment: u64) {
        let mut cache = self.series.write();
        for s in series {
            cache.insert(
                s.series_ref,
                CachedSeries {
                    labels: s.label_set(),
                    segment,
                },
            );
        }
    }

    fn series_reset(&self, segment: u64) {
        self.series
            .write()
            .retain(|_, cached| cached.segment > segment);
    }

    async fn append_entries(&self, entries: RefEntries, segment: u64) -> Result<(), EnqueueError> {
        let Some(labels) = self.labels(entries.series_ref) else {
            warn!(
                client = %self.endpoint.name(),
                series_ref = entries.series_ref,
                segment,
                "entries reference an unknown series, skipping"
            );
            return Ok(());
        };

        let entries = entries.into_entries(&labels);
        self.marker.update_received_data(segment, entries.len());
        for entry in entries {
            self.endpoint
                .enqueue(entry, Some(segment), Overflow::WaitUntilStopped)
                .await?;
        }
        Ok(())
    }
}
