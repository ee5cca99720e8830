// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sharded batching queues.
//!
//! Entries are routed to one of N shards by the fingerprint of their label set, so
//! every entry of a stream goes through the same shard and keeps its relative order.
//! Each shard holds:
//!
//! - one open [`Batch`] per tenant, guarded by an async mutex;
//! - a bounded ready queue of closed batches, sized in batches rather than entries;
//! - one worker task that sends ready batches sequentially.
//!
//! A worker also wakes up every `max(batch_wait / 10, 10ms)` to send open batches
//! older than `batch_wait`, which bounds the delivery latency of quiet streams.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::batch::{Batch, BatchError};
use crate::config::Config;
use crate::entry::Entry;
use crate::error::EnqueueError;
use crate::metrics::{ClientMetrics, DropReason};
use crate::sender::{Delivery, Sender};
use crate::wal::marker::MarkerHandler;

const MIN_WAIT_CHECK_FREQUENCY: Duration = Duration::from_millis(10);

/// What to do when a shard's ready queue has no room for a closed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overflow {
    /// Fail immediately with [`EnqueueError::QueueFull`].
    Reject,
    /// Wait up to the given duration for room, then fail with `QueueFull`.
    Wait(Duration),
    /// Wait until there is room or the client is stopped.
    WaitUntilStopped,
}

#[derive(Debug)]
struct QueuedBatch {
    tenant: String,
    batch: Batch,
}

struct QueueState {
    batches: HashMap<String, Batch>,
    // `None` once the queue is shut down
    ready: Option<mpsc::Sender<QueuedBatch>>,
}

struct ShardQueue {
    producers: Mutex<()>,
    state: Mutex<QueueState>,
    batch_size: usize,
    max_streams: usize,
    batch_wait: Duration,
    host: String,
    metrics: ClientMetrics,
    marker: Option<Arc<dyn MarkerHandler>>,
    cancel: CancellationToken,
}

impl ShardQueue {
    async fn append(
        &self,
        tenant: &str,
        entry: Entry,
        segment: Option<u64>,
        overflow: Overflow,
    ) -> Result<(), EnqueueError> {
        self.offer(tenant, entry, segment, overflow)
            .await
            .map_err(|(err, _)| err)
    }

    /// Like `append`, but hands the entry back when it was not queued.
    async fn offer(
        &self,
        tenant: &str,
        entry: Entry,
        segment: Option<u64>,
        overflow: Overflow,
    ) -> Result<(), (EnqueueError, Entry)> {
        // producers of a shard take turns so closed batches keep their order
        let _turn = self.producers.lock().await;

        let (ready, full) = {
            let mut state = self.state.lock().await;
            let Some(ready) = state.ready.clone() else {
                return Err((EnqueueError::Stopping, entry));
            };
            let full = match state.batches.get(tenant) {
                Some(open) if open.size_bytes_after(&entry) > self.batch_size => {
                    state.batches.remove(tenant)
                }
                _ => None,
            };
            (ready, full)
        };

        // the state lock is not held here, the sweep keeps running while we wait
        if let Some(full) = full {
            if let Err((full, err)) = self.push(&ready, tenant, full, overflow).await {
                self.state
                    .lock()
                    .await
                    .batches
                    .insert(tenant.to_string(), full);
                return Err((err, entry));
            }
        }

        let mut state = self.state.lock().await;
        let batch = state
            .batches
            .entry(tenant.to_string())
            .or_insert_with(|| Batch::new(self.max_streams, self.batch_size));
        self.admit(batch, tenant, entry, segment);
        Ok(())
    }

    fn admit(&self, batch: &mut Batch, tenant: &str, entry: Entry, segment: Option<u64>) {
        let size = entry.size();
        let Err(err) = batch.add(entry, segment) else {
            return;
        };
        error!(tenant, error = %err, "batch add err, dropping entry");
        let reason = match err {
            BatchError::MaxStreamsLimitExceeded { .. } => DropReason::StreamLimited,
            BatchError::SizeReached => DropReason::IngesterError,
        };
        self.metrics.record_drop(&self.host, tenant, reason, 1, size);
        // a dropped entry is resolved as far as the WAL is concerned
        if let (Some(marker), Some(segment)) = (&self.marker, segment) {
            marker.update_sent_data(segment, 1);
        }
    }

    /// Moves a closed batch onto the ready queue. On failure the batch is handed back.
    async fn push(
        &self,
        ready: &mpsc::Sender<QueuedBatch>,
        tenant: &str,
        batch: Batch,
        overflow: Overflow,
    ) -> Result<(), (Batch, EnqueueError)> {
        let permit = match overflow {
            Overflow::Reject => ready.try_reserve().map_err(|err| match err {
                TrySendError::Full(()) => EnqueueError::QueueFull,
                TrySendError::Closed(()) => EnqueueError::Stopping,
            }),
            Overflow::Wait(limit) => tokio::select! {
                () = self.cancel.cancelled() => Err(EnqueueError::Stopping),
                reserved = tokio::time::timeout(limit, ready.reserve()) => match reserved {
                    Ok(Ok(permit)) => Ok(permit),
                    Ok(Err(_)) => Err(EnqueueError::Stopping),
                    Err(_) => Err(EnqueueError::QueueFull),
                },
            },
            Overflow::WaitUntilStopped => tokio::select! {
                () = self.cancel.cancelled() => Err(EnqueueError::Stopping),
                reserved = ready.reserve() => reserved.map_err(|_| EnqueueError::Stopping),
            },
        };

        match permit {
            Ok(permit) => {
                permit.send(QueuedBatch {
                    tenant: tenant.to_string(),
                    batch,
                });
                Ok(())
            }
            Err(err) => Err((batch, err)),
        }
    }

    /// Batches due on an age-sweep tick: everything already queued, then every open
    /// batch older than `batch_wait`. Skipped while a producer holds the queue lock.
    fn drain_expired(&self, ready: &mut mpsc::Receiver<QueuedBatch>) -> Vec<QueuedBatch> {
        let Ok(mut state) = self.state.try_lock() else {
            return Vec::new();
        };

        let mut due = Vec::new();
        while let Ok(queued) = ready.try_recv() {
            due.push(queued);
        }

        let expired: Vec<String> = state
            .batches
            .iter()
            .filter(|(_, batch)| batch.age() >= self.batch_wait)
            .map(|(tenant, _)| tenant.clone())
            .collect();
        for tenant in expired {
            if let Some(batch) = state.batches.remove(&tenant) {
                due.push(QueuedBatch { tenant, batch });
            }
        }
        due
    }

    /// Closes every open batch onto the ready queue, then closes the queue so the
    /// worker exits once it is empty.
    async fn flush_and_shutdown(&self) {
        let _turn = self.producers.lock().await;
        let mut state = self.state.lock().await;
        let Some(ready) = state.ready.take() else {
            return;
        };
        let open: Vec<(String, Batch)> = state.batches.drain().collect();
        drop(state);

        for (tenant, batch) in open {
            tokio::select! {
                () = self.cancel.cancelled() => return,
                permit = ready.reserve() => match permit {
                    Ok(permit) => permit.send(QueuedBatch { tenant, batch }),
                    Err(_) => return,
                },
            }
        }
    }

    async fn deliver(&self, sender: &Sender, queued: QueuedBatch) {
        let delivery = sender.send_batch(&queued.tenant, &queued.batch).await;
        if delivery == Delivery::Cancelled {
            // never acknowledged, WAL sourced entries get replayed after a restart
            return;
        }
        if let Some(marker) = &self.marker {
            queued.batch.report_as_sent(marker.as_ref());
        }
    }
}

async fn run_shard(
    shard: usize,
    queue: Arc<ShardQueue>,
    mut ready: mpsc::Receiver<QueuedBatch>,
    sender: Arc<Sender>,
    check_every: Duration,
) {
    let mut ticker = tokio::time::interval(check_every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = queue.cancel.cancelled() => break,
            next = ready.recv() => match next {
                Some(queued) => queue.deliver(&sender, queued).await,
                None => break,
            },
            _ = ticker.tick() => {
                for queued in queue.drain_expired(&mut ready) {
                    queue.deliver(&sender, queued).await;
                }
            }
        }
    }
    debug!(shard, "shard worker stopped");
}

/// The shard pool of one endpoint.
pub(crate) struct Shards {
    queues: Vec<Arc<ShardQueue>>,
    workers: Mutex<JoinSet<()>>,
    cancel: CancellationToken,
    stopping: AtomicBool,
}

impl Shards {
    /// Spawns one worker per shard. Must be called from within a Tokio runtime.
    pub(crate) fn start(
        config: &Config,
        sender: Arc<Sender>,
        metrics: ClientMetrics,
        marker: Option<Arc<dyn MarkerHandler>>,
        cancel: CancellationToken,
    ) -> Self {
        let count = config.queue.shards();
        let capacity = config.queue.batches(config.batch_size);
        let check_every = (config.batch_wait / 10).max(MIN_WAIT_CHECK_FREQUENCY);

        let mut workers = JoinSet::new();
        let mut queues = Vec::with_capacity(count);
        for shard in 0..count {
            let (tx, rx) = mpsc::channel(capacity);
            let queue = Arc::new(ShardQueue {
                producers: Mutex::new(()),
                state: Mutex::new(QueueState {
                    batches: HashMap::new(),
                    ready: Some(tx),
                }),
                batch_size: config.batch_size,
                max_streams: config.max_streams,
                batch_wait: config.batch_wait,
                host: config.host(),
                metrics: metrics.clone(),
                marker: marker.clone(),
                cancel: cancel.clone(),
            });
            workers.spawn(run_shard(
                shard,
                Arc::clone(&queue),
                rx,
                Arc::clone(&sender),
                check_every,
            ));
            queues.push(queue);
        }

        Shards {
            queues,
            workers: Mutex::new(workers),
            cancel,
            stopping: AtomicBool::new(false),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.queues.len()
    }

    pub(crate) async fn enqueue(
        &self,
        tenant: &str,
        entry: Entry,
        segment: Option<u64>,
        overflow: Overflow,
    ) -> Result<(), EnqueueError> {
        self.offer(tenant, entry, segment, overflow)
            .await
            .map_err(|(err, _)| err)
    }

    /// Queues `entry` on the shard owning its stream, returning it on failure so the
    /// caller can try again.
    pub(crate) async fn offer(
        &self,
        tenant: &str,
        entry: Entry,
        segment: Option<u64>,
        overflow: Overflow,
    ) -> Result<(), (EnqueueError, Entry)> {
        if self.stopping.load(Ordering::Acquire) {
            return Err((EnqueueError::Stopping, entry));
        }
        let shard = (entry.fingerprint() % self.queues.len() as u64) as usize;
        self.queues[shard]
            .offer(tenant, entry, segment, overflow)
            .await
    }

    /// Stops accepting entries, flushes open batches and lets the workers send
    /// everything queued. After `drain_timeout` the remaining work is cancelled.
    pub(crate) async fn stop(&self, drain_timeout: Duration) {
        self.stopping.store(true, Ordering::Release);
        let mut workers = self.workers.lock().await;

        let drained = tokio::time::timeout(drain_timeout, async {
            join_all(self.queues.iter().map(|queue| queue.flush_and_shutdown())).await;
            while workers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                ?drain_timeout,
                "timed out draining shard queues, cancelling in-flight batches"
            );
        }

        self.cancel.cancel();
        while workers.join_next().await.is_some() {}
    }

    /// Cancels in-flight work without draining.
    pub(crate) async fn stop_now(&self) {
        self.stopping.store(true, Ordering::Release);
        self.cancel.cancel();
        let mut workers = self.workers.lock().await;
        while workers.join_next().await.is_some() {}
    }
}
