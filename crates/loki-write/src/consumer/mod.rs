// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ingress side of the pipeline.
//!
//! Upstream stages hand entries to a [`Consumer`] one at a time through the channel
//! returned by [`Consumer::chan`]. The variants differ in durability and fan-out:
//!
//! - [`FanoutConsumer`]: a bare [`crate::client::Client`] per config, no durability;
//! - [`InMemoryConsumer`]: endpoints fed directly from a single fan-in task;
//! - [`WalConsumer`]: entries go to the WAL first and are delivered by replay.

mod fanout;
mod inmemory;
mod wal;

pub use fanout::FanoutConsumer;
pub use inmemory::InMemoryConsumer;
pub use wal::WalConsumer;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::client::client_name;
use crate::config::Config;
use crate::entry::Entry;
use crate::error::ClientError;

/// Entries buffered between a producer and a consumer's fan-in task.
pub const INGRESS_CAPACITY: usize = 128;

#[async_trait]
pub trait Consumer: Send + Sync {
    /// Channel accepting entries. Sending blocks while the consumer is saturated.
    fn chan(&self) -> mpsc::Sender<Entry>;

    /// Stops accepting entries and releases every resource, delivering what is
    /// already buffered in memory on a best-effort basis.
    async fn stop(&self);

    /// Like [`Consumer::stop`], but also finishes durable replay first where the
    /// consumer has any.
    async fn stop_and_drain(&self) {
        self.stop().await;
    }
}

/// Destination of a fan-in loop.
#[async_trait]
pub(crate) trait Forward: Send + Sync {
    async fn forward(&self, entry: Entry);
}

/// A bounded entry channel plus the task that forwards from it.
pub(crate) struct Ingress {
    tx: mpsc::Sender<Entry>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Ingress {
    pub(crate) fn spawn(target: Arc<dyn Forward>) -> Self {
        let (tx, rx) = mpsc::channel(INGRESS_CAPACITY);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_ingress(rx, target, cancel.clone()));
        Ingress {
            tx,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    pub(crate) fn chan(&self) -> mpsc::Sender<Entry> {
        self.tx.clone()
    }

    /// Closes the channel and waits until everything already buffered is forwarded.
    pub(crate) async fn close(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(error = %err, "ingress task failed");
            }
        }
    }
}

async fn run_ingress(
    mut rx: mpsc::Receiver<Entry>,
    target: Arc<dyn Forward>,
    cancel: CancellationToken,
) {
    loop {
        let entry = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(entry) => entry,
                None => break,
            },
        };
        target.forward(entry).await;
    }

    rx.close();
    while let Some(entry) = rx.recv().await {
        target.forward(entry).await;
    }
}

/// Resolves the name of every config, rejecting an empty list and duplicates.
pub(crate) fn unique_names(configs: &[Config]) -> Result<Vec<String>, ClientError> {
    if configs.is_empty() {
        return Err(ClientError::NoClients);
    }
    let mut seen = HashSet::with_capacity(configs.len());
    configs
        .iter()
        .map(|config| {
            let name = client_name(config);
            if !seen.insert(name.clone()) {
                return Err(ClientError::DuplicateClient(name));
            }
            Ok(name)
        })
        .collect()
}
