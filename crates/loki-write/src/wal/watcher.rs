// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tails WAL segments in order and replays their records into a [`WriteTo`].
//!
//! The watcher reads whatever was appended to the current segment, decodes every
//! complete record, and keeps the torn tail (if any) for the next read. It moves to
//! the next segment once that segment exists and the current one is read to the end.
//! At the tail it sleeps until the writer notifies it or the read timer fires. The
//! timer starts at `min_read_frequency` and doubles up to `max_read_frequency` while
//! nothing new shows up.

use std::io;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::record::{decode_record, Kind};
use super::{list_segments, segment_path, WalError, WatchConfig, WriteSubscriber, WriteTo};
use crate::metrics::{ClientKindLabels, ClientLabels, WatcherMetrics};

pub struct Watcher {
    client: String,
    notify: Arc<Notify>,
    cancel: CancellationToken,
    drain: CancellationToken,
    drain_timeout: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Watcher {
    /// Starts replaying from the first segment after `last_marked`, or from the oldest
    /// segment. Must be called from within a Tokio runtime.
    pub fn start(
        dir: PathBuf,
        client: &str,
        config: WatchConfig,
        to: Arc<dyn WriteTo>,
        last_marked: Option<u64>,
        metrics: WatcherMetrics,
    ) -> Arc<Self> {
        let notify = Arc::new(Notify::new());
        let cancel = CancellationToken::new();
        let drain = CancellationToken::new();
        let replay = Replay {
            dir,
            client: client.to_string(),
            config,
            to,
            metrics,
            notify: Arc::clone(&notify),
            cancel: cancel.clone(),
            drain: drain.clone(),
        };
        let first = last_marked.map_or(0, |segment| segment + 1);
        info!(client, first, "starting WAL watcher");
        let task = tokio::spawn(replay.run(first));

        Arc::new(Watcher {
            client: client.to_string(),
            notify,
            cancel,
            drain,
            drain_timeout: config.drain_timeout,
            task: Mutex::new(Some(task)),
        })
    }

    /// Replays everything written so far, then stops. Gives up after the drain timeout.
    pub async fn drain(&self) {
        self.drain.cancel();
        self.notify.notify_one();
        let task = self.task.lock().take();
        let Some(mut task) = task else {
            return;
        };
        match tokio::time::timeout(self.drain_timeout, &mut task).await {
            Ok(Ok(())) => info!(client = %self.client, "drained WAL"),
            Ok(Err(err)) => warn!(client = %self.client, error = %err, "WAL watcher task failed"),
            Err(_) => {
                warn!(client = %self.client, timeout = ?self.drain_timeout, "WAL drain timed out, stopping");
                self.cancel.cancel();
                if let Err(err) = task.await {
                    warn!(client = %self.client, error = %err, "WAL watcher task failed");
                }
            }
        }
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(client = %self.client, error = %err, "WAL watcher task failed");
            }
        }
        info!(client = %self.client, "stopped WAL watcher");
    }
}

impl WriteSubscriber for Watcher {
    fn notify_write(&self) {
        self.notify.notify_one();
    }
}

struct Replay {
    dir: PathBuf,
    client: String,
    config: WatchConfig,
    to: Arc<dyn WriteTo>,
    metrics: WatcherMetrics,
    notify: Arc<Notify>,
    cancel: CancellationToken,
    drain: CancellationToken,
}

impl Replay {
    async fn run(self, first: u64) {
        let mut next = first;
        let mut read_delay = self.config.min_read_frequency;
        loop {
            let segment = match list_segments(&self.dir) {
                Ok(segments) => segments.into_iter().find(|segment| *segment >= next),
                Err(err) => {
                    error!(client = %self.client, error = %err, "failed to list WAL segments");
                    None
                }
            };
            let Some(segment) = segment else {
                if self.drain.is_cancelled() || self.wait(&mut read_delay).await.is_break() {
                    return;
                }
                continue;
            };

            match self.watch_segment(segment).await {
                Ok(ControlFlow::Continue(())) => {}
                Ok(ControlFlow::Break(())) => return,
                Err(WalError::Io(err)) if err.kind() == io::ErrorKind::NotFound => {
                    debug!(client = %self.client, segment, "WAL segment is gone, skipping");
                }
                Err(err) => {
                    self.metrics
                        .replay_errors
                        .get_or_create(&self.client_labels())
                        .inc();
                    error!(client = %self.client, segment, error = %err, "failed to replay WAL segment");
                }
            }
            next = segment + 1;
        }
    }

    /// Replays one segment until a later segment exists and this one is read to the
    /// end.
    async fn watch_segment(&self, segment: u64) -> Result<ControlFlow<()>, WalError> {
        let mut file = tokio::fs::File::open(segment_path(&self.dir, segment)).await?;
        self.metrics
            .current_segment
            .get_or_create(&self.client_labels())
            .set(segment as i64);
        debug!(client = %self.client, segment, "watching WAL segment");

        let mut buf = Vec::new();
        let mut read_delay = self.config.min_read_frequency;
        loop {
            // checked before reading so no write to this segment can be missed
            let has_next = list_segments(&self.dir)?.iter().any(|s| *s > segment);
            let read = file.read_to_end(&mut buf).await?;

            let (consumed, flow) = self.replay(segment, &buf).await?;
            buf.drain(..consumed);
            if flow.is_break() {
                return Ok(flow);
            }

            if has_next {
                if !buf.is_empty() {
                    warn!(
                        client = %self.client,
                        segment,
                        bytes = buf.len(),
                        "discarding incomplete record at the end of a finished segment"
                    );
                }
                return Ok(ControlFlow::Continue(()));
            }
            if read > 0 {
                read_delay = self.config.min_read_frequency;
                continue;
            }
            if self.drain.is_cancelled() {
                return Ok(ControlFlow::Break(()));
            }
            if self.wait(&mut read_delay).await.is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }
    }

    /// Decodes and replays the complete records of `buf`, returning how many bytes were
    /// used.
    async fn replay(&self, segment: u64, buf: &[u8]) -> Result<(usize, ControlFlow<()>), WalError> {
        let mut offset = 0;
        while let Some((record, used)) = decode_record(&buf[offset..])? {
            offset += used;
            self.metrics
                .records_read
                .get_or_create(&ClientKindLabels {
                    client: self.client.clone(),
                    kind: record.kind_name().to_string(),
                })
                .inc();

            match record.kind {
                Some(Kind::Series(series)) => {
                    self.to.store_series(std::slice::from_ref(&series), segment);
                }
                Some(Kind::Entries(entries)) => {
                    let appended = tokio::select! {
                        () = self.cancel.cancelled() => return Ok((offset, ControlFlow::Break(()))),
                        appended = self.to.append_entries(entries, segment) => appended,
                    };
                    if let Err(err) = appended {
                        debug!(client = %self.client, error = %err, "WAL consumer refused entries, stopping replay");
                        return Ok((offset, ControlFlow::Break(())));
                    }
                }
                None => {}
            }
        }
        Ok((offset, ControlFlow::Continue(())))
    }

    /// Sleeps until new data may be available. Breaks on cancellation.
    async fn wait(&self, read_delay: &mut Duration) -> ControlFlow<()> {
        tokio::select! {
            () = self.cancel.cancelled() => return ControlFlow::Break(()),
            () = self.drain.cancelled() => {}
            () = self.notify.notified() => {}
            () = tokio::time::sleep(*read_delay) => {
                *read_delay = (*read_delay * 2).min(self.config.max_read_frequency);
            }
        }
        ControlFlow::Continue(())
    }

    fn client_labels(&self) -> ClientLabels {
        ClientLabels {
            client: self.client.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{label_set, Entry};
    use crate::error::EnqueueError;
    use crate::metrics::Registry;
    use crate::proto::EntryAdapter;
    use crate::wal::record::{RefEntries, RefSeries, WalRecord};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::Path;
    use std::time::SystemTime;

    #[derive(Default)]
    struct Recorder {
        series: Mutex<HashMap<u64, String>>,
        lines: Mutex<Vec<(u64, String)>>,
    }

    #[async_trait]
    impl WriteTo for Recorder {
        fn store_series(&self, series: &[RefSeries], _segment: u64) {
            let mut known = self.series.lock();
            for s in series {
                known.insert(s.series_ref, s.labels[0].value.clone());
            }
        }

        fn series_reset(&self, _segment: u64) {}

        async fn append_entries(&self, entries: RefEntries, segment: u64) -> Result<(), EnqueueError> {
            let mut lines = self.lines.lock();
            for entry in entries.entries {
                lines.push((segment, entry.line));
            }
            Ok(())
        }
    }

    fn write_segment(dir: &Path, segment: u64, lines: &[&str], torn_tail: bool) {
        let labels = label_set([("app", "api")]);
        let mut buf = Vec::new();
        WalRecord::series(RefSeries::new(0, &labels))
            .encode_to(&mut buf)
            .unwrap();
        for line in lines {
            let entry = Entry::new(labels.clone(), SystemTime::now(), *line);
            WalRecord::entries(RefEntries {
                series_ref: 0,
                entries: vec![EntryAdapter::from(&entry)],
            })
            .encode_to(&mut buf)
            .unwrap();
        }
        if torn_tail {
            buf.extend_from_slice(&[0x40, 0x01, 0x02]);
        }
        std::fs::write(segment_path(dir, segment), buf).unwrap();
    }

    fn config() -> WatchConfig {
        WatchConfig {
            min_read_frequency: Duration::from_millis(5),
            max_read_frequency: Duration::from_millis(20),
            drain_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn drain_replays_every_segment_in_order() {
        let dir = tempfile::tempdir().unwrap();
        write_segment(dir.path(), 0, &["a", "b"], true);
        write_segment(dir.path(), 1, &["c"], false);
        write_segment(dir.path(), 3, &["d"], false);

        let recorder = Arc::new(Recorder::default());
        let watcher = Watcher::start(
            dir.path().to_path_buf(),
            "primary",
            config(),
            recorder.clone(),
            None,
            WatcherMetrics::new(&Registry::new()),
        );
        watcher.drain().await;

        let lines = recorder.lines.lock().clone();
        let expected: Vec<(u64, String)> = [(0, "a"), (0, "b"), (1, "c"), (3, "d")]
            .into_iter()
            .map(|(segment, line)| (segment, line.to_string()))
            .collect();
        assert_eq!(lines, expected);
        assert_eq!(recorder.series.lock().get(&0).map(String::as_str), Some("api"));
    }

    #[tokio::test]
    async fn starts_after_last_marked_segment() {
        let dir = tempfile::tempdir().unwrap();
        write_segment(dir.path(), 0, &["old"], false);
        write_segment(dir.path(), 1, &["old"], false);
        write_segment(dir.path(), 2, &["new"], false);

        let recorder = Arc::new(Recorder::default());
        let watcher = Watcher::start(
            dir.path().to_path_buf(),
            "primary",
            config(),
            recorder.clone(),
            Some(1),
            WatcherMetrics::new(&Registry::new()),
        );
        watcher.drain().await;
        assert_eq!(*recorder.lines.lock(), vec![(2, "new".to_string())]);
    }

    #[tokio::test]
    async fn picks_up_appended_records() {
        let dir = tempfile::tempdir().unwrap();
        write_segment(dir.path(), 0, &["first"], false);

        let recorder = Arc::new(Recorder::default());
        let watcher = Watcher::start(
            dir.path().to_path_buf(),
            "primary",
            config(),
            recorder.clone(),
            None,
            WatcherMetrics::new(&Registry::new()),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(recorder.lines.lock().len(), 1);

        write_segment(dir.path(), 1, &["second"], false);
        watcher.notify_write();
        watcher.drain().await;
        assert_eq!(recorder.lines.lock().len(), 2);
    }

    #[tokio::test]
    async fn stop_returns_while_tailing() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = Watcher::start(
            dir.path().to_path_buf(),
            "primary",
            config(),
            Arc::new(Recorder::default()),
            None,
            WatcherMetrics::new(&Registry::new()),
        );
        tokio::time::timeout(Duration::from_secs(1), watcher.stop())
            .await
            .unwrap();
    }
}
