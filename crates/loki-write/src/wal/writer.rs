// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::marker::Marker;
use super::record::{RefEntries, RefSeries, WalRecord};
use super::{list_segments, segment_path, Config, WalError, WriteSubscriber, WriteTo};
use crate::consumer::INGRESS_CAPACITY;
use crate::entry::{Entry, LabelSet};
use crate::metrics::{KindLabels, Registry, WriterMetrics};
use crate::proto::EntryAdapter;

/// Entries written between two flushes at most.
const MAX_BURST: usize = 1024;

/// Appends entries to the active segment and rotates segments every
/// `max_segment_age`.
pub struct Writer {
    tx: mpsc::Sender<Entry>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    dir: PathBuf,
    max_segment_age: Duration,
    current: AtomicU64,
    write_subscribers: RwLock<Vec<Arc<dyn WriteSubscriber>>>,
    cleanup_subscribers: RwLock<Vec<Arc<dyn WriteTo>>>,
    markers: RwLock<Vec<Arc<Marker>>>,
    metrics: WriterMetrics,
}

impl Writer {
    /// Opens a new segment after the highest existing one and starts writing. Must be
    /// called from within a Tokio runtime.
    pub fn new(config: &Config, registry: &Registry) -> Result<Self, WalError> {
        std::fs::create_dir_all(&config.dir)?;
        let segment = list_segments(&config.dir)?
            .last()
            .map_or(0, |last| last + 1);
        let file = open_segment(&config.dir, segment)?;

        let metrics = WriterMetrics::new(registry);
        metrics.segments_created.inc();
        metrics.current_segment.set(segment as i64);
        info!(dir = %config.dir.display(), segment, "starting WAL writer");

        let shared = Arc::new(Shared {
            dir: config.dir.clone(),
            max_segment_age: config.max_segment_age,
            current: AtomicU64::new(segment),
            write_subscribers: RwLock::new(Vec::new()),
            cleanup_subscribers: RwLock::new(Vec::new()),
            markers: RwLock::new(Vec::new()),
            metrics,
        });
        let (tx, rx) = mpsc::channel(INGRESS_CAPACITY);
        let cancel = CancellationToken::new();
        let state = WriterState {
            shared: Arc::clone(&shared),
            segment,
            file: BufWriter::new(file),
            series: HashMap::new(),
            next_ref: 0,
            buf: Vec::new(),
            written: 0,
        };
        let task = tokio::spawn(run_writer(state, rx, cancel.clone()));
        Ok(Writer {
            tx,
            shared,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn chan(&self) -> mpsc::Sender<Entry> {
        self.tx.clone()
    }

    pub fn dir(&self) -> &Path {
        &self.shared.dir
    }

    pub fn current_segment(&self) -> u64 {
        self.shared.current.load(Ordering::Acquire)
    }

    pub fn subscribe_write(&self, subscriber: Arc<dyn WriteSubscriber>) {
        self.shared.write_subscribers.write().push(subscriber);
    }

    /// Registers an adapter whose series cache is reset when segments are deleted.
    pub fn subscribe_cleanup(&self, subscriber: Arc<dyn WriteTo>) {
        self.shared.cleanup_subscribers.write().push(subscriber);
    }

    /// Segments are only deleted once every tracked marker has marked them.
    pub fn track_marker(&self, marker: Arc<Marker>) {
        self.shared.markers.write().push(marker);
    }

    /// Stops accepting entries, writes what is buffered and syncs the segment.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(error = %err, "WAL writer task failed");
            }
        }
    }
}

impl Shared {
    fn notify_write(&self) {
        let subscribers = self.write_subscribers.read().clone();
        for subscriber in subscribers {
            subscriber.notify_write();
        }
    }

    /// Highest segment every marker agrees on. `Some(None)` when there is no marker to
    /// consult, `None` when some marker has not marked anything yet.
    fn reclaim_limit(&self) -> Option<Option<u64>> {
        let markers = self.markers.read();
        let mut limit = None;
        for marker in markers.iter() {
            let marked = marker.last_marked_segment()?;
            limit = Some(limit.map_or(marked, |limit: u64| limit.min(marked)));
        }
        Some(limit)
    }

    /// Deletes segments older than the active one that are old enough and marked by
    /// every client. Returns the number of deleted segments.
    async fn reclaim(&self, active: u64) -> Result<usize, WalError> {
        let Some(limit) = self.reclaim_limit() else {
            return Ok(0);
        };
        let mut deleted = 0;
        for segment in list_segments(&self.dir)? {
            if segment >= active || limit.is_some_and(|limit| segment > limit) {
                break;
            }
            let path = segment_path(&self.dir, segment);
            let age = tokio::fs::metadata(&path)
                .await?
                .modified()?
                .elapsed()
                .unwrap_or_default();
            if age < self.max_segment_age {
                continue;
            }
            tokio::fs::remove_file(&path).await?;
            self.metrics.segments_deleted.inc();
            deleted += 1;
            debug!(segment, "deleted WAL segment");

            let subscribers = self.cleanup_subscribers.read().clone();
            for subscriber in subscribers {
                subscriber.series_reset(segment);
            }
        }
        Ok(deleted)
    }
}

fn open_segment(dir: &Path, segment: u64) -> Result<File, WalError> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(segment_path(dir, segment))?;
    Ok(File::from_std(file))
}

struct WriterState {
    shared: Arc<Shared>,
    segment: u64,
    file: BufWriter<File>,
    // series written to the active segment
    series: HashMap<LabelSet, u64>,
    next_ref: u64,
    buf: Vec<u8>,
    // bytes appended to the active segment
    written: u64,
}

impl WriterState {
    async fn write(&mut self, entry: &Entry) {
        if let Err(err) = self.append(entry).await {
            error!(segment = self.segment, error = %err, "failed to write entry to WAL");
        }
    }

    async fn append(&mut self, entry: &Entry) -> Result<(), WalError> {
        self.buf.clear();
        let (series_ref, new_series) = match self.series.get(&entry.labels) {
            Some(series_ref) => (*series_ref, false),
            None => {
                let series_ref = self.next_ref;
                WalRecord::series(RefSeries::new(series_ref, &entry.labels))
                    .encode_to(&mut self.buf)?;
                (series_ref, true)
            }
        };
        WalRecord::entries(RefEntries {
            series_ref,
            entries: vec![EntryAdapter::from(entry)],
        })
        .encode_to(&mut self.buf)?;
        self.file.write_all(&self.buf).await?;
        self.written += self.buf.len() as u64;

        if new_series {
            self.next_ref += 1;
            self.series.insert(entry.labels.clone(), series_ref);
            self.count("series");
        }
        self.count("entries");
        Ok(())
    }

    fn count(&self, kind: &str) {
        self.shared
            .metrics
            .records_written
            .get_or_create(&KindLabels {
                kind: kind.to_string(),
            })
            .inc();
    }

    async fn flush(&mut self) {
        if let Err(err) = self.file.flush().await {
            error!(segment = self.segment, error = %err, "failed to flush WAL segment");
        }
        self.shared.notify_write();
    }

    async fn sync(&mut self) {
        if let Err(err) = self.file.get_ref().sync_data().await {
            error!(segment = self.segment, error = %err, "failed to sync WAL segment");
        }
    }

    async fn rotate(&mut self) {
        if self.written == 0 {
            debug!(segment = self.segment, "WAL segment is empty, not rotating");
            self.reclaim().await;
            return;
        }
        self.flush().await;
        self.sync().await;

        let next = self.segment + 1;
        let file = match open_segment(&self.shared.dir, next) {
            Ok(file) => file,
            Err(err) => {
                error!(segment = next, error = %err, "failed to open WAL segment, keeping the active one");
                return;
            }
        };
        self.file = BufWriter::new(file);
        self.segment = next;
        self.written = 0;
        self.series.clear();
        self.shared.current.store(next, Ordering::Release);
        self.shared.metrics.segments_created.inc();
        self.shared.metrics.current_segment.set(next as i64);
        info!(segment = next, "rotated WAL segment");
        self.shared.notify_write();
        self.reclaim().await;
    }

    async fn reclaim(&self) {
        match self.shared.reclaim(self.segment).await {
            Ok(0) => {}
            Ok(deleted) => info!(deleted, "reclaimed WAL segments"),
            Err(err) => warn!(error = %err, "failed to reclaim WAL segments"),
        }
    }
}

async fn run_writer(
    mut state: WriterState,
    mut rx: mpsc::Receiver<Entry>,
    cancel: CancellationToken,
) {
    let age = state.shared.max_segment_age;
    let mut rotation = tokio::time::interval_at(Instant::now() + age, age);
    rotation.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = rotation.tick() => state.rotate().await,
            next = rx.recv() => {
                let Some(entry) = next else { break };
                state.write(&entry).await;
                for _ in 1..MAX_BURST {
                    match rx.try_recv() {
                        Ok(entry) => state.write(&entry).await,
                        Err(_) => break,
                    }
                }
                state.flush().await;
            }
        }
    }

    rx.close();
    while let Some(entry) = rx.recv().await {
        state.write(&entry).await;
    }
    state.flush().await;
    state.sync().await;
    debug!(segment = state.segment, "stopped WAL writer");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::label_set;
    use crate::wal::marker::MarkerFileHandler;
    use crate::wal::record::{decode_record, Kind};
    use crate::metrics::MarkerMetrics;
    use std::time::SystemTime;

    fn config(dir: &Path) -> Config {
        Config {
            enabled: true,
            dir: dir.to_path_buf(),
            ..Config::default()
        }
    }

    fn read_records(dir: &Path, segment: u64) -> Vec<WalRecord> {
        let bytes = std::fs::read(segment_path(dir, segment)).unwrap();
        let mut records = Vec::new();
        let mut offset = 0;
        while let Some((record, used)) = decode_record(&bytes[offset..]).unwrap() {
            records.push(record);
            offset += used;
        }
        assert_eq!(offset, bytes.len());
        records
    }

    #[derive(Default)]
    struct Resets(Mutex<Vec<u64>>);

    #[async_trait::async_trait]
    impl WriteTo for Resets {
        fn store_series(&self, _series: &[RefSeries], _segment: u64) {}

        fn series_reset(&self, segment: u64) {
            self.0.lock().push(segment);
        }

        async fn append_entries(
            &self,
            _entries: RefEntries,
            _segment: u64,
        ) -> Result<(), crate::error::EnqueueError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn series_are_written_once_per_segment() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Writer::new(&config(dir.path()), &Registry::new()).unwrap();
        let tx = writer.chan();
        let api = label_set([("app", "api")]);
        let web = label_set([("app", "web")]);
        for (labels, line) in [(&api, "a1"), (&web, "w1"), (&api, "a2")] {
            tx.send(Entry::new(labels.clone(), SystemTime::now(), line))
                .await
                .unwrap();
        }
        writer.stop().await;

        let records = read_records(dir.path(), 0);
        let kinds: Vec<_> = records.iter().map(WalRecord::kind_name).collect();
        assert_eq!(kinds, ["series", "entries", "series", "entries", "entries"]);
        let Some(Kind::Entries(last)) = &records[4].kind else {
            panic!("expected entries");
        };
        assert_eq!(last.series_ref, 0);
        assert_eq!(last.entries[0].line, "a2");
    }

    #[tokio::test]
    async fn restart_continues_numbering() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new();
        let first = Writer::new(&config(dir.path()), &registry).unwrap();
        assert_eq!(first.current_segment(), 0);
        first.stop().await;

        let second = Writer::new(&config(dir.path()), &registry).unwrap();
        assert_eq!(second.current_segment(), 1);
        second.stop().await;
        assert!(segment_path(dir.path(), 1).exists());
    }

    #[tokio::test]
    async fn rotation_resets_series() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.max_segment_age = Duration::from_millis(50);
        let writer = Writer::new(&cfg, &Registry::new()).unwrap();
        let tx = writer.chan();
        let labels = label_set([("app", "api")]);

        tx.send(Entry::new(labels.clone(), SystemTime::now(), "before"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        tx.send(Entry::new(labels, SystemTime::now(), "after"))
            .await
            .unwrap();
        writer.stop().await;

        assert!(writer.current_segment() >= 1);
        let holding_after = list_segments(dir.path())
            .unwrap()
            .into_iter()
            .map(|segment| read_records(dir.path(), segment))
            .find(|records| {
                records.iter().any(|record| {
                    matches!(&record.kind, Some(Kind::Entries(e)) if e.entries[0].line == "after")
                })
            })
            .unwrap();
        assert_eq!(holding_after[0].kind_name(), "series");
    }

    #[tokio::test]
    async fn idle_writer_keeps_its_segment() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.max_segment_age = Duration::from_millis(20);
        let writer = Writer::new(&cfg, &Registry::new()).unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(writer.current_segment(), 0);
        assert_eq!(list_segments(dir.path()).unwrap(), vec![0]);

        writer
            .chan()
            .send(Entry::new(label_set([("app", "api")]), SystemTime::now(), "busy"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(writer.current_segment(), 1);
        writer.stop().await;
    }

    fn shared(dir: &Path, markers: Vec<Arc<Marker>>, resets: Arc<Resets>) -> Shared {
        Shared {
            dir: dir.to_path_buf(),
            max_segment_age: Duration::ZERO,
            current: AtomicU64::new(4),
            write_subscribers: RwLock::new(Vec::new()),
            cleanup_subscribers: RwLock::new(vec![resets as Arc<dyn WriteTo>]),
            markers: RwLock::new(markers),
            metrics: WriterMetrics::new(&Registry::new()),
        }
    }

    fn marker(dir: &Path, client: &str, marked: Option<u64>) -> Arc<Marker> {
        let file = MarkerFileHandler::new(dir, client).unwrap();
        if let Some(segment) = marked {
            file.mark_segment(segment).unwrap();
        }
        Marker::start(client, file, Duration::ZERO, MarkerMetrics::new(&Registry::new()))
    }

    #[tokio::test]
    async fn reclaim_waits_for_every_marker() {
        let dir = tempfile::tempdir().unwrap();
        for segment in 0..5 {
            std::fs::write(segment_path(dir.path(), segment), b"").unwrap();
        }
        let resets = Arc::new(Resets::default());
        let markers = vec![
            marker(dir.path(), "a", Some(3)),
            marker(dir.path(), "b", Some(1)),
        ];
        let shared = shared(dir.path(), markers, resets.clone());

        assert_eq!(shared.reclaim(4).await.unwrap(), 2);
        assert_eq!(list_segments(dir.path()).unwrap(), vec![2, 3, 4]);
        assert_eq!(*resets.0.lock(), vec![0, 1]);
    }

    #[tokio::test]
    async fn reclaim_without_markers_uses_age_only() {
        let dir = tempfile::tempdir().unwrap();
        for segment in 0..3 {
            std::fs::write(segment_path(dir.path(), segment), b"").unwrap();
        }
        let resets = Arc::new(Resets::default());
        let shared = shared(dir.path(), Vec::new(), resets.clone());
        assert_eq!(shared.reclaim(2).await.unwrap(), 2);
        assert_eq!(list_segments(dir.path()).unwrap(), vec![2]);

        let unmarked = shared_with_unmarked(dir.path(), resets);
        assert_eq!(unmarked.reclaim(5).await.unwrap(), 0);
    }

    fn shared_with_unmarked(dir: &Path, resets: Arc<Resets>) -> Shared {
        shared(dir, vec![marker(dir, "fresh", None)], resets)
    }
}
