// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery progress of WAL segments.
//!
//! The watcher reports every entry it hands to an endpoint as *received*, and the
//! shards report every entry whose batch was resolved (delivered or dropped for good)
//! as *sent*. Once a segment and all tracked segments before it are fully sent, the
//! [`Marker`] persists it as the last marked segment through a [`MarkerFileHandler`].
//! A restarted watcher resumes after that segment and the writer may delete it.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::WalError;
use crate::metrics::{ClientLabels, MarkerMetrics};

const MARKER_VERSION: u16 = 1;
const MARKER_LEN: usize = 10;
const MARKER_FILE: &str = "segment_marker";
const MAX_MARK_INTERVAL: Duration = Duration::from_secs(1);
const MIN_MARK_INTERVAL: Duration = Duration::from_millis(10);

/// Receives delivery progress of WAL-sourced entries.
pub trait MarkerHandler: Send + Sync {
    fn update_received_data(&self, segment: u64, count: usize);
    fn update_sent_data(&self, segment: u64, count: usize);
}

/// Persists the last marked segment of one client.
#[derive(Debug)]
pub struct MarkerFileHandler {
    dir: PathBuf,
    path: PathBuf,
}

impl MarkerFileHandler {
    /// Uses `<wal_dir>/remote/<client>/segment_marker`, creating the directory.
    pub fn new(wal_dir: &Path, client: &str) -> Result<Self, WalError> {
        let dir = wal_dir.join("remote").join(client);
        fs::create_dir_all(&dir)?;
        let path = dir.join(MARKER_FILE);
        Ok(MarkerFileHandler { dir, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The persisted segment, if any. An unreadable marker counts as missing, which
    /// replays the whole WAL.
    pub fn last_marked_segment(&self) -> Option<u64> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "failed to read segment marker");
                return None;
            }
        };
        match decode_marker(&bytes) {
            Ok(segment) => Some(segment),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "ignoring segment marker");
                None
            }
        }
    }

    /// Atomically replaces the marker with `segment`.
    pub fn mark_segment(&self, segment: u64) -> Result<(), WalError> {
        let tmp = self.dir.join(format!("{MARKER_FILE}.tmp"));
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&encode_marker(segment))?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn encode_marker(segment: u64) -> [u8; MARKER_LEN] {
    let mut buf = [0_u8; MARKER_LEN];
    buf[..2].copy_from_slice(&MARKER_VERSION.to_le_bytes());
    buf[2..].copy_from_slice(&segment.to_le_bytes());
    buf
}

fn decode_marker(bytes: &[u8]) -> Result<u64, WalError> {
    if bytes.len() != MARKER_LEN {
        return Err(WalError::Marker(format!(
            "expected {MARKER_LEN} bytes, found {}",
            bytes.len()
        )));
    }
    let version = u16::from_le_bytes([bytes[0], bytes[1]]);
    if version != MARKER_VERSION {
        return Err(WalError::Marker(format!("unsupported version {version}")));
    }
    let mut segment = [0_u8; 8];
    segment.copy_from_slice(&bytes[2..]);
    Ok(u64::from_le_bytes(segment))
}

#[derive(Debug, Clone, Copy)]
struct SegmentProgress {
    received: usize,
    sent: usize,
    last_update: Instant,
}

impl SegmentProgress {
    fn new(now: Instant) -> Self {
        SegmentProgress {
            received: 0,
            sent: 0,
            last_update: now,
        }
    }
}

#[derive(Debug, Default)]
struct MarkerState {
    segments: BTreeMap<u64, SegmentProgress>,
    last_marked: Option<u64>,
}

/// Highest segment that is fully sent, idle for `min_idle`, and preceded only by
/// segments in the same state.
fn find_markable(
    segments: &BTreeMap<u64, SegmentProgress>,
    now: Instant,
    min_idle: Duration,
) -> Option<u64> {
    segments
        .iter()
        .take_while(|(_, progress)| {
            progress.sent >= progress.received
                && now.saturating_duration_since(progress.last_update) >= min_idle
        })
        .last()
        .map(|(segment, _)| *segment)
}

/// Tracks received and sent counts per segment for one client and periodically
/// persists the markable segment.
pub struct Marker {
    client: String,
    file: MarkerFileHandler,
    max_segment_age: Duration,
    state: Mutex<MarkerState>,
    metrics: MarkerMetrics,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Marker {
    /// Loads the persisted segment and starts the marking task. Must be called from
    /// within a Tokio runtime.
    pub fn start(
        client: &str,
        file: MarkerFileHandler,
        max_segment_age: Duration,
        metrics: MarkerMetrics,
    ) -> Arc<Self> {
        let last_marked = file.last_marked_segment();
        if let Some(segment) = last_marked {
            metrics
                .last_marked_segment
                .get_or_create(&client_labels(client))
                .set(segment as i64);
        }
        let marker = Arc::new(Marker {
            client: client.to_string(),
            file,
            max_segment_age,
            state: Mutex::new(MarkerState {
                segments: BTreeMap::new(),
                last_marked,
            }),
            metrics,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        });

        let period = max_segment_age.clamp(MIN_MARK_INTERVAL, MAX_MARK_INTERVAL);
        let task = tokio::spawn(run_marker(
            Arc::downgrade(&marker),
            period,
            marker.cancel.clone(),
        ));
        *marker.task.lock() = Some(task);
        marker
    }

    pub fn client(&self) -> &str {
        &self.client
    }

    pub fn last_marked_segment(&self) -> Option<u64> {
        self.state.lock().last_marked
    }

    /// Stops the marking task and runs a last marking pass.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(client = %self.client, error = %err, "marker task failed");
            }
        }
        self.mark(Instant::now());
    }

    fn mark(&self, now: Instant) {
        let segment = {
            let mut state = self.state.lock();
            let Some(segment) = find_markable(&state.segments, now, self.max_segment_age) else {
                return;
            };
            state.segments = state.segments.split_off(&segment.saturating_add(1));
            if state.last_marked.is_some_and(|last| last >= segment) {
                return;
            }
            state.last_marked = Some(segment);
            segment
        };

        if let Err(err) = self.file.mark_segment(segment) {
            error!(client = %self.client, segment, error = %err, "failed to persist segment marker");
            return;
        }
        self.metrics
            .last_marked_segment
            .get_or_create(&client_labels(&self.client))
            .set(segment as i64);
        info!(client = %self.client, segment, "marked segment");
    }

    fn update(&self, segment: u64, apply: impl FnOnce(&mut SegmentProgress)) {
        let now = Instant::now();
        let mut state = self.state.lock();
        let progress = state
            .segments
            .entry(segment)
            .or_insert_with(|| SegmentProgress::new(now));
        apply(progress);
        progress.last_update = now;
    }
}

impl MarkerHandler for Marker {
    fn update_received_data(&self, segment: u64, count: usize) {
        self.update(segment, |progress| progress.received += count);
    }

    fn update_sent_data(&self, segment: u64, count: usize) {
        self.update(segment, |progress| progress.sent += count);
    }
}

fn client_labels(client: &str) -> ClientLabels {
    ClientLabels {
        client: client.to_string(),
    }
}

async fn run_marker(marker: Weak<Marker>, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let Some(marker) = marker.upgrade() else {
            return;
        };
        marker.mark(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Registry;

    fn progress(received: usize, sent: usize, last_update: Instant) -> SegmentProgress {
        SegmentProgress {
            received,
            sent,
            last_update,
        }
    }

    #[test]
    fn marker_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let file = MarkerFileHandler::new(dir.path(), "primary").unwrap();
        assert_eq!(
            file.path(),
            dir.path().join("remote").join("primary").join("segment_marker")
        );
        assert_eq!(file.last_marked_segment(), None);

        file.mark_segment(7).unwrap();
        assert_eq!(file.last_marked_segment(), Some(7));
        file.mark_segment(12).unwrap();
        assert_eq!(file.last_marked_segment(), Some(12));

        let bytes = fs::read(file.path()).unwrap();
        assert_eq!(bytes.len(), MARKER_LEN);
        assert_eq!(&bytes[..2], &[1, 0]);
    }

    #[test]
    fn corrupt_marker_reads_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        let file = MarkerFileHandler::new(dir.path(), "primary").unwrap();
        fs::write(file.path(), [9, 0, 1]).unwrap();
        assert_eq!(file.last_marked_segment(), None);

        let mut wrong_version = encode_marker(3);
        wrong_version[0] = 2;
        fs::write(file.path(), wrong_version).unwrap();
        assert_eq!(file.last_marked_segment(), None);
    }

    #[test]
    fn markable_stops_at_outstanding_segment() {
        let old = Instant::now();
        let now = old + Duration::from_secs(60);
        let min_idle = Duration::from_secs(10);

        let mut segments = BTreeMap::new();
        segments.insert(1, progress(5, 5, old));
        segments.insert(2, progress(3, 3, old));
        segments.insert(3, progress(4, 2, old));
        segments.insert(4, progress(1, 1, old));
        assert_eq!(find_markable(&segments, now, min_idle), Some(2));

        // fully sent but still receiving
        segments.insert(3, progress(4, 4, now));
        assert_eq!(find_markable(&segments, now, min_idle), Some(2));

        segments.insert(3, progress(4, 4, old));
        assert_eq!(find_markable(&segments, now, min_idle), Some(4));

        segments.insert(1, progress(5, 4, old));
        assert_eq!(find_markable(&segments, now, min_idle), None);
    }

    #[tokio::test]
    async fn stop_marks_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new();
        let file = MarkerFileHandler::new(dir.path(), "primary").unwrap();
        let marker = Marker::start("primary", file, Duration::ZERO, MarkerMetrics::new(&registry));

        marker.update_received_data(0, 2);
        marker.update_received_data(1, 3);
        marker.update_sent_data(0, 2);
        marker.update_sent_data(1, 1);
        marker.stop().await;
        assert_eq!(marker.last_marked_segment(), Some(0));

        let reopened = MarkerFileHandler::new(dir.path(), "primary").unwrap();
        assert_eq!(reopened.last_marked_segment(), Some(0));
        assert!(registry.encode().unwrap().contains(
            r#"loki_write_wal_marker_last_marked_segment{client="primary"} 0"#
        ));
    }

    #[tokio::test]
    async fn never_moves_backwards() {
        let dir = tempfile::tempdir().unwrap();
        let file = MarkerFileHandler::new(dir.path(), "primary").unwrap();
        file.mark_segment(5).unwrap();
        let marker = Marker::start(
            "primary",
            file,
            Duration::ZERO,
            MarkerMetrics::new(&Registry::new()),
        );
        assert_eq!(marker.last_marked_segment(), Some(5));

        marker.update_received_data(2, 1);
        marker.update_sent_data(2, 1);
        marker.stop().await;
        assert_eq!(marker.last_marked_segment(), Some(5));
    }
}
