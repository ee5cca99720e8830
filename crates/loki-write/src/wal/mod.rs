// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Write-ahead log for durable delivery.
//!
//! A single [`Writer`] appends every entry to numbered segment files under
//! `Config::dir`. One [`Watcher`] per client tails those segments and replays them into
//! a [`WriteTo`] adapter (usually a [`WalClient`]), while a [`Marker`] per client
//! remembers which segments were fully delivered so that a restart resumes after them
//! and the writer can reclaim them.

pub mod client;
pub mod marker;
pub mod record;
pub mod watcher;
pub mod writer;

pub use client::WalClient;
pub use marker::{Marker, MarkerFileHandler, MarkerHandler};
pub use record::{RefEntries, RefSeries, WalRecord};
pub use watcher::Watcher;
pub use writer::Writer;

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::{ConfigError, EnqueueError};

pub const DEFAULT_MAX_SEGMENT_AGE: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_MIN_READ_FREQUENCY: Duration = Duration::from_millis(10);
pub const DEFAULT_MAX_READ_FREQUENCY: Duration = Duration::from_secs(1);
pub const DEFAULT_WATCH_DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub enabled: bool,
    pub dir: PathBuf,
    /// Rotation period of the writer, and minimum age before a delivered segment is
    /// reclaimed.
    pub max_segment_age: Duration,
    pub watch: WatchConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            enabled: false,
            dir: PathBuf::new(),
            max_segment_age: DEFAULT_MAX_SEGMENT_AGE,
            watch: WatchConfig::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }
        if self.dir.as_os_str().is_empty() {
            return Err(ConfigError::MissingWalDir);
        }
        if self.max_segment_age.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "max_segment_age".to_string(),
                value: "0s".to_string(),
            });
        }
        self.watch.validate()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchConfig {
    pub min_read_frequency: Duration,
    pub max_read_frequency: Duration,
    pub drain_timeout: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        WatchConfig {
            min_read_frequency: DEFAULT_MIN_READ_FREQUENCY,
            max_read_frequency: DEFAULT_MAX_READ_FREQUENCY,
            drain_timeout: DEFAULT_WATCH_DRAIN_TIMEOUT,
        }
    }
}

impl WatchConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_read_frequency.is_zero() || self.min_read_frequency > self.max_read_frequency
        {
            return Err(ConfigError::InvalidValue {
                key: "watch.min_read_frequency".to_string(),
                value: format!("{:?}", self.min_read_frequency),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum WalError {
    #[error("WAL I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to decode WAL record: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("failed to encode WAL record: {0}")]
    Encode(#[from] prost::EncodeError),
    #[error("corrupt WAL record: {0}")]
    Corrupt(String),
    #[error("invalid segment marker: {0}")]
    Marker(String),
}

/// Receiver of replayed WAL records.
#[async_trait]
pub trait WriteTo: Send + Sync {
    /// Records series definitions read from `segment`.
    fn store_series(&self, series: &[RefSeries], segment: u64);

    /// Forgets every series defined in `segment` or earlier. Called once the segment
    /// has been deleted.
    fn series_reset(&self, segment: u64);

    /// Delivers the entries of one record. An error stops the replay.
    async fn append_entries(&self, entries: RefEntries, segment: u64) -> Result<(), EnqueueError>;
}

/// Notified after the writer flushed new records.
pub trait WriteSubscriber: Send + Sync {
    fn notify_write(&self);
}

pub(crate) fn segment_path(dir: &Path, segment: u64) -> PathBuf {
    dir.join(format!("{segment:08}"))
}

/// Segment numbers found in `dir`, ascending. Names that are not numbers are ignored.
pub(crate) fn list_segments(dir: &Path) -> io::Result<Vec<u64>> {
    let mut segments = Vec::new();
    for dirent in std::fs::read_dir(dir)? {
        let dirent = dirent?;
        if !dirent.file_type()?.is_file() {
            continue;
        }
        if let Some(segment) = dirent
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u64>().ok())
        {
            segments.push(segment);
        }
    }
    segments.sort_unstable();
    Ok(segments)
}
