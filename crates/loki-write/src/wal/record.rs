// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! On-disk records. A segment is a plain sequence of length-delimited [`WalRecord`]s.

use std::time::SystemTime;

use prost::Message;

use super::WalError;
use crate::entry::{Entry, LabelPair, LabelSet};
use crate::proto::{EntryAdapter, LabelPairAdapter};

/// Longest possible varint length prefix.
const MAX_DELIMITER_LEN: usize = 10;

#[derive(Clone, PartialEq, Message)]
pub struct WalRecord {
    #[prost(oneof = "Kind", tags = "1, 2")]
    pub kind: Option<Kind>,
}

#[derive(Clone, PartialEq, prost::Oneof)]
pub enum Kind {
    #[prost(message, tag = "1")]
    Series(RefSeries),
    #[prost(message, tag = "2")]
    Entries(RefEntries),
}

/// Binds a segment-local reference to a label set.
#[derive(Clone, PartialEq, Message)]
pub struct RefSeries {
    #[prost(uint64, tag = "1")]
    pub series_ref: u64,
    #[prost(message, repeated, tag = "2")]
    pub labels: Vec<LabelPairAdapter>,
}

/// Entries of the series defined by an earlier [`RefSeries`] of the same segment.
#[derive(Clone, PartialEq, Message)]
pub struct RefEntries {
    #[prost(uint64, tag = "1")]
    pub series_ref: u64,
    #[prost(message, repeated, tag = "2")]
    pub entries: Vec<EntryAdapter>,
}

impl RefSeries {
    pub fn new(series_ref: u64, labels: &LabelSet) -> Self {
        RefSeries {
            series_ref,
            labels: labels
                .iter()
                .map(|(name, value)| LabelPairAdapter {
                    name: name.clone(),
                    value: value.clone(),
                })
                .collect(),
        }
    }

    pub fn label_set(&self) -> LabelSet {
        self.labels
            .iter()
            .map(|pair| (pair.name.clone(), pair.value.clone()))
            .collect()
    }
}

impl RefEntries {
    /// Rebuilds the entries under `labels`. Missing timestamps read as the epoch.
    pub fn into_entries(self, labels: &LabelSet) -> Vec<Entry> {
        self.entries
            .into_iter()
            .map(|adapter| {
                let timestamp = adapter
                    .timestamp
                    .map(SystemTime::from)
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                Entry::new(labels.clone(), timestamp, adapter.line).with_structured_metadata(
                    adapter
                        .structured_metadata
                        .into_iter()
                        .map(LabelPair::from)
                        .collect(),
                )
            })
            .collect()
    }
}

impl WalRecord {
    pub fn series(series: RefSeries) -> Self {
        WalRecord {
            kind: Some(Kind::Series(series)),
        }
    }

    pub fn entries(entries: RefEntries) -> Self {
        WalRecord {
            kind: Some(Kind::Entries(entries)),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            Some(Kind::Series(_)) => "series",
            Some(Kind::Entries(_)) => "entries",
            None => "unknown",
        }
    }

    /// Appends the length-delimited encoding of this record to `buf`.
    pub fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), WalError> {
        self.encode_length_delimited(buf)?;
        Ok(())
    }
}

/// Decodes the first record of `buf`.
///
/// Returns the record and the number of bytes it used, or `None` when `buf` ends in
/// the middle of a record, which is the case for a segment still being written.
pub fn decode_record(buf: &[u8]) -> Result<Option<(WalRecord, usize)>, WalError> {
    if buf.is_empty() {
        return Ok(None);
    }
    let len = match prost::decode_length_delimiter(buf) {
        Ok(len) => len,
        Err(_) if buf.len() < MAX_DELIMITER_LEN => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let start = prost::length_delimiter_len(len);
    let end = match start.checked_add(len) {
        Some(end) => end,
        None => return Err(WalError::Corrupt(format!("record length {len} overflows"))),
    };
    if buf.len() < end {
        return Ok(None);
    }
    let record = WalRecord::decode(&buf[start..end])?;
    Ok(Some((record, end)))
}
