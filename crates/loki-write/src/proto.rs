// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Push request messages, wire compatible with the Loki `logproto` push API.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use prost::Message;

use crate::entry::{Entry, LabelPair};

const NANOS_PER_SECOND: i32 = 1_000_000_000;

#[derive(Clone, PartialEq, Message)]
pub struct PushRequest {
    #[prost(message, repeated, tag = "1")]
    pub streams: Vec<StreamAdapter>,
}

#[derive(Clone, PartialEq, Message)]
pub struct StreamAdapter {
    #[prost(string, tag = "1")]
    pub labels: String,
    #[prost(message, repeated, tag = "2")]
    pub entries: Vec<EntryAdapter>,
    #[prost(uint64, tag = "3")]
    pub hash: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct EntryAdapter {
    #[prost(message, optional, tag = "1")]
    pub timestamp: Option<Timestamp>,
    #[prost(string, tag = "2")]
    pub line: String,
    #[prost(message, repeated, tag = "3")]
    pub structured_metadata: Vec<LabelPairAdapter>,
}

#[derive(Clone, PartialEq, Message)]
pub struct LabelPairAdapter {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

/// Same layout as `google.protobuf.Timestamp`.
#[derive(Clone, Copy, PartialEq, Eq, Message)]
pub struct Timestamp {
    #[prost(int64, tag = "1")]
    pub seconds: i64,
    #[prost(int32, tag = "2")]
    pub nanos: i32,
}

impl From<SystemTime> for Timestamp {
    fn from(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(since) => Timestamp {
                seconds: i64::try_from(since.as_secs()).unwrap_or(i64::MAX),
                nanos: since.subsec_nanos() as i32,
            },
            Err(err) => {
                // pre-epoch: normalize so that nanos stays non-negative
                let before = err.duration();
                let mut seconds = -i64::try_from(before.as_secs()).unwrap_or(i64::MAX);
                let mut nanos = before.subsec_nanos() as i32;
                if nanos > 0 {
                    seconds -= 1;
                    nanos = 1_000_000_000 - nanos;
                }
                Timestamp { seconds, nanos }
            }
        }
    }
}

impl From<Timestamp> for SystemTime {
    /// Out of range nanos are carried into seconds. A time the platform cannot
    /// represent collapses to the epoch.
    fn from(ts: Timestamp) -> Self {
        let seconds = ts
            .seconds
            .saturating_add(i64::from(ts.nanos.div_euclid(NANOS_PER_SECOND)));
        let nanos = Duration::from_nanos(u64::from(
            ts.nanos.rem_euclid(NANOS_PER_SECOND).unsigned_abs(),
        ));
        let whole = if seconds >= 0 {
            UNIX_EPOCH.checked_add(Duration::from_secs(seconds.unsigned_abs()))
        } else {
            UNIX_EPOCH.checked_sub(Duration::from_secs(seconds.unsigned_abs()))
        };
        whole
            .and_then(|time| time.checked_add(nanos))
            .unwrap_or(UNIX_EPOCH)
    }
}

impl From<&LabelPair> for LabelPairAdapter {
    fn from(pair: &LabelPair) -> Self {
        LabelPairAdapter {
            name: pair.name.clone(),
            value: pair.value.clone(),
        }
    }
}

impl From<LabelPairAdapter> for LabelPair {
    fn from(pair: LabelPairAdapter) -> Self {
        LabelPair {
            name: pair.name,
            value: pair.value,
        }
    }
}

impl From<&Entry> for EntryAdapter {
    fn from(entry: &Entry) -> Self {
        EntryAdapter {
            timestamp: Some(entry.timestamp.into()),
            line: entry.line.clone(),
            structured_metadata: entry
                .structured_metadata
                .iter()
                .map(LabelPairAdapter::from)
                .collect(),
        }
    }
}

impl PushRequest {
    pub fn entry_count(&self) -> usize {
        self.streams.iter().map(|s| s.entries.len()).sum()
    }

    /// Decodes a snappy compressed push request body.
    pub fn decode_snappy(body: &[u8]) -> Result<Self, crate::batch::EncodeError> {
        let raw = snap::raw::Decoder::new().decompress_vec(body)?;
        Ok(PushRequest::decode(raw.as_slice())?)
    }
}
