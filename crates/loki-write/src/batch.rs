// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::time::{Duration, Instant};

use prost::Message;
use thiserror::Error;

use crate::entry::{labels_to_string, Entry};
use crate::proto::{EntryAdapter, PushRequest, StreamAdapter};
use crate::wal::marker::MarkerHandler;

/// Reasons an entry is refused by a batch. The caller drops and counts the entry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BatchError {
    #[error("batch size limit reached")]
    SizeReached,
    #[error("streams limit exceeded, streams: {streams} exceeds limit: {limit}, stream: '{labels}'")]
    MaxStreamsLimitExceeded {
        streams: usize,
        limit: usize,
        labels: String,
    },
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("failed to encode push request: {0}")]
    Proto(#[from] prost::EncodeError),
    #[error("failed to decode push request: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("snappy compression failed: {0}")]
    Snappy(#[from] snap::Error),
    #[error("push request of {0} bytes is too large to compress")]
    TooLarge(usize),
}

/// Per tenant accumulation of streams waiting to be pushed.
///
/// Streams keep the order in which their first entry arrived and entries keep their
/// submission order inside a stream.
#[derive(Debug)]
pub struct Batch {
    request: PushRequest,
    stream_index: HashMap<String, usize>,
    size: usize,
    entries: usize,
    created_at: Instant,
    max_streams: usize,
    max_size: usize,
    // entries per WAL segment, only for entries replayed from the WAL
    segment_counter: HashMap<u64, usize>,
}

impl Batch {
    /// `max_streams` of 0 means unlimited.
    pub fn new(max_streams: usize, max_size: usize) -> Self {
        Batch {
            request: PushRequest::default(),
            stream_index: HashMap::new(),
            size: 0,
            entries: 0,
            created_at: Instant::now(),
            max_streams,
            max_size,
            segment_counter: HashMap::new(),
        }
    }

    /// Admits `entry` into its stream.
    ///
    /// An empty batch always admits, whatever the entry size. On error the batch is
    /// left untouched.
    pub fn add(&mut self, entry: Entry, segment: Option<u64>) -> Result<(), BatchError> {
        let entry_size = entry.size();
        if !self.is_empty() && self.size + entry_size > self.max_size {
            return Err(BatchError::SizeReached);
        }

        let labels = labels_to_string(&entry.labels);
        let stream = match self.stream_index.get(&labels) {
            Some(&idx) => idx,
            None => {
                let streams = self.stream_index.len();
                if self.max_streams > 0 && streams >= self.max_streams {
                    return Err(BatchError::MaxStreamsLimitExceeded {
                        streams,
                        limit: self.max_streams,
                        labels,
                    });
                }
                self.request.streams.push(StreamAdapter {
                    labels: labels.clone(),
                    entries: Vec::new(),
                    hash: 0,
                });
                self.stream_index.insert(labels, streams);
                streams
            }
        };

        self.request.streams[stream]
            .entries
            .push(EntryAdapter::from(&entry));
        self.size += entry_size;
        self.entries += 1;
        if let Some(segment) = segment {
            *self.segment_counter.entry(segment).or_default() += 1;
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    pub fn size_bytes(&self) -> usize {
        self.size
    }

    pub fn size_bytes_after(&self, entry: &Entry) -> usize {
        self.size + entry.size()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn stream_count(&self) -> usize {
        self.request.streams.len()
    }

    pub fn entry_count(&self) -> usize {
        self.entries
    }

    /// Snapshot of the streams as a push request, with the number of entries in it.
    pub fn request(&self) -> (PushRequest, usize) {
        (self.request.clone(), self.entries)
    }

    /// Protobuf encodes and snappy compresses the batch.
    pub fn encode(&self) -> Result<(Vec<u8>, usize), EncodeError> {
        let mut proto_buf = Vec::new();
        let mut snappy_buf = Vec::new();
        let entries = self.encode_with(&mut proto_buf, &mut snappy_buf)?;
        Ok((snappy_buf, entries))
    }

    /// Same as [`Batch::encode`] but reuses caller owned scratch buffers. The compressed
    /// payload ends up in `snappy_buf`. Buffers of any size are accepted; short ones
    /// are grown before use.
    pub fn encode_with(
        &self,
        proto_buf: &mut Vec<u8>,
        snappy_buf: &mut Vec<u8>,
    ) -> Result<usize, EncodeError> {
        proto_buf.clear();
        proto_buf.reserve(self.request.encoded_len());
        self.request.encode(proto_buf)?;

        let max_len = snap::raw::max_compress_len(proto_buf.len());
        if max_len == 0 {
            return Err(EncodeError::TooLarge(proto_buf.len()));
        }
        snappy_buf.clear();
        snappy_buf.resize(max_len, 0);
        let written = snap::raw::Encoder::new().compress(proto_buf, snappy_buf)?;
        snappy_buf.truncate(written);

        Ok(self.entries)
    }

    /// Tells the marker that every WAL sourced entry of this batch is resolved.
    pub fn report_as_sent(&self, marker: &dyn MarkerHandler) {
        for (&segment, &count) in &self.segment_counter {
            marker.update_sent_data(segment, count);
        }
    }
}
