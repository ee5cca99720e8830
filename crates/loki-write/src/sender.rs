// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Batch delivery with classified retries.
//!
//! # Flow
//!
//! ```text
//!   Batch
//!     │
//!     v
//!   ┌─────────────┐
//!   │   Encode    │ (protobuf + snappy)
//!   └──────┬──────┘
//!          │
//!          v
//!   ┌─────────────┐
//!   │  HTTP POST  │ <──────────┐
//!   └──────┬──────┘            │
//!          │                   │ backoff
//!          v                   │
//!   ┌─────────────┐  retryable │
//!   │  Classify   │ ───────────┘
//!   └─────────────┘
//! ```
//!
//! # Status classification
//!
//! - **2xx**: delivered
//! - **429**: rate limited, retried unless `drop_rate_limited_batches` is set
//! - **5xx** and transport errors: retried with backoff
//! - **other 4xx**: terminal, the batch is dropped
//!
//! Failures never reach the producer of the entries. They are counted in the drop
//! metrics with a reason and logged at error level.

use std::time::Instant;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::Url;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::backoff::Backoff;
use crate::batch::Batch;
use crate::config::{BackoffConfig, Config};
use crate::error::ConfigError;
use crate::metrics::{host_tenant, ClientMetrics, DropReason, RequestLabels};

pub const PROTOBUF_CONTENT_TYPE: &str = "application/x-protobuf";
pub const SNAPPY_CONTENT_ENCODING: &str = "snappy";
pub const ORG_ID_HEADER: &str = "x-scope-orgid";

/// Longest prefix of an error response body kept for the log line.
const MAX_ERROR_BODY: usize = 1024;

/// Status reported for requests that never got an HTTP response.
const TRANSPORT_FAILURE: i32 = -1;

/// What happened to a batch handed to [`Sender::send_batch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Dropped(DropReason),
    /// The client was stopped while the batch was in flight or backing off.
    Cancelled,
    EncodeFailed,
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("server returned HTTP status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("request cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    RateLimited,
    Retryable,
    Terminal,
}

fn classify(status: i32) -> Outcome {
    match status {
        200..=299 => Outcome::Success,
        429 => Outcome::RateLimited,
        s if s <= 0 => Outcome::Retryable,
        500..=599 => Outcome::Retryable,
        _ => Outcome::Terminal,
    }
}

/// Pushes encoded batches to one endpoint.
#[derive(Debug)]
pub struct Sender {
    client: reqwest::Client,
    url: Url,
    host: String,
    base_headers: HeaderMap,
    custom_headers: Vec<(HeaderName, HeaderValue)>,
    backoff: BackoffConfig,
    drop_rate_limited_batches: bool,
    metrics: ClientMetrics,
    cancel: CancellationToken,
}

impl Sender {
    pub fn new(
        config: &Config,
        metrics: ClientMetrics,
        client: reqwest::Client,
        cancel: CancellationToken,
    ) -> Result<Self, ConfigError> {
        let url = config.url.clone().ok_or(ConfigError::MissingUrl)?;

        let mut base_headers = HeaderMap::new();
        base_headers.insert(CONTENT_TYPE, HeaderValue::from_static(PROTOBUF_CONTENT_TYPE));
        base_headers.insert(
            CONTENT_ENCODING,
            HeaderValue::from_static(SNAPPY_CONTENT_ENCODING),
        );

        let custom_headers = config
            .headers
            .iter()
            .map(|(name, value)| {
                let invalid = |reason: String| ConfigError::InvalidHeader {
                    name: name.clone(),
                    reason,
                };
                Ok((
                    HeaderName::from_bytes(name.as_bytes()).map_err(|e| invalid(e.to_string()))?,
                    HeaderValue::from_str(value).map_err(|e| invalid(e.to_string()))?,
                ))
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        Ok(Sender {
            client,
            host: config.host(),
            url,
            base_headers,
            custom_headers,
            backoff: config.backoff,
            drop_rate_limited_batches: config.drop_rate_limited_batches,
            metrics,
            cancel,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Encodes and sends `batch`, retrying per the backoff policy.
    ///
    /// At least one attempt is always made. The batch is only read.
    pub async fn send_batch(&self, tenant: &str, batch: &Batch) -> Delivery {
        let (body, entries) = match batch.encode() {
            Ok(encoded) => encoded,
            Err(err) => {
                error!(tenant, error = %err, "error encoding batch");
                return Delivery::EncodeFailed;
            }
        };
        let bytes = body.len();
        let labels = host_tenant(&self.host, tenant);
        self.metrics
            .encoded_bytes
            .get_or_create(&labels)
            .inc_by(bytes as u64);

        let mut backoff = Backoff::new(self.backoff, self.cancel.clone());
        let (status, last_error) = loop {
            let start = Instant::now();
            let (status, result) = self.send(tenant, body.clone()).await;
            self.metrics
                .request_duration
                .get_or_create(&RequestLabels {
                    status_code: status.to_string(),
                    host: self.host.clone(),
                    tenant: tenant.to_string(),
                })
                .observe(start.elapsed().as_secs_f64());

            let err = match result {
                Ok(()) => {
                    self.metrics
                        .sent_bytes
                        .get_or_create(&labels)
                        .inc_by(bytes as u64);
                    self.metrics
                        .sent_entries
                        .get_or_create(&labels)
                        .inc_by(entries as u64);
                    return Delivery::Sent;
                }
                Err(SendError::Cancelled) => {
                    warn!(tenant, entries, "client stopped while sending batch, abandoning it");
                    return Delivery::Cancelled;
                }
                Err(err) => err,
            };

            match classify(status) {
                Outcome::RateLimited if self.drop_rate_limited_batches => {
                    warn!(tenant, "dropping batch due to rate limiting applied at ingester");
                    self.metrics
                        .record_drop(&self.host, tenant, DropReason::RateLimited, entries, bytes);
                    return Delivery::Dropped(DropReason::RateLimited);
                }
                Outcome::Terminal | Outcome::Success => break (status, err),
                Outcome::RateLimited | Outcome::Retryable => {}
            }

            debug!(status, tenant, error = %err, "error sending batch, will retry");
            self.metrics.batch_retries.get_or_create(&labels).inc();
            backoff.wait().await;

            if self.cancel.is_cancelled() {
                warn!(tenant, entries, "client stopped while retrying batch, abandoning it");
                return Delivery::Cancelled;
            }
            if !backoff.ongoing() {
                break (status, err);
            }
        };

        error!(
            status,
            tenant,
            error = %last_error,
            "final error sending batch, no retries left, dropping data"
        );
        let reason = if classify(status) == Outcome::RateLimited {
            DropReason::RateLimited
        } else {
            DropReason::IngesterError
        };
        self.metrics
            .record_drop(&self.host, tenant, reason, entries, bytes);
        Delivery::Dropped(reason)
    }

    /// One POST attempt. Returns the HTTP status, or a non-positive value when no
    /// response was received.
    async fn send(&self, tenant: &str, body: Vec<u8>) -> (i32, Result<(), SendError>) {
        let request = self
            .client
            .post(self.url.clone())
            .headers(self.headers(tenant))
            .body(body);

        let response = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return (TRANSPORT_FAILURE, Err(SendError::Cancelled)),
            response = request.send() => response,
        };
        let mut response = match response {
            Ok(response) => response,
            Err(err) => return (TRANSPORT_FAILURE, Err(SendError::Transport(err))),
        };

        let status = response.status();
        if status.is_success() {
            return (i32::from(status.as_u16()), Ok(()));
        }

        let mut body = Vec::new();
        while body.len() < MAX_ERROR_BODY {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    let take = chunk.len().min(MAX_ERROR_BODY - body.len());
                    body.extend_from_slice(&chunk[..take]);
                }
                Ok(None) | Err(_) => break,
            }
        }
        (
            i32::from(status.as_u16()),
            Err(SendError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            }),
        )
    }

    /// Request headers: fixed protocol headers, then the tenant, then custom headers.
    /// The first write of a header name wins.
    fn headers(&self, tenant: &str) -> HeaderMap {
        let mut headers = self.base_headers.clone();
        if !tenant.is_empty() {
            match HeaderValue::from_str(tenant) {
                Ok(value) => {
                    headers.insert(ORG_ID_HEADER, value);
                }
                Err(err) => warn!(tenant, error = %err, "tenant is not a valid header value"),
            }
        }
        for (name, value) in &self.custom_headers {
            if headers.contains_key(name) {
                warn!(header = %name, "custom header would overwrite an existing header, skipping");
                continue;
            }
            headers.insert(name.clone(), value.clone());
        }
        headers
    }
}
