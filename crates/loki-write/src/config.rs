// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::header::{HeaderName, HeaderValue};
use reqwest::Url;

use crate::error::ConfigError;

pub const DEFAULT_BATCH_WAIT: Duration = Duration::from_secs(1);
pub const DEFAULT_BATCH_SIZE: usize = 1024 * 1024;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_QUEUE_CAPACITY: usize = 10 * 1024 * 1024;
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_MAX_BLOCK: Duration = Duration::from_secs(60);

/// Settings for one delivery target. Not mutated once an endpoint is built from it.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Explicit client name; when unset a name is derived from the config contents.
    pub name: Option<String>,
    pub url: Option<Url>,
    /// Longest time an entry waits in an open batch before the batch is sent.
    pub batch_wait: Duration,
    /// Batch size threshold in bytes, see [`crate::entry::Entry::size`].
    pub batch_size: usize,
    /// Maximum number of streams per batch, 0 for unlimited.
    pub max_streams: usize,
    pub timeout: Duration,
    /// Sent as `X-Scope-OrgID` when not empty.
    pub tenant_id: String,
    pub headers: BTreeMap<String, String>,
    pub backoff: BackoffConfig,
    pub drop_rate_limited_batches: bool,
    pub queue: QueueConfig,
    pub proxy_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            name: None,
            url: None,
            batch_wait: DEFAULT_BATCH_WAIT,
            batch_size: DEFAULT_BATCH_SIZE,
            max_streams: 0,
            timeout: DEFAULT_TIMEOUT,
            tenant_id: String::new(),
            headers: BTreeMap::new(),
            backoff: BackoffConfig::default(),
            drop_rate_limited_batches: false,
            queue: QueueConfig::default(),
            proxy_url: None,
        }
    }
}

impl Config {
    pub fn new(url: Url) -> Self {
        Config {
            url: Some(url),
            ..Default::default()
        }
    }

    /// `host[:port]` of the target, used as the `host` metric label.
    pub fn host(&self) -> String {
        match &self.url {
            Some(url) => match (url.host_str(), url.port()) {
                (Some(host), Some(port)) => format!("{host}:{port}"),
                (Some(host), None) => host.to_string(),
                _ => String::new(),
            },
            None => String::new(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.url.as_ref().ok_or(ConfigError::MissingUrl)?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(ConfigError::InvalidUrl(url.to_string()));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        for (name, value) in &self.headers {
            HeaderName::from_bytes(name.as_bytes()).map_err(|e| ConfigError::InvalidHeader {
                name: name.clone(),
                reason: e.to_string(),
            })?;
            HeaderValue::from_str(value).map_err(|e| ConfigError::InvalidHeader {
                name: name.clone(),
                reason: e.to_string(),
            })?;
        }
        self.backoff.validate()?;
        self.queue.validate()
    }
}

/// Exponential retry policy for failed pushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    /// Maximum number of send attempts per batch, 0 for unlimited.
    pub max_retries: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            min_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(5 * 60),
            max_retries: 10,
        }
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_backoff.is_zero() {
            return Err(ConfigError::InvalidBackoff(
                "min backoff must be greater than 0".to_string(),
            ));
        }
        if self.max_backoff < self.min_backoff {
            return Err(ConfigError::InvalidBackoff(format!(
                "max backoff {:?} is lower than min backoff {:?}",
                self.max_backoff, self.min_backoff
            )));
        }
        Ok(())
    }
}

/// Sizing and shutdown behaviour of the shard queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Bytes buffered across closed batches of one shard.
    pub capacity: usize,
    /// How long `stop` waits for queued batches before cancelling.
    pub drain_timeout: Duration,
    pub min_shards: usize,
    /// Block producers for up to `max_block` instead of rejecting when a queue is full.
    pub block_on_overflow: bool,
    pub max_block: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            capacity: DEFAULT_QUEUE_CAPACITY,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            min_shards: 1,
            block_on_overflow: false,
            max_block: DEFAULT_MAX_BLOCK,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::InvalidQueue(
                "capacity must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Number of closed batches a shard queue holds.
    pub fn batches(&self, batch_size: usize) -> usize {
        (self.capacity / batch_size.max(1)).max(1)
    }

    pub fn shards(&self) -> usize {
        self.min_shards.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config::new(Url::parse("http://localhost:3100/loki/api/v1/push").unwrap())
    }

    #[test]
    fn default_config_needs_url() {
        assert_eq!(Config::default().validate(), Err(ConfigError::MissingUrl));
        assert_eq!(config().validate(), Ok(()));
    }

    #[test]
    fn rejects_non_http_url() {
        let mut cfg = config();
        cfg.url = Some(Url::parse("ftp://localhost/push").unwrap());
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidUrl(_))));
    }

    #[test]
    fn rejects_invalid_header() {
        let mut cfg = config();
        cfg.headers.insert("bad header".to_string(), "v".to_string());
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidHeader { .. })
        ));
    }

    #[test]
    fn rejects_inverted_backoff() {
        let mut cfg = config();
        cfg.backoff.max_backoff = Duration::from_millis(1);
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidBackoff(_))));
    }

    #[test]
    fn host_includes_port() {
        assert_eq!(config().host(), "localhost:3100");
        assert_eq!(Config::default().host(), "");
    }

    #[test]
    fn queue_is_sized_in_batches() {
        let queue = QueueConfig {
            capacity: 100,
            ..Default::default()
        };
        assert_eq!(queue.batches(10), 10);
        assert_eq!(queue.batches(1000), 1);
        assert_eq!(queue.batches(0), 100);
        assert_eq!(QueueConfig::default().shards(), 1);
    }
}
