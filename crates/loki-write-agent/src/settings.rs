// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use loki_write::{label_set, wal, Config, ConfigError, LabelSet};
use reqwest::Url;

pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Everything the agent reads from its environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub client: Config,
    pub wal: wal::Config,
    /// Labels of plain text lines.
    pub labels: LabelSet,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let url = get("LOKI_WRITE_URL").ok_or(ConfigError::MissingUrl)?;
        let url = Url::parse(&url).map_err(|_| ConfigError::InvalidUrl(url.clone()))?;

        let mut client = Config::new(url);
        client.name = get("LOKI_WRITE_NAME");
        if let Some(tenant) = get("LOKI_WRITE_TENANT_ID") {
            client.tenant_id = tenant;
        }
        if let Some(ms) = parse::<u64>(&get, "LOKI_WRITE_BATCH_WAIT_MS")? {
            client.batch_wait = Duration::from_millis(ms);
        }
        if let Some(size) = parse(&get, "LOKI_WRITE_BATCH_SIZE")? {
            client.batch_size = size;
        }
        if let Some(ms) = parse::<u64>(&get, "LOKI_WRITE_TIMEOUT_MS")? {
            client.timeout = Duration::from_millis(ms);
        }
        if let Some(retries) = parse(&get, "LOKI_WRITE_MAX_RETRIES")? {
            client.backoff.max_retries = retries;
        }
        if let Some(drop) = parse(&get, "LOKI_WRITE_DROP_RATE_LIMITED_BATCHES")? {
            client.drop_rate_limited_batches = drop;
        }
        if let Some(block) = parse(&get, "LOKI_WRITE_BLOCK_ON_OVERFLOW")? {
            client.queue.block_on_overflow = block;
        }
        client.proxy_url = get("LOKI_WRITE_PROXY_URL").or_else(|| get("HTTPS_PROXY"));
        client.validate()?;

        let mut wal = wal::Config::default();
        if let Some(dir) = get("LOKI_WRITE_WAL_DIR").filter(|dir| !dir.is_empty()) {
            wal.enabled = true;
            wal.dir = PathBuf::from(dir);
        }
        if let Some(secs) = parse::<u64>(&get, "LOKI_WRITE_WAL_MAX_SEGMENT_AGE_SECS")? {
            wal.max_segment_age = Duration::from_secs(secs);
        }
        wal.validate()?;

        let labels = match get("LOKI_WRITE_LABELS") {
            Some(raw) => parse_labels(&raw).ok_or(ConfigError::InvalidValue {
                key: "LOKI_WRITE_LABELS".to_string(),
                value: raw,
            })?,
            None => label_set([("job", "loki-write-agent")]),
        };

        Ok(Settings {
            client,
            wal,
            labels,
        })
    }
}

fn parse<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    get(key)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue {
                    key: key.to_string(),
                    value,
                })
        })
        .transpose()
}

/// Parses `a=b,c=d`.
fn parse_labels(raw: &str) -> Option<LabelSet> {
    raw.split(',')
        .filter(|pair| !pair.trim().is_empty())
        .map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.trim().to_string()))
        })
        .collect()
}
