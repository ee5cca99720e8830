// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

use crate::wal::WalError;

/// Invalid settings, reported before anything is started.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("client needs target URL")]
    MissingUrl,
    #[error("invalid URL '{0}': only http and https are supported")]
    InvalidUrl(String),
    #[error("batch size must be greater than 0")]
    ZeroBatchSize,
    #[error("invalid header '{name}': {reason}")]
    InvalidHeader { name: String, reason: String },
    #[error("invalid backoff: {0}")]
    InvalidBackoff(String),
    #[error("invalid queue config: {0}")]
    InvalidQueue(String),
    #[error("WAL is enabled but no directory is set")]
    MissingWalDir,
    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },
}

/// Failures building a client, endpoint, consumer or manager.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
    #[error("at least one client config must be provided")]
    NoClients,
    #[error("duplicate client configs are not allowed, found duplicate for name: {0}")]
    DuplicateClient(String),
    #[error(transparent)]
    Wal(#[from] WalError),
}

/// Returned to the immediate caller when an entry cannot be queued.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("shard queue is full")]
    QueueFull,
    #[error("client is stopping")]
    Stopping,
}
