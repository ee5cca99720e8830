// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Durable log shipping to Loki-compatible push endpoints.
//!
//! Entries handed to a [`Manager`] are batched per tenant on a pool of shards, encoded
//! as snappy compressed protobuf push requests, and delivered with retries and
//! backoff. With the write-ahead log enabled, entries are persisted first and replayed
//! into every endpoint, so a restart resumes where delivery stopped.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod backoff;
pub mod batch;
pub mod client;
pub mod config;
pub mod consumer;
pub mod endpoint;
pub mod entry;
pub mod error;
pub mod http;
pub mod manager;
pub mod metrics;
pub mod proto;
pub mod sender;
pub mod shards;
pub mod wal;

pub use client::{client_name, Client};
pub use config::{BackoffConfig, Config, QueueConfig};
pub use consumer::{Consumer, FanoutConsumer, InMemoryConsumer, WalConsumer};
pub use endpoint::Endpoint;
pub use entry::{label_set, tenant_of, Entry, LabelPair, LabelSet, RESERVED_LABEL_TENANT_ID};
pub use error::{ClientError, ConfigError, EnqueueError};
pub use manager::Manager;
pub use metrics::{DropReason, Registry};
pub use shards::Overflow;
