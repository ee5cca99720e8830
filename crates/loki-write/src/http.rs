// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP client construction.
//!
//! One `reqwest::Client` is built per endpoint and shared read-only by all of its
//! shards. Only the request timeout and an optional proxy are configurable here;
//! TLS and authentication use the `reqwest` defaults.

use core::time::Duration;

use crate::config::Config;

/// Value of the `User-Agent` header on every push request.
pub const USER_AGENT: &str = concat!("loki-write/", env!("CARGO_PKG_VERSION"));

const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Builds the shared client for one endpoint. An invalid proxy URL fails construction.
pub fn build_client(config: &Config) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder()
        .timeout(config.timeout)
        .user_agent(USER_AGENT)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .http1_only();

    if let Some(proxy) = &config.proxy_url {
        builder = builder.proxy(reqwest::Proxy::all(proxy)?);
    }

    builder.build()
}
