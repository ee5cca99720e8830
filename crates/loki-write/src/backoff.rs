// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::config::BackoffConfig;

/// Exponential backoff bound to a cancellation token.
///
/// Delays start at `min_backoff` and double up to `max_backoff`; each sleep is
/// jittered into `[delay / 2, delay)`.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    cancel: CancellationToken,
    retries: u32,
    next_delay: Duration,
}

impl Backoff {
    pub fn new(config: BackoffConfig, cancel: CancellationToken) -> Self {
        Backoff {
            next_delay: config.min_backoff,
            config,
            cancel,
            retries: 0,
        }
    }

    /// Whether the caller may try again.
    pub fn ongoing(&self) -> bool {
        !self.cancel.is_cancelled()
            && (self.config.max_retries == 0 || self.retries < self.config.max_retries)
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Delay the next [`Backoff::wait`] will sleep for, before jitter.
    pub fn next_delay(&self) -> Duration {
        self.next_delay
    }

    /// Sleeps for the next delay, returning early if the token is cancelled.
    pub async fn wait(&mut self) {
        let delay = jittered(self.next_delay);
        self.retries = self.retries.saturating_add(1);
        self.next_delay = self
            .next_delay
            .saturating_mul(2)
            .min(self.config.max_backoff);

        tokio::select! {
            () = self.cancel.cancelled() => {}
            () = tokio::time::sleep(delay) => {}
        }
    }
}

fn jittered(delay: Duration) -> Duration {
    let half = delay / 2;
    if half.is_zero() {
        return delay;
    }
    half + rand::thread_rng().gen_range(Duration::ZERO..half)
}
