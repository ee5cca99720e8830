// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod line;
mod settings;

use std::env;
use std::process::ExitCode;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use loki_write::{Consumer, Manager, Registry};

use crate::line::parse_line;
use crate::settings::{Settings, DEFAULT_LOG_LEVEL};

#[tokio::main]
pub async fn main() -> ExitCode {
    let log_level = env::var("LOKI_WRITE_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string());

    let env_filter = format!("h2=off,hyper=off,rustls=off,{log_level}");

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(err) => {
            error!(error = %err, "invalid configuration, shutting down");
            return ExitCode::FAILURE;
        }
    };

    let registry = Registry::new();
    let manager = match Manager::new(&registry, settings.wal, vec![settings.client]) {
        Ok(manager) => manager,
        Err(err) => {
            error!(error = %err, "could not start loki-write, shutting down");
            return ExitCode::FAILURE;
        }
    };

    let tx = manager.chan();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut shipped: u64 = 0;
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("received interrupt, draining");
                break;
            }
            next = lines.next_line() => match next {
                Ok(Some(raw)) => {
                    let Some(entry) = parse_line(&raw, &settings.labels) else {
                        continue;
                    };
                    if tx.send(entry).await.is_err() {
                        error!("pipeline closed unexpectedly");
                        break;
                    }
                    shipped += 1;
                }
                Ok(None) => {
                    debug!("reached end of input");
                    break;
                }
                Err(err) => {
                    error!(error = %err, "failed to read from stdin");
                    break;
                }
            },
        }
    }
    drop(tx);

    manager.stop_and_drain().await;
    info!(lines = shipped, "loki-write agent stopped");
    match registry.encode() {
        Ok(metrics) => debug!("final metrics:\n{metrics}"),
        Err(err) => debug!(error = %err, "failed to encode metrics"),
    }
    ExitCode::SUCCESS
}
