// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Install the process-wide tracing subscriber: non-blocking stdout writer,
/// level from `RUST_LOG` when set, `default_level` otherwise.
///
/// The subscriber is the single injection point for log output; code in this
/// crate only ever emits through `tracing` macros. Keep the returned guard
/// alive for the life of the process or trailing records are lost.
pub fn init_logger(default_level: &str) -> Result<WorkerGuard> {
    let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .context("failed to parse log level from env or default")?;

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(writer)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set global default subscriber")?;

    Ok(guard)
}
