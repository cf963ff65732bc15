/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Logging setup for processes embedding the bridge.
//!
//! Filters come from `IOBRIDGE_LOG`, then `RUST_LOG`, then default to `info`.
//! Initialization is idempotent: a second call, or a call in a process that
//! already installed a subscriber, only logs at debug level.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::Registry;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Environment variable holding the log filter directives.
pub const LOG_ENV: &str = "IOBRIDGE_LOG";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Set up logging to stderr.
pub fn initialize_logging() {
    let layer = fmt::Layer::default()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true);
    if let Err(err) = Registry::default()
        .with(env_filter())
        .with(layer)
        .try_init()
    {
        tracing::debug!("logging already initialized for this process: {}", err);
    }
}

/// testing
pub fn initialize_logging_for_test() {
    let layer = fmt::Layer::default().with_test_writer().with_ansi(false);
    if let Err(err) = Registry::default()
        .with(env_filter())
        .with(layer)
        .try_init()
    {
        tracing::debug!("logging already initialized for this process: {}", err);
    }
}
