/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::path::Path;

use iobridge::RegistryConfig;
use iobridge::env_override;
use iobridge::load_yaml;
use serde::Deserialize;
use serde::Serialize;

/// Represents verbs dispatcher configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerbsConfig {
    /// `registry` - Handle registry settings.
    pub registry: RegistryConfig,
    /// `max_sge` - The maximum number of scatter/gather elements accepted in
    /// one posted work request.
    pub max_sge: usize,
    /// `resolve_timeout_ms` - Timeout for address and route resolution.
    pub resolve_timeout_ms: i32,
    /// `max_private_data` - Bytes of private data accepted on connect and
    /// accept.
    pub max_private_data: usize,
    /// `retry_count` - Transport retries used when the caller passes zero.
    pub retry_count: u8,
    /// `rnr_retry_count` - Receiver-not-ready retries used when the caller
    /// passes zero.
    pub rnr_retry_count: u8,
}

impl Default for VerbsConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            max_sge: 4,
            resolve_timeout_ms: 2000,
            max_private_data: 56,
            retry_count: 7,
            rnr_retry_count: 7,
        }
    }
}

impl VerbsConfig {
    /// Defaults overridden from the environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Loads from YAML, then applies environment overrides.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let mut config: Self = load_yaml(path)?;
        config.apply_env();
        Ok(config)
    }

    /// Applies `IOBRIDGE_*` environment overrides in place.
    pub fn apply_env(&mut self) {
        self.registry.apply_env();
        env_override("IOBRIDGE_VERBS_MAX_SGE", &mut self.max_sge);
        env_override("IOBRIDGE_VERBS_RESOLVE_TIMEOUT_MS", &mut self.resolve_timeout_ms);
        env_override("IOBRIDGE_VERBS_MAX_PRIVATE_DATA", &mut self.max_private_data);
        env_override("IOBRIDGE_VERBS_RETRY_COUNT", &mut self.retry_count);
        env_override("IOBRIDGE_VERBS_RNR_RETRY_COUNT", &mut self.rnr_retry_count);
        tracing::info!("verbs configuration: {}", self);
    }
}

impl std::fmt::Display for VerbsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "VerbsConfig {{ discipline: {}, max_sge: {}, resolve_timeout_ms: {}, max_private_data: {}, retry_count: {}, rnr_retry_count: {} }}",
            self.registry.discipline,
            self.max_sge,
            self.resolve_timeout_ms,
            self.max_private_data,
            self.retry_count,
            self.rnr_retry_count,
        )
    }
}
