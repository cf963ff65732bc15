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

use crate::nvme_primitives::QpairOptions;

/// Represents NVMe dispatcher configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NvmeConfig {
    /// `registry` - Handle registry settings.
    pub registry: RegistryConfig,
    /// `qpair` - Options for queue pairs allocated without explicit options.
    pub qpair: QpairOptions,
    /// `probe_capacity` - Controllers attached by one
    /// [`crate::NvmeDispatcher::probe_all`].
    pub probe_capacity: usize,
}

impl Default for NvmeConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            qpair: QpairOptions::default(),
            probe_capacity: 16,
        }
    }
}

impl NvmeConfig {
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
        env_override("IOBRIDGE_NVME_QPAIR_PRIORITY", &mut self.qpair.priority);
        env_override("IOBRIDGE_NVME_QPAIR_IO_QUEUE_SIZE", &mut self.qpair.io_queue_size);
        env_override(
            "IOBRIDGE_NVME_QPAIR_IO_QUEUE_REQUESTS",
            &mut self.qpair.io_queue_requests,
        );
        env_override("IOBRIDGE_NVME_PROBE_CAPACITY", &mut self.probe_capacity);
        tracing::info!("nvme configuration: {}", self);
    }
}

impl std::fmt::Display for NvmeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "NvmeConfig {{ discipline: {}, qpair_priority: {}, io_queue_size: {}, io_queue_requests: {}, probe_capacity: {} }}",
            self.registry.discipline,
            self.qpair.priority,
            self.qpair.io_queue_size,
            self.qpair.io_queue_requests,
            self.probe_capacity,
        )
    }
}
