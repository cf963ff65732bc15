/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Registry configuration.
//!
//! Configuration starts from defaults, may be loaded from YAML, and is then
//! overridden key by key from the environment. A malformed environment value is
//! logged and ignored.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// How handles map to native objects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleDiscipline {
    /// Handles live in locked per-class tables. Lookups of destroyed handles
    /// fail with `NotFound`.
    #[default]
    Indirect,
    /// The handle is the native pointer. No tables, no locks, no ownership
    /// checks. The caller guarantees liveness and single-writer destroy.
    Direct,
}

impl fmt::Display for HandleDiscipline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleDiscipline::Indirect => f.write_str("indirect"),
            HandleDiscipline::Direct => f.write_str("direct"),
        }
    }
}

impl FromStr for HandleDiscipline {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "indirect" => Ok(HandleDiscipline::Indirect),
            "direct" => Ok(HandleDiscipline::Direct),
            other => Err(anyhow::anyhow!("unknown handle discipline: {}", other)),
        }
    }
}

/// Configuration shared by every registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// `discipline` - Handle discipline for every table of the registry.
    pub discipline: HandleDiscipline,
}

impl RegistryConfig {
    /// Environment variable overriding [`RegistryConfig::discipline`].
    pub const DISCIPLINE_ENV: &'static str = "IOBRIDGE_HANDLE_DISCIPLINE";

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

    /// Applies environment overrides in place.
    pub fn apply_env(&mut self) {
        env_override(Self::DISCIPLINE_ENV, &mut self.discipline);
    }
}

impl fmt::Display for RegistryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RegistryConfig {{ discipline: {} }}", self.discipline)
    }
}

/// Overrides `slot` from `env_var` if it is set and parses.
pub fn env_override<T>(env_var: &str, slot: &mut T)
where
    T: FromStr + fmt::Debug,
    T::Err: fmt::Display,
{
    let Ok(value) = std::env::var(env_var) else {
        return;
    };
    match value.parse::<T>() {
        Ok(parsed) => {
            tracing::info!("config override from ${}: {:?}", env_var, parsed);
            *slot = parsed;
        }
        Err(e) => {
            tracing::error!(
                "failed to override config from value \"{}\" in ${}: {}",
                value,
                env_var,
                e
            );
        }
    }
}

/// Reads a YAML document into `T`.
pub fn load_yaml<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T, anyhow::Error> {
    let mut file = File::open(path)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    Ok(serde_yaml::from_str(&contents)?)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_is_indirect() {
        assert_eq!(RegistryConfig::default().discipline, HandleDiscipline::Indirect);
    }

    #[test]
    fn test_parse_discipline() {
        assert_eq!("Direct".parse::<HandleDiscipline>().unwrap(), HandleDiscipline::Direct);
        assert_eq!(" indirect ".parse::<HandleDiscipline>().unwrap(), HandleDiscipline::Indirect);
        assert!("sometimes".parse::<HandleDiscipline>().is_err());
    }

    #[test]
    fn test_env_override_ignores_garbage() {
        let var = "IOBRIDGE_TEST_ENV_OVERRIDE_GARBAGE";
        std::env::set_var(var, "not-a-number");
        let mut slot = 7u32;
        env_override(var, &mut slot);
        assert_eq!(slot, 7);

        std::env::set_var(var, "11");
        env_override(var, &mut slot);
        assert_eq!(slot, 11);
        std::env::remove_var(var);
    }

    #[test]
    fn test_from_yaml() -> Result<(), anyhow::Error> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "discipline: direct")?;
        let config: RegistryConfig = load_yaml(file.path())?;
        assert_eq!(config.discipline, HandleDiscipline::Direct);

        let mut empty = tempfile::NamedTempFile::new()?;
        writeln!(empty, "{{}}")?;
        let config: RegistryConfig = load_yaml(empty.path())?;
        assert_eq!(config, RegistryConfig::default());
        Ok(())
    }
}
