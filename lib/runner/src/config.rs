// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Runner configuration.
//!
//! Sources, lowest to highest priority:
//! 1. Code defaults
//! 2. System config file at /opt/dynamo/etc/runner.toml
//! 3. TOML file from the DYN_RUNNER_CONFIG_PATH environment variable
//! 4. Environment variables (DYN_RUNNER_* prefixed)

use std::time::Duration;

use figment::{
    Figment, Metadata, Profile, Provider,
    providers::{Env, Format, Serialized, Toml},
    value::{Dict, Map},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::stats::client::StatsClientConfig;

pub const CONFIG_PATH_ENV: &str = "DYN_RUNNER_CONFIG_PATH";
const SYSTEM_CONFIG_PATH: &str = "/opt/dynamo/etc/runner.toml";
const ENV_PREFIX: &str = "DYN_RUNNER_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to extract configuration: {0}")]
    Extraction(#[from] Box<figment::Error>),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_cell_limits"))]
#[serde(default)]
pub struct RunnerConfig {
    /// Sequences generating at the same time; also the number of cache slots.
    #[validate(range(min = 1))]
    pub parallelism: usize,

    /// Cells allocated per slot when the cache is created.
    #[validate(range(min = 1))]
    pub initial_cells: usize,

    /// Hard ceiling on cells per slot.
    pub max_cells_per_slot: usize,

    /// Growth granularity.
    #[validate(range(min = 1))]
    pub grow_step_cells: usize,

    /// Cell budget of the host backend. None = unbounded.
    pub backend_budget_cells: Option<usize>,

    #[validate(range(min = 1))]
    pub schedule_interval_ms: u64,

    #[validate(range(min = 1))]
    pub stats_poll_interval_ms: u64,

    pub stats_timeout_ms: u64,

    /// Stats server bind address.
    pub host: String,

    /// Stats server port; 0 picks a free port.
    pub port: u16,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            parallelism: 1,
            initial_cells: 4096,
            max_cells_per_slot: 262144,
            grow_step_cells: 1024,
            backend_budget_cells: None,
            schedule_interval_ms: 5,
            stats_poll_interval_ms: 10,
            stats_timeout_ms: 2000,
            host: "127.0.0.1".to_string(),
            port: 0,
        }
    }
}

fn validate_cell_limits(config: &RunnerConfig) -> Result<(), ValidationError> {
    if config.initial_cells > config.max_cells_per_slot {
        let mut err = ValidationError::new("initial_cells_exceeds_max");
        err.message = Some(
            format!(
                "initial_cells ({}) must not exceed max_cells_per_slot ({})",
                config.initial_cells, config.max_cells_per_slot
            )
            .into(),
        );
        return Err(err);
    }
    Ok(())
}

impl RunnerConfig {
    /// Figment with all sources merged.
    pub fn figment() -> Figment {
        let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_default();

        Figment::new()
            .merge(Serialized::defaults(RunnerConfig::default()))
            .merge(Toml::file(SYSTEM_CONFIG_PATH))
            .merge(Toml::file(&config_path))
            // DYN_RUNNER_PARALLELISM, DYN_RUNNER_INITIAL_CELLS, ...
            .merge(Env::prefixed(ENV_PREFIX).map(|k| k.as_str().to_lowercase().into()))
    }

    /// Load configuration from default figment (env and files).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::extract_from(Self::figment())
    }

    /// Extract and validate configuration from any provider.
    pub fn extract_from<T: Provider>(provider: T) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(provider)
            .extract()
            .map_err(|e| ConfigError::Extraction(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults and environment, then `extra` with highest priority.
    pub fn figment_with<T: Provider>(extra: T) -> Figment {
        Self::figment().merge(extra)
    }

    pub fn schedule_interval(&self) -> Duration {
        Duration::from_millis(self.schedule_interval_ms)
    }

    pub fn stats_timeout(&self) -> Duration {
        Duration::from_millis(self.stats_timeout_ms)
    }

    pub fn stats_client(&self) -> StatsClientConfig {
        StatsClientConfig {
            host: self.host.clone(),
            poll_interval: Duration::from_millis(self.stats_poll_interval_ms),
            timeout: self.stats_timeout(),
        }
    }
}

impl Provider for RunnerConfig {
    fn metadata(&self) -> Metadata {
        Metadata::named("RunnerConfig")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, figment::Error> {
        Serialized::defaults(self).data()
    }
}
