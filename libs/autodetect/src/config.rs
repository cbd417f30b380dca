// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Manager configuration via `autodetect.yaml`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AutodetectError, Result};

/// Upper bound accepted for `max_open_jobs`.
pub const MAX_OPEN_JOBS_LIMIT: usize = 512;

/// How to launch the worker executable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub executable: PathBuf,
    /// Extra arguments placed before the generated ones.
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    /// Directory for field config, quantiles and filter files. Defaults to
    /// the system temp directory.
    pub temp_dir: Option<PathBuf>,
    /// Hand the worker a named pipe for its model state (unix only).
    pub persist_pipe: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("autodetect"),
            args: Vec::new(),
            env: HashMap::new(),
            temp_dir: None,
            persist_pipe: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Jobs that may have a running worker at the same time.
    pub max_open_jobs: usize,
    /// How long closing a job waits for its worker to finish.
    pub process_close_timeout_secs: u64,
    pub flush_timeout_secs: u64,
    /// How often a blocking flush checks that the worker is still alive.
    pub flush_check_interval_ms: u64,
    pub worker: WorkerConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_open_jobs: 20,
            process_close_timeout_secs: 30 * 60,
            flush_timeout_secs: 300,
            flush_check_interval_ms: 1000,
            worker: WorkerConfig::default(),
        }
    }
}

impl ManagerConfig {
    /// Configuration file name.
    pub const FILE_NAME: &'static str = "autodetect.yaml";

    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            AutodetectError::Configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let config: Self = serde_yaml::from_str(&content).map_err(|e| {
            AutodetectError::Configuration(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;

        tracing::info!("Loaded autodetect config from {}", path.display());
        Ok(config)
    }

    /// Load `autodetect.yaml` from `dir`, falling back to defaults when it
    /// is missing or invalid.
    pub fn load_or_default(dir: &Path) -> Self {
        let path = dir.join(Self::FILE_NAME);
        if !path.exists() {
            tracing::debug!(
                "No {} found in {}, using defaults",
                Self::FILE_NAME,
                dir.display()
            );
            return Self::default();
        }

        match Self::load(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("{}, using defaults", e);
                Self::default()
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_open_jobs == 0 || self.max_open_jobs > MAX_OPEN_JOBS_LIMIT {
            return Err(AutodetectError::Configuration(format!(
                "max_open_jobs must be between 1 and {}, got {}",
                MAX_OPEN_JOBS_LIMIT, self.max_open_jobs
            )));
        }
        if self.flush_check_interval_ms == 0 {
            return Err(AutodetectError::Configuration(
                "flush_check_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.worker.executable.as_os_str().is_empty() {
            return Err(AutodetectError::Configuration(
                "worker.executable must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn process_close_timeout(&self) -> Duration {
        Duration::from_secs(self.process_close_timeout_secs)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_secs(self.flush_timeout_secs)
    }

    pub fn flush_check_interval(&self) -> Duration {
        Duration::from_millis(self.flush_check_interval_ms)
    }
}
