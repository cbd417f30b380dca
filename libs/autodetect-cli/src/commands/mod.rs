// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

pub mod run;
pub mod validate;

use std::path::Path;

use anyhow::{Context, Result};
use autodetect::Job;

/// Read and validate a job definition.
pub fn load_job(path: &Path) -> Result<Job> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read job file {}", path.display()))?;
    let job: Job = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse job file {}", path.display()))?;
    job.validate()
        .with_context(|| format!("Invalid job {}", job.job_id))?;
    Ok(job)
}
