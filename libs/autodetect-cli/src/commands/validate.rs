// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! `autodetect validate`

use std::path::Path;

use anyhow::Result;

pub fn run(path: &Path) -> Result<()> {
    let job = super::load_job(path)?;
    let config = &job.analysis_config;

    println!("job {} is valid", job.job_id);
    println!("  bucket span: {}s", config.bucket_span_secs);
    println!("  detectors:   {}", config.detectors.len());
    println!("  fields:      {}", job.analysis_fields().join(", "));

    let lists = config.referenced_lists();
    if !lists.is_empty() {
        let lists: Vec<_> = lists.into_iter().collect();
        println!("  filters:     {}", lists.join(", "));
    }
    Ok(())
}
