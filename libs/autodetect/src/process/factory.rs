// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Launches the worker executable as an OS process.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde::Serialize;

use crate::config::WorkerConfig;
use crate::error::{AutodetectError, Result};
use crate::job::{Detector, Job};

use super::{AutodetectParams, AutodetectProcessFactory, PersistSource, ProcessPipes};

/// Field configuration handed to the worker in a file.
#[derive(Serialize)]
struct FieldConfig<'a> {
    detectors: &'a [Detector],
    influencers: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    categorization_field_name: Option<&'a str>,
    time_field: &'a str,
}

pub struct NativeProcessFactory {
    config: WorkerConfig,
}

impl NativeProcessFactory {
    pub fn new(config: WorkerConfig) -> Self {
        Self { config }
    }

    fn temp_dir(&self) -> PathBuf {
        self.config
            .temp_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }

    /// Command-line arguments for `job`. Files the arguments point at are
    /// created in `dir` and appended to `files`.
    fn build_args(
        &self,
        job: &Job,
        params: &AutodetectParams,
        dir: &Path,
        files: &mut Vec<PathBuf>,
    ) -> Result<(Vec<String>, Option<PathBuf>)> {
        let config = &job.analysis_config;
        let mut args = self.config.args.clone();
        args.push(format!("--jobid={}", job.job_id));
        args.push(format!("--bucketspan={}", config.bucket_span_secs));
        if config.latency_secs > 0 {
            args.push(format!("--latency={}", config.latency_secs));
        }
        args.push("--lengthEncodedInput".to_string());
        if config.use_per_partition_normalization {
            args.push("--perPartitionNormalization".to_string());
        }

        let field_config = serde_json::to_vec_pretty(&FieldConfig {
            detectors: &config.detectors,
            influencers: &config.influencers,
            categorization_field_name: config.categorization_field_name.as_deref(),
            time_field: &job.data_description.time_field,
        })
        .map_err(|e| AutodetectError::server(&job.job_id, "failed to write field config", e))?;
        let path = write_temp_file(dir, &job.job_id, "fieldconfig", ".json", &field_config, files)?;
        args.push(format!("--fieldconfig={}", path.display()));

        if let Some(quantiles) = &params.quantiles {
            let path = write_temp_file(
                dir,
                &job.job_id,
                "quantiles",
                ".json",
                quantiles.quantile_state.as_bytes(),
                files,
            )?;
            args.push(format!("--quantilesState={}", path.display()));
        }

        if !params.lists.is_empty() {
            let filters = serde_json::to_vec(&params.lists)
                .map_err(|e| AutodetectError::server(&job.job_id, "failed to write filters", e))?;
            let path = write_temp_file(dir, &job.job_id, "filters", ".json", &filters, files)?;
            args.push(format!("--filters={}", path.display()));
        }

        if let Some(snapshot) = &params.model_snapshot {
            args.push(format!("--restoreSnapshotId={}", snapshot.snapshot_id));
        }

        let mut fifo = None;
        if self.config.persist_pipe {
            if let Some(path) = create_persist_pipe(dir, &job.job_id)? {
                files.push(path.clone());
                args.push(format!("--persist={}", path.display()));
                fifo = Some(path);
            }
        }

        Ok((args, fifo))
    }
}

impl AutodetectProcessFactory for NativeProcessFactory {
    fn create_process(&self, job: &Job, params: &AutodetectParams) -> Result<ProcessPipes> {
        let dir = self.temp_dir();
        let mut files = Vec::new();
        let spawned = self
            .build_args(job, params, &dir, &mut files)
            .and_then(|(args, fifo)| {
                tracing::debug!(
                    "[{}] starting {} {}",
                    job.job_id,
                    self.config.executable.display(),
                    args.join(" ")
                );
                let child = Command::new(&self.config.executable)
                    .args(&args)
                    .envs(&self.config.env)
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .spawn()
                    .map_err(|e| {
                        AutodetectError::server(
                            &job.job_id,
                            &format!(
                                "failed to launch autodetect process {}",
                                self.config.executable.display()
                            ),
                            e,
                        )
                    })?;
                Ok((child, fifo))
            });

        let (mut child, fifo) = match spawned {
            Ok(spawned) => spawned,
            Err(e) => {
                for path in &files {
                    std::fs::remove_file(path).ok();
                }
                return Err(e);
            }
        };

        let missing = || {
            AutodetectError::server(&job.job_id, "autodetect process pipes", "not captured")
        };
        let input = child.stdin.take().ok_or_else(missing)?;
        let output = child.stdout.take().ok_or_else(missing)?;
        let log = child.stderr.take().ok_or_else(missing)?;

        Ok(ProcessPipes {
            input: Box::new(input),
            output: Box::new(output),
            log: Box::new(log),
            persist: fifo.map(PersistSource::Fifo),
            child: Some(child),
            files_to_delete: files,
        })
    }
}

fn write_temp_file(
    dir: &Path,
    job_id: &str,
    kind: &str,
    suffix: &str,
    contents: &[u8],
    files: &mut Vec<PathBuf>,
) -> Result<PathBuf> {
    let mut file = tempfile::Builder::new()
        .prefix(&format!("{}-{}-", job_id, kind))
        .suffix(suffix)
        .tempfile_in(dir)?;
    file.write_all(contents)?;
    file.flush()?;
    let path = file.into_temp_path().keep().map_err(std::io::Error::from)?;
    files.push(path.clone());
    Ok(path)
}

#[cfg(unix)]
fn create_persist_pipe(dir: &Path, job_id: &str) -> Result<Option<PathBuf>> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;
    use std::sync::atomic::{AtomicU64, Ordering};

    static PIPE_COUNTER: AtomicU64 = AtomicU64::new(0);

    let path = dir.join(format!(
        "{}-persist-{}-{}",
        job_id,
        std::process::id(),
        PIPE_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|e| {
        AutodetectError::server(job_id, "invalid persist pipe path", e)
    })?;
    // SAFETY: c_path is a valid NUL-terminated string for the duration of the call.
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(Some(path))
}

#[cfg(not(unix))]
fn create_persist_pipe(_dir: &Path, job_id: &str) -> Result<Option<PathBuf>> {
    tracing::debug!("[{}] persist pipes are not supported on this platform", job_id);
    Ok(None)
}
