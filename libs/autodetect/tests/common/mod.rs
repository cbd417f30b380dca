// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Shared fixtures for manager integration tests.
//!
//! The scripted worker runs on a plain thread behind in-memory pipes. It
//! reads length-encoded records, answers every flush with one bucket and a
//! flush acknowledgement, and exits when its input is closed.

#![allow(dead_code)]

use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use autodetect::job::Job;
use autodetect::wire::{
    CONTROL_FIELD_NAME, LengthEncodedReader, LengthEncodedWriter, PipeReader, PipeWriter,
    memory_pipe,
};
use autodetect::{
    AutodetectParams, AutodetectProcessFactory, AutodetectProcessManager, ManagerConfig,
    MemoryJobStore, MemoryResultsStore, ProcessPipes, Result,
};
use parking_lot::Mutex;

/// How the scripted worker misbehaves, if at all.
#[derive(Debug, Clone, Default)]
pub struct WorkerScript {
    /// Log this FATAL message when the input is closed.
    pub fatal_on_exit: Option<String>,
    /// Exit without being asked once this many data records were read.
    pub exit_after_records: Option<usize>,
}

#[derive(Default)]
pub struct ScriptedWorkerFactory {
    script: Mutex<WorkerScript>,
    started: Mutex<Vec<String>>,
    params: Mutex<Vec<AutodetectParams>>,
}

impl ScriptedWorkerFactory {
    pub fn set_script(&self, script: WorkerScript) {
        *self.script.lock() = script;
    }

    /// Job ids of every worker started so far.
    pub fn started(&self) -> Vec<String> {
        self.started.lock().clone()
    }

    /// Bootstrap parameters each worker was started with, oldest first.
    pub fn params(&self) -> Vec<AutodetectParams> {
        self.params.lock().clone()
    }
}

impl AutodetectProcessFactory for ScriptedWorkerFactory {
    fn create_process(&self, job: &Job, params: &AutodetectParams) -> Result<ProcessPipes> {
        let (input_tx, input_rx) = memory_pipe();
        let (output_tx, output_rx) = memory_pipe();
        let (log_tx, log_rx) = memory_pipe();

        let job_id = job.job_id.clone();
        let script = self.script.lock().clone();
        self.started.lock().push(job_id.clone());
        self.params.lock().push(params.clone());
        std::thread::Builder::new()
            .name(format!("scripted-worker-{}", job_id))
            .spawn(move || run_worker(&job_id, script, input_rx, output_tx, log_tx))?;

        Ok(ProcessPipes {
            input: Box::new(input_tx),
            output: Box::new(output_rx),
            log: Box::new(log_rx),
            persist: None,
            child: None,
            files_to_delete: Vec::new(),
        })
    }
}

fn run_worker(
    job_id: &str,
    script: WorkerScript,
    input: PipeReader,
    output: PipeWriter,
    mut log: PipeWriter,
) {
    let mut reader = LengthEncodedReader::new(input);
    let mut results = LengthEncodedWriter::new(output);
    writeln!(log, "INFO scripted worker started for {}", job_id).ok();

    let mut data_records = 0usize;
    while let Ok(Some(fields)) = reader.read_record() {
        let control = fields.last().map(String::as_str).unwrap_or_default();
        if control == CONTROL_FIELD_NAME {
            continue;
        }
        if control.is_empty() {
            data_records += 1;
            if script.exit_after_records == Some(data_records) {
                return;
            }
            continue;
        }
        if let Some(flush_id) = control.strip_prefix('f') {
            let bucket = serde_json::json!({
                "bucket": {
                    "job_id": job_id,
                    "timestamp": 0,
                    "bucket_span": 300,
                    "event_count": data_records,
                }
            });
            let ack = serde_json::json!({ "flush": { "id": flush_id } });
            if results
                .write_record(&[bucket.to_string(), ack.to_string()])
                .and_then(|_| results.flush())
                .is_err()
            {
                return;
            }
        }
    }

    if let Some(message) = &script.fatal_on_exit {
        writeln!(log, "FATAL {}", message).ok();
    }
}

// =============================================================================
// Harness
// =============================================================================

pub struct Harness {
    pub runtime: tokio::runtime::Runtime,
    pub manager: AutodetectProcessManager,
    pub jobs: Arc<MemoryJobStore>,
    pub results: Arc<MemoryResultsStore>,
    pub factory: Arc<ScriptedWorkerFactory>,
}

impl Harness {
    pub fn new(config: ManagerConfig) -> Self {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let jobs = Arc::new(MemoryJobStore::new());
        let results = Arc::new(MemoryResultsStore::new());
        let factory = Arc::new(ScriptedWorkerFactory::default());
        let manager = AutodetectProcessManager::new(
            config,
            runtime.handle().clone(),
            jobs.clone(),
            jobs.clone(),
            results.clone(),
            factory.clone(),
            None,
        )
        .unwrap();

        Self {
            runtime,
            manager,
            jobs,
            results,
            factory,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(fast_config())
    }

    /// Register `job_id` with the job store.
    pub fn add_job(&self, job_id: &str) {
        self.jobs.put_job(job(job_id));
    }

    /// Open a job and wait for the asynchronous part to finish.
    pub fn open(&self, job_id: &str) -> Result<()> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.manager.open_job(job_id, move |result| {
            tx.send(result).ok();
        })?;
        rx.recv_timeout(Duration::from_secs(10))
            .expect("open handler was not called")
    }
}

/// Short timeouts so failing tests fail quickly.
pub fn fast_config() -> ManagerConfig {
    ManagerConfig {
        max_open_jobs: 4,
        process_close_timeout_secs: 10,
        flush_timeout_secs: 10,
        flush_check_interval_ms: 50,
        ..ManagerConfig::default()
    }
}

pub fn job(job_id: &str) -> Job {
    let yaml = format!(
        r#"
job_id: {job_id}
analysis_config:
  bucket_span_secs: 300
  detectors:
    - function: mean
      field_name: responsetime
      by_field_name: airline
"#
    );
    serde_yaml::from_str(&yaml).unwrap()
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}
