// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Per-job aggregate tying a worker process to its result and state
//! threads.

use std::io::BufRead;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;

use crate::config::ManagerConfig;
use crate::error::{AutodetectError, Result};
use crate::job::Job;
use crate::output::AutoDetectResultProcessor;
use crate::persistence::{JobStore, ResultsPersister};
use crate::process::{AutodetectProcess, StateProcessor};
use crate::results::{FlushAcknowledgement, ModelSizeStats};
use crate::wire::{DataLoadParams, FlushJobParams};
use crate::writer::{DataCounts, DataToProcessWriter};

pub struct AutodetectCommunicator {
    job_id: String,
    process: Arc<AutodetectProcess>,
    result_processor: Arc<AutoDetectResultProcessor>,
    data_writer: Mutex<DataToProcessWriter>,
    job_store: Arc<dyn JobStore>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    close_timeout: Duration,
    flush_timeout: Duration,
    flush_check_interval: Duration,
}

impl AutodetectCommunicator {
    /// Start the result and state threads for `process`. If a thread cannot
    /// be started the process is closed before the error is returned.
    ///
    /// `data_counts` are the totals stored for the job so far; updated
    /// totals are written back to `job_store` after every upload and on
    /// close.
    pub fn start(
        job: &Job,
        process: AutodetectProcess,
        result_processor: AutoDetectResultProcessor,
        data_counts: DataCounts,
        config: &ManagerConfig,
        persister: Arc<dyn ResultsPersister>,
        job_store: Arc<dyn JobStore>,
    ) -> Result<Self> {
        let communicator = Self {
            job_id: job.job_id.clone(),
            process: Arc::new(process),
            result_processor: Arc::new(result_processor),
            data_writer: Mutex::new(DataToProcessWriter::new(job, data_counts)),
            job_store,
            threads: Mutex::new(Vec::new()),
            close_timeout: config.process_close_timeout(),
            flush_timeout: config.flush_timeout(),
            flush_check_interval: config.flush_check_interval(),
        };

        if let Err(e) = communicator.start_threads(persister) {
            if let Err(close_err) = communicator.process.close() {
                tracing::warn!("[{}] {}", communicator.job_id, close_err);
            }
            return Err(e);
        }
        Ok(communicator)
    }

    fn start_threads(&self, persister: Arc<dyn ResultsPersister>) -> Result<()> {
        let output = self.process.take_output().ok_or_else(|| {
            AutodetectError::server(&self.job_id, "cannot read results", "output already taken")
        })?;
        let processor = self.result_processor.clone();
        let results_thread = thread::Builder::new()
            .name(format!("autodetect-results-{}", self.job_id))
            .spawn(move || processor.process(output))?;
        self.threads.lock().push(results_thread);

        if let Some(source) = self.process.take_persist() {
            let state_processor = StateProcessor::new(&self.job_id, persister);
            let job_id = self.job_id.clone();
            let state_thread = thread::Builder::new()
                .name(format!("autodetect-state-{}", self.job_id))
                .spawn(move || {
                    if let Err(e) = state_processor.process(source) {
                        tracing::error!("[{}] error persisting model state: {}", job_id, e);
                    }
                })?;
            self.threads.lock().push(state_thread);
        }
        Ok(())
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Tell the worker the names of the fields that follow.
    pub fn write_job_input_header(&self) -> Result<()> {
        let header = self.data_writer.lock().header();
        self.process.write_record(&header)?;
        self.process.flush_stream()?;
        Ok(())
    }

    /// Stream newline-delimited JSON documents to the worker. Returns the
    /// counts for this upload.
    pub fn write_to_job<R: BufRead>(&self, input: R, params: &DataLoadParams) -> Result<DataCounts> {
        self.check_process_is_alive()?;
        if params.is_resetting_buckets() {
            self.process.write_reset_buckets_control_message(params)?;
        }

        let mut writer = self.data_writer.lock();
        let written = writer.write(input, |record| self.process.write_record(record));
        // Records written before a failure still reach the worker.
        let flushed = self.process.flush_stream();
        self.persist_data_counts(writer.data_counts());
        drop(writer);

        let counts = written?;
        flushed?;
        Ok(counts)
    }

    fn persist_data_counts(&self, counts: &DataCounts) {
        if let Err(e) = self.job_store.persist_data_counts(&self.job_id, counts) {
            tracing::warn!("[{}] failed to persist data counts: {}", self.job_id, e);
        }
    }

    /// Ask the worker to flush and wait until it has acknowledged and the
    /// renormalizer has caught up.
    pub fn flush_job(&self, params: &FlushJobParams) -> Result<FlushAcknowledgement> {
        params.validate()?;
        self.check_process_is_alive()?;

        let flush_id = self.process.flush_job(params)?;
        tracing::debug!("[{}] waiting for flush [{}]", self.job_id, flush_id);

        let deadline = Instant::now() + self.flush_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(AutodetectError::server(
                    &self.job_id,
                    &format!("timed out waiting for flush [{}] acknowledgement", flush_id),
                    format!("no acknowledgement within {:?}", self.flush_timeout),
                ));
            }
            let slice = remaining.min(self.flush_check_interval);
            if self
                .result_processor
                .wait_for_flush_acknowledgement(&flush_id, slice)
            {
                break;
            }
            self.check_process_is_alive()?;
            if self.result_processor.flush_listener().is_cleared() {
                return Err(AutodetectError::server(
                    &self.job_id,
                    &format!("flush [{}] was not acknowledged", flush_id),
                    "result stream ended",
                ));
            }
        }

        self.result_processor.wait_until_renormalizer_is_idle();
        tracing::debug!("[{}] flush [{}] acknowledged", self.job_id, flush_id);
        Ok(FlushAcknowledgement { id: flush_id })
    }

    pub fn write_update_config_message(&self, config: &str) -> Result<()> {
        self.process.write_update_config_message(config)?;
        self.process.flush_stream()?;
        Ok(())
    }

    /// Close the worker, then wait for its output to be fully processed.
    pub fn close(&self) -> Result<()> {
        let closed = self.process.close();
        self.persist_data_counts(self.data_writer.lock().data_counts());

        if self
            .result_processor
            .await_completion_timeout(self.close_timeout)
        {
            let threads: Vec<_> = self.threads.lock().drain(..).collect();
            for handle in threads {
                if handle.join().is_err() {
                    tracing::warn!("[{}] autodetect worker thread panicked", self.job_id);
                }
            }
        } else {
            tracing::warn!(
                "[{}] timed out waiting for results processing to complete",
                self.job_id
            );
        }
        closed
    }

    pub fn wait_for_flush_acknowledgement(&self, flush_id: &str, timeout: Duration) -> bool {
        self.result_processor
            .wait_for_flush_acknowledgement(flush_id, timeout)
    }

    pub fn is_process_alive(&self) -> bool {
        self.process.is_process_alive()
    }

    pub fn model_size_stats(&self) -> ModelSizeStats {
        self.result_processor.model_size_stats()
    }

    pub fn data_counts(&self) -> DataCounts {
        self.data_writer.lock().data_counts().clone()
    }

    pub fn process_start_time(&self) -> SystemTime {
        self.process.process_start_time()
    }

    pub fn uptime(&self) -> Duration {
        self.process.uptime()
    }

    fn check_process_is_alive(&self) -> Result<()> {
        if self.process.is_process_alive() {
            return Ok(());
        }
        let error = self
            .process
            .read_error()
            .unwrap_or_else(|| "no error logged".to_string());
        Err(AutodetectError::server(
            &self.job_id,
            "unexpected death of autodetect process",
            error,
        ))
    }
}
