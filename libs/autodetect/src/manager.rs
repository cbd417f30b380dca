// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Node-level coordinator for every open job.
//!
//! Each open job owns one slot in the running-jobs map. A slot is reserved
//! synchronously when the job is opened, before any bootstrap read, so the
//! capacity check and the insert happen under one lock. The slot becomes
//! running once the worker has been started. Closing removes the slot
//! first, so concurrent callers immediately see the job as inactive.
//!
//! Every blocking call here (data, flush, close) must be made from a plain
//! thread, not from inside a tokio task.

use std::collections::HashMap;
use std::io::{BufRead, ErrorKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::runtime::Handle;

use crate::communicator::AutodetectCommunicator;
use crate::config::ManagerConfig;
use crate::error::{AutodetectError, Result};
use crate::job::{Job, JobStatus};
use crate::normalizer::{NoopRenormalizer, Renormalizer, ScoresUpdater, ShortCircuitingRenormalizer};
use crate::output::AutoDetectResultProcessor;
use crate::persistence::{JobProvider, JobStore, ResultsPersister};
use crate::process::{AutodetectParams, AutodetectProcess, AutodetectProcessFactory};
use crate::results::{FlushAcknowledgement, ModelSizeStats};
use crate::wire::{DataLoadParams, FlushJobParams};
use crate::writer::DataCounts;

enum ProcessSlot {
    /// Reserved while bootstrap data is read and the worker is started.
    Opening { generation: u64 },
    Running {
        generation: u64,
        communicator: Arc<AutodetectCommunicator>,
    },
}

impl ProcessSlot {
    fn generation(&self) -> u64 {
        match self {
            ProcessSlot::Opening { generation } | ProcessSlot::Running { generation, .. } => {
                *generation
            }
        }
    }
}

struct ManagerInner {
    config: ManagerConfig,
    runtime: Handle,
    job_store: Arc<dyn JobStore>,
    job_provider: Arc<dyn JobProvider>,
    persister: Arc<dyn ResultsPersister>,
    process_factory: Arc<dyn AutodetectProcessFactory>,
    scores_updater: Option<Arc<dyn ScoresUpdater>>,
    slots: RwLock<HashMap<String, ProcessSlot>>,
    next_generation: AtomicU64,
}

#[derive(Clone)]
pub struct AutodetectProcessManager {
    inner: Arc<ManagerInner>,
}

impl AutodetectProcessManager {
    /// `runtime` runs the asynchronous part of opening a job. Without a
    /// `scores_updater`, quantiles are persisted but never applied.
    pub fn new(
        config: ManagerConfig,
        runtime: Handle,
        job_store: Arc<dyn JobStore>,
        job_provider: Arc<dyn JobProvider>,
        persister: Arc<dyn ResultsPersister>,
        process_factory: Arc<dyn AutodetectProcessFactory>,
        scores_updater: Option<Arc<dyn ScoresUpdater>>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(ManagerInner {
                config,
                runtime,
                job_store,
                job_provider,
                persister,
                process_factory,
                scores_updater,
                slots: RwLock::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
            }),
        })
    }

    /// Open `job_id`. Capacity, unknown-job and invalid-config errors are
    /// returned directly; everything after the slot is reserved runs on
    /// the runtime and its outcome is passed to `handler`.
    ///
    /// Opening a job that already has a slot calls `handler` with `Ok`
    /// and changes nothing.
    pub fn open_job<F>(&self, job_id: &str, handler: F) -> Result<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let inner = &self.inner;
        let job = inner.job_store.job(job_id)?;
        job.validate()?;

        let generation = inner.next_generation.fetch_add(1, Ordering::Relaxed);
        {
            let mut slots = inner.slots.write();
            if slots.contains_key(job_id) {
                drop(slots);
                tracing::debug!("[{}] job is already open", job_id);
                handler(Ok(()));
                return Ok(());
            }
            if slots.len() >= inner.config.max_open_jobs {
                return Err(AutodetectError::Capacity {
                    max: inner.config.max_open_jobs,
                });
            }
            slots.insert(job_id.to_string(), ProcessSlot::Opening { generation });
        }

        tracing::info!("[{}] opening job", job_id);
        if let Err(e) = inner.job_store.set_status(job_id, JobStatus::Opening) {
            inner.remove_slot_if(job_id, generation);
            return Err(e);
        }

        let task_inner = inner.clone();
        inner.runtime.spawn(async move {
            let job_id = job.job_id.clone();
            let result = task_inner.clone().open_and_start(job, generation).await;
            if let Err(e) = &result {
                tracing::error!("[{}] failed to open job: {}", job_id, e);
            }
            handler(result);
        });
        Ok(())
    }

    /// Send newline-delimited JSON documents to an opened job.
    pub fn process_data<R: BufRead>(
        &self,
        job_id: &str,
        input: R,
        params: &DataLoadParams,
    ) -> Result<DataCounts> {
        let status = self.inner.job_store.status(job_id)?;
        if status != JobStatus::Opened {
            return Err(AutodetectError::InvalidState {
                job_id: job_id.to_string(),
                status,
                message: "cannot process data for a job that is not opened".to_string(),
            });
        }
        let communicator =
            self.inner
                .communicator(job_id)
                .ok_or_else(|| AutodetectError::InvalidState {
                    job_id: job_id.to_string(),
                    status,
                    message: "job has no running autodetect process".to_string(),
                })?;

        communicator.write_to_job(input, params).map_err(|e| {
            if e.is_client_error() {
                return e;
            }
            if let AutodetectError::Io(io) = &e {
                if matches!(io.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) {
                    tracing::error!(
                        "[{}] timed out writing to the autodetect process; it may have stalled: {}",
                        job_id,
                        io
                    );
                    return AutodetectError::server(job_id, "timeout while processing data", e);
                }
            }
            tracing::error!("[{}] error writing to the autodetect process: {}", job_id, e);
            AutodetectError::server(job_id, "exception while processing data", e)
        })
    }

    /// Flush a job and wait for the worker to acknowledge it.
    pub fn flush_job(&self, job_id: &str, params: &FlushJobParams) -> Result<FlushAcknowledgement> {
        tracing::debug!("[{}] flushing job", job_id);
        let communicator = self
            .inner
            .communicator(job_id)
            .ok_or_else(|| AutodetectError::NotActive(job_id.to_string()))?;

        communicator.flush_job(params).map_err(|e| {
            if e.is_client_error() {
                return e;
            }
            tracing::error!("[{}] error flushing job: {}", job_id, e);
            AutodetectError::server(job_id, "exception while flushing job", e)
        })
    }

    /// Wait for a flush sent earlier with [`flush_job`](Self::flush_job) to
    /// be acknowledged.
    pub fn wait_for_flush_acknowledgement(
        &self,
        job_id: &str,
        flush_id: &str,
        timeout: Duration,
    ) -> Result<bool> {
        let communicator = self
            .inner
            .communicator(job_id)
            .ok_or_else(|| AutodetectError::NotActive(job_id.to_string()))?;
        Ok(communicator.wait_for_flush_acknowledgement(flush_id, timeout))
    }

    pub fn write_update_config_message(&self, job_id: &str, config: &str) -> Result<()> {
        let Some(communicator) = self.inner.communicator(job_id) else {
            tracing::debug!("[{}] no active autodetect process for config update", job_id);
            return Ok(());
        };
        communicator
            .write_update_config_message(config)
            .map_err(|e| AutodetectError::server(job_id, "exception while updating config", e))
    }

    /// Stop the job's worker. Closing a job without a slot does nothing.
    pub fn close_job(&self, job_id: &str) -> Result<()> {
        self.inner.close_job(job_id)
    }

    /// Close every open job, logging rather than returning failures.
    pub fn close_all_jobs(&self, reason: &str) {
        let job_ids: Vec<String> = self.inner.slots.read().keys().cloned().collect();
        tracing::info!("closing {} jobs: {}", job_ids.len(), reason);
        for job_id in job_ids {
            if let Err(e) = self.close_job(&job_id) {
                tracing::error!("[{}] error closing job: {}", job_id, e);
            }
        }
    }

    /// Jobs holding a slot, opening or running.
    pub fn number_of_open_jobs(&self) -> usize {
        self.inner.slots.read().len()
    }

    pub fn job_has_active_autodetect_process(&self, job_id: &str) -> bool {
        matches!(
            self.inner.slots.read().get(job_id),
            Some(ProcessSlot::Running { .. })
        )
    }

    pub fn job_uptime(&self, job_id: &str) -> Option<Duration> {
        self.inner.communicator(job_id).map(|c| c.uptime())
    }

    pub fn model_size_stats(&self, job_id: &str) -> Option<ModelSizeStats> {
        self.inner.communicator(job_id).map(|c| c.model_size_stats())
    }

    pub fn data_counts(&self, job_id: &str) -> Option<DataCounts> {
        self.inner.communicator(job_id).map(|c| c.data_counts())
    }
}

impl ManagerInner {
    fn communicator(&self, job_id: &str) -> Option<Arc<AutodetectCommunicator>> {
        match self.slots.read().get(job_id) {
            Some(ProcessSlot::Running { communicator, .. }) => Some(communicator.clone()),
            _ => None,
        }
    }

    /// Remove the slot for `job_id` only if it is still the one created
    /// with `generation`.
    fn remove_slot_if(&self, job_id: &str, generation: u64) -> Option<ProcessSlot> {
        let mut slots = self.slots.write();
        match slots.get(job_id) {
            Some(slot) if slot.generation() == generation => slots.remove(job_id),
            _ => None,
        }
    }

    /// Turn a reserved slot into a running one. Fails if the slot was
    /// removed or replaced while the worker was starting.
    fn promote_slot(
        &self,
        job_id: &str,
        generation: u64,
        communicator: &Arc<AutodetectCommunicator>,
    ) -> bool {
        let mut slots = self.slots.write();
        let Some(slot) = slots.get_mut(job_id) else {
            return false;
        };
        if !matches!(slot, ProcessSlot::Opening { generation: g } if *g == generation) {
            return false;
        }
        *slot = ProcessSlot::Running {
            generation,
            communicator: communicator.clone(),
        };
        true
    }

    fn set_status_logged(&self, job_id: &str, status: JobStatus) {
        if let Err(e) = self.job_store.set_status(job_id, status) {
            tracing::error!("[{}] failed to set job status to [{}]: {}", job_id, status, e);
        }
    }

    async fn open_and_start(self: Arc<Self>, job: Job, generation: u64) -> Result<()> {
        let job_id = job.job_id.clone();

        let params = match self.gather_params(&job).await {
            Ok(params) => params,
            Err(e) => {
                self.remove_slot_if(&job_id, generation);
                self.set_status_logged(&job_id, JobStatus::Failed);
                return Err(e);
            }
        };

        let blocking_inner = self.clone();
        let created = tokio::task::spawn_blocking(move || {
            blocking_inner.create_communicator(&job, params, generation)
        })
        .await
        .map_err(|e| AutodetectError::server(&job_id, "failed to start autodetect process", e))
        .and_then(|created| created);

        let communicator = match created {
            Ok(communicator) => communicator,
            Err(e) => {
                self.remove_slot_if(&job_id, generation);
                self.set_status_logged(&job_id, JobStatus::Failed);
                return Err(e);
            }
        };

        if !self.promote_slot(&job_id, generation, &communicator) {
            tracing::info!(
                "[{}] job was closed while opening, stopping the new autodetect process",
                job_id
            );
            self.close_in_background(&job_id, communicator);
            return Err(AutodetectError::InvalidState {
                job_id,
                status: JobStatus::Closed,
                message: "job was closed while it was opening".to_string(),
            });
        }

        if let Err(e) = self.job_store.set_status(&job_id, JobStatus::Opened) {
            if let Some(ProcessSlot::Running { communicator, .. }) =
                self.remove_slot_if(&job_id, generation)
            {
                self.close_in_background(&job_id, communicator);
            }
            return Err(e);
        }
        tracing::info!("[{}] job opened", job_id);
        Ok(())
    }

    /// Read everything a worker needs before it can start. The reads run
    /// concurrently and the first failure aborts the rest.
    async fn gather_params(&self, job: &Job) -> Result<AutodetectParams> {
        let job_id = job.job_id.as_str();
        let list_ids = job.analysis_config.referenced_lists();
        let provider = self.job_provider.as_ref();

        let (snapshots, quantiles, lists, data_counts, model_size_stats) = tokio::try_join!(
            provider.model_snapshots(job_id, 0, 1),
            provider.quantiles(job_id),
            provider.lists(&list_ids),
            provider.data_counts(job_id),
            provider.model_size_stats(job_id),
        )?;

        let model_snapshot = snapshots.results.into_iter().next();
        match &model_snapshot {
            Some(snapshot) => tracing::debug!(
                "[{}] restoring model snapshot [{}]",
                job_id,
                snapshot.snapshot_id
            ),
            None => tracing::debug!("[{}] no model snapshot to restore", job_id),
        }
        if data_counts.processed_record_count > 0 {
            if model_snapshot.is_none() {
                tracing::warn!(
                    "[{}] {} records were processed before but no model snapshot was found",
                    job_id,
                    data_counts.processed_record_count
                );
            }
            if quantiles.is_none() {
                tracing::warn!(
                    "[{}] {} records were processed before but no quantiles were found",
                    job_id,
                    data_counts.processed_record_count
                );
            }
        }
        tracing::debug!(
            "[{}] found {} of {} referenced lists",
            job_id,
            lists.len(),
            list_ids.len()
        );

        Ok(AutodetectParams {
            model_snapshot,
            quantiles,
            lists,
            data_counts,
            model_size_stats,
        })
    }

    fn create_communicator(
        self: &Arc<Self>,
        job: &Job,
        params: AutodetectParams,
        generation: u64,
    ) -> Result<Arc<AutodetectCommunicator>> {
        let job_id = job.job_id.as_str();
        let pipes = self.process_factory.create_process(job, &params)?;

        let weak: Weak<Self> = Arc::downgrade(self);
        let crashed_job = job_id.to_string();
        let process = AutodetectProcess::start(
            job_id,
            job.analysis_fields().len(),
            pipes,
            self.config.process_close_timeout(),
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_crash(&crashed_job, generation);
                }
            }),
        )?;

        let per_partition = job.analysis_config.use_per_partition_normalization;
        let renormalizer: Arc<dyn Renormalizer> = match &self.scores_updater {
            Some(updater) => Arc::new(ShortCircuitingRenormalizer::new(
                job_id,
                updater.clone(),
                per_partition,
            )),
            None => Arc::new(NoopRenormalizer),
        };
        let result_processor = AutoDetectResultProcessor::new(
            job_id,
            renormalizer,
            self.persister.clone(),
            per_partition,
            params.model_size_stats,
        );

        let communicator = Arc::new(AutodetectCommunicator::start(
            job,
            process,
            result_processor,
            params.data_counts,
            &self.config,
            self.persister.clone(),
            self.job_store.clone(),
        )?);

        if let Err(e) = communicator.write_job_input_header() {
            if let Err(close_err) = communicator.close() {
                tracing::warn!("[{}] {}", job_id, close_err);
            }
            return Err(AutodetectError::server(
                job_id,
                "failed to write job input header",
                e,
            ));
        }
        Ok(communicator)
    }

    fn close_in_background(&self, job_id: &str, communicator: Arc<AutodetectCommunicator>) {
        let job_id = job_id.to_string();
        self.runtime.spawn_blocking(move || {
            if let Err(e) = communicator.close() {
                tracing::error!("[{}] error closing autodetect process: {}", job_id, e);
            }
        });
    }

    /// The worker's log stream ended without the job being closed.
    fn handle_crash(&self, job_id: &str, generation: u64) {
        let Some(slot) = self.remove_slot_if(job_id, generation) else {
            return;
        };
        tracing::error!("[{}] autodetect process stopped unexpectedly, failing job", job_id);
        self.set_status_logged(job_id, JobStatus::Failed);
        if let ProcessSlot::Running { communicator, .. } = slot {
            self.close_in_background(job_id, communicator);
        }
    }

    fn close_job(&self, job_id: &str) -> Result<()> {
        let removed = self.slots.write().remove(job_id);
        match removed {
            None => {
                tracing::debug!("[{}] cannot close job: no active autodetect process", job_id);
                Ok(())
            }
            Some(ProcessSlot::Opening { .. }) => {
                tracing::info!("[{}] closing job that is still opening", job_id);
                self.set_status_logged(job_id, JobStatus::Closed);
                Ok(())
            }
            Some(ProcessSlot::Running { communicator, .. }) => {
                tracing::info!("[{}] closing job", job_id);
                self.set_status_logged(job_id, JobStatus::Closing);
                match communicator.close() {
                    Ok(()) => {
                        self.set_status_logged(job_id, JobStatus::Closed);
                        tracing::info!("[{}] job closed", job_id);
                        Ok(())
                    }
                    Err(e) => {
                        tracing::error!("[{}] error closing job: {}", job_id, e);
                        self.set_status_logged(job_id, JobStatus::Failed);
                        Err(e)
                    }
                }
            }
        }
    }
}
