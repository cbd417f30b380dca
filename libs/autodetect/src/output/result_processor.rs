// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Drains a worker's output and persists what it finds.
//!
//! Results are handled strictly in stream order:
//!
//! * a bucket first deletes stale interim results if a flush was
//!   acknowledged since the last bucket, then is sent together with the
//!   records and influencers accumulated for it;
//! * records and influencers are accumulated until their bucket arrives;
//! * category definitions, model debug output, model size stats, model
//!   snapshots and quantiles are written immediately;
//! * quantiles also kick off a renormalization;
//! * a flush acknowledgement sends whatever is accumulated, commits, and
//!   releases the thread waiting for that flush.

use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};

use crate::error::Result;
use crate::normalizer::Renormalizer;
use crate::persistence::{BulkResultsPersister, ResultsPersister};
use crate::results::{AutodetectResult, ModelSizeStats, PerPartitionMaxProbabilities};
use crate::wire::AutodetectResultsParser;

use super::flush_listener::FlushListener;

pub struct AutoDetectResultProcessor {
    job_id: String,
    renormalizer: Arc<dyn Renormalizer>,
    persister: Arc<dyn ResultsPersister>,
    parser: AutodetectResultsParser,
    flush_listener: FlushListener,
    per_partition_normalization: bool,
    latest_model_size_stats: RwLock<ModelSizeStats>,
    completed: Mutex<bool>,
    completion: Condvar,
}

/// State carried from one result to the next.
struct Context {
    delete_interim_required: bool,
    bulk: BulkResultsPersister,
    bucket_count: u64,
}

/// Runs the shutdown sequence however `process` exits.
struct CompletionGuard<'a>(&'a AutoDetectResultProcessor);

impl Drop for CompletionGuard<'_> {
    fn drop(&mut self) {
        self.0.complete();
    }
}

impl AutoDetectResultProcessor {
    pub fn new(
        job_id: &str,
        renormalizer: Arc<dyn Renormalizer>,
        persister: Arc<dyn ResultsPersister>,
        per_partition_normalization: bool,
        model_size_stats: Option<ModelSizeStats>,
    ) -> Self {
        Self {
            job_id: job_id.to_string(),
            renormalizer,
            persister,
            parser: AutodetectResultsParser::new(),
            flush_listener: FlushListener::new(),
            per_partition_normalization,
            latest_model_size_stats: RwLock::new(
                model_size_stats.unwrap_or_else(|| ModelSizeStats::new(job_id)),
            ),
            completed: Mutex::new(false),
            completion: Condvar::new(),
        }
    }

    /// Consume `stream` until it ends or fails. Errors are logged, never
    /// returned; on every exit path the renormalizer is drained, flush
    /// waiters are released and completion is signalled.
    pub fn process<R: Read>(&self, stream: R) {
        let _guard = CompletionGuard(self);
        let mut context = Context {
            delete_interim_required: false,
            bulk: self.persister.bulk_persister(&self.job_id),
            bucket_count: 0,
        };

        let outcome = self.process_stream(stream, &mut context);
        tracing::info!(
            "[{}] {} buckets parsed from autodetect output",
            self.job_id,
            context.bucket_count
        );
        match outcome {
            Ok(()) => tracing::info!("[{}] parse results complete", self.job_id),
            Err(e) => tracing::error!("[{}] error parsing autodetect output: {}", self.job_id, e),
        }
    }

    fn process_stream<R: Read>(&self, stream: R, context: &mut Context) -> Result<()> {
        for result in self.parser.parse_results(stream) {
            let result = result?;
            self.process_result(context, result)?;
        }
        context.bulk.execute_request(self.persister.as_ref())
    }

    fn process_result(&self, context: &mut Context, result: AutodetectResult) -> Result<()> {
        let persister = self.persister.as_ref();
        match result {
            AutodetectResult::Bucket(bucket) => {
                if context.delete_interim_required {
                    tracing::trace!("[{}] deleting interim results", self.job_id);
                    persister.delete_interim_results(&self.job_id)?;
                    context.delete_interim_required = false;
                }
                context.bucket_count += 1;
                context.bulk.persist_bucket(bucket).execute_request(persister)?;
                context.bulk = persister.bulk_persister(&self.job_id);
            }
            AutodetectResult::Records(records) => {
                if !records.is_empty() {
                    let per_partition = if self.per_partition_normalization {
                        PerPartitionMaxProbabilities::from_records(&records)
                    } else {
                        None
                    };
                    context.bulk.persist_records(records);
                    if let Some(probabilities) = per_partition {
                        context
                            .bulk
                            .persist_per_partition_max_probabilities(probabilities);
                    }
                }
            }
            AutodetectResult::Influencers(influencers) => {
                context.bulk.persist_influencers(influencers);
            }
            AutodetectResult::CategoryDefinition(definition) => {
                persister.persist_category_definition(&definition)?;
            }
            AutodetectResult::ModelDebugOutput(output) => {
                persister.persist_model_debug_output(&output)?;
            }
            AutodetectResult::ModelSizeStats(stats) => {
                tracing::trace!(
                    "[{}] parsed model size stats: {} bytes, status {:?}",
                    self.job_id,
                    stats.model_bytes,
                    stats.memory_status
                );
                *self.latest_model_size_stats.write() = stats.clone();
                persister.persist_model_size_stats(&stats)?;
            }
            AutodetectResult::ModelSnapshot(snapshot) => {
                persister.persist_model_snapshot(&snapshot)?;
            }
            AutodetectResult::Quantiles(quantiles) => {
                persister.persist_quantiles(&quantiles)?;
                tracing::debug!("[{}] quantiles parsed from output, renormalizing", self.job_id);
                self.renormalizer.renormalize(quantiles);
            }
            AutodetectResult::FlushAcknowledgement(ack) => {
                tracing::debug!("[{}] flush acknowledgement parsed for id [{}]", self.job_id, ack.id);
                context.bulk.execute_request(persister)?;
                persister.commit_result_writes(&self.job_id)?;
                self.flush_listener.acknowledge_flush(&ack.id);
                // Results up to the next bucket may replace interim ones.
                context.delete_interim_required = true;
            }
        }
        Ok(())
    }

    fn complete(&self) {
        self.renormalizer.wait_until_idle();
        self.flush_listener.clear();
        let mut completed = self.completed.lock();
        *completed = true;
        self.completion.notify_all();
    }

    /// Block until `process` has returned and its cleanup has run.
    pub fn await_completion(&self) {
        let mut completed = self.completed.lock();
        while !*completed {
            self.completion.wait(&mut completed);
        }
    }

    /// Like [`await_completion`](Self::await_completion) but gives up after
    /// `timeout`. Returns whether processing completed.
    pub fn await_completion_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut completed = self.completed.lock();
        while !*completed {
            if self
                .completion
                .wait_until(&mut completed, deadline)
                .timed_out()
            {
                break;
            }
        }
        *completed
    }

    pub fn is_complete(&self) -> bool {
        *self.completed.lock()
    }

    pub fn wait_for_flush_acknowledgement(&self, flush_id: &str, timeout: Duration) -> bool {
        self.flush_listener.wait_for_flush(flush_id, timeout)
    }

    pub fn flush_listener(&self) -> &FlushListener {
        &self.flush_listener
    }

    pub fn wait_until_renormalizer_is_idle(&self) {
        self.renormalizer.wait_until_idle();
    }

    pub fn model_size_stats(&self) -> ModelSizeStats {
        self.latest_model_size_stats.read().clone()
    }
}
