// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Contracts with the stores a job reads from and writes to.
//!
//! The manager only talks to these traits. [`memory`] holds in-process
//! implementations used by tests and the CLI.

pub mod memory;

use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::job::{Job, JobStatus, ListDocument};
use crate::results::{
    AnomalyRecord, Bucket, CategoryDefinition, Influencer, ModelDebugOutput, ModelSizeStats,
    ModelSnapshot, PerPartitionMaxProbabilities, Quantiles,
};
use crate::writer::DataCounts;

pub use memory::{MemoryJobStore, MemoryResultsStore, PersistOp};

/// Boxed future type for async trait methods (required for dyn compatibility).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One page of a store query, most relevant entry first.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPage<T> {
    pub results: Vec<T>,
    pub count: u64,
}

impl<T> QueryPage<T> {
    pub fn empty() -> Self {
        Self {
            results: Vec::new(),
            count: 0,
        }
    }
}

/// A result written as part of a bulk request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "document", rename_all = "snake_case")]
pub enum ResultDocument {
    Bucket(Bucket),
    Records(Vec<AnomalyRecord>),
    Influencers(Vec<Influencer>),
    PerPartitionMaxProbabilities(PerPartitionMaxProbabilities),
}

/// Writes results for any number of jobs. Implementations must be safe to
/// share between the result loops of several jobs.
pub trait ResultsPersister: Send + Sync {
    /// Write a batch of documents as one request.
    fn persist_bulk(&self, job_id: &str, documents: Vec<ResultDocument>) -> Result<()>;

    fn persist_category_definition(&self, definition: &CategoryDefinition) -> Result<()>;

    fn persist_model_debug_output(&self, output: &ModelDebugOutput) -> Result<()>;

    fn persist_model_size_stats(&self, stats: &ModelSizeStats) -> Result<()>;

    fn persist_model_snapshot(&self, snapshot: &ModelSnapshot) -> Result<()>;

    fn persist_quantiles(&self, quantiles: &Quantiles) -> Result<()>;

    /// Store one model state document emitted on the persist stream.
    fn persist_state(&self, job_id: &str, document: &[u8]) -> Result<()>;

    /// Remove every interim result previously written for the job.
    fn delete_interim_results(&self, job_id: &str) -> Result<()>;

    /// Make everything written so far for the job visible to readers.
    fn commit_result_writes(&self, job_id: &str) -> Result<()>;

    fn bulk_persister(&self, job_id: &str) -> BulkResultsPersister {
        BulkResultsPersister::new(job_id)
    }
}

/// Accumulates the bucket-scoped results of one bucket until the bucket
/// itself (or a flush acknowledgement) arrives.
#[derive(Debug)]
pub struct BulkResultsPersister {
    job_id: String,
    documents: Vec<ResultDocument>,
}

impl BulkResultsPersister {
    pub fn new(job_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            documents: Vec::new(),
        }
    }

    pub fn persist_bucket(&mut self, bucket: Bucket) -> &mut Self {
        tracing::trace!(
            "[{}] bulk: bucket at {}, interim {}",
            self.job_id,
            bucket.timestamp,
            bucket.is_interim
        );
        self.documents.push(ResultDocument::Bucket(bucket));
        self
    }

    pub fn persist_records(&mut self, records: Vec<AnomalyRecord>) -> &mut Self {
        if !records.is_empty() {
            self.documents.push(ResultDocument::Records(records));
        }
        self
    }

    pub fn persist_influencers(&mut self, influencers: Vec<Influencer>) -> &mut Self {
        if !influencers.is_empty() {
            self.documents.push(ResultDocument::Influencers(influencers));
        }
        self
    }

    pub fn persist_per_partition_max_probabilities(
        &mut self,
        probabilities: PerPartitionMaxProbabilities,
    ) -> &mut Self {
        self.documents
            .push(ResultDocument::PerPartitionMaxProbabilities(probabilities));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// Send the accumulated documents, leaving the accumulator empty. An
    /// empty accumulator sends nothing.
    pub fn execute_request(&mut self, persister: &dyn ResultsPersister) -> Result<()> {
        if self.documents.is_empty() {
            return Ok(());
        }
        let documents = std::mem::take(&mut self.documents);
        tracing::trace!(
            "[{}] executing bulk request of {} documents",
            self.job_id,
            documents.len()
        );
        persister.persist_bulk(&self.job_id, documents)
    }
}

/// Job definitions and their lifecycle status.
pub trait JobStore: Send + Sync {
    fn job(&self, job_id: &str) -> Result<Job>;

    fn status(&self, job_id: &str) -> Result<JobStatus>;

    fn set_status(&self, job_id: &str, status: JobStatus) -> Result<()>;

    /// Store the running input totals. They are read back through
    /// [`JobProvider::data_counts`] when the job is next opened.
    fn persist_data_counts(&self, job_id: &str, counts: &DataCounts) -> Result<()>;
}

/// Reads needed to bootstrap a worker. All of them run before the worker
/// is spawned, concurrently.
pub trait JobProvider: Send + Sync {
    /// Model snapshots for the job, most recent first.
    fn model_snapshots<'a>(
        &'a self,
        job_id: &'a str,
        from: usize,
        size: usize,
    ) -> BoxFuture<'a, Result<QueryPage<ModelSnapshot>>>;

    fn quantiles<'a>(&'a self, job_id: &'a str) -> BoxFuture<'a, Result<Option<Quantiles>>>;

    fn lists<'a>(&'a self, ids: &'a BTreeSet<String>) -> BoxFuture<'a, Result<Vec<ListDocument>>>;

    fn data_counts<'a>(&'a self, job_id: &'a str) -> BoxFuture<'a, Result<DataCounts>>;

    fn model_size_stats<'a>(
        &'a self,
        job_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<ModelSizeStats>>>;
}
