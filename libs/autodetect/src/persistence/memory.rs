// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! In-process stores backed by `parking_lot` locks.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use super::{BoxFuture, JobProvider, JobStore, QueryPage, ResultDocument, ResultsPersister};
use crate::error::{AutodetectError, Result};
use crate::job::{Job, JobStatus, ListDocument};
use crate::results::{
    AnomalyRecord, Bucket, CategoryDefinition, ModelDebugOutput, ModelSizeStats, ModelSnapshot,
    Quantiles,
};
use crate::writer::DataCounts;

/// One call made against a [`MemoryResultsStore`], in call order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PersistOp {
    Bulk {
        job_id: String,
        documents: Vec<ResultDocument>,
    },
    CategoryDefinition(CategoryDefinition),
    ModelDebugOutput(ModelDebugOutput),
    ModelSizeStats(ModelSizeStats),
    ModelSnapshot(ModelSnapshot),
    Quantiles(Quantiles),
    State {
        job_id: String,
        document: String,
    },
    DeleteInterimResults {
        job_id: String,
    },
    Commit {
        job_id: String,
    },
}

impl PersistOp {
    pub fn job_id(&self) -> &str {
        match self {
            PersistOp::Bulk { job_id, .. }
            | PersistOp::State { job_id, .. }
            | PersistOp::DeleteInterimResults { job_id }
            | PersistOp::Commit { job_id } => job_id,
            PersistOp::CategoryDefinition(d) => &d.job_id,
            PersistOp::ModelDebugOutput(d) => &d.job_id,
            PersistOp::ModelSizeStats(s) => &s.job_id,
            PersistOp::ModelSnapshot(s) => &s.job_id,
            PersistOp::Quantiles(q) => &q.job_id,
        }
    }
}

/// Results store that keeps an ordered log of every write.
#[derive(Default)]
pub struct MemoryResultsStore {
    operations: Mutex<Vec<PersistOp>>,
    fail_writes: AtomicBool,
}

impl MemoryResultsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent bulk write fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }

    pub fn operations(&self) -> Vec<PersistOp> {
        self.operations.lock().clone()
    }

    pub fn operations_for(&self, job_id: &str) -> Vec<PersistOp> {
        self.operations
            .lock()
            .iter()
            .filter(|op| op.job_id() == job_id)
            .cloned()
            .collect()
    }

    pub fn buckets(&self, job_id: &str) -> Vec<Bucket> {
        self.bulk_documents(job_id)
            .into_iter()
            .filter_map(|doc| match doc {
                ResultDocument::Bucket(bucket) => Some(bucket),
                _ => None,
            })
            .collect()
    }

    pub fn records(&self, job_id: &str) -> Vec<AnomalyRecord> {
        self.bulk_documents(job_id)
            .into_iter()
            .filter_map(|doc| match doc {
                ResultDocument::Records(records) => Some(records),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn delete_interim_count(&self, job_id: &str) -> usize {
        self.count(job_id, |op| matches!(op, PersistOp::DeleteInterimResults { .. }))
    }

    pub fn commit_count(&self, job_id: &str) -> usize {
        self.count(job_id, |op| matches!(op, PersistOp::Commit { .. }))
    }

    pub fn state_documents(&self, job_id: &str) -> Vec<String> {
        self.operations_for(job_id)
            .into_iter()
            .filter_map(|op| match op {
                PersistOp::State { document, .. } => Some(document),
                _ => None,
            })
            .collect()
    }

    fn bulk_documents(&self, job_id: &str) -> Vec<ResultDocument> {
        self.operations_for(job_id)
            .into_iter()
            .filter_map(|op| match op {
                PersistOp::Bulk { documents, .. } => Some(documents),
                _ => None,
            })
            .flatten()
            .collect()
    }

    fn count(&self, job_id: &str, predicate: impl Fn(&PersistOp) -> bool) -> usize {
        self.operations
            .lock()
            .iter()
            .filter(|op| op.job_id() == job_id && predicate(op))
            .count()
    }

    fn push(&self, op: PersistOp) -> Result<()> {
        self.operations.lock().push(op);
        Ok(())
    }
}

impl ResultsPersister for MemoryResultsStore {
    fn persist_bulk(&self, job_id: &str, documents: Vec<ResultDocument>) -> Result<()> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(AutodetectError::Persistence(format!(
                "[{}] bulk request of {} documents rejected",
                job_id,
                documents.len()
            )));
        }
        self.push(PersistOp::Bulk {
            job_id: job_id.to_string(),
            documents,
        })
    }

    fn persist_category_definition(&self, definition: &CategoryDefinition) -> Result<()> {
        self.push(PersistOp::CategoryDefinition(definition.clone()))
    }

    fn persist_model_debug_output(&self, output: &ModelDebugOutput) -> Result<()> {
        self.push(PersistOp::ModelDebugOutput(output.clone()))
    }

    fn persist_model_size_stats(&self, stats: &ModelSizeStats) -> Result<()> {
        self.push(PersistOp::ModelSizeStats(stats.clone()))
    }

    fn persist_model_snapshot(&self, snapshot: &ModelSnapshot) -> Result<()> {
        self.push(PersistOp::ModelSnapshot(snapshot.clone()))
    }

    fn persist_quantiles(&self, quantiles: &Quantiles) -> Result<()> {
        self.push(PersistOp::Quantiles(quantiles.clone()))
    }

    fn persist_state(&self, job_id: &str, document: &[u8]) -> Result<()> {
        self.push(PersistOp::State {
            job_id: job_id.to_string(),
            document: String::from_utf8_lossy(document).into_owned(),
        })
    }

    fn delete_interim_results(&self, job_id: &str) -> Result<()> {
        self.push(PersistOp::DeleteInterimResults {
            job_id: job_id.to_string(),
        })
    }

    fn commit_result_writes(&self, job_id: &str) -> Result<()> {
        self.push(PersistOp::Commit {
            job_id: job_id.to_string(),
        })
    }
}

struct JobEntry {
    job: Job,
    status: JobStatus,
    history: Vec<JobStatus>,
}

#[derive(Default)]
struct JobStoreState {
    jobs: HashMap<String, JobEntry>,
    snapshots: HashMap<String, Vec<ModelSnapshot>>,
    quantiles: HashMap<String, Quantiles>,
    lists: HashMap<String, ListDocument>,
    data_counts: HashMap<String, DataCounts>,
    model_size_stats: HashMap<String, ModelSizeStats>,
    bootstrap_failure: Option<String>,
}

/// Job configuration and bootstrap data held in memory.
#[derive(Default)]
pub struct MemoryJobStore {
    state: RwLock<JobStoreState>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_job(&self, job: Job) {
        let mut state = self.state.write();
        state.jobs.insert(
            job.job_id.clone(),
            JobEntry {
                job,
                status: JobStatus::Closed,
                history: Vec::new(),
            },
        );
    }

    pub fn put_model_snapshot(&self, snapshot: ModelSnapshot) {
        self.state
            .write()
            .snapshots
            .entry(snapshot.job_id.clone())
            .or_default()
            .push(snapshot);
    }

    pub fn put_quantiles(&self, quantiles: Quantiles) {
        self.state
            .write()
            .quantiles
            .insert(quantiles.job_id.clone(), quantiles);
    }

    pub fn put_list(&self, list: ListDocument) {
        self.state.write().lists.insert(list.id.clone(), list);
    }

    pub fn put_data_counts(&self, job_id: &str, counts: DataCounts) {
        self.state
            .write()
            .data_counts
            .insert(job_id.to_string(), counts);
    }

    /// Make bootstrap reads fail with `message` until reset with `None`.
    pub fn fail_bootstrap(&self, message: Option<&str>) {
        self.state.write().bootstrap_failure = message.map(str::to_string);
    }

    /// Every status written for the job, oldest first.
    pub fn status_history(&self, job_id: &str) -> Vec<JobStatus> {
        self.state
            .read()
            .jobs
            .get(job_id)
            .map(|entry| entry.history.clone())
            .unwrap_or_default()
    }

    fn check_bootstrap(&self) -> Result<()> {
        match &self.state.read().bootstrap_failure {
            Some(message) => Err(AutodetectError::Persistence(message.clone())),
            None => Ok(()),
        }
    }
}

impl JobStore for MemoryJobStore {
    fn job(&self, job_id: &str) -> Result<Job> {
        self.state
            .read()
            .jobs
            .get(job_id)
            .map(|entry| entry.job.clone())
            .ok_or_else(|| AutodetectError::UnknownJob(job_id.to_string()))
    }

    fn status(&self, job_id: &str) -> Result<JobStatus> {
        self.state
            .read()
            .jobs
            .get(job_id)
            .map(|entry| entry.status)
            .ok_or_else(|| AutodetectError::UnknownJob(job_id.to_string()))
    }

    fn set_status(&self, job_id: &str, status: JobStatus) -> Result<()> {
        let mut state = self.state.write();
        let entry = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| AutodetectError::UnknownJob(job_id.to_string()))?;
        entry.status = status;
        entry.history.push(status);
        Ok(())
    }

    fn persist_data_counts(&self, job_id: &str, counts: &DataCounts) -> Result<()> {
        self.put_data_counts(job_id, counts.clone());
        Ok(())
    }
}

impl JobProvider for MemoryJobStore {
    fn model_snapshots<'a>(
        &'a self,
        job_id: &'a str,
        from: usize,
        size: usize,
    ) -> BoxFuture<'a, Result<QueryPage<ModelSnapshot>>> {
        Box::pin(async move {
            self.check_bootstrap()?;
            let state = self.state.read();
            let mut snapshots = state.snapshots.get(job_id).cloned().unwrap_or_default();
            snapshots.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
            let count = snapshots.len() as u64;
            Ok(QueryPage {
                results: snapshots.into_iter().skip(from).take(size).collect(),
                count,
            })
        })
    }

    fn quantiles<'a>(&'a self, job_id: &'a str) -> BoxFuture<'a, Result<Option<Quantiles>>> {
        Box::pin(async move {
            self.check_bootstrap()?;
            Ok(self.state.read().quantiles.get(job_id).cloned())
        })
    }

    fn lists<'a>(&'a self, ids: &'a BTreeSet<String>) -> BoxFuture<'a, Result<Vec<ListDocument>>> {
        Box::pin(async move {
            self.check_bootstrap()?;
            let state = self.state.read();
            Ok(ids
                .iter()
                .filter_map(|id| state.lists.get(id).cloned())
                .collect())
        })
    }

    fn data_counts<'a>(&'a self, job_id: &'a str) -> BoxFuture<'a, Result<DataCounts>> {
        Box::pin(async move {
            self.check_bootstrap()?;
            Ok(self
                .state
                .read()
                .data_counts
                .get(job_id)
                .cloned()
                .unwrap_or_default())
        })
    }

    fn model_size_stats<'a>(
        &'a self,
        job_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<ModelSizeStats>>> {
        Box::pin(async move {
            self.check_bootstrap()?;
            Ok(self.state.read().model_size_stats.get(job_id).cloned())
        })
    }
}
