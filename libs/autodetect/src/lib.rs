// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Process orchestration for per-job anomaly detection workers.
//!
//! [`AutodetectProcessManager`] owns one worker process per open job. Input
//! records go to the worker over a length-encoded pipe, results come back as
//! a stream of JSON documents that are persisted in bulk, and flush control
//! messages give callers a point at which everything sent so far is
//! reflected in the stores.

pub mod communicator;
pub mod config;
pub mod error;
pub mod job;
pub mod manager;
pub mod normalizer;
pub mod output;
pub mod persistence;
pub mod process;
pub mod results;
pub mod wire;
pub mod writer;

pub use communicator::AutodetectCommunicator;
pub use config::{ManagerConfig, WorkerConfig};
pub use error::{AutodetectError, Result};
pub use job::{Job, JobStatus};
pub use manager::AutodetectProcessManager;
pub use normalizer::{NoopRenormalizer, Renormalizer, ScoresUpdater, ShortCircuitingRenormalizer};
pub use output::{AutoDetectResultProcessor, FlushListener};
pub use persistence::{
    JobProvider, JobStore, MemoryJobStore, MemoryResultsStore, PersistOp, ResultsPersister,
};
pub use process::{
    AutodetectParams, AutodetectProcess, AutodetectProcessFactory, NativeProcessFactory,
    PersistSource, ProcessPipes,
};
pub use results::{AutodetectResult, FlushAcknowledgement};
pub use wire::{DataLoadParams, FlushJobParams};
pub use writer::DataCounts;
