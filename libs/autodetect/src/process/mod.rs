// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Worker process lifecycle: spawning, stream ownership and shutdown.

pub mod autodetect_process;
pub mod factory;
pub mod log_handler;
pub mod state_processor;

use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::Child;

use crate::error::Result;
use crate::job::{Job, ListDocument};
use crate::results::{ModelSizeStats, ModelSnapshot, Quantiles};
use crate::writer::DataCounts;

pub use autodetect_process::AutodetectProcess;
pub use factory::NativeProcessFactory;
pub use log_handler::{LogLevel, ProcessLogState};
pub use state_processor::StateProcessor;

/// Everything fetched from the stores before a worker is started.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AutodetectParams {
    pub model_snapshot: Option<ModelSnapshot>,
    pub quantiles: Option<Quantiles>,
    pub lists: Vec<ListDocument>,
    pub data_counts: DataCounts,
    pub model_size_stats: Option<ModelSizeStats>,
}

/// Where the worker writes its model state.
pub enum PersistSource {
    /// An already open stream.
    Stream(Box<dyn Read + Send>),
    /// A named pipe that only becomes readable once the worker opens it.
    Fifo(PathBuf),
}

/// The streams and resources of a freshly started worker.
pub struct ProcessPipes {
    pub input: Box<dyn Write + Send>,
    pub output: Box<dyn Read + Send>,
    pub log: Box<dyn Read + Send>,
    pub persist: Option<PersistSource>,
    /// The OS process, when there is one.
    pub child: Option<Child>,
    /// Paths removed when the process is closed, files or directories.
    pub files_to_delete: Vec<PathBuf>,
}

/// Starts workers. Implementations must not block on the worker itself,
/// only on launching it.
pub trait AutodetectProcessFactory: Send + Sync {
    fn create_process(&self, job: &Job, params: &AutodetectParams) -> Result<ProcessPipes>;
}
