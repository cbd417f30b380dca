// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! `autodetect run`: one job, start to finish, with in-memory stores.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use autodetect::{
    AutodetectProcessManager, DataLoadParams, FlushJobParams, ManagerConfig, MemoryJobStore,
    MemoryResultsStore, NativeProcessFactory,
};

/// How long to wait for the worker to come up.
const OPEN_TIMEOUT: Duration = Duration::from_secs(60);

pub struct RunArgs {
    pub job: PathBuf,
    pub config: Option<PathBuf>,
    pub input: Option<PathBuf>,
    pub flush: bool,
    pub output: Option<PathBuf>,
}

pub fn run(args: RunArgs) -> Result<()> {
    let job = super::load_job(&args.job)?;
    let job_id = job.job_id.clone();
    let config = match &args.config {
        Some(path) => ManagerConfig::load(path)?,
        None => ManagerConfig::load_or_default(&std::env::current_dir()?),
    };

    // Blocking manager calls stay on this thread; the runtime only drives
    // job opening.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let jobs = Arc::new(MemoryJobStore::new());
    jobs.put_job(job);
    let results = Arc::new(MemoryResultsStore::new());
    let factory = Arc::new(NativeProcessFactory::new(config.worker.clone()));
    let manager = AutodetectProcessManager::new(
        config,
        runtime.handle().clone(),
        jobs.clone(),
        jobs,
        results.clone(),
        factory,
        None,
    )?;

    let (tx, rx) = crossbeam_channel::bounded(1);
    manager.open_job(&job_id, move |result| {
        tx.send(result).ok();
    })?;
    rx.recv_timeout(OPEN_TIMEOUT)
        .context("Timed out waiting for the job to open")?
        .with_context(|| format!("Failed to open job {}", job_id))?;

    let streamed = stream_input(&manager, &job_id, &args);
    let closed = manager.close_job(&job_id);
    streamed?;
    closed.with_context(|| format!("Failed to close job {}", job_id))?;

    write_results(&results, &job_id, &args)
}

fn stream_input(manager: &AutodetectProcessManager, job_id: &str, args: &RunArgs) -> Result<()> {
    let input: Box<dyn BufRead> = match &args.input {
        Some(path) => Box::new(BufReader::new(
            File::open(path).with_context(|| format!("Failed to open {}", path.display()))?,
        )),
        None => Box::new(io::stdin().lock()),
    };

    let counts = manager.process_data(job_id, input, &DataLoadParams::default())?;
    tracing::info!(
        "[{}] processed {} of {} input records ({} out of order, {} invalid dates)",
        job_id,
        counts.processed_record_count,
        counts.input_record_count,
        counts.out_of_order_time_stamp_count,
        counts.invalid_date_count
    );

    if args.flush {
        let params = FlushJobParams {
            calc_interim: true,
            ..FlushJobParams::default()
        };
        let ack = manager.flush_job(job_id, &params)?;
        tracing::info!("[{}] flush [{}] acknowledged", job_id, ack.id);
    }
    Ok(())
}

fn write_results(results: &MemoryResultsStore, job_id: &str, args: &RunArgs) -> Result<()> {
    let mut out: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("Failed to create {}", path.display()))?,
        )),
        None => Box::new(io::stdout().lock()),
    };

    let operations = results.operations_for(job_id);
    for op in &operations {
        serde_json::to_writer(&mut out, op)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    tracing::info!("[{}] wrote {} persisted operations", job_id, operations.len());
    Ok(())
}
