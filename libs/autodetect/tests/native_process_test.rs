// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Runs `sh` as the worker executable to exercise real process pipes,
//! the persist FIFO and temp-file cleanup.

#![cfg(unix)]

mod common;

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use autodetect::persistence::JobStore;
use autodetect::{
    AutodetectError, AutodetectProcessManager, DataLoadParams, JobStatus, ManagerConfig,
    MemoryJobStore, MemoryResultsStore, NativeProcessFactory, WorkerConfig,
};
use serial_test::serial;

struct NativeHarness {
    _runtime: tokio::runtime::Runtime,
    manager: AutodetectProcessManager,
    jobs: Arc<MemoryJobStore>,
}

fn native_harness(script: &str, temp_dir: &Path) -> NativeHarness {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let config = ManagerConfig {
        worker: WorkerConfig {
            executable: "sh".into(),
            args: vec!["-c".to_string(), script.to_string(), "autodetect".to_string()],
            temp_dir: Some(temp_dir.to_path_buf()),
            persist_pipe: true,
            ..WorkerConfig::default()
        },
        ..common::fast_config()
    };
    let jobs = Arc::new(MemoryJobStore::new());
    jobs.put_job(common::job("farequote"));
    let results = Arc::new(MemoryResultsStore::new());
    let factory = Arc::new(NativeProcessFactory::new(config.worker.clone()));
    let manager = AutodetectProcessManager::new(
        config,
        runtime.handle().clone(),
        jobs.clone(),
        jobs.clone(),
        results,
        factory,
        None,
    )
    .unwrap();

    NativeHarness {
        _runtime: runtime,
        manager,
        jobs,
    }
}

fn open(manager: &AutodetectProcessManager, job_id: &str) {
    let (tx, rx) = crossbeam_channel::bounded(1);
    manager
        .open_job(job_id, move |result| {
            tx.send(result).ok();
        })
        .unwrap();
    rx.recv_timeout(std::time::Duration::from_secs(10))
        .unwrap()
        .unwrap();
}

fn dir_entries(dir: &Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect()
}

#[test]
#[serial]
fn test_clean_exit_removes_temp_files() {
    let dir = tempfile::tempdir().unwrap();
    let h = native_harness("cat > /dev/null", dir.path());
    open(&h.manager, "farequote");

    // Field config file plus the persist FIFO.
    assert_eq!(dir_entries(dir.path()).len(), 2);

    let counts = h
        .manager
        .process_data(
            "farequote",
            Cursor::new(r#"{"time": 1000, "responsetime": 1.5, "airline": "AAL"}"#),
            &DataLoadParams::default(),
        )
        .unwrap();
    assert_eq!(counts.processed_record_count, 1);

    h.manager.close_job("farequote").unwrap();
    assert!(dir_entries(dir.path()).is_empty());
    assert_eq!(h.jobs.status("farequote").unwrap(), JobStatus::Closed);
}

#[test]
#[serial]
fn test_fatal_log_line_fails_close() {
    let dir = tempfile::tempdir().unwrap();
    let h = native_harness(
        "cat > /dev/null; echo 'FATAL could not restore model state' >&2; exit 1",
        dir.path(),
    );
    open(&h.manager, "farequote");

    let err = h.manager.close_job("farequote").unwrap_err();
    assert!(matches!(err, AutodetectError::ProcessFatal { .. }));
    assert!(err.to_string().contains("could not restore model state"));
    assert_eq!(h.jobs.status("farequote").unwrap(), JobStatus::Failed);
    assert!(dir_entries(dir.path()).is_empty());
}
