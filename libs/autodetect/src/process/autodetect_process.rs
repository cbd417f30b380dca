// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Handle to one running worker.

use std::io::{self, ErrorKind, Read, Write};
use std::path::PathBuf;
use std::process::Child;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use crossbeam_channel::{Receiver, RecvTimeoutError, bounded};
use parking_lot::Mutex;

use crate::error::{AutodetectError, Result};
use crate::wire::{ControlMsgWriter, DataLoadParams, FlushJobParams};

use super::log_handler::ProcessLogState;
use super::{PersistSource, ProcessPipes};

/// How long an OS process gets to exit after its log stream has ended.
const EXIT_GRACE: Duration = Duration::from_secs(10);

type InputWriter = ControlMsgWriter<Box<dyn Write + Send>>;

/// Called from the log thread when the worker's log stream ends without
/// the handle having been closed.
pub type CrashHandler = Box<dyn FnOnce() + Send + 'static>;

pub struct AutodetectProcess {
    job_id: String,
    writer: Mutex<Option<InputWriter>>,
    output: Mutex<Option<Box<dyn Read + Send>>>,
    persist: Mutex<Option<PersistSource>>,
    child: Mutex<Option<Child>>,
    fifo: Option<PathBuf>,
    files_to_delete: Vec<PathBuf>,
    log_state: Arc<ProcessLogState>,
    log_done: Receiver<()>,
    log_thread: Mutex<Option<JoinHandle<()>>>,
    closing: Arc<AtomicBool>,
    close_timeout: Duration,
    start_time: SystemTime,
    started: Instant,
}

impl AutodetectProcess {
    /// Take ownership of `pipes` and start tailing the log stream.
    pub fn start(
        job_id: &str,
        number_of_analysis_fields: usize,
        pipes: ProcessPipes,
        close_timeout: Duration,
        on_crash: CrashHandler,
    ) -> Result<Self> {
        let ProcessPipes {
            input,
            output,
            log,
            persist,
            child,
            files_to_delete,
        } = pipes;

        let fifo = match &persist {
            Some(PersistSource::Fifo(path)) => Some(path.clone()),
            _ => None,
        };

        let log_state = Arc::new(ProcessLogState::new());
        let closing = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = bounded(1);

        let log_thread = {
            let job_id = job_id.to_string();
            let log_state = log_state.clone();
            let closing = closing.clone();
            thread::Builder::new()
                .name(format!("autodetect-log-{}", job_id))
                .spawn(move || {
                    log_state.tail(&job_id, log);
                    done_tx.send(()).ok();
                    if !closing.load(Ordering::Acquire) {
                        tracing::error!("[{}] autodetect process exited unexpectedly", job_id);
                        on_crash();
                    }
                })?
        };

        if let Some(child) = &child {
            tracing::info!("[{}] autodetect process started with PID {}", job_id, child.id());
        }

        Ok(Self {
            job_id: job_id.to_string(),
            writer: Mutex::new(Some(ControlMsgWriter::new(input, number_of_analysis_fields))),
            output: Mutex::new(Some(output)),
            persist: Mutex::new(persist),
            child: Mutex::new(child),
            fifo,
            files_to_delete,
            log_state,
            log_done: done_rx,
            log_thread: Mutex::new(Some(log_thread)),
            closing,
            close_timeout,
            start_time: SystemTime::now(),
            started: Instant::now(),
        })
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn write_record(&self, record: &[String]) -> io::Result<()> {
        self.with_writer(|w| w.write_record(record))
    }

    pub fn write_reset_buckets_control_message(&self, params: &DataLoadParams) -> io::Result<()> {
        self.with_writer(|w| w.write_reset_buckets_message(params))
    }

    pub fn write_update_config_message(&self, config: &str) -> io::Result<()> {
        self.with_writer(|w| w.write_update_config_message(config))
    }

    /// Send a flush request and return the id the worker will acknowledge.
    pub fn flush_job(&self, params: &FlushJobParams) -> io::Result<String> {
        self.with_writer(|w| w.write_flush_control_message(params))
    }

    pub fn flush_stream(&self) -> io::Result<()> {
        self.with_writer(|w| w.flush())
    }

    /// The result stream. Can be taken once.
    pub fn take_output(&self) -> Option<Box<dyn Read + Send>> {
        self.output.lock().take()
    }

    /// The model state stream. Can be taken once.
    pub fn take_persist(&self) -> Option<PersistSource> {
        self.persist.lock().take()
    }

    /// True until the worker's log stream ends.
    pub fn is_process_alive(&self) -> bool {
        !self.log_state.is_finished()
    }

    pub fn process_start_time(&self) -> SystemTime {
        self.start_time
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Last error the worker logged, if any.
    pub fn read_error(&self) -> Option<String> {
        self.log_state.last_error()
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.lock().as_ref().map(Child::id)
    }

    /// Close the worker's input and wait for it to finish.
    ///
    /// Waiting is bounded by the close timeout; a timeout is logged, not
    /// returned. Registered files are deleted whatever happens. Fails only
    /// when the worker logged a fatal error. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        if self.closing.swap(true, Ordering::AcqRel) {
            tracing::debug!("[{}] autodetect process already closed", self.job_id);
            return Ok(());
        }

        if let Some(mut writer) = self.writer.lock().take() {
            if let Err(e) = writer.flush() {
                tracing::debug!("[{}] could not flush input before close: {}", self.job_id, e);
            }
        }

        self.await_log_end();
        self.reap_child();
        self.release_fifo();
        self.delete_associated_files();

        if self.log_state.seen_fatal_error() {
            let message = self
                .log_state
                .last_error()
                .unwrap_or_else(|| "unknown fatal error".to_string());
            return Err(AutodetectError::ProcessFatal {
                job_id: self.job_id.clone(),
                message,
            });
        }
        tracing::info!("[{}] autodetect process closed", self.job_id);
        Ok(())
    }

    fn with_writer<T>(&self, op: impl FnOnce(&mut InputWriter) -> io::Result<T>) -> io::Result<T> {
        let mut guard = self.writer.lock();
        match guard.as_mut() {
            Some(writer) => op(writer),
            None => Err(io::Error::new(
                ErrorKind::BrokenPipe,
                format!("[{}] autodetect process input is closed", self.job_id),
            )),
        }
    }

    fn await_log_end(&self) {
        match self.log_done.recv_timeout(self.close_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                let handle = self.log_thread.lock().take();
                if let Some(handle) = handle {
                    if handle.thread().id() == thread::current().id() {
                        return;
                    }
                    if handle.join().is_err() {
                        tracing::warn!("[{}] log thread panicked", self.job_id);
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    "[{}] timed out after {:?} waiting for the autodetect process to finish",
                    self.job_id,
                    self.close_timeout
                );
            }
        }
    }

    fn reap_child(&self) {
        let mut guard = self.child.lock();
        let Some(child) = guard.as_mut() else {
            return;
        };

        let start = Instant::now();
        while start.elapsed() < EXIT_GRACE {
            match child.try_wait() {
                Ok(Some(status)) => {
                    tracing::debug!("[{}] autodetect process exited with {}", self.job_id, status);
                    *guard = None;
                    return;
                }
                Ok(None) => thread::sleep(Duration::from_millis(10)),
                Err(e) => {
                    tracing::warn!("[{}] could not check process status: {}", self.job_id, e);
                    break;
                }
            }
        }

        tracing::warn!(
            "[{}] autodetect process did not exit within {:?}, killing",
            self.job_id,
            EXIT_GRACE
        );
        if let Err(e) = child.kill() {
            tracing::warn!("[{}] failed to kill autodetect process: {}", self.job_id, e);
        }
        if let Err(e) = child.wait() {
            tracing::warn!("[{}] failed to reap autodetect process: {}", self.job_id, e);
        }
        *guard = None;
    }

    /// A reader still blocked opening the persist FIFO only returns once a
    /// writer has opened it. Open and drop a writer so it sees end-of-stream.
    #[cfg(unix)]
    fn release_fifo(&self) {
        use std::fs::OpenOptions;
        use std::os::unix::fs::OpenOptionsExt;

        let Some(path) = &self.fifo else {
            return;
        };
        match OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
        {
            Ok(_) => tracing::trace!("[{}] released persist pipe reader", self.job_id),
            // ENXIO: no reader is waiting.
            Err(e) => tracing::trace!("[{}] persist pipe not released: {}", self.job_id, e),
        }
    }

    #[cfg(not(unix))]
    fn release_fifo(&self) {}

    fn delete_associated_files(&self) {
        for path in &self.files_to_delete {
            let removed = if path.is_dir() {
                std::fs::remove_dir_all(path)
            } else {
                std::fs::remove_file(path)
            };
            match removed {
                Ok(()) => tracing::debug!("[{}] deleted {}", self.job_id, path.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(
                    "[{}] failed to delete file {}: {}",
                    self.job_id,
                    path.display(),
                    e
                ),
            }
        }
    }
}

impl Drop for AutodetectProcess {
    fn drop(&mut self) {
        if let Some(child) = self.child.get_mut().as_mut() {
            if matches!(child.try_wait(), Ok(None)) {
                tracing::warn!(
                    "[{}] autodetect process handle dropped while still running, killing",
                    self.job_id
                );
                child.kill().ok();
                child.wait().ok();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{LengthEncodedReader, PipeReader, PipeWriter, memory_pipe};
    use std::sync::atomic::AtomicUsize;

    struct Worker {
        input: PipeReader,
        output: PipeWriter,
        log: PipeWriter,
    }

    fn start(on_crash: CrashHandler, files: Vec<PathBuf>) -> (AutodetectProcess, Worker) {
        let (input_w, input_r) = memory_pipe();
        let (output_w, output_r) = memory_pipe();
        let (log_w, log_r) = memory_pipe();
        let pipes = ProcessPipes {
            input: Box::new(input_w),
            output: Box::new(output_r),
            log: Box::new(log_r),
            persist: None,
            child: None,
            files_to_delete: files,
        };
        let process =
            AutodetectProcess::start("j", 2, pipes, Duration::from_secs(5), on_crash).unwrap();
        (
            process,
            Worker {
                input: input_r,
                output: output_w,
                log: log_w,
            },
        )
    }

    fn no_crash() -> CrashHandler {
        Box::new(|| panic!("unexpected crash callback"))
    }

    #[test]
    fn test_writes_reach_worker_in_order() {
        let (process, worker) = start(no_crash(), Vec::new());
        process
            .write_record(&["1".to_string(), "a".to_string(), String::new()])
            .unwrap();
        let id = process.flush_job(&FlushJobParams::default()).unwrap();
        assert_eq!(id, "1");
        assert!(process.take_output().is_some());
        assert!(process.take_output().is_none());

        let Worker { input, output, log } = worker;
        let closer = thread::spawn(move || {
            let records: Vec<_> = LengthEncodedReader::new(input).map(|r| r.unwrap()).collect();
            drop(output);
            drop(log);
            records
        });

        process.close().unwrap();
        let records = closer.join().unwrap();
        assert_eq!(records[0], vec!["1", "a", ""]);
        assert_eq!(records[1], vec!["", "", "f1"]);
        assert!(!process.is_process_alive());
    }

    #[test]
    fn test_fatal_error_surfaces_at_close_and_files_are_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("fieldconfig.json");
        std::fs::write(&file, "{}").unwrap();
        let missing = dir.path().join("never-created");

        let (process, worker) = start(no_crash(), vec![file.clone(), missing]);
        let Worker { input, output, mut log } = worker;
        log.write_all(b"FATAL model state is corrupt\n").unwrap();

        let closer = thread::spawn(move || {
            let mut sink = Vec::new();
            let mut input = input;
            input.read_to_end(&mut sink).ok();
            drop(output);
            drop(log);
        });

        let err = process.close().unwrap_err();
        closer.join().unwrap();
        match err {
            AutodetectError::ProcessFatal { job_id, message } => {
                assert_eq!(job_id, "j");
                assert_eq!(message, "model state is corrupt");
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(!file.exists());
        assert_eq!(process.read_error().as_deref(), Some("model state is corrupt"));
    }

    #[test]
    fn test_writes_after_close_fail_and_close_is_idempotent() {
        let (process, worker) = start(Box::new(|| {}), Vec::new());
        drop(worker);
        process.close().unwrap();
        process.close().unwrap();

        let err = process
            .write_record(&["1".to_string(), String::new(), String::new()])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BrokenPipe);
        assert!(process.flush_job(&FlushJobParams::default()).is_err());
    }

    #[test]
    fn test_log_end_without_close_reports_crash() {
        let crashes = Arc::new(AtomicUsize::new(0));
        let counter = crashes.clone();
        let (tx, rx) = bounded(1);
        let (process, worker) = start(
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                tx.send(()).ok();
            }),
            Vec::new(),
        );

        drop(worker);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(crashes.load(Ordering::SeqCst), 1);
        assert!(!process.is_process_alive());
        process.close().unwrap();
    }

    #[test]
    fn test_close_times_out_but_still_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("quantiles");
        std::fs::write(&file, "q").unwrap();

        let (input_w, _input_r) = memory_pipe();
        let (_output_w, output_r) = memory_pipe();
        let (log_w, log_r) = memory_pipe();
        let pipes = ProcessPipes {
            input: Box::new(input_w),
            output: Box::new(output_r),
            log: Box::new(log_r),
            persist: None,
            child: None,
            files_to_delete: vec![file.clone()],
        };
        let process = AutodetectProcess::start(
            "j",
            1,
            pipes,
            Duration::from_millis(50),
            Box::new(|| {}),
        )
        .unwrap();

        let start = Instant::now();
        process.close().unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(!file.exists());
        assert!(process.is_process_alive());
        drop(log_w);
    }
}
