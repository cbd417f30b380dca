// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Tails the worker's diagnostic stream.
//!
//! Lines are either JSON objects (`{"level": "ERROR", "message": "..."}`)
//! or plain text optionally starting with a level word. Every line is
//! re-emitted through `tracing`. The last ERROR or FATAL message is kept,
//! and a FATAL line marks the run as failed.

use std::io::{BufRead, BufReader, Read};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn parse(word: &str) -> Option<Self> {
        let word = word.trim_end_matches(':');
        match word.to_ascii_uppercase().as_str() {
            "TRACE" => Some(LogLevel::Trace),
            "DEBUG" => Some(LogLevel::Debug),
            "INFO" => Some(LogLevel::Info),
            "WARN" | "WARNING" => Some(LogLevel::Warn),
            "ERROR" => Some(LogLevel::Error),
            "FATAL" => Some(LogLevel::Fatal),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
struct JsonLogLine {
    level: String,
    message: String,
}

/// Split a log line into its level and message.
pub fn classify(line: &str) -> (LogLevel, String) {
    let trimmed = line.trim();
    if trimmed.starts_with('{') {
        if let Ok(parsed) = serde_json::from_str::<JsonLogLine>(trimmed) {
            let level = LogLevel::parse(&parsed.level).unwrap_or(LogLevel::Info);
            return (level, parsed.message);
        }
    }

    let mut parts = trimmed.splitn(2, char::is_whitespace);
    if let Some(level) = parts.next().and_then(LogLevel::parse) {
        let message = parts.next().unwrap_or("").trim_start().to_string();
        return (level, message);
    }
    (LogLevel::Info, trimmed.to_string())
}

/// What the tailer has learned about the worker so far.
#[derive(Default)]
pub struct ProcessLogState {
    fatal: AtomicBool,
    finished: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl ProcessLogState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seen_fatal_error(&self) -> bool {
        self.fatal.load(Ordering::Acquire)
    }

    /// Whether the log stream has ended.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    fn record(&self, job_id: &str, level: LogLevel, message: &str) {
        match level {
            LogLevel::Fatal => {
                tracing::error!("[{}] worker fatal: {}", job_id, message);
                *self.last_error.lock() = Some(message.to_string());
                self.fatal.store(true, Ordering::Release);
            }
            LogLevel::Error => {
                tracing::error!("[{}] worker: {}", job_id, message);
                *self.last_error.lock() = Some(message.to_string());
            }
            LogLevel::Warn => tracing::warn!("[{}] worker: {}", job_id, message),
            LogLevel::Info => tracing::info!("[{}] worker: {}", job_id, message),
            LogLevel::Debug => tracing::debug!("[{}] worker: {}", job_id, message),
            LogLevel::Trace => tracing::trace!("[{}] worker: {}", job_id, message),
        }
    }

    /// Read `stream` until it ends, then mark the state finished. A read
    /// error ends tailing the same way end-of-stream does.
    pub fn tail<R: Read>(&self, job_id: &str, stream: R) {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    if line.trim().is_empty() {
                        continue;
                    }
                    let (level, message) = classify(&line);
                    self.record(job_id, level, &message);
                }
                Err(e) => {
                    tracing::warn!("[{}] error reading worker log stream: {}", job_id, e);
                    break;
                }
            }
        }
        self.finished.store(true, Ordering::Release);
        tracing::debug!("[{}] worker log stream ended", job_id);
    }
}
