// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use thiserror::Error;

use crate::job::JobStatus;

#[derive(Error, Debug)]
pub enum AutodetectError {
    #[error("max running job capacity [{max}] reached")]
    Capacity { max: usize },

    #[error("job [{job_id}] status is [{status}]: {message}")]
    InvalidState {
        job_id: String,
        status: JobStatus,
        message: String,
    },

    #[error("no active autodetect process for job [{0}]")]
    NotActive(String),

    #[error("unknown job [{0}]")]
    UnknownJob(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse autodetect output: {0}")]
    Parse(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("[{job_id}] autodetect process reported a fatal error: {message}")]
    ProcessFatal { job_id: String, message: String },

    #[error("Server error: {0}")]
    Server(String),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AutodetectError {
    /// Errors the caller can fix by changing the request or waiting for the
    /// job to reach another state. Everything else is a server-side failure.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Capacity { .. }
                | Self::InvalidState { .. }
                | Self::NotActive(_)
                | Self::UnknownJob(_)
                | Self::BadRequest(_)
        )
    }

    /// Wrap an underlying failure as an opaque server error that keeps the
    /// job id and the cause text.
    pub fn server(job_id: &str, message: &str, cause: impl std::fmt::Display) -> Self {
        Self::Server(format!("[{}] {}: {}", job_id, message, cause))
    }
}

pub type Result<T> = std::result::Result<T, AutodetectError>;
