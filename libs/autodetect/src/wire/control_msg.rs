// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Control messages sent to the worker on the data stream.
//!
//! Control messages share the record layout of data records: one field per
//! analysis field followed by the control field. Data records leave the
//! control field empty; control messages leave every analysis field empty
//! and put a one-letter code plus payload in the control field.

use std::io::{self, Write};

use crate::error::{AutodetectError, Result};

use super::length_encoded::LengthEncodedWriter;

/// Header name of the trailing control field.
pub const CONTROL_FIELD_NAME: &str = ".";

const FLUSH_MESSAGE_CODE: &str = "f";
const INTERIM_MESSAGE_CODE: &str = "i";
const ADVANCE_TIME_MESSAGE_CODE: &str = "t";
const SKIP_TIME_MESSAGE_CODE: &str = "s";
const RESET_BUCKETS_MESSAGE_CODE: &str = "r";
const UPDATE_MESSAGE_CODE: &str = "u";

/// The worker reads its input in blocks; a flush is followed by this much
/// padding so the flush message itself is not held back in a partial block.
pub const FLUSH_SPACES_LENGTH: usize = 8192;

/// Parameters of a flush request. Times are epoch seconds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushJobParams {
    pub calc_interim: bool,
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub advance_time: Option<i64>,
    pub skip_time: Option<i64>,
}

impl FlushJobParams {
    pub fn interim() -> Self {
        Self {
            calc_interim: true,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.calc_interim && (self.start.is_some() || self.end.is_some()) {
            return Err(AutodetectError::BadRequest(
                "Invalid flush parameters: unexpected 'start' or 'end' without 'calc_interim'"
                    .to_string(),
            ));
        }
        if self.end.is_some() && self.start.is_none() {
            return Err(AutodetectError::BadRequest(
                "Invalid flush parameters: 'start' has not been specified".to_string(),
            ));
        }
        if let (Some(start), Some(end)) = (self.start, self.end) {
            if end < start {
                return Err(AutodetectError::BadRequest(format!(
                    "Invalid flush parameters: 'end' [{}] must be after 'start' [{}]",
                    end, start
                )));
            }
        }
        for (name, value) in [
            ("start", self.start),
            ("end", self.end),
            ("advance_time", self.advance_time),
            ("skip_time", self.skip_time),
        ] {
            if matches!(value, Some(v) if v < 0) {
                return Err(AutodetectError::BadRequest(format!(
                    "Invalid flush parameters: '{}' must be a non-negative epoch",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// Parameters attached to a data upload. A reset range asks the worker to
/// forget the buckets it covers before the new data is applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataLoadParams {
    pub reset_start: Option<i64>,
    pub reset_end: Option<i64>,
}

impl DataLoadParams {
    pub fn is_resetting_buckets(&self) -> bool {
        self.reset_start.is_some()
    }
}

/// Writes data records and control messages on the worker's input stream.
pub struct ControlMsgWriter<W: Write> {
    writer: LengthEncodedWriter<W>,
    number_of_analysis_fields: usize,
    flush_number: u64,
}

impl<W: Write> ControlMsgWriter<W> {
    pub fn new(stream: W, number_of_analysis_fields: usize) -> Self {
        Self {
            writer: LengthEncodedWriter::new(stream),
            number_of_analysis_fields,
            flush_number: 0,
        }
    }

    pub fn number_of_analysis_fields(&self) -> usize {
        self.number_of_analysis_fields
    }

    /// Write a data (or header) record. It must carry one field per
    /// analysis field plus the control field.
    pub fn write_record<S: AsRef<str>>(&mut self, fields: &[S]) -> io::Result<()> {
        if fields.len() != self.number_of_analysis_fields + 1 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "record has {} fields, expected {}",
                    fields.len(),
                    self.number_of_analysis_fields + 1
                ),
            ));
        }
        self.writer.write_record(fields)
    }

    /// Send the control messages a flush request asks for, then the flush
    /// itself. Returns the id the worker will acknowledge.
    pub fn write_flush_control_message(&mut self, params: &FlushJobParams) -> io::Result<String> {
        if let Some(skip_time) = params.skip_time {
            self.write_message(&format!("{}{}", SKIP_TIME_MESSAGE_CODE, skip_time))?;
        }
        if let Some(advance_time) = params.advance_time {
            self.write_message(&format!("{}{}", ADVANCE_TIME_MESSAGE_CODE, advance_time))?;
        }
        if params.calc_interim {
            self.write_calc_interim_message(params)?;
        }
        self.write_flush_message()
    }

    pub fn write_calc_interim_message(&mut self, params: &FlushJobParams) -> io::Result<()> {
        let mut message = INTERIM_MESSAGE_CODE.to_string();
        if let Some(start) = params.start {
            message.push_str(&start.to_string());
            message.push(' ');
            if let Some(end) = params.end {
                message.push_str(&end.to_string());
            }
        }
        self.write_message(&message)
    }

    /// Write a flush message followed by padding, and push everything to
    /// the stream.
    pub fn write_flush_message(&mut self) -> io::Result<String> {
        self.flush_number += 1;
        let flush_id = self.flush_number.to_string();
        self.write_message(&format!("{}{}", FLUSH_MESSAGE_CODE, flush_id))?;
        self.write_message(&" ".repeat(FLUSH_SPACES_LENGTH))?;
        self.writer.flush()?;
        Ok(flush_id)
    }

    pub fn write_reset_buckets_message(&mut self, params: &DataLoadParams) -> io::Result<()> {
        let Some(start) = params.reset_start else {
            return Ok(());
        };
        let end = params.reset_end.unwrap_or(start);
        self.write_message(&format!("{}{} {}", RESET_BUCKETS_MESSAGE_CODE, start, end))
    }

    pub fn write_update_config_message(&mut self, config: &str) -> io::Result<()> {
        self.write_message(&format!("{}{}", UPDATE_MESSAGE_CODE, config))
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }

    fn write_message(&mut self, message: &str) -> io::Result<()> {
        let mut record = vec![""; self.number_of_analysis_fields + 1];
        record[self.number_of_analysis_fields] = message;
        self.writer.write_record(&record)
    }
}
