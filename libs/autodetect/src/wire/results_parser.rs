// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Decodes the worker's output stream into [`AutodetectResult`]s.

use std::collections::VecDeque;
use std::io::Read;

use crate::error::{AutodetectError, Result};
use crate::results::AutodetectResult;

use super::length_encoded::LengthEncodedReader;

#[derive(Debug, Default, Clone, Copy)]
pub struct AutodetectResultsParser;

impl AutodetectResultsParser {
    pub fn new() -> Self {
        Self
    }

    /// Lazily parse `stream`. Each call starts a fresh iterator; an
    /// iterator cannot be restarted once it has been advanced.
    pub fn parse_results<R: Read>(&self, stream: R) -> ResultsIter<R> {
        ResultsIter {
            reader: LengthEncodedReader::new(stream),
            pending: VecDeque::new(),
            finished: false,
        }
    }
}

/// Forward-only iterator over worker results. Blocks on each `next()`
/// until a record is available. After the first error it yields nothing.
pub struct ResultsIter<R: Read> {
    reader: LengthEncodedReader<R>,
    pending: VecDeque<String>,
    finished: bool,
}

impl<R: Read> ResultsIter<R> {
    fn fail(&mut self, err: AutodetectError) -> Option<Result<AutodetectResult>> {
        self.finished = true;
        self.pending.clear();
        Some(Err(err))
    }
}

impl<R: Read> Iterator for ResultsIter<R> {
    type Item = Result<AutodetectResult>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.finished {
                return None;
            }

            if let Some(document) = self.pending.pop_front() {
                return match serde_json::from_str::<AutodetectResult>(&document) {
                    Ok(result) => Some(Ok(result)),
                    Err(e) => self.fail(AutodetectError::Parse(format!(
                        "invalid result document: {}",
                        e
                    ))),
                };
            }

            match self.reader.read_record() {
                Ok(Some(fields)) => self.pending.extend(fields),
                Ok(None) => {
                    self.finished = true;
                    return None;
                }
                Err(e) => {
                    return self.fail(AutodetectError::Parse(format!(
                        "malformed output framing: {}",
                        e
                    )));
                }
            }
        }
    }
}
