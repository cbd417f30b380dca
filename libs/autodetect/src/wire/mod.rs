// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Wire protocol between the manager and a worker process.

pub mod control_msg;
pub mod length_encoded;
pub mod pipe;
pub mod results_parser;

pub use control_msg::{CONTROL_FIELD_NAME, ControlMsgWriter, DataLoadParams, FlushJobParams};
pub use length_encoded::{LengthEncodedReader, LengthEncodedWriter};
pub use pipe::{PipeReader, PipeWriter, memory_pipe};
pub use results_parser::{AutodetectResultsParser, ResultsIter};
