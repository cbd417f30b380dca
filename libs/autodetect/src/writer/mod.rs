// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Turns caller input into worker records.

pub mod data_writer;

use serde::{Deserialize, Serialize};

pub use data_writer::DataToProcessWriter;

/// Running totals describing the data sent to a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataCounts {
    pub processed_record_count: u64,
    pub processed_field_count: u64,
    pub input_bytes: u64,
    pub input_field_count: u64,
    pub input_record_count: u64,
    pub invalid_date_count: u64,
    pub missing_field_count: u64,
    pub out_of_order_time_stamp_count: u64,
    /// Epoch milliseconds of the newest record written.
    pub latest_record_timestamp: Option<i64>,
}
