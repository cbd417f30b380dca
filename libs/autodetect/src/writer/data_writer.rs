// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::io::{self, BufRead};

use serde_json::{Map, Value};

use crate::error::{AutodetectError, Result};
use crate::job::{Job, TimeFormat};
use crate::wire::CONTROL_FIELD_NAME;

use super::DataCounts;

/// Projects newline-delimited JSON documents onto the job's analysis
/// fields. The time field is always written first, as epoch seconds, and
/// the trailing control field is left empty.
pub struct DataToProcessWriter {
    job_id: String,
    fields: Vec<String>,
    time_format: TimeFormat,
    latency_ms: i64,
    totals: DataCounts,
}

impl DataToProcessWriter {
    pub fn new(job: &Job, counts: DataCounts) -> Self {
        let latency_ms = i64::try_from(job.analysis_config.latency_secs)
            .unwrap_or(i64::MAX / 1000)
            .saturating_mul(1000);
        Self {
            job_id: job.job_id.clone(),
            fields: job.analysis_fields(),
            time_format: job.data_description.time_format,
            latency_ms,
            totals: counts,
        }
    }

    /// Number of analysis fields per record, time field included.
    pub fn number_of_analysis_fields(&self) -> usize {
        self.fields.len()
    }

    /// The header record: field names followed by the control field name.
    pub fn header(&self) -> Vec<String> {
        let mut header = self.fields.clone();
        header.push(CONTROL_FIELD_NAME.to_string());
        header
    }

    pub fn data_counts(&self) -> &DataCounts {
        &self.totals
    }

    /// Read every document from `input` and hand the projected records to
    /// `sink`. Returns the counts for this call only; the running totals
    /// are available from [`data_counts`](Self::data_counts).
    ///
    /// Records handed to `sink` before an error are still added to the
    /// running totals.
    pub fn write<R, F>(&mut self, input: R, mut sink: F) -> Result<DataCounts>
    where
        R: BufRead,
        F: FnMut(&[String]) -> io::Result<()>,
    {
        let mut counts = DataCounts::default();
        let written = self.write_records(input, &mut sink, &mut counts);
        self.accumulate(&counts);

        match &written {
            Ok(()) => tracing::debug!(
                "[{}] wrote {} of {} input records",
                self.job_id,
                counts.processed_record_count,
                counts.input_record_count
            ),
            Err(e) => tracing::warn!(
                "[{}] upload stopped after writing {} records: {}",
                self.job_id,
                counts.processed_record_count,
                e
            ),
        }
        written.map(|()| counts)
    }

    fn write_records<R, F>(&self, input: R, sink: &mut F, counts: &mut DataCounts) -> Result<()>
    where
        R: BufRead,
        F: FnMut(&[String]) -> io::Result<()>,
    {
        for (line_number, line) in input.lines().enumerate() {
            let line = line?;
            counts.input_bytes += line.len() as u64 + 1;
            if line.trim().is_empty() {
                continue;
            }

            let document: Map<String, Value> = serde_json::from_str(&line).map_err(|e| {
                AutodetectError::BadRequest(format!(
                    "[{}] failed to parse input document on line {}: {}",
                    self.job_id,
                    line_number + 1,
                    e
                ))
            })?;
            counts.input_record_count += 1;
            counts.input_field_count += document.len() as u64;

            let Some(timestamp_ms) = self.parse_time(&document) else {
                counts.invalid_date_count += 1;
                tracing::trace!(
                    "[{}] dropping record on line {} with invalid time",
                    self.job_id,
                    line_number + 1
                );
                continue;
            };

            let latest = self.totals.latest_record_timestamp.max(counts.latest_record_timestamp);
            if let Some(latest) = latest {
                if timestamp_ms < latest.saturating_sub(self.latency_ms) {
                    counts.out_of_order_time_stamp_count += 1;
                    continue;
                }
            }

            let mut record = Vec::with_capacity(self.fields.len() + 1);
            record.push((timestamp_ms / 1000).to_string());
            let mut present = 0;
            for field in &self.fields[1..] {
                match document.get(field).and_then(value_to_field) {
                    Some(value) => {
                        present += 1;
                        record.push(value);
                    }
                    None => record.push(String::new()),
                }
            }
            record.push(String::new());

            sink(record.as_slice())?;
            counts.processed_record_count += 1;
            counts.processed_field_count += present;
            counts.missing_field_count += (self.fields.len() - 1) as u64 - present;
            counts.latest_record_timestamp = Some(
                counts
                    .latest_record_timestamp
                    .map_or(timestamp_ms, |t| t.max(timestamp_ms)),
            );
        }
        Ok(())
    }

    fn parse_time(&self, document: &Map<String, Value>) -> Option<i64> {
        let raw = match document.get(&self.fields[0])? {
            Value::Number(n) => n.as_f64()?,
            Value::String(s) => s.trim().parse::<f64>().ok()?,
            _ => return None,
        };
        if !raw.is_finite() || raw < 0.0 {
            return None;
        }
        let millis = match self.time_format {
            TimeFormat::Epoch => raw * 1000.0,
            TimeFormat::EpochMs => raw,
        };
        if millis > i64::MAX as f64 {
            return None;
        }
        Some(millis as i64)
    }

    fn accumulate(&mut self, counts: &DataCounts) {
        let totals = &mut self.totals;
        totals.processed_record_count += counts.processed_record_count;
        totals.processed_field_count += counts.processed_field_count;
        totals.input_bytes += counts.input_bytes;
        totals.input_field_count += counts.input_field_count;
        totals.input_record_count += counts.input_record_count;
        totals.invalid_date_count += counts.invalid_date_count;
        totals.missing_field_count += counts.missing_field_count;
        totals.out_of_order_time_stamp_count += counts.out_of_order_time_stamp_count;
        totals.latest_record_timestamp = totals
            .latest_record_timestamp
            .max(counts.latest_record_timestamp);
    }
}

fn value_to_field(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::test_job;

    fn run(writer: &mut DataToProcessWriter, input: &str) -> (DataCounts, Vec<Vec<String>>) {
        let mut records = Vec::new();
        let counts = writer
            .write(input.as_bytes(), |r| {
                records.push(r.to_vec());
                Ok(())
            })
            .unwrap();
        (counts, records)
    }

    #[test]
    fn test_projects_documents_onto_analysis_fields() {
        let mut writer = DataToProcessWriter::new(&test_job("j"), DataCounts::default());
        assert_eq!(writer.header(), vec!["time", "responsetime", "airline", "."]);

        let input = r#"{"time": 1403481600, "airline": "AAL", "responsetime": 132.2, "extra": 1}

{"time": "1403481700", "airline": "JZA"}
"#;
        let (counts, records) = run(&mut writer, input);

        assert_eq!(
            records,
            vec![
                vec!["1403481600", "132.2", "AAL", ""],
                vec!["1403481700", "", "JZA", ""],
            ]
        );
        assert_eq!(counts.input_record_count, 2);
        assert_eq!(counts.processed_record_count, 2);
        assert_eq!(counts.input_field_count, 6);
        assert_eq!(counts.processed_field_count, 3);
        assert_eq!(counts.missing_field_count, 1);
        assert_eq!(counts.latest_record_timestamp, Some(1_403_481_700_000));
        assert_eq!(counts.input_bytes, input.len() as u64);
    }

    #[test]
    fn test_invalid_and_out_of_order_times_are_dropped() {
        let mut job = test_job("j");
        job.analysis_config.latency_secs = 10;
        let mut writer = DataToProcessWriter::new(&job, DataCounts::default());

        let input = r#"{"time": 1000, "airline": "A"}
{"time": "yesterday", "airline": "B"}
{"airline": "C"}
{"time": 995, "airline": "D"}
{"time": 980, "airline": "E"}
"#;
        let (counts, records) = run(&mut writer, input);

        let airlines: Vec<_> = records.iter().map(|r| r[2].as_str()).collect();
        assert_eq!(airlines, vec!["A", "D"]);
        assert_eq!(counts.invalid_date_count, 2);
        assert_eq!(counts.out_of_order_time_stamp_count, 1);
    }

    #[test]
    fn test_epoch_ms_and_running_totals() {
        let mut job = test_job("j");
        job.data_description.time_format = TimeFormat::EpochMs;
        let previous = DataCounts {
            processed_record_count: 5,
            latest_record_timestamp: Some(1_000_000),
            ..DataCounts::default()
        };
        let mut writer = DataToProcessWriter::new(&job, previous);

        let (counts, records) = run(&mut writer, "{\"time\": 2000500, \"airline\": \"A\"}\n");
        assert_eq!(records[0][0], "2000");
        assert_eq!(counts.processed_record_count, 1);

        let (counts, _) = run(&mut writer, "{\"time\": 999999, \"airline\": \"A\"}\n");
        assert_eq!(counts.out_of_order_time_stamp_count, 1);

        let totals = writer.data_counts();
        assert_eq!(totals.processed_record_count, 6);
        assert_eq!(totals.out_of_order_time_stamp_count, 1);
        assert_eq!(totals.latest_record_timestamp, Some(2_000_500));
    }

    #[test]
    fn test_malformed_document_is_a_bad_request() {
        let mut writer = DataToProcessWriter::new(&test_job("j"), DataCounts::default());
        let err = writer
            .write("[1, 2]\n".as_bytes(), |_| Ok(()))
            .unwrap_err();
        assert!(matches!(err, AutodetectError::BadRequest(_)));
    }

    #[test]
    fn test_sink_errors_propagate() {
        let mut writer = DataToProcessWriter::new(&test_job("j"), DataCounts::default());
        let err = writer
            .write("{\"time\": 1}\n".as_bytes(), |_| {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
            })
            .unwrap_err();
        assert!(matches!(err, AutodetectError::Io(_)));
        assert_eq!(writer.data_counts().processed_record_count, 0);
        assert_eq!(writer.data_counts().input_record_count, 1);
    }

    #[test]
    fn test_records_before_a_failure_are_counted() {
        let mut writer = DataToProcessWriter::new(&test_job("j"), DataCounts::default());
        let mut sent = Vec::new();
        let err = writer
            .write(
                "{\"time\": 1000, \"airline\": \"A\"}\n[bad]\n{\"time\": 2000}\n".as_bytes(),
                |r| {
                    sent.push(r.to_vec());
                    Ok(())
                },
            )
            .unwrap_err();
        assert!(matches!(err, AutodetectError::BadRequest(_)));
        assert_eq!(sent.len(), 1);

        let totals = writer.data_counts().clone();
        assert_eq!(totals.processed_record_count, 1);
        assert_eq!(totals.latest_record_timestamp, Some(1_000_000));

        // The next upload is checked against the record already sent.
        let (counts, records) = run(&mut writer, "{\"time\": 900, \"airline\": \"B\"}\n");
        assert!(records.is_empty());
        assert_eq!(counts.out_of_order_time_stamp_count, 1);
    }

    #[test]
    fn test_sink_failure_midway_keeps_earlier_records() {
        let mut writer = DataToProcessWriter::new(&test_job("j"), DataCounts::default());
        let mut calls = 0;
        let err = writer
            .write(
                "{\"time\": 1000}\n{\"time\": 1060}\n{\"time\": 1120}\n".as_bytes(),
                |_| {
                    calls += 1;
                    if calls == 3 {
                        return Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"));
                    }
                    Ok(())
                },
            )
            .unwrap_err();
        assert!(matches!(err, AutodetectError::Io(_)));

        let totals = writer.data_counts();
        assert_eq!(totals.processed_record_count, 2);
        assert_eq!(totals.input_record_count, 3);
        assert_eq!(totals.latest_record_timestamp, Some(1_060_000));
    }
}
