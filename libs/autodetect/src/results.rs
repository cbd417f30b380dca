// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Typed results emitted by the worker process.
//!
//! Each output document decodes into exactly one [`AutodetectResult`]
//! variant. On the wire the variant is the single key of a JSON object,
//! e.g. `{"bucket": {...}}` or `{"flush": {"id": "3"}}`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A completed (or interim) time-bucket summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub job_id: String,
    /// Bucket start, epoch milliseconds.
    pub timestamp: i64,
    pub bucket_span: u64,
    #[serde(default)]
    pub anomaly_score: f64,
    #[serde(default)]
    pub max_normalized_probability: f64,
    #[serde(default)]
    pub record_count: u64,
    #[serde(default)]
    pub event_count: u64,
    #[serde(default)]
    pub is_interim: bool,
    #[serde(default)]
    pub processing_time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub job_id: String,
    pub timestamp: i64,
    pub probability: f64,
    #[serde(default)]
    pub normalized_probability: f64,
    #[serde(default)]
    pub function: Option<String>,
    #[serde(default)]
    pub field_name: Option<String>,
    #[serde(default)]
    pub by_field_name: Option<String>,
    #[serde(default)]
    pub by_field_value: Option<String>,
    #[serde(default)]
    pub partition_field_name: Option<String>,
    #[serde(default)]
    pub partition_field_value: Option<String>,
    #[serde(default)]
    pub actual: Vec<f64>,
    #[serde(default)]
    pub typical: Vec<f64>,
    #[serde(default)]
    pub is_interim: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Influencer {
    pub job_id: String,
    pub timestamp: i64,
    pub influencer_field_name: String,
    pub influencer_field_value: String,
    pub probability: f64,
    #[serde(default)]
    pub influencer_score: f64,
    #[serde(default)]
    pub is_interim: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryDefinition {
    pub job_id: String,
    pub category_id: u64,
    #[serde(default)]
    pub terms: String,
    #[serde(default)]
    pub regex: String,
    #[serde(default)]
    pub max_matching_length: u64,
    #[serde(default)]
    pub examples: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDebugOutput {
    pub job_id: String,
    pub timestamp: i64,
    #[serde(default)]
    pub partition_field_name: Option<String>,
    #[serde(default)]
    pub partition_field_value: Option<String>,
    #[serde(default)]
    pub over_field_name: Option<String>,
    #[serde(default)]
    pub over_field_value: Option<String>,
    #[serde(default)]
    pub by_field_name: Option<String>,
    #[serde(default)]
    pub by_field_value: Option<String>,
    #[serde(default)]
    pub debug_feature: Option<String>,
    #[serde(default)]
    pub debug_lower: f64,
    #[serde(default)]
    pub debug_upper: f64,
    #[serde(default)]
    pub debug_median: f64,
    #[serde(default)]
    pub actual: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryStatus {
    #[default]
    Ok,
    SoftLimit,
    HardLimit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSizeStats {
    pub job_id: String,
    #[serde(default)]
    pub model_bytes: u64,
    #[serde(default)]
    pub total_by_field_count: u64,
    #[serde(default)]
    pub total_over_field_count: u64,
    #[serde(default)]
    pub total_partition_field_count: u64,
    #[serde(default)]
    pub bucket_allocation_failures_count: u64,
    #[serde(default)]
    pub memory_status: MemoryStatus,
    #[serde(default)]
    pub log_time: Option<i64>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

impl ModelSizeStats {
    /// Empty stats used until the worker reports its own.
    pub fn new(job_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            model_bytes: 0,
            total_by_field_count: 0,
            total_over_field_count: 0,
            total_partition_field_count: 0,
            bucket_allocation_failures_count: 0,
            memory_status: MemoryStatus::Ok,
            log_time: None,
            timestamp: None,
        }
    }
}

/// Reference to a persisted copy of the worker's model state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub job_id: String,
    pub snapshot_id: String,
    pub timestamp: i64,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub snapshot_doc_count: u64,
    #[serde(default)]
    pub latest_record_time_stamp: Option<i64>,
    #[serde(default)]
    pub latest_result_time_stamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quantiles {
    pub job_id: String,
    pub timestamp: i64,
    pub quantile_state: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushAcknowledgement {
    pub id: String,
}

/// One decoded unit of worker output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutodetectResult {
    Bucket(Bucket),
    Records(Vec<AnomalyRecord>),
    Influencers(Vec<Influencer>),
    CategoryDefinition(CategoryDefinition),
    ModelDebugOutput(ModelDebugOutput),
    ModelSizeStats(ModelSizeStats),
    ModelSnapshot(ModelSnapshot),
    Quantiles(Quantiles),
    #[serde(rename = "flush")]
    FlushAcknowledgement(FlushAcknowledgement),
}

impl AutodetectResult {
    pub fn kind(&self) -> &'static str {
        match self {
            AutodetectResult::Bucket(_) => "bucket",
            AutodetectResult::Records(_) => "records",
            AutodetectResult::Influencers(_) => "influencers",
            AutodetectResult::CategoryDefinition(_) => "category_definition",
            AutodetectResult::ModelDebugOutput(_) => "model_debug_output",
            AutodetectResult::ModelSizeStats(_) => "model_size_stats",
            AutodetectResult::ModelSnapshot(_) => "model_snapshot",
            AutodetectResult::Quantiles(_) => "quantiles",
            AutodetectResult::FlushAcknowledgement(_) => "flush",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionProbability {
    pub partition_value: String,
    pub max_record_probability: f64,
}

/// Highest record probability seen per partition value within one batch of
/// records, persisted for jobs that normalize per partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerPartitionMaxProbabilities {
    pub job_id: String,
    pub timestamp: i64,
    pub partition_field_name: Option<String>,
    pub per_partition_max_probabilities: Vec<PartitionProbability>,
}

impl PerPartitionMaxProbabilities {
    /// Summarise a non-empty batch of records. Records without a partition
    /// value are grouped under the empty string.
    pub fn from_records(records: &[AnomalyRecord]) -> Option<Self> {
        let first = records.first()?;
        let mut max_by_partition: BTreeMap<&str, f64> = BTreeMap::new();
        for record in records {
            let value = record.partition_field_value.as_deref().unwrap_or("");
            let entry = max_by_partition.entry(value).or_insert(record.probability);
            if record.probability > *entry {
                *entry = record.probability;
            }
        }

        Some(Self {
            job_id: first.job_id.clone(),
            timestamp: first.timestamp,
            partition_field_name: first.partition_field_name.clone(),
            per_partition_max_probabilities: max_by_partition
                .into_iter()
                .map(|(value, probability)| PartitionProbability {
                    partition_value: value.to_string(),
                    max_record_probability: probability,
                })
                .collect(),
        })
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn bucket(job_id: &str, timestamp: i64) -> Bucket {
        Bucket {
            job_id: job_id.to_string(),
            timestamp,
            bucket_span: 300,
            anomaly_score: 0.0,
            max_normalized_probability: 0.0,
            record_count: 0,
            event_count: 10,
            is_interim: false,
            processing_time_ms: 1,
        }
    }

    pub fn record(job_id: &str, timestamp: i64, partition: Option<&str>, probability: f64) -> AnomalyRecord {
        AnomalyRecord {
            job_id: job_id.to_string(),
            timestamp,
            probability,
            normalized_probability: 0.0,
            function: Some("mean".to_string()),
            field_name: Some("responsetime".to_string()),
            by_field_name: None,
            by_field_value: None,
            partition_field_name: partition.map(|_| "airline".to_string()),
            partition_field_value: partition.map(str::to_string),
            actual: vec![1.0],
            typical: vec![0.5],
            is_interim: false,
        }
    }
}
