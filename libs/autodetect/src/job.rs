// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Job definitions as read from the job configuration store.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{AutodetectError, Result};

/// Lifecycle status of a job as recorded in the job configuration store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Closed,
    Opening,
    Opened,
    Closing,
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Closed => "closed",
            JobStatus::Opening => "opening",
            JobStatus::Opened => "opened",
            JobStatus::Closing => "closing",
            JobStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// How the time field of input documents is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeFormat {
    #[default]
    Epoch,
    EpochMs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataDescription {
    #[serde(default = "DataDescription::default_time_field")]
    pub time_field: String,
    #[serde(default)]
    pub time_format: TimeFormat,
}

impl DataDescription {
    fn default_time_field() -> String {
        "time".to_string()
    }
}

impl Default for DataDescription {
    fn default() -> Self {
        Self {
            time_field: Self::default_time_field(),
            time_format: TimeFormat::Epoch,
        }
    }
}

/// A condition inside a detection rule. `value_filter` names a list
/// document that must be fetched before the worker starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleCondition {
    #[serde(default)]
    pub field_name: Option<String>,
    #[serde(default)]
    pub value_filter: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DetectionRule {
    #[serde(default)]
    pub conditions: Vec<RuleCondition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detector {
    pub function: String,
    #[serde(default)]
    pub field_name: Option<String>,
    #[serde(default)]
    pub by_field_name: Option<String>,
    #[serde(default)]
    pub over_field_name: Option<String>,
    #[serde(default)]
    pub partition_field_name: Option<String>,
    #[serde(default)]
    pub rules: Vec<DetectionRule>,
}

impl Detector {
    /// Input fields this detector reads, in declaration order.
    pub fn extract_analysis_fields(&self) -> Vec<&str> {
        [
            &self.field_name,
            &self.by_field_name,
            &self.over_field_name,
            &self.partition_field_name,
        ]
        .into_iter()
        .flatten()
        .map(String::as_str)
        .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    pub bucket_span_secs: u64,
    #[serde(default)]
    pub latency_secs: u64,
    pub detectors: Vec<Detector>,
    #[serde(default)]
    pub influencers: Vec<String>,
    #[serde(default)]
    pub categorization_field_name: Option<String>,
    #[serde(default)]
    pub use_per_partition_normalization: bool,
}

impl AnalysisConfig {
    /// Ids of every list document referenced by a detector rule.
    pub fn referenced_lists(&self) -> BTreeSet<String> {
        self.detectors
            .iter()
            .flat_map(|d| d.rules.iter())
            .flat_map(|r| r.conditions.iter())
            .filter_map(|c| c.value_filter.clone())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    #[serde(default)]
    pub description: Option<String>,
    pub analysis_config: AnalysisConfig,
    #[serde(default)]
    pub data_description: DataDescription,
}

impl Job {
    /// Fields written for every data record, time field first, then every
    /// analysis field once in the order it is first mentioned.
    pub fn analysis_fields(&self) -> Vec<String> {
        let mut fields = vec![self.data_description.time_field.clone()];
        let config = &self.analysis_config;
        let detector_fields = config
            .detectors
            .iter()
            .flat_map(|d| d.extract_analysis_fields())
            .chain(config.influencers.iter().map(String::as_str))
            .chain(config.categorization_field_name.as_deref());
        for field in detector_fields {
            if !fields.iter().any(|f| f == field) {
                fields.push(field.to_string());
            }
        }
        fields
    }

    pub fn validate(&self) -> Result<()> {
        if self.job_id.trim().is_empty() {
            return Err(AutodetectError::Configuration(
                "job_id must not be empty".to_string(),
            ));
        }
        if self.analysis_config.bucket_span_secs == 0 {
            return Err(AutodetectError::Configuration(format!(
                "job [{}] bucket_span_secs must be greater than 0",
                self.job_id
            )));
        }
        if self.analysis_config.detectors.is_empty() {
            return Err(AutodetectError::Configuration(format!(
                "job [{}] must declare at least one detector",
                self.job_id
            )));
        }
        Ok(())
    }
}

/// A named list of values referenced from detector rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListDocument {
    pub id: String,
    pub items: Vec<String>,
}

#[cfg(test)]
pub(crate) fn test_job(job_id: &str) -> Job {
    Job {
        job_id: job_id.to_string(),
        description: None,
        analysis_config: AnalysisConfig {
            bucket_span_secs: 300,
            latency_secs: 0,
            detectors: vec![Detector {
                function: "mean".to_string(),
                field_name: Some("responsetime".to_string()),
                by_field_name: Some("airline".to_string()),
                over_field_name: None,
                partition_field_name: None,
                rules: Vec::new(),
            }],
            influencers: Vec::new(),
            categorization_field_name: None,
            use_per_partition_normalization: false,
        },
        data_description: DataDescription::default(),
    }
}
