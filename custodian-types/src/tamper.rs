//! Locally detected integrity violations.

use crate::Timestamp;
use serde::{Deserialize, Serialize};

/// How serious a tamper finding is. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// Whether the authority has been told about an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportStatus {
    Pending,
    Reported,
}

/// A tamper finding produced by the detection layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TamperEvent {
    #[serde(rename = "type")]
    pub tamper_type: String,
    pub severity: Severity,
    pub description: String,
    pub detected_at: Timestamp,
    pub reported_status: ReportStatus,
}

impl TamperEvent {
    /// Creates a pending event.
    pub fn new(
        tamper_type: impl Into<String>,
        severity: Severity,
        description: impl Into<String>,
        detected_at: Timestamp,
    ) -> Self {
        Self {
            tamper_type: tamper_type.into(),
            severity,
            description: description.into(),
            detected_at,
            reported_status: ReportStatus::Pending,
        }
    }
}
