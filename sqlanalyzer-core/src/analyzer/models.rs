//! Findings, analysis results, and collected table metadata.

use crate::models::EngineKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

/// Finding severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// One issue reported by an analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub id: Uuid,
    pub severity: Severity,
    pub category: String,
    pub message: String,
    pub description: Option<String>,
    pub recommendation: String,
    pub impact: Option<String>,
    /// SQL that addresses the finding; review before running
    pub remediation_script: Option<String>,
    /// Qualified object name, e.g. `dbo.Orders`
    pub affected_object: Option<String>,
    pub object_type: Option<String>,
    pub schema: Option<String>,
    pub discovered_at: DateTime<Utc>,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Finding {
    /// Creates a finding stamped with a fresh id and the current time.
    pub fn new(
        severity: Severity,
        category: impl Into<String>,
        message: impl Into<String>,
        recommendation: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            severity,
            category: category.into(),
            message: message.into(),
            description: None,
            recommendation: recommendation.into(),
            impact: None,
            remediation_script: None,
            affected_object: None,
            object_type: None,
            schema: None,
            discovered_at: Utc::now(),
            properties: BTreeMap::new(),
            tags: Vec::new(),
        }
    }

    /// Sets the long-form description.
    pub fn with_description(&mut self, description: impl Into<String>) -> &mut Self {
        self.description = Some(description.into());
        self
    }

    /// Sets the impact statement.
    pub fn with_impact(&mut self, impact: impl Into<String>) -> &mut Self {
        self.impact = Some(impact.into());
        self
    }

    /// Adds a structured property.
    pub fn with_property(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Adds a tag.
    pub fn with_tag(&mut self, tag: impl Into<String>) -> &mut Self {
        self.tags.push(tag.into());
        self
    }
}

/// Object a finding is about, plus an optional category override.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FindingTarget {
    pub affected_object: Option<String>,
    pub object_type: Option<String>,
    /// Replaces the analyzer's category for this finding
    pub category: Option<String>,
}

impl FindingTarget {
    /// Targets a named object of the given type.
    pub fn object(name: impl Into<String>, object_type: impl Into<String>) -> Self {
        Self {
            affected_object: Some(name.into()),
            object_type: Some(object_type.into()),
            category: None,
        }
    }

    /// Overrides the category.
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }
}

/// Terminal state of an analysis run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
    Completed,
    Failed,
    Cancelled,
}

/// Aggregates over the findings and analyzed objects of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisSummary {
    pub total_objects_analyzed: usize,
    pub critical_findings: usize,
    pub error_findings: usize,
    pub warning_findings: usize,
    pub info_findings: usize,
    /// Rows across the analyzed objects, when the analyzer knows them
    pub total_rows: u64,
}

impl AnalysisSummary {
    /// Sum of the per-severity counts.
    pub fn total_findings(&self) -> usize {
        self.critical_findings + self.error_findings + self.warning_findings + self.info_findings
    }

    /// Counts one finding of `severity`.
    pub fn record(&mut self, severity: Severity) {
        match severity {
            Severity::Critical => self.critical_findings += 1,
            Severity::Error => self.error_findings += 1,
            Severity::Warning => self.warning_findings += 1,
            Severity::Info => self.info_findings += 1,
        }
    }
}

/// Outcome of running one analyzer against one connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub analyzer_name: String,
    pub database: Option<String>,
    pub server: String,
    pub engine: EngineKind,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    #[serde(rename = "duration_ms", with = "crate::config::duration_millis")]
    pub duration: Duration,
    pub status: AnalysisStatus,
    pub success: bool,
    pub error_message: Option<String>,
    pub findings: Vec<Finding>,
    pub summary: AnalysisSummary,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl AnalysisResult {
    /// Findings at exactly `severity`.
    pub fn findings_with_severity(&self, severity: Severity) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(move |f| f.severity == severity)
    }

    /// Most severe finding level, `None` without findings.
    pub fn highest_severity(&self) -> Option<Severity> {
        self.findings.iter().map(|f| f.severity).max()
    }
}

/// Table metadata gathered by [`TableCollector`](super::TableCollector).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableInfo {
    pub schema: String,
    pub table_name: String,
    pub row_count: u64,
    /// Data size in megabytes
    pub size_mb: f64,
    pub index_size_mb: f64,
    pub has_primary_key: bool,
    pub has_indexes: bool,
    pub has_clustered_index: bool,
    pub column_count: u32,
    pub index_count: u32,
    /// SQL Server table without a clustered index
    pub is_heap: bool,
    pub is_system_table: bool,
}

impl TableInfo {
    /// `schema.table`.
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.schema, self.table_name)
    }

    /// Data plus index size in megabytes.
    pub fn total_size_mb(&self) -> f64 {
        self.size_mb + self.index_size_mb
    }
}
