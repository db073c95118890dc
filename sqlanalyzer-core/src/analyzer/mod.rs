//! Analyzer framework.
//!
//! An analysis is two independent halves: a [`Collector`] that reads
//! metadata over a connection, and an [`Analyzer`] that turns the collected
//! items into [`Finding`]s. [`run_analysis`] composes the two, times the run
//! and folds every failure into the returned [`AnalysisResult`].

mod models;
mod table;

pub use models::{
    AnalysisResult, AnalysisStatus, AnalysisSummary, Finding, FindingTarget, Severity, TableInfo,
};
pub use table::{TableAnalyzer, TableCollector, analyze_tables};

use crate::Result;
use crate::connection::ConnectionHandle;
use crate::error::SqlAnalyzerError;
use crate::models::EngineKind;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Reads analyzable items from a database.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Item type handed to the analyzer
    type Item: Send;

    /// Readies the connection before collection; opens it when not open.
    ///
    /// # Errors
    /// Returns the connection's open error.
    async fn prepare(&self, connection: &mut ConnectionHandle) -> Result<()> {
        if !connection.is_open() {
            connection.open().await?;
        }
        Ok(())
    }

    /// Collects items over an open connection.
    ///
    /// # Errors
    /// Returns query, timeout, or cancellation errors from the connection.
    async fn collect(&self, connection: &mut ConnectionHandle) -> Result<Vec<Self::Item>>;
}

/// Turns collected items into findings.
pub trait Analyzer: Send + Sync {
    /// Item type this analyzer inspects
    type Item;

    /// Display name, recorded on the result.
    fn name(&self) -> &str;

    /// One-line description of what is checked.
    fn description(&self) -> &str;

    /// Default category for emitted findings.
    fn category(&self) -> &str;

    /// Whether the analyzer has anything to say about `engine`.
    fn is_applicable(&self, _engine: EngineKind) -> bool {
        true
    }

    /// Inspects `items`, reporting into `sink`.
    ///
    /// # Errors
    /// Implementations may fail; the run is then marked failed.
    fn analyze(&self, items: &[Self::Item], sink: &mut FindingSink) -> Result<()>;

    /// Rows represented by `items`, for the result summary.
    fn total_rows(&self, _items: &[Self::Item]) -> u64 {
        0
    }
}

/// Collects findings for one analysis run.
///
/// Stamps each finding with its id and discovery time. The finding's schema
/// comes from the first part of a dotted object name, or the engine's default
/// schema when the name has a single part.
#[derive(Debug)]
pub struct FindingSink {
    engine: EngineKind,
    default_schema: Option<String>,
    category: String,
    findings: Vec<Finding>,
}

impl FindingSink {
    /// Creates a sink for `engine`.
    ///
    /// `default_schema` stands in when an object name carries no schema part.
    pub fn new(
        engine: EngineKind,
        default_schema: Option<String>,
        category: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            default_schema,
            category: category.into(),
            findings: Vec::new(),
        }
    }

    /// Engine the findings are about.
    pub fn engine(&self) -> EngineKind {
        self.engine
    }

    /// Records a finding and returns it for further enrichment.
    pub fn add_finding(
        &mut self,
        severity: Severity,
        message: impl Into<String>,
        recommendation: impl Into<String>,
        target: FindingTarget,
    ) -> &mut Finding {
        let FindingTarget {
            affected_object,
            object_type,
            category,
        } = target;

        let mut finding = Finding::new(
            severity,
            category.unwrap_or_else(|| self.category.clone()),
            message,
            recommendation,
        );
        finding.schema = affected_object
            .as_deref()
            .and_then(|name| self.schema_of(name));
        finding.affected_object = affected_object;
        finding.object_type = object_type;

        debug!(severity = %severity, message = %finding.message, "Added finding");
        let index = self.findings.len();
        self.findings.push(finding);
        &mut self.findings[index]
    }

    /// Records a finding that carries a remediation script.
    pub fn add_finding_with_script(
        &mut self,
        severity: Severity,
        message: impl Into<String>,
        recommendation: impl Into<String>,
        remediation_script: impl Into<String>,
        target: FindingTarget,
    ) -> &mut Finding {
        let finding = self.add_finding(severity, message, recommendation, target);
        finding.remediation_script = Some(remediation_script.into());
        finding
    }

    /// Findings recorded so far.
    pub fn findings(&self) -> &[Finding] {
        &self.findings
    }

    /// Number of findings recorded.
    pub fn len(&self) -> usize {
        self.findings.len()
    }

    /// True when nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.findings.is_empty()
    }

    /// Consumes the sink.
    pub fn into_findings(self) -> Vec<Finding> {
        self.findings
    }

    fn schema_of(&self, object_name: &str) -> Option<String> {
        match object_name.split_once('.') {
            Some((schema, _)) if !schema.is_empty() => Some(schema.to_string()),
            _ => self.default_schema.clone(),
        }
    }
}

/// Runs `collector` then `analyzer` against `connection`.
///
/// The collector readies the connection first, which by default opens it
/// when it is not open yet. Never fails: errors are
/// reported through the result's status, `success` and `error_message`.
pub async fn run_analysis<C, A>(
    connection: &mut ConnectionHandle,
    collector: &C,
    analyzer: &A,
) -> AnalysisResult
where
    C: Collector,
    A: Analyzer<Item = C::Item>,
{
    let started = Instant::now();
    let started_at = Utc::now();
    let descriptor = connection.descriptor();
    let engine = descriptor.engine();

    let mut result = AnalysisResult {
        analyzer_name: analyzer.name().to_string(),
        database: descriptor.database().map(str::to_string),
        server: descriptor.server().to_string(),
        engine,
        started_at,
        ended_at: started_at,
        duration: std::time::Duration::ZERO,
        status: AnalysisStatus::Completed,
        success: true,
        error_message: None,
        findings: Vec::new(),
        summary: AnalysisSummary::default(),
        metadata: BTreeMap::new(),
    };
    result
        .metadata
        .insert("category".to_string(), Value::from(analyzer.category()));
    result
        .metadata
        .insert("connection_id".to_string(), Value::from(connection.id().to_string()));

    info!(
        analyzer = analyzer.name(),
        engine = %engine,
        database = result.database.as_deref().unwrap_or(""),
        "Starting analysis"
    );

    if analyzer.is_applicable(engine) {
        let mut sink = FindingSink::new(engine, descriptor.default_schema(), analyzer.category());
        match collect_and_analyze(connection, collector, analyzer, &mut sink, &mut result.summary)
            .await
        {
            Ok(()) => {}
            Err(SqlAnalyzerError::Cancelled { operation }) => {
                warn!(analyzer = analyzer.name(), operation = %operation, "Analysis cancelled");
                result.status = AnalysisStatus::Cancelled;
                result.success = false;
                result.error_message = Some(format!("{} was cancelled", operation));
            }
            Err(err) => {
                error!(analyzer = analyzer.name(), error = %err, "Analysis failed");
                result.status = AnalysisStatus::Failed;
                result.success = false;
                result.error_message = Some(err.to_string());
            }
        }

        result.findings = sink.into_findings();
        for finding in &result.findings {
            result.summary.record(finding.severity);
        }
    } else {
        warn!(
            analyzer = analyzer.name(),
            engine = %engine,
            "Analyzer is not applicable to this engine, skipping"
        );
        result.metadata.insert("skipped".to_string(), Value::Bool(true));
    }

    result.ended_at = Utc::now();
    result.duration = started.elapsed();

    info!(
        analyzer = analyzer.name(),
        status = ?result.status,
        duration_ms = u64::try_from(result.duration.as_millis()).unwrap_or(u64::MAX),
        findings = result.findings.len(),
        "Completed analysis"
    );
    result
}

async fn collect_and_analyze<C, A>(
    connection: &mut ConnectionHandle,
    collector: &C,
    analyzer: &A,
    sink: &mut FindingSink,
    summary: &mut AnalysisSummary,
) -> Result<()>
where
    C: Collector,
    A: Analyzer<Item = C::Item>,
{
    collector.prepare(connection).await?;

    debug!(analyzer = analyzer.name(), "Collecting data for analysis");
    let items = collector.collect(connection).await?;
    summary.total_objects_analyzed = items.len();
    summary.total_rows = analyzer.total_rows(&items);

    if items.is_empty() {
        warn!(analyzer = analyzer.name(), "No data collected for analysis");
        return Ok(());
    }

    debug!(analyzer = analyzer.name(), count = items.len(), "Analyzing objects");
    analyzer.analyze(&items, sink)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionDescriptor, ConnectionOptions};
    use crate::resilience::RetryPolicy;

    fn sink(engine: EngineKind, default_schema: Option<&str>) -> FindingSink {
        FindingSink::new(engine, default_schema.map(str::to_string), "Schema")
    }

    #[test]
    fn test_sink_derives_schema_from_object_name() {
        let mut sink = sink(EngineKind::SqlServer, Some("dbo"));
        let finding = sink.add_finding(
            Severity::Warning,
            "wide",
            "split",
            FindingTarget::object("sales.Orders", "Table"),
        );
        assert_eq!(finding.schema.as_deref(), Some("sales"));
        assert_eq!(finding.category, "Schema");
        assert_eq!(finding.object_type.as_deref(), Some("Table"));
    }

    #[test]
    fn test_sink_falls_back_to_default_schema() {
        let mut pg = sink(EngineKind::Postgres, Some("public"));
        let finding = pg.add_finding(
            Severity::Info,
            "x",
            "y",
            FindingTarget::object("orders", "Table"),
        );
        assert_eq!(finding.schema.as_deref(), Some("public"));

        let mut mysql = sink(EngineKind::MySql, Some("shop"));
        let finding = mysql.add_finding(
            Severity::Info,
            "x",
            "y",
            FindingTarget::object("orders", "Table"),
        );
        assert_eq!(finding.schema.as_deref(), Some("shop"));

        let finding = mysql.add_finding(Severity::Info, "x", "y", FindingTarget::default());
        assert_eq!(finding.schema, None);
    }

    #[test]
    fn test_sink_script_and_category_override() {
        let mut sink = sink(EngineKind::SqlServer, Some("dbo"));
        sink.add_finding_with_script(
            Severity::Critical,
            "no key",
            "add one",
            "ALTER TABLE dbo.t ADD CONSTRAINT PK_t PRIMARY KEY (Id);",
            FindingTarget::object("dbo.t", "Table").with_category("Integrity"),
        )
        .with_impact("duplicate rows");

        let findings = sink.into_findings();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].category, "Integrity");
        assert!(findings[0].remediation_script.is_some());
        assert_eq!(findings[0].impact.as_deref(), Some("duplicate rows"));
    }

    #[test]
    fn test_finding_ids_are_unique() {
        let mut sink = sink(EngineKind::Postgres, None);
        let a = sink.add_finding(Severity::Info, "a", "a", FindingTarget::default()).id;
        let b = sink.add_finding(Severity::Info, "b", "b", FindingTarget::default()).id;
        assert_ne!(a, b);
        assert_eq!(sink.len(), 2);
    }

    // ========================================================================
    // run_analysis
    // ========================================================================

    fn offline_handle() -> ConnectionHandle {
        let descriptor = ConnectionDescriptor::new(
            "Server=db01;Database=Sales;User Id=app;Password=Zq8!wT3#pL",
            EngineKind::SqlServer,
        )
        .unwrap();
        ConnectionHandle::new(descriptor, ConnectionOptions::default(), RetryPolicy::none())
    }

    /// Hands back a canned outcome without touching the connection.
    struct CannedCollector {
        outcome: fn() -> Result<Vec<u64>>,
    }

    #[async_trait]
    impl Collector for CannedCollector {
        type Item = u64;

        async fn prepare(&self, _connection: &mut ConnectionHandle) -> Result<()> {
            Ok(())
        }

        async fn collect(&self, _connection: &mut ConnectionHandle) -> Result<Vec<u64>> {
            (self.outcome)()
        }
    }

    /// Flags every item above 100 as a warning.
    struct ThresholdAnalyzer {
        applicable: bool,
    }

    impl Analyzer for ThresholdAnalyzer {
        type Item = u64;

        fn name(&self) -> &str {
            "Threshold Analyzer"
        }

        fn description(&self) -> &str {
            "Flags large values"
        }

        fn category(&self) -> &str {
            "Testing"
        }

        fn is_applicable(&self, _engine: EngineKind) -> bool {
            self.applicable
        }

        fn analyze(&self, items: &[u64], sink: &mut FindingSink) -> Result<()> {
            for item in items.iter().filter(|v| **v > 100) {
                sink.add_finding(
                    Severity::Warning,
                    format!("value {} is large", item),
                    "shrink it",
                    FindingTarget::default(),
                );
            }
            Ok(())
        }

        fn total_rows(&self, items: &[u64]) -> u64 {
            items.iter().sum()
        }
    }

    #[tokio::test]
    async fn test_run_analysis_completed() {
        let mut conn = offline_handle();
        let collector = CannedCollector {
            outcome: || Ok(vec![5, 150, 300]),
        };
        let result =
            run_analysis(&mut conn, &collector, &ThresholdAnalyzer { applicable: true }).await;

        assert!(result.success);
        assert_eq!(result.status, AnalysisStatus::Completed);
        assert_eq!(result.analyzer_name, "Threshold Analyzer");
        assert_eq!(result.database.as_deref(), Some("Sales"));
        assert_eq!(result.summary.total_objects_analyzed, 3);
        assert_eq!(result.summary.total_rows, 455);
        assert_eq!(result.summary.warning_findings, 2);
        assert_eq!(result.findings.len(), 2);
        assert_eq!(result.metadata["category"], Value::from("Testing"));
        assert!(result.ended_at >= result.started_at);
    }

    #[tokio::test]
    async fn test_run_analysis_collector_failure_is_reported() {
        let mut conn = offline_handle();
        let collector = CannedCollector {
            outcome: || Err(SqlAnalyzerError::query_failed("reading catalog")),
        };
        let result =
            run_analysis(&mut conn, &collector, &ThresholdAnalyzer { applicable: true }).await;

        assert!(!result.success);
        assert_eq!(result.status, AnalysisStatus::Failed);
        assert!(
            result
                .error_message
                .as_deref()
                .is_some_and(|m| m.contains("reading catalog"))
        );
        assert!(result.findings.is_empty());
    }

    #[tokio::test]
    async fn test_run_analysis_cancellation_is_reported() {
        let mut conn = offline_handle();
        let collector = CannedCollector {
            outcome: || Err(SqlAnalyzerError::cancelled("collect tables")),
        };
        let result =
            run_analysis(&mut conn, &collector, &ThresholdAnalyzer { applicable: true }).await;

        assert!(!result.success);
        assert_eq!(result.status, AnalysisStatus::Cancelled);
        assert!(
            result
                .error_message
                .as_deref()
                .is_some_and(|m| m.contains("collect tables"))
        );
    }

    #[tokio::test]
    async fn test_run_analysis_skips_inapplicable_analyzer() {
        let mut conn = offline_handle();
        let collector = CannedCollector {
            outcome: || panic!("collector must not run"),
        };
        let result =
            run_analysis(&mut conn, &collector, &ThresholdAnalyzer { applicable: false }).await;

        assert!(result.success);
        assert_eq!(result.status, AnalysisStatus::Completed);
        assert_eq!(result.metadata.get("skipped"), Some(&Value::Bool(true)));
        assert_eq!(result.summary.total_objects_analyzed, 0);
        assert!(result.findings.is_empty());
    }

    #[tokio::test]
    async fn test_default_prepare_surfaces_open_errors() {
        let token = tokio_util::sync::CancellationToken::new();
        token.cancel();
        let mut conn = offline_handle().with_cancellation(token);
        let result = analyze_tables(&mut conn, None).await;

        assert_eq!(result.status, AnalysisStatus::Cancelled);
        assert!(!result.success);
    }
}
