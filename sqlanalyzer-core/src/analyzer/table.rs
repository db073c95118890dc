//! Table structure analysis.

use super::{
    AnalysisResult, Analyzer, Collector, FindingSink, FindingTarget, Severity, TableInfo,
    run_analysis,
};
use crate::Result;
use crate::connection::{ConnectionHandle, QueryParam, QueryRow};
use crate::models::EngineKind;
use async_trait::async_trait;
use tracing::debug;

/// Names that are reserved in at least one supported dialect.
const RESERVED_TABLE_NAMES: &[&str] = &["USER", "ORDER", "GROUP", "TABLE", "INDEX", "VIEW", "PROCEDURE"];

/// Heap tables above this many rows are reported.
const HEAP_ROW_THRESHOLD: u64 = 1000;
/// Tables with more columns than this are reported as wide.
const WIDE_TABLE_COLUMNS: u32 = 30;
/// Unindexed tables above this many rows are reported.
const UNINDEXED_ROW_THRESHOLD: u64 = 5000;
const LARGE_TABLE_ROWS: u64 = 5_000_000;
const LARGE_TABLE_MB: f64 = 1000.0;

/// Catalog query split around the point where the schema filter goes.
struct TableQuery {
    head: &'static str,
    system_filter: &'static str,
    schema_column: &'static str,
    tail: &'static str,
}

const SQL_SERVER_TABLES: TableQuery = TableQuery {
    head: "SELECT s.name AS schema_name, t.name AS table_name, \
           CAST(p.rows AS BIGINT) AS row_count, \
           CAST(SUM(CASE WHEN a.type <> 2 THEN a.total_pages ELSE 0 END) * 8 / 1024.0 AS FLOAT) AS size_mb, \
           CAST(SUM(CASE WHEN a.type = 2 THEN a.total_pages ELSE 0 END) * 8 / 1024.0 AS FLOAT) AS index_size_mb, \
           CAST(CASE WHEN EXISTS (SELECT 1 FROM sys.indexes i WHERE i.object_id = t.object_id AND i.is_primary_key = 1) THEN 1 ELSE 0 END AS BIT) AS has_primary_key, \
           CAST(CASE WHEN EXISTS (SELECT 1 FROM sys.indexes i WHERE i.object_id = t.object_id AND i.index_id > 0) THEN 1 ELSE 0 END AS BIT) AS has_indexes, \
           CAST(CASE WHEN EXISTS (SELECT 1 FROM sys.indexes i WHERE i.object_id = t.object_id AND i.type = 1) THEN 1 ELSE 0 END AS BIT) AS has_clustered_index, \
           (SELECT COUNT(*) FROM sys.columns c WHERE c.object_id = t.object_id) AS column_count, \
           (SELECT COUNT(*) FROM sys.indexes i WHERE i.object_id = t.object_id AND i.index_id > 0) AS index_count, \
           CAST(CASE WHEN NOT EXISTS (SELECT 1 FROM sys.indexes i WHERE i.object_id = t.object_id AND i.type = 1) THEN 1 ELSE 0 END AS BIT) AS is_heap, \
           CAST(t.is_ms_shipped AS BIT) AS is_system_table \
           FROM sys.tables t \
           INNER JOIN sys.schemas s ON t.schema_id = s.schema_id \
           INNER JOIN sys.partitions p ON t.object_id = p.object_id AND p.index_id IN (0, 1) \
           LEFT JOIN sys.allocation_units a ON p.partition_id = a.container_id \
           WHERE t.type = 'U'",
    system_filter: " AND t.is_ms_shipped = 0",
    schema_column: "s.name",
    tail: " GROUP BY s.name, t.name, t.object_id, p.rows, t.is_ms_shipped ORDER BY s.name, t.name",
};

const POSTGRES_TABLES: TableQuery = TableQuery {
    head: "SELECT n.nspname::text AS schema_name, c.relname::text AS table_name, \
           GREATEST(c.reltuples, 0)::bigint AS row_count, \
           (pg_relation_size(c.oid) / 1024.0 / 1024.0)::float8 AS size_mb, \
           (pg_indexes_size(c.oid) / 1024.0 / 1024.0)::float8 AS index_size_mb, \
           EXISTS (SELECT 1 FROM pg_constraint con WHERE con.conrelid = c.oid AND con.contype = 'p') AS has_primary_key, \
           EXISTS (SELECT 1 FROM pg_index i WHERE i.indrelid = c.oid) AS has_indexes, \
           EXISTS (SELECT 1 FROM pg_index i WHERE i.indrelid = c.oid AND i.indisclustered) AS has_clustered_index, \
           (SELECT COUNT(*) FROM pg_attribute a WHERE a.attrelid = c.oid AND a.attnum > 0 AND NOT a.attisdropped) AS column_count, \
           (SELECT COUNT(*) FROM pg_index i WHERE i.indrelid = c.oid) AS index_count, \
           false AS is_heap, \
           (n.nspname IN ('pg_catalog', 'information_schema') OR n.nspname LIKE 'pg_toast%') AS is_system_table \
           FROM pg_class c \
           JOIN pg_namespace n ON n.oid = c.relnamespace \
           WHERE c.relkind IN ('r', 'p')",
    system_filter: " AND n.nspname NOT IN ('pg_catalog', 'information_schema') AND n.nspname NOT LIKE 'pg_toast%'",
    schema_column: "n.nspname",
    tail: " ORDER BY n.nspname, c.relname",
};

const MYSQL_TABLES: TableQuery = TableQuery {
    head: "SELECT t.TABLE_SCHEMA AS schema_name, t.TABLE_NAME AS table_name, \
           COALESCE(t.TABLE_ROWS, 0) AS row_count, \
           CAST(COALESCE(t.DATA_LENGTH, 0) / 1024 / 1024 AS DOUBLE) AS size_mb, \
           CAST(COALESCE(t.INDEX_LENGTH, 0) / 1024 / 1024 AS DOUBLE) AS index_size_mb, \
           EXISTS (SELECT 1 FROM INFORMATION_SCHEMA.TABLE_CONSTRAINTS tc WHERE tc.TABLE_SCHEMA = t.TABLE_SCHEMA AND tc.TABLE_NAME = t.TABLE_NAME AND tc.CONSTRAINT_TYPE = 'PRIMARY KEY') AS has_primary_key, \
           EXISTS (SELECT 1 FROM INFORMATION_SCHEMA.STATISTICS s WHERE s.TABLE_SCHEMA = t.TABLE_SCHEMA AND s.TABLE_NAME = t.TABLE_NAME) AS has_indexes, \
           EXISTS (SELECT 1 FROM INFORMATION_SCHEMA.STATISTICS s WHERE s.TABLE_SCHEMA = t.TABLE_SCHEMA AND s.TABLE_NAME = t.TABLE_NAME AND s.INDEX_NAME = 'PRIMARY') AS has_clustered_index, \
           (SELECT COUNT(*) FROM INFORMATION_SCHEMA.COLUMNS c WHERE c.TABLE_SCHEMA = t.TABLE_SCHEMA AND c.TABLE_NAME = t.TABLE_NAME) AS column_count, \
           (SELECT COUNT(DISTINCT s.INDEX_NAME) FROM INFORMATION_SCHEMA.STATISTICS s WHERE s.TABLE_SCHEMA = t.TABLE_SCHEMA AND s.TABLE_NAME = t.TABLE_NAME) AS index_count, \
           0 AS is_heap, \
           t.TABLE_SCHEMA IN ('mysql', 'information_schema', 'performance_schema', 'sys') AS is_system_table \
           FROM INFORMATION_SCHEMA.TABLES t \
           WHERE t.TABLE_TYPE = 'BASE TABLE'",
    system_filter: " AND t.TABLE_SCHEMA NOT IN ('mysql', 'information_schema', 'performance_schema', 'sys')",
    schema_column: "t.TABLE_SCHEMA",
    tail: " ORDER BY t.TABLE_SCHEMA, t.TABLE_NAME",
};

const fn table_query(engine: EngineKind) -> &'static TableQuery {
    match engine {
        EngineKind::SqlServer => &SQL_SERVER_TABLES,
        EngineKind::Postgres => &POSTGRES_TABLES,
        EngineKind::MySql => &MYSQL_TABLES,
    }
}

/// Collects [`TableInfo`] from the engine's catalog views.
#[derive(Debug, Clone, Default)]
pub struct TableCollector {
    schema_filter: Option<String>,
    include_system_tables: bool,
}

impl TableCollector {
    /// Collector limited to `schema_filter` when it is non-blank.
    pub fn new(schema_filter: Option<String>) -> Self {
        Self {
            schema_filter: schema_filter.filter(|s| !s.trim().is_empty()),
            include_system_tables: false,
        }
    }

    /// Also collects catalog tables; they are still skipped by the analyzer.
    pub fn with_system_tables(mut self, include: bool) -> Self {
        self.include_system_tables = include;
        self
    }

    /// Schema the collector is limited to.
    pub fn schema_filter(&self) -> Option<&str> {
        self.schema_filter.as_deref()
    }

    /// Metadata query and parameters for `engine`.
    pub(crate) fn query(&self, engine: EngineKind) -> (String, Vec<QueryParam>) {
        let parts = table_query(engine);
        let mut sql = String::from(parts.head);
        if !self.include_system_tables {
            sql.push_str(parts.system_filter);
        }
        let mut params = Vec::new();
        if let Some(schema) = &self.schema_filter {
            sql.push_str(" AND ");
            sql.push_str(parts.schema_column);
            sql.push_str(" = @schema_filter");
            params.push(QueryParam::new("schema_filter", schema.as_str()));
        }
        sql.push_str(parts.tail);
        (sql, params)
    }
}

#[async_trait]
impl Collector for TableCollector {
    type Item = TableInfo;

    async fn collect(&self, connection: &mut ConnectionHandle) -> Result<Vec<TableInfo>> {
        let engine = connection.engine();
        let (sql, params) = self.query(engine);
        let result = connection.execute_query(&sql, &params).await?;

        let tables: Vec<TableInfo> = result
            .rows
            .iter()
            .map(|row| table_from_row(row, engine))
            .collect();
        debug!(
            engine = %engine,
            schema = self.schema_filter.as_deref().unwrap_or("*"),
            tables = tables.len(),
            "Collected table information"
        );
        Ok(tables)
    }
}

fn table_from_row(row: &QueryRow, engine: EngineKind) -> TableInfo {
    let count = |column: &str| row.get_i64(column).and_then(|n| u64::try_from(n).ok()).unwrap_or(0);
    let flag = |column: &str| row.get_bool(column).unwrap_or(false);

    TableInfo {
        schema: row
            .get_string("schema_name")
            .or_else(|| engine.default_schema().map(str::to_string))
            .unwrap_or_default(),
        table_name: row.get_string("table_name").unwrap_or_default(),
        row_count: count("row_count"),
        size_mb: row.get_f64("size_mb").unwrap_or(0.0),
        index_size_mb: row.get_f64("index_size_mb").unwrap_or(0.0),
        has_primary_key: flag("has_primary_key"),
        has_indexes: flag("has_indexes"),
        has_clustered_index: flag("has_clustered_index"),
        column_count: u32::try_from(count("column_count")).unwrap_or(u32::MAX),
        index_count: u32::try_from(count("index_count")).unwrap_or(u32::MAX),
        is_heap: flag("is_heap"),
        is_system_table: flag("is_system_table"),
    }
}

/// Structural and naming checks over user tables.
#[derive(Debug, Clone, Copy, Default)]
pub struct TableAnalyzer;

impl Analyzer for TableAnalyzer {
    type Item = TableInfo;

    fn name(&self) -> &str {
        "Table Analyzer"
    }

    fn description(&self) -> &str {
        "Analyzes table structure, identifies design issues, and checks best practices"
    }

    fn category(&self) -> &str {
        "Schema"
    }

    fn analyze(&self, tables: &[TableInfo], sink: &mut FindingSink) -> Result<()> {
        let engine = sink.engine();
        for table in tables.iter().filter(|t| !t.is_system_table) {
            let full_name = table.full_name();
            let target = || FindingTarget::object(full_name.clone(), "Table");

            if !table.has_primary_key {
                sink.add_finding_with_script(
                    Severity::Critical,
                    format!("Table {} has no primary key", full_name),
                    "Every table should have a primary key to ensure data integrity and improve query performance",
                    primary_key_script(table),
                    target(),
                );
            }

            if engine == EngineKind::SqlServer && table.is_heap && table.row_count > HEAP_ROW_THRESHOLD {
                sink.add_finding_with_script(
                    Severity::Error,
                    format!("Table {} is a heap table with {} rows", full_name, table.row_count),
                    "Heap tables can cause performance issues. Consider adding a clustered index",
                    clustered_index_script(table),
                    target(),
                )
                .with_property("row_count", table.row_count);
            }

            if table.column_count > WIDE_TABLE_COLUMNS {
                sink.add_finding(
                    Severity::Warning,
                    format!(
                        "Table {} is a wide table with {} columns",
                        full_name, table.column_count
                    ),
                    "Consider normalizing the table or splitting it into multiple tables",
                    target(),
                )
                .with_property("column_count", table.column_count);
            }

            if !table.has_indexes && table.row_count > UNINDEXED_ROW_THRESHOLD {
                sink.add_finding(
                    Severity::Warning,
                    format!(
                        "Table {} has no indexes and contains {} rows",
                        full_name, table.row_count
                    ),
                    "Consider adding indexes to improve query performance",
                    target(),
                );
            }

            check_naming(table, &full_name, sink);

            if table.row_count > LARGE_TABLE_ROWS || table.total_size_mb() > LARGE_TABLE_MB {
                sink.add_finding(
                    Severity::Info,
                    format!(
                        "Table {} is large ({} rows, {:.0} MB)",
                        full_name,
                        table.row_count,
                        table.total_size_mb()
                    ),
                    "Consider partitioning or archiving strategies for large tables",
                    target(),
                );
            }
        }
        Ok(())
    }

    fn total_rows(&self, tables: &[TableInfo]) -> u64 {
        tables
            .iter()
            .filter(|t| !t.is_system_table)
            .map(|t| t.row_count)
            .fold(0, u64::saturating_add)
    }
}

fn check_naming(table: &TableInfo, full_name: &str, sink: &mut FindingSink) {
    let name = table.table_name.as_str();
    let lower = name.to_ascii_lowercase();

    if lower.starts_with("tbl_") || lower.starts_with("table_") {
        sink.add_finding(
            Severity::Info,
            format!("Table {} uses redundant prefix in name", full_name),
            "Avoid using prefixes like 'tbl_' or 'table_' in table names",
            FindingTarget::object(full_name, "Table"),
        );
    }

    if name.contains(['-', ' ', '@']) {
        sink.add_finding(
            Severity::Info,
            format!("Table {} contains special characters in name", full_name),
            "Use only letters, numbers, and underscores in table names",
            FindingTarget::object(full_name, "Table"),
        );
    }

    if RESERVED_TABLE_NAMES.contains(&name.to_ascii_uppercase().as_str()) {
        sink.add_finding(
            Severity::Warning,
            format!("Table {} uses reserved word as name", full_name),
            "Avoid using SQL reserved words as table names",
            FindingTarget::object(full_name, "Table"),
        );
    }
}

fn primary_key_script(table: &TableInfo) -> String {
    format!(
        "-- Add primary key to {full}\n\
         -- Replace 'Id' with the appropriate column(s) for your primary key\n\
         ALTER TABLE {full}\n\
         ADD CONSTRAINT PK_{name} PRIMARY KEY (Id);",
        full = table.full_name(),
        name = table.table_name
    )
}

fn clustered_index_script(table: &TableInfo) -> String {
    format!(
        "-- Create clustered index on {full}\n\
         -- Replace 'Id' with the appropriate column(s) for your clustered index\n\
         CREATE CLUSTERED INDEX IX_{name}_Clustered\n\
         ON {full} (Id);",
        full = table.full_name(),
        name = table.table_name
    )
}

/// Collects and analyzes tables in one call.
pub async fn analyze_tables(
    connection: &mut ConnectionHandle,
    schema_filter: Option<String>,
) -> AnalysisResult {
    run_analysis(connection, &TableCollector::new(schema_filter), &TableAnalyzer).await
}
