//! Dialect-aware textual query rewriting.
//!
//! Nothing here parses SQL. Every rewrite is a regular-expression pass over
//! the statement text, which keeps the optimizer cheap and predictable but
//! means it can be fooled by keywords inside string literals or comments.

use crate::Result;
use crate::connection::{ParamValue, QueryParam};
use crate::error::SqlAnalyzerError;
use crate::models::EngineKind;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tracing::debug;

/// Largest page `add_pagination` accepts.
pub const MAX_PAGE_SIZE: u32 = 10_000;

/// Batch size used when callers have no better figure.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Words that may follow a table name but are never its alias.
const NON_ALIAS_KEYWORDS: &[&str] = &[
    "WHERE", "JOIN", "INNER", "LEFT", "RIGHT", "FULL", "OUTER", "CROSS", "ON", "GROUP", "ORDER",
    "HAVING", "UNION", "EXCEPT", "INTERSECT", "OPTION", "FOR", "SET", "AND", "OR", "WINDOW",
    "PIVOT", "UNPIVOT", "SELECT", "INTO", "VALUES", "OUTPUT", "WHEN", "THEN", "ELSE", "END",
    "OFFSET", "FETCH", "LIMIT", "APPLY", "TABLESAMPLE",
];

/// Precompiled patterns shared by every optimizer call.
struct OptimizerPatterns {
    nolock: Regex,
    table_target: Regex,
    list_target: Regex,
    order_by: Regex,
    order_by_tail: Regex,
    join: Regex,
    subquery: Regex,
    group_by: Regex,
    having: Regex,
    distinct: Regex,
    leading_wildcard_like: Regex,
    where_clause: Regex,
    equality_column: Regex,
    join_keys: Regex,
}

impl OptimizerPatterns {
    fn instance() -> &'static Self {
        static PATTERNS: OnceLock<OptimizerPatterns> = OnceLock::new();
        PATTERNS.get_or_init(Self::compile)
    }

    #[allow(clippy::expect_used)]
    fn compile() -> Self {
        // One- to three-part name, each part bracketed or bare
        const PART: &str = r"(?:\[[^\]]+\]|[A-Za-z_#][\w$#]*)";
        let table_target = format!(
            r"(?i)\b(FROM|JOIN)\s+({part}(?:\s*\.\s*{part}){{0,2}})(?:(\s+)(AS\s+)?(\[[^\]]+\]|[A-Za-z_][\w$]*))?",
            part = PART
        );
        // Next source in a comma-separated FROM list, same capture layout
        let list_target = format!(
            r"(?i)(\s*,)\s*({part}(?:\s*\.\s*{part}){{0,2}})(?:(\s+)(AS\s+)?(\[[^\]]+\]|[A-Za-z_][\w$]*))?",
            part = PART
        );

        Self {
            nolock: Regex::new(r"(?i)WITH\s*\(\s*NOLOCK\s*\)").expect("Invalid NOLOCK pattern"),
            table_target: Regex::new(&table_target).expect("Invalid table target pattern"),
            list_target: Regex::new(&list_target).expect("Invalid table list pattern"),
            order_by: Regex::new(r"(?i)\bORDER\s+BY\b").expect("Invalid ORDER BY pattern"),
            order_by_tail: Regex::new(r"(?i)\b(?:OFFSET|LIMIT|FETCH|FOR|OPTION)\b|;")
                .expect("Invalid ORDER BY tail pattern"),
            join: Regex::new(r"(?i)\bJOIN\b").expect("Invalid JOIN pattern"),
            subquery: Regex::new(r"(?i)\(\s*SELECT\b").expect("Invalid subquery pattern"),
            group_by: Regex::new(r"(?i)\bGROUP\s+BY\b").expect("Invalid GROUP BY pattern"),
            having: Regex::new(r"(?i)\bHAVING\b").expect("Invalid HAVING pattern"),
            distinct: Regex::new(r"(?i)\bDISTINCT\b").expect("Invalid DISTINCT pattern"),
            leading_wildcard_like: Regex::new(r"(?is)\bWHERE\b.*\bLIKE\s+N?'%")
                .expect("Invalid LIKE pattern"),
            where_clause: Regex::new(
                r"(?is)\bWHERE\s+(.*?)(?:\bGROUP\s+BY\b|\bORDER\s+BY\b|\bHAVING\b|;|$)",
            )
            .expect("Invalid WHERE pattern"),
            equality_column: Regex::new(r"(?:\b\w+\s*\.\s*)?\b(\w+)\s*=")
                .expect("Invalid equality column pattern"),
            join_keys: Regex::new(r"(?i)\bON\s+\w+\.(\w+)\s*=\s*\w+\.(\w+)")
                .expect("Invalid join key pattern"),
        }
    }
}

/// Options for [`QueryOptimizer::optimize_for_read_only`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryOptimizationOptions {
    /// Add `WITH (NOLOCK)` table hints (SQL Server only)
    pub add_nolock: bool,
    pub enable_pagination: bool,
    pub page_size: u32,
    pub offset: u64,
}

impl Default for QueryOptimizationOptions {
    fn default() -> Self {
        Self {
            add_nolock: true,
            enable_pagination: false,
            page_size: 100,
            offset: 0,
        }
    }
}

impl QueryOptimizationOptions {
    /// Enables pagination with the given window.
    pub fn with_pagination(mut self, page_size: u32, offset: u64) -> Self {
        self.enable_pagination = true;
        self.page_size = page_size;
        self.offset = offset;
        self
    }

    /// Toggles the NOLOCK hint.
    pub fn with_nolock(mut self, add_nolock: bool) -> Self {
        self.add_nolock = add_nolock;
        self
    }
}

/// One chunk produced by [`QueryOptimizer::create_batched_query`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchedQuery {
    /// Statement with the list parameter expanded
    pub query: String,
    /// `{name}_0`, `{name}_1`, ... in placeholder order
    pub parameters: Vec<QueryParam>,
}

/// Stateless query rewriter.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryOptimizer;

impl QueryOptimizer {
    /// Adds `WITH (NOLOCK)` after every `FROM` and `JOIN` table, including
    /// each source of a comma-separated `FROM` list.
    ///
    /// Only SQL Server understands the hint; other engines get the query
    /// back untouched, as does a query that already carries one.
    ///
    /// # Example
    /// ```rust
    /// use sqlanalyzer_core::models::EngineKind;
    /// use sqlanalyzer_core::optimizer::QueryOptimizer;
    ///
    /// let hinted = QueryOptimizer::add_nolock_hint("SELECT * FROM dbo.Orders", EngineKind::SqlServer);
    /// assert_eq!(hinted, "SELECT * FROM dbo.Orders WITH (NOLOCK)");
    /// ```
    pub fn add_nolock_hint(query: &str, engine: EngineKind) -> String {
        if engine != EngineKind::SqlServer {
            return query.to_string();
        }
        let patterns = OptimizerPatterns::instance();
        if patterns.nolock.is_match(query) {
            return query.to_string();
        }

        let mut out = String::with_capacity(query.len() + 32);
        let mut last = 0;
        while let Some(caps) = patterns.table_target.captures_at(query, last) {
            let Some(whole) = caps.get(0) else { break };
            out.push_str(&query[last..whole.start()]);
            let (rewritten, end) = hint_target(query, &caps);
            out.push_str(&rewritten);
            last = end;

            // FROM a, b, c
            while let Some(next) = patterns.list_target.captures_at(query, last) {
                if next.get(0).is_none_or(|m| m.start() != last) {
                    break;
                }
                let (rewritten, end) = hint_target(query, &next);
                out.push_str(&rewritten);
                last = end;
            }
        }
        out.push_str(&query[last..]);
        out
    }

    /// Appends the engine's pagination clause.
    ///
    /// # Errors
    /// Returns `InvalidInput` when `page_size` is outside `1..=10000`.
    ///
    /// # Example
    /// ```rust
    /// use sqlanalyzer_core::models::EngineKind;
    /// use sqlanalyzer_core::optimizer::QueryOptimizer;
    ///
    /// let paged = QueryOptimizer::add_pagination("SELECT * FROM users;", 10, 20, EngineKind::Postgres).unwrap();
    /// assert_eq!(paged, "SELECT * FROM users LIMIT 10 OFFSET 20");
    /// ```
    pub fn add_pagination(
        query: &str,
        page_size: u32,
        offset: u64,
        engine: EngineKind,
    ) -> Result<String> {
        if page_size == 0 || page_size > MAX_PAGE_SIZE {
            return Err(SqlAnalyzerError::invalid_input(format!(
                "page size must be between 1 and {}, got {}",
                MAX_PAGE_SIZE, page_size
            )));
        }

        let base = query.trim_end_matches(|c: char| c.is_whitespace() || c == ';');
        let paged = match engine {
            EngineKind::SqlServer => {
                let order = if OptimizerPatterns::instance().order_by.is_match(base) {
                    ""
                } else {
                    " ORDER BY 1"
                };
                format!(
                    "{}{} OFFSET {} ROWS FETCH NEXT {} ROWS ONLY",
                    base, order, offset, page_size
                )
            }
            EngineKind::Postgres => format!("{} LIMIT {} OFFSET {}", base, page_size, offset),
            EngineKind::MySql => format!("{} LIMIT {}, {}", base, offset, page_size),
        };
        Ok(paged)
    }

    /// Applies the read-only rewrites selected in `options`.
    ///
    /// # Errors
    /// Propagates pagination validation errors.
    pub fn optimize_for_read_only(
        query: &str,
        engine: EngineKind,
        options: &QueryOptimizationOptions,
    ) -> Result<String> {
        let mut optimized = if options.add_nolock {
            Self::add_nolock_hint(query, engine)
        } else {
            query.to_string()
        };
        if options.enable_pagination {
            optimized = Self::add_pagination(&optimized, options.page_size, options.offset, engine)?;
        }
        debug!(engine = %engine, changed = optimized != query, "Optimized read-only query");
        Ok(optimized)
    }

    /// Splits a list parameter into statements of at most `batch_size` values.
    ///
    /// Every occurrence of `@{parameter_name}` becomes
    /// `@{parameter_name}_0, @{parameter_name}_1, ...` for the batch's values.
    /// No values produce no batches.
    ///
    /// # Errors
    /// Returns `InvalidInput` for a zero batch size or an empty name.
    pub fn create_batched_query(
        query: &str,
        parameter_name: &str,
        values: &[ParamValue],
        batch_size: usize,
    ) -> Result<Vec<BatchedQuery>> {
        if batch_size == 0 {
            return Err(SqlAnalyzerError::invalid_input(
                "batch size must be greater than 0",
            ));
        }
        let name = parameter_name.trim().trim_start_matches('@');
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(SqlAnalyzerError::invalid_input(format!(
                "invalid parameter name '{}'",
                parameter_name
            )));
        }
        let placeholder = Regex::new(&format!(r"(?i)@{}\b", regex::escape(name)))
            .map_err(|e| SqlAnalyzerError::invalid_input(format!("invalid parameter name: {}", e)))?;

        let batches: Vec<BatchedQuery> = values
            .chunks(batch_size)
            .map(|chunk| {
                let names: Vec<String> = (0..chunk.len()).map(|i| format!("{}_{}", name, i)).collect();
                let list = names
                    .iter()
                    .map(|n| format!("@{}", n))
                    .collect::<Vec<_>>()
                    .join(", ");
                BatchedQuery {
                    query: placeholder
                        .replace_all(query, regex::NoExpand(list.as_str()))
                        .into_owned(),
                    parameters: names
                        .into_iter()
                        .zip(chunk.iter().cloned())
                        .map(|(n, v)| QueryParam::new(n, v))
                        .collect(),
                }
            })
            .collect();

        debug!(
            parameter = name,
            values = values.len(),
            batches = batches.len(),
            "Created batched query"
        );
        Ok(batches)
    }

    /// [`create_batched_query`](Self::create_batched_query) with the batch
    /// size capped at the engine's bind-parameter limit.
    ///
    /// # Errors
    /// Same as `create_batched_query`.
    pub fn create_batched_query_for_engine(
        query: &str,
        parameter_name: &str,
        values: &[ParamValue],
        batch_size: usize,
        engine: EngineKind,
    ) -> Result<Vec<BatchedQuery>> {
        Self::create_batched_query(
            query,
            parameter_name,
            values,
            batch_size.min(engine.max_parameters()),
        )
    }

    /// Rough relative cost of a statement, starting at 1.
    pub fn estimate_query_cost(query: &str) -> u32 {
        let p = OptimizerPatterns::instance();
        let count = |re: &Regex| u32::try_from(re.find_iter(query).count()).unwrap_or(u32::MAX);
        let flag = |re: &Regex, weight: u32| if re.is_match(query) { weight } else { 0 };

        1u32.saturating_add(count(&p.join).saturating_mul(2))
            .saturating_add(count(&p.subquery).saturating_mul(3))
            .saturating_add(flag(&p.group_by, 2))
            .saturating_add(flag(&p.having, 1))
            .saturating_add(flag(&p.order_by, 1))
            .saturating_add(flag(&p.distinct, 2))
            .saturating_add(flag(&p.leading_wildcard_like, 2))
    }

    /// Index suggestions for `table` derived from the query's predicates.
    ///
    /// Equality columns in `WHERE` yield a `CREATE INDEX` statement; join
    /// keys and `ORDER BY` columns yield `--` advisory comments.
    pub fn suggest_indexes(query: &str, table: &str) -> Vec<String> {
        let p = OptimizerPatterns::instance();
        let mut suggestions = Vec::new();

        if let Some(clause) = p.where_clause.captures(query).and_then(|c| c.get(1)) {
            let mut columns: Vec<&str> = Vec::new();
            for caps in p.equality_column.captures_iter(clause.as_str()) {
                let Some(column) = caps.get(1).map(|m| m.as_str()) else {
                    continue;
                };
                if column.chars().all(|c| c.is_ascii_digit())
                    || columns.iter().any(|c| c.eq_ignore_ascii_case(column))
                {
                    continue;
                }
                columns.push(column);
            }
            if !columns.is_empty() {
                suggestions.push(format!(
                    "CREATE INDEX IX_{}_{} ON {} ({})",
                    index_name_part(table),
                    columns.join("_"),
                    table,
                    columns.join(", ")
                ));
            }
        }

        if p.join.is_match(query) {
            for caps in p.join_keys.captures_iter(query) {
                if let (Some(left), Some(right)) = (caps.get(1), caps.get(2)) {
                    suggestions.push(format!(
                        "-- Consider index on {}.{} or {} for JOIN performance",
                        table,
                        left.as_str(),
                        right.as_str()
                    ));
                }
            }
        }

        if let Some(order) = p.order_by.find(query) {
            let tail = &query[order.end()..];
            let end = p.order_by_tail.find(tail).map_or(tail.len(), |m| m.start());
            let columns: Vec<&str> = tail[..end]
                .split(',')
                .filter_map(|item| item.split_whitespace().next())
                .filter(|c| !c.chars().all(|ch| ch.is_ascii_digit()))
                .collect();
            if !columns.is_empty() {
                suggestions.push(format!(
                    "-- Consider index on {} ({}) for ORDER BY performance",
                    table,
                    columns.join(", ")
                ));
            }
        }

        suggestions
    }
}

/// Rewrites one `FROM`/`JOIN` match, keeping any alias.
///
/// Returns the replacement and the offset where scanning resumes. A keyword
/// in the alias position is left unconsumed so a following `JOIN` is seen.
fn hint_target(query: &str, caps: &Captures<'_>) -> (String, usize) {
    let (Some(whole), Some(target)) = (caps.get(0), caps.get(2)) else {
        return (String::new(), query.len());
    };
    let table = &query[whole.start()..target.end()];
    let followed_by_call = |at: usize| query[at..].trim_start().starts_with('(');

    let Some(alias) = caps.get(5) else {
        if followed_by_call(whole.end()) {
            // Table-valued function call
            return (whole.as_str().to_string(), whole.end());
        }
        return (format!("{} WITH (NOLOCK)", table), whole.end());
    };

    let word = alias.as_str().to_ascii_uppercase();
    if word == "WITH" {
        // Already hinted
        (whole.as_str().to_string(), whole.end())
    } else if NON_ALIAS_KEYWORDS.contains(&word.as_str()) {
        (format!("{} WITH (NOLOCK)", table), target.end())
    } else {
        (format!("{} WITH (NOLOCK)", whole.as_str()), whole.end())
    }
}

/// Table name reduced to identifier characters for use in an index name.
fn index_name_part(table: &str) -> String {
    table
        .chars()
        .filter(|c| *c != '[' && *c != ']')
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nolock(query: &str) -> String {
        QueryOptimizer::add_nolock_hint(query, EngineKind::SqlServer)
    }

    #[test]
    fn test_nolock_single_table() {
        assert_eq!(nolock("SELECT * FROM Users"), "SELECT * FROM Users WITH (NOLOCK)");
        assert_eq!(
            nolock("SELECT * FROM [Sales].[Orders]"),
            "SELECT * FROM [Sales].[Orders] WITH (NOLOCK)"
        );
        assert_eq!(
            nolock("SELECT * FROM Sales.dbo.Orders WHERE Id = 1"),
            "SELECT * FROM Sales.dbo.Orders WITH (NOLOCK) WHERE Id = 1"
        );
    }

    #[test]
    fn test_nolock_keeps_aliases_and_joins() {
        let query = "SELECT u.Name, o.Total FROM Users u INNER JOIN Orders o ON u.Id = o.UserId";
        let hinted = nolock(query);
        assert_eq!(
            hinted,
            "SELECT u.Name, o.Total FROM Users u WITH (NOLOCK) INNER JOIN Orders o WITH (NOLOCK) ON u.Id = o.UserId"
        );

        assert_eq!(
            nolock("SELECT * FROM Users AS u WHERE u.Id = 1"),
            "SELECT * FROM Users AS u WITH (NOLOCK) WHERE u.Id = 1"
        );
    }

    #[test]
    fn test_nolock_keyword_is_not_alias() {
        assert_eq!(
            nolock("SELECT * FROM Users\nWHERE Active = 1"),
            "SELECT * FROM Users WITH (NOLOCK)\nWHERE Active = 1"
        );
        assert_eq!(
            nolock("SELECT * FROM a JOIN b ON a.Id = b.Id"),
            "SELECT * FROM a WITH (NOLOCK) JOIN b WITH (NOLOCK) ON a.Id = b.Id"
        );
    }

    #[test]
    fn test_nolock_unchanged_cases() {
        let hinted = "SELECT * FROM Users with (nolock)";
        assert_eq!(nolock(hinted), hinted);

        let sub = "SELECT * FROM (SELECT Id FROM Users) x";
        assert_eq!(
            nolock(sub),
            "SELECT * FROM (SELECT Id FROM Users WITH (NOLOCK)) x"
        );

        let tvf = "SELECT * FROM dbo.fn_Orders(@Id)";
        assert_eq!(nolock(tvf), tvf);

        let pg = "SELECT * FROM users";
        assert_eq!(QueryOptimizer::add_nolock_hint(pg, EngineKind::Postgres), pg);
        assert_eq!(QueryOptimizer::add_nolock_hint(pg, EngineKind::MySql), pg);
    }

    #[test]
    fn test_nolock_hints_every_comma_joined_source() {
        assert_eq!(
            nolock("SELECT * FROM t1, t2"),
            "SELECT * FROM t1 WITH (NOLOCK), t2 WITH (NOLOCK)"
        );
        assert_eq!(
            nolock("SELECT u.Id, o.Id FROM dbo.Users u, [Sales].[Orders] AS o , Items WHERE u.Id = o.UserId"),
            "SELECT u.Id, o.Id FROM dbo.Users u WITH (NOLOCK), [Sales].[Orders] AS o WITH (NOLOCK) , Items WITH (NOLOCK) WHERE u.Id = o.UserId"
        );
        // Commas outside the FROM list are not table sources
        assert_eq!(
            nolock("SELECT a, b FROM t ORDER BY a, b"),
            "SELECT a, b FROM t WITH (NOLOCK) ORDER BY a, b"
        );
    }

    #[test]
    fn test_nolock_existing_other_hint_is_left_alone() {
        let query = "SELECT * FROM Users WITH (UPDLOCK)";
        assert_eq!(nolock(query), query);
    }

    #[test]
    fn test_pagination_per_engine() {
        assert_eq!(
            QueryOptimizer::add_pagination("SELECT * FROM Users", 10, 0, EngineKind::SqlServer)
                .unwrap(),
            "SELECT * FROM Users ORDER BY 1 OFFSET 0 ROWS FETCH NEXT 10 ROWS ONLY"
        );
        assert_eq!(
            QueryOptimizer::add_pagination("SELECT * FROM Users", 10, 0, EngineKind::Postgres)
                .unwrap(),
            "SELECT * FROM Users LIMIT 10 OFFSET 0"
        );
        assert_eq!(
            QueryOptimizer::add_pagination("SELECT * FROM Users", 10, 0, EngineKind::MySql)
                .unwrap(),
            "SELECT * FROM Users LIMIT 0, 10"
        );
    }

    #[test]
    fn test_pagination_keeps_existing_order_and_trims() {
        assert_eq!(
            QueryOptimizer::add_pagination(
                "SELECT * FROM Users ORDER BY Name ;  \n",
                25,
                50,
                EngineKind::SqlServer
            )
            .unwrap(),
            "SELECT * FROM Users ORDER BY Name OFFSET 50 ROWS FETCH NEXT 25 ROWS ONLY"
        );
    }

    #[test]
    fn test_pagination_rejects_bad_page_size() {
        for size in [0, MAX_PAGE_SIZE + 1] {
            assert!(matches!(
                QueryOptimizer::add_pagination("SELECT 1", size, 0, EngineKind::Postgres),
                Err(SqlAnalyzerError::InvalidInput { .. })
            ));
        }
        assert!(QueryOptimizer::add_pagination("SELECT 1", MAX_PAGE_SIZE, 0, EngineKind::Postgres).is_ok());
    }

    #[test]
    fn test_optimize_for_read_only() {
        let options = QueryOptimizationOptions::default().with_pagination(100, 0);
        let optimized = QueryOptimizer::optimize_for_read_only(
            "SELECT * FROM Users",
            EngineKind::SqlServer,
            &options,
        )
        .unwrap();
        assert_eq!(
            optimized,
            "SELECT * FROM Users WITH (NOLOCK) ORDER BY 1 OFFSET 0 ROWS FETCH NEXT 100 ROWS ONLY"
        );

        let plain = QueryOptimizer::optimize_for_read_only(
            "SELECT * FROM Users",
            EngineKind::SqlServer,
            &QueryOptimizationOptions::default().with_nolock(false),
        )
        .unwrap();
        assert_eq!(plain, "SELECT * FROM Users");
    }

    #[test]
    fn test_batched_query_chunks() {
        let values: Vec<ParamValue> = (0..2500i64).map(ParamValue::from).collect();
        let batches = QueryOptimizer::create_batched_query(
            "SELECT * FROM Users WHERE Id IN (@Ids)",
            "@Ids",
            &values,
            DEFAULT_BATCH_SIZE,
        )
        .unwrap();

        let sizes: Vec<usize> = batches.iter().map(|b| b.parameters.len()).collect();
        assert_eq!(sizes, vec![1000, 1000, 500]);
        assert!(batches[0].query.starts_with("SELECT * FROM Users WHERE Id IN (@Ids_0, @Ids_1, "));
        assert!(batches[2].query.ends_with("@Ids_499)"));
        assert_eq!(batches[1].parameters[0].name, "Ids_0");
        assert_eq!(batches[1].parameters[0].value, ParamValue::from(1000i64));
    }

    #[test]
    fn test_batched_query_does_not_touch_longer_names() {
        let values = [ParamValue::from(1i64), ParamValue::from(2i64)];
        let batches = QueryOptimizer::create_batched_query(
            "SELECT * FROM t WHERE id IN (@ids) AND tenant = @idsTenant",
            "ids",
            &values,
            10,
        )
        .unwrap();
        assert_eq!(
            batches[0].query,
            "SELECT * FROM t WHERE id IN (@ids_0, @ids_1) AND tenant = @idsTenant"
        );
    }

    #[test]
    fn test_batched_query_validation() {
        let values = [ParamValue::from(1i64)];
        assert!(matches!(
            QueryOptimizer::create_batched_query("SELECT 1", "ids", &values, 0),
            Err(SqlAnalyzerError::InvalidInput { .. })
        ));
        assert!(QueryOptimizer::create_batched_query("SELECT 1", "@", &values, 1).is_err());
        assert!(
            QueryOptimizer::create_batched_query("SELECT 1", "ids", &[], 10)
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn test_batched_query_engine_cap() {
        let values: Vec<ParamValue> = (0..2200i64).map(ParamValue::from).collect();
        let batches = QueryOptimizer::create_batched_query_for_engine(
            "DELETE FROM t WHERE id IN (@ids)",
            "ids",
            &values,
            5000,
            EngineKind::SqlServer,
        )
        .unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].parameters.len(), EngineKind::SqlServer.max_parameters());
    }

    #[test]
    fn test_estimate_query_cost() {
        assert_eq!(QueryOptimizer::estimate_query_cost("SELECT * FROM Users"), 1);
        assert_eq!(
            QueryOptimizer::estimate_query_cost(
                "SELECT DISTINCT u.Name FROM Users u JOIN Orders o ON o.UserId = u.Id \
                 WHERE u.Name LIKE '%smith' GROUP BY u.Name HAVING COUNT(*) > 1 ORDER BY u.Name"
            ),
            1 + 2 + 2 + 2 + 1 + 1 + 2
        );
        assert_eq!(
            QueryOptimizer::estimate_query_cost(
                "SELECT * FROM Users WHERE Id IN (SELECT UserId FROM Orders)"
            ),
            4
        );
    }

    #[test]
    fn test_suggest_indexes_from_where() {
        let suggestions = QueryOptimizer::suggest_indexes(
            "SELECT * FROM Users WHERE Email = @Email AND IsActive = 1",
            "Users",
        );
        assert_eq!(suggestions.len(), 1);
        assert_eq!(
            suggestions[0],
            "CREATE INDEX IX_Users_Email_IsActive ON Users (Email, IsActive)"
        );
    }

    #[test]
    fn test_suggest_indexes_join_and_order() {
        let suggestions = QueryOptimizer::suggest_indexes(
            "SELECT * FROM Orders o JOIN Users u ON o.UserId = u.Id ORDER BY o.CreatedAt DESC, o.Id",
            "dbo.Orders",
        );
        assert_eq!(
            suggestions,
            vec![
                "-- Consider index on dbo.Orders.UserId or Id for JOIN performance".to_string(),
                "-- Consider index on dbo.Orders (o.CreatedAt, o.Id) for ORDER BY performance"
                    .to_string(),
            ]
        );
    }

    #[test]
    fn test_suggest_indexes_ignores_comparisons() {
        let suggestions = QueryOptimizer::suggest_indexes(
            "SELECT * FROM t WHERE a >= 1 AND b <> 2 AND 1 = 1",
            "t",
        );
        assert!(suggestions.is_empty());
    }
}
