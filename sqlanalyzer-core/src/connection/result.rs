//! Engine-neutral query results.
//!
//! Rows hold `serde_json::Value`s so every driver maps onto one shape. The
//! typed accessors coerce across the representations engines disagree on:
//! SQL Server `BIT` arrives as a bool, MySQL `TINYINT(1)` as an integer and
//! aggregated sizes sometimes as strings.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One result row keyed by column name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryRow {
    values: Map<String, Value>,
}

impl From<Map<String, Value>> for QueryRow {
    fn from(values: Map<String, Value>) -> Self {
        Self { values }
    }
}

impl QueryRow {
    /// Raw value for a column, matched exactly first, then case-insensitively.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column).or_else(|| {
            self.values
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(column))
                .map(|(_, value)| value)
        })
    }

    /// Integer view of a column.
    pub fn get_i64(&self, column: &str) -> Option<i64> {
        match self.get(column)? {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_u64().and_then(|u| i64::try_from(u).ok()))
                .or_else(|| n.as_f64().map(|f| f as i64)),
            Value::Bool(b) => Some(i64::from(*b)),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .ok()
                .or_else(|| s.trim().parse::<f64>().ok().map(|f| f as i64)),
            _ => None,
        }
    }

    /// Floating point view of a column.
    pub fn get_f64(&self, column: &str) -> Option<f64> {
        match self.get(column)? {
            Value::Number(n) => n.as_f64(),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    /// Boolean view of a column (`1`, `true`, `yes` and `y` are true).
    pub fn get_bool(&self, column: &str) -> Option<bool> {
        match self.get(column)? {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => n.as_f64().map(|f| f != 0.0),
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "1" | "true" | "yes" | "y" | "t" => Some(true),
                "0" | "false" | "no" | "n" | "f" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Borrowed string view; only string values qualify.
    pub fn get_str(&self, column: &str) -> Option<&str> {
        self.get(column)?.as_str()
    }

    /// Owned string rendering of any non-null value.
    pub fn get_string(&self, column: &str) -> Option<String> {
        match self.get(column)? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Iterates over `(column, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    /// Number of columns in the row.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True for a row without columns.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Rows returned by one statement, with column names in select order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Column names in the order the server returned them
    pub columns: Vec<String>,
    /// Result rows
    pub rows: Vec<QueryRow>,
}

impl QueryResult {
    /// Builds a result from column names and positional values per row.
    ///
    /// Empty column names become `column{n}` and repeated names get a
    /// positional suffix so that no value is lost.
    pub fn from_positional(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        let columns = unique_column_names(columns);
        let rows = rows
            .into_iter()
            .map(|values| {
                let map: Map<String, Value> = columns.iter().cloned().zip(values).collect();
                QueryRow::from(map)
            })
            .collect();
        Self { columns, rows }
    }

    /// First column of the first row, `Null` when there is none.
    pub fn scalar(&self) -> Value {
        self.rows
            .first()
            .zip(self.columns.first())
            .and_then(|(row, column)| row.get(column).cloned())
            .unwrap_or(Value::Null)
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True when the statement returned no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

fn unique_column_names(columns: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    columns
        .into_iter()
        .enumerate()
        .map(|(i, name)| {
            let base = if name.is_empty() {
                format!("column{}", i + 1)
            } else {
                name
            };
            let unique = if seen.contains(&base) {
                format!("{}_{}", base, i + 1)
            } else {
                base
            };
            seen.insert(unique.clone());
            unique
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> QueryResult {
        QueryResult::from_positional(
            vec!["id".into(), "active".into(), "size".into(), "name".into()],
            vec![vec![json!(7), json!(1), json!("12.5"), json!("orders")]],
        )
    }

    #[test]
    fn test_coercing_accessors() {
        let result = sample();
        let row = &result.rows[0];

        assert_eq!(row.get_i64("id"), Some(7));
        assert_eq!(row.get_bool("active"), Some(true));
        assert_eq!(row.get_f64("size"), Some(12.5));
        assert_eq!(row.get_i64("size"), Some(12));
        assert_eq!(row.get_str("name"), Some("orders"));
        assert_eq!(row.get_str("id"), None);
        assert_eq!(row.get_string("id"), Some("7".to_string()));
        assert_eq!(row.get_i64("missing"), None);
    }

    #[test]
    fn test_case_insensitive_lookup() {
        let result = sample();
        assert_eq!(result.rows[0].get_i64("ID"), Some(7));
    }

    #[test]
    fn test_scalar() {
        assert_eq!(sample().scalar(), json!(7));
        assert_eq!(QueryResult::default().scalar(), Value::Null);
    }

    #[test]
    fn test_unnamed_and_duplicate_columns_are_kept() {
        let result = QueryResult::from_positional(
            vec![String::new(), "a".into(), "a".into()],
            vec![vec![json!(1), json!(2), json!(3)]],
        );

        assert_eq!(result.columns, vec!["column1", "a", "a_3"]);
        assert_eq!(result.rows[0].len(), 3);
        assert_eq!(result.scalar(), json!(1));
    }
}
