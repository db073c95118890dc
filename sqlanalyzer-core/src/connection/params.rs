//! Named query parameters and their per-engine placeholder rewriting.
//!
//! Callers write `@name` placeholders once; [`bind_parameters`] rewrites them
//! into the engine's positional form and returns the values in bind order.
//! Text inside string literals, quoted identifiers and comments is copied
//! verbatim, as are `@@system` variables and `@names` with no matching
//! parameter.

use super::engine::PlaceholderStyle;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Scalar value bound to a query parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// SQL `NULL`
    Null,
    /// Boolean
    Bool(bool),
    /// 64-bit integer
    Int(i64),
    /// Double precision float
    Float(f64),
    /// Text
    Text(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(x) => write!(f, "{}", x),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for ParamValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl<T: Into<Self>> From<Option<T>> for ParamValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Named parameter; the name is written without the leading `@`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryParam {
    /// Parameter name, matched case-insensitively
    pub name: String,
    /// Bound value
    pub value: ParamValue,
}

impl QueryParam {
    /// Creates a parameter, stripping a leading `@` from the name.
    ///
    /// # Example
    /// ```rust
    /// use sqlanalyzer_core::connection::{ParamValue, QueryParam};
    ///
    /// let param = QueryParam::new("@schema", "dbo");
    /// assert_eq!(param.name, "schema");
    /// assert_eq!(param.value, ParamValue::Text("dbo".to_string()));
    /// ```
    pub fn new(name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        let name = name.into();
        Self {
            name: name.trim_start_matches('@').to_string(),
            value: value.into(),
        }
    }
}

/// Query text rewritten for one engine plus its values in bind order.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundQuery {
    /// SQL with positional placeholders
    pub sql: String,
    /// Values, one per positional placeholder (repeats included for `?`)
    pub values: Vec<ParamValue>,
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Copies a quoted region starting at `chars[start]` (the opening quote)
/// and returns the index just past the closing quote.
fn copy_quoted(chars: &[char], start: usize, close: char, out: &mut String) -> usize {
    out.push(chars[start]);
    let mut i = start + 1;
    while i < chars.len() {
        out.push(chars[i]);
        if chars[i] == close {
            // Doubled quote is an escaped quote
            if i + 1 < chars.len() && chars[i + 1] == close && close != ']' {
                out.push(chars[i + 1]);
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    i
}

/// Length of a comment starting at `i`, or 0 when no comment starts there.
fn comment_len(chars: &[char], i: usize) -> usize {
    match (chars.get(i), chars.get(i + 1)) {
        (Some('-'), Some('-')) => chars[i..]
            .iter()
            .position(|c| *c == '\n')
            .unwrap_or(chars.len() - i),
        (Some('/'), Some('*')) => {
            let mut j = i + 2;
            while j + 1 < chars.len() {
                if chars[j] == '*' && chars[j + 1] == '/' {
                    return j + 2 - i;
                }
                j += 1;
            }
            chars.len() - i
        }
        _ => 0,
    }
}

/// Rewrites `@name` placeholders for an engine.
///
/// Each distinct parameter gets one positional slot for `$n` and `@Pn`
/// styles; `?` repeats the value at every occurrence.
///
/// # Example
/// ```rust
/// use sqlanalyzer_core::connection::{bind_parameters, PlaceholderStyle, QueryParam};
///
/// let params = [QueryParam::new("id", 7i64)];
/// let bound = bind_parameters("SELECT * FROM t WHERE id = @id OR parent = @id", &params, PlaceholderStyle::Dollar);
/// assert_eq!(bound.sql, "SELECT * FROM t WHERE id = $1 OR parent = $1");
/// assert_eq!(bound.values.len(), 1);
/// ```
pub fn bind_parameters(sql: &str, params: &[QueryParam], style: PlaceholderStyle) -> BoundQuery {
    if params.is_empty() {
        return BoundQuery {
            sql: sql.to_string(),
            values: Vec::new(),
        };
    }

    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut values: Vec<ParamValue> = Vec::new();
    // Parameter index -> positional slot, for the numbered styles
    let mut slots: Vec<Option<usize>> = vec![None; params.len()];
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        let comment = comment_len(&chars, i);
        if comment > 0 {
            out.extend(&chars[i..i + comment]);
            i += comment;
            continue;
        }

        match c {
            '\'' | '"' | '`' => {
                i = copy_quoted(&chars, i, c, &mut out);
            }
            '[' => {
                i = copy_quoted(&chars, i, ']', &mut out);
            }
            '@' if chars.get(i + 1) == Some(&'@') => {
                // System variable: copy `@@name` untouched
                out.push_str("@@");
                i += 2;
                while i < chars.len() && is_ident_char(chars[i]) {
                    out.push(chars[i]);
                    i += 1;
                }
            }
            '@' => {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && is_ident_char(chars[end]) {
                    end += 1;
                }
                let name: String = chars[start..end].iter().collect();
                let found = (end > start)
                    .then(|| params.iter().position(|p| p.name.eq_ignore_ascii_case(&name)))
                    .flatten();

                match found {
                    Some(index) => {
                        match style {
                            PlaceholderStyle::Question => {
                                values.push(params[index].value.clone());
                                out.push('?');
                            }
                            PlaceholderStyle::Dollar | PlaceholderStyle::AtP => {
                                let slot = *slots[index].get_or_insert_with(|| {
                                    values.push(params[index].value.clone());
                                    values.len()
                                });
                                if style == PlaceholderStyle::Dollar {
                                    out.push_str(&format!("${}", slot));
                                } else {
                                    out.push_str(&format!("@P{}", slot));
                                }
                            }
                        }
                        i = end;
                    }
                    None => {
                        out.push('@');
                        i += 1;
                    }
                }
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    BoundQuery { sql: out, values }
}

/// Splits a batch on top-level `;`, ignoring separators inside quotes and
/// comments. Empty statements are dropped.
pub fn split_statements(sql: &str) -> Vec<String> {
    let chars: Vec<char> = sql.chars().collect();
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut i = 0;

    while i < chars.len() {
        let comment = comment_len(&chars, i);
        if comment > 0 {
            current.extend(&chars[i..i + comment]);
            i += comment;
            continue;
        }

        match chars[i] {
            quote @ ('\'' | '"' | '`') => {
                i = copy_quoted(&chars, i, quote, &mut current);
            }
            ';' => {
                let statement = current.trim();
                if !statement.is_empty() {
                    statements.push(statement.to_string());
                }
                current.clear();
                i += 1;
            }
            c => {
                current.push(c);
                i += 1;
            }
        }
    }

    let tail = current.trim();
    if !tail.is_empty() {
        statements.push(tail.to_string());
    }
    statements
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> Vec<QueryParam> {
        vec![
            QueryParam::new("schema", "sales"),
            QueryParam::new("@minRows", 1000i64),
        ]
    }

    #[test]
    fn test_dollar_style_numbers_distinct_names() {
        let bound = bind_parameters(
            "SELECT * FROM t WHERE s = @schema AND r > @minRows AND s2 = @SCHEMA",
            &params(),
            PlaceholderStyle::Dollar,
        );

        assert_eq!(
            bound.sql,
            "SELECT * FROM t WHERE s = $1 AND r > $2 AND s2 = $1"
        );
        assert_eq!(
            bound.values,
            vec![ParamValue::Text("sales".into()), ParamValue::Int(1000)]
        );
    }

    #[test]
    fn test_question_style_repeats_values() {
        let bound = bind_parameters(
            "SELECT * FROM t WHERE s = @schema OR s = @schema",
            &params(),
            PlaceholderStyle::Question,
        );

        assert_eq!(bound.sql, "SELECT * FROM t WHERE s = ? OR s = ?");
        assert_eq!(bound.values.len(), 2);
    }

    #[test]
    fn test_at_p_style() {
        let bound = bind_parameters(
            "EXEC dbo.report @minRows, @schema",
            &params(),
            PlaceholderStyle::AtP,
        );

        assert_eq!(bound.sql, "EXEC dbo.report @P1, @P2");
        assert_eq!(bound.values[0], ParamValue::Int(1000));
    }

    #[test]
    fn test_system_variables_and_unknown_names_untouched() {
        let bound = bind_parameters(
            "SELECT @@version_comment, @unknown, @schema",
            &params(),
            PlaceholderStyle::Question,
        );

        assert_eq!(bound.sql, "SELECT @@version_comment, @unknown, ?");
        assert_eq!(bound.values.len(), 1);
    }

    #[test]
    fn test_literals_and_comments_untouched() {
        let bound = bind_parameters(
            "SELECT '@schema', \"@schema\", [@schema] -- @schema\n, @schema /* @schema */",
            &params(),
            PlaceholderStyle::Dollar,
        );

        assert_eq!(
            bound.sql,
            "SELECT '@schema', \"@schema\", [@schema] -- @schema\n, $1 /* @schema */"
        );
    }

    #[test]
    fn test_escaped_quotes_inside_literals() {
        let bound = bind_parameters(
            "SELECT 'it''s @schema' AS x, @schema",
            &params(),
            PlaceholderStyle::Dollar,
        );
        assert_eq!(bound.sql, "SELECT 'it''s @schema' AS x, $1");
    }

    #[test]
    fn test_no_params_is_identity() {
        let sql = "SELECT @x";
        assert_eq!(bind_parameters(sql, &[], PlaceholderStyle::AtP).sql, sql);
    }

    #[test]
    fn test_split_statements() {
        let statements =
            split_statements("SELECT 1; SELECT ';' AS semi;\n-- trailing; comment\nSELECT 3;;");

        assert_eq!(
            statements,
            vec![
                "SELECT 1".to_string(),
                "SELECT ';' AS semi".to_string(),
                "-- trailing; comment\nSELECT 3".to_string(),
            ]
        );
    }

    #[test]
    fn test_param_value_conversions() {
        assert_eq!(ParamValue::from(None::<i64>), ParamValue::Null);
        assert_eq!(ParamValue::from(Some("x")), ParamValue::Text("x".into()));
        assert_eq!(ParamValue::from(3i32), ParamValue::Int(3));
        assert_eq!(ParamValue::Float(1.5).to_string(), "1.5");
    }
}
