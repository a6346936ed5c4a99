// Accessors - read-only access to a database
//
// Accessors render and run SELECTs. They never change database state, so
// their results can be cached (see `Indexer`).

pub mod fts;
pub mod sql;

use serde::{Deserialize, Serialize};

use crate::components::SqlRelation;
use crate::error::{Co3Error, Result};
use crate::value::{check_identifier, Record, Value};

pub use fts::{FtsAccessor, SearchOptions, SearchResults};
pub use sql::SqlAccessor;

// ============================================================================
// QUERY RESULTS
// ============================================================================

/// Rows keyed by column label, plus the label order when requested
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Record>,
}

impl QueryResult {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Values of one column across all rows
    pub fn column_values(&self, column: &str) -> Vec<&Value> {
        self.rows.iter().filter_map(|r| r.get(column)).collect()
    }
}

// ============================================================================
// FILTERS
// ============================================================================

/// WHERE clause tree; values are always bound as parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Filter {
    Eq(String, Value),
    Ne(String, Value),
    Lt(String, Value),
    Le(String, Value),
    Gt(String, Value),
    Ge(String, Value),
    Like(String, String),
    In(String, Vec<Value>),
    IsNull(String),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: Value) -> Self {
        Filter::Eq(column.into(), value)
    }

    pub fn is_in(column: impl Into<String>, values: Vec<Value>) -> Self {
        Filter::In(column.into(), values)
    }

    pub fn and(self, other: Filter) -> Self {
        match self {
            Filter::And(mut filters) => {
                filters.push(other);
                Filter::And(filters)
            }
            first => Filter::And(vec![first, other]),
        }
    }

    pub fn or(self, other: Filter) -> Self {
        match self {
            Filter::Or(mut filters) => {
                filters.push(other);
                Filter::Or(filters)
            }
            first => Filter::Or(vec![first, other]),
        }
    }

    pub fn negate(self) -> Self {
        Filter::Not(Box::new(self))
    }

    /// Render against `relation`, resolving column names through it
    pub fn to_sql(&self, relation: &SqlRelation, params: &mut Vec<Value>) -> Result<String> {
        self.render(&|name| relation.resolve(name)?.to_sql(), params)
    }

    /// Render with plain (unqualified) column identifiers
    pub fn to_sql_unqualified(&self, params: &mut Vec<Value>) -> Result<String> {
        self.render(&|name| Ok(check_identifier(name)?.to_string()), params)
    }

    fn render<F>(&self, column: &F, params: &mut Vec<Value>) -> Result<String>
    where
        F: Fn(&str) -> Result<String>,
    {
        match self {
            Filter::Eq(col, v) => compare(column, col, "=", v, params),
            Filter::Ne(col, v) => compare(column, col, "!=", v, params),
            Filter::Lt(col, v) => compare(column, col, "<", v, params),
            Filter::Le(col, v) => compare(column, col, "<=", v, params),
            Filter::Gt(col, v) => compare(column, col, ">", v, params),
            Filter::Ge(col, v) => compare(column, col, ">=", v, params),
            Filter::Like(col, pattern) => {
                compare(column, col, "LIKE", &Value::String(pattern.clone()), params)
            }
            Filter::In(col, values) => {
                if values.is_empty() {
                    // nothing can be IN an empty set
                    return Ok("0 = 1".to_string());
                }
                params.extend(values.iter().cloned());
                let marks = vec!["?"; values.len()].join(", ");
                Ok(format!("{} IN ({})", column(col)?, marks))
            }
            Filter::IsNull(col) => Ok(format!("{} IS NULL", column(col)?)),
            Filter::And(filters) => join_filters(filters, " AND ", column, params),
            Filter::Or(filters) => join_filters(filters, " OR ", column, params),
            Filter::Not(inner) => Ok(format!("NOT ({})", inner.render(column, params)?)),
        }
    }
}

fn compare<F>(column: &F, col: &str, op: &str, value: &Value, params: &mut Vec<Value>) -> Result<String>
where
    F: Fn(&str) -> Result<String>,
{
    let sql = format!("{} {} ?", column(col)?, op);
    params.push(value.clone());
    Ok(sql)
}

fn join_filters<F>(filters: &[Filter], sep: &str, column: &F, params: &mut Vec<Value>) -> Result<String>
where
    F: Fn(&str) -> Result<String>,
{
    if filters.is_empty() {
        return Ok("1 = 1".to_string());
    }
    let parts = filters
        .iter()
        .map(|f| Ok(format!("({})", f.render(column, params)?)))
        .collect::<Result<Vec<_>>>()?;
    Ok(parts.join(sep))
}

// ============================================================================
// SELECT OPTIONS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub column: String,
    #[serde(default)]
    pub descending: bool,
}

impl OrderBy {
    pub fn asc(column: impl Into<String>) -> Self {
        OrderBy {
            column: column.into(),
            descending: false,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        OrderBy {
            column: column.into(),
            descending: true,
        }
    }

    /// Parse `col`, `col asc` or `col desc`
    pub fn parse(clause: &str) -> Result<Self> {
        let mut parts = clause.split_whitespace();
        let column = parts
            .next()
            .ok_or_else(|| Co3Error::InvalidConfig(format!("empty order clause {:?}", clause)))?;
        match parts.next().map(str::to_ascii_lowercase).as_deref() {
            None | Some("asc") => Ok(OrderBy::asc(column)),
            Some("desc") => Ok(OrderBy::desc(column)),
            Some(other) => Err(Co3Error::InvalidConfig(format!(
                "unknown order direction {:?}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectOptions {
    /// Columns to select (`col` or `table.col`); every column when `None`
    pub cols: Option<Vec<String>>,
    pub filter: Option<Filter>,
    /// GROUP BY columns, used as a stand-in for DISTINCT ON
    pub distinct_on: Option<Vec<String>>,
    pub order_by: Vec<OrderBy>,
    /// Zero means no limit
    pub limit: usize,
    /// Return column labels alongside the rows
    pub include_cols: bool,
}

impl SelectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cols<S: Into<String>>(mut self, cols: impl IntoIterator<Item = S>) -> Self {
        self.cols = Some(cols.into_iter().map(Into::into).collect());
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn distinct_on<S: Into<String>>(mut self, cols: impl IntoIterator<Item = S>) -> Self {
        self.distinct_on = Some(cols.into_iter().map(Into::into).collect());
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn include_cols(mut self) -> Self {
        self.include_cols = true;
        self
    }
}

// ============================================================================
// ACCESSOR TRAIT
// ============================================================================

/// Read access to relation-shaped storage
pub trait RelationalAccessor {
    type Relation;

    /// Run a literal statement with positional parameters
    fn raw_select(&self, sql: &str, params: &[Value]) -> Result<QueryResult>;

    fn select(&self, relation: &Self::Relation, opts: &SelectOptions) -> Result<QueryResult>;

    /// First row of `select`, if any
    fn select_one(&self, relation: &Self::Relation, opts: &SelectOptions) -> Result<Option<Record>> {
        let opts = SelectOptions {
            limit: 1,
            ..opts.clone()
        };
        Ok(self.select(relation, &opts)?.rows.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::{Column, ColumnType, SqlTable};
    use serde_json::json;

    fn relation() -> SqlRelation {
        SqlTable::new("tomato")
            .column(Column::new("name", ColumnType::Text))
            .column(Column::new("radius", ColumnType::Integer))
            .into()
    }

    #[test]
    fn test_filter_renders_bound_params() {
        let filter = Filter::eq("name", json!("t1"))
            .and(Filter::Gt("radius".into(), json!(3)))
            .and(Filter::is_in("tomato.radius", vec![json!(4), json!(5)]).negate());

        let mut params = Vec::new();
        let sql = filter.to_sql(&relation(), &mut params).unwrap();

        assert_eq!(
            sql,
            "(tomato.name = ?) AND (tomato.radius > ?) AND (NOT (tomato.radius IN (?, ?)))"
        );
        assert_eq!(params, vec![json!("t1"), json!(3), json!(4), json!(5)]);
    }

    #[test]
    fn test_filter_unknown_column() {
        let mut params = Vec::new();
        let result = Filter::IsNull("color".into()).to_sql(&relation(), &mut params);
        assert!(matches!(result, Err(Co3Error::UnknownColumn { .. })));
    }

    #[test]
    fn test_filter_empty_in() {
        let mut params = Vec::new();
        let sql = Filter::is_in("name", vec![])
            .to_sql_unqualified(&mut params)
            .unwrap();
        assert_eq!(sql, "0 = 1");
        assert!(params.is_empty());
    }

    #[test]
    fn test_order_by_parse() {
        assert_eq!(OrderBy::parse("radius DESC").unwrap(), OrderBy::desc("radius"));
        assert_eq!(OrderBy::parse("name").unwrap(), OrderBy::asc("name"));
        assert!(OrderBy::parse("name sideways").is_err());
    }
}
