// FTS accessor - search over FTS5 tables built by `FtsManager`
//
// FTS tables follow the `<name>_fts_<tokenizer>` naming scheme. Results carry
// every selected column plus a `snippet` and a `highlight` for the match.
// GROUP BY can't be combined with the FTS auxiliary functions, so grouping is
// done on the result set after the query.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use super::sql::SqlAccessor;
use super::{Filter, QueryResult, RelationalAccessor};
use crate::error::Result;
use crate::value::{check_identifier, group_key, Record, Value};

const HL_START: &str = "<b><mark>";
const HL_END: &str = "</mark></b>";

/// SQLite caps snippet length at 64 tokens
const MAX_SNIPPET_TOKENS: usize = 64;

pub fn fts_table_name(table: &str, tokenizer: &str) -> Result<String> {
    Ok(format!(
        "{}_fts_{}",
        check_identifier(table)?,
        check_identifier(tokenizer)?
    ))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchOptions {
    /// Base name of the FTS table (without the `_fts_<tokenizer>` suffix)
    pub table: String,
    /// Columns to return; every column when empty
    pub select_cols: Vec<String>,
    /// Space separated columns the primary query is restricted to
    pub search_cols: Option<String>,
    pub q: Option<String>,
    /// Extra column constraint in FTS5 syntax, e.g. `color:red`
    pub colq: Option<String>,
    pub snip_col: usize,
    pub hl_col: usize,
    pub limit: usize,
    pub snip: usize,
    pub tokenizer: String,
    pub group_by: Option<String>,
    pub agg_cols: Vec<String>,
    /// Column → allowed values, matched with `WHERE ... IN`
    pub where_in: BTreeMap<String, Vec<Value>>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        SearchOptions {
            table: String::new(),
            select_cols: Vec::new(),
            search_cols: None,
            q: None,
            colq: None,
            snip_col: 0,
            hl_col: 0,
            limit: 100,
            snip: MAX_SNIPPET_TOKENS,
            tokenizer: "unicode61".to_string(),
            group_by: None,
            agg_cols: Vec::new(),
            where_in: BTreeMap::new(),
        }
    }
}

impl SearchOptions {
    pub fn new(table: impl Into<String>) -> Self {
        SearchOptions {
            table: table.into(),
            ..Self::default()
        }
    }

    /// Combined MATCH expression, empty when there is nothing to match
    pub fn match_expr(&self) -> String {
        let mut expr = String::new();
        if let (Some(cols), Some(q)) = (&self.search_cols, &self.q) {
            expr = format!("{{{}}} : {}", cols, q);
        } else if let Some(q) = &self.q {
            expr = q.clone();
        }
        if let Some(colq) = &self.colq {
            expr.push(' ');
            expr.push_str(colq);
        }
        expr.trim().to_string()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchResults {
    pub columns: Vec<String>,
    pub rows: Vec<Record>,
    /// Group value → first row of the group, with `<col>_agg` sets attached
    pub groups: Option<BTreeMap<String, Record>>,
    pub num_results: usize,
}

#[derive(Debug, Clone)]
pub struct FtsAccessor {
    sql: SqlAccessor,
}

impl FtsAccessor {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        FtsAccessor {
            sql: SqlAccessor::new(conn),
        }
    }

    /// Render the search statement and its parameters
    pub fn render_search(&self, opts: &SearchOptions) -> Result<(String, Vec<Value>)> {
        let fts_table = fts_table_name(&opts.table, &opts.tokenizer)?;

        let select_cols = if opts.select_cols.is_empty() {
            "*".to_string()
        } else {
            opts.select_cols
                .iter()
                .map(|c| check_identifier(c).map(str::to_string))
                .collect::<Result<Vec<_>>>()?
                .join(", ")
        };

        let mut sql = format!(
            "SELECT {cols}, \
             snippet({t}, {snip_col}, '{hs}', '{he}', '...', {snip}) AS snippet, \
             highlight({t}, {hl_col}, '{hs}', '{he}') AS highlight \
             FROM {t}",
            cols = select_cols,
            t = fts_table,
            snip_col = opts.snip_col,
            hl_col = opts.hl_col,
            snip = opts.snip.clamp(1, MAX_SNIPPET_TOKENS),
            hs = HL_START,
            he = HL_END,
        );

        let mut params = Vec::new();
        let mut where_clauses = Vec::new();

        let expr = opts.match_expr();
        if !expr.is_empty() {
            where_clauses.push(format!("{} MATCH ?", fts_table));
            params.push(Value::String(expr));
        }

        for (col, values) in &opts.where_in {
            let filter = Filter::In(col.clone(), values.clone());
            where_clauses.push(filter.to_sql_unqualified(&mut params)?);
        }

        if !where_clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&where_clauses.join(" AND "));
        }

        sql.push_str(&format!(" ORDER BY rank LIMIT {}", opts.limit));

        Ok((sql, params))
    }

    pub fn search(&self, opts: &SearchOptions) -> Result<SearchResults> {
        let (sql, params) = self.render_search(opts)?;
        let QueryResult { columns, rows } = self.sql.raw_select(&sql, &params)?;
        let num_results = rows.len();

        let groups = opts
            .group_by
            .as_deref()
            .map(|group_by| group_rows(&rows, group_by, &opts.agg_cols));

        Ok(SearchResults {
            columns,
            rows,
            groups,
            num_results,
        })
    }
}

/// Keep the first row per group value, collecting distinct `agg_cols`
/// values across the group into `<col>_agg`
fn group_rows(rows: &[Record], group_by: &str, agg_cols: &[String]) -> BTreeMap<String, Record> {
    let mut groups: BTreeMap<String, (Record, Vec<Vec<Value>>)> = BTreeMap::new();

    for row in rows {
        let key = match row.get(group_by) {
            None | Some(Value::Null) => continue,
            Some(value) => group_key(value),
        };

        let (_, aggs) = groups
            .entry(key)
            .or_insert_with(|| (row.clone(), vec![Vec::new(); agg_cols.len()]));

        for (agg, col) in aggs.iter_mut().zip(agg_cols) {
            if let Some(value) = row.get(col) {
                if !agg.contains(value) {
                    agg.push(value.clone());
                }
            }
        }
    }

    groups
        .into_iter()
        .map(|(key, (mut row, aggs))| {
            for (col, values) in agg_cols.iter().zip(aggs) {
                row.insert(format!("{}_agg", col), Value::Array(values));
            }
            (key, row)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn accessor() -> FtsAccessor {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE VIRTUAL TABLE produce_fts_unicode61 USING fts5 (name, note, kind, tokenize = 'unicode61');
             INSERT INTO produce_fts_unicode61 (name, note, kind) VALUES
                 ('t1', 'a ripe red tomato', 'tomato'),
                 ('t2', 'a green tomato, not ripe yet', 'tomato'),
                 ('c1', 'crunchy orange carrot', 'carrot');",
        )
        .unwrap();
        FtsAccessor::new(Arc::new(Mutex::new(conn)))
    }

    #[test]
    fn test_match_expr() {
        let mut opts = SearchOptions::new("produce");
        assert_eq!(opts.match_expr(), "");

        opts.search_cols = Some("note".to_string());
        opts.q = Some("ripe".to_string());
        opts.colq = Some("kind:tomato".to_string());
        assert_eq!(opts.match_expr(), "{note} : ripe kind:tomato");
    }

    #[test]
    fn test_search_with_snippet_and_highlight() {
        let opts = SearchOptions {
            search_cols: Some("note".to_string()),
            q: Some("ripe".to_string()),
            snip_col: 1,
            hl_col: 1,
            ..SearchOptions::new("produce")
        };

        let results = accessor().search(&opts).unwrap();

        assert_eq!(results.num_results, 2);
        assert!(results.columns.contains(&"snippet".to_string()));
        let highlight = results.rows[0]["highlight"].as_str().unwrap();
        assert!(highlight.contains("<b><mark>ripe</mark></b>"));
        assert!(results.groups.is_none());
    }

    #[test]
    fn test_search_where_in_filters() {
        let mut opts = SearchOptions::new("produce");
        opts.select_cols = vec!["name".to_string()];
        opts.where_in.insert("name".to_string(), vec![json!("c1"), json!("t2")]);

        let results = accessor().search(&opts).unwrap();

        let mut names: Vec<&Value> = results.rows.iter().map(|r| &r["name"]).collect();
        names.sort_by_key(|v| v.to_string());
        assert_eq!(names, vec![&json!("c1"), &json!("t2")]);
    }

    #[test]
    fn test_search_group_by_aggregates() {
        let opts = SearchOptions {
            group_by: Some("kind".to_string()),
            agg_cols: vec!["name".to_string()],
            ..SearchOptions::new("produce")
        };

        let results = accessor().search(&opts).unwrap();
        let groups = results.groups.unwrap();

        assert_eq!(results.num_results, 3);
        assert_eq!(groups.len(), 2);
        let tomato_names = groups["tomato"]["name_agg"].as_array().unwrap();
        assert_eq!(tomato_names.len(), 2);
        assert_eq!(groups["carrot"]["name_agg"], json!(["c1"]));
    }

    #[test]
    fn test_invalid_table_name_rejected() {
        let opts = SearchOptions::new("produce; DROP TABLE x");
        assert!(accessor().render_search(&opts).is_err());
    }
}
