// SQL accessor - SELECTs over tables and join trees

use rusqlite::{params_from_iter, Connection};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{QueryResult, RelationalAccessor, SelectOptions};
use crate::components::{label_columns, Column, ColumnRef, ColumnType, SqlRelation, SqlTable};
use crate::error::{Co3Error, Result};
use crate::value::{check_identifier, row_to_record, to_sql, Value};

/// A rendered statement and its positional parameters
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SqlAccessor {
    conn: Arc<Mutex<Connection>>,
}

impl SqlAccessor {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        SqlAccessor { conn }
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Co3Error::LockPoisoned("connection"))
    }

    /// Selected columns with their output labels
    pub fn select_labels(&self, relation: &SqlRelation, opts: &SelectOptions) -> Result<Vec<(ColumnRef, String)>> {
        match &opts.cols {
            None => Ok(relation.labels()),
            Some(cols) => {
                let refs = cols
                    .iter()
                    .map(|c| relation.resolve(c))
                    .collect::<Result<Vec<_>>>()?;
                Ok(label_columns(refs))
            }
        }
    }

    /// Render the SELECT for `relation` without running it
    pub fn render_select(&self, relation: &SqlRelation, opts: &SelectOptions) -> Result<Statement> {
        let labels = self.select_labels(relation, opts)?;
        let select_list = labels
            .iter()
            .map(|(col, label)| Ok(format!("{} AS \"{}\"", col.to_sql()?, label)))
            .collect::<Result<Vec<_>>>()?;

        let mut sql = format!("SELECT {} FROM {}", select_list.join(", "), relation.from_sql()?);
        let mut params = Vec::new();

        if let Some(filter) = &opts.filter {
            sql.push_str(" WHERE ");
            sql.push_str(&filter.to_sql(relation, &mut params)?);
        }

        if let Some(distinct_on) = &opts.distinct_on {
            let group_cols = distinct_on
                .iter()
                .map(|c| relation.resolve(c)?.to_sql())
                .collect::<Result<Vec<_>>>()?;
            if !group_cols.is_empty() {
                sql.push_str(" GROUP BY ");
                sql.push_str(&group_cols.join(", "));
            }
        }

        if !opts.order_by.is_empty() {
            let order = opts
                .order_by
                .iter()
                .map(|o| {
                    let dir = if o.descending { "DESC" } else { "ASC" };
                    Ok(format!("{} {}", relation.resolve(&o.column)?.to_sql()?, dir))
                })
                .collect::<Result<Vec<_>>>()?;
            sql.push_str(" ORDER BY ");
            sql.push_str(&order.join(", "));
        }

        if opts.limit > 0 {
            sql.push_str(&format!(" LIMIT {}", opts.limit));
        }

        Ok(Statement {
            sql,
            params,
            labels: labels.into_iter().map(|(_, label)| label).collect(),
        })
    }

    /// Run a rendered statement, keying rows by its labels
    pub fn execute(&self, stmt: &Statement, include_cols: bool) -> Result<QueryResult> {
        let conn = self.conn()?;
        let mut prepared = conn.prepare(&stmt.sql)?;

        let rows = prepared
            .query_map(params_from_iter(stmt.params.iter().map(to_sql)), |row| {
                row_to_record(row, &stmt.labels)
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(QueryResult {
            columns: if include_cols { stmt.labels.clone() } else { Vec::new() },
            rows,
        })
    }

    /// User tables currently in the database (FTS shadow tables excluded)
    pub fn table_names(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
               AND name NOT IN (
                   SELECT m.name || suffix FROM sqlite_master m,
                   (SELECT '_data' AS suffix UNION SELECT '_idx' UNION SELECT '_content'
                    UNION SELECT '_docsize' UNION SELECT '_config')
                   WHERE m.sql LIKE 'CREATE VIRTUAL TABLE%'
               )
             ORDER BY name",
        )?;

        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;

        Ok(names)
    }

    /// Column names of a live table, in declaration order
    pub fn table_columns(&self, table: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", check_identifier(table)?))?;

        let columns = stmt
            .query_map([], |row| row.get(1))?
            .collect::<std::result::Result<Vec<String>, _>>()?;

        Ok(columns)
    }

    /// Rebuild a table component from the live database
    ///
    /// Declared types are mapped by SQLite affinity rules. Defaults and
    /// foreign keys aren't recovered; the result is meant for reads.
    pub fn reflect_table(&self, table: &str) -> Result<SqlTable> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", check_identifier(table)?))?;

        let columns = stmt
            .query_map([], |row| {
                let name: String = row.get(1)?;
                let declared: String = row.get(2)?;
                let not_null: bool = row.get(3)?;
                let pk: i64 = row.get(5)?;

                let mut column = Column::new(name, affinity(&declared));
                if pk > 0 {
                    column = column.primary_key();
                } else if not_null {
                    column = column.not_null();
                }
                Ok(column)
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        if columns.is_empty() {
            return Err(Co3Error::TableNotFound(table.to_string()));
        }
        Ok(columns.into_iter().fold(SqlTable::new(table), SqlTable::column))
    }
}

fn affinity(declared: &str) -> ColumnType {
    let declared = declared.to_uppercase();
    match declared.as_str() {
        "BOOLEAN" => ColumnType::Boolean,
        "JSON" => ColumnType::Json,
        d if d.contains("INT") => ColumnType::Integer,
        d if d.contains("CHAR") || d.contains("CLOB") || d.contains("TEXT") => ColumnType::Text,
        "" => ColumnType::Blob,
        d if d.contains("BLOB") => ColumnType::Blob,
        _ => ColumnType::Real,
    }
}

impl RelationalAccessor for SqlAccessor {
    type Relation = SqlRelation;

    fn raw_select(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

        let rows = stmt
            .query_map(params_from_iter(params.iter().map(to_sql)), |row| {
                row_to_record(row, &columns)
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(QueryResult { columns, rows })
    }

    fn select(&self, relation: &SqlRelation, opts: &SelectOptions) -> Result<QueryResult> {
        let stmt = self.render_select(relation, opts)?;
        self.execute(&stmt, opts.include_cols)
    }
}
