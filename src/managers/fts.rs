// FTS manager - builds FTS5 search tables
//
// One virtual table is built per tokenizer, named `<name>_fts_<tokenizer>`,
// so `FtsAccessor` can pick the tokenizer at query time.

use rusqlite::{params_from_iter, Connection};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::info;

use crate::accessors::fts::fts_table_name;
use crate::accessors::{RelationalAccessor, SelectOptions, SqlAccessor};
use crate::components::SqlRelation;
use crate::error::{Co3Error, Result};
use crate::value::{check_identifier, to_sql, Record, Value};

pub const FTS_TOKENIZERS: [&str; 3] = ["unicode61", "porter", "trigram"];

#[derive(Debug)]
pub struct FtsManager {
    conn: Arc<Mutex<Connection>>,
    accessor: SqlAccessor,
}

/// FTS columns can't contain dots, so qualified labels become `table_column`
fn fts_column(label: &str) -> String {
    label.replace('.', "_")
}

impl FtsManager {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        FtsManager {
            accessor: SqlAccessor::new(Arc::clone(&conn)),
            conn,
        }
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Co3Error::LockPoisoned("connection"))
    }

    /// Rebuild the `name` search tables from a select over `source`
    ///
    /// Returns the number of rows indexed per tokenizer.
    pub fn recreate(
        &self,
        name: &str,
        source: &SqlRelation,
        opts: &SelectOptions,
        tokenizers: &[&str],
    ) -> Result<usize> {
        let start = Instant::now();
        let opts = SelectOptions {
            include_cols: true,
            ..opts.clone()
        };
        let result = self.accessor.select(source, &opts)?;
        info!(
            "FTS recreate: pre-index SELECT took {:.2}s",
            start.elapsed().as_secs_f64()
        );

        let rows: Vec<Record> = result
            .rows
            .into_iter()
            .map(|row| row.into_iter().map(|(k, v)| (fts_column(&k), v)).collect())
            .collect();
        let columns: Vec<String> = result.columns.iter().map(|c| fts_column(c)).collect();

        self.index_rows(name, &columns, &rows, tokenizers)
    }

    /// Build the `name` search tables from explicit rows
    ///
    /// Missing row keys are indexed as NULL.
    pub fn index_rows(&self, name: &str, columns: &[String], rows: &[Record], tokenizers: &[&str]) -> Result<usize> {
        let cols = columns
            .iter()
            .map(|c| check_identifier(c))
            .collect::<Result<Vec<_>>>()?
            .join(", ");
        if cols.is_empty() {
            return Err(Co3Error::InvalidConfig(format!("no columns to index for \"{}\"", name)));
        }
        // a flattened `table.column` label can collide with a real `table_column`
        let mut seen = HashSet::new();
        if let Some(dup) = columns.iter().find(|c| !seen.insert(c.as_str())) {
            return Err(Co3Error::InvalidConfig(format!(
                "duplicate column \"{}\" in search index \"{}\"",
                dup, name
            )));
        }

        let mut conn = self.conn()?;
        for tokenizer in tokenizers {
            let start = Instant::now();
            let fts_table = fts_table_name(name, tokenizer)?;

            let tx = conn.transaction()?;
            tx.execute(&format!("DROP TABLE IF EXISTS {}", fts_table), [])?;
            tx.execute(
                &format!(
                    "CREATE VIRTUAL TABLE {} USING fts5 ({}, tokenize = '{}')",
                    fts_table, cols, tokenizer
                ),
                [],
            )?;

            {
                let mut stmt = tx.prepare(&format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    fts_table,
                    cols,
                    vec!["?"; columns.len()].join(", ")
                ))?;
                for row in rows {
                    let values = columns
                        .iter()
                        .map(|c| to_sql(row.get(c).unwrap_or(&Value::Null)));
                    stmt.execute(params_from_iter(values))?;
                }
            }
            tx.commit()?;

            info!(
                "Created FTS5 index for table \"{}+{}\"; took {:.2}s",
                name,
                tokenizer,
                start.elapsed().as_secs_f64()
            );
        }

        Ok(rows.len())
    }
}
