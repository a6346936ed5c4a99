// SQL manager - schema creation, bulk inserts and migrations
//
// Unique columns are declared `ON CONFLICT REPLACE`, so re-inserting a known
// object replaces its row instead of failing the transaction.

use rusqlite::{params_from_iter, Connection};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::{info, warn};

use super::{Manager, MigrationReport};
use crate::accessors::{RelationalAccessor, SqlAccessor};
use crate::collector::Inserts;
use crate::components::{Component, SqlTable};
use crate::config::InsertConflict;
use crate::error::{Co3Error, Result};
use crate::schema::SqlSchema;
use crate::value::{check_identifier, to_sql, Record};

#[derive(Debug)]
pub struct SqlManager {
    conn: Arc<Mutex<Connection>>,
    accessor: SqlAccessor,
    insert_lock: Mutex<()>,
    conflict: InsertConflict,
}

impl SqlManager {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        SqlManager {
            accessor: SqlAccessor::new(Arc::clone(&conn)),
            conn,
            insert_lock: Mutex::new(()),
            conflict: InsertConflict::default(),
        }
    }

    pub fn with_conflict(mut self, conflict: InsertConflict) -> Self {
        self.conflict = conflict;
        self
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Co3Error::LockPoisoned("connection"))
    }
}

fn insert_row(conn: &Connection, table: &SqlTable, row: &Record, conflict: InsertConflict) -> Result<usize> {
    let mut cols = Vec::new();
    let mut values = Vec::new();
    for (key, value) in row {
        // stray keys are ignored, as with a bulk insert
        if table.get_column(key).is_some() {
            cols.push(check_identifier(key)?);
            values.push(to_sql(value));
        }
    }

    let table_name = check_identifier(&table.name)?;
    let sql = if cols.is_empty() {
        format!("{} INTO {} DEFAULT VALUES", conflict.insert_verb(), table_name)
    } else {
        format!(
            "{} INTO {} ({}) VALUES ({})",
            conflict.insert_verb(),
            table_name,
            cols.join(", "),
            vec!["?"; cols.len()].join(", ")
        )
    };

    let mut stmt = conn.prepare_cached(&sql)?;
    Ok(stmt.execute(params_from_iter(values))?)
}

/// Drop and create every table of the schema on an open transaction
fn rebuild_tables(conn: &Connection, schema: &SqlSchema) -> Result<()> {
    let drops = schema.drop_statements()?;
    let creates = schema.create_statements()?;
    for sql in drops.iter().chain(&creates) {
        conn.execute(sql, [])?;
    }
    Ok(())
}

/// Write inserts on an open transaction, parents first
fn insert_rows(conn: &Connection, schema: &SqlSchema, inserts: &Inserts, conflict: InsertConflict) -> Result<usize> {
    let mut inserted = 0;
    // keys are usually deferred anyway
    for table in schema.create_order()? {
        let Some(rows) = inserts.get(table.name()).filter(|rows| !rows.is_empty()) else {
            continue;
        };

        info!("Inserting {} entries into table \"{}\"", rows.len(), table.name);
        for row in rows {
            inserted += insert_row(conn, table, row, conflict)?;
        }
    }
    Ok(inserted)
}

impl Manager<SqlTable> for SqlManager {
    fn recreate(&self, schema: &SqlSchema) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        rebuild_tables(&tx, schema)?;
        tx.commit()?;

        info!("Recreated schema \"{}\" ({} tables)", schema.name(), schema.len());
        Ok(())
    }

    fn insert(&self, schema: &SqlSchema, inserts: &Inserts) -> Result<usize> {
        let total: usize = inserts.values().map(Vec::len).sum();
        if total == 0 {
            return Ok(0);
        }

        info!("Total of {} sync inserts to perform", total);
        for name in inserts.keys() {
            if schema.get_component(name).is_none() {
                warn!("Skipping inserts for table \"{}\" outside schema \"{}\"", name, schema.name());
            }
        }

        let start = Instant::now();
        let _guard = self
            .insert_lock
            .lock()
            .map_err(|_| Co3Error::LockPoisoned("insert lock"))?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let inserted = insert_rows(&tx, schema, inserts, self.conflict)?;
        tx.commit()?;
        info!(
            "Insert transaction completed successfully in {:.2}s",
            start.elapsed().as_secs_f64()
        );

        Ok(inserted)
    }

    fn migrate(&self, schema: &SqlSchema) -> Result<MigrationReport> {
        // snapshot the current state of every table the schema knows about
        let existing: HashSet<String> = self.accessor.table_names()?.into_iter().collect();
        let mut preserved = Inserts::new();
        for table in schema.components() {
            if !existing.contains(&table.name) {
                continue;
            }
            let sql = format!("SELECT * FROM {}", check_identifier(&table.name)?);
            let rows = self.accessor.raw_select(&sql, &[])?.rows;
            preserved.insert(
                table.name.clone(),
                rows.iter().map(|row| table.prepare_insert(row)).collect(),
            );
        }

        let mut report = MigrationReport::default();
        for (name, rows) in &preserved {
            info!("Migrating table \"{}\" ({} rows)", name, rows.len());
            report.tables.insert(name.clone(), rows.len());
        }

        // drops, creates and re-inserts commit together or not at all
        let _guard = self
            .insert_lock
            .lock()
            .map_err(|_| Co3Error::LockPoisoned("insert lock"))?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        rebuild_tables(&tx, schema)?;
        insert_rows(&tx, schema, &preserved, self.conflict)?;
        tx.commit()?;

        info!("Migrated schema \"{}\" ({} rows kept)", schema.name(), report.total());
        Ok(report)
    }
}
