// Indexer - read cache in front of the SQL accessor
//
// Results are keyed by a SHA-256 digest of the rendered statement and its
// parameters, so equivalent requests hit the same entry regardless of how
// their options were built. The cache lives until it is cleared, which the
// database does after any write goes through its manager.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use crate::accessors::sql::{SqlAccessor, Statement};
use crate::accessors::{QueryResult, SelectOptions};
use crate::components::SqlRelation;
use crate::error::{Co3Error, Result};
use crate::value::{group_key, Record};

/// Group value → rows sharing it
pub type GroupIndex = BTreeMap<String, Vec<Record>>;

#[derive(Debug, Clone)]
enum Cached {
    Rows(Arc<QueryResult>),
    Groups(Arc<GroupIndex>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    pub entries: usize,
}

#[derive(Debug)]
pub struct Indexer {
    accessor: SqlAccessor,
    cache: Mutex<HashMap<String, Cached>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl Indexer {
    pub fn new(accessor: SqlAccessor) -> Self {
        Indexer {
            accessor,
            cache: Mutex::new(HashMap::new()),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    fn cache(&self) -> Result<MutexGuard<'_, HashMap<String, Cached>>> {
        self.cache
            .lock()
            .map_err(|_| Co3Error::LockPoisoned("indexer cache"))
    }

    fn cache_key(kind: &str, stmt: &Statement, include_cols: bool) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(kind.as_bytes());
        hasher.update(stmt.sql.as_bytes());
        hasher.update(serde_json::to_vec(&stmt.params)?);
        hasher.update([u8::from(include_cols)]);
        Ok(format!("{:x}", hasher.finalize()))
    }

    fn lookup(&self, key: &str) -> Result<Option<Cached>> {
        let found = self.cache()?.get(key).cloned();
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        Ok(found)
    }

    /// Cached `SqlAccessor::select`
    pub fn select(&self, relation: &SqlRelation, opts: &SelectOptions) -> Result<Arc<QueryResult>> {
        let stmt = self.accessor.render_select(relation, opts)?;
        let key = Self::cache_key("select", &stmt, opts.include_cols)?;

        if let Some(Cached::Rows(result)) = self.lookup(&key)? {
            debug!("Index hit for select on {}", relation.name());
            return Ok(result);
        }

        let result = Arc::new(self.accessor.execute(&stmt, opts.include_cols)?);
        self.cache()?.insert(key, Cached::Rows(Arc::clone(&result)));
        Ok(result)
    }

    /// Select and group rows by the value of `column`
    ///
    /// `column` may be bare or qualified; rows where it is NULL are dropped.
    pub fn group_by(&self, relation: &SqlRelation, column: &str, opts: &SelectOptions) -> Result<Arc<GroupIndex>> {
        let target = relation.resolve(column)?;
        let labels = self.accessor.select_labels(relation, opts)?;
        let label = labels
            .into_iter()
            .find(|(col, _)| *col == target)
            .map(|(_, label)| label)
            .ok_or_else(|| Co3Error::UnknownColumn {
                relation: relation.name(),
                column: column.to_string(),
            })?;

        let stmt = self.accessor.render_select(relation, opts)?;
        let key = Self::cache_key(&format!("group_by:{}", label), &stmt, opts.include_cols)?;

        if let Some(Cached::Groups(groups)) = self.lookup(&key)? {
            debug!("Index hit for group_by {} on {}", label, relation.name());
            return Ok(groups);
        }

        let result = self.accessor.execute(&stmt, opts.include_cols)?;
        let mut groups = GroupIndex::new();
        for row in result.rows {
            let Some(value) = row.get(&label).filter(|v| !v.is_null()) else {
                continue;
            };
            groups.entry(group_key(value)).or_default().push(row);
        }

        let groups = Arc::new(groups);
        self.cache()?.insert(key, Cached::Groups(Arc::clone(&groups)));
        Ok(groups)
    }

    pub fn cache_clear(&self) -> Result<()> {
        let mut cache = self.cache()?;
        if !cache.is_empty() {
            debug!("Clearing {} index entries", cache.len());
        }
        cache.clear();
        Ok(())
    }

    pub fn stats(&self) -> Result<CacheStats> {
        Ok(CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.cache()?.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accessors::Filter;
    use crate::components::{Column, ColumnType, ComposableComponent, SqlTable};
    use rusqlite::Connection;
    use serde_json::json;

    fn setup() -> (Indexer, Arc<Mutex<Connection>>, SqlRelation) {
        let table = SqlTable::new("tomato")
            .column(Column::new("name", ColumnType::Text))
            .column(Column::new("color", ColumnType::Text));
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(&format!(
            "{};
             INSERT INTO tomato VALUES ('t1', 'red'), ('t2', 'red'), ('t3', 'green'), ('t4', NULL);",
            table.create_sql().unwrap()
        ))
        .unwrap();
        let conn = Arc::new(Mutex::new(conn));
        (Indexer::new(SqlAccessor::new(Arc::clone(&conn))), conn, table.lift())
    }

    #[test]
    fn test_select_is_cached_until_cleared() {
        let (indexer, conn, relation) = setup();
        let opts = SelectOptions::new();

        let first = indexer.select(&relation, &opts).unwrap();
        conn.lock()
            .unwrap()
            .execute("INSERT INTO tomato VALUES ('t5', 'red')", [])
            .unwrap();
        let second = indexer.select(&relation, &opts).unwrap();

        // stale until the cache is cleared
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.len(), 4);

        indexer.cache_clear().unwrap();
        let third = indexer.select(&relation, &opts).unwrap();
        assert_eq!(third.len(), 5);

        let stats = indexer.stats().unwrap();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn test_distinct_options_are_distinct_entries() {
        let (indexer, _, relation) = setup();

        let all = indexer.select(&relation, &SelectOptions::new()).unwrap();
        let red = indexer
            .select(&relation, &SelectOptions::new().filter(Filter::eq("color", json!("red"))))
            .unwrap();

        assert_eq!(all.len(), 4);
        assert_eq!(red.len(), 2);
        assert_eq!(indexer.stats().unwrap().entries, 2);
    }

    #[test]
    fn test_group_by() {
        let (indexer, _, relation) = setup();

        let groups = indexer
            .group_by(&relation, "color", &SelectOptions::new())
            .unwrap();

        assert_eq!(groups.len(), 2);
        assert_eq!(groups["red"].len(), 2);
        assert_eq!(groups["green"][0]["name"], json!("t3"));

        let again = indexer
            .group_by(&relation, "tomato.color", &SelectOptions::new())
            .unwrap();
        assert!(Arc::ptr_eq(&groups, &again));
    }

    #[test]
    fn test_group_by_column_not_selected() {
        let (indexer, _, relation) = setup();
        let result = indexer.group_by(&relation, "color", &SelectOptions::new().cols(["name"]));
        assert!(matches!(result, Err(Co3Error::UnknownColumn { .. })));
    }

    #[test]
    fn test_group_by_keeps_mixed_types_apart() {
        // BLOB affinity stores values as given
        let table = SqlTable::new("basket")
            .column(Column::new("name", ColumnType::Text))
            .column(Column::new("tag", ColumnType::Blob));
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(&format!(
            "{};
             INSERT INTO basket VALUES ('c1', 1), ('c2', '1'), ('c3', 1);",
            table.create_sql().unwrap()
        ))
        .unwrap();
        let indexer = Indexer::new(SqlAccessor::new(Arc::new(Mutex::new(conn))));

        let groups = indexer
            .group_by(&table.lift(), "tag", &SelectOptions::new())
            .unwrap();

        assert_eq!(groups.len(), 2);
        assert_eq!(groups["1"].len(), 2);
        assert_eq!(groups["\"1\""][0]["name"], json!("c2"));
    }
}
