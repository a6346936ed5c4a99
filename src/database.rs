// Database - protocol-specific entry point
//
// The database wraps up the objects used to interact with storage: an
// accessor for reads, a manager for writes, an indexer caching reads and a
// composer holding named compositions. Going through `manage()` marks the
// indexer stale and wipes the database-local cache.

use rusqlite::Connection;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::accessors::{FtsAccessor, QueryResult, RelationalAccessor, SelectOptions, SqlAccessor};
use crate::collector::Inserts;
use crate::components::SqlRelation;
use crate::composer::Composer;
use crate::config::DatabaseConfig;
use crate::error::{Co3Error, Result};
use crate::indexer::Indexer;
use crate::managers::{FtsManager, Manager, SqlManager};
use crate::schema::{SchemaDefinition, SqlSchema};
use crate::value::Value;

pub struct SqlDatabase {
    conn: Arc<Mutex<Connection>>,
    config: DatabaseConfig,
    accessor: SqlAccessor,
    fts_accessor: FtsAccessor,
    manager: SqlManager,
    fts_manager: FtsManager,
    indexer: Indexer,
    composer: Composer<SqlRelation>,
    local_cache: HashMap<String, Value>,
    reset_cache: bool,
}

/// The default (and only) SQL backend
pub type SqliteDatabase = SqlDatabase;

impl SqlDatabase {
    /// Open (creating if needed) the database described by `config`
    pub fn open(config: DatabaseConfig) -> Result<Self> {
        config.validate()?;

        let conn = if config.is_memory() {
            Connection::open_in_memory()?
        } else {
            Connection::open(&config.path)?
        };
        configure(&conn, &config)?;

        info!("Opened database at {}", config.path.display());
        let compositions = config.compositions.clone();
        let mut db = Self::from_connection(conn, config);
        if let Some(path) = compositions {
            db.register_compositions(&SchemaDefinition::load(&path)?)?;
        }
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open(DatabaseConfig::in_memory())
    }

    fn from_connection(conn: Connection, config: DatabaseConfig) -> Self {
        let conn = Arc::new(Mutex::new(conn));
        let accessor = SqlAccessor::new(Arc::clone(&conn));

        SqlDatabase {
            fts_accessor: FtsAccessor::new(Arc::clone(&conn)),
            manager: SqlManager::new(Arc::clone(&conn)).with_conflict(config.insert_conflict),
            fts_manager: FtsManager::new(Arc::clone(&conn)),
            indexer: Indexer::new(accessor.clone()),
            composer: Composer::new(),
            local_cache: HashMap::new(),
            reset_cache: false,
            accessor,
            config,
            conn,
        }
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn access(&self) -> &SqlAccessor {
        &self.accessor
    }

    pub fn fts(&self) -> &FtsAccessor {
        &self.fts_accessor
    }

    /// Manager for writes; invalidates the indexer and the local cache
    pub fn manage(&mut self) -> &SqlManager {
        self.invalidate();
        &self.manager
    }

    /// FTS manager; invalidates like `manage`
    pub fn manage_fts(&mut self) -> &FtsManager {
        self.invalidate();
        &self.fts_manager
    }

    fn invalidate(&mut self) {
        self.reset_cache = true;
        self.local_cache.clear();
    }

    /// Indexer, cleared first if a write happened since the last access
    pub fn index(&mut self) -> Result<&Indexer> {
        if self.reset_cache {
            self.indexer.cache_clear()?;
            self.reset_cache = false;
        }
        Ok(&self.indexer)
    }

    pub fn compose(&self) -> &Composer<SqlRelation> {
        &self.composer
    }

    pub fn compose_mut(&mut self) -> &mut Composer<SqlRelation> {
        &mut self.composer
    }

    /// Build and register every composition named in `def`
    pub fn register_compositions(&mut self, def: &SchemaDefinition) -> Result<usize> {
        let schema = SqlSchema::from_definition(def.clone());
        for composition in &def.compositions {
            let relation = composition.build(&schema)?;
            self.composer.register_table(composition.name.clone(), relation);
        }
        info!("Registered {} compositions from \"{}\"", def.compositions.len(), def.name);
        Ok(def.compositions.len())
    }

    /// Relation to read `name` from
    ///
    /// Named compositions shadow live tables; anything else is reflected
    /// from the database.
    pub fn relation(&self, name: &str) -> Result<SqlRelation> {
        match self.composer.get_table(name) {
            Some(relation) => Ok(relation.clone()),
            None => Ok(self.accessor.reflect_table(name)?.into()),
        }
    }

    /// Store for ad-hoc derived values that aren't plain query results
    ///
    /// Wiped whenever the manager is accessed.
    pub fn local_cache(&mut self) -> &mut HashMap<String, Value> {
        &mut self.local_cache
    }

    pub fn recreate(&mut self, schema: &SqlSchema) -> Result<()> {
        self.manage().recreate(schema)
    }

    pub fn insert(&mut self, schema: &SqlSchema, inserts: &Inserts) -> Result<usize> {
        self.manage().insert(schema, inserts)
    }

    pub fn select(&self, relation: &SqlRelation, opts: &SelectOptions) -> Result<QueryResult> {
        self.accessor.select(relation, opts)
    }

    /// Run `f` with the raw connection, for anything the accessors don't cover
    pub fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|_| Co3Error::LockPoisoned("connection"))?;
        f(&conn)
    }
}

fn configure(conn: &Connection, config: &DatabaseConfig) -> Result<()> {
    if !config.is_memory() {
        // WAL for crash recovery
        let mode: String = conn.pragma_update_and_check(None, "journal_mode", &config.journal_mode, |row| row.get(0))?;
        debug!("journal_mode = {}", mode);
    }
    conn.pragma_update(None, "foreign_keys", config.foreign_keys)?;
    conn.busy_timeout(std::time::Duration::from_millis(config.busy_timeout_ms))?;
    Ok(())
}
