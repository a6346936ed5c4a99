// co3 - COllate, COllect, COmpose
// Object mapping over SQLite: library used by the CLI, the API server and tests

pub mod accessors;
pub mod co3;
pub mod collector;
pub mod components;
pub mod composer;
pub mod config;
pub mod database;
pub mod error;
pub mod indexer;
pub mod managers;
pub mod mapper;
pub mod schema;
pub mod value;

// Re-export commonly used types
pub use accessors::{
    Filter, FtsAccessor, OrderBy, QueryResult, RelationalAccessor,
    SearchOptions, SearchResults, SelectOptions, SqlAccessor,
};
pub use co3::{serialized_attributes, Co3, CollationRegistry, TypeMeta};
pub use collector::{Collector, Inserts, Receipt};
pub use components::{
    Column, ColumnRef, ColumnType, Component, ComposableComponent, Dictionary,
    ForeignKey, ForeignKeyAction, JoinOn, SqlRelation, SqlTable,
};
pub use composer::Composer;
pub use config::{DatabaseConfig, InsertConflict, SyncOptions};
pub use database::{SqlDatabase, SqliteDatabase};
pub use error::{Co3Error, Result};
pub use indexer::{CacheStats, GroupIndex, Indexer};
pub use managers::{
    FtsManager, Manager, MigrationReport, SqlManager, SyncReport, FTS_TOKENIZERS,
};
pub use mapper::{ComponentRef, ComposableMapper, Mapper};
pub use schema::{CompositionDefinition, JoinDefinition, Schema, SchemaDefinition, SqlSchema};
pub use value::{record, Record, Value};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
