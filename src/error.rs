// Error types shared across the library
// Binaries wrap these in anyhow with context

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Co3Error {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A component was referenced by name but the schema has no such component
    #[error("Component key \"{0}\" not available in attached schema")]
    ComponentNotFound(String),

    /// A component value was passed that was never added to the schema
    #[error("Component \"{component}\" not registered to schema \"{schema}\"")]
    ComponentNotInSchema { component: String, schema: String },

    #[error("Type \"{0}\" is not attached to this mapper")]
    UnknownType(String),

    #[error("Invalid SQL identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("Table \"{0}\" not found in database")]
    TableNotFound(String),

    #[error("Column \"{column}\" not found in relation \"{relation}\"")]
    UnknownColumn { relation: String, column: String },

    #[error("Foreign key cycle detected involving table \"{0}\"")]
    ForeignKeyCycle(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

pub type Result<T> = std::result::Result<T, Co3Error>;
