// Configuration for databases and sync runs
//
// Environment variables (all optional):
//   CO3_DB_PATH          database file (":memory:" for an in-memory database)
//   CO3_JOURNAL_MODE     SQLite journal mode, WAL by default
//   CO3_FOREIGN_KEYS     enforce foreign keys (true/false)
//   CO3_BUSY_TIMEOUT_MS  how long to wait on a locked database
//   CO3_INSERT_CONFLICT  abort | replace | ignore
//   CO3_SCHEMA           schema definition whose compositions are registered on open

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Co3Error, Result};

pub const MEMORY_PATH: &str = ":memory:";

const JOURNAL_MODES: &[&str] = &["DELETE", "TRUNCATE", "PERSIST", "MEMORY", "WAL", "OFF"];

/// What an INSERT does when it hits a constraint not handled by the column
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InsertConflict {
    #[default]
    Abort,
    Replace,
    Ignore,
}

impl InsertConflict {
    pub fn insert_verb(&self) -> &'static str {
        match self {
            InsertConflict::Abort => "INSERT",
            InsertConflict::Replace => "INSERT OR REPLACE",
            InsertConflict::Ignore => "INSERT OR IGNORE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "abort" => Some(InsertConflict::Abort),
            "replace" => Some(InsertConflict::Replace),
            "ignore" => Some(InsertConflict::Ignore),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub journal_mode: String,
    pub foreign_keys: bool,
    pub busy_timeout_ms: u64,
    pub insert_conflict: InsertConflict,
    /// Schema definition file; its named compositions are registered on open
    pub compositions: Option<PathBuf>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("co3.db"),
            journal_mode: "WAL".to_string(),
            foreign_keys: true,
            busy_timeout_ms: 5000,
            insert_conflict: InsertConflict::Abort,
            compositions: None,
        }
    }
}

impl DatabaseConfig {
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn in_memory() -> Self {
        Self::with_path(MEMORY_PATH)
    }

    pub fn is_memory(&self) -> bool {
        self.path.as_os_str() == MEMORY_PATH
    }

    /// Defaults overridden by `CO3_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like `from_env`, reading variables through `lookup`; values that
    /// don't parse are ignored
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(val) = lookup("CO3_DB_PATH") {
            config.path = PathBuf::from(val);
        }

        if let Some(val) = lookup("CO3_JOURNAL_MODE") {
            config.journal_mode = val.to_uppercase();
        }

        if let Some(val) = lookup("CO3_FOREIGN_KEYS") {
            config.foreign_keys = matches!(val.to_lowercase().as_str(), "true" | "1" | "yes" | "on");
        }

        if let Some(val) = lookup("CO3_BUSY_TIMEOUT_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                config.busy_timeout_ms = ms;
            }
        }

        if let Some(conflict) = lookup("CO3_INSERT_CONFLICT").as_deref().and_then(InsertConflict::parse) {
            config.insert_conflict = conflict;
        }

        if let Some(val) = lookup("CO3_SCHEMA") {
            config.compositions = Some(PathBuf::from(val));
        }

        config
    }

    pub fn validate(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Err(Co3Error::InvalidConfig("database path is empty".to_string()));
        }
        if !JOURNAL_MODES.contains(&self.journal_mode.to_uppercase().as_str()) {
            return Err(Co3Error::InvalidConfig(format!(
                "unknown journal mode {:?}",
                self.journal_mode
            )));
        }
        Ok(())
    }
}

/// Options for `Manager::sync`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncOptions {
    /// Maximum number of objects to sync; zero means all
    pub limit: usize,
    /// Target seconds per chunk; zero or less syncs everything in one chunk
    pub chunk_time: f64,
    /// Upper bound on the adaptive chunk size
    pub chunk_size_cap: usize,
    /// Collect inserts without writing them
    pub dry: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            limit: 0,
            chunk_time: 0.0,
            chunk_size_cap: 1000,
            dry: false,
        }
    }
}

impl SyncOptions {
    /// Chunk size that should take about `chunk_time` seconds
    pub fn chunk_size(&self, sec_per_item: f64) -> usize {
        let cap = self.chunk_size_cap.max(1);
        let estimate = self.chunk_time / sec_per_item.max(f64::EPSILON);
        if !estimate.is_finite() || estimate >= cap as f64 {
            cap
        } else {
            (estimate as usize).clamp(1, cap)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = DatabaseConfig::default();
        assert_eq!(config.journal_mode, "WAL");
        assert!(config.foreign_keys);
        assert!(config.validate().is_ok());
        assert!(DatabaseConfig::in_memory().is_memory());
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("CO3_DB_PATH", "/tmp/veg.db"),
            ("CO3_JOURNAL_MODE", "delete"),
            ("CO3_FOREIGN_KEYS", "off"),
            ("CO3_BUSY_TIMEOUT_MS", "not-a-number"),
            ("CO3_INSERT_CONFLICT", "Replace"),
            ("CO3_SCHEMA", "veg.json"),
        ]
        .into_iter()
        .collect();

        let config = DatabaseConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.path, PathBuf::from("/tmp/veg.db"));
        assert_eq!(config.journal_mode, "DELETE");
        assert!(!config.foreign_keys);
        assert_eq!(config.busy_timeout_ms, 5000);
        assert_eq!(config.compositions, Some(PathBuf::from("veg.json")));
        assert_eq!(config.insert_conflict, InsertConflict::Replace);
    }

    #[test]
    fn test_validate_rejects_bad_journal_mode() {
        let config = DatabaseConfig {
            journal_mode: "SIDEWAYS".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Co3Error::InvalidConfig(_))));
    }

    #[test]
    fn test_deserialize_partial() {
        let config: DatabaseConfig = serde_json::from_str(r#"{"path": "x.db", "insert_conflict": "ignore"}"#).unwrap();
        assert_eq!(config.insert_conflict, InsertConflict::Ignore);
        assert_eq!(config.busy_timeout_ms, 5000);
    }

    #[test]
    fn test_chunk_size() {
        let opts = SyncOptions {
            chunk_time: 2.0,
            chunk_size_cap: 100,
            ..Default::default()
        };
        assert_eq!(opts.chunk_size(0.5), 4);
        assert_eq!(opts.chunk_size(10.0), 1);
        assert_eq!(opts.chunk_size(0.0), 100);
        assert_eq!(opts.chunk_size(0.001), 100);
    }
}
