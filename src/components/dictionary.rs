// Key-value component
//
// The dictionary's own entries act as the heading (keys) and the defaults
// (values) for anything staged against it.

use serde::{Deserialize, Serialize};

use super::Component;
use crate::value::{Record, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dictionary {
    pub name: String,
    pub entries: Record,
}

impl Dictionary {
    pub fn new(name: impl Into<String>) -> Self {
        Dictionary {
            name: name.into(),
            entries: Record::new(),
        }
    }

    /// Builder: add a key with its default value
    pub fn key(mut self, key: impl Into<String>, default: Value) -> Self {
        self.entries.insert(key.into(), default);
        self
    }
}

impl Component for Dictionary {
    fn name(&self) -> &str {
        &self.name
    }

    fn attributes(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    fn prepare_insert(&self, record: &Record) -> Record {
        self.entries
            .iter()
            .map(|(key, default)| {
                let value = record.get(key).unwrap_or(default).clone();
                (key.clone(), value)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_prepare_insert_uses_entry_defaults() {
        let dict = Dictionary::new("settings")
            .key("theme", json!("light"))
            .key("size", json!(12));

        let record = crate::value::record([("size", json!(14)), ("extra", json!(true))]);
        let insert = dict.prepare_insert(&record);

        assert_eq!(insert.get("theme"), Some(&json!("light")));
        assert_eq!(insert.get("size"), Some(&json!(14)));
        assert!(!insert.contains_key("extra"));
        let mut keys = dict.attributes();
        keys.sort();
        assert_eq!(keys, vec!["size".to_string(), "theme".to_string()]);
    }
}
