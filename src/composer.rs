// Composer - named compositions outside the natural type hierarchy
//
// `ComposableMapper::compose` covers joins that follow a type's lineage. When
// a different composite is wanted (e.g. two sibling types side by side), it
// is built by hand and registered here under a name.

use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct Composer<R> {
    table_map: BTreeMap<String, R>,
}

impl<R> Default for Composer<R> {
    fn default() -> Self {
        Composer {
            table_map: BTreeMap::new(),
        }
    }
}

impl<R> Composer<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a named composition
    pub fn register_table(&mut self, name: impl Into<String>, composition: R) {
        self.table_map.insert(name.into(), composition);
    }

    /// Register the result of a builder, named after the given key
    pub fn register_with<F>(&mut self, name: impl Into<String>, build: F)
    where
        F: FnOnce() -> R,
    {
        self.register_table(name, build());
    }

    pub fn get_table(&self, name: &str) -> Option<&R> {
        self.table_map.get(name)
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.table_map.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::{Column, ColumnType, ComposableComponent, JoinOn, SqlRelation, SqlTable};

    #[test]
    fn test_register_and_get_table() {
        let b = SqlTable::new("b").column(Column::new("name", ColumnType::Text));
        let c = SqlTable::new("c").column(Column::new("name", ColumnType::Text));

        let mut composer: Composer<SqlRelation> = Composer::new();
        composer.register_with("BC", || {
            SqlTable::compose(b.lift(), &c, JoinOn::eq(b.c("name"), c.c("name")), true)
        });

        let bc = composer.get_table("BC").unwrap();
        assert_eq!(bc.tables().len(), 2);
        assert!(composer.get_table("AB").is_none());
        assert_eq!(composer.table_names(), vec!["BC"]);
    }
}
