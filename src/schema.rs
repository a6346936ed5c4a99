// Schema - collection of related storage components
//
// Schemas semantically group components, tell databases what to create or
// remove together, and provide the attachment targets for mappers.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::components::{Component, ComposableComponent, JoinOn, SqlRelation, SqlTable};
use crate::error::{Co3Error, Result};

#[derive(Debug, Clone)]
pub struct Schema<C: Component> {
    name: String,
    components: Vec<C>,
    index: HashMap<String, usize>,
}

impl<C: Component> Schema<C> {
    pub fn new(name: impl Into<String>) -> Self {
        Schema {
            name: name.into(),
            components: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a component; a component with the same name is replaced in place
    pub fn add_component(&mut self, component: C) {
        match self.index.get(component.name()) {
            Some(&idx) => self.components[idx] = component,
            None => {
                self.index
                    .insert(component.name().to_string(), self.components.len());
                self.components.push(component);
            }
        }
    }

    /// Builder form of `add_component`
    pub fn with_component(mut self, component: C) -> Self {
        self.add_component(component);
        self
    }

    pub fn get_component(&self, name: &str) -> Option<&C> {
        self.index.get(name).map(|&idx| &self.components[idx])
    }

    /// Components in insertion order
    pub fn components(&self) -> &[C] {
        &self.components
    }

    pub fn names(&self) -> Vec<&str> {
        self.components.iter().map(|c| c.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Whether this exact component (not just its name) belongs to the schema
    pub fn contains(&self, component: &C) -> bool {
        self.get_component(component.name()) == Some(component)
    }
}

// ============================================================================
// SQL SCHEMAS
// ============================================================================

pub type SqlSchema = Schema<SqlTable>;

/// Serialized form of a SQL schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaDefinition {
    pub name: String,
    pub tables: Vec<SqlTable>,
    /// Named joins a database registers with its composer
    #[serde(default)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub compositions: Vec<CompositionDefinition>,
}

impl SchemaDefinition {
    /// Read a definition from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// A named join over the definition's tables
///
/// ```json
/// {"name": "produce", "base": "vegetable",
///  "joins": [{"table": "tomato", "on": [["vegetable.name", "tomato.name"]], "outer": true}]}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositionDefinition {
    pub name: String,
    pub base: String,
    #[serde(default)]
    pub joins: Vec<JoinDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinDefinition {
    pub table: String,
    /// Column pairs compared for equality, left side first
    pub on: Vec<(String, String)>,
    #[serde(default)]
    pub outer: bool,
}

impl CompositionDefinition {
    /// Resolve table and column names against `schema` and build the join
    pub fn build(&self, schema: &SqlSchema) -> Result<SqlRelation> {
        let table = |name: &str| {
            schema
                .get_component(name)
                .ok_or_else(|| Co3Error::TableNotFound(name.to_string()))
        };

        let mut relation = table(&self.base)?.lift();
        for join in &self.joins {
            let right = table(&join.table)?;
            if join.on.is_empty() {
                return Err(Co3Error::InvalidConfig(format!(
                    "join on \"{}\" in composition \"{}\" has no columns",
                    join.table, self.name
                )));
            }
            let right_relation = right.lift();
            let on = join
                .on
                .iter()
                .map(|(l, r)| Ok((relation.resolve(l)?, right_relation.resolve(r)?)))
                .collect::<Result<Vec<_>>>()?;
            relation = relation.join(right, JoinOn(on), join.outer);
        }
        Ok(relation)
    }
}

impl Schema<SqlTable> {
    pub fn from_tables(name: impl Into<String>, tables: impl IntoIterator<Item = SqlTable>) -> Self {
        let mut schema = Schema::new(name);
        for table in tables {
            schema.add_component(table);
        }
        schema
    }

    pub fn from_definition(def: SchemaDefinition) -> Self {
        let tables = def.tables.into_iter().map(|mut table| {
            // keys are NOT NULL whatever the definition says
            for column in table.columns.iter_mut().filter(|c| c.primary_key) {
                column.nullable = false;
            }
            table
        });
        Schema::from_tables(def.name, tables)
    }

    pub fn to_definition(&self) -> SchemaDefinition {
        SchemaDefinition {
            name: self.name.clone(),
            tables: self.components.clone(),
            compositions: Vec::new(),
        }
    }

    /// Load a schema definition from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        Ok(Schema::from_definition(SchemaDefinition::load(path)?))
    }

    /// Tables ordered so every table follows the tables it references
    ///
    /// References to tables outside the schema are ignored. Ties keep
    /// insertion order.
    pub fn create_order(&self) -> Result<Vec<&SqlTable>> {
        let mut ordered: Vec<&SqlTable> = Vec::with_capacity(self.components.len());
        let mut placed: HashSet<&str> = HashSet::new();

        while ordered.len() < self.components.len() {
            let next = self.components.iter().find(|table| {
                !placed.contains(table.name.as_str())
                    && table
                        .dependencies()
                        .iter()
                        .all(|dep| placed.contains(dep) || self.get_component(dep).is_none())
            });

            match next {
                Some(table) => {
                    placed.insert(&table.name);
                    ordered.push(table);
                }
                None => {
                    let stuck = self
                        .components
                        .iter()
                        .find(|t| !placed.contains(t.name.as_str()))
                        .map(|t| t.name.clone())
                        .unwrap_or_default();
                    return Err(Co3Error::ForeignKeyCycle(stuck));
                }
            }
        }

        Ok(ordered)
    }

    pub fn create_statements(&self) -> Result<Vec<String>> {
        self.create_order()?
            .into_iter()
            .map(SqlTable::create_sql)
            .collect()
    }

    /// Children are dropped before the tables they reference
    pub fn drop_statements(&self) -> Result<Vec<String>> {
        self.create_order()?
            .into_iter()
            .rev()
            .map(SqlTable::drop_sql)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::{Column, ColumnType, Dictionary, ForeignKey};
    use serde_json::json;

    fn table(name: &str, parent: Option<&str>) -> SqlTable {
        let mut name_col = Column::new("name", ColumnType::Text).unique();
        if let Some(parent) = parent {
            name_col = name_col.references(ForeignKey::deferred_cascade(parent, "name"));
        }
        SqlTable::new(name)
            .column(Column::new("id", ColumnType::Integer).primary_key())
            .column(name_col)
    }

    #[test]
    fn test_add_and_get_component() {
        let schema = Schema::new("kv")
            .with_component(Dictionary::new("a"))
            .with_component(Dictionary::new("b"));

        assert_eq!(schema.len(), 2);
        assert!(schema.get_component("a").is_some());
        assert!(schema.get_component("c").is_none());
        assert_eq!(schema.names(), vec!["a", "b"]);
    }

    #[test]
    fn test_contains_checks_identity_not_just_name() {
        let schema = Schema::new("kv").with_component(Dictionary::new("a").key("x", json!(1)));

        assert!(schema.contains(&Dictionary::new("a").key("x", json!(1))));
        assert!(!schema.contains(&Dictionary::new("a").key("x", json!(2))));
        assert!(!schema.contains(&Dictionary::new("b")));
    }

    #[test]
    fn test_replace_component_same_name() {
        let mut schema = Schema::new("kv");
        schema.add_component(Dictionary::new("a"));
        schema.add_component(Dictionary::new("a").key("x", json!(1)));

        assert_eq!(schema.len(), 1);
        assert_eq!(schema.get_component("a").unwrap().entries.len(), 1);
    }

    #[test]
    fn test_create_order_parents_first() {
        // children declared before parents
        let schema = SqlSchema::from_tables(
            "veg",
            vec![
                table("tomato_aging_states", Some("tomato")),
                table("tomato", Some("vegetable")),
                table("vegetable", None),
            ],
        );

        let order: Vec<&str> = schema
            .create_order()
            .unwrap()
            .into_iter()
            .map(|t| t.name.as_str())
            .collect();

        assert_eq!(order, vec!["vegetable", "tomato", "tomato_aging_states"]);

        let drops = schema.drop_statements().unwrap();
        assert_eq!(drops[0], "DROP TABLE IF EXISTS tomato_aging_states");
    }

    #[test]
    fn test_create_order_detects_cycle() {
        let schema = SqlSchema::from_tables("cycle", vec![table("a", Some("b")), table("b", Some("a"))]);

        assert!(matches!(
            schema.create_order(),
            Err(Co3Error::ForeignKeyCycle(_))
        ));
    }

    #[test]
    fn test_external_references_ignored() {
        let schema = SqlSchema::from_tables("partial", vec![table("tomato", Some("vegetable"))]);
        assert_eq!(schema.create_statements().unwrap().len(), 1);
    }

    #[test]
    fn test_load_definition() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schema.json");
        let schema = SqlSchema::from_tables("veg", vec![table("vegetable", None)]);
        std::fs::write(&path, serde_json::to_string(&schema.to_definition()).unwrap()).unwrap();

        let loaded = SqlSchema::load(&path).unwrap();

        assert_eq!(loaded.name(), "veg");
        assert_eq!(loaded.get_component("vegetable"), schema.get_component("vegetable"));
    }

    #[test]
    fn test_definition_primary_keys_not_null() {
        let def: SchemaDefinition = serde_json::from_value(json!({
            "name": "veg",
            "tables": [{"name": "vegetable", "columns": [
                {"name": "id", "type": "integer", "primary_key": true},
                {"name": "name", "type": "text"}
            ]}]
        }))
        .unwrap();
        assert!(def.tables[0].columns[0].nullable);

        let schema = SqlSchema::from_definition(def);
        let vegetable = schema.get_component("vegetable").unwrap();

        assert!(!vegetable.columns[0].nullable);
        let insert = vegetable.prepare_insert(&crate::value::record([("name", json!("t1"))]));
        assert!(!insert.contains_key("id"));
    }

    fn produce_definition(on: serde_json::Value) -> SchemaDefinition {
        serde_json::from_value(json!({
            "name": "veg",
            "tables": [
                {"name": "vegetable", "columns": [{"name": "name", "type": "text"}, {"name": "color", "type": "text"}]},
                {"name": "tomato", "columns": [{"name": "name", "type": "text"}, {"name": "radius", "type": "integer"}]}
            ],
            "compositions": [
                {"name": "produce", "base": "vegetable", "joins": [{"table": "tomato", "on": on, "outer": true}]}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_composition_definition_builds_join() {
        let def = produce_definition(json!([["vegetable.name", "tomato.name"]]));
        let schema = SqlSchema::from_definition(def.clone());

        let relation = def.compositions[0].build(&schema).unwrap();

        assert_eq!(relation.name(), "vegetable+tomato");
        assert_eq!(
            relation.from_sql().unwrap(),
            "vegetable LEFT OUTER JOIN tomato ON vegetable.name = tomato.name"
        );
    }

    #[test]
    fn test_composition_definition_rejects_unknown_names() {
        let def = produce_definition(json!([["vegetable.name", "tomato.weight"]]));
        let schema = SqlSchema::from_definition(def.clone());
        assert!(matches!(
            def.compositions[0].build(&schema),
            Err(Co3Error::UnknownColumn { .. })
        ));

        let mut def = produce_definition(json!([["vegetable.name", "tomato.name"]]));
        def.compositions[0].base = "carrot".to_string();
        assert!(matches!(
            def.compositions[0].build(&schema),
            Err(Co3Error::TableNotFound(_))
        ));

        let def = produce_definition(json!([]));
        assert!(matches!(
            def.compositions[0].build(&schema),
            Err(Co3Error::InvalidConfig(_))
        ));
    }
}
