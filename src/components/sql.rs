// Relational components: tables, columns and join trees
//
// Relation: table-like container
// | -> Heading: set of attributes (columns)
// | -> Body: set of tuples with domain matching the heading

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use super::{Component, ComposableComponent};
use crate::error::{Co3Error, Result};
use crate::value::{check_identifier, Record, Value};

// ============================================================================
// COLUMNS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    Blob,
    Boolean,
    Json,
}

impl ColumnType {
    /// SQLite type affinity used in DDL
    pub fn as_sql(&self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Text => "TEXT",
            ColumnType::Blob => "BLOB",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Json => "JSON",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForeignKeyAction {
    Cascade,
    SetNull,
    Restrict,
    NoAction,
}

impl ForeignKeyAction {
    pub fn as_sql(&self) -> &'static str {
        match self {
            ForeignKeyAction::Cascade => "CASCADE",
            ForeignKeyAction::SetNull => "SET NULL",
            ForeignKeyAction::Restrict => "RESTRICT",
            ForeignKeyAction::NoAction => "NO ACTION",
        }
    }
}

/// Foreign key target for a single column
///
/// Keys should reference values an object can know without first touching the
/// database (e.g. a unique `name`), not autoincrement ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub table: String,
    pub column: String,
    #[serde(default)]
    pub on_delete: Option<ForeignKeyAction>,
    #[serde(default)]
    pub deferred: bool,
}

impl ForeignKey {
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        ForeignKey {
            table: table.into(),
            column: column.into(),
            on_delete: None,
            deferred: false,
        }
    }

    /// Deferred key with cascading deletes; the usual choice inside a hierarchy
    pub fn deferred_cascade(table: impl Into<String>, column: impl Into<String>) -> Self {
        ForeignKey {
            on_delete: Some(ForeignKeyAction::Cascade),
            deferred: true,
            ..ForeignKey::new(table, column)
        }
    }

    fn to_sql(&self) -> Result<String> {
        let mut sql = format!(
            "REFERENCES {}({})",
            check_identifier(&self.table)?,
            check_identifier(&self.column)?
        );
        if let Some(action) = self.on_delete {
            sql.push_str(" ON DELETE ");
            sql.push_str(action.as_sql());
        }
        if self.deferred {
            sql.push_str(" DEFERRABLE INITIALLY DEFERRED");
        }
        Ok(sql)
    }
}

fn default_nullable() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub foreign_key: Option<ForeignKey>,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Column {
            name: name.into(),
            column_type,
            primary_key: false,
            unique: false,
            nullable: true,
            default: None,
            foreign_key: None,
        }
    }

    /// Builder: primary key (implies NOT NULL)
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    /// Builder: unique constraint
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Builder: NOT NULL
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Builder: default value
    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    /// Builder: foreign key
    pub fn references(mut self, fkey: ForeignKey) -> Self {
        self.foreign_key = Some(fkey);
        self
    }

    /// Value used when an insert doesn't provide this column
    ///
    /// Explicit default, else nothing for primary keys (left to the
    /// database), else NULL when nullable, else the empty string.
    pub fn insert_default(&self) -> Option<Value> {
        if let Some(default) = &self.default {
            Some(default.clone())
        } else if self.primary_key {
            None
        } else if self.nullable {
            Some(Value::Null)
        } else {
            Some(Value::String(String::new()))
        }
    }

    fn to_sql(&self) -> Result<String> {
        let mut sql = format!("{} {}", check_identifier(&self.name)?, self.column_type.as_sql());
        if self.primary_key {
            sql.push_str(" PRIMARY KEY");
        }
        if !self.nullable && !self.primary_key {
            sql.push_str(" NOT NULL");
        }
        if self.unique {
            // conflicting bulk inserts replace the existing row
            sql.push_str(" UNIQUE ON CONFLICT REPLACE");
        }
        if let Some(default) = &self.default {
            sql.push_str(" DEFAULT ");
            sql.push_str(&literal(default));
        }
        if let Some(fkey) = &self.foreign_key {
            sql.push(' ');
            sql.push_str(&fkey.to_sql()?);
        }
        Ok(sql)
    }
}

/// Render a value as a SQL literal (DDL defaults only; queries bind params)
fn literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        other => format!("'{}'", other.to_string().replace('\'', "''")),
    }
}

// ============================================================================
// TABLES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlTable {
    pub name: String,
    pub columns: Vec<Column>,
}

impl SqlTable {
    pub fn new(name: impl Into<String>) -> Self {
        SqlTable {
            name: name.into(),
            columns: Vec::new(),
        }
    }

    /// Builder: add column
    pub fn column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    pub fn get_column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Tables this one references through foreign keys
    pub fn dependencies(&self) -> Vec<&str> {
        let mut deps: Vec<&str> = Vec::new();
        for fkey in self.columns.iter().filter_map(|c| c.foreign_key.as_ref()) {
            if fkey.table != self.name && !deps.contains(&fkey.table.as_str()) {
                deps.push(&fkey.table);
            }
        }
        deps
    }

    pub fn create_sql(&self) -> Result<String> {
        let columns = self
            .columns
            .iter()
            .map(Column::to_sql)
            .collect::<Result<Vec<_>>>()?;

        Ok(format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
            check_identifier(&self.name)?,
            columns.join(",\n    ")
        ))
    }

    pub fn drop_sql(&self) -> Result<String> {
        Ok(format!("DROP TABLE IF EXISTS {}", check_identifier(&self.name)?))
    }

    /// Reference to one of this table's columns
    pub fn c(&self, column: &str) -> ColumnRef {
        ColumnRef::new(&self.name, column)
    }
}

impl Component for SqlTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn attributes(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    fn prepare_insert(&self, record: &Record) -> Record {
        let mut insert = Record::new();
        for column in &self.columns {
            if let Some(value) = record.get(&column.name) {
                insert.insert(column.name.clone(), value.clone());
            } else if let Some(default) = column.insert_default() {
                insert.insert(column.name.clone(), default);
            }
        }
        insert
    }
}

impl ComposableComponent for SqlTable {
    type Composition = SqlRelation;
    type Condition = JoinOn;

    fn lift(&self) -> SqlRelation {
        SqlRelation::Table(self.clone())
    }

    fn compose(left: SqlRelation, right: &SqlTable, on: JoinOn, outer: bool) -> SqlRelation {
        left.join(right.lift(), on, outer)
    }
}

// ============================================================================
// COLUMN REFERENCES & JOIN CONDITIONS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnRef {
    pub table: String,
    pub column: String,
}

impl ColumnRef {
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        ColumnRef {
            table: table.into(),
            column: column.into(),
        }
    }

    /// Parse `table.column`
    pub fn parse(qualified: &str) -> Option<Self> {
        let (table, column) = qualified.split_once('.')?;
        Some(ColumnRef::new(table, column))
    }

    pub fn to_sql(&self) -> Result<String> {
        Ok(format!(
            "{}.{}",
            check_identifier(&self.table)?,
            check_identifier(&self.column)?
        ))
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.table, self.column)
    }
}

/// Conjunction of column equalities
#[derive(Debug, Clone, PartialEq, Default)]
pub struct JoinOn(pub Vec<(ColumnRef, ColumnRef)>);

impl JoinOn {
    pub fn eq(left: ColumnRef, right: ColumnRef) -> Self {
        JoinOn(vec![(left, right)])
    }

    pub fn and(mut self, left: ColumnRef, right: ColumnRef) -> Self {
        self.0.push((left, right));
        self
    }

    fn to_sql(&self) -> Result<String> {
        if self.0.is_empty() {
            return Ok("1 = 1".to_string());
        }
        let parts = self
            .0
            .iter()
            .map(|(l, r)| Ok(format!("{} = {}", l.to_sql()?, r.to_sql()?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(parts.join(" AND "))
    }
}

/// Label columns by bare name, qualifying only names that collide
pub fn label_columns(columns: Vec<ColumnRef>) -> Vec<(ColumnRef, String)> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for c in &columns {
        *counts.entry(c.column.as_str()).or_default() += 1;
    }

    let labels: Vec<String> = columns
        .iter()
        .map(|c| {
            if counts[c.column.as_str()] > 1 {
                c.to_string()
            } else {
                c.column.clone()
            }
        })
        .collect();

    columns.into_iter().zip(labels).collect()
}

// ============================================================================
// RELATIONS (join trees)
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum SqlRelation {
    Table(SqlTable),
    Join {
        left: Box<SqlRelation>,
        right: Box<SqlRelation>,
        on: JoinOn,
        outer: bool,
    },
}

impl From<SqlTable> for SqlRelation {
    fn from(table: SqlTable) -> Self {
        SqlRelation::Table(table)
    }
}

impl From<&SqlTable> for SqlRelation {
    fn from(table: &SqlTable) -> Self {
        SqlRelation::Table(table.clone())
    }
}

impl SqlRelation {
    pub fn join(self, right: impl Into<SqlRelation>, on: JoinOn, outer: bool) -> SqlRelation {
        SqlRelation::Join {
            left: Box::new(self),
            right: Box::new(right.into()),
            on,
            outer,
        }
    }

    /// Descriptive name (table names joined by `+`)
    pub fn name(&self) -> String {
        self.tables()
            .iter()
            .map(|t| t.name.as_str())
            .collect::<Vec<_>>()
            .join("+")
    }

    /// Tables in FROM-clause order
    pub fn tables(&self) -> Vec<&SqlTable> {
        match self {
            SqlRelation::Table(table) => vec![table],
            SqlRelation::Join { left, right, .. } => {
                let mut tables = left.tables();
                tables.extend(right.tables());
                tables
            }
        }
    }

    /// Every column of every table
    pub fn columns(&self) -> Vec<ColumnRef> {
        self.tables()
            .into_iter()
            .flat_map(|t| t.columns.iter().map(move |c| t.c(&c.name)))
            .collect()
    }

    /// Output label per column: the bare name when it is unique across the
    /// relation, `table.column` otherwise
    pub fn labels(&self) -> Vec<(ColumnRef, String)> {
        label_columns(self.columns())
    }

    /// Resolve `column` or `table.column` against the relation
    pub fn resolve(&self, name: &str) -> Result<ColumnRef> {
        let columns = self.columns();
        let found = match ColumnRef::parse(name) {
            Some(qualified) => columns.into_iter().find(|c| *c == qualified),
            // first match in FROM order for bare names
            None => columns.into_iter().find(|c| c.column == name),
        };

        found.ok_or_else(|| Co3Error::UnknownColumn {
            relation: self.name(),
            column: name.to_string(),
        })
    }

    pub fn from_sql(&self) -> Result<String> {
        match self {
            SqlRelation::Table(table) => Ok(check_identifier(&table.name)?.to_string()),
            SqlRelation::Join {
                left,
                right,
                on,
                outer,
            } => {
                let join = if *outer { "LEFT OUTER JOIN" } else { "JOIN" };
                let right_sql = match right.as_ref() {
                    SqlRelation::Table(_) => right.from_sql()?,
                    nested => format!("({})", nested.from_sql()?),
                };
                Ok(format!(
                    "{} {} {} ON {}",
                    left.from_sql()?,
                    join,
                    right_sql,
                    on.to_sql()?
                ))
            }
        }
    }
}
