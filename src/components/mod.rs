// Storage components
//
// A component is a named data container within a particular storage
// protocol: a table for relational stores, a plain key-value map otherwise.

pub mod dictionary;
pub mod sql;

use std::fmt::Debug;

use crate::value::Record;

pub use dictionary::Dictionary;
pub use sql::{label_columns, Column, ColumnRef, ColumnType, ForeignKey, ForeignKeyAction, JoinOn, SqlRelation, SqlTable};

/// Typed unit of storage schema
pub trait Component: Debug + Clone + PartialEq {
    /// Name the component is registered under in its schema
    fn name(&self) -> &str;

    /// Attribute (column or key) names, in declaration order
    fn attributes(&self) -> Vec<String>;

    /// Fill component defaults and drop keys the component doesn't know about
    fn prepare_insert(&self, record: &Record) -> Record;
}

/// Components that can be composed with others of the same type
pub trait ComposableComponent: Component {
    /// Result of a composition (a join tree for relational components)
    type Composition: Clone + Debug;

    /// Condition two components are composed on
    type Condition: Clone + Debug;

    /// Treat a single component as a (trivial) composition
    fn lift(&self) -> Self::Composition;

    fn compose(
        left: Self::Composition,
        right: &Self,
        on: Self::Condition,
        outer: bool,
    ) -> Self::Composition;
}
