// CO3: COllate, COllect, COmpose
//
// - Collate: organize and transform outputs of registered actions
// - Collect: gather core attributes, collation data and subcomponents for inserts
// - Compose: build joined relations that follow the type hierarchy
//
// Types expose their actions through a `CollationRegistry`. Action *keys*
// identify a single action; *groups* are named collections of keys and pick
// the storage component the action's output lands in.
//
// Explicit registration ties a fixed key to one or more groups:
//
//     registry.explicit("ripe", &["aging"], |t: &Tomato| ...)
//
// Implicit registration ties a whole group to one action that receives the
// key, so *any* key is accepted under that group:
//
//     registry.implicit("cut", |t: &Tomato, key: &str| ...)
//
// An implicit group only answers when it is named directly. Outside a group
// context keys are matched against explicit registrations only.

use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

use crate::value::{Record, Value};

type Action<T> = Arc<dyn Fn(&T) -> Option<Record> + Send + Sync>;
type ImplicitAction<T> = Arc<dyn Fn(&T, &str) -> Option<Record> + Send + Sync>;

// ============================================================================
// TYPE METADATA
// ============================================================================

/// Registry view that doesn't depend on the concrete type
#[derive(Debug, Clone, Default)]
pub struct TypeMeta {
    name: &'static str,
    lineage: Vec<&'static str>,
    keys: Vec<String>,
    key_groups: HashMap<String, Vec<Option<String>>>,
    group_keys: HashMap<Option<String>, Vec<Option<String>>>,
    implicit_groups: BTreeSet<String>,
}

impl TypeMeta {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Type ancestry, base first and this type last
    pub fn lineage(&self) -> &[&'static str] {
        &self.lineage
    }

    /// Explicitly registered keys, in registration order
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn groups_for(&self, key: &str) -> Option<&[Option<String>]> {
        self.key_groups.get(key).map(Vec::as_slice)
    }

    /// Keys registered under a group; `None` entries mark an implicit action
    pub fn keys_for(&self, group: Option<&str>) -> &[Option<String>] {
        self.group_keys
            .get(&group.map(str::to_string))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Every group with at least one registration, default group included
    pub fn groups(&self) -> Vec<Option<&str>> {
        let mut groups: Vec<Option<&str>> = self.group_keys.keys().map(|g| g.as_deref()).collect();
        groups.sort();
        groups
    }

    pub fn is_implicit(&self, group: &str) -> bool {
        self.implicit_groups.contains(group)
    }

    pub fn is_explicit(&self, key: &str) -> bool {
        self.key_groups.contains_key(key)
    }

    fn unlink_key(&mut self, key: Option<&str>, group: &Option<String>) {
        if let Some(keys) = self.group_keys.get_mut(group) {
            keys.retain(|k| k.as_deref() != key);
            if keys.is_empty() {
                self.group_keys.remove(group);
            }
        }
    }

    fn register_explicit(&mut self, key: &str, groups: Vec<Option<String>>) {
        // re-registration overrides, e.g. a subtype replacing its parent's action
        if let Some(previous) = self.key_groups.remove(key) {
            for group in &previous {
                self.unlink_key(Some(key), group);
            }
        } else {
            self.keys.push(key.to_string());
        }

        for group in &groups {
            self.group_keys
                .entry(group.clone())
                .or_default()
                .push(Some(key.to_string()));
        }
        self.key_groups.insert(key.to_string(), groups);
    }

    fn register_implicit(&mut self, group: &str) {
        if self.implicit_groups.insert(group.to_string()) {
            self.group_keys
                .entry(Some(group.to_string()))
                .or_default()
                .push(None);
        }
    }
}

// ============================================================================
// COLLATION REGISTRY
// ============================================================================

pub struct CollationRegistry<T> {
    meta: TypeMeta,
    explicit: HashMap<String, Action<T>>,
    implicit: HashMap<String, ImplicitAction<T>>,
}

impl<T: 'static> CollationRegistry<T> {
    /// Registry for a root type (no parent)
    pub fn new(name: &'static str) -> Self {
        CollationRegistry {
            meta: TypeMeta {
                name,
                lineage: vec![name],
                ..TypeMeta::default()
            },
            explicit: HashMap::new(),
            implicit: HashMap::new(),
        }
    }

    /// Inherit the parent type's actions
    ///
    /// The subtype holds its parent's data; `project` recovers it so parent
    /// actions run unchanged. Registrations made afterwards override them.
    pub fn extends<P: 'static>(mut self, parent: &CollationRegistry<P>, project: fn(&T) -> &P) -> Self {
        let mut lineage = parent.meta.lineage.clone();
        lineage.push(self.meta.name);
        self.meta.lineage = lineage;

        for key in parent.meta.keys() {
            let groups = parent.meta.key_groups[key].clone();
            let action = Arc::clone(&parent.explicit[key]);
            self.meta.register_explicit(key, groups);
            self.explicit
                .insert(key.clone(), Arc::new(move |obj: &T| action(project(obj))));
        }

        for (group, action) in &parent.implicit {
            let action = Arc::clone(action);
            self.meta.register_implicit(group);
            self.implicit.insert(
                group.clone(),
                Arc::new(move |obj: &T, key: &str| action(project(obj), key)),
            );
        }

        self
    }

    /// Register an action under a fixed key
    ///
    /// With no groups the key lands in the default (`None`) group.
    pub fn explicit<F>(mut self, key: &str, groups: &[&str], action: F) -> Self
    where
        F: Fn(&T) -> Option<Record> + Send + Sync + 'static,
    {
        let groups: Vec<Option<String>> = if groups.is_empty() {
            vec![None]
        } else {
            groups.iter().map(|g| Some(g.to_string())).collect()
        };

        self.meta.register_explicit(key, groups);
        self.explicit.insert(key.to_string(), Arc::new(action));
        self
    }

    /// Register an action for an entire group; the action receives the key
    pub fn implicit<F>(mut self, group: &str, action: F) -> Self
    where
        F: Fn(&T, &str) -> Option<Record> + Send + Sync + 'static,
    {
        self.meta.register_implicit(group);
        self.implicit.insert(group.to_string(), Arc::new(action));
        self
    }

    pub fn meta(&self) -> &TypeMeta {
        &self.meta
    }

    /// Run the action for `key`
    ///
    /// Explicit keys always match. Otherwise the key falls through to the
    /// implicit action of `group`, which must be named.
    pub fn collate(&self, obj: &T, key: &str, group: Option<&str>) -> Option<Record> {
        if let Some(action) = self.explicit.get(key) {
            return action(obj);
        }

        let Some(group) = group else {
            debug!(
                "Collation for \"{}\" not supported, or implicit group not specified",
                key
            );
            return None;
        };

        match self.implicit.get(group) {
            Some(action) => action(obj, key),
            None => {
                debug!(
                    "Collation key \"{}\" not registered and group \"{}\" not implicit",
                    key, group
                );
                None
            }
        }
    }
}

// ============================================================================
// CO3 TRAIT
// ============================================================================

/// Conversion & insertion behavior shared by a type hierarchy
pub trait Co3: Send + Sync {
    /// Registry metadata: name, lineage and registered actions
    fn type_meta(&self) -> &TypeMeta;

    /// Canonical attributes, i.e. inserts to the type's own component
    fn attributes(&self) -> Record;

    /// Constituent objects that need collecting alongside this one
    fn components(&self) -> Vec<&dyn Co3> {
        Vec::new()
    }

    /// "Connective" data merged into collation outputs before they're staged,
    /// typically the keys linking a collation component back to its parent
    fn collation_attributes(&self, _key: &str, _group: Option<&str>) -> Record {
        Record::new()
    }

    fn collate(&self, key: &str, group: Option<&str>) -> Option<Record>;
}

/// Attributes from a type's serde representation (its fields)
pub fn serialized_attributes<T: Serialize>(obj: &T) -> Record {
    match serde_json::to_value(obj) {
        Ok(Value::Object(map)) => map,
        Ok(_) | Err(_) => Record::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::OnceLock;

    #[derive(Serialize)]
    struct Vegetable {
        name: String,
        color: String,
    }

    #[derive(Serialize)]
    struct Tomato {
        #[serde(flatten)]
        base: Vegetable,
        radius: i64,
    }

    fn vegetable_registry() -> &'static CollationRegistry<Vegetable> {
        static REGISTRY: OnceLock<CollationRegistry<Vegetable>> = OnceLock::new();
        REGISTRY.get_or_init(|| {
            CollationRegistry::new("vegetable")
                .implicit("cut", |_v: &Vegetable, _method: &str| None)
                .explicit("washed", &[], |v: &Vegetable| {
                    Some(crate::value::record([("name", json!(v.name))]))
                })
        })
    }

    fn tomato_registry() -> &'static CollationRegistry<Tomato> {
        static REGISTRY: OnceLock<CollationRegistry<Tomato>> = OnceLock::new();
        REGISTRY.get_or_init(|| {
            CollationRegistry::new("tomato")
                .extends(vegetable_registry(), |t: &Tomato| &t.base)
                .explicit("ripe", &["aging"], |t: &Tomato| {
                    Some(crate::value::record([("age", json!(t.radius / 2))]))
                })
                .explicit("rotten", &["aging"], |_t: &Tomato| {
                    Some(crate::value::record([("age", json!(8))]))
                })
                .explicit("diced", &["cooking"], |_t: &Tomato| {
                    Some(crate::value::record([("pieces", json!(6))]))
                })
                .implicit("cut", |t: &Tomato, method: &str| match method {
                    "slice" => Some(crate::value::record([("pieces", json!(4))])),
                    "dice" => tomato_registry().collate(t, "diced", None),
                    _ => None,
                })
        })
    }

    impl Co3 for Tomato {
        fn type_meta(&self) -> &TypeMeta {
            tomato_registry().meta()
        }

        fn attributes(&self) -> Record {
            serialized_attributes(self)
        }

        fn collation_attributes(&self, key: &str, _group: Option<&str>) -> Record {
            crate::value::record([("name", json!(self.base.name)), ("state", json!(key))])
        }

        fn collate(&self, key: &str, group: Option<&str>) -> Option<Record> {
            tomato_registry().collate(self, key, group)
        }
    }

    fn tomato() -> Tomato {
        Tomato {
            base: Vegetable {
                name: "t1".to_string(),
                color: "red".to_string(),
            },
            radius: 10,
        }
    }

    #[test]
    fn test_registry_keys_match_groups() {
        let meta = tomato_registry().meta();

        // every key's groups list the key back
        for key in meta.keys() {
            for group in meta.groups_for(key).unwrap() {
                assert!(meta
                    .keys_for(group.as_deref())
                    .contains(&Some(key.clone())));
            }
        }

        assert_eq!(meta.keys_for(Some("aging")).len(), 2);
        assert_eq!(meta.keys_for(Some("cut")), &[None]);
        assert_eq!(meta.keys_for(None), &[Some("washed".to_string())]);
    }

    #[test]
    fn test_lineage_base_first() {
        assert_eq!(tomato().type_meta().lineage(), &["vegetable", "tomato"]);
        assert_eq!(tomato().type_meta().name(), "tomato");
    }

    #[test]
    fn test_collate_explicit() {
        let t = tomato();
        assert_eq!(t.collate("ripe", None).unwrap()["age"], json!(5));
        // explicit keys match regardless of the group given
        assert!(t.collate("diced", Some("aging")).is_some());
    }

    #[test]
    fn test_collate_inherited_action_uses_parent_data() {
        assert_eq!(tomato().collate("washed", None).unwrap()["name"], json!("t1"));
    }

    #[test]
    fn test_collate_implicit_requires_group() {
        let t = tomato();

        assert!(t.collate("slice", None).is_none());
        assert_eq!(t.collate("slice", Some("cut")).unwrap()["pieces"], json!(4));
        assert_eq!(t.collate("dice", Some("cut")).unwrap()["pieces"], json!(6));
        assert!(t.collate("slice", Some("aging")).is_none());
    }

    #[test]
    fn test_subtype_override_replaces_implicit_action() {
        // vegetable's `cut` yields nothing; tomato's override answers
        assert!(tomato().collate("slice", Some("cut")).is_some());
        assert_eq!(tomato_registry().meta().keys_for(Some("cut")).len(), 1);
    }

    #[test]
    fn test_override_explicit_moves_groups() {
        let registry = CollationRegistry::<Vegetable>::new("v")
            .explicit("k", &["a"], |_| None)
            .explicit("k", &["b"], |_| None);

        assert!(registry.meta().keys_for(Some("a")).is_empty());
        assert_eq!(registry.meta().keys_for(Some("b")).len(), 1);
        assert_eq!(registry.meta().keys(), &["k".to_string()]);
    }

    #[test]
    fn test_serialized_attributes_flatten_parent() {
        let attrs = tomato().attributes();
        assert_eq!(attrs["name"], json!("t1"));
        assert_eq!(attrs["color"], json!("red"));
        assert_eq!(attrs["radius"], json!(10));
    }

    #[test]
    fn test_collation_attributes() {
        let attrs = tomato().collation_attributes("ripe", Some("aging"));
        assert_eq!(attrs["state"], json!("ripe"));
    }
}
