// Mapper - connects Co3 types to storage components
//
// Mappers are responsible for two primary tasks:
//
// 1. Attaching Co3 types to components from within a single schema
// 2. Collecting component-bound insert data from instances of attached types
//
// Registration is open to any type, not only those of one hierarchy: an
// object collects its own attributes and actions, repeats that up its lineage
// and then down into its components, which are often unrelated types.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::co3::{Co3, TypeMeta};
use crate::collector::{Collector, Receipt};
use crate::components::{Component, ComposableComponent, Dictionary, SqlTable};
use crate::composer::Composer;
use crate::error::{Co3Error, Result};
use crate::schema::Schema;

// ============================================================================
// COMPONENT REFERENCES
// ============================================================================

/// A component given either by name or by value
#[derive(Debug)]
pub enum ComponentRef<'a, C> {
    Name(&'a str),
    Value(&'a C),
}

impl<C> Clone for ComponentRef<'_, C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C> Copy for ComponentRef<'_, C> {}

impl<'a, C> From<&'a str> for ComponentRef<'a, C> {
    fn from(name: &'a str) -> Self {
        ComponentRef::Name(name)
    }
}

impl<'a> From<&'a SqlTable> for ComponentRef<'a, SqlTable> {
    fn from(table: &'a SqlTable) -> Self {
        ComponentRef::Value(table)
    }
}

impl<'a> From<&'a Dictionary> for ComponentRef<'a, Dictionary> {
    fn from(dict: &'a Dictionary) -> Self {
        ComponentRef::Value(dict)
    }
}

// ============================================================================
// MAPPER
// ============================================================================

#[derive(Debug)]
pub struct Mapper<C: Component> {
    schema: Arc<Schema<C>>,
    collector: Collector<C>,
    lineages: HashMap<String, Vec<&'static str>>,
    attribute_comps: HashMap<String, C>,
    collation_groups: HashMap<String, BTreeMap<Option<String>, C>>,
}

impl<C: Component> Mapper<C> {
    /// `schema` holds the components eligible as attachment targets
    pub fn new(schema: Schema<C>) -> Self {
        let schema = Arc::new(schema);
        Mapper {
            collector: Collector::new(Arc::clone(&schema)),
            schema,
            lineages: HashMap::new(),
            attribute_comps: HashMap::new(),
            collation_groups: HashMap::new(),
        }
    }

    pub fn schema(&self) -> &Schema<C> {
        &self.schema
    }

    pub fn collector(&self) -> &Collector<C> {
        &self.collector
    }

    pub fn collector_mut(&mut self) -> &mut Collector<C> {
        &mut self.collector
    }

    fn check_component(&self, comp: ComponentRef<'_, C>) -> Result<C> {
        match comp {
            ComponentRef::Name(name) => self
                .schema
                .get_component(name)
                .cloned()
                .ok_or_else(|| Co3Error::ComponentNotFound(name.to_string())),
            ComponentRef::Value(component) => {
                if self.schema.contains(component) {
                    Ok(component.clone())
                } else {
                    Err(Co3Error::ComponentNotInSchema {
                        component: component.name().to_string(),
                        schema: self.schema.name().to_string(),
                    })
                }
            }
        }
    }

    /// Attach a type to its storage components
    ///
    /// `attr_comp` receives the type's canonical attributes, `coll_comp` its
    /// default-group collations, `coll_groups` the collations of named groups.
    pub fn attach<'a>(
        &mut self,
        type_meta: &TypeMeta,
        attr_comp: impl Into<ComponentRef<'a, C>>,
        coll_comp: Option<ComponentRef<'a, C>>,
        coll_groups: &[(&str, ComponentRef<'a, C>)],
    ) -> Result<()>
    where
        C: 'a,
    {
        let attr_comp = self.check_component(attr_comp.into())?;

        let mut groups = BTreeMap::new();
        if let Some(coll_comp) = coll_comp {
            groups.insert(None, self.check_component(coll_comp)?);
        }
        for (group, comp) in coll_groups {
            groups.insert(Some(group.to_string()), self.check_component(*comp)?);
        }

        let name = type_meta.name().to_string();
        self.lineages
            .insert(name.clone(), type_meta.lineage().to_vec());
        self.attribute_comps.insert(name.clone(), attr_comp);
        self.collation_groups.entry(name).or_default().extend(groups);

        Ok(())
    }

    /// Attach several types using naming conventions
    ///
    /// `attr_name_map` names each type's attribute component. `coll_name_map`
    /// names the collation component for each registered group (`None` for
    /// the default group); groups whose mapped component isn't in the schema
    /// are left unattached.
    pub fn attach_many<A, G>(
        &mut self,
        types: &[&TypeMeta],
        attr_name_map: A,
        coll_name_map: Option<G>,
    ) -> Result<()>
    where
        A: Fn(&TypeMeta) -> String,
        G: Fn(&TypeMeta, Option<&str>) -> String,
    {
        for &type_meta in types {
            let attr_name = attr_name_map(type_meta);

            let mut coll_names: Vec<(String, String)> = Vec::new();
            let mut default_name: Option<String> = None;
            if let Some(coll_name_map) = &coll_name_map {
                for group in type_meta.groups() {
                    let comp_name = coll_name_map(type_meta, group);
                    if self.schema.get_component(&comp_name).is_none() {
                        tracing::debug!(
                            "No component \"{}\" for group {:?} of type \"{}\"",
                            comp_name,
                            group,
                            type_meta.name()
                        );
                        continue;
                    }
                    match group {
                        Some(group) => coll_names.push((group.to_string(), comp_name)),
                        None => default_name = Some(comp_name),
                    }
                }
            }

            let coll_groups: Vec<(&str, ComponentRef<'_, C>)> = coll_names
                .iter()
                .map(|(group, comp)| (group.as_str(), ComponentRef::Name(comp.as_str())))
                .collect();

            self.attach(
                type_meta,
                ComponentRef::Name(&attr_name),
                default_name.as_deref().map(ComponentRef::Name),
                &coll_groups,
            )?;
        }

        Ok(())
    }

    pub fn get_attribute_comp(&self, type_name: &str) -> Option<&C> {
        self.attribute_comps.get(type_name)
    }

    pub fn get_collation_comp(&self, type_name: &str, group: Option<&str>) -> Option<&C> {
        self.collation_groups
            .get(type_name)?
            .get(&group.map(str::to_string))
    }

    pub fn is_attached(&self, type_name: &str) -> bool {
        self.attribute_comps.contains_key(type_name)
    }

    /// Stage inserts up the lineage and down through components
    ///
    /// `action_keys` defaults to every explicit key of the object's type.
    /// `action_groups` restricts which collation groups are stored; implicit
    /// groups only take part when named here. Returns the receipts of every
    /// staged insert.
    pub fn collect(
        &mut self,
        obj: &dyn Co3,
        action_keys: Option<&[&str]>,
        action_groups: Option<&[Option<&str>]>,
    ) -> Vec<Receipt> {
        let meta = obj.type_meta();
        let keys: Vec<String> = match action_keys {
            Some(keys) => keys.iter().map(|k| k.to_string()).collect(),
            None => meta.keys().to_vec(),
        };
        let group_allowed = |group: Option<&str>| action_groups.map_or(true, |gs| gs.contains(&group));

        // run each action once, fan the output out per group
        let mut collations = Vec::new();
        for key in &keys {
            if let Some(groups) = meta.groups_for(key) {
                let Some(data) = obj.collate(key, None) else {
                    continue;
                };
                for group in groups.iter().filter(|g| group_allowed(g.as_deref())) {
                    collations.push((key.clone(), group.clone(), data.clone()));
                }
            } else if let Some(groups) = action_groups {
                for group in groups.iter().flatten().filter(|g| meta.is_implicit(g)) {
                    if let Some(data) = obj.collate(key, Some(group)) {
                        collations.push((key.clone(), Some(group.to_string()), data));
                    }
                }
            }
        }

        let mut receipts = Vec::new();
        let attributes = obj.attributes();

        for type_name in meta.lineage() {
            // require an attribute component for type consideration
            let Some(attribute_comp) = self.attribute_comps.get(*type_name) else {
                continue;
            };
            self.collector
                .add_insert(attribute_comp, &attributes, Some(&mut receipts));

            let Some(groups) = self.collation_groups.get(*type_name) else {
                continue;
            };
            for (key, group, data) in &collations {
                let Some(collation_comp) = groups.get(group) else {
                    continue;
                };

                let mut record = obj.collation_attributes(key, group.as_deref());
                record.extend(data.clone());
                self.collector
                    .add_insert(collation_comp, &record, Some(&mut receipts));
            }
        }

        for component in obj.components() {
            receipts.extend(self.collect(component, action_keys, action_groups));
        }

        receipts
    }
}

// ============================================================================
// COMPOSABLE MAPPER
// ============================================================================

type ComposeMap<C> = Box<dyn Fn(&C, &C) -> <C as ComposableComponent>::Condition + Send + Sync>;

/// Mapper that can also compose a type's components into one relation
///
/// Attribute components along the lineage are joined with `attr_compose_map`
/// (parent, child); collation components are joined onto their type's
/// attribute component with `coll_compose_map` (attribute, collation).
pub struct ComposableMapper<C: ComposableComponent> {
    mapper: Mapper<C>,
    attr_compose_map: ComposeMap<C>,
    coll_compose_map: ComposeMap<C>,
    composer: Composer<C::Composition>,
}

impl<C: ComposableComponent> ComposableMapper<C> {
    pub fn new<A, K>(schema: Schema<C>, attr_compose_map: A, coll_compose_map: K) -> Self
    where
        A: Fn(&C, &C) -> C::Condition + Send + Sync + 'static,
        K: Fn(&C, &C) -> C::Condition + Send + Sync + 'static,
    {
        ComposableMapper {
            mapper: Mapper::new(schema),
            attr_compose_map: Box::new(attr_compose_map),
            coll_compose_map: Box::new(coll_compose_map),
            composer: Composer::new(),
        }
    }

    pub fn composer(&self) -> &Composer<C::Composition> {
        &self.composer
    }

    pub fn composer_mut(&mut self) -> &mut Composer<C::Composition> {
        &mut self.composer
    }

    /// Compose the components of `type_name` and its ancestors
    ///
    /// `action_groups` limits the collation components joined in (all when
    /// `None`); `outer` makes those joins outer joins so objects without
    /// collation rows still appear.
    pub fn compose(
        &self,
        type_name: &str,
        action_groups: Option<&[Option<&str>]>,
        outer: bool,
    ) -> Result<C::Composition> {
        let lineage = self
            .mapper
            .lineages
            .get(type_name)
            .ok_or_else(|| Co3Error::UnknownType(type_name.to_string()))?;

        let mut composition: Option<C::Composition> = None;
        let mut parent: Option<&C> = None;
        let mut joined: HashSet<&str> = HashSet::new();

        for ancestor in lineage {
            let Some(attr_comp) = self.mapper.attribute_comps.get(*ancestor) else {
                continue;
            };

            if joined.insert(attr_comp.name()) {
                composition = Some(match (composition, parent) {
                    (Some(comp), Some(parent)) => {
                        C::compose(comp, attr_comp, (self.attr_compose_map)(parent, attr_comp), false)
                    }
                    _ => attr_comp.lift(),
                });
                parent = Some(attr_comp);
            }

            let Some(groups) = self.mapper.collation_groups.get(*ancestor) else {
                continue;
            };
            for (group, coll_comp) in groups {
                let allowed = action_groups.map_or(true, |gs| gs.contains(&group.as_deref()));
                if !allowed || !joined.insert(coll_comp.name()) {
                    continue;
                }
                if let Some(comp) = composition.take() {
                    let on = (self.coll_compose_map)(attr_comp, coll_comp);
                    composition = Some(C::compose(comp, coll_comp, on, outer));
                }
            }
        }

        composition.ok_or_else(|| Co3Error::UnknownType(type_name.to_string()))
    }
}

impl<C: ComposableComponent> Deref for ComposableMapper<C> {
    type Target = Mapper<C>;

    fn deref(&self) -> &Mapper<C> {
        &self.mapper
    }
}

impl<C: ComposableComponent> DerefMut for ComposableMapper<C> {
    fn deref_mut(&mut self) -> &mut Mapper<C> {
        &mut self.mapper
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::co3::{serialized_attributes, CollationRegistry};
    use crate::components::{Column, ColumnType, JoinOn};
    use crate::value::{record, Record};
    use serde::Serialize;
    use serde_json::json;
    use std::sync::OnceLock;

    #[derive(Serialize)]
    struct Fruit {
        name: String,
        color: String,
    }

    #[derive(Serialize)]
    struct Apple {
        #[serde(flatten)]
        base: Fruit,
        crunch: i64,
        #[serde(skip)]
        seeds: Vec<Seed>,
    }

    #[derive(Serialize)]
    struct Seed {
        name: String,
    }

    fn fruit_registry() -> &'static CollationRegistry<Fruit> {
        static REGISTRY: OnceLock<CollationRegistry<Fruit>> = OnceLock::new();
        REGISTRY.get_or_init(|| CollationRegistry::new("fruit"))
    }

    fn apple_registry() -> &'static CollationRegistry<Apple> {
        static REGISTRY: OnceLock<CollationRegistry<Apple>> = OnceLock::new();
        REGISTRY.get_or_init(|| {
            CollationRegistry::new("apple")
                .extends(fruit_registry(), |a: &Apple| &a.base)
                .explicit("picked", &["harvest"], |a: &Apple| {
                    Some(record([("weight", json!(a.crunch * 10))]))
                })
                .explicit("stored", &["harvest", "storage"], |_a: &Apple| {
                    Some(record([("weight", json!(1))]))
                })
                .explicit("missing", &["harvest"], |_a: &Apple| None)
                .implicit("peel", |_a: &Apple, style: &str| {
                    Some(record([("weight", json!(style.len()))]))
                })
        })
    }

    fn seed_registry() -> &'static CollationRegistry<Seed> {
        static REGISTRY: OnceLock<CollationRegistry<Seed>> = OnceLock::new();
        REGISTRY.get_or_init(|| CollationRegistry::new("seed"))
    }

    impl Co3 for Apple {
        fn type_meta(&self) -> &TypeMeta {
            apple_registry().meta()
        }

        fn attributes(&self) -> Record {
            serialized_attributes(self)
        }

        fn components(&self) -> Vec<&dyn Co3> {
            self.seeds.iter().map(|s| s as &dyn Co3).collect()
        }

        fn collation_attributes(&self, key: &str, _group: Option<&str>) -> Record {
            record([("name", json!(self.base.name)), ("state", json!(key))])
        }

        fn collate(&self, key: &str, group: Option<&str>) -> Option<Record> {
            apple_registry().collate(self, key, group)
        }
    }

    impl Co3 for Seed {
        fn type_meta(&self) -> &TypeMeta {
            seed_registry().meta()
        }

        fn attributes(&self) -> Record {
            serialized_attributes(self)
        }

        fn collate(&self, key: &str, group: Option<&str>) -> Option<Record> {
            seed_registry().collate(self, key, group)
        }
    }

    fn apple() -> Apple {
        Apple {
            base: Fruit {
                name: "a1".to_string(),
                color: "green".to_string(),
            },
            crunch: 3,
            seeds: vec![
                Seed { name: "s1".to_string() },
                Seed { name: "s2".to_string() },
            ],
        }
    }

    fn dict(name: &str, keys: &[&str]) -> Dictionary {
        keys.iter()
            .fold(Dictionary::new(name), |d, k| d.key(*k, json!(null)))
    }

    fn dict_schema() -> Schema<Dictionary> {
        Schema::new("orchard")
            .with_component(dict("fruit", &["name", "color"]))
            .with_component(dict("apple", &["name", "crunch"]))
            .with_component(dict("apple_harvest", &["name", "state", "weight"]))
            .with_component(dict("apple_storage", &["name", "state", "weight"]))
            .with_component(dict("apple_peel", &["name", "state", "weight"]))
            .with_component(dict("seed", &["name"]))
    }

    fn attached_mapper() -> Mapper<Dictionary> {
        let mut mapper = Mapper::new(dict_schema());
        mapper
            .attach_many(
                &[fruit_registry().meta(), apple_registry().meta(), seed_registry().meta()],
                |t| t.name().to_string(),
                Some(|t: &TypeMeta, g: Option<&str>| format!("{}_{}", t.name(), g.unwrap_or("default"))),
            )
            .unwrap();
        mapper
    }

    #[test]
    fn test_attach_by_name_and_value() {
        let schema = dict_schema();
        let apple_comp = schema.get_component("apple").unwrap().clone();
        let mut mapper = Mapper::new(schema);

        mapper
            .attach(
                apple_registry().meta(),
                &apple_comp,
                None,
                &[("harvest", ComponentRef::Name("apple_harvest"))],
            )
            .unwrap();

        assert_eq!(mapper.get_attribute_comp("apple"), Some(&apple_comp));
        assert_eq!(
            mapper.get_collation_comp("apple", Some("harvest")).unwrap().name,
            "apple_harvest"
        );
        assert!(mapper.get_collation_comp("apple", None).is_none());
    }

    #[test]
    fn test_attach_rejects_unknown_components() {
        let mut mapper = Mapper::new(dict_schema());

        let missing = mapper.attach(apple_registry().meta(), "pear", None, &[]);
        assert!(matches!(missing, Err(Co3Error::ComponentNotFound(_))));

        let stranger = dict("apple", &["other"]);
        let foreign = mapper.attach(apple_registry().meta(), &stranger, None, &[]);
        assert!(matches!(foreign, Err(Co3Error::ComponentNotInSchema { .. })));
    }

    #[test]
    fn test_attach_many_maps_groups() {
        let mapper = attached_mapper();

        assert!(mapper.is_attached("fruit"));
        assert!(mapper.get_collation_comp("apple", Some("storage")).is_some());
        assert!(mapper.get_collation_comp("apple", Some("peel")).is_some());
        // no "apple_default" component in the schema
        assert!(mapper.get_collation_comp("apple", None).is_none());
    }

    #[test]
    fn test_collect_up_lineage_and_into_components() {
        let mut mapper = attached_mapper();

        let receipts = mapper.collect(&apple(), None, None);
        let inserts = mapper.collector().inserts();

        assert_eq!(inserts["fruit"].len(), 1);
        assert_eq!(inserts["fruit"][0]["color"], json!("green"));
        assert_eq!(inserts["apple"][0]["crunch"], json!(3));
        // picked + stored; "missing" returned no data
        assert_eq!(inserts["apple_harvest"].len(), 2);
        assert_eq!(inserts["apple_storage"].len(), 1);
        assert_eq!(inserts["seed"].len(), 2);
        assert!(!inserts.contains_key("apple_peel"));
        assert_eq!(receipts.len(), 7);

        let picked = inserts["apple_harvest"]
            .iter()
            .find(|r| r["state"] == json!("picked"))
            .unwrap();
        assert_eq!(picked["weight"], json!(30));
        assert_eq!(picked["name"], json!("a1"));
    }

    #[test]
    fn test_collect_group_filter_and_implicit_groups() {
        let mut mapper = attached_mapper();

        mapper.collect(
            &apple(),
            Some(&["stored", "spiral"]),
            Some(&[Some("storage"), Some("peel")]),
        );
        let inserts = mapper.collector_mut().collect_inserts(None);

        assert_eq!(inserts["apple_storage"].len(), 1);
        assert!(!inserts.contains_key("apple_harvest"));
        assert_eq!(inserts["apple_peel"][0]["weight"], json!(6));
        assert_eq!(inserts["apple_peel"][0]["state"], json!("spiral"));
    }

    #[test]
    fn test_compose_follows_lineage() {
        let name_col = || Column::new("name", ColumnType::Text);
        let schema = Schema::new("orchard")
            .with_component(SqlTable::new("fruit").column(name_col()))
            .with_component(SqlTable::new("apple").column(name_col()))
            .with_component(SqlTable::new("apple_harvest").column(name_col()));

        let join_on_name = |a: &SqlTable, b: &SqlTable| JoinOn::eq(a.c("name"), b.c("name"));
        let mut mapper = ComposableMapper::new(schema, join_on_name, join_on_name);
        mapper
            .attach(fruit_registry().meta(), "fruit", None, &[])
            .unwrap();
        mapper
            .attach(
                apple_registry().meta(),
                "apple",
                None,
                &[("harvest", ComponentRef::Name("apple_harvest"))],
            )
            .unwrap();

        let relation = mapper.compose("apple", None, true).unwrap();
        assert_eq!(
            relation.from_sql().unwrap(),
            "fruit JOIN apple ON fruit.name = apple.name \
             LEFT OUTER JOIN apple_harvest ON apple.name = apple_harvest.name"
        );

        let attrs_only = mapper.compose("apple", Some(&[]), true).unwrap();
        assert_eq!(attrs_only.tables().len(), 2);

        assert!(matches!(
            mapper.compose("pear", None, false),
            Err(Co3Error::UnknownType(_))
        ));
    }
}
