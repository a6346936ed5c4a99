// Collector - staging area between objects and the database
//
// Every staged insert gets a receipt. Receipts let a caller flush exactly the
// inserts produced by one collection pass, leaving the rest staged.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use crate::components::Component;
use crate::schema::Schema;
use crate::value::Record;

pub type Receipt = String;

/// Component name → prepared insert records
pub type Inserts = BTreeMap<String, Vec<Record>>;

#[derive(Debug, Clone)]
struct StagedInsert {
    receipt: Receipt,
    component: String,
    record: Record,
}

#[derive(Debug)]
pub struct Collector<C: Component> {
    schema: Arc<Schema<C>>,
    staged: Vec<StagedInsert>,
}

impl<C: Component> Collector<C> {
    pub fn new(schema: Arc<Schema<C>>) -> Self {
        Collector {
            schema,
            staged: Vec::new(),
        }
    }

    pub fn schema(&self) -> &Schema<C> {
        &self.schema
    }

    fn generate_unique_receipt() -> Receipt {
        uuid::Uuid::new_v4().to_string()
    }

    /// Stage an insert for `component`
    ///
    /// Components outside the collector's schema are skipped (returns `None`).
    /// The record is prepared against the component (defaults filled,
    /// unknown keys dropped) before it is stored.
    pub fn add_insert(
        &mut self,
        component: &C,
        record: &Record,
        receipts: Option<&mut Vec<Receipt>>,
    ) -> Option<Receipt> {
        if !self.schema.contains(component) {
            debug!("Inserts provided for non-existent component {}", component.name());
            return None;
        }

        let receipt = Self::generate_unique_receipt();
        self.staged.push(StagedInsert {
            receipt: receipt.clone(),
            component: component.name().to_string(),
            record: component.prepare_insert(record),
        });

        if let Some(receipts) = receipts {
            receipts.push(receipt.clone());
        }

        Some(receipt)
    }

    /// All staged inserts, merged by component; nothing is removed
    pub fn inserts(&self) -> Inserts {
        merge(self.staged.iter())
    }

    /// Merge and remove staged inserts
    ///
    /// Only the given receipts are taken when provided, everything otherwise.
    pub fn collect_inserts(&mut self, receipts: Option<&[Receipt]>) -> Inserts {
        let taken: Vec<StagedInsert> = match receipts {
            None => std::mem::take(&mut self.staged),
            Some(receipts) => {
                let wanted: HashSet<&str> = receipts.iter().map(String::as_str).collect();
                let (taken, kept): (Vec<StagedInsert>, Vec<StagedInsert>) = std::mem::take(&mut self.staged)
                    .into_iter()
                    .partition(|s| wanted.contains(s.receipt.as_str()));
                self.staged = kept;
                taken
            }
        };

        merge(taken.iter())
    }

    pub fn pending(&self) -> usize {
        self.staged.len()
    }

    pub fn reset_session(&mut self) {
        self.staged.clear();
    }
}

fn merge<'a>(staged: impl Iterator<Item = &'a StagedInsert>) -> Inserts {
    let mut inserts = Inserts::new();
    for s in staged {
        inserts
            .entry(s.component.clone())
            .or_default()
            .push(s.record.clone());
    }
    inserts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::Dictionary;
    use serde_json::json;

    fn collector() -> (Collector<Dictionary>, Dictionary, Dictionary) {
        let fruit = Dictionary::new("fruit").key("name", json!("")).key("color", json!(null));
        let sizes = Dictionary::new("sizes").key("name", json!("")).key("radius", json!(0));
        let schema = Schema::new("produce")
            .with_component(fruit.clone())
            .with_component(sizes.clone());
        (Collector::new(Arc::new(schema)), fruit, sizes)
    }

    #[test]
    fn test_add_insert_prepares_record() {
        let (mut collector, fruit, _) = collector();
        let record = crate::value::record([("name", json!("t1")), ("radius", json!(5))]);

        let receipt = collector.add_insert(&fruit, &record, None);

        assert!(receipt.is_some());
        let inserts = collector.inserts();
        let staged = &inserts["fruit"][0];
        assert_eq!(staged["name"], json!("t1"));
        assert_eq!(staged["color"], json!(null));
        assert!(!staged.contains_key("radius"));
    }

    #[test]
    fn test_add_insert_skips_foreign_component() {
        let (mut collector, _, _) = collector();
        let stranger = Dictionary::new("stranger");
        let mut receipts = Vec::new();

        let receipt = collector.add_insert(&stranger, &Record::new(), Some(&mut receipts));

        assert!(receipt.is_none());
        assert!(receipts.is_empty());
        assert_eq!(collector.pending(), 0);
    }

    #[test]
    fn test_collect_inserts_by_receipt() {
        let (mut collector, fruit, sizes) = collector();
        let mut first = Vec::new();
        let mut second = Vec::new();
        let record = crate::value::record([("name", json!("t1"))]);

        collector.add_insert(&fruit, &record, Some(&mut first));
        collector.add_insert(&sizes, &record, Some(&mut first));
        collector.add_insert(&fruit, &record, Some(&mut second));

        let taken = collector.collect_inserts(Some(&first));

        assert_eq!(taken["fruit"].len(), 1);
        assert_eq!(taken["sizes"].len(), 1);
        assert_eq!(collector.pending(), 1);

        let rest = collector.collect_inserts(None);
        assert_eq!(rest["fruit"].len(), 1);
        assert_eq!(collector.pending(), 0);
    }

    #[test]
    fn test_inserts_view_is_non_destructive() {
        let (mut collector, fruit, _) = collector();
        collector.add_insert(&fruit, &Record::new(), None);

        assert_eq!(collector.inserts().len(), 1);
        assert_eq!(collector.inserts().len(), 1);

        collector.reset_session();
        assert!(collector.inserts().is_empty());
    }
}
