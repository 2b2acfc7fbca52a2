//! Ordered, duplicate-free record set with O(1) identity lookup.
//!
//! ```text
//!   entries: IndexMap<Euid, RecordRef>      (insertion order = set order)
//!   keys:    HashMap<RecordId, Vec<Euid>>   (primary identity -> entries)
//!   indexed: HashMap<Euid, RecordId>        (entry -> key it is filed under)
//! ```
//!
//! Entries are unique by ephemeral id. Several entries may share a primary
//! key (records registered without lookup); a key lookup resolves to the
//! earliest of them. The key index is a cache: lookups verify that the
//! record still carries the key, and `reindex` refreshes it after a
//! primary-key change.

use crate::record::{Identity, Record, RecordId, RecordRef};
use indexmap::IndexMap;
use modelsync_env::Euid;
use std::cmp::Ordering;
use std::collections::HashMap;

#[derive(Debug, Default, Clone)]
pub struct IdentitySet {
    entries: IndexMap<Euid, RecordRef>,
    keys: HashMap<RecordId, Vec<Euid>>,
    indexed: HashMap<Euid, RecordId>,
}

impl IdentitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has(&self, identity: &Identity) -> bool {
        self.get(identity).is_some()
    }

    /// Membership of this exact record instance.
    pub fn has_record(&self, record: &Record) -> bool {
        self.entries.contains_key(&record.euid())
    }

    pub fn get(&self, identity: &Identity) -> Option<&RecordRef> {
        match identity {
            Identity::Ephemeral(euid) => self.entries.get(euid),
            Identity::Key(id) => self.keys.get(id).and_then(|euids| {
                euids
                    .iter()
                    .filter_map(|euid| self.entries.get(euid))
                    .find(|record| record.id().as_ref() == Some(id))
            }),
        }
    }

    pub fn at(&self, index: usize) -> Option<&RecordRef> {
        self.entries.get_index(index).map(|(_, record)| record)
    }

    /// Position of `record`, if it sits at or after `offset`.
    pub fn index_of(&self, record: &Record, offset: usize) -> Option<usize> {
        self.entries
            .get_index_of(&record.euid())
            .filter(|index| *index >= offset)
    }

    /// Inserts `records` in order at `index` (appends when `None`; clamped
    /// to the end). Records already present are skipped. Returns the number
    /// inserted.
    pub fn add<I>(&mut self, records: I, index: Option<usize>) -> usize
    where
        I: IntoIterator<Item = RecordRef>,
    {
        let mut at = index.map_or(self.entries.len(), |i| i.min(self.entries.len()));
        let mut inserted = 0;
        for record in records {
            let euid = record.euid();
            if self.entries.contains_key(&euid) {
                continue;
            }
            if let Some(id) = record.id() {
                self.index(euid, id);
            }
            self.entries.shift_insert(at, euid, record);
            at += 1;
            inserted += 1;
        }
        inserted
    }

    /// Removes `record`, keeping the order of the rest. Returns false if it
    /// was not a member.
    pub fn remove(&mut self, record: &Record) -> bool {
        let euid = record.euid();
        if self.entries.shift_remove(&euid).is_none() {
            return false;
        }
        self.unindex(euid);
        true
    }

    /// Refreshes the key index for a member whose primary key changed.
    /// No-op when the record is still filed under its current key.
    pub fn reindex(&mut self, record: &Record) {
        let euid = record.euid();
        if !self.entries.contains_key(&euid) {
            return;
        }
        let id = record.id();
        if self.indexed.get(&euid) == id.as_ref() {
            return;
        }
        self.unindex(euid);
        if let Some(id) = id {
            self.index(euid, id);
        }
    }

    fn index(&mut self, euid: Euid, id: RecordId) {
        self.keys.entry(id.clone()).or_default().push(euid);
        self.indexed.insert(euid, id);
    }

    fn unindex(&mut self, euid: Euid) {
        let Some(id) = self.indexed.remove(&euid) else {
            return;
        };
        if let Some(euids) = self.keys.get_mut(&id) {
            euids.retain(|entry| *entry != euid);
            if euids.is_empty() {
                self.keys.remove(&id);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &RecordRef> {
        self.entries.values()
    }

    /// Snapshot of the members in order.
    pub fn records(&self) -> Vec<RecordRef> {
        self.entries.values().cloned().collect()
    }

    pub fn for_each<F: FnMut(&RecordRef, usize)>(&self, mut f: F) {
        for (index, record) in self.entries.values().enumerate() {
            f(record, index);
        }
    }

    pub fn map<T, F: FnMut(&RecordRef, usize) -> T>(&self, mut f: F) -> Vec<T> {
        self.entries
            .values()
            .enumerate()
            .map(|(index, record)| f(record, index))
            .collect()
    }

    pub fn filter<F: FnMut(&RecordRef, usize) -> bool>(&self, mut f: F) -> Vec<RecordRef> {
        self.entries
            .values()
            .enumerate()
            .filter(|(index, record)| f(record, *index))
            .map(|(_, record)| record.clone())
            .collect()
    }

    pub fn find<F: FnMut(&RecordRef, usize) -> bool>(&self, mut f: F) -> Option<RecordRef> {
        self.entries
            .values()
            .enumerate()
            .find(|(index, record)| f(record, *index))
            .map(|(_, record)| record.clone())
    }

    /// Stable in-place sort.
    pub fn sort_by<F>(&mut self, mut compare: F)
    where
        F: FnMut(&RecordRef, &RecordRef) -> Ordering,
    {
        self.entries.sort_by(|_, a, _, b| compare(a, b));
    }

    /// Empties the set, returning the former members in order.
    pub fn clear(&mut self) -> Vec<RecordRef> {
        self.keys.clear();
        self.indexed.clear();
        self.entries.drain(..).map(|(_, record)| record).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kind::RecordKind;
    use crate::record::{attrs, SetOptions};
    use serde_json::{json, Value};
    use std::rc::{Rc, Weak};

    fn record(value: Value) -> RecordRef {
        Record::new(RecordKind::new("item").shared(), attrs(value), Weak::new(), None)
    }

    fn ids(set: &IdentitySet) -> Vec<String> {
        set.map(|r, _| r.id().map(|id| id.to_string()).unwrap_or_default())
    }

    #[test]
    fn test_add_is_ordered_and_duplicate_free() {
        let mut set = IdentitySet::new();
        let a = record(json!({"id": "a"}));
        let b = record(json!({"id": "b"}));

        assert_eq!(set.add(vec![a.clone(), b.clone(), a.clone()], None), 2);
        assert_eq!(set.add(vec![b.clone()], None), 0);
        assert_eq!(ids(&set), vec!["a", "b"]);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_add_at_index_is_clamped() {
        let mut set = IdentitySet::new();
        set.add(vec![record(json!({"id": 1})), record(json!({"id": 2}))], None);
        set.add(vec![record(json!({"id": 0}))], Some(0));
        set.add(vec![record(json!({"id": 9}))], Some(100));
        assert_eq!(ids(&set), vec!["0", "1", "2", "9"]);
    }

    #[test]
    fn test_lookup_by_key_and_euid() {
        let mut set = IdentitySet::new();
        let a = record(json!({"id": 7}));
        let fresh = record(json!({"title": "new"}));
        set.add(vec![a.clone(), fresh.clone()], None);

        assert!(set.has(&Identity::Key(RecordId::from("7"))));
        assert!(set.has(&fresh.identity()));
        assert!(!set.has(&Identity::Key(RecordId::from(8))));
        assert!(set.has_record(&a));
    }

    #[test]
    fn test_reindex_follows_primary_key_change() {
        let mut set = IdentitySet::new();
        let fresh = record(json!({"title": "new"}));
        set.add(vec![fresh.clone()], None);

        fresh.set(attrs(json!({"id": 42})), SetOptions::default()).unwrap();
        // Stale index: key unknown until reindexed
        assert!(!set.has(&Identity::Key(RecordId::from(42))));
        set.reindex(&fresh);
        assert!(set.has(&Identity::Key(RecordId::from(42))));

        fresh.set(attrs(json!({"id": 43})), SetOptions::default()).unwrap();
        // Old key never resolves to a record that no longer carries it
        assert!(!set.has(&Identity::Key(RecordId::from(42))));
    }

    #[test]
    fn test_shared_key_survives_removal_of_either_holder() {
        let mut set = IdentitySet::new();
        let first = record(json!({"id": 1}));
        let second = record(json!({"id": 1}));
        set.add(vec![first.clone(), second.clone()], None);

        let key = Identity::Key(RecordId::from(1));
        assert!(Rc::ptr_eq(set.get(&key).unwrap(), &first));

        assert!(set.remove(&second));
        assert!(Rc::ptr_eq(set.get(&key).unwrap(), &first));

        set.add(vec![second.clone()], None);
        assert!(set.remove(&first));
        assert!(Rc::ptr_eq(set.get(&key).unwrap(), &second));
        assert!(set.remove(&second));
        assert!(!set.has(&key));
    }

    #[test]
    fn test_reindex_is_noop_for_unchanged_key() {
        let mut set = IdentitySet::new();
        let records: Vec<RecordRef> = (0..3).map(|i| record(json!({"id": i}))).collect();
        set.add(records.clone(), None);

        for record in &records {
            set.reindex(record);
        }
        assert_eq!(set.keys.len(), 3);
        assert!(set.keys.values().all(|euids| euids.len() == 1));
        assert_eq!(set.indexed.len(), 3);

        records[0].set(attrs(json!({"id": 9})), SetOptions::default()).unwrap();
        set.reindex(&records[0]);
        assert!(!set.keys.contains_key(&RecordId::from(0)));
        assert_eq!(set.indexed.get(&records[0].euid()), Some(&RecordId::from(9)));
    }

    #[test]
    fn test_remove_preserves_order() {
        let mut set = IdentitySet::new();
        let (a, b, c) = (record(json!({"id": "a"})), record(json!({"id": "b"})), record(json!({"id": "c"})));
        set.add(vec![a.clone(), b.clone(), c.clone()], None);

        assert!(set.remove(&b));
        assert!(!set.remove(&b));
        assert_eq!(ids(&set), vec!["a", "c"]);
        assert_eq!(set.index_of(&c, 0), Some(1));
        assert_eq!(set.index_of(&a, 1), None);
        assert!(!set.has(&Identity::Key(RecordId::from("b"))));
    }

    #[test]
    fn test_sort_is_stable() {
        let mut set = IdentitySet::new();
        set.add(
            vec![
                record(json!({"id": "a", "rank": 2})),
                record(json!({"id": "b", "rank": 1})),
                record(json!({"id": "c", "rank": 2})),
                record(json!({"id": "d", "rank": 1})),
            ],
            None,
        );
        set.sort_by(|x, y| {
            let rx = x.get("rank").and_then(|v| v.as_i64()).unwrap_or(0);
            let ry = y.get("rank").and_then(|v| v.as_i64()).unwrap_or(0);
            rx.cmp(&ry)
        });
        assert_eq!(ids(&set), vec!["b", "d", "a", "c"]);
    }

    #[test]
    fn test_traversals() {
        let mut set = IdentitySet::new();
        set.add((1..=4).map(|i| record(json!({"id": i}))), None);

        let even = set.filter(|r, _| r.get("id").and_then(|v| v.as_i64()).unwrap_or(0) % 2 == 0);
        assert_eq!(even.len(), 2);
        assert_eq!(set.find(|_, i| i == 2).and_then(|r| r.id()), Some(RecordId::from(3)));

        let mut visited = 0;
        set.for_each(|_, _| visited += 1);
        assert_eq!(visited, 4);

        assert_eq!(set.clear().len(), 4);
        assert!(set.is_empty());
    }
}
