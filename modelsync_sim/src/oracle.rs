//! Ground truth oracle for simulation.
//!
//! The Oracle is a plain reference model of what the engine should hold:
//! - which record instance every collection contains, in order
//! - which instance the store resolves each primary key to
//! - the latest value written to each instance
//!
//! It never looks at engine internals. `verify` compares the model with
//! the live collections and store after every operation, and `observe`
//! checks that the length notifications each collection delivered form an
//! unbroken chain.

use modelsync_core::{Collection, Identity, RecordId, RecordKind, Store};
use modelsync_env::Euid;
use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

/// Model-side identity of a record instance.
pub type Instance = usize;

/// A collection notification as delivered to a listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    /// Index of the collection in the world
    pub collection: usize,

    /// Event name (`add`, `remove`, `length`, `sort`, `destroy`)
    pub event: String,

    /// Old/new length for `length` events
    pub old: usize,
    pub new: usize,

    /// Records carried by `add`/`remove` events
    pub records: usize,
}

/// What one modelled `add` did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddDelta {
    pub created: usize,
    pub adopted: usize,
    pub merged: usize,
    pub purged: usize,
}

/// The Oracle - reference model of collections and store.
#[derive(Debug, Default)]
pub struct Oracle {
    /// Primary key → instance the store resolves it to
    registry: HashMap<u32, Instance>,

    /// Latest value per instance
    values: HashMap<Instance, i64>,

    /// Ordered membership per collection
    members: Vec<Vec<(u32, Instance)>>,

    /// Instance → engine record, learned on first verification
    bindings: HashMap<Instance, Euid>,

    next_instance: Instance,

    /// Last length each collection announced
    announced: Vec<usize>,
}

impl Oracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new (empty) collection and returns its index.
    pub fn add_collection(&mut self) -> usize {
        self.members.push(Vec::new());
        self.announced.push(0);
        self.members.len() - 1
    }

    fn instance_in(&self, collection: usize, id: u32) -> Option<Instance> {
        self.members
            .get(collection)?
            .iter()
            .find(|(member, _)| *member == id)
            .map(|(_, instance)| *instance)
    }

    /// Models `Collection::add` with default options (merge, find, create).
    pub fn add(&mut self, collection: usize, items: &[(u32, i64)], purge: bool) -> AddDelta {
        let mut delta = AddDelta::default();
        if collection >= self.members.len() {
            return delta;
        }
        let mut keep: HashSet<Instance> = HashSet::new();
        let mut appended: Vec<(u32, Instance)> = Vec::new();

        for &(id, value) in items {
            let local = self.instance_in(collection, id).or_else(|| {
                appended
                    .iter()
                    .find(|(member, _)| *member == id)
                    .map(|(_, instance)| *instance)
            });
            let instance = match local {
                Some(instance) => {
                    delta.merged += 1;
                    keep.insert(instance);
                    instance
                }
                None => {
                    let instance = match self.registry.get(&id) {
                        Some(instance) => {
                            delta.adopted += 1;
                            *instance
                        }
                        None => {
                            let instance = self.next_instance;
                            self.next_instance += 1;
                            self.registry.insert(id, instance);
                            delta.created += 1;
                            instance
                        }
                    };
                    appended.push((id, instance));
                    instance
                }
            };
            self.values.insert(instance, value);
        }

        let members = &mut self.members[collection];
        if purge {
            let before = members.len();
            members.retain(|(_, instance)| keep.contains(instance));
            delta.purged = before - members.len();
        }
        members.extend(appended);
        delta
    }

    /// Models `Collection::remove`. Returns false if `id` was not a member.
    pub fn remove(&mut self, collection: usize, id: u32, complete: bool) -> bool {
        let Some(instance) = self.instance_in(collection, id) else {
            return false;
        };
        self.members[collection].retain(|(_, member)| *member != instance);
        if complete && self.registry.get(&id) == Some(&instance) {
            self.registry.remove(&id);
        }
        true
    }

    /// Models destroying the record the store resolves `id` to.
    pub fn destroy(&mut self, id: u32) -> bool {
        let Some(instance) = self.registry.remove(&id) else {
            return false;
        };
        for members in &mut self.members {
            members.retain(|(_, member)| *member != instance);
        }
        self.values.remove(&instance);
        true
    }

    /// Expected primary keys of a collection, in order.
    pub fn expected_ids(&self, collection: usize) -> Vec<u32> {
        self.members
            .get(collection)
            .map(|members| members.iter().map(|(id, _)| *id).collect())
            .unwrap_or_default()
    }

    /// Primary keys the store should resolve.
    pub fn registered_ids(&self) -> HashSet<u32> {
        self.registry.keys().copied().collect()
    }

    pub fn is_member(&self, collection: usize, id: u32) -> bool {
        self.instance_in(collection, id).is_some()
    }

    pub fn is_registered(&self, id: u32) -> bool {
        self.registry.contains_key(&id)
    }

    fn bind(&mut self, instance: Instance, euid: Euid) -> Result<(), String> {
        match self.bindings.get(&instance) {
            Some(bound) if *bound != euid => Err(format!(
                "instance {} resolved to record {} but was bound to {}",
                instance, euid, bound
            )),
            Some(_) => Ok(()),
            None => {
                self.bindings.insert(instance, euid);
                Ok(())
            }
        }
    }

    /// Compares the model with the live engine.
    pub fn verify(&mut self, collections: &[Rc<Collection>], store: &Store, kind: &RecordKind) -> Result<(), String> {
        for (index, collection) in collections.iter().enumerate() {
            let Some(expected) = self.members.get(index).cloned() else {
                continue;
            };
            let records = collection.records();

            if collection.len() != records.len() {
                return Err(format!(
                    "collection {}: length {} != {} members",
                    index,
                    collection.len(),
                    records.len()
                ));
            }
            let actual: Vec<String> = records
                .iter()
                .map(|r| r.id().map(|id| id.to_string()).unwrap_or_default())
                .collect();
            let wanted: Vec<String> = expected.iter().map(|(id, _)| id.to_string()).collect();
            if actual != wanted {
                return Err(format!("collection {}: members {:?}, expected {:?}", index, actual, wanted));
            }

            for ((id, instance), record) in expected.iter().zip(&records) {
                self.bind(*instance, record.euid())?;
                let value = self.values.get(instance).copied();
                if record.get("v") != value.map(|v| json!(v)) {
                    return Err(format!(
                        "collection {}: record {} has v={:?}, expected {:?}",
                        index,
                        id,
                        record.get("v"),
                        value
                    ));
                }
            }
        }

        if store.count(kind) != self.registry.len() {
            return Err(format!(
                "store holds {} records, expected {}",
                store.count(kind),
                self.registry.len()
            ));
        }
        let registry: Vec<(u32, Instance)> = self.registry.iter().map(|(id, i)| (*id, *i)).collect();
        for (id, instance) in registry {
            let identity = Identity::Key(RecordId::from(i64::from(id)));
            let Some(record) = store.get(kind, &identity) else {
                return Err(format!("store lost record {}", id));
            };
            self.bind(instance, record.euid())?;
        }
        Ok(())
    }

    /// Checks delivered notifications: each `length` event must start where
    /// the previous one for the same collection ended.
    pub fn observe(&mut self, notifications: &[Notification]) -> Result<(), String> {
        for note in notifications.iter().filter(|n| n.event == "length") {
            let Some(last) = self.announced.get_mut(note.collection) else {
                continue;
            };
            if note.old != *last {
                return Err(format!(
                    "collection {}: length notification {}->{} after {}",
                    note.collection, note.old, note.new, last
                ));
            }
            *last = note.new;
        }
        Ok(())
    }

    /// Once the runloop is idle, the last announced length must be the
    /// actual length.
    pub fn check_settled(&self, collections: &[Rc<Collection>]) -> Result<(), String> {
        for (index, collection) in collections.iter().enumerate() {
            let announced = self.announced.get(index).copied().unwrap_or(0);
            if announced != collection.len() {
                return Err(format!(
                    "collection {}: announced length {} but holds {}",
                    index,
                    announced,
                    collection.len()
                ));
            }
        }
        Ok(())
    }
}
