//! The Collection - ordered record set with identity reconciliation.
//!
//! `add` resolves every incoming element against what the collection (and
//! the store) already hold:
//!
//! 1. already a member (or resolved earlier in the same batch) → merge
//! 2. attribute hash known to the store → adopt the store's record
//! 3. record instance → insert as-is
//! 4. attribute hash → create a new owned record through the store
//! 5. otherwise → drop
//!
//! Membership and `length` change synchronously. Notifications (`add`,
//! `remove`, `length`, `sort`, `destroy`) go through the runloop `event`
//! channel and arrive on the next flush.

use crate::error::SyncError;
use crate::events::{Callback, EventEmitter, ListenerId, Listeners, NamedEvent};
use crate::identity_set::IdentitySet;
use crate::kind::RecordKind;
use crate::record::{Attributes, DestroyOptions, Identity, Record, RecordEvent, RecordId, RecordRef, SetOptions};
use crate::runloop::channel;
use crate::store::{RecordOptions, Store, StoreOptions};
use modelsync_env::Euid;
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::{Rc, Weak};
use tracing::{trace, warn};

/// Orders two records.
pub type Comparator = Rc<dyn Fn(&RecordRef, &RecordRef) -> Ordering>;

/// Turns a raw payload (as returned by a source) into record data.
pub type PayloadParseFn = Rc<dyn Fn(Value) -> Value>;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for a Collection
#[derive(Clone, Default)]
pub struct CollectionConfig {
    /// Keep owned records alive (owner cleared) when the collection is
    /// destroyed (default: false)
    pub preserve_records: bool,

    /// Payload hook used by `parse` (default: identity)
    pub parse: Option<PayloadParseFn>,

    /// Comparator used by `sort` (default: none, `sort` is a no-op)
    pub comparator: Option<Comparator>,
}

impl fmt::Debug for CollectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionConfig")
            .field("preserve_records", &self.preserve_records)
            .field("parse", &self.parse.is_some())
            .field("comparator", &self.comparator.is_some())
            .finish()
    }
}

/// Options for `Collection::add`.
#[derive(Debug, Clone, Copy)]
pub struct AddOptions {
    /// Apply incoming attributes to records already present (default: true)
    pub merge: bool,

    /// Remove members not present in the incoming batch (default: false)
    pub purge: bool,

    /// Suppress `add`/`length` notifications and record `change` events
    /// (default: false)
    pub silent: bool,

    /// Run the kind's parse hook on incoming attribute hashes before
    /// reading their identity (default: false)
    pub parse: bool,

    /// Look attribute hashes up in the store before creating (default: true)
    pub find: bool,

    /// Create records for unknown attribute hashes (default: true)
    pub create: bool,
}

impl Default for AddOptions {
    fn default() -> Self {
        Self {
            merge: true,
            purge: false,
            silent: false,
            parse: false,
            find: true,
            create: true,
        }
    }
}

/// Options for `Collection::remove`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveOptions {
    pub silent: bool,

    /// Destroy each removed record (takes precedence over `complete`)
    pub destroy: bool,

    /// Also remove each record from the store
    pub complete: bool,
}

// ============================================================================
// INPUT / OUTPUT
// ============================================================================

/// One element handed to `add`.
#[derive(Debug, Clone)]
pub enum Incoming {
    Record(RecordRef),
    Attributes(Attributes),
}

impl From<RecordRef> for Incoming {
    fn from(record: RecordRef) -> Self {
        Incoming::Record(record)
    }
}

impl From<Attributes> for Incoming {
    fn from(attributes: Attributes) -> Self {
        Incoming::Attributes(attributes)
    }
}

/// Why an element was not added.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// No primary identity could be read and creation was disabled.
    AmbiguousIdentity,
    /// Identity present but unknown, and creation was disabled.
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dropped {
    /// Position in the incoming batch
    pub index: usize,
    pub reason: DropReason,
}

/// Result of `Collection::add`.
#[derive(Debug, Clone, Default)]
pub struct AddOutcome {
    /// Records that became members, in insertion order
    pub added: Vec<RecordRef>,

    /// Members matched by identity (updated when `merge` is set)
    pub merged: Vec<RecordRef>,

    /// Elements skipped without error
    pub dropped: Vec<Dropped>,

    /// Elements refused, with the error for each
    pub rejected: Vec<(usize, SyncError)>,
}

/// Events emitted by a collection.
#[derive(Debug, Clone)]
pub enum CollectionEvent {
    Add { records: Vec<RecordRef> },
    Remove { records: Vec<RecordRef> },
    Length { old: usize, new: usize },
    Sort,
    Destroy,
}

impl NamedEvent for CollectionEvent {
    fn name(&self) -> &str {
        match self {
            CollectionEvent::Add { .. } => "add",
            CollectionEvent::Remove { .. } => "remove",
            CollectionEvent::Length { .. } => "length",
            CollectionEvent::Sort => "sort",
            CollectionEvent::Destroy => "destroy",
        }
    }
}

// ============================================================================
// COLLECTION
// ============================================================================

pub struct Collection {
    euid: Euid,
    kind: Rc<RecordKind>,
    store: Rc<Store>,
    config: CollectionConfig,
    models: RefCell<IdentitySet>,
    length: Cell<usize>,
    subscriptions: RefCell<HashMap<Euid, ListenerId>>,
    listeners: Listeners<CollectionEvent>,
    destroyed: Cell<bool>,
    self_ref: Weak<Collection>,
}

impl Collection {
    pub fn new(kind: Rc<RecordKind>, store: Rc<Store>) -> Rc<Self> {
        Self::with_config(kind, store, CollectionConfig::default())
    }

    pub fn with_config(kind: Rc<RecordKind>, store: Rc<Store>, config: CollectionConfig) -> Rc<Self> {
        Rc::new_cyclic(|me| Collection {
            euid: Euid::next(),
            kind,
            store,
            config,
            models: RefCell::new(IdentitySet::new()),
            length: Cell::new(0),
            subscriptions: RefCell::new(HashMap::new()),
            listeners: Listeners::new(),
            destroyed: Cell::new(false),
            self_ref: me.clone(),
        })
    }

    pub fn euid(&self) -> Euid {
        self.euid
    }

    pub fn kind(&self) -> &Rc<RecordKind> {
        &self.kind
    }

    pub fn store(&self) -> &Rc<Store> {
        &self.store
    }

    pub fn config(&self) -> &CollectionConfig {
        &self.config
    }

    /// Always equal to the number of members.
    pub fn len(&self) -> usize {
        self.length.get()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.get()
    }

    // ------------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------------

    /// Reconciles `incoming` against the members, appending new records.
    pub fn add<I>(&self, incoming: I, options: AddOptions) -> AddOutcome
    where
        I: IntoIterator<Item = Incoming>,
    {
        self.reconcile(incoming, None, options)
    }

    /// Like `add`, inserting new records starting at `index`.
    pub fn add_at<I>(&self, incoming: I, index: usize, options: AddOptions) -> AddOutcome
    where
        I: IntoIterator<Item = Incoming>,
    {
        self.reconcile(incoming, Some(index), options)
    }

    fn reconcile<I>(&self, incoming: I, index: Option<usize>, options: AddOptions) -> AddOutcome
    where
        I: IntoIterator<Item = Incoming>,
    {
        let mut outcome = AddOutcome::default();
        if self.destroyed.get() {
            warn!(collection = %self.euid, "add on destroyed collection ignored");
            return outcome;
        }

        let mut keep: HashSet<Euid> = HashSet::new();
        let mut batch = IdentitySet::new();

        for (position, item) in incoming.into_iter().enumerate() {
            match item {
                Incoming::Record(record) => {
                    if record.is_destroyed() {
                        outcome
                            .rejected
                            .push((position, SyncError::InvalidRecordState { euid: record.euid() }));
                        continue;
                    }
                    if !record.kind().is_a(&self.kind) {
                        outcome.rejected.push((
                            position,
                            SyncError::KindMismatch {
                                expected: self.kind.name().to_string(),
                                found: record.kind().name().to_string(),
                            },
                        ));
                        continue;
                    }

                    match self.resolve_local(&record.identity(), &batch) {
                        Some(existing) => {
                            if options.merge && !Rc::ptr_eq(&existing, &record) {
                                let attributes = record.attributes();
                                self.merge_into(&existing, attributes, options, position, &mut outcome);
                            }
                            keep.insert(existing.euid());
                            outcome.merged.push(existing);
                        }
                        None => {
                            batch.add([Rc::clone(&record)], None);
                            outcome.added.push(record);
                        }
                    }
                }
                Incoming::Attributes(attributes) => {
                    let attributes = if options.parse {
                        self.kind.parse(attributes)
                    } else {
                        attributes
                    };
                    let id = attributes
                        .get(self.kind.primary_key())
                        .and_then(RecordId::from_value);

                    if let Some(existing) = id
                        .as_ref()
                        .and_then(|id| self.resolve_local(&Identity::Key(id.clone()), &batch))
                    {
                        if options.merge {
                            self.merge_into(&existing, attributes, options, position, &mut outcome);
                        }
                        keep.insert(existing.euid());
                        outcome.merged.push(existing);
                        continue;
                    }

                    if options.find {
                        if let Some(found) = id
                            .as_ref()
                            .and_then(|id| self.store.get(&self.kind, &Identity::Key(id.clone())))
                        {
                            trace!(collection = %self.euid, record = %found.euid(), "adopted from store");
                            // Adoption always merges
                            self.merge_into(&found, attributes, options, position, &mut outcome);
                            batch.add([Rc::clone(&found)], None);
                            outcome.added.push(found);
                            continue;
                        }
                    }

                    if options.create {
                        let record = self.store.create(
                            &self.kind,
                            attributes,
                            RecordOptions {
                                owner: Some(self.euid),
                                parse: false,
                                silent: options.silent,
                            },
                        );
                        batch.add([Rc::clone(&record)], None);
                        outcome.added.push(record);
                        continue;
                    }

                    outcome.dropped.push(Dropped {
                        index: position,
                        reason: if id.is_none() {
                            DropReason::AmbiguousIdentity
                        } else {
                            DropReason::NotFound
                        },
                    });
                }
            }
        }

        if options.purge {
            let stale: Vec<RecordRef> = self
                .models
                .borrow()
                .filter(|record, _| !keep.contains(&record.euid()));
            if !stale.is_empty() {
                self.remove(
                    &stale,
                    RemoveOptions {
                        silent: options.silent,
                        ..Default::default()
                    },
                );
            }
        }

        // Purge has already notified its own shrink
        let old_len = self.length.get();
        for record in &outcome.added {
            self.subscribe_to(record);
        }
        self.models.borrow_mut().add(outcome.added.iter().cloned(), index);
        let new_len = self.models.borrow().len();
        self.length.set(new_len);

        if !options.silent {
            if old_len != new_len {
                self.emit(CollectionEvent::Length {
                    old: old_len,
                    new: new_len,
                });
            }
            if !outcome.added.is_empty() {
                self.emit(CollectionEvent::Add {
                    records: outcome.added.clone(),
                });
            }
        }
        outcome
    }

    /// Member (or earlier element of the current batch) with `identity`.
    fn resolve_local(&self, identity: &Identity, batch: &IdentitySet) -> Option<RecordRef> {
        self.models
            .borrow()
            .get(identity)
            .cloned()
            .or_else(|| batch.get(identity).cloned())
    }

    fn merge_into(
        &self,
        record: &RecordRef,
        attributes: Attributes,
        options: AddOptions,
        position: usize,
        outcome: &mut AddOutcome,
    ) {
        if let Err(err) = record.set(attributes, SetOptions { silent: options.silent }) {
            outcome.rejected.push((position, err));
        }
    }

    fn subscribe_to(&self, record: &RecordRef) {
        if self.subscriptions.borrow().contains_key(&record.euid()) {
            return;
        }
        let collection = self.self_ref.clone();
        let id = record.subscribe(
            None,
            Rc::new(move |event: &RecordEvent| {
                if let Some(collection) = collection.upgrade() {
                    collection.on_record_event(event);
                }
            }),
        );
        self.subscriptions.borrow_mut().insert(record.euid(), id);
    }

    fn unsubscribe_from(&self, record: &Record) {
        let listener = self.subscriptions.borrow_mut().remove(&record.euid());
        if let Some(id) = listener {
            record.unsubscribe(id);
        }
    }

    fn on_record_event(&self, event: &RecordEvent) {
        match event {
            RecordEvent::Destroy { record } => {
                self.remove(std::slice::from_ref(record), RemoveOptions::default());
            }
            RecordEvent::Change { record, changed } => {
                if changed.iter().any(|key| key == record.primary_key()) {
                    self.models.borrow_mut().reindex(record);
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Removal
    // ------------------------------------------------------------------------

    /// Removes `records`, returning the ones that were actually members.
    pub fn remove(&self, records: &[RecordRef], options: RemoveOptions) -> Vec<RecordRef> {
        if self.destroyed.get() {
            return Vec::new();
        }

        let mut removed = Vec::new();
        for record in records {
            let was_member = self.models.borrow_mut().remove(record);
            if !was_member {
                continue;
            }
            self.unsubscribe_from(record);
            removed.push(Rc::clone(record));

            if options.destroy {
                record.destroy(DestroyOptions { silent: options.silent });
            } else if options.complete {
                self.store.remove(record, StoreOptions { silent: options.silent });
            }
        }

        let old_len = self.length.get();
        let new_len = self.models.borrow().len();
        self.length.set(new_len);

        if !options.silent {
            if old_len != new_len {
                self.emit(CollectionEvent::Length {
                    old: old_len,
                    new: new_len,
                });
            }
            if !removed.is_empty() {
                self.emit(CollectionEvent::Remove {
                    records: removed.clone(),
                });
            }
        }
        removed
    }

    /// Removes every member without destroying it.
    pub fn remove_all(&self) -> Vec<RecordRef> {
        let members = self.models.borrow().records();
        self.remove(&members, RemoveOptions::default())
    }

    /// Removes and destroys every member.
    pub fn destroy_all(&self) -> Vec<RecordRef> {
        let members = self.models.borrow().records();
        self.remove(
            &members,
            RemoveOptions {
                destroy: true,
                ..Default::default()
            },
        )
    }

    /// Tears the collection down.
    ///
    /// Records it owns are destroyed, or merely disowned when
    /// `preserve_records` is set. Every later mutation is a no-op.
    pub fn destroy(&self) {
        if self.destroyed.get() {
            return;
        }
        for record in self.remove_all() {
            if record.owner() != Some(self.euid) {
                continue;
            }
            if self.config.preserve_records {
                record.set_owner(None);
            } else {
                record.destroy(DestroyOptions::default());
            }
        }
        self.destroyed.set(true);
        self.emit(CollectionEvent::Destroy);
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn at(&self, index: usize) -> Option<RecordRef> {
        self.models.borrow().at(index).cloned()
    }

    pub fn has(&self, identity: &Identity) -> bool {
        self.models.borrow().has(identity)
    }

    /// Membership of this exact record instance.
    pub fn contains(&self, record: &Record) -> bool {
        self.models.borrow().has_record(record)
    }

    pub fn get(&self, identity: &Identity) -> Option<RecordRef> {
        self.models.borrow().get(identity).cloned()
    }

    pub fn index_of(&self, record: &Record, offset: usize) -> Option<usize> {
        self.models.borrow().index_of(record, offset)
    }

    /// Snapshot of the members in order.
    pub fn records(&self) -> Vec<RecordRef> {
        self.models.borrow().records()
    }

    // Traversals run over a snapshot so callbacks may mutate the collection.

    pub fn for_each<F: FnMut(&RecordRef, usize)>(&self, mut f: F) {
        for (index, record) in self.records().iter().enumerate() {
            f(record, index);
        }
    }

    pub fn map<T, F: FnMut(&RecordRef, usize) -> T>(&self, mut f: F) -> Vec<T> {
        self.records()
            .iter()
            .enumerate()
            .map(|(index, record)| f(record, index))
            .collect()
    }

    pub fn filter<F: FnMut(&RecordRef, usize) -> bool>(&self, mut f: F) -> Vec<RecordRef> {
        self.records()
            .into_iter()
            .enumerate()
            .filter(|(index, record)| f(record, *index))
            .map(|(_, record)| record)
            .collect()
    }

    pub fn find<F: FnMut(&RecordRef, usize) -> bool>(&self, mut f: F) -> Option<RecordRef> {
        self.records()
            .into_iter()
            .enumerate()
            .find(|(index, record)| f(record, *index))
            .map(|(_, record)| record)
    }

    // ------------------------------------------------------------------------
    // Ordering & serialization
    // ------------------------------------------------------------------------

    /// Stable sort by `compare`; emits `sort`.
    pub fn sort_by<F>(&self, compare: F)
    where
        F: FnMut(&RecordRef, &RecordRef) -> Ordering,
    {
        if self.destroyed.get() {
            return;
        }
        self.models.borrow_mut().sort_by(compare);
        self.emit(CollectionEvent::Sort);
    }

    /// Sorts with the configured comparator. No-op without one.
    pub fn sort(&self) {
        if let Some(comparator) = self.config.comparator.clone() {
            self.sort_by(|a, b| comparator(a, b));
        }
    }

    /// Plain JSON form of every member, in order.
    pub fn raw(&self) -> Vec<Value> {
        self.map(|record, _| record.raw())
    }

    pub fn to_json(&self) -> Result<String, SyncError> {
        Ok(serde_json::to_string(&Value::Array(self.raw()))?)
    }

    /// Turns a source payload into attribute hashes ready for `add`.
    ///
    /// The configured hook runs first; the result may be an array of
    /// objects or a single object. Anything else yields nothing.
    pub fn parse(&self, data: Value) -> Vec<Attributes> {
        let data = match &self.config.parse {
            Some(parse) => parse(data),
            None => data,
        };
        match data {
            Value::Array(items) => items
                .into_iter()
                .filter_map(|item| match item {
                    Value::Object(map) => Some(map),
                    _ => None,
                })
                .collect(),
            Value::Object(map) => vec![map],
            _ => Vec::new(),
        }
    }

    fn deliver(&self, event: &CollectionEvent) {
        self.listeners.dispatch(event);
        if matches!(event, CollectionEvent::Destroy) {
            self.listeners.clear();
        }
    }
}

impl EventEmitter for Collection {
    type Event = CollectionEvent;

    fn subscribe(&self, event: Option<&str>, callback: Callback<CollectionEvent>) -> ListenerId {
        self.listeners.add(event, callback)
    }

    fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Deferred through the `event` channel.
    fn emit(&self, event: CollectionEvent) {
        let target = self.self_ref.clone();
        let queued = self.store.runloop().enqueue(
            channel::EVENT,
            Box::new(move || {
                if let Some(collection) = target.upgrade() {
                    collection.deliver(&event);
                }
            }),
        );
        if let Err(err) = queued {
            warn!(collection = %self.euid, %err, "collection event dropped");
        }
    }
}

impl Drop for Collection {
    fn drop(&mut self) {
        let subscriptions = std::mem::take(self.subscriptions.get_mut());
        for record in self.models.get_mut().iter() {
            if let Some(id) = subscriptions.get(&record.euid()) {
                record.unsubscribe(*id);
            }
        }
    }
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("euid", &self.euid)
            .field("kind", &self.kind.name())
            .field("length", &self.length.get())
            .field("destroyed", &self.destroyed.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::attrs;
    use crate::runloop::{Runloop, RunloopConfig};
    use serde_json::json;

    fn setup() -> (Rc<Runloop>, Rc<Store>, Rc<RecordKind>) {
        let runloop = Rc::new(Runloop::standard(RunloopConfig::default()));
        let store = Store::new(runloop.clone());
        (runloop, store, RecordKind::new("item").shared())
    }

    fn hash(value: Value) -> Incoming {
        Incoming::Attributes(attrs(value))
    }

    fn ids(collection: &Collection) -> Vec<String> {
        collection.map(|r, _| r.id().map(|id| id.to_string()).unwrap_or_default())
    }

    fn key(id: i64) -> Identity {
        Identity::Key(RecordId::from(id))
    }

    fn event_log(collection: &Collection) -> Rc<RefCell<Vec<String>>> {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = log.clone();
        collection.subscribe(
            None,
            Rc::new(move |event: &CollectionEvent| {
                let entry = match event {
                    CollectionEvent::Add { records } => format!("add:{}", records.len()),
                    CollectionEvent::Remove { records } => format!("remove:{}", records.len()),
                    CollectionEvent::Length { old, new } => format!("length:{}->{}", old, new),
                    other => other.name().to_string(),
                };
                sink.borrow_mut().push(entry);
            }),
        );
        log
    }

    #[test]
    fn test_add_creates_owned_records() {
        let (_, store, kind) = setup();
        let items = Collection::new(kind.clone(), store.clone());

        let outcome = items.add([hash(json!({"id": 1})), hash(json!({"id": 2}))], AddOptions::default());

        assert_eq!(outcome.added.len(), 2);
        assert_eq!(items.len(), 2);
        assert_eq!(ids(&items), vec!["1", "2"]);
        assert!(outcome.added.iter().all(|r| r.owner() == Some(items.euid())));
        assert!(store.has(&kind, &key(2)));
    }

    #[test]
    fn test_merge_never_grows_length() {
        let (_, store, kind) = setup();
        let items = Collection::new(kind, store);
        items.add([hash(json!({"id": 1, "v": 1}))], AddOptions::default());
        let original = items.at(0).unwrap();

        let outcome = items.add([hash(json!({"id": 1, "v": 2}))], AddOptions::default());

        assert!(outcome.added.is_empty());
        assert_eq!(outcome.merged.len(), 1);
        assert!(Rc::ptr_eq(&outcome.merged[0], &original));
        assert_eq!(items.len(), 1);
        assert_eq!(original.get("v"), Some(json!(2)));
    }

    #[test]
    fn test_merge_disabled_keeps_attributes() {
        let (_, store, kind) = setup();
        let items = Collection::new(kind, store);
        items.add([hash(json!({"id": 1, "v": 1}))], AddOptions::default());

        let outcome = items.add(
            [hash(json!({"id": 1, "v": 2}))],
            AddOptions {
                merge: false,
                ..Default::default()
            },
        );

        assert_eq!(outcome.merged.len(), 1);
        assert_eq!(items.at(0).unwrap().get("v"), Some(json!(1)));
    }

    #[test]
    fn test_duplicate_in_one_batch_inserted_once() {
        let (_, store, kind) = setup();
        let items = Collection::new(kind.clone(), store.clone());

        let outcome = items.add(
            [hash(json!({"id": 7, "v": 1})), hash(json!({"id": 7, "v": 2}))],
            AddOptions::default(),
        );

        assert_eq!(outcome.added.len(), 1);
        assert_eq!(outcome.merged.len(), 1);
        assert_eq!(items.len(), 1);
        assert_eq!(items.at(0).unwrap().get("v"), Some(json!(2)));
        assert_eq!(store.count(&kind), 1);
    }

    #[test]
    fn test_purge_keeps_only_incoming() {
        let (_, store, kind) = setup();
        let items = Collection::new(kind.clone(), store.clone());
        items.add([hash(json!({"id": 1, "v": 1})), hash(json!({"id": 2, "v": 1}))], AddOptions::default());
        let a = items.at(0).unwrap();
        let b = items.at(1).unwrap();

        let outcome = items.add(
            [hash(json!({"id": 1, "v": 2}))],
            AddOptions {
                purge: true,
                ..Default::default()
            },
        );

        assert!(outcome.added.is_empty());
        assert_eq!(ids(&items), vec!["1"]);
        assert!(Rc::ptr_eq(&items.at(0).unwrap(), &a));
        assert_eq!(a.get("v"), Some(json!(2)));
        // Purged, not destroyed
        assert!(!b.is_destroyed());
        assert!(store.has(&kind, &key(2)));
    }

    #[test]
    fn test_adoption_shares_the_store_instance() {
        let (_, store, kind) = setup();
        let left = Collection::new(kind.clone(), store.clone());
        let right = Collection::new(kind, store);
        left.add([hash(json!({"id": 5, "v": 1}))], AddOptions::default());

        let outcome = right.add([hash(json!({"id": 5, "v": 9}))], AddOptions::default());

        assert_eq!(outcome.added.len(), 1);
        let shared = left.at(0).unwrap();
        assert!(Rc::ptr_eq(&outcome.added[0], &shared));
        assert_eq!(shared.get("v"), Some(json!(9)));
        // Ownership stays with the creator
        assert_eq!(shared.owner(), Some(left.euid()));
    }

    #[test]
    fn test_adopted_records_are_exempt_from_purge() {
        let (_, store, kind) = setup();
        let left = Collection::new(kind.clone(), store.clone());
        let right = Collection::new(kind, store);
        left.add([hash(json!({"id": 1}))], AddOptions::default());
        right.add([hash(json!({"id": 2}))], AddOptions::default());

        right.add(
            [hash(json!({"id": 1}))],
            AddOptions {
                purge: true,
                ..Default::default()
            },
        );

        assert_eq!(ids(&right), vec!["1"]);
    }

    #[test]
    fn test_find_disabled_creates_a_new_instance() {
        let (_, store, kind) = setup();
        let left = Collection::new(kind.clone(), store.clone());
        let right = Collection::new(kind, store);
        left.add([hash(json!({"id": 1}))], AddOptions::default());

        let outcome = right.add(
            [hash(json!({"id": 1}))],
            AddOptions {
                find: false,
                ..Default::default()
            },
        );

        assert!(!Rc::ptr_eq(&outcome.added[0], &left.at(0).unwrap()));
        assert_eq!(outcome.added[0].owner(), Some(right.euid()));
    }

    #[test]
    fn test_destroying_unfound_duplicate_keeps_original_adoptable() {
        let (_, store, kind) = setup();
        let left = Collection::new(kind.clone(), store.clone());
        let right = Collection::new(kind.clone(), store.clone());
        let third = Collection::new(kind, store.clone());
        left.add([hash(json!({"id": 1}))], AddOptions::default());
        let duplicate = right.add(
            [hash(json!({"id": 1}))],
            AddOptions {
                find: false,
                ..Default::default()
            },
        );

        duplicate.added[0].destroy(DestroyOptions::default());
        third.add([hash(json!({"id": 1}))], AddOptions::default());

        let original = left.at(0).unwrap();
        assert!(!original.is_destroyed());
        assert!(Rc::ptr_eq(&third.at(0).unwrap(), &original));
        assert!(right.is_empty());
    }

    #[test]
    fn test_drop_reasons_without_create() {
        let (_, store, kind) = setup();
        let items = Collection::new(kind, store);

        let outcome = items.add(
            [hash(json!({"name": "anonymous"})), hash(json!({"id": 99}))],
            AddOptions {
                create: false,
                ..Default::default()
            },
        );

        assert!(items.is_empty());
        assert_eq!(
            outcome.dropped,
            vec![
                Dropped {
                    index: 0,
                    reason: DropReason::AmbiguousIdentity
                },
                Dropped {
                    index: 1,
                    reason: DropReason::NotFound
                },
            ]
        );
    }

    #[test]
    fn test_bad_elements_are_rejected_individually() {
        let (_, store, kind) = setup();
        let other = RecordKind::new("other").shared();
        let items = Collection::new(kind.clone(), store.clone());

        let dead = store.create(&kind, attrs(json!({"id": 1})), RecordOptions::default());
        dead.destroy(DestroyOptions::default());
        let foreign = store.create(&other, attrs(json!({"id": 2})), RecordOptions::default());

        let outcome = items.add(
            [Incoming::Record(dead.clone()), Incoming::Record(foreign), hash(json!({"id": 3}))],
            AddOptions::default(),
        );

        assert_eq!(outcome.added.len(), 1);
        assert_eq!(outcome.rejected.len(), 2);
        assert_eq!(outcome.rejected[0], (0, SyncError::InvalidRecordState { euid: dead.euid() }));
        assert!(matches!(outcome.rejected[1], (1, SyncError::KindMismatch { .. })));
        assert_eq!(ids(&items), vec!["3"]);
    }

    #[test]
    fn test_sub_kind_records_are_accepted() {
        let (_, store, kind) = setup();
        let special = RecordKind::extending(&kind, "special").shared();
        let items = Collection::new(kind, store.clone());
        let record = store.create(&special, attrs(json!({"id": 1})), RecordOptions::default());

        let outcome = items.add([Incoming::Record(record)], AddOptions::default());
        assert_eq!(outcome.added.len(), 1);
        assert!(outcome.rejected.is_empty());
    }

    #[test]
    fn test_record_instance_with_known_identity_merges() {
        let (_, store, kind) = setup();
        let items = Collection::new(kind.clone(), store.clone());
        items.add([hash(json!({"id": 1, "v": 1}))], AddOptions::default());
        let twin = store.create(&kind, attrs(json!({"id": 1, "v": 3})), RecordOptions::default());

        let outcome = items.add([Incoming::Record(twin)], AddOptions::default());

        assert!(outcome.added.is_empty());
        assert_eq!(items.len(), 1);
        assert_eq!(items.at(0).unwrap().get("v"), Some(json!(3)));
    }

    #[test]
    fn test_add_at_index() {
        let (_, store, kind) = setup();
        let items = Collection::new(kind, store);
        items.add([hash(json!({"id": 1})), hash(json!({"id": 2}))], AddOptions::default());

        items.add_at([hash(json!({"id": 0})), hash(json!({"id": 5}))], 1, AddOptions::default());

        assert_eq!(ids(&items), vec!["1", "0", "5", "2"]);
    }

    #[test]
    fn test_parse_option_runs_kind_hook() {
        let (_, store, _) = setup();
        let kind = RecordKind::new("user")
            .with_primary_key("uid")
            .with_parse(|mut data| {
                if let Some(login) = data.remove("login") {
                    data.insert("uid".into(), login);
                }
                data
            })
            .shared();
        let users = Collection::new(kind, store);

        users.add(
            [hash(json!({"login": "ada"}))],
            AddOptions {
                parse: true,
                ..Default::default()
            },
        );

        assert!(users.has(&Identity::Key(RecordId::from("ada"))));
    }

    #[test]
    fn test_notifications_arrive_on_next_tick() {
        let (runloop, store, kind) = setup();
        let items = Collection::new(kind, store);
        let log = event_log(&items);

        items.add([hash(json!({"id": 1})), hash(json!({"id": 2}))], AddOptions::default());
        assert_eq!(items.len(), 2);
        assert!(log.borrow().is_empty());

        runloop.tick();
        assert_eq!(*log.borrow(), vec!["length:0->2", "add:2"]);

        items.add(
            [hash(json!({"id": 3}))],
            AddOptions {
                silent: true,
                ..Default::default()
            },
        );
        runloop.tick();
        assert_eq!(log.borrow().len(), 2);
        assert_eq!(items.len(), 3);
    }

    #[test]
    fn test_remove_reports_only_members() {
        let (runloop, store, kind) = setup();
        let items = Collection::new(kind.clone(), store.clone());
        items.add([hash(json!({"id": 1})), hash(json!({"id": 2}))], AddOptions::default());
        runloop.tick();
        let log = event_log(&items);
        let outsider = store.create(&kind, attrs(json!({"id": 3})), RecordOptions::default());
        let first = items.at(0).unwrap();

        let removed = items.remove(&[first.clone(), first.clone(), outsider], RemoveOptions::default());

        assert_eq!(removed.len(), 1);
        assert_eq!(items.len(), 1);
        assert!(!first.is_destroyed());
        assert!(store.contains(&first));

        runloop.tick();
        assert_eq!(*log.borrow(), vec!["length:2->1", "remove:1"]);
    }

    #[test]
    fn test_remove_destroy_takes_precedence_over_complete() {
        let (_, store, kind) = setup();
        let items = Collection::new(kind, store.clone());
        items.add([hash(json!({"id": 1})), hash(json!({"id": 2}))], AddOptions::default());
        let (a, b) = (items.at(0).unwrap(), items.at(1).unwrap());

        items.remove(
            &[a.clone()],
            RemoveOptions {
                destroy: true,
                complete: true,
                ..Default::default()
            },
        );
        items.remove(
            &[b.clone()],
            RemoveOptions {
                complete: true,
                ..Default::default()
            },
        );

        assert!(a.is_destroyed());
        assert!(!b.is_destroyed());
        assert!(!store.contains(&a));
        assert!(!store.contains(&b));
        assert!(items.is_empty());
    }

    #[test]
    fn test_destroyed_record_leaves_every_collection() {
        let (_, store, kind) = setup();
        let left = Collection::new(kind.clone(), store.clone());
        let right = Collection::new(kind, store);
        left.add([hash(json!({"id": 1})), hash(json!({"id": 2}))], AddOptions::default());
        right.add([hash(json!({"id": 1}))], AddOptions::default());

        let shared = right.at(0).unwrap();
        shared.destroy(DestroyOptions::default());

        assert_eq!(ids(&left), vec!["2"]);
        assert!(right.is_empty());
        assert!(!left.contains(&shared));
    }

    #[test]
    fn test_primary_key_change_reindexes() {
        let (_, store, kind) = setup();
        let items = Collection::new(kind, store);
        let outcome = items.add([hash(json!({"title": "draft"}))], AddOptions::default());
        let draft = &outcome.added[0];
        assert!(items.has(&draft.identity()));

        draft.set(attrs(json!({"id": 10})), SetOptions::default()).unwrap();

        assert!(items.has(&key(10)));
        assert_eq!(items.get(&key(10)).map(|r| r.euid()), Some(draft.euid()));
    }

    #[test]
    fn test_remove_all_and_destroy_all() {
        let (_, store, kind) = setup();
        let items = Collection::new(kind.clone(), store.clone());
        items.add([hash(json!({"id": 1})), hash(json!({"id": 2}))], AddOptions::default());

        let removed = items.remove_all();
        assert_eq!(removed.len(), 2);
        assert!(removed.iter().all(|r| !r.is_destroyed()));

        items.add(removed.into_iter().map(Incoming::Record), AddOptions::default());
        let destroyed = items.destroy_all();
        assert!(destroyed.iter().all(|r| r.is_destroyed()));
        assert_eq!(store.count(&kind), 0);
    }

    #[test]
    fn test_destroy_destroys_owned_records() {
        let (runloop, store, kind) = setup();
        let owner = Collection::new(kind.clone(), store.clone());
        let borrower = Collection::new(kind.clone(), store.clone());
        owner.add([hash(json!({"id": 1}))], AddOptions::default());
        borrower.add([hash(json!({"id": 1})), hash(json!({"id": 2}))], AddOptions::default());
        runloop.tick();
        let log = event_log(&borrower);

        borrower.destroy();

        // Adopted record belongs to `owner` and survives
        assert!(!owner.at(0).unwrap().is_destroyed());
        assert_eq!(owner.len(), 1);
        assert!(!store.has(&kind, &key(2)));
        assert!(borrower.is_destroyed());

        runloop.tick();
        assert_eq!(*log.borrow(), vec!["length:2->0", "remove:2", "destroy"]);

        // Later mutations are no-ops
        let outcome = borrower.add([hash(json!({"id": 3}))], AddOptions::default());
        assert!(outcome.added.is_empty());
        assert!(borrower.is_empty());
        runloop.tick();
        assert_eq!(log.borrow().len(), 3);
    }

    #[test]
    fn test_destroy_with_preserve_records() {
        let (_, store, kind) = setup();
        let items = Collection::with_config(
            kind.clone(),
            store.clone(),
            CollectionConfig {
                preserve_records: true,
                ..Default::default()
            },
        );
        items.add([hash(json!({"id": 1}))], AddOptions::default());
        let record = items.at(0).unwrap();

        items.destroy();

        assert!(!record.is_destroyed());
        assert_eq!(record.owner(), None);
        assert!(store.has(&kind, &key(1)));
    }

    #[test]
    fn test_pending_events_of_dropped_collection_are_harmless() {
        let (runloop, store, kind) = setup();
        let items = Collection::new(kind, store);
        items.add([hash(json!({"id": 1}))], AddOptions::default());
        drop(items);

        let report = runloop.tick();
        assert!(report.total() > 0);
    }

    #[test]
    fn test_sort_is_stable_and_notifies() {
        let (runloop, store, kind) = setup();
        let items = Collection::with_config(
            kind,
            store,
            CollectionConfig {
                comparator: Some(Rc::new(|a: &RecordRef, b: &RecordRef| {
                    let rank = |r: &RecordRef| r.get("rank").and_then(|v| v.as_i64()).unwrap_or(0);
                    rank(a).cmp(&rank(b))
                })),
                ..Default::default()
            },
        );
        items.add(
            [
                hash(json!({"id": "a", "rank": 2})),
                hash(json!({"id": "b", "rank": 1})),
                hash(json!({"id": "c", "rank": 2})),
            ],
            AddOptions::default(),
        );
        runloop.tick();
        let log = event_log(&items);

        items.sort();
        assert_eq!(ids(&items), vec!["b", "a", "c"]);

        items.sort_by(|a, b| b.id().cmp(&a.id()));
        assert_eq!(ids(&items), vec!["c", "b", "a"]);

        runloop.tick();
        assert_eq!(*log.borrow(), vec!["sort", "sort"]);
    }

    #[test]
    fn test_traversal_callbacks_may_mutate() {
        let (_, store, kind) = setup();
        let items = Collection::new(kind, store);
        items.add((1..=3).map(|i| hash(json!({"id": i}))), AddOptions::default());

        let handle = items.clone();
        items.for_each(|record, _| {
            handle.remove(std::slice::from_ref(record), RemoveOptions::default());
        });

        assert!(items.is_empty());
        assert!(items.at(0).is_none());
    }

    #[test]
    fn test_queries() {
        let (_, store, kind) = setup();
        let items = Collection::new(kind, store);
        items.add((1..=4).map(|i| hash(json!({"id": i, "even": i % 2 == 0}))), AddOptions::default());

        let evens = items.filter(|r, _| r.get("even") == Some(json!(true)));
        assert_eq!(evens.len(), 2);
        let third = items.find(|_, index| index == 2).unwrap();
        assert_eq!(items.index_of(&third, 0), Some(2));
        assert_eq!(items.index_of(&third, 3), None);
        assert!(items.contains(&third));
        assert!(items.has(&key(4)));
        assert!(items.at(4).is_none());
    }

    #[test]
    fn test_parse_hook_extracts_payload() {
        let (_, store, kind) = setup();
        let items = Collection::with_config(
            kind,
            store,
            CollectionConfig {
                parse: Some(Rc::new(|payload: Value| payload["results"].clone())),
                ..Default::default()
            },
        );

        let parsed = items.parse(json!({"total": 2, "results": [{"id": 1}, {"id": 2}, "junk"]}));
        assert_eq!(parsed.len(), 2);

        let single = Collection::new(RecordKind::new("x").shared(), items.store().clone());
        assert_eq!(single.parse(json!({"id": 1})).len(), 1);
        assert!(single.parse(json!(3)).is_empty());
    }

    #[test]
    fn test_raw_round_trip_through_json() {
        let (_, store, kind) = setup();
        let source = Collection::new(kind.clone(), store.clone());
        source.add(
            [hash(json!({"id": 1, "name": "a"})), hash(json!({"id": 2, "name": "b"}))],
            AddOptions::default(),
        );

        let json = source.to_json().unwrap();
        let copy = Collection::new(kind, store);
        let outcome = copy.add(
            copy.parse(serde_json::from_str(&json).unwrap())
                .into_iter()
                .map(Incoming::Attributes),
            AddOptions {
                parse: true,
                find: false,
                ..Default::default()
            },
        );

        assert_eq!(outcome.added.len(), 2);
        assert_eq!(copy.raw(), source.raw());
    }

    #[test]
    fn test_purge_length_notifications_are_contiguous() {
        let (runloop, store, kind) = setup();
        let items = Collection::new(kind, store);
        items.add([hash(json!({"id": 1})), hash(json!({"id": 2}))], AddOptions::default());
        runloop.tick();
        let log = event_log(&items);

        items.add(
            [hash(json!({"id": 1})), hash(json!({"id": 3}))],
            AddOptions {
                purge: true,
                ..Default::default()
            },
        );
        runloop.tick();

        assert_eq!(ids(&items), vec!["1", "3"]);
        assert_eq!(*log.borrow(), vec!["length:2->1", "remove:1", "length:1->2", "add:1"]);
    }
}
