//! The Store - registry of every live record, keyed by kind.
//!
//! The store owns one [`IdentitySet`] per record kind, a table of scoped
//! listeners (listeners registered for a kind rather than an instance) and
//! the named transport backends that `remote` dispatches to.
//!
//! Membership changes are immediate. Wiring the store to a record's
//! events, store notifications, remote dispatch and local queries are all
//! deferred to the shared [`Runloop`].

use crate::error::SyncError;
use crate::events::{Callback, EventEmitter, ListenerId, Listeners, NamedEvent};
use crate::identity_set::IdentitySet;
use crate::kind::RecordKind;
use crate::record::{Attributes, Identity, Record, RecordEvent, RecordRef};
use crate::runloop::{channel, Job, Runloop};
use crate::source::{RemoteOptions, Source, SourceAction, SourceSelector};
use indexmap::IndexMap;
use modelsync_env::Euid;
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};
use tracing::{debug, trace, warn};

// ============================================================================
// OPTIONS
// ============================================================================

/// Options for `Store::add` / `Store::remove`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreOptions {
    /// Suppress the store-level `add` notification.
    pub silent: bool,
}

/// Options for `Store::create`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordOptions {
    /// Owning collection, if any
    pub owner: Option<Euid>,

    /// Run the kind's parse hook on the attributes first
    pub parse: bool,

    /// Register without a store `add` notification
    pub silent: bool,
}

/// Options for `Store::find_local`.
#[derive(Debug, Clone)]
pub struct FindOptions {
    /// Pass every match (default) or only the first one
    pub all: bool,

    /// Attributes a record must carry with exactly these values
    pub attributes: Attributes,
}

impl Default for FindOptions {
    fn default() -> Self {
        Self {
            all: true,
            attributes: Attributes::new(),
        }
    }
}

// ============================================================================
// EVENTS
// ============================================================================

/// Notification delivered to scoped and instance listeners of the store.
#[derive(Debug, Clone)]
pub struct StoreEvent {
    /// Event name (`add`, `change`, `destroy`, or anything passed to `emit`)
    pub name: String,

    /// Kind the event is scoped to
    pub kind: Rc<RecordKind>,

    /// Record the event concerns
    pub record: Option<RecordRef>,

    /// Free-form payload
    pub data: Value,
}

impl StoreEvent {
    pub fn new(name: impl Into<String>, kind: &Rc<RecordKind>, record: Option<RecordRef>) -> Self {
        Self {
            name: name.into(),
            kind: Rc::clone(kind),
            record,
            data: Value::Null,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

impl NamedEvent for StoreEvent {
    fn name(&self) -> &str {
        &self.name
    }
}

/// Listener registered for every record of a kind.
pub type ScopedCallback = Rc<dyn Fn(&Store, &StoreEvent)>;

struct ScopedListener {
    id: ListenerId,
    scope: Rc<RecordKind>,
    event: String,
    callback: ScopedCallback,
}

// ============================================================================
// STORE
// ============================================================================

pub struct Store {
    euid: Euid,
    runloop: Rc<Runloop>,
    records: RefCell<HashMap<String, IdentitySet>>,
    wired: RefCell<HashMap<Euid, ListenerId>>,
    scoped: RefCell<Vec<ScopedListener>>,
    next_scoped: Cell<u64>,
    sources: RefCell<IndexMap<String, Rc<dyn Source>>>,
    listeners: Listeners<StoreEvent>,
    torn_down: Cell<bool>,
    self_ref: Weak<Store>,
}

impl Store {
    pub fn new(runloop: Rc<Runloop>) -> Rc<Self> {
        Rc::new_cyclic(|me| Store {
            euid: Euid::next(),
            runloop,
            records: RefCell::new(HashMap::new()),
            wired: RefCell::new(HashMap::new()),
            scoped: RefCell::new(Vec::new()),
            next_scoped: Cell::new(1),
            sources: RefCell::new(IndexMap::new()),
            listeners: Listeners::new(),
            torn_down: Cell::new(false),
            self_ref: me.clone(),
        })
    }

    pub fn euid(&self) -> Euid {
        self.euid
    }

    pub fn runloop(&self) -> &Rc<Runloop> {
        &self.runloop
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.get()
    }

    fn defer(&self, channel: &str, key: Option<Euid>, job: Job) {
        let queued = match key {
            Some(key) => self.runloop.enqueue_keyed(channel, key, job),
            None => self.runloop.enqueue(channel, job),
        };
        if let Err(err) = queued {
            warn!(store = %self.euid, %err, "store job dropped");
        }
    }

    // ------------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------------

    /// Constructs a record of `kind` and registers it.
    pub fn create(&self, kind: &Rc<RecordKind>, attributes: Attributes, options: RecordOptions) -> RecordRef {
        let attributes = if options.parse {
            kind.parse(attributes)
        } else {
            attributes
        };
        let record = Record::new(Rc::clone(kind), attributes, self.self_ref.clone(), options.owner);
        self.add(&record, StoreOptions { silent: options.silent });
        record
    }

    /// Registers `record`. Returns false if it was already registered or
    /// cannot be (destroyed record, torn-down store).
    pub fn add(&self, record: &RecordRef, options: StoreOptions) -> bool {
        if self.torn_down.get() {
            warn!(store = %self.euid, record = %record.euid(), "add on torn-down store ignored");
            return false;
        }
        if record.is_destroyed() {
            return false;
        }

        let inserted = self
            .records
            .borrow_mut()
            .entry(record.kind().name().to_string())
            .or_default()
            .add([Rc::clone(record)], None)
            > 0;

        let store = self.self_ref.clone();
        let target = Rc::clone(record);
        self.defer(
            channel::ADD,
            Some(record.euid()),
            Box::new(move || {
                if let Some(store) = store.upgrade() {
                    store.wire(&target, options);
                }
            }),
        );
        inserted
    }

    /// Unregisters `record`. Returns false if it was not registered.
    pub fn remove(&self, record: &RecordRef, options: StoreOptions) -> bool {
        if self.torn_down.get() {
            return false;
        }
        let removed = self
            .records
            .borrow_mut()
            .get_mut(record.kind().name())
            .map_or(false, |set| set.remove(record));
        if !removed {
            return false;
        }

        let store = self.self_ref.clone();
        let target = Rc::clone(record);
        self.defer(
            channel::REMOVE,
            Some(record.euid()),
            Box::new(move || {
                if let Some(store) = store.upgrade() {
                    store.unwire(&target, options);
                }
            }),
        );
        true
    }

    fn wire(&self, record: &RecordRef, options: StoreOptions) {
        if record.is_destroyed() || self.torn_down.get() {
            return;
        }
        self.reindex(record);

        if !record.kind().is_headless() && !self.wired.borrow().contains_key(&record.euid()) {
            let store = self.self_ref.clone();
            let id = record.subscribe(
                None,
                Rc::new(move |event: &RecordEvent| {
                    if let Some(store) = store.upgrade() {
                        store.on_record_event(event);
                    }
                }),
            );
            self.wired.borrow_mut().insert(record.euid(), id);
            trace!(store = %self.euid, record = %record.euid(), "wired");
        }

        if !options.silent {
            self.emit(StoreEvent::new("add", record.kind(), Some(Rc::clone(record))));
        }
    }

    fn unwire(&self, record: &RecordRef, _options: StoreOptions) {
        let listener = self.wired.borrow_mut().remove(&record.euid());
        if let Some(id) = listener {
            if !record.is_destroyed() {
                record.unsubscribe(id);
            }
            trace!(store = %self.euid, record = %record.euid(), "unwired");
        }
    }

    fn on_record_event(&self, event: &RecordEvent) {
        if self.torn_down.get() {
            return;
        }
        let record = event.record();
        if let RecordEvent::Change { changed, .. } = event {
            if changed.iter().any(|key| key == record.primary_key()) {
                self.reindex(record);
            }
        }
        self.emit(StoreEvent::new(event.name(), record.kind(), Some(Rc::clone(record))));
    }

    fn reindex(&self, record: &Record) {
        if let Some(set) = self.records.borrow_mut().get_mut(record.kind().name()) {
            set.reindex(record);
        }
    }

    /// Whether a record of `kind` with `identity` is registered.
    pub fn has(&self, kind: &RecordKind, identity: &Identity) -> bool {
        self.get(kind, identity).is_some()
    }

    pub fn get(&self, kind: &RecordKind, identity: &Identity) -> Option<RecordRef> {
        self.records
            .borrow()
            .get(kind.name())
            .and_then(|set| set.get(identity).cloned())
    }

    /// Whether this exact record instance is registered.
    pub fn contains(&self, record: &Record) -> bool {
        self.records
            .borrow()
            .get(record.kind().name())
            .map_or(false, |set| set.has_record(record))
    }

    /// Snapshot of every registered record of `kind`.
    pub fn records(&self, kind: &RecordKind) -> Vec<RecordRef> {
        self.records
            .borrow()
            .get(kind.name())
            .map(IdentitySet::records)
            .unwrap_or_default()
    }

    pub fn count(&self, kind: &RecordKind) -> usize {
        self.records.borrow().get(kind.name()).map_or(0, IdentitySet::len)
    }

    /// Whether the store currently listens to `record`'s events.
    pub fn is_wired(&self, record: &Record) -> bool {
        self.wired.borrow().contains_key(&record.euid())
    }

    // ------------------------------------------------------------------------
    // Scoped listeners
    // ------------------------------------------------------------------------

    /// Listens for `event` on every record of `kind` or of a sub-kind.
    pub fn on<F>(&self, kind: &Rc<RecordKind>, event: &str, callback: F) -> ListenerId
    where
        F: Fn(&Store, &StoreEvent) + 'static,
    {
        let id = ListenerId::from_raw(self.next_scoped.get());
        self.next_scoped.set(self.next_scoped.get() + 1);
        self.scoped.borrow_mut().push(ScopedListener {
            id,
            scope: Rc::clone(kind),
            event: event.to_string(),
            callback: Rc::new(callback),
        });
        id
    }

    /// Removes the scoped listener registered as exactly (`kind`, `event`, `id`).
    pub fn off(&self, kind: &RecordKind, event: &str, id: ListenerId) -> bool {
        let mut scoped = self.scoped.borrow_mut();
        let before = scoped.len();
        scoped.retain(|l| !(l.id == id && l.event == event && l.scope.name() == kind.name()));
        scoped.len() != before
    }

    /// Number of scoped listeners registered for exactly `kind`, optionally
    /// narrowed to one event name.
    pub fn scoped_listeners(&self, kind: &RecordKind, event: Option<&str>) -> usize {
        self.scoped
            .borrow()
            .iter()
            .filter(|l| l.scope.name() == kind.name() && event.map_or(true, |e| e == l.event))
            .count()
    }

    /// Scoped fan-out plus the store's own listeners.
    fn deliver(&self, event: &StoreEvent) {
        let matching: Vec<ScopedCallback> = self
            .scoped
            .borrow()
            .iter()
            .filter(|l| l.event == event.name && event.kind.is_a(&l.scope))
            .map(|l| Rc::clone(&l.callback))
            .collect();
        for callback in matching {
            callback(self, event);
        }
        self.listeners.dispatch(event);
    }

    // ------------------------------------------------------------------------
    // Sources
    // ------------------------------------------------------------------------

    pub fn register_source(&self, name: impl Into<String>, source: Rc<dyn Source>) -> Result<(), SyncError> {
        if self.torn_down.get() {
            return Err(SyncError::TornDown(format!("store {}", self.euid)));
        }
        self.sources.borrow_mut().insert(name.into(), source);
        Ok(())
    }

    pub fn unregister_source(&self, name: &str) -> bool {
        self.sources.borrow_mut().shift_remove(name).is_some()
    }

    pub fn source(&self, name: &str) -> Result<Rc<dyn Source>, SyncError> {
        self.sources
            .borrow()
            .get(name)
            .cloned()
            .ok_or_else(|| SyncError::UnknownTransport(name.to_string()))
    }

    fn resolve_sources(&self, selector: &SourceSelector) -> Vec<Rc<dyn Source>> {
        let names: Vec<String> = match selector {
            SourceSelector::All => return self.sources.borrow().values().cloned().collect(),
            SourceSelector::Named(name) => vec![name.clone()],
            SourceSelector::List(names) => names.clone(),
        };
        names
            .iter()
            .filter_map(|name| match self.source(name) {
                Ok(source) => Some(source),
                Err(err) => {
                    warn!(store = %self.euid, %err, "remote skipped");
                    None
                }
            })
            .collect()
    }

    /// Sends `action` for `record` to the selected sources on the next
    /// flush. The selector defaults to the record kind's.
    pub fn remote(&self, action: SourceAction, record: &RecordRef, options: RemoteOptions) {
        if self.torn_down.get() {
            return;
        }
        let store = self.self_ref.clone();
        let target = Rc::clone(record);
        self.defer(
            channel::REMOTE,
            None,
            Box::new(move || {
                let Some(store) = store.upgrade() else {
                    return;
                };
                let selector = options
                    .source
                    .clone()
                    .or_else(|| target.kind().source().cloned());
                let Some(selector) = selector else {
                    debug!(record = %target.euid(), %action, "no source selected");
                    return;
                };
                for source in store.resolve_sources(&selector) {
                    if source.supports(action) {
                        source.dispatch(action, &target, &options);
                    }
                }
            }),
        );
    }

    // ------------------------------------------------------------------------
    // Local queries
    // ------------------------------------------------------------------------

    /// Queries registered records of `kind` on the next flush, after every
    /// pending add/remove of that tick has been applied.
    pub fn find_local<P, F>(&self, kind: &Rc<RecordKind>, predicate: P, options: FindOptions, callback: F)
    where
        P: Fn(&RecordRef) -> bool + 'static,
        F: FnOnce(Vec<RecordRef>) + 'static,
    {
        let store = self.self_ref.clone();
        let kind = Rc::clone(kind);
        self.defer(
            channel::FIND_LOCAL,
            None,
            Box::new(move || {
                let candidates = store.upgrade().map(|s| s.records(&kind)).unwrap_or_default();
                let matches = |record: &RecordRef| {
                    options
                        .attributes
                        .iter()
                        .all(|(key, value)| record.get(key).as_ref() == Some(value))
                        && predicate(record)
                };
                let found: Vec<RecordRef> = if options.all {
                    candidates.into_iter().filter(|r| matches(r)).collect()
                } else {
                    candidates.into_iter().find(|r| matches(r)).into_iter().collect()
                };
                callback(found);
            }),
        );
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    /// Drops every record, listener and source. Later mutations are no-ops.
    pub fn teardown(&self) {
        if self.torn_down.replace(true) {
            return;
        }
        let records: Vec<RecordRef> = self
            .records
            .borrow_mut()
            .drain()
            .flat_map(|(_, mut set)| set.clear())
            .collect();
        let wired = std::mem::take(&mut *self.wired.borrow_mut());
        for record in &records {
            if let Some(id) = wired.get(&record.euid()) {
                record.unsubscribe(*id);
            }
        }
        self.scoped.borrow_mut().clear();
        self.sources.borrow_mut().clear();
        self.listeners.clear();
        debug!(store = %self.euid, records = records.len(), "store torn down");
    }
}

impl EventEmitter for Store {
    type Event = StoreEvent;

    fn subscribe(&self, event: Option<&str>, callback: Callback<StoreEvent>) -> ListenerId {
        self.listeners.add(event, callback)
    }

    fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Deferred through the `event` channel.
    fn emit(&self, event: StoreEvent) {
        let store = self.self_ref.clone();
        self.defer(
            channel::EVENT,
            None,
            Box::new(move || {
                if let Some(store) = store.upgrade() {
                    store.deliver(&event);
                }
            }),
        );
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: Vec<(String, usize)> = self
            .records
            .borrow()
            .iter()
            .map(|(kind, set)| (kind.clone(), set.len()))
            .collect();
        f.debug_struct("Store")
            .field("euid", &self.euid)
            .field("records", &counts)
            .field("sources", &self.sources.borrow().keys().collect::<Vec<_>>())
            .field("torn_down", &self.torn_down.get())
            .finish()
    }
}
