//! Records: identity-bearing attribute bags.
//!
//! A record has an ephemeral [`Euid`] assigned at construction and, once
//! its kind's primary-key attribute is set, a primary identity. Records
//! move from *new* to *identified* to *destroyed*; destroyed is terminal.

use crate::error::SyncError;
use crate::events::{Callback, EventEmitter, ListenerId, Listeners, NamedEvent};
use crate::kind::RecordKind;
use crate::store::{Store, StoreOptions};
use modelsync_env::Euid;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

/// Attribute map of a record.
pub type Attributes = serde_json::Map<String, Value>;

/// Shared handle to a record.
pub type RecordRef = Rc<Record>;

/// Turns a JSON object into attributes. Anything else yields an empty map.
pub fn attrs(value: Value) -> Attributes {
    match value {
        Value::Object(map) => map,
        _ => Attributes::new(),
    }
}

// ============================================================================
// IDENTITY
// ============================================================================

/// A normalized primary-key value.
///
/// Strings are kept as-is; numbers and booleans use their JSON text, so
/// `1` and `"1"` name the same record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Normalizes a primary-key value. `null` means "no identity yet".
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::String(s) => Some(Self(s.clone())),
            other => Some(Self(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<i64> for RecordId {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What an IdentitySet looks records up by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    Key(RecordId),
    Ephemeral(Euid),
}

impl From<RecordId> for Identity {
    fn from(id: RecordId) -> Self {
        Identity::Key(id)
    }
}

impl From<Euid> for Identity {
    fn from(euid: Euid) -> Self {
        Identity::Ephemeral(euid)
    }
}

// ============================================================================
// OPTIONS & EVENTS
// ============================================================================

/// Options for [`Record::set`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
    /// Suppress the `change` event.
    pub silent: bool,
}

/// Options for [`Record::destroy`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DestroyOptions {
    /// Suppress the store-level notifications for the removal.
    pub silent: bool,
}

/// Events emitted by a record. Delivered synchronously.
#[derive(Debug, Clone)]
pub enum RecordEvent {
    /// Attributes changed; `changed` lists the keys whose value differs.
    Change { record: RecordRef, changed: Vec<String> },
    Destroy { record: RecordRef },
}

impl RecordEvent {
    pub fn record(&self) -> &RecordRef {
        match self {
            RecordEvent::Change { record, .. } | RecordEvent::Destroy { record } => record,
        }
    }
}

impl NamedEvent for RecordEvent {
    fn name(&self) -> &str {
        match self {
            RecordEvent::Change { .. } => "change",
            RecordEvent::Destroy { .. } => "destroy",
        }
    }
}

// ============================================================================
// RECORD
// ============================================================================

struct RecordState {
    attributes: Attributes,
    owner: Option<Euid>,
    destroyed: bool,
}

pub struct Record {
    euid: Euid,
    kind: Rc<RecordKind>,
    store: Weak<Store>,
    state: RefCell<RecordState>,
    listeners: Listeners<RecordEvent>,
    self_ref: Weak<Record>,
}

impl Record {
    /// Builds a record bound to `store`. Registration is the caller's job;
    /// use `Store::create` from outside the crate.
    pub(crate) fn new(
        kind: Rc<RecordKind>,
        attributes: Attributes,
        store: Weak<Store>,
        owner: Option<Euid>,
    ) -> RecordRef {
        Rc::new_cyclic(|me| Record {
            euid: Euid::next(),
            kind,
            store,
            state: RefCell::new(RecordState {
                attributes,
                owner,
                destroyed: false,
            }),
            listeners: Listeners::new(),
            self_ref: me.clone(),
        })
    }

    pub fn euid(&self) -> Euid {
        self.euid
    }

    pub fn kind(&self) -> &Rc<RecordKind> {
        &self.kind
    }

    pub fn primary_key(&self) -> &str {
        self.kind.primary_key()
    }

    /// The primary identity, if the primary-key attribute is set.
    pub fn id(&self) -> Option<RecordId> {
        self.state
            .borrow()
            .attributes
            .get(self.kind.primary_key())
            .and_then(RecordId::from_value)
    }

    /// Primary identity, falling back to the ephemeral id.
    pub fn identity(&self) -> Identity {
        match self.id() {
            Some(id) => Identity::Key(id),
            None => Identity::Ephemeral(self.euid),
        }
    }

    /// A record without a primary identity has never been persisted.
    pub fn is_new(&self) -> bool {
        self.id().is_none()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.state.borrow().attributes.get(key).cloned()
    }

    pub fn attributes(&self) -> Attributes {
        self.state.borrow().attributes.clone()
    }

    /// Plain JSON form of the attributes.
    pub fn raw(&self) -> Value {
        Value::Object(self.attributes())
    }

    pub fn parse(&self, data: Attributes) -> Attributes {
        self.kind.parse(data)
    }

    pub fn owner(&self) -> Option<Euid> {
        self.state.borrow().owner
    }

    pub(crate) fn set_owner(&self, owner: Option<Euid>) {
        self.state.borrow_mut().owner = owner;
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.borrow().destroyed
    }

    /// Applies `attributes` and returns the keys whose value changed.
    ///
    /// Emits `change` unless `silent` or nothing changed.
    pub fn set(&self, attributes: Attributes, options: SetOptions) -> Result<Vec<String>, SyncError> {
        let changed = {
            let mut state = self.state.borrow_mut();
            if state.destroyed {
                return Err(SyncError::InvalidRecordState { euid: self.euid });
            }
            let mut changed = Vec::new();
            for (key, value) in attributes {
                if state.attributes.get(&key) != Some(&value) {
                    changed.push(key.clone());
                    state.attributes.insert(key, value);
                }
            }
            changed
        };

        if !options.silent && !changed.is_empty() {
            if let Some(record) = self.self_ref.upgrade() {
                self.emit(RecordEvent::Change {
                    record,
                    changed: changed.clone(),
                });
            }
        }
        Ok(changed)
    }

    /// Destroys the record: emits `destroy`, drops every listener and
    /// removes it from the store. Destroying twice is a no-op.
    pub fn destroy(&self, options: DestroyOptions) {
        {
            let mut state = self.state.borrow_mut();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
        }

        let record = self.self_ref.upgrade();
        if let Some(record) = &record {
            self.emit(RecordEvent::Destroy {
                record: Rc::clone(record),
            });
        }
        self.listeners.clear();

        if let (Some(store), Some(record)) = (self.store.upgrade(), record) {
            store.remove(&record, StoreOptions { silent: options.silent });
        }
    }
}

impl EventEmitter for Record {
    type Event = RecordEvent;

    fn subscribe(&self, event: Option<&str>, callback: Callback<RecordEvent>) -> ListenerId {
        self.listeners.add(event, callback)
    }

    fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    fn emit(&self, event: RecordEvent) {
        self.listeners.dispatch(&event);
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("Record")
            .field("euid", &self.euid)
            .field("kind", &self.kind.name())
            .field("attributes", &state.attributes)
            .field("owner", &state.owner)
            .field("destroyed", &state.destroyed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::Cell;

    fn detached(value: Value) -> RecordRef {
        Record::new(RecordKind::new("note").shared(), attrs(value), Weak::new(), None)
    }

    #[test]
    fn test_record_id_normalization() {
        assert_eq!(RecordId::from_value(&json!(1)), Some(RecordId::from(1)));
        assert_eq!(RecordId::from_value(&json!("1")), Some(RecordId::from("1")));
        assert_eq!(RecordId::from_value(&json!(true)).unwrap().as_str(), "true");
        assert_eq!(RecordId::from_value(&Value::Null), None);
    }

    #[test]
    fn test_record_id_serializes_as_plain_string() {
        let id = RecordId::from(7);
        assert_eq!(serde_json::to_value(&id).unwrap(), json!("7"));
        let back: RecordId = serde_json::from_value(json!("7")).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_identity_falls_back_to_euid() {
        let record = detached(json!({"title": "draft"}));
        assert!(record.is_new());
        assert_eq!(record.identity(), Identity::Ephemeral(record.euid()));

        record.set(attrs(json!({"id": 9})), SetOptions::default()).unwrap();
        assert_eq!(record.identity(), Identity::Key(RecordId::from(9)));
    }

    #[test]
    fn test_set_reports_changed_keys_and_emits() {
        let record = detached(json!({"id": 1, "v": 1}));
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = seen.clone();
        record.subscribe(
            Some("change"),
            Rc::new(move |event: &RecordEvent| {
                if let RecordEvent::Change { changed, .. } = event {
                    log.borrow_mut().push(changed.clone());
                }
            }),
        );

        let changed = record
            .set(attrs(json!({"id": 1, "v": 2})), SetOptions::default())
            .unwrap();
        assert_eq!(changed, vec!["v".to_string()]);

        // No-op set emits nothing
        record.set(attrs(json!({"v": 2})), SetOptions::default()).unwrap();
        // Silent set emits nothing
        record.set(attrs(json!({"v": 3})), SetOptions { silent: true }).unwrap();

        assert_eq!(*seen.borrow(), vec![vec!["v".to_string()]]);
        assert_eq!(record.get("v"), Some(json!(3)));
    }

    #[test]
    fn test_destroy_is_terminal() {
        let record = detached(json!({"id": 1}));
        let destroyed = Rc::new(Cell::new(0));
        let counter = destroyed.clone();
        record.subscribe(Some("destroy"), Rc::new(move |_: &RecordEvent| counter.set(counter.get() + 1)));

        record.destroy(DestroyOptions::default());
        record.destroy(DestroyOptions::default());

        assert!(record.is_destroyed());
        assert_eq!(destroyed.get(), 1);
        assert_eq!(
            record.set(attrs(json!({"v": 1})), SetOptions::default()),
            Err(SyncError::InvalidRecordState { euid: record.euid() })
        );
    }

    #[test]
    fn test_raw_round_trips_attributes() {
        let record = detached(json!({"id": "a", "tags": ["x"]}));
        assert_eq!(record.raw(), json!({"id": "a", "tags": ["x"]}));
    }
}
