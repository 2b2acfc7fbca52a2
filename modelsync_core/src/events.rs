//! Listener plumbing shared by records, collections and the store.
//!
//! Every observable object owns a [`Listeners`] table and implements
//! [`EventEmitter`]. Dispatch snapshots the matching callbacks before
//! invoking any of them, so a callback may subscribe, unsubscribe or
//! mutate the emitter that is calling it.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// A listener callback.
pub type Callback<E> = Rc<dyn Fn(&E)>;

/// Handle returned by `subscribe`, used to unsubscribe later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

/// Events carry a name so listeners can filter on it.
pub trait NamedEvent {
    fn name(&self) -> &str;
}

/// Something listeners can subscribe to.
pub trait EventEmitter {
    type Event: NamedEvent;

    /// Registers `callback` for events named `event`, or for every event
    /// when `event` is `None`.
    fn subscribe(&self, event: Option<&str>, callback: Callback<Self::Event>) -> ListenerId;

    /// Removes a listener. Returns false if it was not registered.
    fn unsubscribe(&self, id: ListenerId) -> bool;

    /// Delivers `event` to the matching listeners.
    ///
    /// Records deliver immediately; collections and the store deliver on
    /// the next runloop flush through the `event` channel.
    fn emit(&self, event: Self::Event);
}

struct Entry<E> {
    id: ListenerId,
    event: Option<String>,
    callback: Callback<E>,
}

/// Ordered listener table.
pub struct Listeners<E> {
    next_id: Cell<u64>,
    entries: RefCell<Vec<Entry<E>>>,
}

impl<E: NamedEvent> Listeners<E> {
    pub fn new() -> Self {
        Self {
            next_id: Cell::new(1),
            entries: RefCell::new(Vec::new()),
        }
    }

    pub fn add(&self, event: Option<&str>, callback: Callback<E>) -> ListenerId {
        let id = ListenerId::from_raw(self.next_id.get());
        self.next_id.set(self.next_id.get() + 1);
        self.entries.borrow_mut().push(Entry {
            id,
            event: event.map(str::to_string),
            callback,
        });
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.borrow_mut();
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        entries.len() != before
    }

    pub fn clear(&self) {
        self.entries.borrow_mut().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Invokes every matching callback in registration order.
    /// Returns how many were called.
    pub fn dispatch(&self, event: &E) -> usize {
        let matching: Vec<Callback<E>> = self
            .entries
            .borrow()
            .iter()
            .filter(|entry| entry.event.as_deref().map_or(true, |name| name == event.name()))
            .map(|entry| Rc::clone(&entry.callback))
            .collect();

        for callback in &matching {
            callback(event);
        }
        matching.len()
    }
}

impl<E: NamedEvent> Default for Listeners<E> {
    fn default() -> Self {
        Self::new()
    }
}
