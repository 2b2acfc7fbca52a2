//! modelsync Core - in-memory record graph synchronization
//!
//! Keeps ordered collections of identity-bearing records consistent with a
//! shared registry, and batches every resulting notification into
//! deterministic, priority-ordered flush cycles:
//!
//! 1. **Reconciliation**: `Collection::add` resolves incoming records and
//!    attribute hashes by identity (merge, adopt, create or drop)
//! 2. **Registry**: `Store` indexes every live record per kind and fans
//!    record events out to scoped listeners
//! 3. **Scheduling**: `Runloop` coalesces add/remove per record and flushes
//!    `add → remove → event → remote → find_local` once per tick
//!
//! Everything is single-threaded (`Rc`/`RefCell`); the runloop is driven by
//! a `modelsync_env::SyncContext` clock or by calling `tick()` directly.

pub mod collection;
pub mod error;
pub mod events;
pub mod identity_set;
pub mod kind;
pub mod record;
pub mod runloop;
pub mod source;
pub mod store;

// Re-export key types for convenience
pub use collection::{
    AddOptions, AddOutcome, Collection, CollectionConfig, CollectionEvent, Comparator, DropReason, Dropped,
    Incoming, RemoveOptions,
};
pub use error::SyncError;
pub use events::{Callback, EventEmitter, ListenerId, Listeners, NamedEvent};
pub use identity_set::IdentitySet;
pub use kind::{ParseFn, RecordKind};
pub use record::{
    attrs, Attributes, DestroyOptions, Identity, Record, RecordEvent, RecordId, RecordRef, SetOptions,
};
pub use runloop::{channel, Job, Runloop, RunloopConfig, TickReport};
pub use source::{RemoteOptions, Source, SourceAction, SourceSelector};
pub use store::{FindOptions, RecordOptions, ScopedCallback, Store, StoreEvent, StoreOptions};

pub use modelsync_env::Euid;
