//! SimWorld - The simulation harness container.
//!
//! Owns one runloop, one store and a handful of collections sharing a
//! single record kind, plus the `Oracle` that models what they should
//! hold. Every operation is applied to both; `verify` compares them.

use crate::context::SimContext;
use crate::exporter::{ChannelCount, CollectionFrame, SimEvent, SimFrame};
use crate::oracle::{AddDelta, Notification, Oracle};

use modelsync_core::{
    attrs, AddOptions, Collection, CollectionConfig, CollectionEvent, DestroyOptions, EventEmitter, Identity,
    Incoming, NamedEvent, RecordId, RecordKind, RecordRef, RemoveOptions, Runloop, RunloopConfig, Store,
    TickReport,
};
use rand::Rng;
use serde_json::{json, Value};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Record kind used by every simulated collection.
pub const SIM_KIND: &str = "sim.item";

/// Upper bound on flushes `settle` runs before giving up.
const MAX_SETTLE_TICKS: usize = 16;

/// Configuration for a simulation run.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Master seed for determinism
    pub seed: u64,

    /// Number of collections to spawn
    pub collections: usize,

    /// Random operations applied between two flushes
    pub ops_per_tick: usize,

    /// Number of flushes to run
    pub duration_ticks: u64,

    /// Primary keys are drawn from `0..key_space`
    pub key_space: u32,

    /// Virtual time between flushes
    pub interval: Duration,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            collections: 3,
            ops_per_tick: 8,
            duration_ticks: 200,
            key_space: 24,
            interval: Duration::from_millis(15),
        }
    }
}

/// Weighting of randomly generated operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpMix {
    /// Mostly single adds and removes
    Churn,

    /// Mostly purging batch syncs
    Purge,
}

/// One workload operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimOp {
    /// Add one attribute hash to a collection
    Add { collection: usize, id: u32, value: i64 },

    /// Add a batch of attribute hashes, optionally purging the rest
    AddBatch {
        collection: usize,
        items: Vec<(u32, i64)>,
        purge: bool,
    },

    /// Remove the member with `id` from a collection
    Remove { collection: usize, id: u32, complete: bool },

    /// Destroy the record the store resolves `id` to
    Destroy { id: u32 },
}

impl SimOp {
    /// Draws a random operation.
    pub fn random<R: Rng>(rng: &mut R, collections: usize, key_space: u32, mix: OpMix) -> Self {
        let collections = collections.max(1);
        let key_space = key_space.max(1);
        let collection = rng.gen_range(0..collections);
        let id = rng.gen_range(0..key_space);
        let value = rng.gen_range(-1000..1000);
        let roll: u32 = rng.gen_range(0..100);

        let batch = |rng: &mut R| -> Vec<(u32, i64)> {
            let len = rng.gen_range(1..=6);
            (0..len)
                .map(|_| (rng.gen_range(0..key_space), rng.gen_range(-1000..1000)))
                .collect()
        };

        match mix {
            OpMix::Churn => match roll {
                0..=44 => SimOp::Add { collection, id, value },
                45..=59 => SimOp::AddBatch {
                    collection,
                    items: batch(rng),
                    purge: false,
                },
                60..=79 => SimOp::Remove {
                    collection,
                    id,
                    complete: false,
                },
                80..=84 => SimOp::Remove {
                    collection,
                    id,
                    complete: true,
                },
                _ => SimOp::Destroy { id },
            },
            OpMix::Purge => match roll {
                0..=39 => SimOp::AddBatch {
                    collection,
                    items: batch(rng),
                    purge: true,
                },
                40..=69 => SimOp::Add { collection, id, value },
                70..=84 => SimOp::Remove {
                    collection,
                    id,
                    complete: false,
                },
                _ => SimOp::Destroy { id },
            },
        }
    }
}

/// What one applied operation did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpEffect {
    pub created: usize,
    pub adopted: usize,
    pub merged: usize,
    pub purged: usize,
    pub removed: usize,
    pub destroyed: usize,
}

impl From<AddDelta> for OpEffect {
    fn from(delta: AddDelta) -> Self {
        Self {
            created: delta.created,
            adopted: delta.adopted,
            merged: delta.merged,
            purged: delta.purged,
            ..Default::default()
        }
    }
}

/// Builds the attribute hash for one item. Every third value travels as a
/// string so the kind's parse hook has something to coerce.
pub fn item_attributes(id: u32, value: i64) -> Value {
    if value % 3 == 0 {
        json!({ "id": id, "v": value.to_string() })
    } else {
        json!({ "id": id, "v": value })
    }
}

/// The sim record kind: `v` is coerced to a number on parse.
pub fn sim_kind() -> Rc<RecordKind> {
    RecordKind::new(SIM_KIND)
        .with_parse(|mut data| {
            let coerced = match data.get("v") {
                Some(Value::String(text)) => text.parse::<i64>().ok(),
                _ => None,
            };
            if let Some(number) = coerced {
                data.insert("v".to_string(), json!(number));
            }
            data
        })
        .shared()
}

/// The SimWorld - container for the entire simulation.
pub struct SimWorld {
    /// Configuration
    pub config: SimConfig,

    /// Shared simulation context (virtual clock + RNG)
    pub context: Arc<SimContext>,

    pub runloop: Rc<Runloop>,
    pub store: Rc<Store>,
    pub kind: Rc<RecordKind>,
    pub collections: Vec<Rc<Collection>>,

    /// Reference model
    pub oracle: Oracle,

    /// Notifications delivered since the last tick
    notifications: Rc<RefCell<Vec<Notification>>>,

    /// Notifications delivered over the whole run
    delivered: usize,

    /// Current tick count
    tick_count: u64,
}

impl SimWorld {
    /// Creates a new SimWorld with the given configuration.
    pub fn new(config: SimConfig) -> Self {
        let context = SimContext::shared(config.seed);
        let runloop = Rc::new(Runloop::standard(RunloopConfig {
            interval: config.interval,
        }));
        let store = Store::new(Rc::clone(&runloop));

        Self {
            config,
            context,
            runloop,
            store,
            kind: sim_kind(),
            collections: Vec::new(),
            oracle: Oracle::new(),
            notifications: Rc::new(RefCell::new(Vec::new())),
            delivered: 0,
            tick_count: 0,
        }
    }

    /// Spawns `config.collections` collections with default configuration.
    pub fn spawn_collections(&mut self) -> Vec<usize> {
        (0..self.config.collections)
            .map(|_| self.add_collection(CollectionConfig::default()))
            .collect()
    }

    /// Adds one observed collection and returns its index.
    pub fn add_collection(&mut self, config: CollectionConfig) -> usize {
        let collection = Collection::with_config(Rc::clone(&self.kind), Rc::clone(&self.store), config);
        let index = self.oracle.add_collection();

        let sink = Rc::clone(&self.notifications);
        collection.subscribe(
            None,
            Rc::new(move |event: &CollectionEvent| {
                let (old, new, records) = match event {
                    CollectionEvent::Length { old, new } => (*old, *new, 0),
                    CollectionEvent::Add { records } | CollectionEvent::Remove { records } => {
                        (0, 0, records.len())
                    }
                    CollectionEvent::Sort | CollectionEvent::Destroy => (0, 0, 0),
                };
                sink.borrow_mut().push(Notification {
                    collection: index,
                    event: event.name().to_string(),
                    old,
                    new,
                    records,
                });
            }),
        );
        self.collections.push(collection);
        debug!(index, "collection spawned");
        index
    }

    fn member(&self, collection: usize, id: u32) -> Option<RecordRef> {
        self.collections
            .get(collection)?
            .get(&Identity::Key(RecordId::from(i64::from(id))))
    }

    /// Applies `op` to the engine and to the model.
    ///
    /// Fails when the engine reports a different outcome than the model.
    pub fn apply(&mut self, op: &SimOp) -> Result<OpEffect, String> {
        trace!(?op, "apply");
        match op {
            SimOp::Add { collection, id, value } => self.apply_add(*collection, &[(*id, *value)], false),
            SimOp::AddBatch {
                collection,
                items,
                purge,
            } => self.apply_add(*collection, items, *purge),
            SimOp::Remove {
                collection,
                id,
                complete,
            } => {
                let removed = match (self.collections.get(*collection), self.member(*collection, *id)) {
                    (Some(target), Some(record)) => target
                        .remove(
                            &[record],
                            RemoveOptions {
                                complete: *complete,
                                ..Default::default()
                            },
                        )
                        .len(),
                    _ => 0,
                };
                let modelled = self.oracle.remove(*collection, *id, *complete);
                if (removed == 1) != modelled {
                    return Err(format!(
                        "remove {} from collection {}: engine removed {}, model {}",
                        id, collection, removed, modelled
                    ));
                }
                Ok(OpEffect {
                    removed,
                    ..Default::default()
                })
            }
            SimOp::Destroy { id } => {
                let record = self
                    .store
                    .get(&self.kind, &Identity::Key(RecordId::from(i64::from(*id))));
                let destroyed = match record {
                    Some(record) => {
                        record.destroy(DestroyOptions::default());
                        true
                    }
                    None => false,
                };
                if destroyed != self.oracle.destroy(*id) {
                    return Err(format!("destroy {}: engine {}, model disagrees", id, destroyed));
                }
                Ok(OpEffect {
                    destroyed: usize::from(destroyed),
                    ..Default::default()
                })
            }
        }
    }

    fn apply_add(&mut self, collection: usize, items: &[(u32, i64)], purge: bool) -> Result<OpEffect, String> {
        let Some(target) = self.collections.get(collection) else {
            return Ok(OpEffect::default());
        };
        let before = target.len();
        let incoming: Vec<Incoming> = items
            .iter()
            .map(|(id, value)| Incoming::from(attrs(item_attributes(*id, *value))))
            .collect();
        let outcome = target.add(
            incoming,
            AddOptions {
                purge,
                parse: true,
                ..Default::default()
            },
        );
        let after = target.len();

        let delta = self.oracle.add(collection, items, purge);
        if outcome.added.len() != delta.created + delta.adopted || outcome.merged.len() != delta.merged {
            return Err(format!(
                "add to collection {}: engine added {} merged {}, model {:?}",
                collection,
                outcome.added.len(),
                outcome.merged.len(),
                delta
            ));
        }
        if !outcome.rejected.is_empty() || !outcome.dropped.is_empty() {
            return Err(format!(
                "add to collection {}: {} rejected, {} dropped",
                collection,
                outcome.rejected.len(),
                outcome.dropped.len()
            ));
        }
        if after + delta.purged != before + outcome.added.len() {
            return Err(format!(
                "add to collection {}: length {} -> {} with {} added, {} purged",
                collection,
                before,
                after,
                outcome.added.len(),
                delta.purged
            ));
        }
        Ok(delta.into())
    }

    /// Draws a random operation from the world's RNG.
    pub fn random_op(&self, mix: OpMix) -> SimOp {
        let (collections, key_space) = (self.collections.len(), self.config.key_space);
        self.context
            .with_rng(|rng| SimOp::random(rng, collections, key_space, mix))
    }

    /// Compares the engine with the model.
    pub fn verify(&mut self) -> Result<(), String> {
        self.oracle.verify(&self.collections, &self.store, &self.kind)
    }

    /// Advances virtual time by one interval and flushes the runloop.
    pub fn tick(&mut self) -> Result<TickReport, String> {
        self.context.advance_time(self.config.interval);
        let report = self.runloop.tick();
        self.tick_count += 1;

        let delivered = std::mem::take(&mut *self.notifications.borrow_mut());
        self.delivered += delivered.len();
        self.oracle.observe(&delivered)?;
        Ok(report)
    }

    /// Flushes until nothing is pending, then checks announced lengths.
    pub fn settle(&mut self) -> Result<usize, String> {
        let mut flushed = 0;
        for _ in 0..MAX_SETTLE_TICKS {
            if self.runloop.is_idle() {
                break;
            }
            flushed += self.tick()?.total();
        }
        if !self.runloop.is_idle() {
            return Err(format!(
                "runloop still has {} jobs after {} flushes",
                self.runloop.pending(),
                MAX_SETTLE_TICKS
            ));
        }
        self.oracle.check_settled(&self.collections)?;
        Ok(flushed)
    }

    /// Captures a frame for export.
    pub fn frame(&self, report: &TickReport, events: Vec<SimEvent>) -> SimFrame {
        SimFrame {
            tick: report.tick,
            time_sec: self.time(),
            collections: self
                .collections
                .iter()
                .enumerate()
                .map(|(index, collection)| CollectionFrame {
                    index,
                    euid: collection.euid().as_u64(),
                    length: collection.len(),
                    ids: collection.map(|r, _| r.id().map(|id| id.to_string()).unwrap_or_default()),
                    destroyed: collection.is_destroyed(),
                })
                .collect(),
            channels: report
                .jobs
                .iter()
                .map(|(channel, jobs)| ChannelCount {
                    channel: channel.to_string(),
                    jobs: *jobs,
                })
                .collect(),
            store_records: self.record_count(),
            events,
        }
    }

    /// Returns the current simulation time in seconds.
    pub fn time(&self) -> f64 {
        self.context.time_ns() as f64 / 1_000_000_000.0
    }

    /// Records registered in the store.
    pub fn record_count(&self) -> usize {
        self.store.count(&self.kind)
    }

    /// Notifications delivered so far.
    pub fn notifications_delivered(&self) -> usize {
        self.delivered
    }

    /// Returns the current tick count.
    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }
}
