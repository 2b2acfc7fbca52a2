//! Scenario runner - executes deterministic simulation scenarios.

use crate::exporter::{SimEvent, SimExport};
use crate::scenarios::ScenarioId;
use crate::world::{item_attributes, OpMix, SimConfig, SimOp, SimWorld};

use modelsync_core::{
    attrs, channel, AddOptions, Collection, CollectionConfig, Euid, FindOptions, Identity, Incoming, RecordId,
    RecordOptions, RecordRef, Runloop, Store, StoreOptions, TickReport,
};
use rand::seq::SliceRandom;
use rand::Rng;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;
use tracing::{debug, info, warn};

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Total ticks executed
    pub total_ticks: u64,

    /// Final simulation time in seconds
    pub final_time_secs: f64,

    /// Records registered in the store at the end
    pub final_record_count: usize,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default)]
pub struct ScenarioMetrics {
    /// Workload operations applied
    pub ops_applied: u64,

    /// Records created by collections
    pub records_created: u64,

    /// Incoming elements merged into members
    pub merges: u64,

    /// Records adopted from the store
    pub adoptions: u64,

    /// Members removed by `remove`
    pub removals: u64,

    /// Records destroyed
    pub destroys: u64,

    /// Members dropped by purging syncs
    pub purges: u64,

    /// Collection notifications delivered
    pub notifications: u64,

    /// Runloop jobs flushed
    pub jobs_flushed: u64,

    /// Largest pending queue seen right before a flush
    pub max_pending: usize,
}

/// Runs simulation scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Number of collections
    collections: usize,

    /// Flushes per workload scenario
    ticks: u64,

    /// Random operations between flushes
    ops_per_tick: usize,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64) -> Self {
        let defaults = SimConfig::default();
        Self {
            seed,
            collections: defaults.collections,
            ticks: defaults.duration_ticks,
            ops_per_tick: defaults.ops_per_tick,
        }
    }

    /// Sets the number of flushes.
    pub fn with_ticks(mut self, ticks: u64) -> Self {
        self.ticks = ticks;
        self
    }

    /// Sets the number of collections.
    pub fn with_collections(mut self, collections: usize) -> Self {
        self.collections = collections.max(1);
        self
    }

    /// Sets the number of operations between flushes.
    pub fn with_ops_per_tick(mut self, ops: usize) -> Self {
        self.ops_per_tick = ops;
        self
    }

    fn world(&self) -> SimWorld {
        let mut world = SimWorld::new(SimConfig {
            seed: self.seed,
            collections: self.collections,
            ops_per_tick: self.ops_per_tick,
            duration_ticks: self.ticks,
            ..Default::default()
        });
        world.spawn_collections();
        world
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        self.dispatch(scenario, None)
    }

    /// Runs a scenario, capturing one frame per flush.
    pub fn run_with_export(&self, scenario: ScenarioId) -> (ScenarioResult, SimExport) {
        let mut export = SimExport::new(scenario.name(), self.seed);
        let result = self.dispatch(scenario, Some(&mut export));
        export.finalize(result.passed, result.failure_reason.clone());
        (result, export)
    }

    fn dispatch(&self, scenario: ScenarioId, export: Option<&mut SimExport>) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        let mut world = self.world();
        let mut metrics = ScenarioMetrics::default();
        let outcome = match scenario {
            ScenarioId::Churn => self.run_workload(&mut world, OpMix::Churn, &mut metrics, export),
            ScenarioId::PurgeSync => self.run_workload(&mut world, OpMix::Purge, &mut metrics, export),
            ScenarioId::Coalesce => self.run_coalesce(&mut world, &mut metrics),
            ScenarioId::Adoption => self.run_adoption(&mut world, &mut metrics),
            ScenarioId::Teardown => self.run_teardown(&mut world, &mut metrics),
            ScenarioId::FlushOrder => self.run_flush_order(&mut world, &mut metrics),
            ScenarioId::RoundTrip => self.run_round_trip(&mut world, &mut metrics),
        };
        metrics.notifications = world.notifications_delivered() as u64;

        let passed = outcome.is_ok();
        if passed {
            info!("✓ {} complete: {} ops, {} jobs flushed", scenario.name(), metrics.ops_applied, metrics.jobs_flushed);
        }
        ScenarioResult {
            scenario,
            seed: self.seed,
            passed,
            total_ticks: world.tick_count(),
            final_time_secs: world.time(),
            final_record_count: world.record_count(),
            failure_reason: outcome.err(),
            metrics,
        }
    }

    /// Flushes once, tracking queue size and job counts.
    fn flush(world: &mut SimWorld, metrics: &mut ScenarioMetrics) -> Result<TickReport, String> {
        metrics.max_pending = metrics.max_pending.max(world.runloop.pending());
        let report = world.tick()?;
        metrics.jobs_flushed += report.total() as u64;
        Ok(report)
    }

    fn settle(world: &mut SimWorld, metrics: &mut ScenarioMetrics) -> Result<(), String> {
        metrics.max_pending = metrics.max_pending.max(world.runloop.pending());
        metrics.jobs_flushed += world.settle()? as u64;
        Ok(())
    }

    /// DST-001/002: random workload checked against the oracle after every
    /// operation, with the length chain checked after every flush.
    fn run_workload(
        &self,
        world: &mut SimWorld,
        mix: OpMix,
        metrics: &mut ScenarioMetrics,
        mut export: Option<&mut SimExport>,
    ) -> Result<(), String> {
        for tick in 0..self.ticks {
            let mut events = Vec::new();
            for _ in 0..self.ops_per_tick {
                let op = world.random_op(mix);
                let effect = world.apply(&op).map_err(|e| format!("tick {}: {}", tick, e))?;
                world.verify().map_err(|e| format!("tick {} after {:?}: {}", tick, op, e))?;

                metrics.ops_applied += 1;
                metrics.records_created += effect.created as u64;
                metrics.adoptions += effect.adopted as u64;
                metrics.merges += effect.merged as u64;
                metrics.removals += effect.removed as u64;
                metrics.destroys += effect.destroyed as u64;
                metrics.purges += effect.purged as u64;
                if effect.purged > 0 {
                    events.push(SimEvent::info(format!("purged {} records", effect.purged)));
                }
            }

            let report = Self::flush(world, metrics)?;
            if let Some(export) = export.as_deref_mut() {
                export.add_frame(world.frame(&report, events));
            }
            if tick % 50 == 0 {
                debug!(
                    "  t={:.2}s | records={} | pending={}",
                    world.time(),
                    world.record_count(),
                    world.runloop.pending()
                );
            }
        }
        Self::settle(world, metrics)?;
        world.verify()
    }

    /// DST-003: add/remove pairs inside one tick collapse to the last
    /// membership operation.
    fn run_coalesce(&self, world: &mut SimWorld, metrics: &mut ScenarioMetrics) -> Result<(), String> {
        #[derive(Debug, Clone, Copy)]
        enum Pattern {
            Add,
            AddRemove,
            AddRemoveAdd,
            RemoveAdd,
        }

        let added: Rc<RefCell<HashMap<Euid, usize>>> = Rc::new(RefCell::new(HashMap::new()));
        let sink = Rc::clone(&added);
        world.store.on(&world.kind, "add", move |_, event| {
            if let Some(record) = &event.record {
                *sink.borrow_mut().entry(record.euid()).or_default() += 1;
            }
        });

        let store = Rc::clone(&world.store);
        let kind = Rc::clone(&world.kind);
        let patterns = [Pattern::Add, Pattern::AddRemove, Pattern::AddRemoveAdd, Pattern::RemoveAdd];

        let count = self.ticks.clamp(8, 64) as u32;
        let drawn: Vec<Pattern> = world
            .context
            .with_rng(|rng| (0..count).map(|_| patterns[rng.gen_range(0..patterns.len())]).collect());

        // Records that get removed and re-added must be wired beforehand
        let mut cases: Vec<(Pattern, RecordRef)> = Vec::new();
        for (id, pattern) in (0..count).zip(drawn.iter().copied()) {
            if matches!(pattern, Pattern::RemoveAdd) {
                let record = store.create(&kind, attrs(item_attributes(id, 0)), RecordOptions::default());
                cases.push((pattern, record));
            }
        }
        Self::flush(world, metrics)?;
        for (id, pattern) in (0..count).zip(drawn.iter().copied()) {
            if !matches!(pattern, Pattern::RemoveAdd) {
                let record = store.create(&kind, attrs(item_attributes(id, 0)), RecordOptions::default());
                cases.push((pattern, record));
            }
        }
        for (pattern, record) in &cases {
            match pattern {
                Pattern::Add => {}
                Pattern::AddRemove => {
                    store.remove(record, StoreOptions::default());
                }
                Pattern::AddRemoveAdd | Pattern::RemoveAdd => {
                    store.remove(record, StoreOptions::default());
                    store.add(record, StoreOptions::default());
                }
            }
            metrics.ops_applied += 1;
        }
        Self::flush(world, metrics)?;
        Self::flush(world, metrics)?;

        for (pattern, record) in &cases {
            let present = !matches!(pattern, Pattern::AddRemove);
            let expected_adds = match pattern {
                Pattern::Add | Pattern::AddRemoveAdd => 1,
                Pattern::AddRemove => 0,
                Pattern::RemoveAdd => 2,
            };
            let adds = added.borrow().get(&record.euid()).copied().unwrap_or(0);
            if store.is_wired(record) != present || store.contains(record) != present || adds != expected_adds {
                return Err(format!(
                    "{:?} on {}: wired={} registered={} add events={} (expected {} / {})",
                    pattern,
                    record.euid(),
                    store.is_wired(record),
                    store.contains(record),
                    adds,
                    present,
                    expected_adds
                ));
            }
        }
        Ok(())
    }

    /// DST-004: collections syncing overlapping payloads share one record
    /// per primary key.
    fn run_adoption(&self, world: &mut SimWorld, metrics: &mut ScenarioMetrics) -> Result<(), String> {
        let key_space = world.config.key_space;
        let seed_items: Vec<(u32, i64)> = (0..key_space).map(|id| (id, i64::from(id))).collect();
        let effect = world.apply(&SimOp::AddBatch {
            collection: 0,
            items: seed_items,
            purge: false,
        })?;
        metrics.records_created += effect.created as u64;

        for collection in 1..world.collections.len() {
            let items: Vec<(u32, i64)> = world.context.with_rng(|rng| {
                (0..key_space)
                    .filter_map(|id| {
                        if rng.gen_bool(0.5) {
                            Some((id, rng.gen_range(-1000..1000)))
                        } else {
                            None
                        }
                    })
                    .collect()
            });
            let effect = world.apply(&SimOp::AddBatch {
                collection,
                items,
                purge: false,
            })?;
            if effect.created > 0 {
                return Err(format!("collection {} created {} duplicate records", collection, effect.created));
            }
            metrics.adoptions += effect.adopted as u64;
            metrics.ops_applied += 1;
        }
        world.verify()?;

        let origin = Rc::clone(&world.collections[0]);
        for collection in world.collections.iter().skip(1) {
            for record in collection.records() {
                let shared = record.id().and_then(|id| origin.get(&Identity::Key(id)));
                if !shared.map_or(false, |shared| Rc::ptr_eq(&shared, &record)) {
                    return Err(format!("record {} is not shared with collection 0", record.euid()));
                }
            }
        }

        let found: Rc<RefCell<Option<BTreeSet<String>>>> = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&found);
        world.store.find_local(&world.kind, |_| true, FindOptions::default(), move |records| {
            let ids: BTreeSet<String> = records
                .iter()
                .filter_map(|r| r.id().map(|id| id.to_string()))
                .collect();
            *sink.borrow_mut() = Some(ids);
        });
        Self::flush(world, metrics)?;

        let expected: BTreeSet<String> = world.oracle.registered_ids().iter().map(|id| id.to_string()).collect();
        match found.borrow().as_ref() {
            Some(ids) if *ids == expected => {}
            Some(ids) => return Err(format!("find_local saw {} records, expected {}", ids.len(), expected.len())),
            None => return Err("find_local never answered".to_string()),
        }
        Self::settle(world, metrics)
    }

    /// DST-005: destroying collections destroys what they own, unless
    /// configured to preserve it, and leaves adopted records alone.
    fn run_teardown(&self, world: &mut SimWorld, metrics: &mut ScenarioMetrics) -> Result<(), String> {
        let owner = world.add_collection(CollectionConfig::default());
        let keeper = world.add_collection(CollectionConfig {
            preserve_records: true,
            ..Default::default()
        });
        let borrower = world.add_collection(CollectionConfig::default());

        let items = |range: std::ops::Range<u32>| -> Vec<Incoming> {
            range
                .map(|id| Incoming::from(attrs(item_attributes(id, i64::from(id) + 1))))
                .collect()
        };
        let (owner, keeper, borrower) = (
            Rc::clone(&world.collections[owner]),
            Rc::clone(&world.collections[keeper]),
            Rc::clone(&world.collections[borrower]),
        );
        owner.add(items(0..5), AddOptions::default());
        keeper.add(items(10..15), AddOptions::default());
        borrower.add(items(2..3).into_iter().chain(items(12..13)), AddOptions::default());
        metrics.ops_applied += 3;
        Self::flush(world, metrics)?;

        let before = world.record_count();
        owner.destroy();
        keeper.destroy();
        metrics.destroys += 5;

        if !owner.is_destroyed() || !keeper.is_destroyed() {
            return Err("collections not marked destroyed".to_string());
        }
        if world.record_count() != before - 5 {
            return Err(format!("store holds {} records, expected {}", world.record_count(), before - 5));
        }
        let borrowed: Vec<String> = borrower.map(|r, _| r.id().map(|id| id.to_string()).unwrap_or_default());
        if borrowed != ["12"] {
            return Err(format!("borrower holds {:?}, expected [\"12\"]", borrowed));
        }
        let preserved = world
            .store
            .get(&world.kind, &Identity::Key(RecordId::from(12)))
            .ok_or("preserved record left the store")?;
        if preserved.owner().is_some() {
            return Err("preserved record still has an owner".to_string());
        }

        owner.add(items(20..21), AddOptions::default());
        if !owner.is_empty() {
            return Err("destroyed collection accepted an add".to_string());
        }

        // Nothing the borrower holds is its own
        let before = world.record_count();
        borrower.destroy();
        if world.record_count() != before {
            return Err("destroying a borrower destroyed adopted records".to_string());
        }
        Self::settle(world, metrics)?;

        world.store.teardown();
        if world.record_count() != 0 || world.store.add(&preserved, StoreOptions::default()) {
            return Err("torn-down store still accepts records".to_string());
        }
        Ok(())
    }

    /// DST-006: shuffled enqueues across channels run in channel order,
    /// FIFO within a channel; work queued during a flush waits a tick.
    fn run_flush_order(&self, world: &mut SimWorld, metrics: &mut ScenarioMetrics) -> Result<(), String> {
        let runloop: Rc<Runloop> = Rc::clone(&world.runloop);
        let order = runloop.channels();
        let log: Rc<RefCell<Vec<(usize, usize)>>> = Rc::new(RefCell::new(Vec::new()));
        let followups = Rc::new(Cell::new(0usize));

        for round in 0..self.ticks.clamp(1, 32) {
            let mut picks: Vec<usize> = (0..24).map(|i| i % order.len()).collect();
            world.context.with_rng(|rng| picks.shuffle(rng));

            for (seq, channel_index) in picks.iter().copied().enumerate() {
                let log = Rc::clone(&log);
                let followups = Rc::clone(&followups);
                let weak = Rc::downgrade(&runloop);
                let job = Box::new(move || {
                    log.borrow_mut().push((channel_index, seq));
                    if seq == 0 {
                        if let Some(runloop) = weak.upgrade() {
                            let followups = Rc::clone(&followups);
                            let followup = Box::new(move || followups.set(followups.get() + 1));
                            if let Err(err) = runloop.enqueue(channel::ADD, followup) {
                                warn!(%err, "followup job dropped");
                            }
                        }
                    }
                });
                runloop.enqueue(order[channel_index], job).map_err(|e| e.to_string())?;
                metrics.ops_applied += 1;
            }

            let mut expected: Vec<(usize, usize)> = picks.iter().copied().enumerate().map(|(s, c)| (c, s)).collect();
            expected.sort_by_key(|(channel, _)| *channel);

            let done_before = followups.get();
            Self::flush(world, metrics)?;
            let ran = std::mem::take(&mut *log.borrow_mut());
            if ran != expected {
                return Err(format!("round {}: flush order {:?}, expected {:?}", round, ran, expected));
            }
            if followups.get() != done_before {
                return Err(format!("round {}: job queued during flush ran in the same tick", round));
            }
            Self::flush(world, metrics)?;
            if followups.get() != done_before + 1 {
                return Err(format!("round {}: job queued during flush never ran", round));
            }
        }
        Ok(())
    }

    /// DST-007: a collection serialized to JSON and parsed back into a
    /// fresh store yields the same raw records.
    fn run_round_trip(&self, world: &mut SimWorld, metrics: &mut ScenarioMetrics) -> Result<(), String> {
        for _ in 0..self.ticks.min(50) {
            for _ in 0..self.ops_per_tick {
                let op = world.random_op(OpMix::Churn);
                world.apply(&op)?;
                metrics.ops_applied += 1;
            }
            Self::flush(world, metrics)?;
        }
        world.verify()?;

        for (index, collection) in world.collections.iter().enumerate() {
            let json = collection.to_json().map_err(|e| e.to_string())?;
            let payload: serde_json::Value = serde_json::from_str(&json).map_err(|e| e.to_string())?;

            let replica_store = Store::new(Rc::new(Runloop::default()));
            let replica = Collection::new(Rc::clone(&world.kind), replica_store);
            let outcome = replica.add(
                collection.parse(payload).into_iter().map(Incoming::from),
                AddOptions {
                    parse: true,
                    find: false,
                    ..Default::default()
                },
            );
            if outcome.added.len() != collection.len() || replica.raw() != collection.raw() {
                return Err(format!(
                    "collection {}: replica has {} records, source {}",
                    index,
                    replica.len(),
                    collection.len()
                ));
            }
        }
        Self::settle(world, metrics)
    }
}
