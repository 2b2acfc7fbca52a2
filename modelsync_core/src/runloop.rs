//! The Runloop - fixed-interval batching scheduler.
//!
//! Every observable side effect of a mutation is enqueued here as a job on
//! a named channel and executed in the next flush ("tick"):
//!
//! ```text
//!   enqueue ──► pending queue ──tick()──► add ─► remove ─► event ─► remote ─► find_local
//!                 ▲                                   │
//!                 └──── jobs enqueued during a flush ─┘  (run next tick)
//! ```
//!
//! Channels run in registration order. A channel may carry a coalescing
//! function that decides how a keyed job merges with what is already
//! pending; `add` and `remove` coalesce per record so only the later
//! membership operation of a tick survives.

use crate::error::SyncError;
use indexmap::IndexMap;
use modelsync_env::{Euid, SyncContext};
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, trace};

/// A deferred unit of work.
pub type Job = Box<dyn FnOnce()>;

/// Standard channel names, in flush order.
pub mod channel {
    pub const ADD: &str = "add";
    pub const REMOVE: &str = "remove";
    pub const EVENT: &str = "event";
    pub const REMOTE: &str = "remote";
    pub const FIND_LOCAL: &str = "find_local";
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the Runloop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunloopConfig {
    /// Time between flushes when driven by `run` (default: 15ms)
    pub interval: Duration,
}

impl Default for RunloopConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(15),
        }
    }
}

// ============================================================================
// PENDING QUEUE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Slot {
    Keyed(Euid),
    Seq(u64),
}

/// Jobs waiting on one channel, in insertion order.
#[derive(Default)]
pub struct ChannelQueue {
    jobs: IndexMap<Slot, Job>,
}

impl ChannelQueue {
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn contains_key(&self, key: Euid) -> bool {
        self.jobs.contains_key(&Slot::Keyed(key))
    }

    /// Stores `job` under `key`. A job already pending for the key is
    /// replaced in place. Returns true if one was replaced.
    pub fn insert_keyed(&mut self, key: Euid, job: Job) -> bool {
        self.jobs.insert(Slot::Keyed(key), job).is_some()
    }

    /// Drops the job pending under `key`, if any.
    pub fn remove_keyed(&mut self, key: Euid) -> bool {
        self.jobs.shift_remove(&Slot::Keyed(key)).is_some()
    }

    fn push(&mut self, seq: u64, job: Job) {
        self.jobs.insert(Slot::Seq(seq), job);
    }

    fn into_jobs(self) -> impl Iterator<Item = Job> {
        self.jobs.into_values()
    }
}

/// Everything enqueued since the last flush.
#[derive(Default)]
pub struct PendingQueue {
    channels: HashMap<&'static str, ChannelQueue>,
    seq: u64,
}

impl PendingQueue {
    pub fn channel(&self, name: &str) -> Option<&ChannelQueue> {
        self.channels.get(name)
    }

    pub fn channel_mut(&mut self, name: &'static str) -> &mut ChannelQueue {
        self.channels.entry(name).or_default()
    }

    pub fn len(&self) -> usize {
        self.channels.values().map(ChannelQueue::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.values().all(ChannelQueue::is_empty)
    }

    fn take(&mut self, name: &str) -> Option<ChannelQueue> {
        self.channels.remove(name)
    }
}

/// Merges a keyed job into the pending queue.
pub type Coalescer = fn(Euid, Job, &mut PendingQueue);

/// A pending `remove` for the same record is cancelled by a later `add`.
pub fn coalesce_add(key: Euid, job: Job, queue: &mut PendingQueue) {
    if queue.channel_mut(channel::REMOVE).remove_keyed(key) {
        trace!(record = %key, "add cancels pending remove");
    }
    if queue.channel_mut(channel::ADD).insert_keyed(key, job) {
        trace!(record = %key, "add coalesced");
    }
}

/// A pending `add` for the same record is cancelled by a later `remove`.
pub fn coalesce_remove(key: Euid, job: Job, queue: &mut PendingQueue) {
    if queue.channel_mut(channel::ADD).remove_keyed(key) {
        trace!(record = %key, "remove cancels pending add");
    }
    if queue.channel_mut(channel::REMOVE).insert_keyed(key, job) {
        trace!(record = %key, "remove coalesced");
    }
}

// ============================================================================
// RUNLOOP
// ============================================================================

struct ChannelDef {
    name: &'static str,
    coalesce: Option<Coalescer>,
}

/// Result of one flush.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Tick number (1-based); 0 when the flush was skipped
    pub tick: u64,

    /// Jobs run per channel, in flush order
    pub jobs: Vec<(&'static str, usize)>,
}

impl TickReport {
    pub fn total(&self) -> usize {
        self.jobs.iter().map(|(_, n)| n).sum()
    }

    pub fn jobs_for(&self, name: &str) -> usize {
        self.jobs
            .iter()
            .find(|(channel, _)| *channel == name)
            .map_or(0, |(_, n)| *n)
    }
}

/// Resets the flushing flag even if a job panics.
struct FlushGuard<'a>(&'a Cell<bool>);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

pub struct Runloop {
    config: RunloopConfig,
    channels: Vec<ChannelDef>,
    pending: RefCell<PendingQueue>,
    flushing: Cell<bool>,
    running: Cell<bool>,
    ticks: Cell<u64>,
}

impl Runloop {
    /// Creates a runloop with no channels.
    pub fn new(config: RunloopConfig) -> Self {
        Self {
            config,
            channels: Vec::new(),
            pending: RefCell::new(PendingQueue::default()),
            flushing: Cell::new(false),
            running: Cell::new(false),
            ticks: Cell::new(0),
        }
    }

    /// Creates a runloop with the five standard channels.
    pub fn standard(config: RunloopConfig) -> Self {
        let mut runloop = Self::new(config);
        runloop
            .register(channel::ADD, Some(coalesce_add))
            .register(channel::REMOVE, Some(coalesce_remove))
            .register(channel::EVENT, None)
            .register(channel::REMOTE, None)
            .register(channel::FIND_LOCAL, None);
        runloop
    }

    /// Appends a channel to the flush order. Re-registering a name only
    /// replaces its coalescer.
    pub fn register(&mut self, name: &'static str, coalesce: Option<Coalescer>) -> &mut Self {
        match self.channels.iter_mut().find(|def| def.name == name) {
            Some(def) => def.coalesce = coalesce,
            None => self.channels.push(ChannelDef { name, coalesce }),
        }
        self
    }

    /// Channel names in flush order.
    pub fn channels(&self) -> Vec<&'static str> {
        self.channels.iter().map(|def| def.name).collect()
    }

    pub fn interval(&self) -> Duration {
        self.config.interval
    }

    fn channel_def(&self, name: &str) -> Result<&ChannelDef, SyncError> {
        self.channels
            .iter()
            .find(|def| def.name == name)
            .ok_or_else(|| SyncError::UnknownChannel(name.to_string()))
    }

    /// Appends an unkeyed job to `channel`.
    pub fn enqueue(&self, channel: &str, job: Job) -> Result<(), SyncError> {
        let name = self.channel_def(channel)?.name;
        let mut pending = self.pending.borrow_mut();
        pending.seq += 1;
        let seq = pending.seq;
        pending.channel_mut(name).push(seq, job);
        Ok(())
    }

    /// Enqueues a job keyed by record, merged through the channel's
    /// coalescer (or replacing any same-key job when it has none).
    pub fn enqueue_keyed(&self, channel: &str, key: Euid, job: Job) -> Result<(), SyncError> {
        let def = self.channel_def(channel)?;
        let mut pending = self.pending.borrow_mut();
        match def.coalesce {
            Some(coalesce) => coalesce(key, job, &mut pending),
            None => {
                pending.channel_mut(def.name).insert_keyed(key, job);
            }
        }
        Ok(())
    }

    /// Number of jobs waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.pending.borrow().len()
    }

    pub fn is_idle(&self) -> bool {
        self.pending.borrow().is_empty()
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing.get()
    }

    /// Number of completed flushes.
    pub fn tick_count(&self) -> u64 {
        self.ticks.get()
    }

    /// Flushes everything pending, channel by channel.
    ///
    /// Calling `tick` from inside a job does nothing; that work is picked
    /// up by the following tick.
    pub fn tick(&self) -> TickReport {
        if self.flushing.get() {
            trace!("tick requested during flush, skipped");
            return TickReport::default();
        }
        let _guard = FlushGuard(&self.flushing);
        self.flushing.set(true);

        let mut queue = self.pending.replace(PendingQueue::default());
        let tick = self.ticks.get() + 1;
        self.ticks.set(tick);

        let mut jobs = Vec::with_capacity(self.channels.len());
        for def in &self.channels {
            let ran = match queue.take(def.name) {
                Some(channel) => {
                    let count = channel.len();
                    for job in channel.into_jobs() {
                        job();
                    }
                    count
                }
                None => 0,
            };
            jobs.push((def.name, ran));
        }

        let report = TickReport { tick, jobs };
        if report.total() > 0 {
            debug!(tick, jobs = ?report.jobs, "runloop flushed");
        }
        report
    }

    /// Drives `tick` every `interval` on `ctx`'s clock until `stop`.
    /// Returns the number of ticks run.
    pub async fn run<C: SyncContext + ?Sized>(&self, ctx: &C) -> u64 {
        self.running.set(true);
        let mut flushed = 0;
        while self.running.get() {
            ctx.sleep(self.config.interval).await;
            if !self.running.get() {
                break;
            }
            self.tick();
            flushed += 1;
        }
        debug!(flushed, "runloop stopped");
        flushed
    }

    pub fn stop(&self) {
        self.running.set(false);
    }

    pub fn is_running(&self) -> bool {
        self.running.get()
    }
}

impl Default for Runloop {
    fn default() -> Self {
        Self::standard(RunloopConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelsync_env::TokioContext;
    use std::rc::Rc;

    fn logger(log: &Rc<RefCell<Vec<String>>>, entry: &str) -> Job {
        let log = log.clone();
        let entry = entry.to_string();
        Box::new(move || log.borrow_mut().push(entry))
    }

    #[test]
    fn test_default_interval() {
        assert_eq!(Runloop::default().interval(), Duration::from_millis(15));
    }

    #[test]
    fn test_config_and_report_serialize() {
        let config: RunloopConfig =
            serde_json::from_value(serde_json::json!({"interval": {"secs": 0, "nanos": 5_000_000}})).unwrap();
        assert_eq!(config.interval, Duration::from_millis(5));

        let runloop = Runloop::standard(config);
        runloop.enqueue(channel::EVENT, Box::new(|| {})).unwrap();
        let report = serde_json::to_value(runloop.tick()).unwrap();
        assert_eq!(report["tick"], 1);
        assert_eq!(report["jobs"][2], serde_json::json!(["event", 1]));
    }

    #[test]
    fn test_flush_order_is_channel_order() {
        let runloop = Runloop::default();
        let log = Rc::new(RefCell::new(Vec::new()));

        runloop.enqueue(channel::FIND_LOCAL, logger(&log, "find_local")).unwrap();
        runloop.enqueue(channel::EVENT, logger(&log, "event")).unwrap();
        runloop.enqueue(channel::REMOTE, logger(&log, "remote")).unwrap();
        runloop.enqueue_keyed(channel::REMOVE, Euid::from_raw(2), logger(&log, "remove")).unwrap();
        runloop.enqueue_keyed(channel::ADD, Euid::from_raw(1), logger(&log, "add")).unwrap();

        let report = runloop.tick();
        assert_eq!(*log.borrow(), vec!["add", "remove", "event", "remote", "find_local"]);
        assert_eq!(report.tick, 1);
        assert_eq!(report.total(), 5);
        assert!(runloop.is_idle());
    }

    #[test]
    fn test_add_then_remove_only_remove_fires() {
        let runloop = Runloop::default();
        let log = Rc::new(RefCell::new(Vec::new()));
        let key = Euid::from_raw(10);

        runloop.enqueue_keyed(channel::ADD, key, logger(&log, "add")).unwrap();
        runloop.enqueue_keyed(channel::REMOVE, key, logger(&log, "remove")).unwrap();
        let report = runloop.tick();

        assert_eq!(*log.borrow(), vec!["remove"]);
        assert_eq!(report.jobs_for(channel::ADD), 0);
    }

    #[test]
    fn test_remove_then_add_only_add_fires() {
        let runloop = Runloop::default();
        let log = Rc::new(RefCell::new(Vec::new()));
        let key = Euid::from_raw(11);

        runloop.enqueue_keyed(channel::REMOVE, key, logger(&log, "remove")).unwrap();
        runloop.enqueue_keyed(channel::ADD, key, logger(&log, "add")).unwrap();
        runloop.tick();

        assert_eq!(*log.borrow(), vec!["add"]);
    }

    #[test]
    fn test_latest_payload_keeps_first_slot() {
        let runloop = Runloop::default();
        let log = Rc::new(RefCell::new(Vec::new()));
        let (a, b) = (Euid::from_raw(1), Euid::from_raw(2));

        runloop.enqueue_keyed(channel::ADD, a, logger(&log, "a1")).unwrap();
        runloop.enqueue_keyed(channel::ADD, b, logger(&log, "b1")).unwrap();
        runloop.enqueue_keyed(channel::ADD, a, logger(&log, "a2")).unwrap();
        assert_eq!(runloop.pending(), 2);
        runloop.tick();

        assert_eq!(*log.borrow(), vec!["a2", "b1"]);
    }

    #[test]
    fn test_work_enqueued_during_flush_runs_next_tick() {
        let runloop = Rc::new(Runloop::default());
        let log = Rc::new(RefCell::new(Vec::new()));

        let (inner, inner_log) = (runloop.clone(), log.clone());
        runloop
            .enqueue(
                channel::EVENT,
                Box::new(move || {
                    inner_log.borrow_mut().push("outer".to_string());
                    inner.enqueue(channel::ADD, logger(&inner_log, "nested")).unwrap();
                    // Reentrant flush is skipped
                    assert_eq!(inner.tick().tick, 0);
                }),
            )
            .unwrap();

        runloop.tick();
        assert_eq!(*log.borrow(), vec!["outer"]);
        assert_eq!(runloop.pending(), 1);

        runloop.tick();
        assert_eq!(*log.borrow(), vec!["outer", "nested"]);
        assert_eq!(runloop.tick_count(), 2);
    }

    #[test]
    fn test_unknown_channel() {
        let runloop = Runloop::new(RunloopConfig::default());
        let err = runloop.enqueue("bogus", Box::new(|| {})).unwrap_err();
        assert_eq!(err, SyncError::UnknownChannel("bogus".into()));
        assert!(runloop.channels().is_empty());
    }

    #[test]
    fn test_custom_channel_registration() {
        let mut runloop = Runloop::new(RunloopConfig::default());
        runloop.register("first", None).register("second", None);
        let log = Rc::new(RefCell::new(Vec::new()));

        runloop.enqueue("second", logger(&log, "second")).unwrap();
        runloop.enqueue("first", logger(&log, "first")).unwrap();
        runloop.tick();

        assert_eq!(*log.borrow(), vec!["first", "second"]);
        assert_eq!(runloop.channels(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_run_until_stopped() {
        let runloop = Rc::new(Runloop::standard(RunloopConfig {
            interval: Duration::from_millis(1),
        }));
        let handle = runloop.clone();
        runloop
            .enqueue(channel::EVENT, Box::new(move || handle.stop()))
            .unwrap();

        let ctx = TokioContext::new();
        let flushed = runloop.run(&ctx).await;

        assert_eq!(flushed, 1);
        assert!(!runloop.is_running());
    }
}
