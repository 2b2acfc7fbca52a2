//! modelsync Deterministic Simulation Testing (DST) Harness
//!
//! Drives the record graph with seeded random workloads and checks it
//! against a plain reference model after every operation.
//!
//! # Core Principle: Everything Derives From One Seed
//!
//! - **Time**: Virtual clock advanced one runloop interval per flush
//! - **Workload**: Operations drawn from a ChaCha8 RNG seeded by the run
//! - **Identity**: Ephemeral ids come from a process-wide counter, so runs
//!   compare by primary key and by instance binding, never by raw euid
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         SimWorld                            │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │ Runloop (add → remove → event → remote → find_local) │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! │       ▲                        ▲                            │
//! │  ┌────┴────┐              ┌────┴────┐                       │
//! │  │Collection│◄── Store ──►│Collection│    ...                │
//! │  │   #0    │  (registry)  │   #1    │                       │
//! │  └─────────┘              └─────────┘                       │
//! │       ▲                        ▲                            │
//! │  ┌────┴────────────────────────┴────┐                       │
//! │  │            Oracle                 │                       │
//! │  │  (membership + registry model)    │                       │
//! │  └───────────────────────────────────┘                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use modelsync_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42).with_ticks(100).run(ScenarioId::Churn);
//! assert!(result.passed);
//! ```

mod context;
mod exporter;
mod oracle;
mod runner;
mod world;
pub mod scenarios;

pub use context::SimContext;
pub use exporter::{ChannelCount, CollectionFrame, ExportError, SimEvent, SimExport, SimFrame};
pub use oracle::{AddDelta, Notification, Oracle};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use world::{item_attributes, sim_kind, OpEffect, OpMix, SimConfig, SimOp, SimWorld, SIM_KIND};
