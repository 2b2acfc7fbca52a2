//! modelsync Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" abstraction allowing the modelsync
//! runloop to be driven both by a **Production** clock (tokio) and by a
//! **Simulation** clock (virtual time, see `modelsync_sim`).
//!
//! # Core Concept
//!
//! The scheduler never reads the wall clock directly. It asks a
//! [`SyncContext`] for the current time and for a sleep of one flush
//! interval, so a simulation can replay the exact same sequence of ticks
//! from a single 64-bit seed.
//!
//! # Example
//!
//! ```ignore
//! use modelsync_env::{SyncContext, TokioContext};
//!
//! async fn drive<Ctx: SyncContext>(ctx: &Ctx, runloop: &Runloop) {
//!     loop {
//!         ctx.sleep(Duration::from_millis(15)).await;
//!         runloop.tick();
//!     }
//! }
//! ```

mod context;
mod tokio_impl;
mod types;

pub use context::SyncContext;
pub use tokio_impl::TokioContext;
pub use types::Euid;
