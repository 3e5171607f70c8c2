//! Twine core: the cooperative fiber runtime.
//!
//! Many thousands of lightweight, stackful fibers are multiplexed by a
//! single-threaded event loop per OS thread (a *cord*). Shared mutable
//! state inside a cord needs no locks: only one fiber runs at a time and
//! ownership changes hands exclusively at explicit suspension points.
//!
//! # Key components
//!
//! - **Stacks**: guard-protected, watermark-tracked, page-advised
//!   ([`stack`])
//! - **Fibers**: creation, wakeup/yield/sleep, cancellation, join
//!   ([`fiber`])
//! - **Cords**: scheduler, ready-list dispatch, cross-thread start and
//!   join ([`cord`])
//! - **Triggers**: callbacks on yield, stop and collaborator-defined
//!   events ([`trigger`])
//! - **Scratch regions**: fiber-lifetime bump/recycle allocator
//!   ([`region`])
//!
//! # Example
//!
//! ```no_run
//! use twine_core::{cord, fiber, Fiber};
//!
//! cord::run_main("main", || {
//!     let worker = Fiber::new("worker", Box::new(|| {
//!         fiber::sleep(std::time::Duration::from_millis(10));
//!         Ok(())
//!     }))?;
//!     worker.set_joinable(true);
//!     fiber::start(&worker);
//!     fiber::join(&worker)
//! }).unwrap();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cond;
pub mod config;
pub mod cord;
pub mod diag;
pub mod error;
pub mod evloop;
pub mod fiber;
pub mod region;
pub mod stack;
pub mod trigger;

mod context;

pub use cond::FiberCond;
pub use config::RuntimeConfig;
pub use cord::{Cord, CordHandle};
pub use diag::Diag;
pub use error::{CoreError, Result};
pub use evloop::{IoInterest, IoWatcher, Readiness};
pub use fiber::{Fiber, FiberAttr, FiberFlags};
pub use region::Region;
pub use trigger::{Trigger, TriggerList};
