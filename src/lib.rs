//! A user-space cooperative runtime: one OS thread per CPU ("context"),
//! each running a non-blocking event loop, a priority fiber scheduler, and
//! a deferred task queue, coordinating with its peers over lock-free MPMC
//! rings and an epoch-reclaimed object pool.
//!
//! Start here: [`config::RuntimeConfig`] to load and validate settings,
//! [`dispatch::Dispatch`] to build and run the set of contexts, and
//! [`context::Context`] for the per-thread scheduler API fiber code calls
//! into (`fiber_yield`, `submit_input`, `sink_prepare_fd`, ...).

pub mod config;
pub mod context;
pub mod dispatch;
pub mod epoch;
pub mod error;
pub mod event;
pub mod fiber;
pub mod logger;
pub mod pool;
pub mod ring;
pub mod runqueue;
pub mod socket;
pub mod task;
pub mod timer;

pub use config::RuntimeConfig;
pub use context::Context;
pub use dispatch::Dispatch;
pub use error::{Error, Result};
pub use logger::RuntimeLogger;
