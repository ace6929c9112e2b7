//! External-run synchronization engine
//!
//! Remote runs are discovered by a [`poller::Poller`] and by push
//! notifications ([`publisher::Invalidator`]), both feeding a de-duplicating
//! [`queue::WorkQueue`]. A [`controller::Controller`] drains the queue with a
//! worker pool, resolving records through a TTL [`cache::Cache`] and handing
//! them to a [`controller::Reconcile`] implementation.

pub mod cache;
pub mod controller;
pub mod error;
pub mod poller;
pub mod publisher;
pub mod queue;
pub mod supervisor;

#[cfg(test)]
mod testing;

pub use cache::Cache;
pub use controller::{Action, Controller, ControllerConfig, Reconcile};
pub use error::EngineError;
pub use poller::{Poller, RunCache};
pub use publisher::{topic, Invalidator, Publisher, PublisherRegistry};
pub use queue::WorkQueue;
pub use supervisor::{Supervised, Supervisor};
