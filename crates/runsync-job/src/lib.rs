//! Job side of run synchronization
//!
//! Turns remote runs into Kubernetes Jobs and keeps the two in step:
//! - [`compiler`] builds the canonical Job for a run
//! - [`fields`] defines the mutable allow-list and its content hash
//! - [`secret`] provisions the per-run Secret
//! - [`status`] classifies Jobs and pods into run states
//! - [`gate`] is the gate state machine
//! - [`reconciler`] drives a run through all of the above

pub mod compiler;
pub mod error;
pub mod fields;
pub mod gate;
pub mod reconciler;
pub mod secret;
pub mod status;

#[cfg(test)]
mod testing;

pub use compiler::{build_job, ImageDefaults};
pub use error::JobError;
pub use reconciler::{JobContext, RunReconciler};
pub use secret::SecretProvisioner;
