//! Shared building blocks for the runsync operator
//!
//! - [`Error`]: classified error type for cluster and validation failures
//! - [`kube_utils::ResourceClient`]: keyed CRUD seam over namespaced objects
//! - [`hash::content_hash`]: stable digest used for change detection
//! - [`crd::RunJob`]: local mirror of a remote run
//! - [`metrics`]: OpenTelemetry instruments for jobs, cache and reconciles

pub mod crd;
pub mod error;
pub mod hash;
pub mod kube_utils;
pub mod metrics;
pub mod retry;
pub mod telemetry;

pub use error::{Error, UNKNOWN_CONTEXT};
pub use kube_utils::{KubeClients, KubeResourceClient, NamespacedClients, ResourceClient};
pub use retry::{retry_with_backoff, RetryConfig};

/// Result alias defaulting to the shared error type
pub type Result<T, E = Error> = std::result::Result<T, E>;
