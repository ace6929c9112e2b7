//! Remote run source for the runsync operator
//!
//! The console owns every run. This crate models its run records, defines the
//! [`RunSource`] seam the engine polls through, and implements it over the
//! console's GraphQL API.

pub mod client;
pub mod error;
pub mod model;
pub mod source;

pub use client::ConsoleClient;
pub use error::ConsoleError;
pub use model::{
    ContainerSpec, ImageSettings, JobRef, JobSpecSource, Page, PageInfo, ResourceValues,
    RunKind, RunRecord, RunResources, RunState, RunStep, StatusAttributes, StepStatus,
    StructuredJobSpec,
};
pub use source::{Pager, RunSource};
