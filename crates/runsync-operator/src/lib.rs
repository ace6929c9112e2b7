//! runsync operator - wiring for the per-kind run controllers
//!
//! - [`config`] parses flags and environment
//! - [`crds`] installs the RunJob CRD
//! - [`events`] serves push events and health
//! - [`runner`] builds and drives the controllers

pub mod config;
pub mod crds;
pub mod events;
pub mod runner;

pub use config::Cli;
