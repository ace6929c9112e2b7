//! Job-specific error types

use runsync_console::ConsoleError;

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("{0}")]
    Common(#[from] runsync_common::Error),

    #[error("console error: {0}")]
    Console(#[from] ConsoleError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("illegal gate transition from {from} on {event}")]
    IllegalTransition { from: String, event: String },
}

impl JobError {
    /// The run vanished upstream while we were working on it
    pub fn is_run_gone(&self) -> bool {
        matches!(self, Self::Console(e) if e.is_not_found())
    }

    /// Optimistic-concurrency conflict on a cluster object
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Common(e) if e.is_conflict())
    }

    /// Input that can never produce a Job
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Common(runsync_common::Error::Validation { .. }))
    }
}
