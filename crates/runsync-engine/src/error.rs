//! Engine error types

use runsync_console::ConsoleError;

/// Why processing a queued id failed; every variant triggers a backoff retry
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("fetching run failed: {0}")]
    Source(#[from] ConsoleError),

    #[error("reconcile failed: {0}")]
    Reconcile(String),
}
