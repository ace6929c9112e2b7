//! Console API errors

use thiserror::Error;

/// Errors returned by a [`RunSource`](crate::RunSource)
#[derive(Debug, Error)]
pub enum ConsoleError {
    /// The run no longer exists upstream
    #[error("run {id} not found")]
    NotFound { id: String },

    /// Transport failure or non-success HTTP status
    #[error("console request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The console answered with GraphQL errors
    #[error("console returned errors: {0}")]
    GraphQl(String),

    /// The response body did not have the expected shape
    #[error("failed to decode console response: {0}")]
    Decode(String),
}

impl ConsoleError {
    /// True when the run vanished upstream
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<serde_json::Error> for ConsoleError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}
