//! Failure classification shared by the generation boundary and the job queue.

use serde::{Deserialize, Serialize};

/// Whether a failed attempt is worth repeating.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Timeouts, rate limits, server errors, empty or malformed responses.
    Transient,
    /// Invalid input, irrecoverable state, authentication or configuration errors.
    Permanent,
}

impl FailureKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureKind::Transient)
    }
}
