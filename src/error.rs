//! Error taxonomy for the memory and action-gating core
//!
//! Edit and search failures are per-operation and never fatal to the
//! process. Action rejections are routine control flow. Only persistence
//! failures abort a cycle.

use std::time::Duration;
use thiserror::Error;

use crate::gateway::ActionKind;

/// Core error type
#[derive(Debug, Error)]
pub enum Error {
    #[error("block '{block}' would hold {len} chars, limit is {limit}")]
    CapacityExceeded {
        block: String,
        len: usize,
        limit: usize,
    },

    #[error("unknown block: {0}")]
    UnknownBlock(String),

    #[error("replace target must occur exactly once in '{block}', found {matches}")]
    NotFound { block: String, matches: usize },

    #[error("line index {0} out of range")]
    IndexOutOfRange(i64),

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("search query is empty")]
    EmptyQuery,

    #[error("{kind} rate limited, retry after {}s", retry_after.as_secs())]
    RateLimited {
        kind: ActionKind,
        retry_after: Duration,
    },

    #[error("{kind} would target own content: {target}")]
    SelfInteraction { kind: ActionKind, target: String },

    #[error("duplicate {kind} inside the de-duplication window")]
    DuplicateAction { kind: ActionKind },

    #[error("consolidation integrity violated: {0}")]
    ConsolidationIntegrity(String),

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("reasoning engine unavailable: {0}")]
    ReasoningEngineUnavailable(String),

    #[error("embedding provider error: {0}")]
    Embedding(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl Error {
    /// Expected gateway outcomes, logged at info and never escalated
    pub fn is_action_rejection(&self) -> bool {
        matches!(
            self,
            Error::RateLimited { .. } | Error::SelfInteraction { .. } | Error::DuplicateAction { .. }
        )
    }

    /// Rejections that stop the rest of a cycle's batch
    pub fn stops_batch(&self) -> bool {
        matches!(self, Error::SelfInteraction { .. } | Error::DuplicateAction { .. })
    }

    /// Errors that abort the whole cycle
    pub fn is_fatal_to_cycle(&self) -> bool {
        matches!(self, Error::Persistence(_))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Persistence(format!("serialization: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
