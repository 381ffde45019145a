//! Error taxonomy for the closing engine.
//!
//! Validation problems are raised before any write and carry no side
//! effects. Store failures keep the underlying message intact so it can be
//! shown to the operator verbatim.

use serde::Serialize;
use thiserror::Error;

use crate::closing::SubmissionStep;
use crate::reconciliation::BlockReason;

/// Failure reported by a persistent or scratch store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("{message}")]
    Http { status: Option<u16>, message: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("closing {closing_id} was modified concurrently (expected version {expected}, found {found:?})")]
    VersionConflict {
        closing_id: i64,
        expected: i64,
        found: Option<i64>,
    },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Reasons a submission is refused before touching the store.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[serde(tag = "code", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationError {
    #[error("no authenticated user")]
    MissingActor,

    #[error("no location selected")]
    MissingLocation,

    #[error("no shift selected")]
    MissingShift,

    #[error("{field} is out of range")]
    AmountOutOfRange { field: String },

    #[error("closing cannot be submitted: {reasons:?}")]
    CannotClose { reasons: Vec<BlockReason> },

    #[error("closing changed since it was loaded (loaded version {expected}, current {found})")]
    StaleClosing { expected: i64, found: i64 },
}

/// Outcome of a failed submission.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubmissionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A store call failed mid-sequence. `completed` lists the steps whose
    /// writes already landed; when `rolled_back` is true the store discarded
    /// them as a unit.
    #[error("{source} (while {step})")]
    StepFailed {
        step: SubmissionStep,
        completed: Vec<SubmissionStep>,
        rolled_back: bool,
        source: StoreError,
    },
}

impl SubmissionError {
    /// True when some writes may have been persisted before the failure.
    pub fn is_partial(&self) -> bool {
        match self {
            SubmissionError::Validation(_) => false,
            SubmissionError::StepFailed {
                completed,
                rolled_back,
                ..
            } => !rolled_back && !completed.is_empty(),
        }
    }
}
