//! Error types for dispatchq.
//!
//! Every rejected operation surfaces as a distinct named variant; nothing is
//! coerced into a generic failure and nothing is retried by the core.
//! `InternalConsistency` means an invariant the engine itself guarantees was
//! found violated — a bug or data corruption, logged distinctly from ordinary
//! business-rule rejections.

use thiserror::Error;

use crate::model::{Status, TaskId, TechnicianId};

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition { from: Status, to: Status },

    #[error("technician {technician} is not the assignee of task {task}")]
    NotAuthorized {
        task: TaskId,
        technician: TechnicianId,
    },

    #[error("no eligible technician")]
    NoEligibleTechnician,

    #[error("internal consistency violation: {0}")]
    InternalConsistency(String),

    #[error("decision function failed: {0}")]
    Decision(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
