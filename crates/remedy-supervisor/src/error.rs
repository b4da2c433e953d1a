//! Error types for the remedy-supervisor crate.

use thiserror::Error;

use remedy_core::ObserveError;

use crate::phase::InvalidTransition;
use crate::trigger::EvaluationError;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Observe error: {0}")]
    Observe(#[from] ObserveError),

    #[error("Evaluation error: {0}")]
    Evaluation(#[from] EvaluationError),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("Journal error: {0}")]
    Journal(#[from] remedy_journal::store::StoreError),

    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error("Worker pool closed")]
    PoolClosed,
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
