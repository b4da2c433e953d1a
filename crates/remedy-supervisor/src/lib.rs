//! remedy-supervisor: the decision-and-guarded-execution pipeline.
//!
//! Turns observed conditions on supervised targets into validated,
//! safety-gated corrective actions:
//!
//! trigger evaluation → decision orchestration → safety guard →
//! execution → status reconciliation
//!
//! A shared rate limiter and idempotency ledger keep concurrent cycles
//! from taking duplicate or unsafe actions on the same target.

pub mod collaborator;
pub mod config;
pub mod correlation;
pub mod error;
pub mod executor;
pub mod guard;
pub mod http;
pub mod journal;
pub mod ledger;
pub mod limiter;
pub mod orchestrator;
pub mod phase;
pub mod reconciler;
pub mod scheduler;
pub mod trigger;

pub use error::SupervisorError;
pub use reconciler::{Collaborators, CycleOutcome, CycleReport, Pipeline, TaskRuntime};
pub use scheduler::Supervisor;
