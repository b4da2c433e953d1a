//! remedy-core: Shared types, safety configuration, and collaborator errors for Remedy.
//!
//! This crate provides the foundational types used across the remediation pipeline:
//! - Tasks, trigger conditions, and observed state
//! - Actions, fingerprints, guard verdicts, decisions, and action records
//! - Per-Task safety configuration
//! - Status events for the watcher's status sink
//! - Error types returned by external collaborators

pub mod config;
pub mod error;
pub mod events;
pub mod types;

pub use config::{OperatingMode, RateLimitConfig, SafetyConfig};
pub use error::{ObserveError, ReasoningError, TargetError};
