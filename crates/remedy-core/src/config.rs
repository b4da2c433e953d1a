//! Per-Task safety configuration.
//!
//! Declared alongside each supervision request. Defaults favour the
//! cautious side: dry-run mode, no high-impact actions, and human
//! approval for anything high impact that does get through.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::ImpactLevel;

/// How far a Task is allowed to go once a decision is made.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum OperatingMode {
    /// The guard never approves; it only records what would have happened.
    #[default]
    DryRun,
    /// The guard runs fully but the decision is never approved.
    Simulate,
    /// Approved actions are executed.
    Enact,
}

/// Fixed-window action budget per (target, action type).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitConfig {
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_max_actions")]
    pub max_actions: u32,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            max_actions: default_max_actions(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SafetyConfig {
    /// Action types this Task may ever take.
    #[serde(default)]
    pub allowed_types: BTreeSet<String>,

    #[serde(default)]
    pub mode: OperatingMode,

    /// Maximum actions approved within a single cycle.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    #[serde(default)]
    pub allow_high_impact: bool,

    /// Impact levels that force a human review instead of automatic approval.
    #[serde(default = "default_require_approval_for")]
    pub require_approval_for: BTreeSet<ImpactLevel>,

    /// Overrides the supervisor-wide rate limit for this Task.
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

impl SafetyConfig {
    /// An enacting config that allows the given types and nothing else.
    pub fn enact<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_types: allowed.into_iter().map(Into::into).collect(),
            mode: OperatingMode::Enact,
            require_approval_for: BTreeSet::new(),
            ..Self::default()
        }
    }

    pub fn allows_type(&self, action_type: &str) -> bool {
        self.allowed_types.contains(action_type)
    }
}

fn default_window_secs() -> u64 {
    300
}

fn default_max_actions() -> u32 {
    10
}

fn default_max_concurrency() -> usize {
    3
}

fn default_require_approval_for() -> BTreeSet<ImpactLevel> {
    BTreeSet::from([ImpactLevel::High])
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            allowed_types: BTreeSet::new(),
            mode: OperatingMode::default(),
            max_concurrency: default_max_concurrency(),
            allow_high_impact: false,
            require_approval_for: default_require_approval_for(),
            rate_limit: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_safety_config() {
        let config = SafetyConfig::default();
        assert_eq!(config.mode, OperatingMode::DryRun);
        assert_eq!(config.max_concurrency, 3);
        assert!(!config.allow_high_impact);
        assert!(config.require_approval_for.contains(&ImpactLevel::High));
        assert!(config.allowed_types.is_empty());
    }

    #[test]
    fn test_mode_kebab_case() {
        let mode: OperatingMode = serde_json::from_str("\"dry-run\"").unwrap();
        assert_eq!(mode, OperatingMode::DryRun);
        let json = serde_json::to_string(&OperatingMode::Enact).unwrap();
        assert_eq!(json, "\"enact\"");
    }

    #[test]
    fn test_partial_deserialization_fills_defaults() {
        let json = r#"{"allowed_types":["restart"],"mode":"enact"}"#;
        let config: SafetyConfig = serde_json::from_str(json).unwrap();
        assert!(config.allows_type("restart"));
        assert!(!config.allows_type("scale-down"));
        assert_eq!(config.max_concurrency, 3);
        assert_eq!(config.rate_limit, None);
    }

    #[test]
    fn test_enact_helper_has_no_approval_gate() {
        let config = SafetyConfig::enact(["restart"]);
        assert_eq!(config.mode, OperatingMode::Enact);
        assert!(config.require_approval_for.is_empty());
    }
}
