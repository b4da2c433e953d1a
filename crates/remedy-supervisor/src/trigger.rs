//! Trigger evaluation: the cheap, local gate in front of the orchestrator.
//!
//! Pure functions over a Task and freshly observed state. No I/O.

use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;

use remedy_core::types::{ObservedState, Phase, Task, TriggerCondition};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluationError {
    #[error("Malformed trigger condition #{index}: {reason}")]
    MalformedCondition { index: usize, reason: String },

    #[error("Observed state is for {observed}, task targets {expected}")]
    TargetMismatch { expected: String, observed: String },
}

/// Whether a cycle should start, and why (reported even when it should not).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerEvaluation {
    pub fire: bool,
    pub reason: String,
}

impl TriggerEvaluation {
    fn hold(reason: impl Into<String>) -> Self {
        Self {
            fire: false,
            reason: reason.into(),
        }
    }
}

/// `Err(reason)` when `phase` may not start a new cycle.
pub fn admits(phase: Phase) -> Result<(), String> {
    if phase.is_in_flight() {
        return Err(format!("cycle already in flight (phase {phase})"));
    }
    if phase == Phase::Retired {
        return Err("task is retired".to_string());
    }
    Ok(())
}

/// Decide whether `task` should start a cycle given `observed`.
///
/// Any matching condition fires. Returns false while a cycle is in flight
/// so overlapping cycles on one Task are never started.
pub fn should_trigger(
    task: &Task,
    observed: &ObservedState,
) -> Result<TriggerEvaluation, EvaluationError> {
    if let Err(reason) = admits(task.phase) {
        return Ok(TriggerEvaluation::hold(reason));
    }

    if observed.target != task.spec.target {
        return Err(EvaluationError::TargetMismatch {
            expected: task.spec.target.to_string(),
            observed: observed.target.to_string(),
        });
    }

    validate_conditions(&task.spec.conditions)?;

    if task.spec.conditions.is_empty() {
        return Ok(TriggerEvaluation::hold("no trigger conditions declared"));
    }

    let mut misses = Vec::new();
    for condition in &task.spec.conditions {
        let (matched, reason) = check_condition(condition, observed);
        if matched {
            return Ok(TriggerEvaluation {
                fire: true,
                reason,
            });
        }
        misses.push(reason);
    }

    Ok(TriggerEvaluation::hold(misses.join("; ")))
}

/// Reject conditions that can never be evaluated meaningfully.
pub fn validate_conditions(conditions: &[TriggerCondition]) -> Result<(), EvaluationError> {
    for (index, condition) in conditions.iter().enumerate() {
        let problem = match condition {
            TriggerCondition::Metric {
                metric, threshold, ..
            } => {
                if metric.trim().is_empty() {
                    Some("metric name is empty")
                } else if !threshold.is_finite() {
                    Some("threshold is not a finite number")
                } else {
                    None
                }
            }
            TriggerCondition::Event {
                reason,
                min_count,
                window_secs,
                ..
            } => {
                if reason.trim().is_empty() {
                    Some("event reason pattern is empty")
                } else if *min_count == 0 {
                    Some("min_count must be at least 1")
                } else if *window_secs == 0 {
                    Some("window_secs must be positive")
                } else {
                    None
                }
            }
        };

        if let Some(reason) = problem {
            return Err(EvaluationError::MalformedCondition {
                index,
                reason: reason.to_string(),
            });
        }
    }
    Ok(())
}

fn check_condition(condition: &TriggerCondition, observed: &ObservedState) -> (bool, String) {
    match condition {
        TriggerCondition::Metric {
            metric,
            comparator,
            threshold,
        } => match observed.metrics.get(metric) {
            Some(value) => {
                let matched = comparator.holds(*value, *threshold);
                let verb = if matched { "crossed" } else { "within" };
                (
                    matched,
                    format!("{metric}={value} {verb} threshold {comparator} {threshold}"),
                )
            }
            None => (false, format!("metric {metric} not observed")),
        },
        TriggerCondition::Event {
            event_type,
            reason,
            min_count,
            window_secs,
        } => {
            let since = TimeDelta::try_seconds(i64::try_from(*window_secs).unwrap_or(i64::MAX))
                .and_then(|window| observed.observed_at.checked_sub_signed(window))
                .unwrap_or(DateTime::<Utc>::MIN_UTC);

            let count: u32 = observed
                .events
                .iter()
                .filter(|e| e.last_seen >= since)
                .filter(|e| event_type.as_ref().map_or(true, |t| &e.event_type == t))
                .filter(|e| e.reason.contains(reason.as_str()))
                .map(|e| e.count)
                .sum();

            (
                count >= *min_count,
                format!("event {reason} seen {count} times in {window_secs}s (need {min_count})"),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remedy_core::types::{Comparator, ObservedEvent, TargetRef, TaskKey, TaskSpec};
    use remedy_core::SafetyConfig;
    use std::collections::BTreeMap;

    fn target() -> TargetRef {
        TargetRef::namespaced("Deployment", "shop", "checkout")
    }

    fn task(conditions: Vec<TriggerCondition>) -> Task {
        Task::new(
            TaskSpec {
                key: TaskKey::new("shop", "checkout-health"),
                target: target(),
                conditions,
                safety: SafetyConfig::default(),
            },
            10,
        )
    }

    fn observed(metrics: &[(&str, f64)], events: Vec<ObservedEvent>) -> ObservedState {
        ObservedState {
            target: target(),
            metrics: metrics
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect::<BTreeMap<_, _>>(),
            events,
            observed_at: Utc::now(),
        }
    }

    fn event(event_type: &str, reason: &str, count: u32, age_secs: i64) -> ObservedEvent {
        ObservedEvent {
            event_type: event_type.to_string(),
            reason: reason.to_string(),
            message: String::new(),
            count,
            last_seen: Utc::now() - TimeDelta::seconds(age_secs),
        }
    }

    fn restarts_at_least(threshold: f64) -> TriggerCondition {
        TriggerCondition::Metric {
            metric: "restarts".to_string(),
            comparator: Comparator::Gte,
            threshold,
        }
    }

    fn failed_mount(min_count: u32) -> TriggerCondition {
        TriggerCondition::Event {
            event_type: Some("Warning".to_string()),
            reason: "FailedMount".to_string(),
            min_count,
            window_secs: 600,
        }
    }

    #[test]
    fn metric_threshold_fires() {
        let task = task(vec![restarts_at_least(3.0)]);
        let eval = should_trigger(&task, &observed(&[("restarts", 5.0)], vec![])).unwrap();
        assert!(eval.fire);
        assert!(eval.reason.contains("restarts=5"));

        let eval = should_trigger(&task, &observed(&[("restarts", 1.0)], vec![])).unwrap();
        assert!(!eval.fire);
    }

    #[test]
    fn missing_metric_does_not_fire() {
        let task = task(vec![restarts_at_least(3.0)]);
        let eval = should_trigger(&task, &observed(&[], vec![])).unwrap();
        assert!(!eval.fire);
        assert!(eval.reason.contains("not observed"));
    }

    #[test]
    fn event_pattern_counts_within_window() {
        let task = task(vec![failed_mount(3)]);

        let recent = vec![
            event("Warning", "FailedMount", 2, 30),
            event("Warning", "FailedMount", 1, 120),
            event("Normal", "FailedMount", 5, 10),
        ];
        assert!(should_trigger(&task, &observed(&[], recent)).unwrap().fire);

        let stale = vec![
            event("Warning", "FailedMount", 2, 30),
            event("Warning", "FailedMount", 5, 3600),
        ];
        assert!(!should_trigger(&task, &observed(&[], stale)).unwrap().fire);
    }

    #[test]
    fn any_condition_fires() {
        let task = task(vec![restarts_at_least(10.0), failed_mount(1)]);
        let state = observed(
            &[("restarts", 0.0)],
            vec![event("Warning", "FailedMount", 1, 5)],
        );
        let eval = should_trigger(&task, &state).unwrap();
        assert!(eval.fire);
        assert!(eval.reason.contains("FailedMount"));
    }

    #[test]
    fn in_flight_phase_short_circuits() {
        let mut task = task(vec![restarts_at_least(1.0)]);
        let state = observed(&[("restarts", 5.0)], vec![]);

        for phase in [Phase::Evaluating, Phase::Deciding, Phase::Executing] {
            task.phase = phase;
            let eval = should_trigger(&task, &state).unwrap();
            assert!(!eval.fire);
            assert!(eval.reason.contains("in flight"));
        }

        task.phase = Phase::Retired;
        assert!(!should_trigger(&task, &state).unwrap().fire);
    }

    #[test]
    fn malformed_conditions_are_errors() {
        let task_nan = task(vec![restarts_at_least(f64::NAN)]);
        assert!(matches!(
            should_trigger(&task_nan, &observed(&[], vec![])),
            Err(EvaluationError::MalformedCondition { index: 0, .. })
        ));

        let task_zero = task(vec![restarts_at_least(1.0), failed_mount(0)]);
        assert!(matches!(
            should_trigger(&task_zero, &observed(&[], vec![])),
            Err(EvaluationError::MalformedCondition { index: 1, .. })
        ));
    }

    #[test]
    fn target_mismatch_is_an_error() {
        let task = task(vec![restarts_at_least(1.0)]);
        let mut state = observed(&[("restarts", 5.0)], vec![]);
        state.target.name = "payments".to_string();
        assert!(matches!(
            should_trigger(&task, &state),
            Err(EvaluationError::TargetMismatch { .. })
        ));
    }

    #[test]
    fn no_conditions_never_fire() {
        let eval = should_trigger(&task(vec![]), &observed(&[], vec![])).unwrap();
        assert!(!eval.fire);
    }
}
