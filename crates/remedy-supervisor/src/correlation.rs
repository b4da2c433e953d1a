//! Correlation tracking for one trigger-to-completion cycle.

use chrono::Utc;
use tracing::Span;

use remedy_core::types::{CorrelationContext, CorrelationId, Task};

/// Start a fresh correlation context for a cycle on `task`.
pub fn begin(task: &Task) -> CorrelationContext {
    CorrelationContext {
        correlation_id: CorrelationId::new(),
        task: task.spec.key.clone(),
        started_at: Utc::now(),
        target: task.spec.target.clone(),
    }
}

/// Span that tags every log line of a cycle with its correlation id.
pub fn cycle_span(ctx: &CorrelationContext) -> Span {
    tracing::info_span!(
        "cycle",
        task = %ctx.task,
        target = %ctx.target,
        correlation_id = %ctx.correlation_id,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use remedy_core::types::{TargetRef, TaskKey, TaskSpec};
    use remedy_core::SafetyConfig;

    #[test]
    fn each_cycle_gets_a_new_id() {
        let task = Task::new(
            TaskSpec {
                key: TaskKey::new("shop", "checkout"),
                target: TargetRef::namespaced("Deployment", "shop", "checkout"),
                conditions: vec![],
                safety: SafetyConfig::default(),
            },
            10,
        );

        let a = begin(&task);
        let b = begin(&task);
        assert_ne!(a.correlation_id, b.correlation_id);
        assert_eq!(a.task, task.spec.key);
        assert_eq!(a.target, task.spec.target);
    }
}
