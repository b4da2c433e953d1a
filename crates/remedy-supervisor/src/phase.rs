//! The Task phase machine.
//!
//! `transition` is the only way a Task's phase changes. It is pure: the
//! reconciler applies the returned phase and acts on the effect.

use std::time::Duration;

use thiserror::Error;

use remedy_core::types::Phase;

use crate::config::PipelineSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    Begin,
    TriggerFired,
    TriggerDeclined,
    EvaluationFailed,
    Decided { executable: bool },
    DecisionFailed,
    Executed { fatal: bool },
    /// The cycle was cancelled before it finished.
    Aborted,
    CooledDown,
    Withdraw,
}

/// What the reconciler does once a cycle leaves the in-flight phases.
///
/// In-flight transitions carry no effect: the next stage of the cycle is
/// implied by the phase itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Requeue(Requeue),
    Drain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    Poll,
    Success,
    Backoff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub next: Phase,
    pub effect: Option<Effect>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid transition: {event:?} in phase {from}")]
pub struct InvalidTransition {
    pub from: Phase,
    pub event: PhaseEvent,
}

pub fn transition(from: Phase, event: PhaseEvent) -> Result<Transition, InvalidTransition> {
    use Phase::*;
    use PhaseEvent as E;

    let (next, effect) = match (from, event) {
        (Idle, E::Begin) => (Evaluating, None),
        (Evaluating, E::TriggerDeclined | E::EvaluationFailed) => {
            (Idle, Some(Effect::Requeue(Requeue::Poll)))
        }
        (Evaluating, E::TriggerFired) => (Deciding, None),
        (Deciding, E::Decided { executable: true }) => (Executing, None),
        (Deciding, E::Decided { executable: false }) => {
            (Completed, Some(Effect::Requeue(Requeue::Success)))
        }
        (Deciding, E::DecisionFailed) => (Error, Some(Effect::Requeue(Requeue::Backoff))),
        (Executing, E::Executed { fatal: false }) => {
            (Completed, Some(Effect::Requeue(Requeue::Success)))
        }
        (Executing, E::Executed { fatal: true }) => {
            (Error, Some(Effect::Requeue(Requeue::Backoff)))
        }
        (Evaluating | Deciding | Executing, E::Aborted) => {
            (Error, Some(Effect::Requeue(Requeue::Backoff)))
        }
        (Completed | Error, E::CooledDown) => (Idle, None),
        (Retired, E::Withdraw) => (Retired, None),
        (phase, E::Withdraw) if !phase.is_in_flight() => (Retired, Some(Effect::Drain)),
        _ => return Err(InvalidTransition { from, event }),
    };

    Ok(Transition { next, effect })
}

/// Requeue delays per outcome.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RequeuePolicy {
    pub poll: Duration,
    pub success: Duration,
    pub backoff_base: Duration,
    pub backoff_multiplier: f64,
    pub backoff_max: Duration,
}

impl RequeuePolicy {
    pub fn from_settings(settings: &PipelineSettings) -> Self {
        Self {
            poll: settings.poll_interval,
            success: settings.success_interval,
            backoff_base: settings.backoff_base,
            backoff_multiplier: settings.backoff_multiplier,
            backoff_max: settings.backoff_max,
        }
    }

    /// `consecutive_errors` counts the error that just happened.
    pub fn delay(&self, requeue: Requeue, consecutive_errors: u32) -> Duration {
        match requeue {
            Requeue::Poll => self.poll,
            Requeue::Success => self.success,
            Requeue::Backoff => {
                let exponent = i32::try_from(consecutive_errors.saturating_sub(1)).unwrap_or(i32::MAX);
                let secs = self.backoff_base.as_secs_f64() * self.backoff_multiplier.powi(exponent);
                Duration::try_from_secs_f64(secs)
                    .unwrap_or(self.backoff_max)
                    .min(self.backoff_max)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use Phase::*;

    const ALL: [Phase; 7] = [Idle, Evaluating, Deciding, Executing, Completed, Error, Retired];

    #[test]
    fn happy_path() {
        let mut phase = Idle;
        for event in [
            PhaseEvent::Begin,
            PhaseEvent::TriggerFired,
            PhaseEvent::Decided { executable: true },
            PhaseEvent::Executed { fatal: false },
            PhaseEvent::CooledDown,
        ] {
            let t = transition(phase, event).unwrap();
            if t.next.is_in_flight() {
                assert_eq!(t.effect, None);
            }
            phase = t.next;
        }
        assert_eq!(phase, Idle);
    }

    #[test]
    fn declined_trigger_returns_to_idle_with_poll() {
        let t = transition(Evaluating, PhaseEvent::TriggerDeclined).unwrap();
        assert_eq!(t.next, Idle);
        assert_eq!(t.effect, Some(Effect::Requeue(Requeue::Poll)));
    }

    #[test]
    fn non_executable_decision_completes() {
        let t = transition(Deciding, PhaseEvent::Decided { executable: false }).unwrap();
        assert_eq!(t.next, Completed);
    }

    #[test]
    fn failures_go_to_error_with_backoff() {
        for (from, event) in [
            (Deciding, PhaseEvent::DecisionFailed),
            (Executing, PhaseEvent::Executed { fatal: true }),
            (Evaluating, PhaseEvent::Aborted),
            (Executing, PhaseEvent::Aborted),
        ] {
            let t = transition(from, event).unwrap();
            assert_eq!(t.next, Error);
            assert_eq!(t.effect, Some(Effect::Requeue(Requeue::Backoff)));
        }
    }

    #[test]
    fn withdraw_only_outside_a_cycle() {
        for from in ALL {
            let result = transition(from, PhaseEvent::Withdraw);
            if from.is_in_flight() {
                assert!(result.is_err(), "{from} should defer withdrawal");
            } else {
                assert_eq!(result.unwrap().next, Retired);
            }
        }
        assert_eq!(transition(Retired, PhaseEvent::Withdraw).unwrap().effect, None);
    }

    #[test]
    fn begin_only_from_idle() {
        for from in ALL {
            assert_eq!(transition(from, PhaseEvent::Begin).is_ok(), from == Idle);
        }
    }

    #[test]
    fn invalid_transition_is_an_error() {
        let err = transition(Completed, PhaseEvent::TriggerFired).unwrap_err();
        assert_eq!(err.from, Completed);
        assert!(err.to_string().contains("completed"));
        assert!(transition(Retired, PhaseEvent::CooledDown).is_err());
        assert!(transition(Idle, PhaseEvent::Aborted).is_err());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RequeuePolicy {
            poll: Duration::from_secs(30),
            success: Duration::from_secs(60),
            backoff_base: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            backoff_max: Duration::from_secs(900),
        };
        assert_eq!(policy.delay(Requeue::Backoff, 1), Duration::from_secs(10));
        assert_eq!(policy.delay(Requeue::Backoff, 2), Duration::from_secs(20));
        assert_eq!(policy.delay(Requeue::Backoff, 4), Duration::from_secs(80));
        assert_eq!(policy.delay(Requeue::Backoff, 20), Duration::from_secs(900));
        assert_eq!(policy.delay(Requeue::Backoff, u32::MAX), Duration::from_secs(900));
        assert_eq!(policy.delay(Requeue::Success, 3), Duration::from_secs(60));
        assert_eq!(policy.delay(Requeue::Poll, 0), Duration::from_secs(30));
    }
}
