//! Per-target fixed-window rate limiter.
//!
//! Keys are (target, action type). Each key owns a window that starts on
//! its first admission and rolls over once `window` has elapsed. All
//! mutations happen under one short critical section, so concurrent
//! workers never over-admit.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use remedy_core::types::{Action, TargetRef};
use remedy_core::RateLimitConfig;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateKey {
    pub target: TargetRef,
    pub action_type: String,
}

impl RateKey {
    pub fn for_action(action: &Action) -> Self {
        Self {
            target: action.target.clone(),
            action_type: action.action_type.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Admitted,
    /// Budget exhausted; the window frees up after `retry_after`.
    Limited { retry_after: Duration },
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: Mutex<HashMap<RateKey, Window>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit one action for `key` if the window has budget left.
    pub fn try_acquire(&self, key: &RateKey, limit: &RateLimitConfig, now: Instant) -> RateDecision {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let window = windows.entry(key.clone()).or_insert(Window {
            started: now,
            count: 0,
        });

        if now.saturating_duration_since(window.started) >= limit.window() {
            *window = Window {
                started: now,
                count: 0,
            };
        }

        if window.count >= limit.max_actions {
            return RateDecision::Limited {
                retry_after: remaining(window, limit, now),
            };
        }

        window.count += 1;
        RateDecision::Admitted
    }

    /// What `try_acquire` would answer, without consuming budget.
    pub fn peek(&self, key: &RateKey, limit: &RateLimitConfig, now: Instant) -> RateDecision {
        let windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        match windows.get(key) {
            Some(window)
                if now.saturating_duration_since(window.started) < limit.window()
                    && window.count >= limit.max_actions =>
            {
                RateDecision::Limited {
                    retry_after: remaining(window, limit, now),
                }
            }
            _ => RateDecision::Admitted,
        }
    }

    /// Refund one admission taken for an action that never ran.
    pub fn release(&self, key: &RateKey, limit: &RateLimitConfig, now: Instant) {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(window) = windows.get_mut(key) {
            if now.saturating_duration_since(window.started) < limit.window() {
                window.count = window.count.saturating_sub(1);
            }
        }
    }
}

fn remaining(window: &Window, limit: &RateLimitConfig, now: Instant) -> Duration {
    limit
        .window()
        .saturating_sub(now.saturating_duration_since(window.started))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(action_type: &str) -> RateKey {
        RateKey {
            target: TargetRef::namespaced("Deployment", "shop", "checkout"),
            action_type: action_type.to_string(),
        }
    }

    fn limit(max_actions: u32) -> RateLimitConfig {
        RateLimitConfig {
            window_secs: 60,
            max_actions,
        }
    }

    #[test]
    fn admits_n_then_limits_with_positive_backoff() {
        let limiter = RateLimiter::new();
        let start = Instant::now();
        let limit = limit(3);

        for _ in 0..3 {
            assert_eq!(
                limiter.try_acquire(&key("restart"), &limit, start),
                RateDecision::Admitted
            );
        }

        let later = start + Duration::from_secs(20);
        match limiter.try_acquire(&key("restart"), &limit, later) {
            RateDecision::Limited { retry_after } => {
                assert_eq!(retry_after, Duration::from_secs(40));
            }
            other => panic!("expected limit, got {other:?}"),
        }
    }

    #[test]
    fn window_rolls_over() {
        let limiter = RateLimiter::new();
        let start = Instant::now();
        let limit = limit(1);

        assert_eq!(
            limiter.try_acquire(&key("restart"), &limit, start),
            RateDecision::Admitted
        );
        assert!(matches!(
            limiter.try_acquire(&key("restart"), &limit, start),
            RateDecision::Limited { .. }
        ));
        let next_window = start + Duration::from_secs(60);
        assert_eq!(
            limiter.try_acquire(&key("restart"), &limit, next_window),
            RateDecision::Admitted
        );
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new();
        let now = Instant::now();
        let limit = limit(1);

        assert_eq!(
            limiter.try_acquire(&key("restart"), &limit, now),
            RateDecision::Admitted
        );
        assert_eq!(
            limiter.try_acquire(&key("scale"), &limit, now),
            RateDecision::Admitted
        );
    }

    #[test]
    fn peek_does_not_consume_and_release_refunds() {
        let limiter = RateLimiter::new();
        let now = Instant::now();
        let limit = limit(1);

        assert_eq!(limiter.peek(&key("restart"), &limit, now), RateDecision::Admitted);
        assert_eq!(
            limiter.try_acquire(&key("restart"), &limit, now),
            RateDecision::Admitted
        );
        assert!(matches!(
            limiter.peek(&key("restart"), &limit, now),
            RateDecision::Limited { .. }
        ));

        limiter.release(&key("restart"), &limit, now);
        assert_eq!(
            limiter.try_acquire(&key("restart"), &limit, now),
            RateDecision::Admitted
        );
    }

    #[test]
    fn concurrent_acquires_never_over_admit() {
        let limiter = std::sync::Arc::new(RateLimiter::new());
        let now = Instant::now();
        let limit = limit(5);

        let admitted: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..16)
                .map(|_| {
                    let limiter = limiter.clone();
                    s.spawn(move || limiter.try_acquire(&key("restart"), &limit, now))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join())
                .filter(|r| matches!(r, Ok(RateDecision::Admitted)))
                .count()
        });

        assert_eq!(admitted, 5);
    }
}
