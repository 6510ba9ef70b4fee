//! Admission control for mutating file operations.
//!
//! Each `(user, operation)` pair has a fixed window budget. A call spends
//! one point; once the window's points are spent further calls are denied
//! until the window rolls over.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use thiserror::Error;

/// Budget for one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limit {
    pub points: u32,
    pub window: Duration,
}

/// The caller is over budget.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("rate limit exceeded for {operation}, retry in {retry_after:?}")]
pub struct AdmissionDenied {
    pub operation: String,
    pub retry_after: Duration,
}

/// Decides whether a user may perform an operation now.
pub trait AdmissionControl: Send + Sync {
    fn check(&self, user_id: &str, operation: &str) -> Result<(), AdmissionDenied>;
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    used: u32,
}

/// Fixed-window rate limiter keyed by user and operation.
///
/// Operations without a configured limit are always admitted.
#[derive(Debug, Default)]
pub struct RateLimiter {
    limits: HashMap<String, Limit>,
    windows: DashMap<(String, String), Window>,
}

impl RateLimiter {
    pub fn new(limits: HashMap<String, Limit>) -> Self {
        Self {
            limits,
            windows: DashMap::new(),
        }
    }

    /// Adds or replaces the limit for `operation`.
    pub fn with_limit(mut self, operation: impl Into<String>, limit: Limit) -> Self {
        self.limits.insert(operation.into(), limit);
        self
    }

    pub fn limit(&self, operation: &str) -> Option<Limit> {
        self.limits.get(operation).copied()
    }

    /// Drops windows that have fully elapsed.
    pub fn prune(&self) -> usize {
        let before = self.windows.len();
        let now = Instant::now();
        self.windows.retain(|(_, operation), window| {
            self.limits
                .get(operation)
                .is_some_and(|limit| now.duration_since(window.started) < limit.window)
        });
        before - self.windows.len()
    }

    fn check_at(&self, user_id: &str, operation: &str, now: Instant) -> Result<(), AdmissionDenied> {
        let Some(limit) = self.limits.get(operation) else {
            return Ok(());
        };

        let mut window = self
            .windows
            .entry((user_id.to_string(), operation.to_string()))
            .or_insert(Window { started: now, used: 0 });

        let elapsed = now.saturating_duration_since(window.started);
        if elapsed >= limit.window {
            *window = Window { started: now, used: 0 };
        }

        if window.used >= limit.points {
            let retry_after = limit.window.saturating_sub(now.saturating_duration_since(window.started));
            tracing::debug!(user_id = %user_id, operation = %operation, "Admission denied");
            return Err(AdmissionDenied {
                operation: operation.to_string(),
                retry_after,
            });
        }

        window.used += 1;
        Ok(())
    }
}

impl AdmissionControl for RateLimiter {
    fn check(&self, user_id: &str, operation: &str) -> Result<(), AdmissionDenied> {
        self.check_at(user_id, operation, Instant::now())
    }
}
