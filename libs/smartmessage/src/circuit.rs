//! Circuit breakers for publish, subscribe, and message processing
//!
//! A circuit passes operations while CLOSED, rejects them while OPEN, and
//! allows a single trial while HALF_OPEN. Opening requires `threshold`
//! consecutive failures inside the rolling window; a success while CLOSED
//! ends the streak. After `cooldown` the next caller is admitted as the
//! trial. Each guarded component owns independent circuits and stats.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use smartmessage_config::{CircuitSettings, FallbackPolicy};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Point-in-time circuit statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStats {
    pub state: CircuitState,
    pub failures: u64,
    pub successes: u64,
    pub last_transition_at: Option<DateTime<Utc>>,
}

struct CircuitInner {
    state: CircuitState,
    recent_failures: VecDeque<Instant>,
    failures: u64,
    successes: u64,
    opened_at: Option<Instant>,
    last_transition_at: Option<DateTime<Utc>>,
}

/// Failure-rate state machine guarding one operation.
pub struct CircuitBreaker {
    name: String,
    settings: CircuitSettings,
    inner: Mutex<CircuitInner>,
}

impl CircuitBreaker {
    pub fn new(name: &str, settings: CircuitSettings) -> Self {
        Self {
            name: name.to_string(),
            settings,
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                recent_failures: VecDeque::new(),
                failures: 0,
                successes: 0,
                opened_at: None,
                last_transition_at: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fallback(&self) -> FallbackPolicy {
        self.settings.fallback
    }

    pub fn settings(&self) -> &CircuitSettings {
        &self.settings
    }

    /// Whether the guarded operation may proceed right now.
    ///
    /// An OPEN circuit whose cooldown has elapsed transitions to HALF_OPEN
    /// and admits the caller as the trial.
    pub fn allow(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let cooldown = Duration::from_millis(self.settings.cooldown_ms);
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed() >= cooldown)
                    .unwrap_or(true);
                if elapsed {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful operation.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.successes += 1;
        match inner.state {
            // Only an unbroken run of failures counts toward the
            // threshold; a success ends the streak.
            CircuitState::Closed => {
                inner.recent_failures.clear();
            }
            CircuitState::HalfOpen => {
                inner.recent_failures.clear();
                inner.opened_at = None;
                self.transition(&mut inner, CircuitState::Closed);
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed operation, opening the circuit once the streak
    /// reaches the threshold.
    pub fn record_failure(&self) {
        let now = Instant::now();
        let window = Duration::from_millis(self.settings.window_ms);

        let mut inner = self.lock();
        inner.failures += 1;
        inner.recent_failures.push_back(now);
        while let Some(oldest) = inner.recent_failures.front() {
            if now.duration_since(*oldest) > window {
                inner.recent_failures.pop_front();
            } else {
                break;
            }
        }

        match inner.state {
            CircuitState::Closed => {
                if inner.recent_failures.len() >= self.settings.threshold as usize {
                    inner.opened_at = Some(now);
                    self.transition(&mut inner, CircuitState::Open);
                    warn!(circuit = %self.name, "circuit opened");
                }
            }
            CircuitState::HalfOpen => {
                inner.opened_at = Some(now);
                self.transition(&mut inner, CircuitState::Open);
                warn!(circuit = %self.name, "half-open trial failed, circuit re-opened");
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn stats(&self) -> CircuitStats {
        let inner = self.lock();
        CircuitStats {
            state: inner.state,
            failures: inner.failures,
            successes: inner.successes,
            last_transition_at: inner.last_transition_at,
        }
    }

    /// Exponential backoff delay for the given retry attempt (0-based),
    /// bounded by the configured maximum.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let retry = &self.settings.retry;
        let factor = retry.backoff_multiplier.max(1.0).powi(attempt as i32);
        let millis = (retry.initial_delay_ms as f64 * factor) as u64;
        Duration::from_millis(millis.min(retry.max_delay_ms))
    }

    fn transition(&self, inner: &mut CircuitInner, next: CircuitState) {
        inner.state = next;
        inner.last_transition_at = Some(Utc::now());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CircuitInner> {
        self.inner.lock().expect("circuit mutex poisoned")
    }
}
