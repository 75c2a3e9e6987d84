//! Retry-with-backoff and a per-collaborator circuit breaker.
//!
//! Every call into an external collaborator goes through both: [`retry`]
//! drives the attempts, and each attempt passes through
//! [`CircuitBreaker::call`]. A breaker rejection
//! ([`PipelineError::CircuitOpen`]) is never retried; it surfaces
//! immediately so the controller can move on to other work.
//!
//! # Breaker states
//!
//! ```text
//!   CLOSED ──(failure_threshold failures within failure_window)──▶ OPEN
//!   OPEN ────(cooldown elapsed)──────────────────────────────────▶ HALF_OPEN
//!   HALF_OPEN ─(success_threshold consecutive successes)─────────▶ CLOSED
//!   HALF_OPEN ─(any failure)─────────────────────────────────────▶ OPEN
//! ```
//!
//! While HALF_OPEN at most `half_open_max_calls` trial calls run at once;
//! extra callers are rejected as if the circuit were open.

use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::config::ResilienceConfig;
use crate::error::{PipelineError, Result};

// ═══════════════════════════════════════════════════════════════════════
// Retry
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ResilienceConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            backoff_factor: config.backoff_factor,
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Delay slept after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ResilienceConfig::default())
    }
}

/// Run `op` until it succeeds or `policy.max_attempts` is exhausted.
///
/// `op` receives the 1-based attempt number. Only collaborator failures are
/// retried; a breaker rejection, a cancellation or a store error is
/// returned as is. The final error reports the number of attempts made.
pub async fn retry<F, Fut, T>(name: &str, policy: &RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(collaborator = name, attempt, "call succeeded after retry");
                }
                return Ok(value);
            }
            Err(PipelineError::Collaborator { message, .. }) => {
                if attempt >= policy.max_attempts {
                    tracing::error!(
                        collaborator = name,
                        attempts = attempt,
                        error = %message,
                        "all attempts failed"
                    );
                    return Err(PipelineError::Collaborator {
                        name: name.to_string(),
                        attempts: attempt,
                        message,
                    });
                }
                let delay = policy.delay_after(attempt);
                tracing::warn!(
                    collaborator = name,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %message,
                    "attempt failed, retrying after backoff"
                );
                tokio::time::sleep(delay).await;
            }
            Err(other) => return Err(other),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Circuit breaker
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub failure_window: Duration,
    pub cooldown: Duration,
    pub half_open_max_calls: u32,
    pub success_threshold: u32,
}

impl BreakerConfig {
    pub fn from_config(config: &ResilienceConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            failure_window: Duration::from_secs(config.failure_window_secs),
            cooldown: Duration::from_secs(config.cooldown_secs),
            half_open_max_calls: config.half_open_max_calls.max(1),
            success_threshold: config.success_threshold.max(1),
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self::from_config(&ResilienceConfig::default())
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    probes_in_flight: u32,
    consecutive_successes: u32,
}

impl BreakerInner {
    fn closed() -> Self {
        Self {
            state: BreakerState::Closed,
            failures: VecDeque::new(),
            opened_at: None,
            probes_in_flight: 0,
            consecutive_successes: 0,
        }
    }

    /// Apply the time-based OPEN → HALF_OPEN transition.
    fn refresh(&mut self, config: &BreakerConfig, name: &str, now: Instant) {
        if self.state == BreakerState::Open {
            let cooled = self
                .opened_at
                .map(|at| now.duration_since(at) >= config.cooldown)
                .unwrap_or(true);
            if cooled {
                tracing::info!(circuit = name, "circuit half-open, allowing trial calls");
                self.state = BreakerState::HalfOpen;
                self.probes_in_flight = 0;
                self.consecutive_successes = 0;
            }
        }
    }

    fn trip(&mut self, now: Instant) {
        self.state = BreakerState::Open;
        self.opened_at = Some(now);
        self.failures.clear();
        self.probes_in_flight = 0;
        self.consecutive_successes = 0;
    }
}

/// Guards one collaborator. Shared by reference for the controller's lifetime.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

/// Admission ticket for one call. Dropping an unsettled probe frees its slot.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.probe && !self.settled {
            let mut inner = self.breaker.lock();
            inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner::closed()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BreakerState {
        let mut inner = self.lock();
        inner.refresh(&self.config, &self.name, Instant::now());
        inner.state
    }

    /// Force the breaker back to CLOSED and forget recorded failures.
    pub fn reset(&self) {
        *self.lock() = BreakerInner::closed();
        tracing::info!(circuit = %self.name, "circuit reset");
    }

    /// Run `op` if the breaker admits it.
    ///
    /// A rejection returns [`PipelineError::CircuitOpen`] without invoking
    /// `op`. A failure of `op` is recorded and returned as a single-attempt
    /// [`PipelineError::Collaborator`].
    pub async fn call<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut permit = self.acquire()?;
        let outcome = op().await;
        permit.settled = true;
        match outcome {
            Ok(value) => {
                self.on_success(permit.probe);
                Ok(value)
            }
            Err(e) => {
                self.on_failure(permit.probe);
                Err(PipelineError::Collaborator {
                    name: self.name.clone(),
                    attempts: 1,
                    message: format!("{:#}", e),
                })
            }
        }
    }

    fn acquire(&self) -> Result<Permit<'_>> {
        let mut inner = self.lock();
        inner.refresh(&self.config, &self.name, Instant::now());
        let state = inner.state;
        match state {
            BreakerState::Closed => Ok(Permit {
                breaker: self,
                probe: false,
                settled: false,
            }),
            BreakerState::HalfOpen if inner.probes_in_flight < self.config.half_open_max_calls => {
                inner.probes_in_flight += 1;
                Ok(Permit {
                    breaker: self,
                    probe: true,
                    settled: false,
                })
            }
            _ => Err(PipelineError::CircuitOpen(self.name.clone())),
        }
    }

    fn on_success(&self, probe: bool) {
        let mut inner = self.lock();
        if probe {
            inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
        }
        if inner.state == BreakerState::HalfOpen {
            inner.consecutive_successes += 1;
            if inner.consecutive_successes >= self.config.success_threshold {
                tracing::info!(circuit = %self.name, "circuit recovered, closed");
                *inner = BreakerInner::closed();
            }
        }
    }

    fn on_failure(&self, probe: bool) {
        let now = Instant::now();
        let mut inner = self.lock();
        if probe {
            inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
        }
        let state = inner.state;
        match state {
            BreakerState::HalfOpen => {
                tracing::warn!(circuit = %self.name, "trial call failed, circuit reopened");
                inner.trip(now);
            }
            BreakerState::Closed => {
                let window = self.config.failure_window;
                inner.failures.push_back(now);
                while let Some(&oldest) = inner.failures.front() {
                    if now.duration_since(oldest) > window {
                        inner.failures.pop_front();
                    } else {
                        break;
                    }
                }
                if inner.failures.len() as u32 >= self.config.failure_threshold {
                    tracing::warn!(
                        circuit = %self.name,
                        failures = inner.failures.len(),
                        cooldown_ms = self.config.cooldown.as_millis() as u64,
                        "circuit opened"
                    );
                    inner.trip(now);
                }
            }
            // A call admitted before the trip finished late; nothing to add.
            BreakerState::Open => {}
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        // State stays consistent even if a holder panicked; keep serving.
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
