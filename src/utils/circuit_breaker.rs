//! Per-service circuit breaker
//!
//! A breaker tracks call outcomes for one upstream service (normally a host
//! name) and rejects calls while the service is considered broken:
//!
//! - `Closed`: calls pass; `failure_threshold` consecutive failures open the circuit.
//! - `Open`: calls are rejected until `reset_timeout` has elapsed, then the next
//!   call is admitted as a half-open trial.
//! - `HalfOpen`: up to `half_open_max` trials are admitted; any failure re-opens,
//!   `half_open_max` successes close.
//!
//! Thresholds are not stored on the breaker. They are read from a
//! [`ProfileSource`] on every evaluation, so configuration updates apply to
//! existing breakers immediately. Evaluation is a short synchronous critical
//! section and never awaits.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerProfile;
use crate::observability::{KeyValue, metrics};
use crate::utils::status_code_matcher::counts_as_success;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitBreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitBreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Errors returned by [`CircuitBreaker::execute`]
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    #[error("Circuit breaker is open for {service}")]
    CircuitOpen { service: String },
    #[error("Operation timed out for {service} after {timeout:?}")]
    Timeout { service: String, timeout: Duration },
    #[error("{0}")]
    Operation(E),
}

/// Rejection returned by [`CircuitBreaker::try_acquire`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Circuit breaker is open for {service}")]
pub struct CircuitOpen {
    pub service: String,
}

impl<E> From<CircuitOpen> for CircuitBreakerError<E> {
    fn from(open: CircuitOpen) -> Self {
        Self::CircuitOpen {
            service: open.service,
        }
    }
}

/// Outcome of a guarded call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    /// Completed with an HTTP status; classified against the acceptable codes
    Status(u16),
    Failure(String),
}

impl CallOutcome {
    fn is_success(&self, acceptable_codes: &[String]) -> bool {
        match self {
            Self::Success => true,
            Self::Status(status) => counts_as_success(*status, acceptable_codes),
            Self::Failure(_) => false,
        }
    }
}

/// Errors that may carry an HTTP status, so an acceptable status (a 404 for
/// one missing channel) is not counted against the whole service.
pub trait OutcomeError {
    fn status_code(&self) -> Option<u16> {
        None
    }
}

/// Supplies the effective profile for a service at evaluation time
pub trait ProfileSource: Send + Sync + fmt::Debug {
    fn profile_for(&self, service: &str) -> Arc<CircuitBreakerProfile>;
}

/// A profile that never changes; used for standalone breakers
#[derive(Debug, Clone)]
pub struct FixedProfile(pub Arc<CircuitBreakerProfile>);

impl ProfileSource for FixedProfile {
    fn profile_for(&self, _service: &str) -> Arc<CircuitBreakerProfile> {
        self.0.clone()
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerStats {
    pub service_name: String,
    pub state: CircuitBreakerState,
    pub consecutive_failures: u32,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Calls rejected without being attempted
    pub rejected_requests: u64,
    pub failure_rate: f64,
    pub half_open_trials_in_flight: u32,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_state_change: DateTime<Utc>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitBreakerState,
    consecutive_failures: u32,
    half_open_admitted: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
    /// Bumped on every transition; outcomes from an older generation only update totals
    generation: u64,
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    rejected_requests: u64,
    last_failure: Option<DateTime<Utc>>,
    last_state_change: DateTime<Utc>,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            state: CircuitBreakerState::Closed,
            consecutive_failures: 0,
            half_open_admitted: 0,
            half_open_successes: 0,
            opened_at: None,
            generation: 0,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            rejected_requests: 0,
            last_failure: None,
            last_state_change: Utc::now(),
        }
    }
}

impl BreakerState {
    fn transition(&mut self, service: &str, to: CircuitBreakerState) {
        let from = self.state;
        self.state = to;
        self.generation += 1;
        self.half_open_admitted = 0;
        self.half_open_successes = 0;
        self.last_state_change = Utc::now();
        match to {
            CircuitBreakerState::Open => self.opened_at = Some(Instant::now()),
            CircuitBreakerState::Closed => {
                self.opened_at = None;
                self.consecutive_failures = 0;
            }
            CircuitBreakerState::HalfOpen => {}
        }
        metrics().breaker_transitions.add(
            1,
            &[
                KeyValue::new("service", service.to_string()),
                KeyValue::new("to", to.to_string()),
            ],
        );
        match to {
            CircuitBreakerState::Open => {
                warn!(service = %service, from = %from, failures = self.consecutive_failures, "Circuit breaker opened")
            }
            _ => info!(service = %service, from = %from, to = %to, "Circuit breaker state change"),
        }
    }
}

/// Failure-tracking state machine for one named service
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    profiles: Arc<dyn ProfileSource>,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, profiles: Arc<dyn ProfileSource>) -> Self {
        Self {
            name: name.into(),
            profiles,
            state: Mutex::new(BreakerState::default()),
        }
    }

    /// Breaker with a fixed profile, independent of any manager
    pub fn with_profile(name: impl Into<String>, profile: CircuitBreakerProfile) -> Self {
        Self::new(name, Arc::new(FixedProfile(Arc::new(profile))))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Profile in effect right now
    pub fn profile(&self) -> Arc<CircuitBreakerProfile> {
        self.profiles.profile_for(&self.name)
    }

    pub fn state(&self) -> CircuitBreakerState {
        self.state.lock().state
    }

    /// Admit or reject a call. The returned permit must be completed with
    /// [`CallPermit::record`]; dropping it unrecorded releases a half-open trial slot.
    pub fn try_acquire(self: &Arc<Self>) -> Result<CallPermit, CircuitOpen> {
        let profile = self.profile();
        let mut state = self.state.lock();

        let trial = match state.state {
            CircuitBreakerState::Closed => false,
            CircuitBreakerState::Open => {
                let elapsed = state
                    .opened_at
                    .map(|opened| opened.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed < profile.reset_timeout {
                    return Err(self.reject(&mut state));
                }
                state.transition(&self.name, CircuitBreakerState::HalfOpen);
                state.half_open_admitted = 1;
                true
            }
            CircuitBreakerState::HalfOpen => {
                if state.half_open_admitted >= profile.half_open_max {
                    return Err(self.reject(&mut state));
                }
                state.half_open_admitted += 1;
                true
            }
        };

        Ok(CallPermit {
            breaker: Arc::clone(self),
            generation: state.generation,
            trial,
            completed: false,
        })
    }

    /// Reject while open and inside the reset timeout; otherwise allow without
    /// taking a half-open trial slot. For auxiliary calls (manifest fetches)
    /// whose outcome is reported through [`record_outcome`](Self::record_outcome).
    pub fn check_not_open(&self) -> Result<(), CircuitOpen> {
        let profile = self.profile();
        let mut state = self.state.lock();
        let cooling_down = state.state == CircuitBreakerState::Open
            && state
                .opened_at
                .is_some_and(|opened| opened.elapsed() < profile.reset_timeout);
        if cooling_down {
            return Err(self.reject(&mut state));
        }
        Ok(())
    }

    /// Whether a call would currently be admitted (does not consume a trial slot)
    pub fn is_available(&self) -> bool {
        let profile = self.profile();
        let state = self.state.lock();
        match state.state {
            CircuitBreakerState::Closed => true,
            CircuitBreakerState::Open => state
                .opened_at
                .is_none_or(|opened| opened.elapsed() >= profile.reset_timeout),
            CircuitBreakerState::HalfOpen => state.half_open_admitted < profile.half_open_max,
        }
    }

    /// Record an outcome observed outside a permit, such as an upstream
    /// connection failing after it was established.
    pub fn record_outcome(&self, outcome: CallOutcome) {
        let generation = self.state.lock().generation;
        self.apply(outcome, generation, false);
    }

    /// Run `operation` under the breaker with the profile's operation timeout
    pub async fn execute<T, E, F, Fut>(self: &Arc<Self>, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: OutcomeError,
    {
        let permit = self.try_acquire()?;
        let timeout = self.profile().operation_timeout;

        match tokio::time::timeout(timeout, operation()).await {
            Ok(Ok(value)) => {
                permit.record(CallOutcome::Success);
                Ok(value)
            }
            Ok(Err(error)) => {
                let outcome = match error.status_code() {
                    Some(status) => CallOutcome::Status(status),
                    None => CallOutcome::Failure("operation failed".to_string()),
                };
                permit.record(outcome);
                Err(CircuitBreakerError::Operation(error))
            }
            Err(_) => {
                permit.record(CallOutcome::Failure("timeout".to_string()));
                Err(CircuitBreakerError::Timeout {
                    service: self.name.clone(),
                    timeout,
                })
            }
        }
    }

    /// Administrative reset: force closed, clear consecutive and trial counters.
    /// Lifetime totals are kept.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        if state.state != CircuitBreakerState::Closed {
            state.transition(&self.name, CircuitBreakerState::Closed);
        } else {
            state.consecutive_failures = 0;
        }
        info!(service = %self.name, "Circuit breaker reset");
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let state = self.state.lock();
        let failure_rate = if state.total_requests > 0 {
            state.failed_requests as f64 / state.total_requests as f64
        } else {
            0.0
        };
        CircuitBreakerStats {
            service_name: self.name.clone(),
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            total_requests: state.total_requests,
            successful_requests: state.successful_requests,
            failed_requests: state.failed_requests,
            rejected_requests: state.rejected_requests,
            failure_rate,
            half_open_trials_in_flight: state
                .half_open_admitted
                .saturating_sub(state.half_open_successes),
            last_failure: state.last_failure,
            last_state_change: state.last_state_change,
        }
    }

    fn reject(&self, state: &mut BreakerState) -> CircuitOpen {
        state.rejected_requests += 1;
        metrics()
            .breaker_rejections
            .add(1, &[KeyValue::new("service", self.name.clone())]);
        debug!(service = %self.name, state = %state.state, "Circuit breaker rejected call");
        CircuitOpen {
            service: self.name.clone(),
        }
    }

    fn apply(&self, outcome: CallOutcome, generation: u64, trial: bool) {
        let profile = self.profile();
        let success = outcome.is_success(&profile.acceptable_status_codes);
        let mut state = self.state.lock();

        state.total_requests += 1;
        if success {
            state.successful_requests += 1;
        } else {
            state.failed_requests += 1;
            state.last_failure = Some(Utc::now());
        }

        if generation != state.generation {
            debug!(service = %self.name, ?outcome, "Ignoring outcome from a previous breaker state");
            return;
        }

        match state.state {
            CircuitBreakerState::Closed => {
                if success {
                    state.consecutive_failures = 0;
                } else {
                    state.consecutive_failures += 1;
                    debug!(
                        service = %self.name,
                        failures = state.consecutive_failures,
                        threshold = profile.failure_threshold,
                        ?outcome,
                        "Circuit breaker recorded failure"
                    );
                    if state.consecutive_failures >= profile.failure_threshold {
                        state.transition(&self.name, CircuitBreakerState::Open);
                    }
                }
            }
            CircuitBreakerState::HalfOpen => {
                if !success {
                    state.consecutive_failures += 1;
                    state.transition(&self.name, CircuitBreakerState::Open);
                } else if trial {
                    state.half_open_successes += 1;
                    if state.half_open_successes >= profile.half_open_max {
                        state.transition(&self.name, CircuitBreakerState::Closed);
                    }
                }
            }
            CircuitBreakerState::Open => {}
        }
    }

    fn release_trial(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.generation == generation
            && state.state == CircuitBreakerState::HalfOpen
            && state.half_open_admitted > 0
        {
            state.half_open_admitted -= 1;
        }
    }
}

/// Admission ticket for one guarded call
#[derive(Debug)]
pub struct CallPermit {
    breaker: Arc<CircuitBreaker>,
    generation: u64,
    trial: bool,
    completed: bool,
}

impl CallPermit {
    /// Whether this call is a half-open trial
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn service(&self) -> &str {
        self.breaker.name()
    }

    pub fn record(mut self, outcome: CallOutcome) {
        self.completed = true;
        self.breaker.apply(outcome, self.generation, self.trial);
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.completed && self.trial {
            self.breaker.release_trial(self.generation);
        }
    }
}
