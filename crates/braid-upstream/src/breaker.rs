//! Per-upstream circuit breaker.
//!
//! Closed is the start state. Consecutive failures or a rolling-window
//! error rate open the circuit; after the open timeout a half-open probe
//! admits traffic until enough consecutive successes close it again.
//! While open, calls fail fast — the wrapped future is never built.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::error::{Result, UpstreamError};

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it.
    pub success_threshold: u32,
    /// How long the circuit stays open before a half-open probe.
    pub timeout: Duration,
    /// Rolling sample window for the error-rate trigger.
    pub window: Duration,
    /// Minimum samples in the window before the error rate applies.
    pub volume_threshold: usize,
    /// Error percentage (0–100) that opens the circuit.
    pub error_threshold_pct: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
            window: Duration::from_secs(60),
            volume_threshold: 10,
            error_threshold_pct: 50.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
    /// Rolling window of (timestamp, was_success) samples.
    window: VecDeque<(Instant, bool)>,
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: &str, config: BreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                opened_at: None,
                window: VecDeque::new(),
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap().state
    }

    /// Run `f` under the breaker. Open-state calls fail fast with
    /// `CircuitOpen`; non-trip-worthy errors (client 4xx) pass through
    /// without affecting the state machine.
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.admit()?;
        let result = f().await;
        match &result {
            Ok(_) => self.on_success(),
            Err(e) if e.is_trip_worthy() => self.on_failure(),
            Err(_) => {}
        }
        result
    }

    fn admit(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.config.timeout {
                    info!(upstream = self.name, "circuit half-open");
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_successes = 0;
                    Ok(())
                } else {
                    Err(UpstreamError::CircuitOpen {
                        upstream: self.name.clone(),
                    })
                }
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        self.record(&mut inner, true);
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures = inner.consecutive_failures.saturating_sub(1);
            }
            BreakerState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    info!(upstream = self.name, "circuit closed");
                    inner.state = BreakerState::Closed;
                    inner.consecutive_failures = 0;
                    inner.opened_at = None;
                }
            }
            BreakerState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        self.record(&mut inner, false);
        inner.consecutive_failures += 1;

        match inner.state {
            BreakerState::HalfOpen => {
                warn!(upstream = self.name, "half-open probe failed; circuit re-opened");
                inner.state = BreakerState::Open;
                inner.half_open_successes = 0;
                inner.opened_at = Some(Instant::now());
            }
            BreakerState::Closed => {
                let consecutive = inner.consecutive_failures >= self.config.failure_threshold;
                let rate = inner.window.len() >= self.config.volume_threshold
                    && self.error_rate(&inner) >= self.config.error_threshold_pct;
                if consecutive || rate {
                    warn!(
                        upstream = self.name,
                        consecutive_failures = inner.consecutive_failures,
                        error_rate = self.error_rate(&inner),
                        "circuit opened"
                    );
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            BreakerState::Open => {}
        }
    }

    fn record(&self, inner: &mut Inner, success: bool) {
        let cutoff = Instant::now() - self.config.window;
        while inner.window.front().is_some_and(|(t, _)| *t < cutoff) {
            inner.window.pop_front();
        }
        inner.window.push_back((Instant::now(), success));
    }

    fn error_rate(&self, inner: &Inner) -> f64 {
        if inner.window.is_empty() {
            return 0.0;
        }
        let failures = inner.window.iter().filter(|(_, ok)| !ok).count() as f64;
        failures / inner.window.len() as f64 * 100.0
    }
}

/// One breaker per named upstream, created on first use.
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config.clone())))
            .clone()
    }

    /// Snapshot of every breaker's state, for the health endpoint.
    pub fn states(&self) -> Vec<(String, BreakerState)> {
        self.breakers
            .iter()
            .map(|e| (e.key().clone(), e.value().state()))
            .collect()
    }
}
