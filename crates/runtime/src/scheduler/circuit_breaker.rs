//! Per-target circuit breaker
//!
//! Tracks consecutive failures of each scheduling target and fast-fails work
//! for a target whose circuit is open. Implements the standard
//! Closed → Open → Half-Open state machine.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Circuit breaker state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation. Work flows through.
    Closed,
    /// Failures reached the threshold. Work is rejected until the cooldown ends.
    Open {
        /// When the circuit was opened.
        opened_at: Instant,
    },
    /// Recovery probing. A limited number of calls are allowed through.
    HalfOpen,
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before probing.
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,
    /// Max calls allowed through while HalfOpen.
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
            half_open_max_calls: 1,
        }
    }
}

/// A circuit breaker for a single target.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    failure_count: u32,
    half_open_calls: u32,
}

/// Error returned when the circuit is open.
#[derive(Debug, Clone, thiserror::Error)]
#[error("circuit open for '{target}': {consecutive_failures} consecutive failures, recovery in {recovery_remaining:?}")]
pub struct CircuitOpenError {
    pub target: String,
    pub consecutive_failures: u32,
    pub recovery_remaining: Duration,
}

impl CircuitBreaker {
    /// Create a new circuit breaker in the Closed state.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            half_open_calls: 0,
        }
    }

    /// Check if a call should be allowed through.
    pub fn check(&mut self, target: &str) -> Result<(), CircuitOpenError> {
        match &self.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open { opened_at } => {
                let elapsed = opened_at.elapsed();
                if elapsed >= self.config.cooldown {
                    self.state = CircuitState::HalfOpen;
                    // this check is the first probe
                    self.half_open_calls = 1;
                    tracing::info!("Circuit breaker for '{}' transitioning to HalfOpen", target);
                    Ok(())
                } else {
                    Err(CircuitOpenError {
                        target: target.to_string(),
                        consecutive_failures: self.failure_count,
                        recovery_remaining: self.config.cooldown - elapsed,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if self.half_open_calls < self.config.half_open_max_calls {
                    self.half_open_calls += 1;
                    Ok(())
                } else {
                    Err(CircuitOpenError {
                        target: target.to_string(),
                        consecutive_failures: self.failure_count,
                        recovery_remaining: Duration::ZERO,
                    })
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&mut self, target: &str) {
        if self.state != CircuitState::Closed {
            tracing::info!("Circuit breaker for '{}' recovered, now Closed", target);
        }
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.half_open_calls = 0;
    }

    /// Record a failed call.
    pub fn record_failure(&mut self, target: &str) {
        self.failure_count += 1;

        match self.state {
            CircuitState::Closed => {
                if self.failure_count >= self.config.failure_threshold {
                    self.state = CircuitState::Open {
                        opened_at: Instant::now(),
                    };
                    tracing::warn!(
                        "Circuit breaker for '{}' tripped OPEN after {} failures",
                        target,
                        self.failure_count
                    );
                }
            }
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open {
                    opened_at: Instant::now(),
                };
                self.half_open_calls = 0;
                tracing::warn!("Circuit breaker for '{}' recovery failed, back to OPEN", target);
            }
            CircuitState::Open { .. } => {}
        }
    }

    /// Return a half-open probe slot whose call ended without a verdict.
    pub fn release(&mut self, target: &str) {
        if self.state == CircuitState::HalfOpen && self.half_open_calls > 0 {
            self.half_open_calls -= 1;
            tracing::debug!("Circuit breaker for '{}' probe released", target);
        }
    }

    /// Replace the configuration, keeping the current state.
    pub fn reconfigure(&mut self, config: CircuitBreakerConfig) {
        self.config = config;
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get the current state.
    pub fn state(&self) -> &CircuitState {
        &self.state
    }

    /// Get the consecutive failure count.
    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }
}

/// Registry of circuit breakers for all targets.
///
/// Every read-modify-write happens under one write lock, so counters are
/// updated by a single writer at a time.
pub struct CircuitBreakerRegistry {
    breakers: Arc<RwLock<HashMap<String, CircuitBreaker>>>,
    default_config: CircuitBreakerConfig,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreakerRegistry {
    /// Create a new registry with a default configuration for new breakers.
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: Arc::new(RwLock::new(HashMap::new())),
            default_config,
        }
    }

    pub fn default_config(&self) -> &CircuitBreakerConfig {
        &self.default_config
    }

    /// Set the configuration for one target, creating its breaker if needed.
    pub async fn configure(&self, target: &str, config: CircuitBreakerConfig) {
        let mut breakers = self.breakers.write().await;
        match breakers.get_mut(target) {
            Some(breaker) if *breaker.config() != config => breaker.reconfigure(config),
            Some(_) => {}
            None => {
                breakers.insert(target.to_string(), CircuitBreaker::new(config));
            }
        }
    }

    /// Check if a call to `target` should be allowed.
    pub async fn check(&self, target: &str) -> Result<(), CircuitOpenError> {
        let mut breakers = self.breakers.write().await;
        let breaker = breakers
            .entry(target.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.default_config.clone()));
        breaker.check(target)
    }

    /// Record a successful call to `target`.
    pub async fn record_success(&self, target: &str) {
        let mut breakers = self.breakers.write().await;
        if let Some(breaker) = breakers.get_mut(target) {
            breaker.record_success(target);
        }
    }

    /// Record a failed call to `target`.
    pub async fn record_failure(&self, target: &str) {
        let mut breakers = self.breakers.write().await;
        let breaker = breakers
            .entry(target.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.default_config.clone()));
        breaker.record_failure(target);
    }

    /// Release a call to `target` that neither succeeded nor failed against it.
    pub async fn release(&self, target: &str) {
        let mut breakers = self.breakers.write().await;
        if let Some(breaker) = breakers.get_mut(target) {
            breaker.release(target);
        }
    }

    /// Get the state of a specific breaker.
    pub async fn get_state(&self, target: &str) -> Option<CircuitState> {
        let breakers = self.breakers.read().await;
        breakers.get(target).map(|b| b.state().clone())
    }

    /// Get the consecutive failure count of a specific breaker.
    pub async fn failure_count(&self, target: &str) -> Option<u32> {
        let breakers = self.breakers.read().await;
        breakers.get(target).map(|b| b.failure_count())
    }
}
