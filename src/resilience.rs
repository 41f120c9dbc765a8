// Copyright (C) 2025 Matías Salinas (support@fenden.com)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::time::{Duration, Instant};
use tracing::info;

/// Weight of a new latency observation in the moving average.
pub const LATENCY_EMA_ALPHA: f64 = 0.3;

/// Starting EMA before any observation exists (seconds).
pub const LATENCY_EMA_INITIAL: f64 = 1.0;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, requests allowed.
    Closed,
    /// Failing, requests blocked until the cooldown elapses.
    Open,
    /// Testing recovery, a single probe allowed.
    HalfOpen,
}

/// Tracks consecutive failures and temporarily stops sending requests to a
/// failing upstream. After the cooldown, a single probe request is admitted;
/// its outcome decides whether the circuit closes again or re-opens.
///
/// Fields are public so tests can rewind `opened_at` instead of sleeping.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    pub failure_threshold: u32,
    pub cooldown: Duration,

    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<Instant>,
    /// A half-open probe has been admitted and its outcome is still pending.
    pub probe_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold,
            cooldown,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_in_flight: false,
        }
    }

    /// Record a successful request. Resets the failure count and closes the
    /// circuit regardless of its previous state.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.state = CircuitState::Closed;
        self.opened_at = None;
        self.probe_in_flight = false;
    }

    /// Record a failed request. Opens the circuit once the threshold is
    /// reached; a failed half-open probe re-opens with a fresh cooldown.
    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        self.probe_in_flight = false;
        if self.consecutive_failures >= self.failure_threshold {
            self.state = CircuitState::Open;
            self.opened_at = Some(Instant::now());
        }
    }

    /// Check if a request should be allowed through the circuit.
    /// While half-open, exactly one probe is admitted until its outcome
    /// arrives via `record_success` / `record_failure`.
    pub fn should_allow_request(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let Some(opened_at) = self.opened_at else {
                    return true;
                };
                if opened_at.elapsed() >= self.cooldown {
                    self.state = CircuitState::HalfOpen;
                    self.probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if self.probe_in_flight {
                    false
                } else {
                    self.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Returns an admission obtained from `should_allow_request` without an
    /// attempt having happened (the rate limiter denied the slot).
    pub fn rollback_admission(&mut self) {
        if self.state == CircuitState::HalfOpen {
            self.probe_in_flight = false;
        }
    }
}

/// Token bucket rate limiter with continuous refill and burst capacity.
///
/// Fields are public so tests can rewind `last_update` instead of sleeping.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    pub tokens_per_second: f64,
    pub bucket_size: f64,

    pub tokens: f64,
    pub last_update: Instant,
}

impl TokenBucket {
    /// Bucket capacity defaults to twice the refill rate, allowing short
    /// bursts above the sustained limit.
    pub fn new(tokens_per_second: f64) -> Self {
        let bucket_size = tokens_per_second * 2.0;
        Self {
            tokens_per_second,
            bucket_size,
            tokens: bucket_size,
            last_update: Instant::now(),
        }
    }

    /// Refill tokens based on elapsed time.
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.tokens_per_second).min(self.bucket_size);
        self.last_update = now;
    }

    /// Try to acquire tokens. Returns true if successful.
    pub fn try_acquire(&mut self, tokens: f64) -> bool {
        self.refill();
        if self.tokens >= tokens {
            self.tokens -= tokens;
            true
        } else {
            false
        }
    }

    /// Seconds until the requested tokens will be available.
    pub fn time_until_available(&mut self, tokens: f64) -> f64 {
        self.refill();
        if self.tokens >= tokens {
            0.0
        } else {
            (tokens - self.tokens) / self.tokens_per_second
        }
    }
}

/// Health record for a single mirror: circuit breaker, optional rate
/// limiter, and a latency moving average.
#[derive(Debug, Clone)]
pub struct MirrorHealth {
    pub circuit: CircuitBreaker,
    pub rate_limiter: Option<TokenBucket>,

    /// Exponential moving average of successful request latency (seconds).
    pub latency_ema: f64,
}

impl MirrorHealth {
    pub fn new(circuit: CircuitBreaker, rate_limiter: Option<TokenBucket>) -> Self {
        Self {
            circuit,
            rate_limiter,
            latency_ema: LATENCY_EMA_INITIAL,
        }
    }

    /// Breaker first, then the bucket. A bucket denial must not consume the
    /// breaker's half-open probe: the attempt simply does not happen.
    pub fn is_available(&mut self) -> bool {
        if !self.circuit.should_allow_request() {
            return false;
        }
        if let Some(bucket) = &mut self.rate_limiter {
            if !bucket.try_acquire(1.0) {
                self.circuit.rollback_admission();
                return false;
            }
        }
        true
    }

    /// Record a successful request with its latency.
    pub fn record_success(&mut self, latency_seconds: f64) {
        let was_open = self.circuit.state != CircuitState::Closed;
        self.circuit.record_success();
        if was_open {
            info!("✅ Circuit closed again after successful probe");
        }
        self.latency_ema =
            LATENCY_EMA_ALPHA * latency_seconds + (1.0 - LATENCY_EMA_ALPHA) * self.latency_ema;
    }

    /// Record a failed request. The EMA is left untouched so timeout tails
    /// do not contaminate the latency signal.
    pub fn record_failure(&mut self) {
        self.circuit.record_failure();
    }
}
