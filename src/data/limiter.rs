//! Request pacing shared by every worker: a token bucket sized to the
//! provider plan, wrapped by a circuit breaker that isolates the process
//! from a misbehaving upstream.
//!
//! Both use `tokio::time::Instant` so tests can drive them with a paused
//! clock.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::FetchError;

// ---------------------------------------------------------------------------
// Token bucket
// ---------------------------------------------------------------------------

/// Cooperative token bucket. One token per outbound request; callers wait
/// (without spinning) until the refill makes a token available.
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: tokio::sync::Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Bucket allowing `rate_per_sec` sustained requests with an equal burst.
    pub fn new(rate_per_sec: f64) -> Self {
        let rate = rate_per_sec.max(0.1);
        Self {
            capacity: rate.max(1.0),
            refill_per_sec: rate,
            state: tokio::sync::Mutex::new(BucketState {
                tokens: rate.max(1.0),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, sleeping until the refill provides one.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut s = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(s.last_refill).as_secs_f64();
                s.tokens = (s.tokens + elapsed * self.refill_per_sec).min(self.capacity);
                s.last_refill = now;
                if s.tokens >= 1.0 {
                    s.tokens -= 1.0;
                    None
                } else {
                    Some(Duration::from_secs_f64(
                        (1.0 - s.tokens) / self.refill_per_sec,
                    ))
                }
            };
            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

/// Breaker states: closed counts consecutive hard failures inside a rolling
/// window; open rejects everything until the cooldown passes; half-open lets
/// exactly one probe through.
enum BreakerState {
    Closed {
        consecutive: u32,
        window_start: Option<Instant>,
    },
    Open {
        until: Instant,
    },
    HalfOpen {
        probe_in_flight: bool,
    },
}

pub struct CircuitBreaker {
    failure_threshold: u32,
    window: Duration,
    cooldown: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, window: Duration, cooldown: Duration) -> Self {
        Self {
            failure_threshold,
            window,
            cooldown,
            state: Mutex::new(BreakerState::Closed {
                consecutive: 0,
                window_start: None,
            }),
        }
    }

    /// Defaults from the provider plan: 5 hard failures in 30 s opens the
    /// circuit for 60 s.
    pub fn with_defaults() -> Self {
        Self::new(5, Duration::from_secs(30), Duration::from_secs(60))
    }

    /// Gate an outbound request. Transitions open → half-open once the
    /// cooldown has elapsed; in half-open only the first caller proceeds.
    pub fn check(&self) -> Result<(), FetchError> {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        match &mut *state {
            BreakerState::Closed { .. } => Ok(()),
            BreakerState::Open { until } => {
                if Instant::now() >= *until {
                    *state = BreakerState::HalfOpen {
                        probe_in_flight: true,
                    };
                    tracing::info!("circuit breaker half-open, admitting probe");
                    Ok(())
                } else {
                    Err(FetchError::CircuitOpen)
                }
            }
            BreakerState::HalfOpen { probe_in_flight } => {
                if *probe_in_flight {
                    Err(FetchError::CircuitOpen)
                } else {
                    *probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        if matches!(*state, BreakerState::HalfOpen { .. }) {
            tracing::info!("circuit breaker closed after successful probe");
        }
        *state = BreakerState::Closed {
            consecutive: 0,
            window_start: None,
        };
    }

    /// Record a hard failure. Callers are expected to consult
    /// `FetchError::counts_toward_breaker` first.
    pub fn record_failure(&self) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        let now = Instant::now();
        match &mut *state {
            BreakerState::Closed {
                consecutive,
                window_start,
            } => {
                let in_window = window_start.is_some_and(|w| now.duration_since(w) <= self.window);
                if in_window {
                    *consecutive += 1;
                } else {
                    *consecutive = 1;
                    *window_start = Some(now);
                }
                if *consecutive >= self.failure_threshold {
                    tracing::warn!(
                        failures = *consecutive,
                        cooldown_secs = self.cooldown.as_secs(),
                        "circuit breaker opened"
                    );
                    *state = BreakerState::Open {
                        until: now + self.cooldown,
                    };
                }
            }
            BreakerState::HalfOpen { .. } => {
                tracing::warn!("circuit breaker probe failed, reopening");
                *state = BreakerState::Open {
                    until: now + self.cooldown,
                };
            }
            BreakerState::Open { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn bucket_paces_requests_to_the_configured_rate() {
        let bucket = TokenBucket::new(1.0);
        let start = Instant::now();
        for _ in 0..10 {
            bucket.acquire().await;
        }
        // First token is free (full bucket); the remaining nine refill at
        // one per second.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(9), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_secs(11), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_burst_up_to_capacity_is_immediate() {
        let bucket = TokenBucket::new(5.0);
        let start = Instant::now();
        for _ in 0..5 {
            bucket.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[test]
    fn breaker_opens_after_threshold_consecutive_failures() {
        let b = CircuitBreaker::new(3, Duration::from_secs(30), Duration::from_secs(60));
        assert!(b.check().is_ok());
        b.record_failure();
        b.record_failure();
        assert!(b.check().is_ok());
        b.record_failure();
        assert!(matches!(b.check(), Err(FetchError::CircuitOpen)));
    }

    #[test]
    fn breaker_success_resets_failure_count() {
        let b = CircuitBreaker::new(3, Duration::from_secs(30), Duration::from_secs(60));
        b.record_failure();
        b.record_failure();
        b.record_success();
        b.record_failure();
        b.record_failure();
        assert!(b.check().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_half_open_admits_single_probe() {
        let b = CircuitBreaker::new(1, Duration::from_secs(30), Duration::from_secs(60));
        b.record_failure();
        assert!(matches!(b.check(), Err(FetchError::CircuitOpen)));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(b.check().is_ok(), "first caller after cooldown is the probe");
        assert!(
            matches!(b.check(), Err(FetchError::CircuitOpen)),
            "second caller is rejected while the probe is in flight"
        );

        b.record_success();
        assert!(b.check().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_failed_probe_reopens() {
        let b = CircuitBreaker::new(1, Duration::from_secs(30), Duration::from_secs(60));
        b.record_failure();
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(b.check().is_ok());
        b.record_failure();
        assert!(matches!(b.check(), Err(FetchError::CircuitOpen)));
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_window_expiry_resets_the_count() {
        let b = CircuitBreaker::new(3, Duration::from_secs(30), Duration::from_secs(60));
        b.record_failure();
        b.record_failure();
        tokio::time::advance(Duration::from_secs(31)).await;
        // Window expired; this failure starts a fresh count of one.
        b.record_failure();
        assert!(b.check().is_ok());
    }
}
