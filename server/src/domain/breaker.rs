//! Circuit breaker guarding the message store
//!
//! Three-state machine: CLOSED admits everything and counts consecutive
//! failures; OPEN fails fast until the reset timeout passes; HALF_OPEN
//! admits a bounded number of probe calls, where one success closes the
//! circuit and any failure re-opens it.
//!
//! The breaker is per-process. A globally unhealthy store simply trips
//! every process independently.

use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::core::config::CircuitConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_calls: u32,
}

pub struct CircuitBreaker {
    config: CircuitConfig,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig) -> Self {
        let (state_tx, _) = watch::channel(BreakerState::Closed);
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                half_open_calls: 0,
            }),
            state_tx,
        }
    }

    /// Observe state transitions (supervisor alerting)
    pub fn subscribe(&self) -> watch::Receiver<BreakerState> {
        self.state_tx.subscribe()
    }

    /// Current state, advancing OPEN → HALF_OPEN when the reset timeout
    /// has elapsed.
    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock();
        self.advance_open(&mut inner);
        inner.state
    }

    /// Ask to make a call. `false` means fail fast with `CircuitOpen`.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock();
        self.advance_open(&mut inner);

        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => false,
            BreakerState::HalfOpen => {
                if inner.half_open_calls < self.config.half_open_max_calls {
                    inner.half_open_calls += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        if inner.state == BreakerState::HalfOpen {
            self.transition(&mut inner, BreakerState::Closed);
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.transition(&mut inner, BreakerState::Open);
                }
            }
            BreakerState::HalfOpen => {
                // A failed probe re-opens and restarts the timer
                self.transition(&mut inner, BreakerState::Open);
            }
            BreakerState::Open => {}
        }
    }

    fn advance_open(&self, inner: &mut Inner) {
        if inner.state == BreakerState::Open
            && let Some(at) = inner.opened_at
            && at.elapsed().as_millis() as u64 >= self.config.reset_timeout_ms
        {
            self.transition(inner, BreakerState::HalfOpen);
        }
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        match to {
            BreakerState::Open => {
                inner.opened_at = Some(Instant::now());
                tracing::warn!(from = from.as_str(), "Circuit breaker opened");
            }
            BreakerState::HalfOpen => {
                inner.half_open_calls = 0;
                tracing::info!("Circuit breaker half-open, probing store");
            }
            BreakerState::Closed => {
                inner.opened_at = None;
                inner.consecutive_failures = 0;
                tracing::info!("Circuit breaker closed");
            }
        }
        let _ = self.state_tx.send(to);
    }
}
