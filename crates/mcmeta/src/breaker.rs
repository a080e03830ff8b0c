use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use tracing::info;

use crate::{Error, sync::lock};

pub type TripPolicy = Arc<dyn Fn(&Counts) -> bool + Send + Sync>;
pub type StateChangeHook = Arc<dyn Fn(BreakerState, BreakerState) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        })
    }
}

/// Request/outcome counters for the current window or probe phase.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Counts {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub consecutive_successes: u64,
    pub consecutive_failures: u64,
}

/// Knobs for one server's breaker.
#[derive(Clone)]
pub struct BreakerConfig {
    /// How long the breaker stays open before probing.
    pub open_timeout: Duration,
    /// Closed-state count window; `None` never rolls the window.
    pub interval: Option<Duration>,
    /// Probe admissions in half-open; this many consecutive successes
    /// close the breaker again.
    pub max_probes: u32,
    pub trip: TripPolicy,
    pub on_state_change: Option<StateChangeHook>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            open_timeout: Duration::from_secs(60),
            interval: None,
            max_probes: 1,
            trip: Arc::new(|counts| counts.consecutive_failures > 5),
            on_state_change: None,
        }
    }
}

struct Inner {
    state: BreakerState,
    /// Bumped on every transition and window roll; outcomes recorded
    /// against a stale generation are dropped.
    generation: u64,
    counts: Counts,
    window_expiry: Option<Instant>,
    open_until: Instant,
    probes: u32,
    last_change: Instant,
}

/// Fails calls fast while a server is misbehaving.
///
/// Closed admits everything and counts outcomes; the trip policy moves it
/// to open. Open rejects with `CircuitOpen` until the timeout, then
/// half-open admits a few probes: all succeeding closes the breaker, any
/// failure reopens it. Only transport-class errors count as failures —
/// see [`Error::is_breaker_failure`].
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        let now = Instant::now();
        let window_expiry = config.interval.map(|i| now + i);
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                generation: 0,
                counts: Counts::default(),
                window_expiry,
                open_until: now,
                probes: 0,
                last_change: now,
            }),
        }
    }

    /// Runs `f` under the breaker. Rejected calls return `CircuitOpen`
    /// without invoking `f`.
    pub fn execute<T>(&self, f: impl FnOnce() -> Result<T, Error>) -> Result<T, Error> {
        let generation = self.admit()?;
        let result = f();
        let failed = matches!(&result, Err(err) if err.is_breaker_failure());
        self.record(generation, !failed);
        result
    }

    pub fn state(&self) -> BreakerState {
        let mut inner = lock(&self.inner);
        let shift = self.refresh(&mut inner, Instant::now());
        let state = inner.state;
        drop(inner);
        self.notify(shift);
        state
    }

    pub fn counts(&self) -> Counts {
        lock(&self.inner).counts
    }

    pub fn last_change(&self) -> Instant {
        lock(&self.inner).last_change
    }

    fn admit(&self) -> Result<u64, Error> {
        let mut inner = lock(&self.inner);
        let now = Instant::now();
        let shift = self.refresh(&mut inner, now);
        let admitted = match inner.state {
            BreakerState::Closed => {
                inner.counts.requests += 1;
                Ok(inner.generation)
            }
            BreakerState::Open => Err(Error::CircuitOpen),
            BreakerState::HalfOpen => {
                if inner.probes < self.config.max_probes {
                    inner.probes += 1;
                    inner.counts.requests += 1;
                    Ok(inner.generation)
                } else {
                    Err(Error::CircuitOpen)
                }
            }
        };
        drop(inner);
        self.notify(shift);
        admitted
    }

    fn record(&self, generation: u64, success: bool) {
        let mut inner = lock(&self.inner);
        if inner.generation != generation {
            return;
        }
        let now = Instant::now();
        let shift = if success {
            inner.counts.successes += 1;
            inner.counts.consecutive_successes += 1;
            inner.counts.consecutive_failures = 0;
            if inner.state == BreakerState::HalfOpen
                && inner.counts.consecutive_successes >= u64::from(self.config.max_probes)
            {
                self.transition(&mut inner, BreakerState::Closed, now)
            } else {
                None
            }
        } else {
            inner.counts.failures += 1;
            inner.counts.consecutive_failures += 1;
            inner.counts.consecutive_successes = 0;
            match inner.state {
                BreakerState::Closed if (self.config.trip)(&inner.counts) => {
                    self.transition(&mut inner, BreakerState::Open, now)
                }
                BreakerState::HalfOpen => self.transition(&mut inner, BreakerState::Open, now),
                _ => None,
            }
        };
        drop(inner);
        self.notify(shift);
    }

    /// Applies time-driven shifts: open past its timeout becomes
    /// half-open, a closed window past its interval resets the counts.
    fn refresh(&self, inner: &mut Inner, now: Instant) -> Option<(BreakerState, BreakerState)> {
        match inner.state {
            BreakerState::Open if now >= inner.open_until => {
                self.transition(inner, BreakerState::HalfOpen, now)
            }
            BreakerState::Closed => {
                if let Some(expiry) = inner.window_expiry {
                    if now >= expiry {
                        inner.generation += 1;
                        inner.counts = Counts::default();
                        inner.window_expiry = self.config.interval.map(|i| now + i);
                    }
                }
                None
            }
            _ => None,
        }
    }

    fn transition(
        &self,
        inner: &mut Inner,
        to: BreakerState,
        now: Instant,
    ) -> Option<(BreakerState, BreakerState)> {
        let from = inner.state;
        if from == to {
            return None;
        }
        inner.state = to;
        inner.generation += 1;
        inner.counts = Counts::default();
        inner.probes = 0;
        inner.last_change = now;
        match to {
            BreakerState::Open => inner.open_until = now + self.config.open_timeout,
            BreakerState::Closed => {
                inner.window_expiry = self.config.interval.map(|i| now + i);
            }
            BreakerState::HalfOpen => {}
        }
        Some((from, to))
    }

    fn notify(&self, shift: Option<(BreakerState, BreakerState)>) {
        if let Some((from, to)) = shift {
            info!(%from, %to, "circuit breaker state change");
            if let Some(hook) = &self.config.on_state_change {
                hook(from, to);
            }
        }
    }
}
