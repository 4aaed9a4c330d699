//! Per-provider circuit breaker
//!
//! Guards every adapter call. Closed keeps a rolling window of outcomes and
//! opens when the failure ratio crosses the configured threshold over enough
//! calls. Open fails fast until the cool-down elapses, then a single probe is
//! admitted; its outcome decides between closing and re-opening with a
//! doubled (capped) cool-down.
//!
//! One breaker is shared by all tasks using an adapter, so the interior is a
//! plain mutex held only for bookkeeping, never across an await.

use crate::config::BreakerConfig;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

/// Outcome of asking the breaker for admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Proceed normally.
    Allowed,
    /// Proceed, and this call is the half-open probe.
    Probe,
    /// Fail fast without touching the provider.
    Rejected,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    window: VecDeque<bool>,
    open_until: Instant,
    cooldown: Duration,
    probe_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                window: VecDeque::with_capacity(config.window as usize),
                open_until: Instant::now(),
                cooldown: Duration::from_secs(config.cooldown_secs),
                probe_in_flight: false,
            }),
        }
    }

    /// Ask whether a call may proceed. Transitions open → half_open when the
    /// cool-down has elapsed; at most one probe is outstanding.
    pub fn admit(&self) -> Admission {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        match inner.state {
            BreakerState::Closed => Admission::Allowed,
            BreakerState::Open => {
                if Instant::now() >= inner.open_until {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    Admission::Probe
                } else {
                    Admission::Rejected
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Admission::Rejected
                } else {
                    inner.probe_in_flight = true;
                    Admission::Probe
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Closed;
                inner.window.clear();
                inner.probe_in_flight = false;
                inner.cooldown = Duration::from_secs(self.config.cooldown_secs);
            }
            BreakerState::Closed => {
                Self::push_outcome(&mut inner, &self.config, true);
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        match inner.state {
            BreakerState::HalfOpen => {
                // probe failed: re-open with doubled, capped cool-down
                inner.probe_in_flight = false;
                inner.cooldown = (inner.cooldown * 2)
                    .min(Duration::from_secs(self.config.max_cooldown_secs));
                inner.open_until = Instant::now() + inner.cooldown;
                inner.state = BreakerState::Open;
            }
            BreakerState::Closed => {
                Self::push_outcome(&mut inner, &self.config, false);
                if Self::should_open(&inner, &self.config) {
                    inner.window.clear();
                    inner.open_until = Instant::now() + inner.cooldown;
                    inner.state = BreakerState::Open;
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker mutex poisoned").state
    }

    pub fn is_open(&self) -> bool {
        self.state() == BreakerState::Open
    }

    fn push_outcome(inner: &mut BreakerInner, config: &BreakerConfig, success: bool) {
        if inner.window.len() >= config.window as usize {
            inner.window.pop_front();
        }
        inner.window.push_back(success);
    }

    fn should_open(inner: &BreakerInner, config: &BreakerConfig) -> bool {
        let total = inner.window.len() as u32;
        if total < config.min_calls {
            return false;
        }
        let failures = inner.window.iter().filter(|ok| !**ok).count() as f64;
        failures / total as f64 >= config.failure_ratio
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            window: 10,
            min_calls: 4,
            failure_ratio: 0.5,
            cooldown_secs: 0,
            max_cooldown_secs: 8,
        }
    }

    #[test]
    fn stays_closed_below_min_calls() {
        let breaker = CircuitBreaker::new(fast_config());
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn opens_on_failure_ratio() {
        let breaker = CircuitBreaker::new(fast_config());
        breaker.record_success();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn half_open_admits_single_probe() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..4 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        // zero cool-down: first admit becomes the probe
        assert_eq!(breaker.admit(), Admission::Probe);
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        // second caller is rejected while the probe is outstanding
        assert_eq!(breaker.admit(), Admission::Rejected);

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.admit(), Admission::Allowed);
    }

    #[test]
    fn failed_probe_doubles_cooldown() {
        let config = BreakerConfig {
            cooldown_secs: 1,
            ..fast_config()
        };
        let breaker = CircuitBreaker::new(config);
        for _ in 0..4 {
            breaker.record_failure();
        }
        {
            let mut inner = breaker.inner.lock().unwrap();
            assert_eq!(inner.cooldown, Duration::from_secs(1));
            // force the cool-down to have elapsed
            inner.open_until = Instant::now();
        }
        assert_eq!(breaker.admit(), Admission::Probe);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.inner.lock().unwrap().cooldown, Duration::from_secs(2));
    }

    #[test]
    fn cooldown_is_capped() {
        let config = BreakerConfig {
            cooldown_secs: 3,
            max_cooldown_secs: 4,
            ..fast_config()
        };
        let breaker = CircuitBreaker::new(config);
        for _ in 0..4 {
            breaker.record_failure();
        }
        for _ in 0..3 {
            breaker.inner.lock().unwrap().open_until = Instant::now();
            assert_eq!(breaker.admit(), Admission::Probe);
            breaker.record_failure();
        }
        assert_eq!(breaker.inner.lock().unwrap().cooldown, Duration::from_secs(4));
    }
}
