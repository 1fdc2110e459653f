//! # Circuit Breaker
//!
//! A client-local gate consulted before a backend connection is used or
//! rebuilt. It never talks to the network and is never shared across
//! processes.

use std::time::Duration;
use std::time::Instant;

use parking_lot::Mutex;

/// Failure gate for connection attempts.
pub trait Breaker: Send + Sync {
    /// Whether a call may proceed.
    fn ready(&self) -> bool;
    /// Records a failed attempt.
    fn fail(&self);
    /// Records a successful attempt and clears the failure count.
    fn success(&self);
}

/// Sliding-window breaker: opens after `threshold` failures that each land
/// within `window` of the previous activity, and closes again once the window
/// passes quietly.
pub struct SimpleBreaker {
    threshold: u64,
    window: Duration,
    state: Mutex<State>,
}

struct State {
    failures: u64,
    last: Instant,
}

impl SimpleBreaker {
    pub const DEFAULT_THRESHOLD: u64 = 3;
    pub const DEFAULT_WINDOW: Duration = Duration::from_secs(10);

    pub fn new(threshold: u64, window: Duration) -> Self {
        Self {
            threshold,
            window,
            state: Mutex::new(State { failures: 0, last: Instant::now() }),
        }
    }

    pub fn failures(&self) -> u64 {
        self.state.lock().failures
    }
}

impl Default for SimpleBreaker {
    fn default() -> Self {
        Self::new(Self::DEFAULT_THRESHOLD, Self::DEFAULT_WINDOW)
    }
}

impl Breaker for SimpleBreaker {
    fn ready(&self) -> bool {
        let mut state = self.state.lock();
        if state.last.elapsed() > self.window {
            state.failures = 0;
            state.last = Instant::now();
            return true;
        }
        state.failures < self.threshold
    }

    fn fail(&self) {
        let mut state = self.state.lock();
        state.failures += 1;
        state.last = Instant::now();
    }

    fn success(&self) {
        let mut state = self.state.lock();
        state.failures = 0;
        state.last = Instant::now();
    }
}
