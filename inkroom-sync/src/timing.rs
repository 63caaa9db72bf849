//! Deadline-based rate limiting, throttling and debouncing.
//!
//! These are plain values: callers pass in the current [`Instant`] and ask
//! for the next deadline, so the session can drive all of them from one
//! `sleep_until` arm and tests can step time by hand.

use std::time::{Duration, Instant};

/// Allows one call per interval; extra calls are discarded.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    interval: Duration,
    last: Option<Instant>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// Returns true (and records the call) when enough time has passed.
    pub fn allow(&mut self, now: Instant) -> bool {
        let ready = self
            .last
            .map_or(true, |last| now.saturating_duration_since(last) >= self.interval);
        if ready {
            self.last = Some(now);
        }
        ready
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

/// Leading + trailing throttle.
///
/// The first call in a quiet period fires immediately. Calls inside the
/// window collapse into one trailing firing at the end of the window.
#[derive(Debug, Clone)]
pub struct Throttle {
    window: Duration,
    last_fire: Option<Instant>,
    trailing: bool,
}

impl Throttle {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_fire: None,
            trailing: false,
        }
    }

    /// Register a call. Returns true when it fires immediately.
    pub fn call(&mut self, now: Instant) -> bool {
        let open = self
            .last_fire
            .map_or(true, |last| now.saturating_duration_since(last) >= self.window);
        if open {
            self.last_fire = Some(now);
            self.trailing = false;
            true
        } else {
            self.trailing = true;
            false
        }
    }

    /// Returns true when a pending trailing firing is due (and consumes it).
    pub fn fire_if_due(&mut self, now: Instant) -> bool {
        match self.deadline() {
            Some(deadline) if now >= deadline => {
                self.last_fire = Some(now);
                self.trailing = false;
                true
            }
            _ => false,
        }
    }

    /// When the pending trailing firing is due, if any.
    pub fn deadline(&self) -> Option<Instant> {
        match (self.trailing, self.last_fire) {
            (true, Some(last)) => Some(last + self.window),
            _ => None,
        }
    }

    pub fn cancel(&mut self) {
        self.trailing = false;
        self.last_fire = None;
    }
}

/// Fires once, `wait` after the most recent call.
#[derive(Debug, Clone)]
pub struct Debounce {
    wait: Duration,
    deadline: Option<Instant>,
}

impl Debounce {
    pub fn new(wait: Duration) -> Self {
        Self {
            wait,
            deadline: None,
        }
    }

    /// Cancel any pending firing and restart the wait.
    pub fn schedule(&mut self, now: Instant) {
        self.deadline = Some(now + self.wait);
    }

    pub fn fire_if_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }
}
