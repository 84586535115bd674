//! Deadline timer
//!
//! Runtime-agnostic arm/cancel/fire timer. The owner polls `fire_if_due`
//! with the current clock reading; re-arming pushes the deadline out, which
//! is what coalesces bursts of requests.

use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DeadlineTimer {
    deadline: Option<f64>,
}

impl DeadlineTimer {
    pub const fn new() -> Self {
        Self { deadline: None }
    }

    /// (Re)arm to fire `delay` after `now`
    pub fn arm(&mut self, now: f64, delay: Duration) {
        self.deadline = Some(now + delay.as_secs_f64());
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    #[inline]
    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<f64> {
        self.deadline
    }

    /// Disarm and return `true` once the deadline has passed
    pub fn fire_if_due(&mut self, now: f64) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}
