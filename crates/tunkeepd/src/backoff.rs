//! Repair backoff and cycle cadence.

use std::time::Duration;

use crate::types::Outcome;

/// Backoff between repair attempts.
///
/// `current == 0` means "poll at the base frequency". Each failed repair
/// (IPv4 up, IPv6 still down) doubles the delay up to `max`. An IPv4 outage
/// pins it to the base frequency: waiting on upstream connectivity is not
/// something more patience fixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    frequency_secs: u64,
    max_secs: u64,
    current: u64,
}

impl Backoff {
    pub fn new(frequency_secs: u64, max_secs: u64) -> Self {
        Self {
            frequency_secs,
            max_secs: max_secs.max(frequency_secs),
            current: 0,
        }
    }

    /// Current backoff in seconds (0 = none).
    pub fn current_secs(&self) -> u64 {
        self.current
    }

    pub fn reset(&mut self) {
        self.current = 0;
    }

    /// Sets the backoff to the base frequency without escalating.
    pub fn pin_to_base(&mut self) {
        self.current = self.frequency_secs;
    }

    /// Starts at the base frequency, then doubles up to the cap.
    pub fn escalate(&mut self) {
        self.current = if self.current == 0 {
            self.frequency_secs
        } else {
            self.current.saturating_mul(2)
        }
        .min(self.max_secs);
    }

    /// Updates the backoff for the outcome of a cycle.
    pub fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Healthy => self.reset(),
            Outcome::Ipv4Down => self.pin_to_base(),
            Outcome::Ipv6DownRepairAttempted | Outcome::Ipv6DownRepairFailed => self.escalate(),
        }
    }

    /// How long to sleep before the next cycle.
    pub fn next_delay(&self) -> Duration {
        let secs = if self.current == 0 {
            self.frequency_secs
        } else {
            self.current
        };
        Duration::from_secs(secs)
    }
}
