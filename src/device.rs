use crate::prelude::*;

use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HealthState {
    /// Polled every cycle.
    Active,
    /// Skipped for a short isolation window after repeated failures.
    Cooling,
    /// Skipped for a much longer window; externally reported offline.
    Penalized,
}

/// Reachability transitions the rest of the system cares about. Individual
/// failed polls are not surfaced - only crossing into or out of Penalized.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HealthEvent {
    WentOffline,
    BackOnline,
}

#[derive(Clone, Debug)]
pub struct BackoffPolicy {
    pub cooling_threshold: u32,
    pub cooling: Duration,
    pub penalty_threshold: u32,
    pub penalty: Duration,
}

impl From<&config::Backoff> for BackoffPolicy {
    fn from(backoff: &config::Backoff) -> Self {
        Self {
            cooling_threshold: backoff.cooling_threshold,
            cooling: Duration::from_secs(backoff.cooling_secs),
            penalty_threshold: backoff.penalty_threshold,
            penalty: Duration::from_secs(backoff.penalty_secs),
        }
    }
}

/// Identity read once from the first valid telemetry frame and kept for the
/// life of the process.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Identity {
    pub battery_type: u8,
    pub battery_count: u8,
    pub hw_max_charge_current: f64,
}

impl Identity {
    pub fn from_frame(frame: &[u8]) -> Option<Self> {
        if frame.len() < 26 {
            return None;
        }

        Some(Self {
            battery_type: frame[8],
            battery_count: frame[10],
            hw_max_charge_current: u16::from_be_bytes([frame[24], frame[25]]) as f64 / 100.0,
        })
    }
}

/// One logical controller on the bus, with its health record. Mutated only
/// by the coordinator after each exchange outcome.
#[derive(Clone, Debug)]
pub struct Device {
    pub address: u8,
    /// false for devices discovered via a command to an unconfigured address
    pub configured: bool,
    pub identity: Option<Identity>,
    state: HealthState,
    failures: u32,
    retry_at: Option<Instant>,
    seen: bool,
}

impl Device {
    pub fn new(address: u8, configured: bool) -> Self {
        Self {
            address,
            configured,
            identity: None,
            state: HealthState::Active,
            failures: 0,
            retry_at: None,
            seen: false,
        }
    }

    pub fn state(&self) -> HealthState {
        self.state
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    /// Active devices are always eligible; isolated devices become eligible
    /// again once their deadline passes, for exactly one retry attempt.
    pub fn is_eligible(&self, now: Instant) -> bool {
        match self.state {
            HealthState::Active => true,
            HealthState::Cooling | HealthState::Penalized => {
                self.retry_at.map_or(true, |at| now >= at)
            }
        }
    }

    pub fn discover(&mut self, identity: Identity) {
        if self.identity.is_none() {
            self.identity = Some(identity);
        }
    }

    /// `BackOnline` is returned on the first contact ever and whenever a
    /// device recovers from Penalized - the two cases where reachability
    /// needs announcing.
    pub fn record_success(&mut self) -> Option<HealthEvent> {
        let announce = self.state == HealthState::Penalized || !self.seen;

        self.seen = true;
        self.failures = 0;
        self.retry_at = None;
        self.state = HealthState::Active;

        announce.then_some(HealthEvent::BackOnline)
    }

    pub fn record_failure(&mut self, policy: &BackoffPolicy, now: Instant) -> Option<HealthEvent> {
        self.failures += 1;

        if self.failures >= policy.penalty_threshold {
            let entered = self.state != HealthState::Penalized;
            self.state = HealthState::Penalized;
            self.retry_at = Some(now + policy.penalty);
            return entered.then_some(HealthEvent::WentOffline);
        }

        if self.failures >= policy.cooling_threshold {
            self.state = HealthState::Cooling;
            self.retry_at = Some(now + policy.cooling);
        }

        None
    }
}
