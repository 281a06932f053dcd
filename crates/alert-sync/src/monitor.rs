//! Reliability monitor: the circuit breaker wired to channel status.
//!
//! Every channel failure (error, refused subscribe, handshake timeout) goes
//! through [`ReliabilityMonitor::on_failure`], which returns a [`Verdict`]
//! telling the engine what to do next. The breaker opens once; while it is
//! open the monitor schedules a half-open trial every `trial_interval` so a
//! recovered channel can take over from polling again.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use alert_core::{CircuitBreaker, Trip};

use crate::errors::SyncError;

/// Next step after a channel failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Below the threshold: re-subscribe after the retry delay.
    Retry,
    /// This failure opened the circuit: start the fallback.
    OpenCircuit,
    /// Already open (a trial failed): keep polling.
    StayDegraded,
}

#[derive(Debug)]
pub struct ReliabilityMonitor {
    breaker: CircuitBreaker,
    trial_interval: Duration,
    trial_at: Option<Instant>,
}

impl ReliabilityMonitor {
    pub fn new(max_retries: u32, log_every: u32, trial_interval: Duration) -> Self {
        Self {
            breaker: CircuitBreaker::new(max_retries, log_every),
            trial_interval,
            trial_at: None,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        self.breaker.is_open()
    }

    pub fn failure_count(&self) -> u32 {
        self.breaker.failure_count()
    }

    pub fn trial_at(&self) -> Option<Instant> {
        self.trial_at
    }

    pub fn clear_trial(&mut self) {
        self.trial_at = None;
    }

    /// Count a channel failure and decide the next step.
    pub fn on_failure(&mut self, error: &SyncError) -> Verdict {
        let trip = self.breaker.record_failure();
        let failures = trip.failures();
        if self.breaker.should_log() {
            warn!(failures, error = %error, "push channel failure");
        } else {
            debug!(failures, error = %error, "push channel failure");
        }

        match trip {
            Trip::Below { .. } => Verdict::Retry,
            Trip::Opened { .. } => {
                warn!(failures, "circuit open; switching to polling fallback");
                self.schedule_trial();
                Verdict::OpenCircuit
            }
            Trip::AlreadyOpen { .. } => {
                self.schedule_trial();
                Verdict::StayDegraded
            }
        }
    }

    /// A subscription reached `Subscribed`. Returns whether the circuit was open.
    pub fn on_subscribed(&mut self) -> bool {
        self.trial_at = None;
        let was_open = self.breaker.record_success();
        if was_open {
            info!("push channel recovered; circuit closed");
        }
        was_open
    }

    fn schedule_trial(&mut self) {
        self.trial_at = Some(Instant::now() + self.trial_interval);
    }
}
