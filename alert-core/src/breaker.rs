//! Consecutive-failure circuit breaker for the push channel.
//!
//! The breaker counts consecutive channel failures. Once the count reaches
//! `max_retries` the circuit *opens* and the caller switches to its fallback.
//! Any successful subscription closes it again and zeroes the count.
//!
//! [`CircuitBreaker::record_failure`] reports [`Trip::Opened`] only on the
//! failure that crosses the threshold, so callers can start their fallback
//! exactly once no matter how many failures follow.

/// Consecutive failures before the circuit opens.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Warn on the first failure and then on every Nth one.
pub const DEFAULT_LOG_EVERY: u32 = 5;

/// Circuit state derived from the failure count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Healthy: subscription attempts allowed.
    Closed,
    /// Tripped: the fallback carries the load.
    Open,
}

/// What a single failure did to the circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trip {
    /// Still below the threshold.
    Below { failures: u32 },
    /// This failure crossed the threshold.
    Opened { failures: u32 },
    /// The circuit was already open.
    AlreadyOpen { failures: u32 },
}

impl Trip {
    pub fn failures(self) -> u32 {
        match self {
            Self::Below { failures }
            | Self::Opened { failures }
            | Self::AlreadyOpen { failures } => failures,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    consecutive_failures: u32,
    /// Consecutive failures before the circuit opens.
    pub max_retries: u32,
    /// Log throttle period for failures.
    pub log_every: u32,
}

impl CircuitBreaker {
    pub fn new(max_retries: u32, log_every: u32) -> Self {
        Self {
            consecutive_failures: 0,
            max_retries: max_retries.max(1),
            log_every: log_every.max(1),
        }
    }

    /// Record a failure. May trip the circuit open.
    pub fn record_failure(&mut self) -> Trip {
        let was_open = self.is_open();
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let failures = self.consecutive_failures;
        if was_open {
            Trip::AlreadyOpen { failures }
        } else if self.is_open() {
            Trip::Opened { failures }
        } else {
            Trip::Below { failures }
        }
    }

    /// Record a success and reset the count. Returns whether the circuit was open.
    pub fn record_success(&mut self) -> bool {
        let was_open = self.is_open();
        self.consecutive_failures = 0;
        was_open
    }

    pub fn state(&self) -> CircuitState {
        if self.is_open() {
            CircuitState::Open
        } else {
            CircuitState::Closed
        }
    }

    pub fn is_open(&self) -> bool {
        self.consecutive_failures >= self.max_retries
    }

    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures
    }

    /// Whether the current failure count deserves a log line at warn level.
    pub fn should_log(&self) -> bool {
        let n = self.consecutive_failures;
        n == 1 || (n > 0 && n % self.log_every == 0)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, DEFAULT_LOG_EVERY)
    }
}
