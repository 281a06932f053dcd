//! Error taxonomy for the sync engine.
//!
//! Nothing in here escapes the engine at runtime: every variant is logged
//! and converted into degraded behaviour (more polling, stale data, a
//! skipped notification). Only `Configuration` reaches the caller, at load
//! time.
//!
//! | Kind          | Retriable | Recovery                                  |
//! |---------------|-----------|-------------------------------------------|
//! | identity      | yes       | next resolution attempt                   |
//! | subscription  | yes       | retry, then circuit opens and polling runs |
//! | fetch         | yes       | next polling tick                         |
//! | mutation      | no        | logged; local state stays mutated         |
//! | notification  | no        | swallowed                                 |
//! | configuration | no        | fix the config                            |

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Classification used for logging and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Identity,
    Subscription,
    Fetch,
    Mutation,
    Notification,
    Configuration,
    Transport,
    Internal,
}

impl ErrorKind {
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            Self::Identity | Self::Subscription | Self::Fetch | Self::Transport
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Identity => write!(f, "identity"),
            Self::Subscription => write!(f, "subscription"),
            Self::Fetch => write!(f, "fetch"),
            Self::Mutation => write!(f, "mutation"),
            Self::Notification => write!(f, "notification"),
            Self::Configuration => write!(f, "configuration"),
            Self::Transport => write!(f, "transport"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Remote mutation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOp {
    MarkRead,
    Remove,
}

impl fmt::Display for MutationOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MarkRead => write!(f, "mark_read"),
            Self::Remove => write!(f, "remove"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    /// Subject lookup failed.
    #[error("Identity resolution failed: {0}")]
    IdentityResolution(String),

    /// The change feed refused or dropped the subscription.
    #[error("Subscription failed: {0}")]
    Subscription(String),

    /// No `Subscribed` status arrived within the handshake window.
    #[error("Subscription handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// Bootstrap or polling read failed.
    #[error("Alert fetch failed: {0}")]
    Fetch(String),

    #[error("Mutation failure [{op}] for alert {id}: {message}")]
    Mutation {
        op: MutationOp,
        id: String,
        message: String,
    },

    /// Permission missing or the host could not display the notification.
    #[error("Notification failed: {0}")]
    Notification(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::IdentityResolution(_) => ErrorKind::Identity,
            Self::Subscription(_) | Self::HandshakeTimeout(_) => ErrorKind::Subscription,
            Self::Fetch(_) => ErrorKind::Fetch,
            Self::Mutation { .. } => ErrorKind::Mutation,
            Self::Notification(_) => ErrorKind::Notification,
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.kind().is_retriable()
    }

    /// Build a `Mutation` variant conveniently.
    pub fn mutation(op: MutationOp, id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Mutation {
            op,
            id: id.into(),
            message: message.into(),
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_timeout_counts_as_subscription_failure() {
        let err = SyncError::HandshakeTimeout(Duration::from_secs(15));
        assert_eq!(err.kind(), ErrorKind::Subscription);
        assert!(err.is_retriable());
        assert!(err.to_string().contains("15s"));
    }

    #[test]
    fn mutation_failures_are_not_retried() {
        let err = SyncError::mutation(MutationOp::MarkRead, "a1", "503");
        assert!(!err.is_retriable());
        assert_eq!(
            err.to_string(),
            "Mutation failure [mark_read] for alert a1: 503"
        );
    }

    #[test]
    fn identity_failures_are_retriable() {
        let err = SyncError::IdentityResolution("no session".into());
        assert!(err.is_retriable());
        assert_eq!(err.kind().to_string(), "identity");
    }

    #[test]
    fn anyhow_errors_become_internal() {
        let err: SyncError = anyhow::anyhow!("boom").into();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }
}
