//! Resilient realtime alert synchronization.
//!
//! Mirrors the unread alerts of one subject from a remote store, keeps the
//! mirror current through a push change feed, and falls back to periodic
//! polling when the feed keeps failing.
//!
//! | Module | Role |
//! |--------|------|
//! | [`engine`] | Dispatch loop, lifecycle, snapshots |
//! | [`identity`] | Single-flight subject resolution |
//! | [`feed`] | Change-feed subscription and its state machine |
//! | [`monitor`] | Circuit breaker wired to channel status |
//! | [`polling`] | Recurring full refresh while degraded |
//! | [`mutation`] | Optimistic mark-read / remove |
//! | [`notify`] | Host notifications for new alerts |
//! | [`api`] | Remote store boundary and HTTP client |
//! | [`config`] | File + environment configuration |

pub mod api;
pub mod config;
pub mod engine;
pub mod errors;
pub mod feed;
pub mod identity;
pub mod monitor;
pub mod mutation;
pub mod notify;
pub mod polling;

pub use alert_core::{Alert, AlertEvent, ChannelStatus, ConnectionState, SubjectId};
pub use api::{AlertApi, HttpAlertApi, IdentityApi};
pub use config::SyncConfig;
pub use engine::{
    EngineDeps, EngineHandle, EngineSnapshot, RefreshOrigin, ShutdownReport, SyncEngine,
};
pub use errors::{ErrorKind, MutationOp, SyncError, SyncResult};
pub use feed::{ChangeFeedProvider, FeedMessage, FeedSink, SubscriptionHandle, UnavailableFeed};
pub use notify::{LogNotifier, NotificationHost, Permission};
