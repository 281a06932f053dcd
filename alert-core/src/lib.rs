//! Deterministic alert state for the sync engine.
//!
//! This crate holds everything that can be decided without I/O:
//! - [`model`]: the `Alert` entity, feed events, channel statuses
//! - [`store`]: the deduplicated, most-recent-first `AlertStore`
//! - [`breaker`]: the consecutive-failure `CircuitBreaker`
//!
//! The async runtime that feeds these types lives in the `alert-sync` crate.

pub mod breaker;
pub mod model;
pub mod store;

pub use breaker::{CircuitBreaker, CircuitState, Trip, DEFAULT_LOG_EVERY, DEFAULT_MAX_RETRIES};
pub use model::{Alert, AlertEvent, ChannelStatus, ConnectionState, SubjectId};
pub use store::{AlertStore, Applied};
