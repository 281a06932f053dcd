//! Single-flight, cached subject resolution.
//!
//! The first successful lookup is cached for the resolver's lifetime.
//! Callers arriving while a lookup is in flight await that same lookup.
//! Failures are logged and reported as `None`; the next call tries again.
//! Cancelling the resolver's token aborts the in-flight lookup.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use alert_core::SubjectId;

use crate::api::IdentityApi;

type Lookup = Shared<BoxFuture<'static, Option<SubjectId>>>;

pub struct IdentityResolver {
    api: Arc<dyn IdentityApi>,
    identity: String,
    cancel: CancellationToken,
    resolved: OnceLock<SubjectId>,
    /// In-flight lookup tagged with a generation so late waiters never clear a newer one.
    in_flight: Mutex<Option<(u64, Lookup)>>,
    generation: AtomicU64,
}

impl IdentityResolver {
    pub fn new(
        api: Arc<dyn IdentityApi>,
        identity: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            api,
            identity: identity.into(),
            cancel,
            resolved: OnceLock::new(),
            in_flight: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Cached subject, if a lookup already succeeded.
    pub fn cached(&self) -> Option<SubjectId> {
        self.resolved.get().cloned()
    }

    /// Resolve the subject, sharing any lookup already in flight.
    pub async fn resolve(&self) -> Option<SubjectId> {
        if let Some(subject) = self.cached() {
            return Some(subject);
        }

        let (generation, lookup) = self.join_or_start();
        let result = lookup.await;

        {
            let mut slot = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
            if matches!(slot.as_ref(), Some((g, _)) if *g == generation) {
                *slot = None;
            }
        }

        if let Some(subject) = &result {
            let _ = self.resolved.set(subject.clone());
        }
        result
    }

    fn join_or_start(&self) -> (u64, Lookup) {
        let mut slot = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        if let Some((generation, lookup)) = slot.as_ref() {
            debug!(identity = %self.identity, "joining in-flight subject lookup");
            return (*generation, lookup.clone());
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let lookup = Self::lookup(
            self.api.clone(),
            self.identity.clone(),
            self.cancel.clone(),
        )
        .boxed()
        .shared();
        *slot = Some((generation, lookup.clone()));
        (generation, lookup)
    }

    async fn lookup(
        api: Arc<dyn IdentityApi>,
        identity: String,
        cancel: CancellationToken,
    ) -> Option<SubjectId> {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(identity = %identity, "subject lookup cancelled");
                return None;
            }
            outcome = api.lookup_subject(&identity) => outcome,
        };

        match outcome {
            Ok(Some(subject)) => {
                debug!(identity = %identity, subject = %subject, "subject resolved");
                Some(subject)
            }
            Ok(None) => {
                warn!(identity = %identity, "no subject registered for identity");
                None
            }
            Err(e) => {
                warn!(identity = %identity, error = %e, "subject lookup failed");
                None
            }
        }
    }
}
