//! Optimistic mark-read / remove.
//!
//! The local store is changed first, on the dispatch loop; the remote call
//! then runs as a tracked task so mutations for different ids overlap.
//!
//! A failed remote call is logged and **not** rolled back. Local and remote
//! state can diverge until the next full refresh replaces the store.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use alert_core::AlertStore;

use crate::api::AlertApi;
use crate::errors::MutationOp;

pub struct MutationGateway {
    api: Arc<dyn AlertApi>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl MutationGateway {
    pub fn new(api: Arc<dyn AlertApi>, tracker: TaskTracker, cancel: CancellationToken) -> Self {
        Self {
            api,
            tracker,
            cancel,
        }
    }

    /// Mark `id` read locally, then remotely. No-op for unknown ids.
    pub fn mark_read(&self, store: &mut AlertStore, id: &str) -> bool {
        if !store.mark_read(id, Utc::now()) {
            debug!(alert_id = id, "mark_read ignored: alert not in store");
            return false;
        }
        self.dispatch(MutationOp::MarkRead, id.to_string());
        true
    }

    /// Remove `id` locally, then remotely. No-op for unknown ids.
    pub fn remove(&self, store: &mut AlertStore, id: &str) -> bool {
        if store.apply_delete(id).is_none() {
            debug!(alert_id = id, "remove ignored: alert not in store");
            return false;
        }
        self.dispatch(MutationOp::Remove, id.to_string());
        true
    }

    fn dispatch(&self, op: MutationOp, id: String) {
        let api = self.api.clone();
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            let call = async {
                match op {
                    MutationOp::MarkRead => api.mark_read(&id).await,
                    MutationOp::Remove => api.remove(&id).await,
                }
            };
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(alert_id = %id, %op, "remote mutation abandoned at teardown");
                    return;
                }
                outcome = call => outcome,
            };
            match outcome {
                Ok(()) => debug!(alert_id = %id, %op, "remote mutation applied"),
                Err(e) => warn!(
                    alert_id = %id,
                    %op,
                    error = %e,
                    "remote mutation failed; local change kept"
                ),
            }
        });
    }
}
