//! Host notifications for genuinely new alerts.
//!
//! The engine never asks for permission. The host acquires it up front
//! and the sink only queries it before each notification. A host that
//! panics is contained here and reported like any other host failure.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, info, warn};

use alert_core::Alert;

use crate::errors::SyncResult;

/// Host notification permission, as last reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Granted,
    Denied,
    /// The user was never asked.
    Prompt,
}

/// Host-provided notification primitive.
pub trait NotificationHost: Send + Sync {
    fn permission(&self) -> Permission;

    fn fire(&self, title: &str, body: &str) -> SyncResult<()>;
}

/// Title and body for an alert notification.
pub fn render(alert: &Alert, preview_chars: usize) -> (String, String) {
    (
        format!("New message from {}", alert.customer_name),
        alert.preview(preview_chars),
    )
}

/// Fire-and-forget notification emitter. Never fails outward.
pub struct NotificationSink {
    host: Arc<dyn NotificationHost>,
    preview_chars: usize,
}

impl NotificationSink {
    pub fn new(host: Arc<dyn NotificationHost>, preview_chars: usize) -> Self {
        Self {
            host,
            preview_chars,
        }
    }

    /// Notify about `alert`. Returns whether the host accepted the notification.
    pub fn notify(&self, alert: &Alert) -> bool {
        let permission = match panic::catch_unwind(AssertUnwindSafe(|| self.host.permission())) {
            Ok(permission) => permission,
            Err(_) => {
                warn!(alert_id = %alert.id, "notification host panicked reading permission");
                return false;
            }
        };
        if permission != Permission::Granted {
            debug!(
                alert_id = %alert.id,
                ?permission,
                "notification skipped: permission not granted"
            );
            return false;
        }

        let (title, body) = render(alert, self.preview_chars);
        match panic::catch_unwind(AssertUnwindSafe(|| self.host.fire(&title, &body))) {
            Ok(Ok(())) => {
                debug!(alert_id = %alert.id, "notification emitted");
                true
            }
            Ok(Err(e)) => {
                warn!(alert_id = %alert.id, error = %e, "notification failed");
                false
            }
            Err(_) => {
                warn!(alert_id = %alert.id, "notification host panicked");
                false
            }
        }
    }
}

/// Host that writes notifications to the log. Used by the CLI.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl NotificationHost for LogNotifier {
    fn permission(&self) -> Permission {
        Permission::Granted
    }

    fn fire(&self, title: &str, body: &str) -> SyncResult<()> {
        info!(title, body, "notification");
        Ok(())
    }
}
