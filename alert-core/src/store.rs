//! Deduplicated, most-recent-first alert collection.
//!
//! The store keeps a dedup set of every id it has applied. The set is what
//! suppresses duplicate inserts from the change feed and decides which alerts
//! a polling refresh should treat as new.
//!
//! ```text
//! initialize(list)  → replace contents, rebuild dedup set, return new ids
//! apply_insert(a)   → prepend unless a.id already seen
//! apply_update(a)   → replace in place, keep position
//! apply_delete(id)  → remove and forget id
//! ```

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::model::{Alert, AlertEvent};

/// Outcome of applying one [`AlertEvent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// A previously unseen alert was prepended.
    Inserted(Alert),
    /// An existing alert was replaced in place.
    Updated,
    /// An alert was removed.
    Deleted,
    /// Duplicate insert, or update/delete for an unknown id.
    Ignored,
}

#[derive(Debug, Clone, Default)]
pub struct AlertStore {
    alerts: Vec<Alert>,
    seen: HashSet<String>,
}

impl AlertStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole store with `list`.
    ///
    /// Duplicate ids inside `list` keep their first occurrence. Returns the
    /// alerts whose ids were absent from the dedup set before the call.
    pub fn initialize(&mut self, list: Vec<Alert>) -> Vec<Alert> {
        let previous = std::mem::take(&mut self.seen);
        let mut alerts = Vec::with_capacity(list.len());
        let mut fresh = Vec::new();

        for alert in list {
            if !self.seen.insert(alert.id.clone()) {
                continue;
            }
            if !previous.contains(&alert.id) {
                fresh.push(alert.clone());
            }
            alerts.push(alert);
        }

        self.alerts = alerts;
        fresh
    }

    /// Prepend `alert` unless its id was already applied.
    pub fn apply_insert(&mut self, alert: Alert) -> bool {
        if !self.seen.insert(alert.id.clone()) {
            return false;
        }
        self.alerts.insert(0, alert);
        true
    }

    /// Replace the entry with the same id, preserving its position.
    pub fn apply_update(&mut self, alert: Alert) -> bool {
        match self.alerts.iter_mut().find(|a| a.id == alert.id) {
            Some(slot) => {
                *slot = alert;
                true
            }
            None => false,
        }
    }

    /// Remove the entry with `id` and forget it in the dedup set.
    pub fn apply_delete(&mut self, id: &str) -> Option<Alert> {
        self.seen.remove(id);
        let index = self.alerts.iter().position(|a| a.id == id)?;
        Some(self.alerts.remove(index))
    }

    /// Dispatch a feed event to the matching operation.
    pub fn apply(&mut self, event: AlertEvent) -> Applied {
        match event {
            AlertEvent::Insert(alert) => {
                if self.apply_insert(alert.clone()) {
                    Applied::Inserted(alert)
                } else {
                    Applied::Ignored
                }
            }
            AlertEvent::Update(alert) => {
                if self.apply_update(alert) {
                    Applied::Updated
                } else {
                    Applied::Ignored
                }
            }
            AlertEvent::Delete { id } => match self.apply_delete(&id) {
                Some(_) => Applied::Deleted,
                None => Applied::Ignored,
            },
        }
    }

    /// Flag `id` as read. Returns `false` when the id is not in the store.
    pub fn mark_read(&mut self, id: &str, at: DateTime<Utc>) -> bool {
        match self.alerts.iter_mut().find(|a| a.id == id) {
            Some(alert) => {
                alert.is_read = true;
                alert.updated_at = at;
                true
            }
            None => false,
        }
    }

    pub fn list(&self) -> &[Alert] {
        &self.alerts
    }

    pub fn get(&self, id: &str) -> Option<&Alert> {
        self.alerts.iter().find(|a| a.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    /// Unread alerts, most recent first.
    pub fn unread(&self) -> impl Iterator<Item = &Alert> {
        self.alerts.iter().filter(|a| !a.is_read)
    }

    pub fn unread_count(&self) -> usize {
        self.unread().count()
    }

    pub fn len(&self) -> usize {
        self.alerts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }

    pub fn clear(&mut self) {
        self.alerts.clear();
        self.seen.clear();
    }
}
