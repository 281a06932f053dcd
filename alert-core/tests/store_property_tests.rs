//! Store property tests: deterministic sweeps over varied inputs.
//!
//! Tests verify:
//! - `initialize` yields each input id exactly once
//! - Re-applying an insert is idempotent
//! - Interleaved insert/update/delete never breaks the dedup invariant
//! - A polling-style refresh never reports an already-seen id as new

use std::collections::HashSet;

use alert_core::{Alert, AlertEvent, AlertStore, SubjectId};

fn alert(id: impl Into<String>) -> Alert {
    let id = id.into();
    Alert::new(id.clone(), SubjectId::new("subject-1"), "Cliente", format!("msg {id}"))
}

/// Ids `a0..aN` with every third id repeated.
fn list_with_repeats(count: usize) -> Vec<Alert> {
    let mut list = Vec::new();
    for i in 0..count {
        list.push(alert(format!("a{i}")));
        if i % 3 == 0 {
            list.push(alert(format!("a{i}")));
        }
    }
    list
}

fn assert_unique(store: &AlertStore) {
    let mut seen = HashSet::new();
    for a in store.list() {
        assert!(seen.insert(a.id.clone()), "duplicate id {} in store", a.id);
    }
}

// ── Property: initialize mirrors the input ids ─────────────────────

#[test]
fn prop_initialize_contains_each_id_once() {
    for count in [0, 1, 7, 40] {
        let list = list_with_repeats(count);
        let expected: HashSet<String> = list.iter().map(|a| a.id.clone()).collect();

        let mut store = AlertStore::new();
        store.initialize(list);

        let actual: HashSet<String> = store.list().iter().map(|a| a.id.clone()).collect();
        assert_eq!(actual, expected);
        assert_eq!(store.len(), expected.len());
        assert_unique(&store);
    }
}

// ── Property: insert idempotence ───────────────────────────────────

#[test]
fn prop_double_insert_equals_single_insert() {
    for count in [1, 5, 20] {
        let mut once = AlertStore::new();
        let mut twice = AlertStore::new();
        for i in 0..count {
            let a = alert(format!("n{i}"));
            once.apply_insert(a.clone());
            twice.apply_insert(a.clone());
            twice.apply_insert(a);
        }
        assert_eq!(once.list(), twice.list());
    }
}

// ── Property: mixed event streams keep ids unique ──────────────────

#[test]
fn prop_mixed_events_keep_dedup_invariant() {
    let mut store = AlertStore::new();
    store.initialize(list_with_repeats(10));

    for round in 0..50 {
        let id = format!("a{}", round % 13);
        let event = match round % 4 {
            0 | 1 => AlertEvent::Insert(alert(id)),
            2 => AlertEvent::Update(alert(id).read()),
            _ => AlertEvent::Delete { id },
        };
        store.apply(event);
        assert_unique(&store);
        assert_eq!(
            store.unread_count(),
            store.list().iter().filter(|a| !a.is_read).count()
        );
    }
}

// ── Scenario: duplicate insert after bootstrap ─────────────────────

#[test]
fn duplicate_insert_after_bootstrap_keeps_length_one() {
    let mut store = AlertStore::new();
    store.initialize(vec![alert("a1")]);
    store.apply(AlertEvent::Insert(alert("a1")));
    assert_eq!(store.len(), 1);
}

// ── Property: refresh reports only unseen ids ──────────────────────

#[test]
fn prop_refresh_never_reports_seen_ids() {
    let mut store = AlertStore::new();
    store.initialize(vec![alert("a1"), alert("a2")]);
    store.apply_insert(alert("a3"));

    let fresh = store.initialize(vec![alert("a4"), alert("a3"), alert("a2"), alert("a1")]);
    let fresh_ids: Vec<&str> = fresh.iter().map(|a| a.id.as_str()).collect();
    assert_eq!(fresh_ids, vec!["a4"]);

    let again = store.initialize(vec![alert("a4"), alert("a3")]);
    assert!(again.is_empty());
}
