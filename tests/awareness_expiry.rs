use mesh_crdt::awareness::{Awareness, AwarenessChange, AwarenessConfig, AwarenessUpdate};
use serde_json::json;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

fn recorder(awareness: &mut Awareness) -> Rc<RefCell<Vec<AwarenessChange>>> {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    awareness.on_change(move |change| sink.borrow_mut().push(change.clone()));
    seen
}

fn update(replica: u64, clock: u64) -> AwarenessUpdate {
    AwarenessUpdate {
        replica,
        clock,
        state: json!({"user": {"name": format!("r{replica}"), "color": "#000000"}}),
    }
}

#[test]
fn test_expiry_notifies_exactly_once() {
    let start = Instant::now();
    let config = AwarenessConfig { timeout_ms: 1_000 };
    let mut awareness = Awareness::new(1, config.clone());
    awareness.apply_update(update(2, 1), start);
    let seen = recorder(&mut awareness);

    awareness.tick(start + Duration::from_millis(500));
    assert!(seen.borrow().is_empty());

    let expired_at = start + config.timeout() + Duration::from_millis(1);
    awareness.tick(expired_at);
    awareness.tick(expired_at + Duration::from_millis(10));

    let changes = seen.borrow();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].removed, vec![2]);
    assert!(awareness.get(2).is_none());
}

#[test]
fn test_refresh_keeps_entry_alive() {
    let start = Instant::now();
    let mut awareness = Awareness::new(1, AwarenessConfig { timeout_ms: 1_000 });
    awareness.apply_update(update(2, 1), start);
    awareness.apply_update(update(2, 2), start + Duration::from_millis(900));

    awareness.tick(start + Duration::from_millis(1_500));
    assert!(awareness.get(2).is_some());
}

#[test]
fn test_replayed_update_does_not_resurrect_expired_entry() {
    let start = Instant::now();
    let mut awareness = Awareness::new(1, AwarenessConfig { timeout_ms: 1_000 });
    awareness.apply_update(update(2, 3), start);
    let later = start + Duration::from_secs(2);
    awareness.tick(later);

    assert!(!awareness.apply_update(update(2, 3), later));
    assert!(awareness.get(2).is_none());
    assert!(awareness.apply_update(update(2, 4), later));
    assert!(awareness.get(2).is_some());
}

#[test]
fn test_null_state_removes_peer() {
    let start = Instant::now();
    let mut awareness = Awareness::new(1, AwarenessConfig::default());
    awareness.apply_update(update(2, 1), start);
    let seen = recorder(&mut awareness);

    awareness.apply_update(
        AwarenessUpdate {
            replica: 2,
            clock: 2,
            state: serde_json::Value::Null,
        },
        start,
    );

    assert!(awareness.is_empty());
    assert_eq!(seen.borrow()[0].removed, vec![2]);
}

#[test]
fn test_local_state_is_renewed_not_expired() {
    let start = Instant::now();
    let mut awareness = Awareness::new(1, AwarenessConfig { timeout_ms: 1_000 });
    awareness.set_local_state(json!({"user": {"name": "me", "color": "#111111"}}), start);
    let seen = recorder(&mut awareness);

    let renewal = awareness.tick(start + Duration::from_millis(600));
    let renewal = renewal.expect("local state due for renewal");
    assert_eq!(renewal.replica, 1);
    assert_eq!(renewal.clock, 2);

    awareness.tick(start + Duration::from_secs(5));
    assert!(awareness.local_state().is_some());
    assert!(seen.borrow().is_empty());
}
