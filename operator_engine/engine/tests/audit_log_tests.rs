use operator_engine::audit::{
    AuditEventType, AuditRecord, AuditTracker, fingerprint, new_session_id,
};

#[test]
fn test_audit_log_adds_and_retrieves() {
    let tracker = AuditTracker::new(10);

    tracker.log(
        AuditRecord::new(AuditEventType::Derive, "session_1", "Derived 4 public keys")
            .with_subject("m/12381/3600/0/0/0"),
    );

    let recent = tracker.recent(1);
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].session_id, "session_1");
    assert_eq!(recent[0].message, "Derived 4 public keys");
    assert_eq!(recent[0].event_type_label(), "DERIVE");
    assert!(!recent[0].timestamp.is_empty());
}

#[test]
fn test_audit_log_eviction() {
    let tracker = AuditTracker::new(3);

    for i in 0..5 {
        tracker.log(
            AuditRecord::new(AuditEventType::Reconcile, format!("session_{i}"), "plan applied")
                .with_subject(format!("validator{i}")),
        );
    }

    let recent = tracker.recent(5);
    assert_eq!(recent.len(), 3);
    assert_eq!(recent[0].session_id, "session_4");
    assert_eq!(recent[2].session_id, "session_2");
}

#[test]
fn test_audit_log_thread_safety() {
    let tracker = AuditTracker::new(100);

    std::thread::scope(|scope| {
        for i in 0..10 {
            let tracker = &tracker;
            scope.spawn(move || {
                tracker.log(AuditRecord::new(
                    AuditEventType::ShareSplit,
                    format!("thread_{i}"),
                    format!("Wrote share file {i}"),
                ));
            });
        }
    });

    assert_eq!(tracker.recent(10).len(), 10);
    assert_eq!(tracker.len(), 10);
}

#[test]
fn test_session_ids_and_fingerprints() {
    assert_ne!(new_session_id(), new_session_id());
    let print = fingerprint(b"0xa39882700ed7f72fcdbac07081b7c0c9");
    assert_eq!(print.len(), 16);
    assert!(print.chars().all(|c| c.is_ascii_hexdigit()));
}
