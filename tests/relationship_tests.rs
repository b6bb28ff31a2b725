//! Integration tests for the disconnection coordinator: only a confirmed
//! negative verification may mutate link state, and remote-notify failure
//! never blocks local cleanup.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::NaiveDate;
use tend::clock::ManualClock;
use tend::relationship::{DisconnectionCoordinator, LinkAuthority, VerificationResult};
use tend::session::{CaregiverRecord, PatientRecord};
use tend::store::{keys, read_record, write_record, MemoryStore};

struct ScriptedAuthority {
    result: VerificationResult,
    unlink_ok: bool,
    unlink_calls: AtomicUsize,
}

impl ScriptedAuthority {
    fn new(result: VerificationResult, unlink_ok: bool) -> Arc<Self> {
        Arc::new(Self {
            result,
            unlink_ok,
            unlink_calls: AtomicUsize::new(0),
        })
    }
}

impl LinkAuthority for ScriptedAuthority {
    fn check_link(&self, _patient_email: &str, _token: Option<&str>) -> VerificationResult {
        self.result
    }

    fn notify_unlink(&self, _patient_email: &str, _caregiver_email: &str) -> bool {
        self.unlink_calls.fetch_add(1, Ordering::SeqCst);
        self.unlink_ok
    }
}

fn linked_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    let caregiver = CaregiverRecord {
        email: "a@x.com".to_string(),
        name: Some("Alice".to_string()),
        phone: None,
        profile_image: None,
        patient_email: Some("p@y.com".to_string()),
        token: Some("tok".to_string()),
        updated_at: 1,
    };
    write_record(store.as_ref(), &keys::caregiver("a@x.com"), &caregiver).unwrap();
    let patient = PatientRecord {
        email: "p@y.com".to_string(),
        name: Some("Pat".to_string()),
        caregiver_email: Some("a@x.com".to_string()),
        updated_at: 1,
    };
    write_record(store.as_ref(), &keys::patient("p@y.com"), &patient).unwrap();
    store
}

fn coordinator(
    store: Arc<MemoryStore>,
    authority: Arc<ScriptedAuthority>,
) -> DisconnectionCoordinator {
    let date = NaiveDate::from_ymd_opt(2026, 8, 29).expect("valid date");
    let clock = Arc::new(ManualClock::new(50_000, date));
    DisconnectionCoordinator::new(store, authority, clock)
}

fn stored_link(store: &MemoryStore) -> (Option<String>, Option<String>) {
    let caregiver: CaregiverRecord = read_record(store, &keys::caregiver("a@x.com"))
        .unwrap()
        .expect("caregiver record");
    let patient: PatientRecord = read_record(store, &keys::patient("p@y.com"))
        .unwrap()
        .expect("patient record");
    (caregiver.patient_email, patient.caregiver_email)
}

#[test]
fn unknown_verification_is_a_noop() {
    let store = linked_store();
    let authority = ScriptedAuthority::new(VerificationResult::Unknown, true);
    let coordinator = coordinator(store.clone(), authority.clone());

    assert!(!coordinator.disconnect("p@y.com", "a@x.com", Some("tok")));
    assert_eq!(
        stored_link(&store),
        (Some("p@y.com".to_string()), Some("a@x.com".to_string()))
    );
    assert_eq!(authority.unlink_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn positive_verification_is_a_noop() {
    let store = linked_store();
    let authority = ScriptedAuthority::new(VerificationResult::Exists, true);
    let coordinator = coordinator(store.clone(), authority.clone());

    assert!(!coordinator.disconnect("p@y.com", "a@x.com", Some("tok")));
    assert_eq!(
        stored_link(&store),
        (Some("p@y.com".to_string()), Some("a@x.com".to_string()))
    );
}

#[test]
fn confirmed_negative_clears_both_sides() {
    let store = linked_store();
    let authority = ScriptedAuthority::new(VerificationResult::NotExists, true);
    let coordinator = coordinator(store.clone(), authority.clone());

    assert!(coordinator.disconnect("p@y.com", "a@x.com", Some("tok")));
    assert_eq!(stored_link(&store), (None, None));
    assert_eq!(authority.unlink_calls.load(Ordering::SeqCst), 1);

    // The rest of each record survives the unlink.
    let patient: PatientRecord = read_record(store.as_ref(), &keys::patient("p@y.com"))
        .unwrap()
        .expect("patient record");
    assert_eq!(patient.name.as_deref(), Some("Pat"));
}

#[test]
fn failed_remote_notify_does_not_block_local_cleanup() {
    let store = linked_store();
    let authority = ScriptedAuthority::new(VerificationResult::NotExists, false);
    let coordinator = coordinator(store.clone(), authority.clone());

    assert!(coordinator.disconnect("p@y.com", "a@x.com", Some("tok")));
    assert_eq!(stored_link(&store), (None, None));
    assert_eq!(authority.unlink_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn disconnect_without_local_records_still_succeeds() {
    let store = Arc::new(MemoryStore::new());
    let authority = ScriptedAuthority::new(VerificationResult::NotExists, true);
    let coordinator = coordinator(store.clone(), authority);

    // Nothing stored locally: cleanup has nothing to do but the confirmed
    // negative still reports success so callers can finish their own
    // cleanup.
    assert!(coordinator.disconnect("p@y.com", "a@x.com", None));
    assert!(store.is_empty());
}
