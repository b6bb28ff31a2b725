//! Integration tests for the recurrence scheduler: today-instance
//! guarantees, next-day spawning on completion, and the midnight task.

use std::sync::Arc;

use chrono::NaiveDate;
use tend::clock::ManualClock;
use tend::reminders::{spawn_midnight_task, Recurrence, RecurrenceScheduler, SchedulerError};
use tend::store::MemoryStore;
use tokio::sync::watch;

const PATIENT: &str = "p@y.com";

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
}

fn setup() -> (RecurrenceScheduler, Arc<ManualClock>) {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(1_000_000, date(2026, 8, 29)));
    let scheduler = RecurrenceScheduler::new(store, clock.clone());
    (scheduler, clock)
}

fn instances_on(scheduler: &RecurrenceScheduler, day: NaiveDate) -> usize {
    scheduler
        .list(PATIENT)
        .unwrap()
        .iter()
        .filter(|r| r.date == Some(day))
        .count()
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[test]
fn add_rejects_blank_title() {
    let (scheduler, _) = setup();
    let err = scheduler
        .add_reminder(PATIENT, "   ", "08:00", Recurrence::Daily, Vec::new())
        .unwrap_err();
    assert!(matches!(err, SchedulerError::Validation(_)));
    assert!(scheduler.list(PATIENT).unwrap().is_empty());
}

#[test]
fn add_rejects_bad_time() {
    let (scheduler, _) = setup();
    let err = scheduler
        .add_reminder(PATIENT, "meds", "25:99", Recurrence::None, Vec::new())
        .unwrap_err();
    assert!(matches!(err, SchedulerError::Validation(_)));
}

#[test]
fn add_rejects_weekly_without_days() {
    let (scheduler, _) = setup();
    let err = scheduler
        .add_reminder(PATIENT, "physio", "10:00", Recurrence::Weekly, Vec::new())
        .unwrap_err();
    assert!(matches!(err, SchedulerError::Validation(_)));
}

// ---------------------------------------------------------------------------
// ensure_today
// ---------------------------------------------------------------------------

#[test]
fn ensure_today_creates_exactly_one_instance_and_is_idempotent() {
    let (scheduler, clock) = setup();
    scheduler
        .add_reminder(PATIENT, "meds", "08:00", Recurrence::Daily, Vec::new())
        .unwrap();

    // The freshly added reminder already covers today.
    assert_eq!(scheduler.ensure_today(PATIENT).unwrap(), 0);

    // Next day: one instance, then none on a repeat call.
    clock.set_date(date(2026, 8, 30));
    assert_eq!(scheduler.ensure_today(PATIENT).unwrap(), 1);
    assert_eq!(scheduler.ensure_today(PATIENT).unwrap(), 0);
    assert_eq!(instances_on(&scheduler, date(2026, 8, 30)), 1);

    // The clone links back to its template.
    let all = scheduler.list(PATIENT).unwrap();
    let template = &all[0];
    let clone = all
        .iter()
        .find(|r| r.date == Some(date(2026, 8, 30)))
        .expect("today instance");
    assert_eq!(clone.parent_reminder_id.as_deref(), Some(template.id.as_str()));
    assert!(!clone.completed);
    assert!(clone.is_persistent);
}

#[test]
fn completed_today_instance_still_counts_as_covered() {
    let (scheduler, _) = setup();
    let reminder = scheduler
        .add_reminder(PATIENT, "meds", "08:00", Recurrence::Daily, Vec::new())
        .unwrap();
    scheduler.complete(PATIENT, &reminder.id, "a@x.com").unwrap();

    // Completing created a tomorrow instance; today stays covered by the
    // completed one, so ensure_today creates nothing more.
    assert_eq!(scheduler.ensure_today(PATIENT).unwrap(), 0);
    assert_eq!(instances_on(&scheduler, date(2026, 8, 29)), 1);
}

#[test]
fn weekly_reminders_are_stored_but_never_expanded() {
    let (scheduler, clock) = setup();
    scheduler
        .add_reminder(
            PATIENT,
            "physio",
            "10:00",
            Recurrence::Weekly,
            vec!["monday".to_string(), "thursday".to_string()],
        )
        .unwrap();

    clock.set_date(date(2026, 8, 30));
    assert_eq!(scheduler.ensure_today(PATIENT).unwrap(), 0);

    let all = scheduler.list(PATIENT).unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].recurrence_days, vec!["monday", "thursday"]);
}

// ---------------------------------------------------------------------------
// complete
// ---------------------------------------------------------------------------

#[test]
fn completing_daily_spawns_exactly_one_tomorrow_instance() {
    let (scheduler, _) = setup();
    let reminder = scheduler
        .add_reminder(PATIENT, "meds", "08:00", Recurrence::Daily, Vec::new())
        .unwrap();

    scheduler.complete(PATIENT, &reminder.id, "a@x.com").unwrap();
    assert_eq!(instances_on(&scheduler, date(2026, 8, 30)), 1);

    // Re-completing is a no-op: no second spawn.
    scheduler.complete(PATIENT, &reminder.id, "a@x.com").unwrap();
    assert_eq!(instances_on(&scheduler, date(2026, 8, 30)), 1);

    let all = scheduler.list(PATIENT).unwrap();
    let done = all.iter().find(|r| r.id == reminder.id).expect("completed");
    assert!(done.completed);
    assert_eq!(done.completed_by.as_deref(), Some("a@x.com"));
    assert!(done.completed_at.is_some());
}

#[test]
fn next_day_completion_continues_the_chain() {
    let (scheduler, clock) = setup();
    let reminder = scheduler
        .add_reminder(PATIENT, "meds", "08:00", Recurrence::Daily, Vec::new())
        .unwrap();
    scheduler.complete(PATIENT, &reminder.id, "a@x.com").unwrap();
    assert_eq!(scheduler.list(PATIENT).unwrap().len(), 2);

    // Next day: the spawned instance is now "today". Completing it spawns
    // one for the day after, and only one.
    clock.set_date(date(2026, 8, 30));
    let today_instance = scheduler
        .list(PATIENT)
        .unwrap()
        .into_iter()
        .find(|r| r.date == Some(date(2026, 8, 30)))
        .expect("today instance");
    scheduler
        .complete(PATIENT, &today_instance.id, "a@x.com")
        .unwrap();
    assert_eq!(instances_on(&scheduler, date(2026, 8, 31)), 1);
    assert_eq!(scheduler.list(PATIENT).unwrap().len(), 3);
}

#[test]
fn completing_non_recurring_spawns_nothing() {
    let (scheduler, _) = setup();
    let reminder = scheduler
        .add_reminder(PATIENT, "call the clinic", "14:00", Recurrence::None, Vec::new())
        .unwrap();
    scheduler.complete(PATIENT, &reminder.id, "a@x.com").unwrap();
    assert_eq!(scheduler.list(PATIENT).unwrap().len(), 1);
}

#[test]
fn completing_unknown_id_is_a_validation_failure() {
    let (scheduler, _) = setup();
    let err = scheduler
        .complete(PATIENT, "missing", "a@x.com")
        .unwrap_err();
    assert!(matches!(err, SchedulerError::Validation(_)));
}

// ---------------------------------------------------------------------------
// Midnight task
// ---------------------------------------------------------------------------

#[tokio::test]
async fn midnight_task_reacts_to_active_patient_changes() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(1_000_000, date(2026, 8, 29)));
    let scheduler = Arc::new(RecurrenceScheduler::new(store, clock.clone()));
    scheduler
        .add_reminder(PATIENT, "meds", "08:00", Recurrence::Daily, Vec::new())
        .unwrap();
    // The template is dated yesterday from the task's point of view.
    clock.set_date(date(2026, 8, 30));

    let (tx, rx) = watch::channel(None::<String>);
    let task = spawn_midnight_task(scheduler.clone(), rx);

    // Activating a patient re-derives the working set and ensures today.
    tx.send(Some(PATIENT.to_string())).unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(
        scheduler
            .list(PATIENT)
            .unwrap()
            .iter()
            .filter(|r| r.date == Some(date(2026, 8, 30)))
            .count(),
        1
    );

    task.cancel();
}
