//! Recurring reminder expansion and the midnight rollover task.
//!
//! A reminder series is identified by `(title, time, parent-or-own-id)`.
//! Daily series are kept "one pending instance for today, at most one
//! incomplete future instance" by two operations: `ensure_today` (run at
//! startup, on active-patient change, and at local midnight) and the
//! spawn-next step inside `complete`.  Weekly recurrence is data-only: the
//! chosen days are stored and listed, never auto-expanded.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDate, NaiveTime};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::clock::Clock;
use crate::store::{keys, read_record, write_record, RecordStore, StoreError};
use crate::{logging, tlog};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recurrence {
    None,
    Daily,
    Weekly,
}

fn default_true() -> bool {
    true
}

/// One entry in a patient's reminder list.  A recurring entry doubles as the
/// template its clones link back to via `parent_reminder_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reminder {
    pub id: String,
    pub title: String,
    /// 24-hour `HH:MM`.
    pub time: String,
    pub recurrence: Recurrence,
    /// For weekly recurrence: day names, stored as given, never expanded.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recurrence_days: Vec<String>,
    #[serde(default)]
    pub date: Option<NaiveDate>,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub completed_at: Option<u64>,
    #[serde(default)]
    pub completed_by: Option<String>,
    #[serde(default)]
    pub parent_reminder_id: Option<String>,
    #[serde(default = "default_true")]
    pub is_persistent: bool,
}

impl Reminder {
    /// The id shared by every entry of a series: the parent's, or the
    /// entry's own when it is itself the template.
    pub fn series_id(&self) -> &str {
        self.parent_reminder_id.as_deref().unwrap_or(&self.id)
    }

    fn same_series(&self, other: &Reminder) -> bool {
        self.title == other.title
            && self.time == other.time
            && self.series_id() == other.series_id()
    }
}

/// Random 16-hex-char reminder id.
pub fn new_reminder_id() -> String {
    let mut bytes = [0u8; 8];
    OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum SchedulerError {
    Store(StoreError),
    Validation(String),
}

impl std::fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerError::Store(e) => write!(f, "store error: {e}"),
            SchedulerError::Validation(msg) => write!(f, "validation failed: {msg}"),
        }
    }
}

impl std::error::Error for SchedulerError {}

impl From<StoreError> for SchedulerError {
    fn from(e: StoreError) -> Self {
        SchedulerError::Store(e)
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// All scheduler state lives in the store, so the scheduler itself is freely
/// shareable behind an `Arc`.
pub struct RecurrenceScheduler {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
}

impl RecurrenceScheduler {
    pub fn new(store: Arc<dyn RecordStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// The patient's reminder list, in stored order.
    pub fn list(&self, patient_email: &str) -> Result<Vec<Reminder>, SchedulerError> {
        Ok(read_record::<Vec<Reminder>>(
            self.store.as_ref(),
            &keys::reminders(patient_email),
        )?
        .unwrap_or_default())
    }

    fn save(&self, patient_email: &str, reminders: &[Reminder]) -> Result<(), SchedulerError> {
        write_record(
            self.store.as_ref(),
            &keys::reminders(patient_email),
            &reminders,
        )?;
        Ok(())
    }

    /// Add a reminder dated today.  Missing title, an unparsable time, or a
    /// weekly recurrence without chosen days are rejected as validation
    /// failures, the one error class surfaced to direct user actions.
    pub fn add_reminder(
        &self,
        patient_email: &str,
        title: &str,
        time: &str,
        recurrence: Recurrence,
        recurrence_days: Vec<String>,
    ) -> Result<Reminder, SchedulerError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(SchedulerError::Validation(
                "reminder title is required".to_string(),
            ));
        }
        if NaiveTime::parse_from_str(time, "%H:%M").is_err() {
            return Err(SchedulerError::Validation(format!(
                "invalid reminder time: {time}"
            )));
        }
        if recurrence == Recurrence::Weekly && recurrence_days.is_empty() {
            return Err(SchedulerError::Validation(
                "weekly recurrence requires at least one day".to_string(),
            ));
        }

        let reminder = Reminder {
            id: new_reminder_id(),
            title: title.to_string(),
            time: time.to_string(),
            recurrence,
            recurrence_days,
            date: Some(self.clock.today()),
            completed: false,
            completed_at: None,
            completed_by: None,
            parent_reminder_id: None,
            is_persistent: true,
        };
        let mut all = self.list(patient_email)?;
        all.push(reminder.clone());
        self.save(patient_email, &all)?;
        tlog!(
            "reminders: added '{title}' at {time} for {}",
            logging::actor(patient_email)
        );
        Ok(reminder)
    }

    /// Guarantee that every daily series has an instance dated today.
    /// Idempotent; returns how many instances were created.
    ///
    /// A completed today-instance still counts; the series regenerates at
    /// the next midnight, not on re-check.
    pub fn ensure_today(&self, patient_email: &str) -> Result<usize, SchedulerError> {
        let today = self.clock.today();
        let mut all = self.list(patient_email)?;

        // Series that already have an entry for today, completed or not.
        let mut covered: HashSet<String> = HashSet::new();
        for reminder in &all {
            if reminder.recurrence == Recurrence::Daily && reminder.date == Some(today) {
                covered.insert(reminder.series_id().to_string());
            }
        }

        // Latest entry of each uncovered daily series acts as the template.
        let mut template_indices: Vec<usize> = Vec::new();
        for (idx, reminder) in all.iter().enumerate() {
            if reminder.recurrence != Recurrence::Daily
                || covered.contains(reminder.series_id())
            {
                continue;
            }
            match template_indices
                .iter()
                .position(|&t| all[t].same_series(reminder))
            {
                Some(slot) => {
                    if reminder.date >= all[template_indices[slot]].date {
                        template_indices[slot] = idx;
                    }
                }
                None => template_indices.push(idx),
            }
        }

        let mut created = Vec::new();
        for idx in template_indices {
            let template = &all[idx];
            let mut next = template.clone();
            next.id = new_reminder_id();
            next.date = Some(today);
            next.completed = false;
            next.completed_at = None;
            next.completed_by = None;
            next.parent_reminder_id = Some(template.series_id().to_string());
            created.push(next);
        }

        let count = created.len();
        if count > 0 {
            all.extend(created);
            self.save(patient_email, &all)?;
            tlog!(
                "reminders: created {count} instance(s) for {} today",
                logging::actor(patient_email)
            );
        }
        Ok(count)
    }

    /// Complete a reminder.  Re-completing is a no-op.  Completing a daily
    /// instance spawns exactly one tomorrow-dated clone unless an incomplete
    /// future instance already exists.
    pub fn complete(
        &self,
        patient_email: &str,
        reminder_id: &str,
        completed_by: &str,
    ) -> Result<(), SchedulerError> {
        let mut all = self.list(patient_email)?;
        let Some(idx) = all.iter().position(|r| r.id == reminder_id) else {
            return Err(SchedulerError::Validation(format!(
                "no reminder with id {reminder_id}"
            )));
        };
        if all[idx].completed {
            return Ok(());
        }

        all[idx].completed = true;
        all[idx].completed_at = Some(self.clock.now_millis());
        all[idx].completed_by = Some(completed_by.to_string());

        if all[idx].recurrence == Recurrence::Daily {
            let today = self.clock.today();
            let completed = all[idx].clone();
            let has_future_incomplete = all.iter().any(|r| {
                r.same_series(&completed)
                    && !r.completed
                    && r.date.map(|d| d > today).unwrap_or(false)
            });
            if !has_future_incomplete {
                if let Some(tomorrow) = today.succ_opt() {
                    let mut next = completed.clone();
                    next.id = new_reminder_id();
                    next.date = Some(tomorrow);
                    next.completed = false;
                    next.completed_at = None;
                    next.completed_by = None;
                    next.parent_reminder_id = Some(completed.series_id().to_string());
                    all.push(next);
                }
            }
        }

        self.save(patient_email, &all)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Midnight rollover task
// ---------------------------------------------------------------------------

/// Milliseconds from `now` until the next local midnight.
///
/// Computed in civil time; near a DST transition the task may fire an hour
/// early or late once, which is fine because it re-checks and re-arms on
/// every fire.
pub fn millis_until_next_midnight(now: DateTime<Local>) -> u64 {
    let next = now
        .date_naive()
        .succ_opt()
        .and_then(|d| d.and_hms_opt(0, 0, 0));
    match next {
        Some(next) => {
            let delta = next - now.naive_local();
            delta.num_milliseconds().max(1000) as u64
        }
        None => 86_400_000,
    }
}

/// Handle for the midnight rollover task.  Dropping it (or calling
/// [`cancel`](Self::cancel)) tears the task down deterministically.
pub struct MidnightTask {
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl MidnightTask {
    pub fn cancel(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for MidnightTask {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.handle.abort();
    }
}

/// Spawn the rollover loop: fire `ensure_today` for the active patient at
/// every local midnight, and whenever the active-patient pointer changes
/// (working-set re-derivation).  The task ends when cancelled or when the
/// watch sender side is dropped.
pub fn spawn_midnight_task(
    scheduler: Arc<RecurrenceScheduler>,
    mut active: watch::Receiver<Option<String>>,
) -> MidnightTask {
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
    let handle = tokio::spawn(async move {
        loop {
            let wait = Duration::from_millis(millis_until_next_midnight(Local::now()));
            tokio::select! {
                _ = sleep(wait) => {
                    run_rollover(&scheduler, &active);
                    // Loop re-arms for the following midnight.
                }
                changed = active.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    run_rollover(&scheduler, &active);
                }
                _ = &mut shutdown_rx => break,
            }
        }
    });
    MidnightTask {
        shutdown: Some(shutdown_tx),
        handle,
    }
}

fn run_rollover(scheduler: &RecurrenceScheduler, active: &watch::Receiver<Option<String>>) {
    let patient = active.borrow().clone();
    let Some(email) = patient else {
        return;
    };
    match scheduler.ensure_today(&email) {
        Ok(0) => {}
        Ok(count) => tlog!(
            "reminders: rollover created {count} instance(s) for {}",
            logging::actor(&email)
        ),
        Err(err) => tlog!(
            "reminders: rollover failed for {}: {err}",
            logging::actor(&email)
        ),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn next_midnight_is_positive_and_bounded() {
        let now = Local::now();
        let millis = millis_until_next_midnight(now);
        assert!(millis >= 1000);
        assert!(millis <= 86_400_000 + 3_600_000);
    }

    #[test]
    fn next_midnight_from_late_evening() {
        let evening = Local
            .with_ymd_and_hms(2026, 8, 29, 23, 59, 0)
            .single()
            .expect("valid local time");
        let millis = millis_until_next_midnight(evening);
        assert_eq!(millis, 60_000);
    }

    #[test]
    fn reminder_ids_are_distinct() {
        let a = new_reminder_id();
        let b = new_reminder_id();
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
    }
}
