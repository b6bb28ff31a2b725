//! Caregiver session state: login merge, the active-patient pointer, and
//! the guards that keep pointer reactivation from flapping.
//!
//! The persisted store is the source of truth for every record; the
//! `SessionManager` keeps an in-memory view for the current session and
//! publishes changes on two channels:
//!
//! - a [`broadcast`] channel of [`SessionEvent`]s (at-least-once,
//!   order-preserving for any single subscriber), and
//! - a [`watch`] channel carrying the active patient email, consumed by the
//!   components that re-derive their working set from the pointer.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

use crate::clock::Clock;
use crate::relationship::{DisconnectionCoordinator, LinkAuthority, VerificationResult};
use crate::store::{keys, normalize_email, read_record, write_record, RecordStore, StoreError};
use crate::{logging, tlog};

/// Window after a deactivation during which the pointer may not be set again.
pub const REACTIVATION_BLOCK_MS: u64 = 3000;

const EVENT_CHANNEL_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Caregiver identity and profile.  Created on first login, mutated on every
/// profile update, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaregiverRecord {
    /// Normalized email; the record's unique key.
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub profile_image: Option<String>,
    /// The currently linked patient, if any.
    #[serde(default)]
    pub patient_email: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    /// Advances monotonically on every persisted write.
    #[serde(default)]
    pub updated_at: u64,
}

/// Patient-side view of the link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientRecord {
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub caregiver_email: Option<String>,
    #[serde(default)]
    pub updated_at: u64,
}

/// The patient currently selected for a caregiver session. Zero-or-one per
/// caregiver, persisted under `activePatient:<callerEmail>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivePatientPointer {
    pub patient_email: String,
    #[serde(default)]
    pub patient_name: Option<String>,
    pub activated_at: u64,
}

/// Timestamp of the most recent clearing of the active-patient pointer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeactivationEvent {
    pub timestamp_millis: u64,
}

/// Side-channel copy of the profile image reference, written alongside the
/// main record so the reference survives a partial or failed record write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupPointer {
    pub image_path: String,
    pub saved_at: u64,
}

/// Persisted "who is logged in" marker; removed on logout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentUserPointer {
    pub email: String,
    pub logged_in_at: u64,
}

/// What the login endpoint handed us.
#[derive(Debug, Clone, Default)]
pub struct LoginPayload {
    pub email: String,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub profile_image: Option<String>,
    /// Server-declared link; overrides whatever is stored locally.
    pub patient_email: Option<String>,
    pub token: Option<String>,
}

/// Argument to [`SessionManager::set_active_patient`].
#[derive(Debug, Clone)]
pub struct PatientSelection {
    pub email: String,
    pub name: Option<String>,
}

// ---------------------------------------------------------------------------
// Events and errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    LoggedIn { email: String },
    LoggedOut,
    ActivePatientChanged { patient_email: Option<String> },
    /// Emitted by `refresh_status` even when nothing changed.
    StatusRefreshed,
    /// The remote authority confirmed the link no longer exists and local
    /// cleanup succeeded.
    LinkDissolved { patient_email: String },
}

#[derive(Debug)]
pub enum SessionError {
    NotLoggedIn,
    /// The pointer was cleared less than [`REACTIVATION_BLOCK_MS`] ago.
    ReactivationBlocked { remaining_ms: u64 },
    /// `block_auto_reactivation` is set; no selection is accepted.
    ReactivationSuppressed,
    Validation(String),
    Store(StoreError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::NotLoggedIn => write!(f, "no caregiver is logged in"),
            SessionError::ReactivationBlocked { remaining_ms } => {
                write!(f, "reactivation blocked for another {remaining_ms} ms")
            }
            SessionError::ReactivationSuppressed => {
                write!(f, "automatic reactivation is suppressed")
            }
            SessionError::Validation(msg) => write!(f, "validation failed: {msg}"),
            SessionError::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        SessionError::Store(e)
    }
}

// ---------------------------------------------------------------------------
// Session manager
// ---------------------------------------------------------------------------

pub struct SessionManager {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    coordinator: DisconnectionCoordinator,
    current: Option<CaregiverRecord>,
    active: Option<ActivePatientPointer>,
    block_auto_reactivation: bool,
    /// Bumped on logout; a verification begun under an older generation must
    /// not apply its result.
    generation: u64,
    events: broadcast::Sender<SessionEvent>,
    active_tx: watch::Sender<Option<String>>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
        authority: Arc<dyn LinkAuthority>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (active_tx, _) = watch::channel(None);
        let coordinator =
            DisconnectionCoordinator::new(store.clone(), authority, clock.clone());
        Self {
            store,
            clock,
            coordinator,
            current: None,
            active: None,
            block_auto_reactivation: false,
            generation: 0,
            events,
            active_tx,
        }
    }

    /// Subscribe to session state changes.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Watch the active patient email.  The geofence engine and reminder
    /// scheduler re-derive their working set from this channel.
    pub fn watch_active_patient(&self) -> watch::Receiver<Option<String>> {
        self.active_tx.subscribe()
    }

    pub fn current(&self) -> Option<&CaregiverRecord> {
        self.current.as_ref()
    }

    pub fn active_patient(&self) -> Option<&ActivePatientPointer> {
        self.active.as_ref()
    }

    pub fn block_auto_reactivation(&self) -> bool {
        self.block_auto_reactivation
    }

    /// Externally settable guard that force-suppresses reactivation of the
    /// pointer regardless of elapsed time.
    pub fn set_block_auto_reactivation(&mut self, block: bool) {
        self.block_auto_reactivation = block;
    }

    fn emit(&self, event: SessionEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    fn caller_email(&self) -> Result<String, SessionError> {
        self.current
            .as_ref()
            .map(|r| r.email.clone())
            .ok_or(SessionError::NotLoggedIn)
    }

    // -- login / logout ----------------------------------------------------

    /// Log a caregiver in, merging the payload with any stored record.
    ///
    /// Merge rule: stored data wins for every profile field; the payload is
    /// authoritative only for `token` and the server-declared
    /// `patient_email`.  (A stored record stale relative to a newer remote
    /// update still wins; see DESIGN.md.)  With no stored record
    /// the payload becomes the record verbatim.  After the merge, a declared
    /// link is verified and dissolved if the authority confirms it is gone.
    pub fn login(&mut self, payload: LoginPayload) -> Result<CaregiverRecord, SessionError> {
        let email = normalize_email(&payload.email);
        if email.is_empty() {
            return Err(SessionError::Validation("email is required".to_string()));
        }

        let payload_patient = payload.patient_email.as_deref().map(normalize_email);
        let mut record = match self.load_caregiver(&email)? {
            Some(mut stored) => {
                stored.token = payload.token.clone();
                stored.patient_email = payload_patient;
                tlog!("login: merged stored record for {}", logging::actor(&email));
                stored
            }
            None => {
                tlog!("login: creating record for {}", logging::actor(&email));
                CaregiverRecord {
                    email: email.clone(),
                    name: payload.name.clone(),
                    phone: payload.phone.clone(),
                    profile_image: payload.profile_image.clone(),
                    patient_email: payload_patient,
                    token: payload.token.clone(),
                    updated_at: 0,
                }
            }
        };

        self.save_caregiver(&mut record)?;
        let pointer = CurrentUserPointer {
            email: email.clone(),
            logged_in_at: self.clock.now_millis(),
        };
        write_record(self.store.as_ref(), keys::CURRENT_USER, &pointer)?;

        self.current = Some(record);
        self.reload_pointer()?;
        self.drop_stale_pointer()?;
        self.emit(SessionEvent::LoggedIn { email });

        self.reconcile_link()?;

        self.current
            .clone()
            .ok_or(SessionError::NotLoggedIn)
    }

    /// Restore the session persisted by the last login, if any.
    pub fn resume(&mut self) -> Result<bool, SessionError> {
        let Some(pointer) =
            read_record::<CurrentUserPointer>(self.store.as_ref(), keys::CURRENT_USER)?
        else {
            return Ok(false);
        };
        let Some(record) = self.load_caregiver(&pointer.email)? else {
            return Ok(false);
        };
        self.current = Some(record);
        self.reload_pointer()?;
        self.drop_stale_pointer()?;
        Ok(true)
    }

    /// End the session.  Clears only the in-memory identity and the
    /// persisted current-user marker; the caregiver record and the
    /// active-patient pointer survive for the next login.
    pub fn logout(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        if let Err(err) = self.store.remove(keys::CURRENT_USER) {
            tlog!("logout: could not clear current-user marker: {err}");
        }
        self.current = None;
        self.active = None;
        let _ = self.active_tx.send(None);
        self.emit(SessionEvent::LoggedOut);
    }

    // -- active patient pointer --------------------------------------------

    /// Select or clear the active patient.
    ///
    /// Selection is rejected, with no state change, when no caregiver is
    /// logged in, when `block_auto_reactivation` is set, when the
    /// reactivation-block window is still open, or when the caregiver has no
    /// linked patient at all.  Clearing persists a [`DeactivationEvent`]
    /// that arms that window.
    pub fn set_active_patient(
        &mut self,
        selection: Option<PatientSelection>,
    ) -> Result<(), SessionError> {
        let caller = self.caller_email()?;
        match selection {
            Some(selection) => {
                if self.block_auto_reactivation {
                    return Err(SessionError::ReactivationSuppressed);
                }
                let linked = self
                    .current
                    .as_ref()
                    .and_then(|r| r.patient_email.clone());
                if linked.is_none() {
                    return Err(SessionError::Validation(
                        "caregiver has no linked patient".to_string(),
                    ));
                }
                let now = self.clock.now_millis();
                if let Some(event) = read_record::<DeactivationEvent>(
                    self.store.as_ref(),
                    &keys::last_deactivation(&caller),
                )? {
                    let elapsed = now.saturating_sub(event.timestamp_millis);
                    if elapsed < REACTIVATION_BLOCK_MS {
                        return Err(SessionError::ReactivationBlocked {
                            remaining_ms: REACTIVATION_BLOCK_MS - elapsed,
                        });
                    }
                }
                let pointer = ActivePatientPointer {
                    patient_email: normalize_email(&selection.email),
                    patient_name: selection.name,
                    activated_at: now,
                };
                write_record(
                    self.store.as_ref(),
                    &keys::active_patient(&caller),
                    &pointer,
                )?;
                let patient_email = pointer.patient_email.clone();
                self.active = Some(pointer);
                let _ = self.active_tx.send(Some(patient_email.clone()));
                self.emit(SessionEvent::ActivePatientChanged {
                    patient_email: Some(patient_email),
                });
                Ok(())
            }
            None => self.clear_pointer(&caller),
        }
    }

    /// Convenience for `set_active_patient(None)`.
    pub fn clear_active_patient(&mut self) -> Result<(), SessionError> {
        self.set_active_patient(None)
    }

    fn clear_pointer(&mut self, caller: &str) -> Result<(), SessionError> {
        self.store.remove(&keys::active_patient(caller))?;
        let event = DeactivationEvent {
            timestamp_millis: self.clock.now_millis(),
        };
        write_record(
            self.store.as_ref(),
            &keys::last_deactivation(caller),
            &event,
        )?;
        self.active = None;
        let _ = self.active_tx.send(None);
        self.emit(SessionEvent::ActivePatientChanged {
            patient_email: None,
        });
        Ok(())
    }

    /// Reconcile the in-memory pointer against the persisted one (the store
    /// wins) and always emit `StatusRefreshed`, even when nothing changed.
    /// Observers rely on the emission as a liveness signal after external
    /// mutation.
    pub fn refresh_status(&mut self) -> Result<(), SessionError> {
        self.reload_pointer()?;
        self.emit(SessionEvent::StatusRefreshed);
        Ok(())
    }

    fn reload_pointer(&mut self) -> Result<(), SessionError> {
        let Some(caller) = self.current.as_ref().map(|r| r.email.clone()) else {
            self.active = None;
            let _ = self.active_tx.send(None);
            return Ok(());
        };
        let pointer = read_record::<ActivePatientPointer>(
            self.store.as_ref(),
            &keys::active_patient(&caller),
        )?;
        let email = pointer.as_ref().map(|p| p.patient_email.clone());
        self.active = pointer;
        let _ = self.active_tx.send(email);
        Ok(())
    }

    /// Clear a persisted pointer that refers to a patient the caregiver is
    /// no longer linked to.  The login payload is authoritative for
    /// `patient_email`, so a pointer left behind by an earlier session must
    /// not outlive the link it referred to.  The pointer may only be
    /// non-null while the caregiver record names that same patient.
    /// Clearing goes through [`clear_pointer`](Self::clear_pointer) so it
    /// records a [`DeactivationEvent`] like any other clearing.
    fn drop_stale_pointer(&mut self) -> Result<(), SessionError> {
        let Some(pointer_patient) = self.active.as_ref().map(|p| p.patient_email.clone())
        else {
            return Ok(());
        };
        let linked = self.current.as_ref().and_then(|r| r.patient_email.clone());
        if linked.as_deref() == Some(pointer_patient.as_str()) {
            return Ok(());
        }
        let Some(caller) = self.current.as_ref().map(|r| r.email.clone()) else {
            return Ok(());
        };
        tlog!(
            "session: pointer to {} no longer matches the linked patient, clearing it",
            logging::actor(&pointer_patient)
        );
        self.clear_pointer(&caller)
    }

    // -- link maintenance ---------------------------------------------------

    /// Verify the current caregiver's declared link and dissolve it on a
    /// confirmed negative.  `Unknown` and `Exists` leave everything as is.
    pub fn reconcile_link(&mut self) -> Result<(), SessionError> {
        let Some(record) = self.current.clone() else {
            return Ok(());
        };
        let Some(patient_email) = record.patient_email.clone() else {
            return Ok(());
        };

        let generation = self.generation;
        let result = self
            .coordinator
            .authority()
            .check_link(&patient_email, record.token.as_deref());
        if self.generation != generation {
            tlog!(
                "verify: session ended mid-verification for {}, dropping result",
                logging::actor(&patient_email)
            );
            return Ok(());
        }

        match result {
            VerificationResult::NotExists => {
                let dissolved = self.coordinator.disconnect(
                    &patient_email,
                    &record.email,
                    record.token.as_deref(),
                );
                if !dissolved || self.generation != generation {
                    return Ok(());
                }
                if let Some(current) = self.current.as_mut() {
                    current.patient_email = None;
                }
                if let Some(mut current) = self.current.clone() {
                    self.save_caregiver(&mut current)?;
                    self.current = Some(current);
                }
                let pointed_here = self
                    .active
                    .as_ref()
                    .map(|p| p.patient_email == patient_email)
                    .unwrap_or(false);
                if pointed_here {
                    let caller = record.email.clone();
                    self.clear_pointer(&caller)?;
                }
                self.emit(SessionEvent::LinkDissolved { patient_email });
            }
            VerificationResult::Exists | VerificationResult::Unknown => {}
        }
        Ok(())
    }

    /// Link the current caregiver to a patient, writing both sides.
    pub fn link_patient(
        &mut self,
        patient_email: &str,
        patient_name: Option<String>,
    ) -> Result<(), SessionError> {
        let caller = self.caller_email()?;
        let patient_email = normalize_email(patient_email);
        if patient_email.is_empty() {
            return Err(SessionError::Validation(
                "patient email is required".to_string(),
            ));
        }
        let now = self.clock.now_millis();

        let key = keys::patient(&patient_email);
        let mut patient = read_record::<PatientRecord>(self.store.as_ref(), &key)?
            .unwrap_or(PatientRecord {
                email: patient_email.clone(),
                name: None,
                caregiver_email: None,
                updated_at: 0,
            });
        if patient_name.is_some() {
            patient.name = patient_name;
        }
        patient.caregiver_email = Some(caller);
        patient.updated_at = now.max(patient.updated_at + 1);
        write_record(self.store.as_ref(), &key, &patient)?;

        if let Some(current) = self.current.as_mut() {
            current.patient_email = Some(patient_email);
        }
        if let Some(mut current) = self.current.clone() {
            self.save_caregiver(&mut current)?;
            self.current = Some(current);
        }
        Ok(())
    }

    // -- profile -----------------------------------------------------------

    /// Apply profile field updates to the stored record.  `None` fields are
    /// left untouched.
    pub fn update_profile(
        &mut self,
        name: Option<String>,
        phone: Option<String>,
        profile_image: Option<String>,
    ) -> Result<(), SessionError> {
        self.caller_email()?;
        if let Some(current) = self.current.as_mut() {
            if name.is_some() {
                current.name = name;
            }
            if phone.is_some() {
                current.phone = phone;
            }
            if profile_image.is_some() {
                current.profile_image = profile_image;
            }
        }
        if let Some(mut current) = self.current.clone() {
            self.save_caregiver(&mut current)?;
            self.current = Some(current);
        }
        Ok(())
    }

    // -- record persistence -------------------------------------------------

    /// Persist the caregiver record with a monotonic `updated_at` bump, and
    /// mirror the profile image reference into its backup pointer.  The
    /// backup write is best-effort: a failure is logged and never propagated.
    fn save_caregiver(&self, record: &mut CaregiverRecord) -> Result<(), SessionError> {
        let now = self.clock.now_millis();
        record.updated_at = now.max(record.updated_at + 1);
        write_record(self.store.as_ref(), &keys::caregiver(&record.email), record)?;
        if let Some(image) = &record.profile_image {
            let backup = BackupPointer {
                image_path: image.clone(),
                saved_at: now,
            };
            if let Err(err) = write_record(
                self.store.as_ref(),
                &keys::profile_image_backup(&record.email),
                &backup,
            ) {
                tlog!(
                    "session: backup pointer write failed for {}: {err}",
                    logging::actor(&record.email)
                );
            }
        }
        Ok(())
    }

    /// Load a caregiver record, recovering a lost profile image reference
    /// from the backup pointer when the main record's copy is missing.
    fn load_caregiver(&self, email: &str) -> Result<Option<CaregiverRecord>, SessionError> {
        let Some(mut record) =
            read_record::<CaregiverRecord>(self.store.as_ref(), &keys::caregiver(email))?
        else {
            return Ok(None);
        };
        if record.profile_image.is_none() {
            if let Some(backup) = read_record::<BackupPointer>(
                self.store.as_ref(),
                &keys::profile_image_backup(email),
            )? {
                tlog!(
                    "session: recovered profile image reference for {} from backup",
                    logging::actor(email)
                );
                record.profile_image = Some(backup.image_path);
            }
        }
        Ok(Some(record))
    }
}
