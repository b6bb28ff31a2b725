//! Remote link verification and the disconnection it is allowed to trigger.
//!
//! The remote authority is the source of truth for whether a
//! patient-caregiver link still exists.  Network trouble must never look
//! like "the link is gone": a false disconnection is a worse failure than a
//! stale connection, so every ambiguous outcome maps to
//! [`VerificationResult::Unknown`] and `Unknown` never mutates state.
//! Only a confirmed negative is allowed to dissolve a link, and only the
//! [`DisconnectionCoordinator`] performs that mutation.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use crate::clock::Clock;
use crate::session::{CaregiverRecord, PatientRecord};
use crate::store::{keys, read_record, write_record, RecordStore};
use crate::{logging, tlog};

/// Outcome of asking the authority whether a link exists.
///
/// Conflating "unknown" with "does not exist" is the failure mode this
/// type exists to prevent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationResult {
    Exists,
    NotExists,
    Unknown,
}

impl std::fmt::Display for VerificationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VerificationResult::Exists => "exists",
            VerificationResult::NotExists => "not-exists",
            VerificationResult::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// The remote authority holding the canonical link state.
///
/// Implementations must be non-throwing: transport trouble degrades to
/// `Unknown` / `false`, never to an error the caller has to handle.
pub trait LinkAuthority: Send + Sync {
    /// Ask whether `patient_email` is still linked to the caller.
    fn check_link(&self, patient_email: &str, token: Option<&str>) -> VerificationResult;

    /// Best-effort notification that the link was dissolved locally.
    /// Returns whether the authority acknowledged it.
    fn notify_unlink(&self, patient_email: &str, caregiver_email: &str) -> bool;
}

/// HTTP implementation of [`LinkAuthority`].
///
/// Endpoint contract: POST `{base}/links/check` with
/// `{"patientEmail": ..., "token": ...}` returns `{"exists": true|false}`.
/// A 404 counts as an explicit negative; everything else ambiguous maps to
/// `Unknown`.
pub struct HttpLinkAuthority {
    base_url: String,
    agent: ureq::Agent,
}

impl HttpLinkAuthority {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            agent,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl LinkAuthority for HttpLinkAuthority {
    fn check_link(&self, patient_email: &str, token: Option<&str>) -> VerificationResult {
        let url = format!("{}/links/check", self.base_url);
        let mut body = json!({ "patientEmail": patient_email });
        if let Some(token) = token {
            body["token"] = json!(token);
        }

        let response = self.agent.post(&url).send_json(body);
        match response {
            Ok(resp) => match resp.into_json::<Value>() {
                Ok(value) => match value.get("exists").and_then(Value::as_bool) {
                    Some(true) => VerificationResult::Exists,
                    Some(false) => VerificationResult::NotExists,
                    None => {
                        tlog!(
                            "verify: no explicit exists flag for {}, treating as unknown",
                            logging::actor(patient_email)
                        );
                        VerificationResult::Unknown
                    }
                },
                Err(err) => {
                    tlog!("verify: unparseable check response: {err}");
                    VerificationResult::Unknown
                }
            },
            // An explicit "no such link" from the authority.
            Err(ureq::Error::Status(404, _)) => VerificationResult::NotExists,
            Err(ureq::Error::Status(code, _)) => {
                tlog!("verify: authority returned {code}, treating as unknown");
                VerificationResult::Unknown
            }
            Err(err) => {
                tlog!("verify: authority unreachable, treating as unknown: {err}");
                VerificationResult::Unknown
            }
        }
    }

    fn notify_unlink(&self, patient_email: &str, caregiver_email: &str) -> bool {
        let url = format!("{}/links/dissolve", self.base_url);
        let body = json!({
            "patientEmail": patient_email,
            "caregiverEmail": caregiver_email,
        });
        match self.agent.post(&url).send_json(body) {
            Ok(_) => true,
            Err(err) => {
                tlog!("disconnect: dissolve notification failed: {err}");
                false
            }
        }
    }
}

/// Applies a confirmed-negative verification to local state.
///
/// The coordinator is the only code allowed to destructively clear stored
/// link state, and it always re-confirms with the authority first.
pub struct DisconnectionCoordinator {
    store: Arc<dyn RecordStore>,
    authority: Arc<dyn LinkAuthority>,
    clock: Arc<dyn Clock>,
}

impl DisconnectionCoordinator {
    pub fn new(
        store: Arc<dyn RecordStore>,
        authority: Arc<dyn LinkAuthority>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            authority,
            clock,
        }
    }

    pub fn authority(&self) -> &Arc<dyn LinkAuthority> {
        &self.authority
    }

    /// Dissolve the link between `patient_email` and `caregiver_email`.
    ///
    /// Re-confirms with the authority; anything other than a confirmed
    /// negative leaves every record untouched and returns `false`.  Once
    /// confirmed, the remote dissolve notification is best-effort (a
    /// failure there never blocks local cleanup) and the stored link is
    /// cleared on both sides.  Store trouble during cleanup is logged and
    /// swallowed; the next write self-heals.
    pub fn disconnect(
        &self,
        patient_email: &str,
        caregiver_email: &str,
        token: Option<&str>,
    ) -> bool {
        match self.authority.check_link(patient_email, token) {
            VerificationResult::NotExists => {}
            other => {
                tlog!(
                    "disconnect: verification for {} returned {other}, keeping link",
                    logging::actor(patient_email)
                );
                return false;
            }
        }

        if !self.authority.notify_unlink(patient_email, caregiver_email) {
            tlog!("disconnect: remote not notified, continuing with local cleanup");
        }

        let now = self.clock.now_millis();
        self.clear_caregiver_side(caregiver_email, now);
        self.clear_patient_side(patient_email, now);
        tlog!(
            "disconnect: link {} <-> {} dissolved",
            logging::actor(caregiver_email),
            logging::actor(patient_email)
        );
        true
    }

    fn clear_caregiver_side(&self, caregiver_email: &str, now: u64) {
        let key = keys::caregiver(caregiver_email);
        match read_record::<CaregiverRecord>(self.store.as_ref(), &key) {
            Ok(Some(mut record)) if record.patient_email.is_some() => {
                record.patient_email = None;
                record.updated_at = now.max(record.updated_at + 1);
                if let Err(err) = write_record(self.store.as_ref(), &key, &record) {
                    tlog!("disconnect: caregiver record write failed: {err}");
                }
            }
            Ok(_) => {}
            Err(err) => tlog!("disconnect: caregiver record read failed: {err}"),
        }
    }

    fn clear_patient_side(&self, patient_email: &str, now: u64) {
        let key = keys::patient(patient_email);
        match read_record::<PatientRecord>(self.store.as_ref(), &key) {
            Ok(Some(mut record)) if record.caregiver_email.is_some() => {
                record.caregiver_email = None;
                record.updated_at = now.max(record.updated_at + 1);
                if let Err(err) = write_record(self.store.as_ref(), &key, &record) {
                    tlog!("disconnect: patient record write failed: {err}");
                }
            }
            Ok(_) => {}
            Err(err) => tlog!("disconnect: patient record read failed: {err}"),
        }
    }
}
