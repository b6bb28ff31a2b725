//! Geofence distance, safety classification, and duplicate-suppressed alerts.
//!
//! A tracked actor has a home anchor and a stream of current location
//! samples.  The engine classifies the great-circle distance between the two
//! against a safe radius and, when the actor is outside it, sends at most
//! one alert per hour to the linked caregiver.  The suppression record is
//! persisted per actor per calendar day, but the suppression test itself is
//! time-delta based so an alert sent just before midnight still counts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::clock::{millis_to_iso8601, Clock};
use crate::session::PatientRecord;
use crate::store::{keys, read_record, write_record, RecordStore, StoreError};
use crate::{logging, tlog};

pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;
/// Inside this distance the actor counts as at home.
pub const AT_HOME_RADIUS_METERS: f64 = 50.0;
pub const DEFAULT_SAFE_RADIUS_METERS: f64 = 500.0;
/// Minimum gap between two alerts for the same actor.
pub const ALERT_SUPPRESSION_MS: u64 = 3_600_000;

// ---------------------------------------------------------------------------
// Distance and classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

/// Haversine great-circle distance in meters.
pub fn distance_meters(a: Coordinates, b: Coordinates) -> f64 {
    let lat_a = a.latitude.to_radians();
    let lat_b = b.latitude.to_radians();
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2)
        + lat_a.cos() * lat_b.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_METERS * h.sqrt().asin()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyStatus {
    AtHome,
    WithinSafeArea,
    OutsideSafeArea,
}

impl std::fmt::Display for SafetyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SafetyStatus::AtHome => "at home",
            SafetyStatus::WithinSafeArea => "within safe area",
            SafetyStatus::OutsideSafeArea => "outside safe area",
        };
        write!(f, "{s}")
    }
}

/// Classify a distance against the safe radius.  Exactly `safe_radius_m`
/// is still inside; alerts require strictly greater.
pub fn classify(distance_m: f64, safe_radius_m: f64) -> SafetyStatus {
    if distance_m < AT_HOME_RADIUS_METERS {
        SafetyStatus::AtHome
    } else if distance_m <= safe_radius_m {
        SafetyStatus::WithinSafeArea
    } else {
        SafetyStatus::OutsideSafeArea
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp_millis: u64,
    /// Provenance of a home anchor: true when a caregiver set it on the
    /// patient's behalf.  Preserved through every rewrite of the anchor.
    #[serde(default)]
    pub set_by_caregiver: bool,
}

impl LocationSample {
    pub fn coordinates(&self) -> Coordinates {
        Coordinates {
            latitude: self.latitude,
            longitude: self.longitude,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertSuppressionRecord {
    pub last_sent_millis: u64,
    pub distance_meters: f64,
}

/// What gets handed to the external notification collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertPayload {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub distance_meters: f64,
    /// ISO-8601 UTC timestamp.
    pub timestamp: String,
}

/// External mail/notification sender.  The only contract is "accept
/// payload, return success".
pub trait AlertSender: Send + Sync {
    fn send_alert(&self, payload: &AlertPayload) -> bool;
}

/// Sender that POSTs the payload as JSON to a notify endpoint.
pub struct MailAlertSender {
    url: String,
    agent: ureq::Agent,
}

impl MailAlertSender {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            url: url.into(),
            agent,
        }
    }
}

impl AlertSender for MailAlertSender {
    fn send_alert(&self, payload: &AlertPayload) -> bool {
        let body = json!({
            "to": payload.to,
            "subject": payload.subject,
            "body": payload.body,
            "distanceMeters": payload.distance_meters,
            "timestampISO8601": payload.timestamp,
        });
        match self.agent.post(&self.url).send_json(body) {
            Ok(_) => true,
            Err(err) => {
                tlog!("alert: delivery failed: {err}");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Last-known-location cache
// ---------------------------------------------------------------------------

struct CachedSample {
    sample: LocationSample,
    cached_at_millis: u64,
}

/// Fast path in front of the store for "where was this actor last seen".
/// Explicit TTL and injected clock; owned by the engine, never a global.
pub struct LocationCache {
    clock: Arc<dyn Clock>,
    ttl_ms: u64,
    inner: Mutex<HashMap<String, CachedSample>>,
}

impl LocationCache {
    pub fn new(clock: Arc<dyn Clock>, ttl_ms: u64) -> Self {
        Self {
            clock,
            ttl_ms,
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, actor_email: &str) -> Option<LocationSample> {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock().unwrap();
        match inner.get(actor_email) {
            Some(cached) if now.saturating_sub(cached.cached_at_millis) < self.ttl_ms => {
                Some(cached.sample.clone())
            }
            Some(_) => {
                inner.remove(actor_email);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, actor_email: &str, sample: LocationSample) {
        let cached = CachedSample {
            sample,
            cached_at_millis: self.clock.now_millis(),
        };
        self.inner
            .lock()
            .unwrap()
            .insert(actor_email.to_string(), cached);
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct GeofenceEngine {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    sender: Arc<dyn AlertSender>,
    safe_radius_m: f64,
    cache: LocationCache,
}

impl GeofenceEngine {
    pub fn new(
        store: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
        sender: Arc<dyn AlertSender>,
        safe_radius_m: f64,
        cache_ttl_ms: u64,
    ) -> Self {
        let cache = LocationCache::new(clock.clone(), cache_ttl_ms);
        Self {
            store,
            clock,
            sender,
            safe_radius_m,
            cache,
        }
    }

    pub fn safe_radius_m(&self) -> f64 {
        self.safe_radius_m
    }

    /// Drop every cached sample; subsequent reads fall back to the store.
    pub fn clear_location_cache(&self) {
        self.cache.clear();
    }

    /// Write the home anchor, carrying the provenance flag through.
    pub fn set_home_anchor(
        &self,
        actor_email: &str,
        coords: Coordinates,
        set_by_caregiver: bool,
    ) -> Result<(), StoreError> {
        let sample = LocationSample {
            latitude: coords.latitude,
            longitude: coords.longitude,
            timestamp_millis: self.clock.now_millis(),
            set_by_caregiver,
        };
        write_record(
            self.store.as_ref(),
            &keys::home_location(actor_email),
            &sample,
        )
    }

    pub fn home_anchor(&self, actor_email: &str) -> Result<Option<LocationSample>, StoreError> {
        read_record(self.store.as_ref(), &keys::home_location(actor_email))
    }

    /// Persist a new current sample and re-evaluate the actor.
    pub fn record_location(
        &self,
        actor_email: &str,
        coords: Coordinates,
    ) -> Result<Option<SafetyStatus>, StoreError> {
        let sample = LocationSample {
            latitude: coords.latitude,
            longitude: coords.longitude,
            timestamp_millis: self.clock.now_millis(),
            set_by_caregiver: false,
        };
        write_record(
            self.store.as_ref(),
            &keys::current_location(actor_email),
            &sample,
        )?;
        self.cache.put(actor_email, sample);
        self.evaluate(actor_email)
    }

    /// Most recent sample for the actor: cache first, store as fallback.
    pub fn current_location(
        &self,
        actor_email: &str,
    ) -> Result<Option<LocationSample>, StoreError> {
        if let Some(sample) = self.cache.get(actor_email) {
            return Ok(Some(sample));
        }
        let sample: Option<LocationSample> =
            read_record(self.store.as_ref(), &keys::current_location(actor_email))?;
        if let Some(sample) = &sample {
            self.cache.put(actor_email, sample.clone());
        }
        Ok(sample)
    }

    /// Classify the actor's position.  `None` when either the anchor or a
    /// current sample is missing.  An outside classification drives
    /// [`maybe_alert`](Self::maybe_alert).
    pub fn evaluate(&self, actor_email: &str) -> Result<Option<SafetyStatus>, StoreError> {
        let Some(home) = self.home_anchor(actor_email)? else {
            return Ok(None);
        };
        let Some(current) = self.current_location(actor_email)? else {
            return Ok(None);
        };
        let distance = distance_meters(home.coordinates(), current.coordinates());
        let status = classify(distance, self.safe_radius_m);
        if status == SafetyStatus::OutsideSafeArea {
            self.maybe_alert(actor_email, distance)?;
        }
        Ok(Some(status))
    }

    /// Send a geofence alert unless one went out for this actor within the
    /// last hour.  Returns whether a payload was delivered.  A distance
    /// within the safe radius never alerts, regardless of the caller.
    ///
    /// The check is keyed by actor identity, independent of which device
    /// observed the crossing, and looks at today's and yesterday's
    /// suppression records so the hour window spans midnight.
    pub fn maybe_alert(&self, actor_email: &str, distance_m: f64) -> Result<bool, StoreError> {
        if distance_m <= self.safe_radius_m {
            return Ok(false);
        }
        let now = self.clock.now_millis();
        let today = self.clock.today();

        let mut last_sent: Option<u64> = None;
        let mut dates = vec![today];
        if let Some(yesterday) = today.pred_opt() {
            dates.push(yesterday);
        }
        for date in dates {
            if let Some(record) = read_record::<AlertSuppressionRecord>(
                self.store.as_ref(),
                &keys::location_alert(actor_email, date),
            )? {
                last_sent = Some(
                    last_sent
                        .map(|m| m.max(record.last_sent_millis))
                        .unwrap_or(record.last_sent_millis),
                );
            }
        }
        if let Some(sent) = last_sent {
            if now.saturating_sub(sent) < ALERT_SUPPRESSION_MS {
                tlog!(
                    "geofence: alert for {} suppressed, last one {}s ago",
                    logging::actor(actor_email),
                    now.saturating_sub(sent) / 1000
                );
                return Ok(false);
            }
        }

        let caregiver = read_record::<PatientRecord>(
            self.store.as_ref(),
            &keys::patient(actor_email),
        )?
        .and_then(|p| p.caregiver_email);
        let Some(caregiver) = caregiver else {
            tlog!(
                "geofence: {} is outside the safe area but has no linked caregiver",
                logging::actor(actor_email)
            );
            return Ok(false);
        };

        let payload = AlertPayload {
            to: caregiver,
            subject: format!("{actor_email} left the safe area"),
            body: format!(
                "{actor_email} was observed {distance_m:.0} m from home, outside the {:.0} m safe radius.",
                self.safe_radius_m
            ),
            distance_meters: distance_m,
            timestamp: millis_to_iso8601(now),
        };

        if self.sender.send_alert(&payload) {
            let record = AlertSuppressionRecord {
                last_sent_millis: now,
                distance_meters: distance_m,
            };
            write_record(
                self.store.as_ref(),
                &keys::location_alert(actor_email, today),
                &record,
            )?;
            tlog!(
                "geofence: alert sent for {} ({distance_m:.0} m)",
                logging::actor(actor_email)
            );
            Ok(true)
        } else {
            tlog!(
                "geofence: alert delivery failed for {}",
                logging::actor(actor_email)
            );
            Ok(false)
        }
    }
}

// ---------------------------------------------------------------------------
// Pointer watch task
// ---------------------------------------------------------------------------

/// Handle for the cache reset task.  Dropping it (or calling
/// [`cancel`](Self::cancel)) tears the task down deterministically.
pub struct CacheResetTask {
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl CacheResetTask {
    pub fn cancel(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for CacheResetTask {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.handle.abort();
    }
}

/// Spawn a task that clears the last-known-location cache whenever the
/// active patient changes, so the next read re-derives from the store.
/// The task ends when cancelled or when the watch sender side is dropped.
pub fn spawn_cache_reset_task(
    engine: Arc<GeofenceEngine>,
    mut active: watch::Receiver<Option<String>>,
) -> CacheResetTask {
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = active.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    engine.clear_location_cache();
                    tlog!("geofence: active patient changed, location cache cleared");
                }
                _ = &mut shutdown_rx => break,
            }
        }
    });
    CacheResetTask {
        shutdown: Some(shutdown_tx),
        handle,
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use crate::clock::ManualClock;

    use super::*;

    fn point(latitude: f64, longitude: f64) -> Coordinates {
        Coordinates {
            latitude,
            longitude,
        }
    }

    #[test]
    fn distance_is_symmetric_and_zero_on_self() {
        let a = point(52.5200, 13.4050);
        let b = point(48.8566, 2.3522);
        assert_eq!(distance_meters(a, a), 0.0);
        let ab = distance_meters(a, b);
        let ba = distance_meters(b, a);
        assert!((ab - ba).abs() < 1e-6);
        // Berlin to Paris is roughly 878 km.
        assert!((ab - 878_000.0).abs() < 10_000.0);
    }

    #[test]
    fn known_vector_sits_on_alert_boundary() {
        // 0.004492 degrees of latitude is ~499.6 m: just inside the default
        // 500 m radius. A hair more tips it outside.
        let home = point(40.0, -74.0);
        let inside = point(40.004492, -74.0);
        let d = distance_meters(home, inside);
        assert!((d - 500.0).abs() < 2.0);
        assert_eq!(
            classify(d, DEFAULT_SAFE_RADIUS_METERS),
            SafetyStatus::WithinSafeArea
        );
        let outside = point(40.004540, -74.0);
        let d = distance_meters(home, outside);
        assert_eq!(
            classify(d, DEFAULT_SAFE_RADIUS_METERS),
            SafetyStatus::OutsideSafeArea
        );
    }

    #[test]
    fn classification_bands() {
        assert_eq!(classify(0.0, 500.0), SafetyStatus::AtHome);
        assert_eq!(classify(49.9, 500.0), SafetyStatus::AtHome);
        assert_eq!(classify(50.0, 500.0), SafetyStatus::WithinSafeArea);
        assert_eq!(classify(500.0, 500.0), SafetyStatus::WithinSafeArea);
        assert_eq!(classify(500.1, 500.0), SafetyStatus::OutsideSafeArea);
    }

    #[test]
    fn cache_respects_ttl() {
        let date = NaiveDate::from_ymd_opt(2026, 8, 29).unwrap();
        let clock = Arc::new(ManualClock::new(0, date));
        let cache = LocationCache::new(clock.clone(), 1000);
        let sample = LocationSample {
            latitude: 1.0,
            longitude: 2.0,
            timestamp_millis: 0,
            set_by_caregiver: false,
        };
        cache.put("p@y.com", sample.clone());
        assert_eq!(cache.get("p@y.com"), Some(sample));
        clock.advance_millis(999);
        assert!(cache.get("p@y.com").is_some());
        clock.advance_millis(1);
        assert!(cache.get("p@y.com").is_none());
    }
}
