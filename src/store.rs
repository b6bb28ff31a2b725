//! Per-key JSON record store shared by every engine component.
//!
//! The persistent layer is deliberately primitive: per-key get/set/remove of
//! JSON documents, no transactions, no multi-key operations.  Anything that
//! must touch two keys together (caregiver record + profile image backup
//! pointer) is best-effort and recovers at the next read.
//!
//! Two implementations: [`SqliteStore`] (a single `records` table in WAL
//! mode) for real use and [`MemoryStore`] for tests and tooling.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::tlog;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum StoreError {
    Sqlite(rusqlite::Error),
    Io(std::io::Error),
    Serde(serde_json::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Sqlite(e) => write!(f, "sqlite error: {e}"),
            StoreError::Io(e) => write!(f, "io error: {e}"),
            StoreError::Serde(e) => write!(f, "serialization error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Sqlite(e)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serde(e)
    }
}

// ---------------------------------------------------------------------------
// Key schema
// ---------------------------------------------------------------------------

/// Normalize an email for use inside a store key: trimmed, lowercase.
pub fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Key constructors for every record kind the engine persists.
pub mod keys {
    use chrono::NaiveDate;

    use super::normalize_email;

    /// The persisted "who is logged in" pointer; cleared on logout.
    pub const CURRENT_USER: &str = "currentUser";

    pub fn caregiver(email: &str) -> String {
        format!("caregiver:{}", normalize_email(email))
    }

    pub fn patient(email: &str) -> String {
        format!("patient:{}", normalize_email(email))
    }

    pub fn active_patient(caller_email: &str) -> String {
        format!("activePatient:{}", normalize_email(caller_email))
    }

    pub fn last_deactivation(caller_email: &str) -> String {
        format!("lastDeactivation:{}", normalize_email(caller_email))
    }

    pub fn home_location(actor_email: &str) -> String {
        format!("homeLocation:{}", normalize_email(actor_email))
    }

    pub fn current_location(actor_email: &str) -> String {
        format!("currentLocation:{}", normalize_email(actor_email))
    }

    pub fn reminders(patient_email: &str) -> String {
        format!("reminders:{}", normalize_email(patient_email))
    }

    pub fn location_alert(actor_email: &str, date: NaiveDate) -> String {
        format!(
            "locationAlert:{}:{}",
            normalize_email(actor_email),
            date.format("%Y-%m-%d")
        )
    }

    pub fn profile_image_backup(email: &str) -> String {
        format!("profileImageBackup:{}", normalize_email(email))
    }
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

/// Async-agnostic per-key record store.  All engine components share one
/// instance behind an `Arc`.
pub trait RecordStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;
    fn set(&self, key: &str, value: &Value) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// Read a typed record.
///
/// A missing key is not an error (`Ok(None)`).  A value that no longer
/// deserializes into `T` is logged and treated as absent; the next
/// successful write overwrites it.
pub fn read_record<T: DeserializeOwned>(
    store: &dyn RecordStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    let Some(value) = store.get(key)? else {
        return Ok(None);
    };
    match serde_json::from_value(value) {
        Ok(record) => Ok(Some(record)),
        Err(err) => {
            tlog!("store: corrupt record at {key}, treating as absent: {err}");
            Ok(None)
        }
    }
}

/// Serialize and write a typed record.
pub fn write_record<T: Serialize>(
    store: &dyn RecordStore,
    key: &str,
    record: &T,
) -> Result<(), StoreError> {
    let value = serde_json::to_value(record)?;
    store.set(key, &value)
}

// ---------------------------------------------------------------------------
// SQLite implementation
// ---------------------------------------------------------------------------

/// Record store backed by a single SQLite table.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a database at the given path. Creates schema if needed.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_schema()?;
        Ok(store)
    }

    /// Create an in-memory database, mainly for tooling and examples.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_schema()?;
        Ok(store)
    }

    fn create_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS records (
                key         TEXT PRIMARY KEY,
                value       TEXT NOT NULL,
                updated_at  INTEGER NOT NULL
            );
            ",
        )?;
        Ok(())
    }
}

impl RecordStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let raw: Option<String> = conn
            .query_row("SELECT value FROM records WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                // Corrupt at the raw layer (truncated write, external edit).
                tlog!("store: unparseable value at {key}, treating as absent: {err}");
                Ok(None)
            }
        }
    }

    fn set(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        let raw = serde_json::to_string(value)?;
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO records (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
            params![key, raw, now as i64],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM records WHERE key = ?1", params![key])?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// HashMap-backed store for tests.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RecordStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.inner.lock().unwrap().get(key).cloned())
    }

    fn set(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        self.inner
            .lock()
            .unwrap()
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.inner.lock().unwrap().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn key_schema_normalizes_emails() {
        assert_eq!(keys::caregiver("  Alice@X.Com "), "caregiver:alice@x.com");
        assert_eq!(keys::active_patient("a@x.com"), "activePatient:a@x.com");
        let date = NaiveDate::from_ymd_opt(2026, 3, 7).unwrap();
        assert_eq!(
            keys::location_alert("P@y.com", date),
            "locationAlert:p@y.com:2026-03-07"
        );
    }

    #[test]
    fn memory_roundtrip() {
        let store = MemoryStore::new();
        let sample = Sample {
            name: "water plants".to_string(),
            count: 3,
        };
        write_record(&store, "k", &sample).unwrap();
        let back: Option<Sample> = read_record(&store, "k").unwrap();
        assert_eq!(back, Some(sample));
        store.remove("k").unwrap();
        let gone: Option<Sample> = read_record(&store, "k").unwrap();
        assert!(gone.is_none());
    }

    #[test]
    fn missing_key_is_not_an_error() {
        let store = MemoryStore::new();
        let missing: Option<Sample> = read_record(&store, "nope").unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn corrupt_record_reads_as_absent() {
        let store = MemoryStore::new();
        store.set("k", &json!({ "wrong": "shape" })).unwrap();
        let back: Option<Sample> = read_record(&store, "k").unwrap();
        assert!(back.is_none());
        // Next successful write overwrites the corrupt value.
        let sample = Sample {
            name: "ok".to_string(),
            count: 1,
        };
        write_record(&store, "k", &sample).unwrap();
        let back: Option<Sample> = read_record(&store, "k").unwrap();
        assert_eq!(back, Some(sample));
    }

    #[test]
    fn sqlite_roundtrip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let sample = Sample {
            name: "call nurse".to_string(),
            count: 9,
        };
        write_record(&store, "caregiver:a@x.com", &sample).unwrap();
        let back: Option<Sample> = read_record(&store, "caregiver:a@x.com").unwrap();
        assert_eq!(back, Some(sample));
        store.remove("caregiver:a@x.com").unwrap();
        assert!(store.get("caregiver:a@x.com").unwrap().is_none());
    }
}
