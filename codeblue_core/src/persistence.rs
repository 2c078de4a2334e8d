//! Session persistence: resumable snapshot and history.
//!
//! One resumable snapshot exists at a time, written after every committed
//! change and cleared when the episode ends. Completed episodes become
//! [`HistoryRecord`]s. Storage failures are logged and swallowed here; the
//! in-memory session stays authoritative.

use crate::arrest::ArrestMachine;
use crate::bradytachy::BradyTachyMachine;
use crate::config::{Config, StorageConfig};
use crate::crypto::{self, EncryptedStore};
use crate::store::{FileStore, KeyValueStore};
use crate::timer::TimerState;
use crate::types::{
    ArrestPhase, BradyTachyOutcome, BradyTachyPhase, BradyTachySession, Session, SessionType,
};
use crate::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

pub const SNAPSHOT_KEY: &str = "resumable_session";
pub const HISTORY_KEY: &str = "session_history";
pub const SCHEMA_VERSION: u32 = 1;

// ============================================================================
// Records
// ============================================================================

/// Protocol-specific body of a resumable snapshot
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum SnapshotBody {
    Arrest { session: Session, timer: TimerState },
    Bradytachy { session: BradyTachySession },
}

/// Versioned envelope for the resumable snapshot
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub schema_version: u32,
    pub saved_at: DateTime<Utc>,
    pub body: SnapshotBody,
}

impl Snapshot {
    pub fn arrest(machine: &ArrestMachine, now: DateTime<Utc>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            saved_at: now,
            body: SnapshotBody::Arrest {
                session: machine.session().clone(),
                timer: machine.timer().clone(),
            },
        }
    }

    pub fn bradytachy(machine: &BradyTachyMachine, now: DateTime<Utc>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            saved_at: now,
            body: SnapshotBody::Bradytachy {
                session: machine.session().clone(),
            },
        }
    }

    pub fn session_id(&self) -> Uuid {
        match &self.body {
            SnapshotBody::Arrest { session, .. } => session.id,
            SnapshotBody::Bradytachy { session } => session.id,
        }
    }

    /// Only live, structurally sound sessions are resumable
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(format!("unsupported schema version {}", self.schema_version));
        }
        match &self.body {
            SnapshotBody::Arrest { session, .. } => {
                session.validate()?;
                if session.phase.is_terminal() {
                    return Err("session already ended".into());
                }
            }
            SnapshotBody::Bradytachy { session } => {
                session.validate()?;
                if session.phase == BradyTachyPhase::SessionEnded {
                    return Err("session already ended".into());
                }
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "protocol", content = "session", rename_all = "snake_case")]
pub enum HistoryEntry {
    Arrest(Session),
    Bradytachy(BradyTachySession),
}

/// One completed episode
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub schema_version: u32,
    pub session_type: SessionType,
    pub saved_at: DateTime<Utc>,
    pub entry: HistoryEntry,
}

impl HistoryRecord {
    pub fn arrest(session: &Session, now: DateTime<Utc>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            session_type: session.session_type(),
            saved_at: now,
            entry: HistoryEntry::Arrest(session.clone()),
        }
    }

    pub fn bradytachy(session: &BradyTachySession, now: DateTime<Utc>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            session_type: SessionType::Bradytachy,
            saved_at: now,
            entry: HistoryEntry::Bradytachy(session.clone()),
        }
    }

    pub fn id(&self) -> Uuid {
        match &self.entry {
            HistoryEntry::Arrest(s) => s.id,
            HistoryEntry::Bradytachy(s) => s.id,
        }
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        match &self.entry {
            HistoryEntry::Arrest(s) => s.timeline_origin(),
            HistoryEntry::Bradytachy(s) => s.start_time,
        }
    }
}

impl ArrestMachine {
    /// History record for the current session
    pub fn export(&self, now: DateTime<Utc>) -> HistoryRecord {
        HistoryRecord::arrest(self.session(), now)
    }
}

// ============================================================================
// Store access
// ============================================================================

pub struct Persistence<S> {
    store: S,
}

impl<S: KeyValueStore> Persistence<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn save_snapshot(&mut self, snapshot: &Snapshot) {
        let result = serde_json::to_string(snapshot)
            .map_err(crate::Error::from)
            .and_then(|json| self.store.put(SNAPSHOT_KEY, &json));
        match result {
            Ok(()) => tracing::debug!("Saved snapshot for {}", snapshot.session_id()),
            Err(e) => tracing::warn!("Failed to save snapshot: {}", e),
        }
    }

    /// The resumable snapshot, if one exists and is sound
    pub fn load_snapshot(&self) -> Option<Snapshot> {
        let raw = match self.store.get(SNAPSHOT_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!("Failed to read snapshot: {}", e);
                return None;
            }
        };
        let snapshot: Snapshot = match serde_json::from_str(&raw) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!("Discarding unreadable snapshot: {}", e);
                return None;
            }
        };
        match snapshot.validate() {
            Ok(()) => Some(snapshot),
            Err(reason) => {
                tracing::warn!("Discarding invalid snapshot: {}", reason);
                None
            }
        }
    }

    pub fn clear_snapshot(&mut self) {
        if let Err(e) = self.store.remove(SNAPSHOT_KEY) {
            tracing::warn!("Failed to clear snapshot: {}", e);
        }
    }

    /// Raw history entries; any read or parse failure is an error
    fn read_history_values(&self) -> Result<Vec<serde_json::Value>> {
        match self.store.get(HISTORY_KEY)? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    /// Stored history, skipping records that no longer parse
    pub fn load_history(&self) -> Vec<HistoryRecord> {
        let values = match self.read_history_values() {
            Ok(values) => values,
            Err(e) => {
                tracing::warn!("History is unreadable: {}", e);
                return Vec::new();
            }
        };
        values
            .into_iter()
            .enumerate()
            .filter_map(|(i, value)| match serde_json::from_value(value) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!("Skipping malformed history record {}: {}", i, e);
                    None
                }
            })
            .collect()
    }

    /// Insert a record, replacing an earlier one for the same session.
    ///
    /// Entries that do not parse are written back untouched. If the stored
    /// history cannot be read at all, nothing is written.
    pub fn write_history(&mut self, record: &HistoryRecord) -> Result<()> {
        let mut values = self.read_history_values()?;
        let value = serde_json::to_value(record)?;
        let existing = values.iter().position(|v| {
            serde_json::from_value::<HistoryRecord>(v.clone())
                .map(|r| r.id() == record.id())
                .unwrap_or(false)
        });
        match existing {
            Some(i) => values[i] = value,
            None => values.push(value),
        }
        let json = serde_json::to_string(&values)?;
        self.store.put(HISTORY_KEY, &json)?;
        tracing::info!("Wrote history record {} ({:?})", record.id(), record.session_type);
        Ok(())
    }

    pub fn clear_history(&mut self) -> Result<()> {
        self.store.remove(HISTORY_KEY)
    }
}

/// Open the configured store: files under the data dir, sealed with the
/// device key unless encryption is switched off
pub fn open(config: &Config) -> Result<Persistence<Box<dyn KeyValueStore>>> {
    let dir = &config.data.data_dir;
    let files = FileStore::new(dir);
    let store: Box<dyn KeyValueStore> = if config.storage.encrypt {
        let key = crypto::load_or_create_device_key(&dir.join(&config.storage.key_file))?;
        Box::new(EncryptedStore::new(files, &key)?)
    } else {
        tracing::warn!("Storage encryption disabled; writing plaintext to {:?}", dir);
        Box::new(files)
    };
    Ok(Persistence::new(store))
}

// ============================================================================
// Auto-save
// ============================================================================

#[derive(Debug)]
struct PendingWrite {
    due: DateTime<Utc>,
    record: HistoryRecord,
}

/// Observes committed machine state and writes what it implies
///
/// Live sessions refresh the snapshot. An episode that ends is written to
/// history once, immediately, and its snapshot is cleared. Later edits to a
/// session in post-ROSC care rewrite its record after a quiet period.
pub struct AutoSaver {
    debounce: Duration,
    pending: Option<PendingWrite>,
    saved: HashSet<Uuid>,
}

impl AutoSaver {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            debounce: config.history_debounce(),
            pending: None,
            saved: HashSet::new(),
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn has_saved(&self, session_id: Uuid) -> bool {
        self.saved.contains(&session_id)
    }

    pub fn cancel(&mut self) {
        if let Some(pending) = self.pending.take() {
            tracing::debug!("Cancelled pending history write for {}", pending.record.id());
        }
    }

    fn cancel_if_other(&mut self, session_id: Uuid) {
        if self.pending.as_ref().map_or(false, |p| p.record.id() != session_id) {
            self.cancel();
        }
    }

    /// First terminal write: durable history, then clear the snapshot
    fn finish<S: KeyValueStore>(&mut self, persistence: &mut Persistence<S>, record: HistoryRecord) {
        let id = record.id();
        match persistence.write_history(&record) {
            Ok(()) => {
                self.saved.insert(id);
                persistence.clear_snapshot();
            }
            Err(e) => tracing::warn!("Failed to write history for {}: {}", id, e),
        }
    }

    pub fn observe_arrest<S: KeyValueStore>(
        &mut self,
        persistence: &mut Persistence<S>,
        machine: &ArrestMachine,
        now: DateTime<Utc>,
    ) {
        let session = machine.session();
        self.cancel_if_other(session.id);

        match session.phase {
            ArrestPhase::PathwaySelection => {}
            ArrestPhase::Deceased => {
                if !self.has_saved(session.id) {
                    self.finish(persistence, machine.export(now));
                }
            }
            ArrestPhase::Rosc => {
                if self.has_saved(session.id) {
                    self.pending = Some(PendingWrite {
                        due: now + self.debounce,
                        record: machine.export(now),
                    });
                } else {
                    self.finish(persistence, machine.export(now));
                }
            }
            _ => persistence.save_snapshot(&Snapshot::arrest(machine, now)),
        }
    }

    pub fn observe_bradytachy<S: KeyValueStore>(
        &mut self,
        persistence: &mut Persistence<S>,
        machine: &BradyTachyMachine,
        now: DateTime<Utc>,
    ) {
        let session = machine.session();
        self.cancel_if_other(session.id);

        match (session.phase, session.outcome) {
            (BradyTachyPhase::PatientSelection, _) => {}
            (BradyTachyPhase::SessionEnded, Some(BradyTachyOutcome::SwitchedToArrest)) => {
                // The arrest session carries this timeline into its own record
                persistence.clear_snapshot();
            }
            (BradyTachyPhase::SessionEnded, _) => {
                if !self.has_saved(session.id) {
                    self.finish(persistence, HistoryRecord::bradytachy(session, now));
                }
            }
            _ => persistence.save_snapshot(&Snapshot::bradytachy(machine, now)),
        }
    }

    /// Flush the pending write once its quiet period has passed
    pub fn poll<S: KeyValueStore>(&mut self, persistence: &mut Persistence<S>, now: DateTime<Utc>) -> bool {
        match &self.pending {
            Some(pending) if pending.due <= now => self.flush(persistence),
            _ => false,
        }
    }

    /// Write the pending record now
    pub fn flush<S: KeyValueStore>(&mut self, persistence: &mut Persistence<S>) -> bool {
        let Some(pending) = self.pending.take() else {
            return false;
        };
        match persistence.write_history(&pending.record) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Failed to write history for {}: {}", pending.record.id(), e);
                false
            }
        }
    }
}
