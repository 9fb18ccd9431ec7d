//! SQLite-backed durable submission queue.
//!
//! The [`QueueStore`] is the only component that touches the queue tables.
//! Records survive process restarts; synced records are retained for audit
//! and idempotence checks. Status transitions are driven by the sync
//! engine - the store just persists them.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use crate::models::{RecordStatus, Submission, SubmissionKind, SyncableRecord};

/// SQL schema for the submission queue.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sync_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    business_key TEXT NOT NULL,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    synced_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_sync_queue_status ON sync_queue(status);
CREATE INDEX IF NOT EXISTS idx_sync_queue_created ON sync_queue(created_at);
CREATE INDEX IF NOT EXISTS idx_sync_queue_key ON sync_queue(business_key);
"#;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("corrupted data: {0}")]
    CorruptedData(String),

    #[error("record not found: {0}")]
    RecordNotFound(i64),

    #[error("queue store lock poisoned")]
    Poisoned,
}

/// Parse a status string from the database.
fn parse_status(value: &str) -> Result<RecordStatus, rusqlite::Error> {
    RecordStatus::parse(value).ok_or_else(|| corrupt(format!("invalid status '{value}'")))
}

/// Parse a submission kind string from the database.
fn parse_kind(value: &str) -> Result<SubmissionKind, rusqlite::Error> {
    SubmissionKind::parse(value).ok_or_else(|| corrupt(format!("invalid kind '{value}'")))
}

/// Parse an RFC3339 timestamp from the database.
fn parse_timestamp(value: &str, column: &str) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| corrupt(format!("invalid timestamp '{value}' in column '{column}'")))
}

fn corrupt(message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(StoreError::CorruptedData(message)),
    )
}

fn map_record(row: &rusqlite::Row<'_>) -> Result<SyncableRecord, rusqlite::Error> {
    let kind_str: String = row.get(2)?;
    let payload_str: String = row.get(3)?;
    let status_str: String = row.get(4)?;
    let created_str: String = row.get(7)?;
    let updated_str: String = row.get(8)?;
    let synced_str: Option<String> = row.get(9)?;

    let payload: Submission = serde_json::from_str(&payload_str)
        .map_err(|e| corrupt(format!("invalid payload: {e}")))?;

    Ok(SyncableRecord {
        id: row.get(0)?,
        business_key: row.get(1)?,
        kind: parse_kind(&kind_str)?,
        payload,
        status: parse_status(&status_str)?,
        retry_count: row.get(5)?,
        last_error: row.get(6)?,
        created_at: parse_timestamp(&created_str, "created_at")?,
        updated_at: parse_timestamp(&updated_str, "updated_at")?,
        synced_at: match synced_str {
            Some(s) => Some(parse_timestamp(&s, "synced_at")?),
            None => None,
        },
    })
}

const RECORD_COLUMNS: &str = "id, business_key, kind, payload, status, retry_count, \
                              last_error, created_at, updated_at, synced_at";

/// SQLite connection with submission queue operations.
pub struct QueueStore {
    conn: Mutex<Connection>,
}

impl QueueStore {
    /// Open the queue at the given path, creating and migrating if needed.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;

        // WAL so a background drain never blocks a foreground enqueue
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        conn.execute_batch(SCHEMA)?;

        // Crash recovery: a record left 'syncing' by a process killed
        // mid-submit must go back in the automatic queue, or it would
        // never drain again.
        let recovered = conn.execute(
            "UPDATE sync_queue SET status = 'pending', updated_at = ?1
             WHERE status = 'syncing'",
            params![Utc::now().to_rfc3339()],
        )?;
        if recovered > 0 {
            tracing::info!(records = recovered, "requeued records interrupted mid-sync");
        }

        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Open an in-memory queue (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Persist a new submission with status `Pending`. This is the local
    /// write that must succeed before the caller's action is considered
    /// recorded; it never touches the network.
    pub fn enqueue(&self, payload: &Submission) -> Result<SyncableRecord, StoreError> {
        let now = Utc::now();
        let payload_json = serde_json::to_string(payload)?;

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sync_queue (business_key, kind, payload, status, retry_count,
             created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6)",
            params![
                payload.business_key,
                payload.kind.as_str(),
                payload_json,
                RecordStatus::Pending.as_str(),
                now.to_rfc3339(),
                now.to_rfc3339(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);

        self.get(id)
    }

    /// Get a record by id.
    pub fn get(&self, id: i64) -> Result<SyncableRecord, StoreError> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM sync_queue WHERE id = ?1"),
                params![id],
                map_record,
            )
            .optional()?;
        record.ok_or(StoreError::RecordNotFound(id))
    }

    /// All records an automatic drain should process, oldest first.
    /// Creation order is a correctness requirement: two records for the
    /// same delivery note must reach the server in the order the courier
    /// acted.
    pub fn due_records(&self) -> Result<Vec<SyncableRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM sync_queue
             WHERE status IN ('pending', 'failed_retryable')
             ORDER BY created_at ASC, id ASC"
        ))?;
        let records = stmt
            .query_map([], map_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Records parked after exhausting retries or a definitive rejection,
    /// surfaced to the UI for manual intervention.
    pub fn permanent_failures(&self) -> Result<Vec<SyncableRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM sync_queue
             WHERE status = 'failed_permanent'
             ORDER BY created_at ASC, id ASC"
        ))?;
        let records = stmt
            .query_map([], map_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// All records for a delivery note, oldest first.
    pub fn records_for_key(&self, business_key: &str) -> Result<Vec<SyncableRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM sync_queue
             WHERE business_key = ?1
             ORDER BY created_at ASC, id ASC"
        ))?;
        let records = stmt
            .query_map(params![business_key], map_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn set_status(&self, id: i64, status: RecordStatus) -> Result<(), StoreError> {
        let changed = self.conn()?.execute(
            "UPDATE sync_queue SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, status.as_str(), Utc::now().to_rfc3339()],
        )?;
        if changed == 0 {
            return Err(StoreError::RecordNotFound(id));
        }
        Ok(())
    }

    /// Mark a record as in-flight for the current drain pass.
    pub fn mark_syncing(&self, id: i64) -> Result<(), StoreError> {
        self.set_status(id, RecordStatus::Syncing)
    }

    /// Mark a record acknowledged by the server.
    pub fn mark_synced(&self, id: i64) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let changed = self.conn()?.execute(
            "UPDATE sync_queue
             SET status = 'synced', synced_at = ?2, updated_at = ?2, last_error = NULL
             WHERE id = ?1",
            params![id, now],
        )?;
        if changed == 0 {
            return Err(StoreError::RecordNotFound(id));
        }
        Ok(())
    }

    /// Record a retryable failure: bump the retry count, keep the record
    /// eligible for automatic drains. Returns the new retry count.
    pub fn record_retryable_failure(&self, id: i64, error: &str) -> Result<u32, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE sync_queue
             SET status = 'failed_retryable', retry_count = retry_count + 1,
                 last_error = ?2, updated_at = ?3
             WHERE id = ?1",
            params![id, error, Utc::now().to_rfc3339()],
        )?;
        if changed == 0 {
            return Err(StoreError::RecordNotFound(id));
        }
        let count: u32 = conn.query_row(
            "SELECT retry_count FROM sync_queue WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Park a record as permanently failed; automatic drains skip it from
    /// here on.
    pub fn mark_permanent_failure(&self, id: i64, error: &str) -> Result<(), StoreError> {
        let changed = self.conn()?.execute(
            "UPDATE sync_queue
             SET status = 'failed_permanent', last_error = ?2, updated_at = ?3
             WHERE id = ?1",
            params![id, error, Utc::now().to_rfc3339()],
        )?;
        if changed == 0 {
            return Err(StoreError::RecordNotFound(id));
        }
        Ok(())
    }

    /// Put a permanently failed record back in the automatic queue
    /// (manual intervention from the UI). Resets the retry budget.
    pub fn requeue(&self, id: i64) -> Result<(), StoreError> {
        let changed = self.conn()?.execute(
            "UPDATE sync_queue
             SET status = 'pending', retry_count = 0, last_error = NULL, updated_at = ?2
             WHERE id = ?1 AND status = 'failed_permanent'",
            params![id, Utc::now().to_rfc3339()],
        )?;
        if changed == 0 {
            return Err(StoreError::RecordNotFound(id));
        }
        Ok(())
    }

    /// Counts per status bucket, for the observable sync snapshot.
    pub fn counts(&self) -> Result<QueueCounts, StoreError> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM sync_queue GROUP BY status")?;
        let mut counts = QueueCounts::default();
        let rows = stmt.query_map([], |row| {
            let status: String = row.get(0)?;
            // SQLite integers come back signed
            let count: i64 = row.get(1)?;
            Ok((status, count as u64))
        })?;
        for row in rows {
            let (status, count) = row?;
            match parse_status(&status)? {
                RecordStatus::Pending => counts.pending = count,
                RecordStatus::Syncing => counts.syncing = count,
                RecordStatus::Synced => counts.synced = count,
                RecordStatus::FailedRetryable => counts.retryable = count,
                RecordStatus::FailedPermanent => counts.permanent = count,
            }
        }
        Ok(counts)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueCounts {
    pub pending: u64,
    pub syncing: u64,
    pub synced: u64,
    pub retryable: u64,
    pub permanent: u64,
}

impl QueueCounts {
    /// Records still waiting to reach the server.
    pub fn outstanding(&self) -> u64 {
        self.pending + self.syncing + self.retryable
    }
}
