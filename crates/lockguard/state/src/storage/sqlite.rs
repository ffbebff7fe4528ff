//! SQLite storage for on-device persistence.
//!
//! Each trait maps to one table. Timestamps are stored as fixed-width
//! RFC 3339 strings with nanosecond precision so that they sort
//! lexically and round-trip exactly.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use lockguard_types::{
    DeviceBaseline, DiscardCause, EventId, EventKind, LockRecord, LockRecordId, LockState,
    OfflineEvent, PaymentSchedule, ReasonCode, SyncStatus,
};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Row;
use tracing::debug;
use uuid::Uuid;

use super::traits::{BaselineStore, EventStore, LockStateStore, ScheduleStore};
use crate::error::{Result, StateError};

/// SQLite-backed storage.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) a database file.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);
        Self::with_options(options, 4).await
    }

    /// Connect using a `sqlite:` URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| StateError::Storage(e.to_string()))?
            .create_if_missing(true)
            .synchronous(SqliteSynchronous::Full);
        Self::with_options(options, 4).await
    }

    /// Private in-memory database. Uses a single connection so that every
    /// query sees the same database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StateError::Storage(e.to_string()))?;
        Self::with_options(options, 1).await
    }

    async fn with_options(options: SqliteConnectOptions, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.initialize_schema().await?;
        Ok(store)
    }

    async fn initialize_schema(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS lock_records (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                lock_state TEXT NOT NULL,
                reason TEXT NOT NULL,
                tamper_type TEXT,
                created_at TEXT NOT NULL,
                resolved_at TEXT,
                permanent INTEGER NOT NULL,
                kiosk_active INTEGER NOT NULL
            );
            "#,
            r#"CREATE INDEX IF NOT EXISTS lock_records_unresolved ON lock_records(resolved_at);"#,
            r#"
            CREATE TABLE IF NOT EXISTS offline_events (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                payload TEXT NOT NULL,
                recorded_at TEXT NOT NULL,
                sync_status TEXT NOT NULL,
                synced_at TEXT,
                attempts INTEGER NOT NULL DEFAULT 0
            );
            "#,
            r#"CREATE INDEX IF NOT EXISTS offline_events_pending ON offline_events(kind, sync_status, recorded_at);"#,
            r#"
            CREATE TABLE IF NOT EXISTS queue_discards (
                kind TEXT NOT NULL,
                cause TEXT NOT NULL,
                count INTEGER NOT NULL,
                last_sequence INTEGER NOT NULL,
                last_at TEXT NOT NULL,
                PRIMARY KEY (kind, cause)
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS payment_schedule (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                data TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS device_baseline (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                revision INTEGER NOT NULL,
                data TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        ];

        for stmt in statements {
            sqlx::query(stmt).execute(&self.pool).await?;
        }

        debug!("SQLite schema initialized");
        Ok(())
    }

    /// Close the pool, flushing outstanding writes.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn encode_time(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn decode_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StateError::Corrupted(format!("bad timestamp '{}': {}", value, e)))
}

fn decode_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| StateError::Corrupted(format!("bad id '{}': {}", value, e)))
}

fn decode_reason(value: &str) -> Result<ReasonCode> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .map_err(|_| StateError::Corrupted(format!("unknown reason code '{}'", value)))
}

fn record_from_row(row: &SqliteRow) -> Result<LockRecord> {
    let id: String = row.try_get("id")?;
    let lock_state: String = row.try_get("lock_state")?;
    let reason: String = row.try_get("reason")?;
    let created_at: String = row.try_get("created_at")?;
    let resolved_at: Option<String> = row.try_get("resolved_at")?;

    Ok(LockRecord {
        id: LockRecordId::from_uuid(decode_uuid(&id)?),
        lock_state: LockState::parse(&lock_state)
            .ok_or_else(|| StateError::Corrupted(format!("unknown lock state '{}'", lock_state)))?,
        reason: decode_reason(&reason)?,
        tamper_type: row.try_get("tamper_type")?,
        created_at: decode_time(&created_at)?,
        resolved_at: resolved_at.as_deref().map(decode_time).transpose()?,
        permanent: row.try_get::<i64, _>("permanent")? != 0,
        kiosk_active: row.try_get::<i64, _>("kiosk_active")? != 0,
    })
}

fn event_from_row(row: &SqliteRow) -> Result<OfflineEvent> {
    let id: String = row.try_get("id")?;
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("sync_status")?;
    let recorded_at: String = row.try_get("recorded_at")?;
    let synced_at: Option<String> = row.try_get("synced_at")?;
    let sequence: i64 = row.try_get("sequence")?;
    let attempts: i64 = row.try_get("attempts")?;

    Ok(OfflineEvent {
        id: EventId::from_uuid(decode_uuid(&id)?),
        kind: EventKind::parse(&kind)
            .ok_or_else(|| StateError::Corrupted(format!("unknown event kind '{}'", kind)))?,
        sequence: u64::try_from(sequence)
            .map_err(|_| StateError::Corrupted(format!("negative sequence {}", sequence)))?,
        payload: row.try_get("payload")?,
        recorded_at: decode_time(&recorded_at)?,
        sync_status: SyncStatus::parse(&status)
            .ok_or_else(|| StateError::Corrupted(format!("unknown sync status '{}'", status)))?,
        synced_at: synced_at.as_deref().map(decode_time).transpose()?,
        attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
    })
}

const RECORD_COLUMNS: &str =
    "id, lock_state, reason, tamper_type, created_at, resolved_at, permanent, kiosk_active";

#[async_trait]
impl LockStateStore for SqliteStore {
    async fn current_record(&self) -> Result<Option<LockRecord>> {
        Ok(self.unresolved_records().await?.into_iter().next())
    }

    async fn unresolved_records(&self) -> Result<Vec<LockRecord>> {
        let sql = format!(
            "SELECT {} FROM lock_records WHERE resolved_at IS NULL ORDER BY seq DESC",
            RECORD_COLUMNS
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn history(&self, limit: usize) -> Result<Vec<LockRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let sql = format!(
            "SELECT {} FROM lock_records ORDER BY seq DESC LIMIT ?1",
            RECORD_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn commit_transition(
        &self,
        record: &LockRecord,
        resolved_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE lock_records SET resolved_at = ?1 WHERE resolved_at IS NULL")
            .bind(encode_time(&resolved_at))
            .execute(&mut *tx)
            .await?;

        let insert = format!(
            "INSERT INTO lock_records ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            RECORD_COLUMNS
        );
        sqlx::query(&insert)
            .bind(record.id.as_uuid().to_string())
            .bind(record.lock_state.as_str())
            .bind(record.reason.as_str())
            .bind(record.tamper_type.as_deref())
            .bind(encode_time(&record.created_at))
            .bind(record.resolved_at.as_ref().map(encode_time))
            .bind(i64::from(record.permanent))
            .bind(i64::from(record.kiosk_active))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl ScheduleStore for SqliteStore {
    async fn load_schedule(&self) -> Result<Option<PaymentSchedule>> {
        let row = sqlx::query("SELECT data FROM payment_schedule WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let data: String = row.try_get("data")?;
                Ok(Some(serde_json::from_str(&data)?))
            }
            None => Ok(None),
        }
    }

    async fn save_schedule(&self, schedule: &PaymentSchedule) -> Result<()> {
        let data = serde_json::to_string(schedule)?;
        sqlx::query(
            r#"
            INSERT INTO payment_schedule (id, data, updated_at) VALUES (1, ?1, ?2)
            ON CONFLICT(id) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at
            "#,
        )
        .bind(data)
        .bind(encode_time(&Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_schedule(&self) -> Result<()> {
        sqlx::query("DELETE FROM payment_schedule")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl BaselineStore for SqliteStore {
    async fn load_baseline(&self) -> Result<Option<DeviceBaseline>> {
        let row = sqlx::query("SELECT data FROM device_baseline WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let data: String = row.try_get("data")?;
                Ok(Some(serde_json::from_str(&data)?))
            }
            None => Ok(None),
        }
    }

    async fn establish_baseline(&self, baseline: &DeviceBaseline) -> Result<()> {
        if let Some(existing) = self.load_baseline().await? {
            return Err(StateError::BaselineExists(existing.revision));
        }

        sqlx::query(
            "INSERT INTO device_baseline (id, revision, data, updated_at) VALUES (1, ?1, ?2, ?3)",
        )
        .bind(i64::from(baseline.revision))
        .bind(serde_json::to_string(baseline)?)
        .bind(encode_time(&Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn replace_baseline(&self, baseline: &DeviceBaseline) -> Result<()> {
        let existing = self
            .load_baseline()
            .await?
            .ok_or(StateError::BaselineMissing)?;
        if baseline.revision != existing.revision + 1 {
            return Err(StateError::BaselineRevisionMismatch {
                expected: existing.revision + 1,
                actual: baseline.revision,
            });
        }

        let result = sqlx::query(
            "UPDATE device_baseline SET revision = ?1, data = ?2, updated_at = ?3 WHERE id = 1 AND revision = ?4",
        )
        .bind(i64::from(baseline.revision))
        .bind(serde_json::to_string(baseline)?)
        .bind(encode_time(&Utc::now()))
        .bind(i64::from(existing.revision))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StateError::BaselineRevisionMismatch {
                expected: existing.revision + 1,
                actual: baseline.revision,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl EventStore for SqliteStore {
    async fn append_event(&self, event: &OfflineEvent) -> Result<()> {
        let sequence = i64::try_from(event.sequence)
            .map_err(|_| StateError::Serialization(format!("sequence {} overflows", event.sequence)))?;

        sqlx::query(
            r#"
            INSERT INTO offline_events (id, kind, sequence, payload, recorded_at, sync_status, synced_at, attempts)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(event.id.as_uuid().to_string())
        .bind(event.kind.as_str())
        .bind(sequence)
        .bind(&event.payload)
        .bind(encode_time(&event.recorded_at))
        .bind(event.sync_status.as_str())
        .bind(event.synced_at.as_ref().map(encode_time))
        .bind(i64::from(event.attempts))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn pending_events(&self, kind: EventKind) -> Result<Vec<OfflineEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, kind, sequence, payload, recorded_at, sync_status, synced_at, attempts
            FROM offline_events
            WHERE kind = ?1 AND sync_status = ?2
            ORDER BY recorded_at ASC, sequence ASC
            "#,
        )
        .bind(kind.as_str())
        .bind(SyncStatus::Pending.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(event_from_row).collect()
    }

    async fn mark_synced(&self, id: &EventId, synced_at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE offline_events SET sync_status = ?1, synced_at = ?2 WHERE id = ?3",
        )
        .bind(SyncStatus::Synced.as_str())
        .bind(encode_time(&synced_at))
        .bind(id.as_uuid().to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StateError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn record_attempt(&self, id: &EventId) -> Result<u32> {
        let row = sqlx::query(
            "UPDATE offline_events SET attempts = attempts + 1 WHERE id = ?1 RETURNING attempts",
        )
        .bind(id.as_uuid().to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StateError::NotFound(id.to_string()))?;

        let attempts: i64 = row.try_get("attempts")?;
        Ok(u32::try_from(attempts).unwrap_or(u32::MAX))
    }

    async fn discard_events(
        &self,
        events: &[OfflineEvent],
        cause: DiscardCause,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for event in events {
            sqlx::query("DELETE FROM offline_events WHERE id = ?1")
                .bind(event.id.as_uuid().to_string())
                .execute(&mut *tx)
                .await?;

            sqlx::query(
                r#"
                INSERT INTO queue_discards (kind, cause, count, last_sequence, last_at)
                VALUES (?1, ?2, 1, ?3, ?4)
                ON CONFLICT(kind, cause) DO UPDATE SET
                    count = count + 1,
                    last_sequence = excluded.last_sequence,
                    last_at = excluded.last_at
                "#,
            )
            .bind(event.kind.as_str())
            .bind(cause.as_str())
            .bind(i64::try_from(event.sequence).unwrap_or(i64::MAX))
            .bind(encode_time(&at))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn discarded_count(&self, cause: DiscardCause) -> Result<u64> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(count), 0) AS total FROM queue_discards WHERE cause = ?1",
        )
        .bind(cause.as_str())
        .fetch_one(&self.pool)
        .await?;
        let total: i64 = row.try_get("total")?;
        Ok(u64::try_from(total).unwrap_or(0))
    }

    async fn purge_synced_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let result = sqlx::query(
            r#"
            DELETE FROM offline_events
            WHERE sync_status = ?1 AND synced_at < ?2
              AND sequence < (SELECT MAX(sequence) FROM offline_events)
            "#,
        )
        .bind(SyncStatus::Synced.as_str())
        .bind(encode_time(&cutoff))
        .execute(&self.pool)
        .await?;

        Ok(usize::try_from(result.rows_affected()).unwrap_or(usize::MAX))
    }

    async fn max_sequence(&self) -> Result<Option<u64>> {
        let row = sqlx::query(
            r#"
            SELECT MAX(seq) AS max_seq FROM (
                SELECT MAX(sequence) AS seq FROM offline_events
                UNION ALL
                SELECT MAX(last_sequence) AS seq FROM queue_discards
            )
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        let max: Option<i64> = row.try_get("max_seq")?;
        Ok(max.and_then(|m| u64::try_from(m).ok()))
    }
}
