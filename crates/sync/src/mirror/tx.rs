//! Operations available inside a mirror transaction.

use chrono::{DateTime, Duration, Utc};
use mercato_core::{DomainError, RecordId, SessionId};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, Transaction};

use super::schema::RECORD_COLUMNS;
use crate::entity::RowQuery;
use crate::error::StorageError;
use crate::remote::RemoteRow;
use crate::types::{
    ConflictPolicy, EntityKind, Payload, RecordRef, SessionError, SyncSession, SyncState, SyncTrigger, SyncableRecord,
    decode_ts, encode_ts, now_micros,
};

/// An open mirror transaction. Obtained from [`super::MirrorStore::with_transaction`].
pub struct MirrorTx {
    tx: Transaction<'static, Sqlite>,
}

/// What a pull batch did to the mirror.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Rows inserted or overwritten with the remote value.
    pub applied: u64,
    /// Rows kept as they were (local newer, conflict, or already current).
    pub kept_local: u64,
    /// Remote rows that could not be stored.
    pub errors: Vec<SessionError>,
}

impl MirrorTx {
    pub(super) fn new(tx: Transaction<'static, Sqlite>) -> Self {
        Self { tx }
    }

    pub(super) async fn commit(self) -> Result<(), StorageError> {
        self.tx.commit().await?;
        Ok(())
    }

    pub(super) async fn rollback(self) -> Result<(), StorageError> {
        self.tx.rollback().await?;
        Ok(())
    }

    fn conn(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }

    /// Insert a new local record as `pending_create`.
    ///
    /// The primary key is taken from the payload's `id` field, or generated
    /// and written into the payload when absent.
    pub async fn insert(&mut self, kind: EntityKind, mut payload: Payload) -> Result<SyncableRecord, StorageError> {
        let id = match payload.get("id") {
            Some(Value::String(raw)) => raw.parse::<RecordId>()?,
            Some(other) => {
                return Err(DomainError::validation(format!("{kind}: id must be a string, got {other}")).into());
            }
            None => {
                let id = RecordId::new();
                payload.insert("id".into(), Value::String(id.to_string()));
                id
            }
        };

        let record_ref = RecordRef::new(kind, id);
        if self.fetch(record_ref).await?.is_some() {
            return Err(StorageError::Duplicate(record_ref));
        }

        let record = SyncableRecord {
            kind,
            id,
            payload,
            sync_state: SyncState::PendingCreate,
            local_mutated_at: now_micros(),
            remote_updated_at: None,
            deleted: false,
        };
        self.write_row(&record, true).await?;

        tracing::debug!(record = %record_ref, "inserted local record");
        Ok(record)
    }

    /// Shallow-merge `patch` into a visible record and mark it for push.
    pub async fn update_payload(&mut self, record_ref: RecordRef, patch: Payload) -> Result<SyncableRecord, StorageError> {
        let mut record = self.get(record_ref).await?.ok_or(StorageError::NotFound(record_ref))?;

        for (field, value) in patch {
            if field == "id" {
                if value != Value::String(record.id.to_string()) {
                    return Err(DomainError::validation(format!("{record_ref}: primary key cannot change")).into());
                }
                continue;
            }
            record.payload.insert(field, value);
        }

        record.sync_state = match record.sync_state {
            SyncState::PendingCreate => SyncState::PendingCreate,
            SyncState::Conflict => SyncState::Conflict,
            _ => SyncState::PendingUpdate,
        };
        record.local_mutated_at = next_mutation_time(record.local_mutated_at);
        self.write_row(&record, false).await?;

        Ok(record)
    }

    /// Soft-delete a visible record, leaving a tombstone to push.
    pub async fn soft_delete(&mut self, record_ref: RecordRef) -> Result<SyncableRecord, StorageError> {
        let mut record = self.get(record_ref).await?.ok_or(StorageError::NotFound(record_ref))?;

        record.deleted = true;
        if record.sync_state != SyncState::Conflict {
            record.sync_state = SyncState::PendingDelete;
        }
        record.local_mutated_at = next_mutation_time(record.local_mutated_at);
        self.write_row(&record, false).await?;

        tracing::debug!(record = %record_ref, "soft-deleted local record");
        Ok(record)
    }

    /// A visible (not soft-deleted) record.
    pub async fn get(&mut self, record_ref: RecordRef) -> Result<Option<SyncableRecord>, StorageError> {
        Ok(self.fetch(record_ref).await?.filter(|r| !r.deleted))
    }

    /// A record including tombstones.
    pub async fn fetch(&mut self, record_ref: RecordRef) -> Result<Option<SyncableRecord>, StorageError> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM {} WHERE id = ?1", record_ref.kind.table());
        let row = sqlx::query(&sql)
            .bind(record_ref.id.to_string())
            .fetch_optional(self.conn())
            .await?;

        row.map(|row| decode_record(record_ref.kind, &row)).transpose()
    }

    /// Visible records matching `query`, ordered by occurrence then id.
    pub async fn query(&mut self, query: &RowQuery) -> Result<Vec<SyncableRecord>, StorageError> {
        if query.is_empty_selection() {
            return Ok(Vec::new());
        }

        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {RECORD_COLUMNS} FROM {} WHERE deleted = 0",
            query.kind.table()
        ));

        if let Some(range) = &query.occurred_in {
            qb.push(" AND occurred_at >= ")
                .push_bind(encode_ts(range.start))
                .push(" AND occurred_at < ")
                .push_bind(encode_ts(range.end));
        }
        if let Some(actor) = query.actor {
            qb.push(" AND actor_id = ").push_bind(actor.to_string());
        }
        if let Some(parents) = &query.parent_ids {
            qb.push(" AND parent_id IN (");
            let mut separated = qb.separated(", ");
            for parent in parents {
                separated.push_bind(parent.to_string());
            }
            separated.push_unseparated(")");
        }
        if let Some(ids) = &query.ids {
            qb.push(" AND id IN (");
            let mut separated = qb.separated(", ");
            for id in ids {
                separated.push_bind(id.to_string());
            }
            separated.push_unseparated(")");
        }
        qb.push(" ORDER BY occurred_at, id");

        let rows = qb.build().fetch_all(self.conn()).await?;
        rows.iter().map(|row| decode_record(query.kind, row)).collect()
    }

    /// Pending rows of one table (tombstones included), oldest mutation first.
    pub async fn pending(&mut self, kind: EntityKind) -> Result<Vec<SyncableRecord>, StorageError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM {} \
             WHERE sync_state IN ('pending_create', 'pending_update', 'pending_delete') \
             ORDER BY local_mutated_at, id",
            kind.table()
        );
        let rows = sqlx::query(&sql).fetch_all(self.conn()).await?;
        rows.iter().map(|row| decode_record(kind, row)).collect()
    }

    /// Number of rows waiting to be pushed, across all tables.
    pub async fn pending_count(&mut self) -> Result<u64, StorageError> {
        self.count_where("sync_state IN ('pending_create', 'pending_update', 'pending_delete')")
            .await
    }

    /// Rows the remote store rejected, across all tables.
    pub async fn conflicts(&mut self) -> Result<Vec<SyncableRecord>, StorageError> {
        let mut out = Vec::new();
        for kind in EntityKind::ALL {
            let sql = format!(
                "SELECT {RECORD_COLUMNS} FROM {} WHERE sync_state = 'conflict' ORDER BY local_mutated_at, id",
                kind.table()
            );
            let rows = sqlx::query(&sql).fetch_all(self.conn()).await?;
            for row in &rows {
                out.push(decode_record(kind, row)?);
            }
        }
        Ok(out)
    }

    /// Outbox state of a row, tombstones included.
    pub async fn sync_state_of(&mut self, record_ref: RecordRef) -> Result<Option<SyncState>, StorageError> {
        Ok(self.fetch(record_ref).await?.map(|r| r.sync_state))
    }

    /// Confirm a push. Only applies while the row is still pending and has not
    /// been mutated since `read_mutated_at`; returns whether it applied.
    pub async fn mark_synced(
        &mut self,
        record_ref: RecordRef,
        read_mutated_at: DateTime<Utc>,
        remote_updated_at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let sql = format!(
            "UPDATE {} SET sync_state = 'synced', remote_updated_at = ?3 \
             WHERE id = ?1 AND local_mutated_at = ?2 \
             AND sync_state IN ('pending_create', 'pending_update', 'pending_delete')",
            record_ref.kind.table()
        );
        let result = sqlx::query(&sql)
            .bind(record_ref.id.to_string())
            .bind(encode_ts(read_mutated_at))
            .bind(encode_ts(remote_updated_at))
            .execute(self.conn())
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Park a rejected row until someone requeues it.
    pub async fn mark_conflict(&mut self, record_ref: RecordRef) -> Result<bool, StorageError> {
        let sql = format!(
            "UPDATE {} SET sync_state = 'conflict' \
             WHERE id = ?1 AND sync_state IN ('pending_create', 'pending_update', 'pending_delete')",
            record_ref.kind.table()
        );
        let result = sqlx::query(&sql)
            .bind(record_ref.id.to_string())
            .execute(self.conn())
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Move a conflict row back into the outbox.
    pub async fn requeue_conflict(&mut self, record_ref: RecordRef) -> Result<SyncableRecord, StorageError> {
        let mut record = self.fetch(record_ref).await?.ok_or(StorageError::NotFound(record_ref))?;
        if record.sync_state != SyncState::Conflict {
            return Err(StorageError::NotInConflict(record_ref));
        }

        record.sync_state = if record.deleted {
            SyncState::PendingDelete
        } else {
            SyncState::PendingUpdate
        };
        record.local_mutated_at = next_mutation_time(record.local_mutated_at);
        self.write_row(&record, false).await?;

        tracing::info!(record = %record_ref, "requeued conflict");
        Ok(record)
    }

    /// Apply one pull batch according to `policy`.
    ///
    /// Synced rows take the remote value unless they already hold it. Pending
    /// rows take it under remote-wins, or under last-writer-wins when the remote
    /// change is strictly newer than the local one. Conflict rows are never
    /// touched.
    pub async fn merge_remote(
        &mut self,
        kind: EntityKind,
        rows: &[RemoteRow],
        policy: ConflictPolicy,
    ) -> Result<MergeOutcome, StorageError> {
        let mut outcome = MergeOutcome::default();

        for row in rows {
            let record_ref = RecordRef::new(kind, row.id);
            let local = self.fetch(record_ref).await?;

            let take_remote = match &local {
                None => !row.deleted,
                Some(local) => match local.sync_state {
                    SyncState::Conflict => false,
                    SyncState::Synced => local.remote_updated_at != Some(row.updated_at),
                    _ => match policy {
                        ConflictPolicy::RemoteWins => true,
                        ConflictPolicy::LastWriterWins => row.updated_at > local.local_mutated_at,
                    },
                },
            };

            if !take_remote {
                outcome.kept_local += 1;
                continue;
            }

            let mut payload = row.payload.clone();
            payload.insert("id".into(), Value::String(row.id.to_string()));

            let record = SyncableRecord {
                kind,
                id: row.id,
                payload,
                sync_state: SyncState::Synced,
                local_mutated_at: local.as_ref().map_or(row.updated_at, |l| l.local_mutated_at),
                remote_updated_at: Some(row.updated_at),
                deleted: row.deleted,
            };

            match self.write_row(&record, local.is_none()).await {
                Ok(()) => outcome.applied += 1,
                Err(StorageError::Invalid(err)) => {
                    tracing::warn!(record = %record_ref, error = %err, "skipping invalid remote row");
                    outcome.errors.push(SessionError {
                        record: record_ref,
                        reason: err.to_string(),
                    });
                }
                Err(err) => return Err(err),
            }
        }

        Ok(outcome)
    }

    /// High-water mark of the last committed pull for `kind`.
    pub async fn watermark(&mut self, kind: EntityKind) -> Result<Option<DateTime<Utc>>, StorageError> {
        let row = sqlx::query("SELECT watermark FROM mirror_tables WHERE table_name = ?1")
            .bind(kind.table())
            .fetch_optional(self.conn())
            .await?;

        let raw: Option<String> = match row {
            Some(row) => row.try_get("watermark")?,
            None => None,
        };
        raw.as_deref().map(decode_ts).transpose()
    }

    /// Move the watermark forward to `to`; never moves it back.
    pub async fn advance_watermark(&mut self, kind: EntityKind, to: DateTime<Utc>) -> Result<DateTime<Utc>, StorageError> {
        sqlx::query(
            r#"
            UPDATE mirror_tables
            SET watermark = ?2
            WHERE table_name = ?1
              AND (watermark IS NULL OR watermark < ?2)
            "#,
        )
        .bind(kind.table())
        .bind(encode_ts(to))
        .execute(self.conn())
        .await?;

        self.watermark(kind)
            .await?
            .ok_or_else(|| StorageError::Corrupt(format!("no mirror_tables row for {kind}")))
    }

    pub async fn conflict_policy(&mut self, kind: EntityKind) -> Result<ConflictPolicy, StorageError> {
        let row = sqlx::query("SELECT conflict_policy FROM mirror_tables WHERE table_name = ?1")
            .bind(kind.table())
            .fetch_optional(self.conn())
            .await?;

        match row {
            None => Ok(ConflictPolicy::default()),
            Some(row) => {
                let raw: String = row.try_get("conflict_policy")?;
                raw.parse()
                    .map_err(|_| StorageError::Corrupt(format!("conflict policy '{raw}' for {kind}")))
            }
        }
    }

    pub async fn set_conflict_policy(&mut self, kind: EntityKind, policy: ConflictPolicy) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO mirror_tables (table_name, conflict_policy)
            VALUES (?1, ?2)
            ON CONFLICT(table_name) DO UPDATE SET conflict_policy = excluded.conflict_policy
            "#,
        )
        .bind(kind.table())
        .bind(policy.as_str())
        .execute(self.conn())
        .await?;
        Ok(())
    }

    /// Remove synced tombstones last mutated before `older_than`.
    pub async fn purge_tombstones(&mut self, older_than: DateTime<Utc>) -> Result<u64, StorageError> {
        let cutoff = encode_ts(older_than);
        let mut purged = 0;
        for kind in EntityKind::ALL {
            let sql = format!(
                "DELETE FROM {} WHERE deleted = 1 AND sync_state = 'synced' AND local_mutated_at < ?1",
                kind.table()
            );
            purged += sqlx::query(&sql).bind(cutoff.clone()).execute(self.conn()).await?.rows_affected();
        }
        Ok(purged)
    }

    /// Append a finished session to the sync log.
    pub async fn record_session(&mut self, session: &SyncSession) -> Result<(), StorageError> {
        let errors = serde_json::to_string(&session.errors)
            .map_err(|e| StorageError::Corrupt(format!("unserializable session errors: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO sync_sessions (
                id,
                trigger_kind,
                started_at,
                completed_at,
                records_pushed,
                records_pulled,
                records_deferred,
                interrupted,
                errors
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(session.id.to_string())
        .bind(session.trigger.as_str())
        .bind(encode_ts(session.started_at))
        .bind(session.completed_at.map(encode_ts))
        .bind(session.records_pushed as i64)
        .bind(session.records_pulled as i64)
        .bind(session.records_deferred as i64)
        .bind(session.interrupted)
        .bind(errors)
        .execute(self.conn())
        .await?;
        Ok(())
    }

    /// Most recent sessions first.
    pub async fn recent_sessions(&mut self, limit: u32) -> Result<Vec<SyncSession>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT id, trigger_kind, started_at, completed_at, records_pushed,
                   records_pulled, records_deferred, interrupted, errors
            FROM sync_sessions
            ORDER BY started_at DESC
            LIMIT ?1
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(self.conn())
        .await?;

        rows.iter().map(decode_session).collect()
    }

    /// Delete all synced data and reset watermarks.
    pub(super) async fn clear_synced(&mut self) -> Result<u64, StorageError> {
        let unsynced = self.count_where("sync_state != 'synced'").await?;
        if unsynced > 0 {
            return Err(StorageError::UnsyncedChanges(unsynced));
        }

        let mut removed = 0;
        for kind in EntityKind::ALL {
            let sql = format!("DELETE FROM {}", kind.table());
            removed += sqlx::query(&sql).execute(self.conn()).await?.rows_affected();
        }
        sqlx::query("UPDATE mirror_tables SET watermark = NULL")
            .execute(self.conn())
            .await?;
        Ok(removed)
    }

    async fn count_where(&mut self, predicate: &str) -> Result<u64, StorageError> {
        let mut total = 0u64;
        for kind in EntityKind::ALL {
            let sql = format!("SELECT COUNT(*) AS n FROM {} WHERE {predicate}", kind.table());
            let n: i64 = sqlx::query(&sql).fetch_one(self.conn()).await?.try_get("n")?;
            total += n as u64;
        }
        Ok(total)
    }

    /// Insert or overwrite a row, recomputing the projection columns.
    async fn write_row(&mut self, record: &SyncableRecord, fresh: bool) -> Result<(), StorageError> {
        let projection = record.kind.spec().project(&record.payload)?;
        let payload = Value::Object(record.payload.clone()).to_string();

        let sql = if fresh {
            format!(
                "INSERT INTO {} ({RECORD_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                record.kind.table()
            )
        } else {
            format!(
                "UPDATE {} SET occurred_at = ?2, amount_cents = ?3, actor_id = ?4, parent_id = ?5, \
                 payload = ?6, sync_state = ?7, local_mutated_at = ?8, remote_updated_at = ?9, deleted = ?10 \
                 WHERE id = ?1",
                record.kind.table()
            )
        };

        sqlx::query(&sql)
            .bind(record.id.to_string())
            .bind(projection.occurred_at.map(encode_ts))
            .bind(projection.amount_cents)
            .bind(projection.actor_id.map(|id| id.to_string()))
            .bind(projection.parent_id.map(|id| id.to_string()))
            .bind(payload)
            .bind(record.sync_state)
            .bind(encode_ts(record.local_mutated_at))
            .bind(record.remote_updated_at.map(encode_ts))
            .bind(record.deleted)
            .execute(self.conn())
            .await?;
        Ok(())
    }
}

/// Mutation stamps strictly increase per row so a stale `mark_synced` never matches.
fn next_mutation_time(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = now_micros();
    if now > previous {
        now
    } else {
        previous + Duration::microseconds(1)
    }
}

fn decode_record(kind: EntityKind, row: &SqliteRow) -> Result<SyncableRecord, StorageError> {
    let id_str: String = row.try_get("id")?;
    let id = id_str
        .parse::<RecordId>()
        .map_err(|e| StorageError::Corrupt(format!("{kind}.id '{id_str}': {e}")))?;

    let payload_str: String = row.try_get("payload")?;
    let payload = match serde_json::from_str::<Value>(&payload_str) {
        Ok(Value::Object(map)) => map,
        Ok(_) | Err(_) => return Err(StorageError::Corrupt(format!("{kind}/{id}: payload is not a JSON object"))),
    };

    let sync_state: SyncState = row.try_get("sync_state")?;
    let mutated_str: String = row.try_get("local_mutated_at")?;
    let remote_str: Option<String> = row.try_get("remote_updated_at")?;

    Ok(SyncableRecord {
        kind,
        id,
        payload,
        sync_state,
        local_mutated_at: decode_ts(&mutated_str)?,
        remote_updated_at: remote_str.as_deref().map(decode_ts).transpose()?,
        deleted: row.try_get("deleted")?,
    })
}

fn decode_session(row: &SqliteRow) -> Result<SyncSession, StorageError> {
    let id_str: String = row.try_get("id")?;
    let id = id_str
        .parse::<SessionId>()
        .map_err(|e| StorageError::Corrupt(format!("sync_sessions.id '{id_str}': {e}")))?;

    let trigger_str: String = row.try_get("trigger_kind")?;
    let trigger: SyncTrigger = serde_json::from_value(Value::String(trigger_str.clone()))
        .map_err(|_| StorageError::Corrupt(format!("sync trigger '{trigger_str}'")))?;

    let started_str: String = row.try_get("started_at")?;
    let completed_str: Option<String> = row.try_get("completed_at")?;
    let errors_str: String = row.try_get("errors")?;
    let errors = serde_json::from_str(&errors_str)
        .map_err(|e| StorageError::Corrupt(format!("sync session errors: {e}")))?;

    Ok(SyncSession {
        id,
        trigger,
        started_at: decode_ts(&started_str)?,
        completed_at: completed_str.as_deref().map(decode_ts).transpose()?,
        records_pushed: row.try_get::<i64, _>("records_pushed")? as u64,
        records_pulled: row.try_get::<i64, _>("records_pulled")? as u64,
        records_deferred: row.try_get::<i64, _>("records_deferred")? as u64,
        interrupted: row.try_get("interrupted")?,
        errors,
    })
}

/// Raw columns of a row, carried across a rebuild without reinterpretation.
#[derive(Debug)]
pub(super) struct StoredRow {
    id: String,
    occurred_at: Option<String>,
    amount_cents: i64,
    actor_id: Option<String>,
    parent_id: Option<String>,
    payload: String,
    sync_state: String,
    local_mutated_at: String,
    remote_updated_at: Option<String>,
    deleted: i64,
}

/// Every non-synced row of every mirrored table that exists.
pub(super) async fn read_outbox_rows(conn: &mut SqliteConnection) -> Result<Vec<(EntityKind, Vec<StoredRow>)>, StorageError> {
    let mut out = Vec::new();
    for kind in EntityKind::ALL {
        let exists = sqlx::query("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1")
            .bind(kind.table())
            .fetch_optional(&mut *conn)
            .await?
            .is_some();
        if !exists {
            continue;
        }

        let sql = format!("SELECT {RECORD_COLUMNS} FROM {} WHERE sync_state != 'synced'", kind.table());
        let rows = sqlx::query(&sql).fetch_all(&mut *conn).await?;
        let stored = rows
            .iter()
            .map(|row| {
                Ok(StoredRow {
                    id: row.try_get("id")?,
                    occurred_at: row.try_get("occurred_at")?,
                    amount_cents: row.try_get("amount_cents")?,
                    actor_id: row.try_get("actor_id")?,
                    parent_id: row.try_get("parent_id")?,
                    payload: row.try_get("payload")?,
                    sync_state: row.try_get("sync_state")?,
                    local_mutated_at: row.try_get("local_mutated_at")?,
                    remote_updated_at: row.try_get("remote_updated_at")?,
                    deleted: row.try_get("deleted")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;
        out.push((kind, stored));
    }
    Ok(out)
}

pub(super) async fn restore_outbox_rows(
    conn: &mut SqliteConnection,
    preserved: Vec<(EntityKind, Vec<StoredRow>)>,
) -> Result<(), StorageError> {
    for (kind, rows) in preserved {
        let sql = format!(
            "INSERT INTO {} ({RECORD_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            kind.table()
        );
        for row in rows {
            sqlx::query(&sql)
                .bind(row.id)
                .bind(row.occurred_at)
                .bind(row.amount_cents)
                .bind(row.actor_id)
                .bind(row.parent_id)
                .bind(row.payload)
                .bind(row.sync_state)
                .bind(row.local_mutated_at)
                .bind(row.remote_updated_at)
                .bind(row.deleted)
                .execute(&mut *conn)
                .await?;
        }
    }
    Ok(())
}
