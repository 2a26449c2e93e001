//! Mirror schema and its versioned migrations.

use sqlx::{Connection, Row, SqliteConnection};

use crate::error::StorageError;
use crate::types::EntityKind;

/// Version written by the newest migration.
pub const CURRENT_VERSION: i64 = 3;

/// Oldest stored version that can be migrated in place.
pub const MIN_UPGRADABLE_VERSION: i64 = 1;

/// Columns shared by every mirrored table, in select order.
pub(crate) const RECORD_COLUMNS: &str = "id, occurred_at, amount_cents, actor_id, parent_id, payload, \
     sync_state, local_mutated_at, remote_updated_at, deleted";

/// State of the schema found in an existing database file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaStatus {
    /// No mirror tables yet.
    Fresh,
    /// Known version, possibly behind [`CURRENT_VERSION`].
    Upgradable(i64),
    /// Too old or written by a newer build.
    RebuildRequired(i64),
}

impl SchemaStatus {
    pub fn classify(found: Option<i64>) -> Self {
        match found {
            None => SchemaStatus::Fresh,
            Some(v) if (MIN_UPGRADABLE_VERSION..=CURRENT_VERSION).contains(&v) => SchemaStatus::Upgradable(v),
            Some(v) => SchemaStatus::RebuildRequired(v),
        }
    }
}

pub(crate) async fn stored_version(conn: &mut SqliteConnection) -> Result<Option<i64>, StorageError> {
    let has_meta = sqlx::query("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'mirror_meta'")
        .fetch_optional(&mut *conn)
        .await?
        .is_some();
    if !has_meta {
        return Ok(None);
    }

    let row = sqlx::query("SELECT value FROM mirror_meta WHERE key = 'schema_version'")
        .fetch_optional(&mut *conn)
        .await?;
    match row {
        // A meta table without a version is unreadable; 0 forces a rebuild.
        None => Ok(Some(0)),
        Some(row) => {
            let raw: String = row.try_get("value")?;
            raw.parse::<i64>()
                .map(Some)
                .map_err(|_| StorageError::Corrupt(format!("schema_version '{raw}'")))
        }
    }
}

/// Statements that bring a database at `version - 1` to `version`.
fn migration(version: i64) -> Vec<String> {
    match version {
        1 => {
            let mut stmts = vec![
                "CREATE TABLE IF NOT EXISTS mirror_meta (
                    key   TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                )"
                .to_string(),
                "CREATE TABLE IF NOT EXISTS mirror_tables (
                    table_name      TEXT PRIMARY KEY,
                    watermark       TEXT NULL,
                    conflict_policy TEXT NOT NULL DEFAULT 'last_writer_wins'
                )"
                .to_string(),
            ];
            for kind in EntityKind::ALL {
                stmts.push(format!(
                    "CREATE TABLE IF NOT EXISTS {table} (
                        id                TEXT PRIMARY KEY,
                        occurred_at       TEXT NULL,
                        amount_cents      INTEGER NOT NULL DEFAULT 0,
                        actor_id          TEXT NULL,
                        parent_id         TEXT NULL,
                        payload           TEXT NOT NULL,
                        sync_state        TEXT NOT NULL,
                        local_mutated_at  TEXT NOT NULL,
                        remote_updated_at TEXT NULL,
                        deleted           INTEGER NOT NULL DEFAULT 0
                    )",
                    table = kind.table()
                ));
                stmts.push(format!(
                    "INSERT OR IGNORE INTO mirror_tables (table_name) VALUES ('{}')",
                    kind.table()
                ));
            }
            stmts
        }
        2 => EntityKind::ALL
            .into_iter()
            .flat_map(|kind| {
                let t = kind.table();
                [
                    format!("CREATE INDEX IF NOT EXISTS idx_{t}_sync_state ON {t} (sync_state)"),
                    format!("CREATE INDEX IF NOT EXISTS idx_{t}_occurred_at ON {t} (occurred_at)"),
                    format!("CREATE INDEX IF NOT EXISTS idx_{t}_parent_id ON {t} (parent_id)"),
                ]
            })
            .collect(),
        3 => vec![
            "CREATE TABLE IF NOT EXISTS sync_sessions (
                id              TEXT PRIMARY KEY,
                trigger_kind    TEXT NOT NULL,
                started_at      TEXT NOT NULL,
                completed_at    TEXT NULL,
                records_pushed  INTEGER NOT NULL,
                records_pulled  INTEGER NOT NULL,
                records_deferred INTEGER NOT NULL,
                interrupted     INTEGER NOT NULL,
                errors          TEXT NOT NULL
            )"
            .to_string(),
            "CREATE INDEX IF NOT EXISTS idx_sync_sessions_started_at ON sync_sessions (started_at)".to_string(),
        ],
        _ => Vec::new(),
    }
}

/// Apply every migration after `from`, each in its own transaction.
pub(crate) async fn migrate(conn: &mut SqliteConnection, from: i64) -> Result<(), StorageError> {
    for version in (from + 1)..=CURRENT_VERSION {
        // Dropping the transaction on error rolls the migration back.
        let mut tx = conn.begin().await?;
        apply(&mut tx, version).await?;
        tx.commit().await?;
        tracing::debug!(version, "applied mirror migration");
    }
    Ok(())
}

async fn apply(conn: &mut SqliteConnection, version: i64) -> Result<(), StorageError> {
    for stmt in migration(version) {
        sqlx::query(&stmt).execute(&mut *conn).await?;
    }
    sqlx::query("INSERT INTO mirror_meta (key, value) VALUES ('schema_version', ?1) ON CONFLICT(key) DO UPDATE SET value = excluded.value")
        .bind(version.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Drop every mirror table (used by rebuild).
pub(crate) async fn drop_all(conn: &mut SqliteConnection) -> Result<(), StorageError> {
    let names: Vec<String> = sqlx::query("SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'")
        .fetch_all(&mut *conn)
        .await?
        .into_iter()
        .map(|row| row.try_get::<String, _>("name"))
        .collect::<Result<_, _>>()?;

    for name in names {
        sqlx::query(&format!("DROP TABLE IF EXISTS \"{name}\"")).execute(&mut *conn).await?;
    }
    Ok(())
}
