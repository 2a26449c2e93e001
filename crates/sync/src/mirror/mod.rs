//! SQLite-backed local mirror of the domain tables.
//!
//! The store exposes no unscoped write API. Every read and write happens on a
//! [`MirrorTx`] handed out by [`MirrorStore::with_transaction`], which commits
//! when the closure returns `Ok` and rolls back otherwise (including when the
//! returned future is dropped half-way).

mod schema;
mod tx;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tokio::sync::Mutex;

use crate::error::StorageError;

pub use schema::{CURRENT_VERSION, MIN_UPGRADABLE_VERSION, SchemaStatus};
pub use tx::{MergeOutcome, MirrorTx};

/// Future returned by a transaction body; borrows the transaction for `'t`.
pub type TxFuture<'t, T> = Pin<Box<dyn Future<Output = T> + Send + 't>>;

/// Handle to the mirror database.
///
/// Cheap to clone; all clones share one pool and one writer gate.
#[derive(Debug, Clone)]
pub struct MirrorStore {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    pool: SqlitePool,
    /// Serializes transactions; SQLite allows a single writer.
    gate: Mutex<Gate>,
}

#[derive(Debug, Default)]
struct Gate {
    /// Schema version found on open when it cannot be migrated in place.
    rebuild_required: Option<i64>,
}

impl MirrorStore {
    /// Open (or create) the mirror at `path`, creating parent directories.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create mirror directory at {:?}", parent))
                .map_err(StorageError::Open)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to create SQLite pool for mirror at {:?}", path))
            .map_err(StorageError::Open)?;

        tracing::info!(path = %path.display(), "opened local mirror");
        Self::initialize(pool).await
    }

    /// Private in-memory mirror, mainly for tests.
    pub async fn open_in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

        // Every connection to `:memory:` is a separate database; keep exactly one alive.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::initialize(pool).await
    }

    async fn initialize(pool: SqlitePool) -> Result<Self, StorageError> {
        let mut conn = pool.acquire().await?;
        let found = schema::stored_version(&mut conn).await?;

        let rebuild_required = match SchemaStatus::classify(found) {
            SchemaStatus::Fresh => {
                schema::migrate(&mut conn, 0).await?;
                None
            }
            SchemaStatus::Upgradable(version) => {
                schema::migrate(&mut conn, version).await?;
                None
            }
            SchemaStatus::RebuildRequired(version) => {
                tracing::warn!(
                    found = version,
                    min = MIN_UPGRADABLE_VERSION,
                    current = CURRENT_VERSION,
                    "mirror schema cannot be migrated; rebuild required"
                );
                Some(version)
            }
        };
        drop(conn);

        Ok(Self {
            inner: Arc::new(Inner {
                pool,
                gate: Mutex::new(Gate { rebuild_required }),
            }),
        })
    }

    /// Whether transactions are refused until [`MirrorStore::rebuild`] runs.
    pub async fn needs_rebuild(&self) -> bool {
        self.inner.gate.lock().await.rebuild_required.is_some()
    }

    /// Run `f` inside one transaction.
    ///
    /// Transactions are serialized; concurrent callers wait for the gate.
    /// Commits when `f` yields `Ok`, rolls back when it yields `Err`.
    pub async fn with_transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: for<'t> FnOnce(&'t mut MirrorTx) -> TxFuture<'t, Result<T, E>> + Send,
        T: Send,
        E: From<StorageError> + Send,
    {
        let gate = self.inner.gate.lock().await;
        if let Some(found) = gate.rebuild_required {
            return Err(StorageError::RebuildRequired {
                found,
                min: MIN_UPGRADABLE_VERSION,
                current: CURRENT_VERSION,
            }
            .into());
        }

        let tx = self.inner.pool.begin().await.map_err(StorageError::from)?;
        let mut mirror_tx = MirrorTx::new(tx);

        match f(&mut mirror_tx).await {
            Ok(value) => {
                mirror_tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = mirror_tx.rollback().await {
                    tracing::error!(error = %rollback, "failed to roll back mirror transaction");
                }
                Err(err)
            }
        }
    }

    /// Recreate the schema from scratch, keeping every non-synced row verbatim.
    ///
    /// Synced rows and pull watermarks are discarded; the next pull refetches
    /// them. Returns the number of preserved outbox rows.
    pub async fn rebuild(&self) -> Result<u64, StorageError> {
        let mut gate = self.inner.gate.lock().await;
        // One transaction: a failed rebuild leaves the old file untouched.
        let mut conn = self.inner.pool.begin().await?;

        let preserved = tx::read_outbox_rows(&mut conn).await?;
        let count = preserved.iter().map(|(_, rows)| rows.len() as u64).sum::<u64>();

        schema::drop_all(&mut conn).await?;
        schema::migrate(&mut conn, 0).await?;
        tx::restore_outbox_rows(&mut conn, preserved).await?;
        conn.commit().await?;

        gate.rebuild_required = None;
        tracing::info!(preserved = count, "rebuilt local mirror");
        Ok(count)
    }

    /// Drop all synced data so the next pull starts from scratch.
    ///
    /// Refused while any row still has unsynced local changes.
    pub async fn clear_cache(&self) -> Result<u64, StorageError> {
        let removed = self
            .with_transaction(|tx| Box::pin(async move { tx.clear_synced().await }))
            .await?;
        tracing::info!(removed, "cleared local mirror cache");
        Ok(removed)
    }

    /// Default location: `{app_data_dir}/mercato/mirror.db`.
    pub fn default_path() -> anyhow::Result<PathBuf> {
        let base = dirs::data_dir()
            .or_else(|| {
                dirs::home_dir().map(|mut h| {
                    h.push(".local");
                    h.push("share");
                    h
                })
            })
            .context("failed to resolve OS app data directory - tried data_dir() and home_dir()/.local/share")?;

        Ok(base.join("mercato").join("mirror.db"))
    }
}
