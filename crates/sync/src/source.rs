//! The two read paths behind one capability.

use async_trait::async_trait;
use mercato_core::RecordId;
use serde_json::Value;

use crate::connectivity::ConnectivityProvider;
use crate::entity::RowQuery;
use crate::error::{RepositoryError, StorageError};
use crate::mirror::MirrorStore;
use crate::remote::{RemoteRow, RemoteStore};
use crate::types::{EntityKind, Payload, SyncableRecord};

/// A row normalized to the shape both paths return.
#[derive(Debug, Clone, PartialEq)]
pub struct RowView {
    pub kind: EntityKind,
    pub id: RecordId,
    pub payload: Payload,
}

impl From<SyncableRecord> for RowView {
    fn from(record: SyncableRecord) -> Self {
        Self {
            kind: record.kind,
            id: record.id,
            payload: record.payload,
        }
    }
}

impl RowView {
    fn from_remote(kind: EntityKind, row: RemoteRow) -> Self {
        let mut payload = row.payload;
        payload.insert("id".into(), Value::String(row.id.to_string()));
        Self { kind, id: row.id, payload }
    }
}

/// Where a repository read is answered from.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Visible rows matching `query`, ordered by occurrence then id.
    async fn rows(&self, query: &RowQuery) -> Result<Vec<RowView>, RepositoryError>;

    /// One result per query, in order, read as a single consistent view
    /// where the path allows it.
    async fn rows_many(&self, queries: &[RowQuery]) -> Result<Vec<Vec<RowView>>, RepositoryError> {
        let mut out = Vec::with_capacity(queries.len());
        for query in queries {
            out.push(self.rows(query).await?);
        }
        Ok(out)
    }
}

/// Reads the local mirror.
#[derive(Debug, Clone)]
pub struct LocalSource {
    mirror: MirrorStore,
}

impl LocalSource {
    pub fn new(mirror: MirrorStore) -> Self {
        Self { mirror }
    }
}

#[async_trait]
impl DataSource for LocalSource {
    async fn rows(&self, query: &RowQuery) -> Result<Vec<RowView>, RepositoryError> {
        let query = query.clone();
        let records = self
            .mirror
            .with_transaction(move |tx| Box::pin(async move { tx.query(&query).await }))
            .await?;
        Ok(records.into_iter().map(RowView::from).collect())
    }

    /// All queries run inside one mirror transaction.
    async fn rows_many(&self, queries: &[RowQuery]) -> Result<Vec<Vec<RowView>>, RepositoryError> {
        let queries = queries.to_vec();
        let batches = self
            .mirror
            .with_transaction(move |tx| {
                Box::pin(async move {
                    let mut batches = Vec::with_capacity(queries.len());
                    for query in &queries {
                        batches.push(tx.query(query).await?);
                    }
                    Ok::<_, StorageError>(batches)
                })
            })
            .await?;
        Ok(batches
            .into_iter()
            .map(|records| records.into_iter().map(RowView::from).collect())
            .collect())
    }
}

/// Reads the remote store and refreshes the mirror opportunistically.
pub struct RemoteSource<'a> {
    remote: &'a dyn RemoteStore,
    mirror: &'a MirrorStore,
    conn: &'a dyn ConnectivityProvider,
}

impl<'a> RemoteSource<'a> {
    pub fn new(remote: &'a dyn RemoteStore, mirror: &'a MirrorStore, conn: &'a dyn ConnectivityProvider) -> Self {
        Self { remote, mirror, conn }
    }

    /// Store fetched rows locally. Never fails the read; the watermark is left alone.
    async fn refresh_mirror(&self, kind: EntityKind, rows: Vec<RemoteRow>) {
        if rows.is_empty() {
            return;
        }

        let refreshed = self
            .mirror
            .with_transaction(move |tx| {
                Box::pin(async move {
                    let policy = tx.conflict_policy(kind).await?;
                    tx.merge_remote(kind, &rows, policy).await
                })
            })
            .await;

        match refreshed {
            Ok(outcome) => {
                tracing::debug!(table = %kind, applied = outcome.applied, "refreshed mirror from online read");
            }
            Err(err) => {
                tracing::warn!(table = %kind, error = %err, "failed to refresh mirror from online read");
            }
        }
    }
}

#[async_trait]
impl DataSource for RemoteSource<'_> {
    async fn rows(&self, query: &RowQuery) -> Result<Vec<RowView>, RepositoryError> {
        let rows = match self.remote.query(query).await {
            Ok(rows) => rows,
            Err(err) => {
                if err.is_transient() {
                    self.conn.report_unreachable();
                }
                return Err(err.into());
            }
        };

        self.refresh_mirror(query.kind, rows.clone()).await;
        Ok(rows.into_iter().map(|row| RowView::from_remote(query.kind, row)).collect())
    }
}
