//! Contract of the remote system of record.

mod http;
mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mercato_core::RecordId;
use serde::{Deserialize, Serialize};

use crate::entity::RowQuery;
use crate::error::RemoteError;
use crate::types::{EntityKind, Payload, SyncableRecord};

pub use http::HttpRemoteStore;
pub use memory::InMemoryRemoteStore;

/// One row as the remote store holds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRow {
    pub id: RecordId,
    pub payload: Payload,
    #[serde(default)]
    pub deleted: bool,
    /// Server clock at the row's last accepted change.
    pub updated_at: DateTime<Utc>,
}

/// An upsert keyed by the client-generated primary key.
///
/// Deletes travel as upserts with `deleted = true`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteUpsert {
    pub id: RecordId,
    pub payload: Payload,
    pub deleted: bool,
}

impl From<&SyncableRecord> for RemoteUpsert {
    fn from(record: &SyncableRecord) -> Self {
        Self {
            id: record.id,
            payload: record.payload.clone(),
            deleted: record.deleted,
        }
    }
}

/// Acknowledgement of an accepted upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAck {
    pub id: RecordId,
    pub updated_at: DateTime<Utc>,
}

/// Remote backend consumed by the repository and the orchestrator.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Insert or replace the row with `row.id`. Replaying the same upsert is a no-op.
    async fn upsert(&self, kind: EntityKind, row: RemoteUpsert) -> Result<RemoteAck, RemoteError>;

    /// Rows (tombstones included) changed strictly after `since`, oldest first.
    async fn fetch_updated_since(
        &self,
        kind: EntityKind,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemoteRow>, RemoteError>;

    /// Visible rows matching `query`.
    async fn query(&self, query: &RowQuery) -> Result<Vec<RemoteRow>, RemoteError>;
}
