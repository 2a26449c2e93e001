//! Shared types for the mirror, the outbox and the orchestrator.

use core::str::FromStr;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use mercato_core::{DomainError, RecordId, SessionId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StorageError;

/// JSON field map carried by every mirrored record.
pub type Payload = Map<String, Value>;

/// Mirrored domain tables.
///
/// The declaration order is the order tables are listed in the schema and in
/// the push/pull phases (parents before children, see [`crate::entity`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Staff,
    Product,
    Sale,
    SaleItem,
    CustomerDebt,
    Expense,
    SaleReturn,
    PurchaseOrder,
}

impl EntityKind {
    pub const ALL: [EntityKind; 8] = [
        EntityKind::Staff,
        EntityKind::Product,
        EntityKind::Sale,
        EntityKind::SaleItem,
        EntityKind::CustomerDebt,
        EntityKind::Expense,
        EntityKind::SaleReturn,
        EntityKind::PurchaseOrder,
    ];

    /// Name of the mirror table (and of the remote collection).
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Staff => "staff",
            EntityKind::Product => "products",
            EntityKind::Sale => "sales",
            EntityKind::SaleItem => "sale_items",
            EntityKind::CustomerDebt => "customer_debts",
            EntityKind::Expense => "expenses",
            EntityKind::SaleReturn => "returns",
            EntityKind::PurchaseOrder => "purchase_orders",
        }
    }
}

impl core::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.table())
    }
}

impl FromStr for EntityKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .into_iter()
            .find(|k| k.table() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown table '{s}'")))
    }
}

/// Reference to one mirrored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordRef {
    pub kind: EntityKind,
    pub id: RecordId,
}

impl RecordRef {
    pub fn new(kind: EntityKind, id: RecordId) -> Self {
        Self { kind, id }
    }
}

impl core::fmt::Display for RecordRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// Outbox state of a mirrored row.
///
/// `Synced` means the payload matches the remote store's last confirmed value.
/// `Conflict` is only left through an explicit requeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Synced,
    PendingCreate,
    PendingUpdate,
    PendingDelete,
    Conflict,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Synced => "synced",
            SyncState::PendingCreate => "pending_create",
            SyncState::PendingUpdate => "pending_update",
            SyncState::PendingDelete => "pending_delete",
            SyncState::Conflict => "conflict",
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            SyncState::PendingCreate | SyncState::PendingUpdate | SyncState::PendingDelete
        )
    }
}

impl FromStr for SyncState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "synced" => Ok(SyncState::Synced),
            "pending_create" => Ok(SyncState::PendingCreate),
            "pending_update" => Ok(SyncState::PendingUpdate),
            "pending_delete" => Ok(SyncState::PendingDelete),
            "conflict" => Ok(SyncState::Conflict),
            other => Err(DomainError::validation(format!("invalid sync state '{other}'"))),
        }
    }
}

impl sqlx::Type<sqlx::Sqlite> for SyncState {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <&str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for SyncState {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<'r, sqlx::Sqlite>>::decode(value)?;
        Ok(s.parse::<SyncState>()?)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for SyncState {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
        let s = self.as_str();
        <&str as sqlx::Encode<'q, sqlx::Sqlite>>::encode_by_ref(&s, buf)
    }
}

/// One row of a mirrored table together with its outbox metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncableRecord {
    pub kind: EntityKind,
    pub id: RecordId,
    pub payload: Payload,
    pub sync_state: SyncState,
    pub local_mutated_at: DateTime<Utc>,
    pub remote_updated_at: Option<DateTime<Utc>>,
    /// Soft-delete tombstone.
    pub deleted: bool,
}

impl SyncableRecord {
    pub fn record_ref(&self) -> RecordRef {
        RecordRef::new(self.kind, self.id)
    }
}

/// How the pull phase treats a row that is pending locally and changed remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Newer of `remote_updated_at` and `local_mutated_at` wins; ties keep local.
    #[default]
    LastWriterWins,
    /// The remote payload always replaces a pending local row.
    RemoteWins,
}

impl ConflictPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::LastWriterWins => "last_writer_wins",
            ConflictPolicy::RemoteWins => "remote_wins",
        }
    }
}

impl FromStr for ConflictPolicy {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "last_writer_wins" => Ok(ConflictPolicy::LastWriterWins),
            "remote_wins" => Ok(ConflictPolicy::RemoteWins),
            other => Err(DomainError::validation(format!("invalid conflict policy '{other}'"))),
        }
    }
}

/// What started a sync session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    Manual,
    Reconnect,
    Foreground,
    Periodic,
    AfterWrite,
}

impl SyncTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncTrigger::Manual => "manual",
            SyncTrigger::Reconnect => "reconnect",
            SyncTrigger::Foreground => "foreground",
            SyncTrigger::Periodic => "periodic",
            SyncTrigger::AfterWrite => "after_write",
        }
    }
}

/// A record the session could not push or pull.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionError {
    pub record: RecordRef,
    pub reason: String,
}

/// One push + pull orchestration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSession {
    pub id: SessionId,
    pub trigger: SyncTrigger,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub records_pushed: u64,
    pub records_pulled: u64,
    /// Children held back because their parent is not confirmed yet.
    pub records_deferred: u64,
    /// Connectivity dropped before every phase ran.
    pub interrupted: bool,
    pub errors: Vec<SessionError>,
}

/// Summary handed to the UI after a manual sync.
pub type SyncSessionSummary = SyncSession;

impl SyncSession {
    pub fn start(trigger: SyncTrigger) -> Self {
        Self {
            id: SessionId::new(),
            trigger,
            started_at: now_micros(),
            completed_at: None,
            records_pushed: 0,
            records_pulled: 0,
            records_deferred: 0,
            interrupted: false,
            errors: Vec::new(),
        }
    }

    pub fn complete(&mut self) {
        self.completed_at = Some(now_micros());
    }

    pub fn is_clean(&self) -> bool {
        !self.interrupted && self.errors.is_empty() && self.records_deferred == 0
    }
}

/// Result of asking the orchestrator to sync.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Completed(SyncSession),
    /// Another session was already running; background triggers are dropped.
    Skipped,
}

/// Current time truncated to the precision stored in the mirror.
pub fn now_micros() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Fixed-width RFC 3339 encoding; lexicographic order equals time order.
pub(crate) fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn decode_ts(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt(format!("invalid timestamp '{raw}': {e}")))
}
