//! `mercato-sync`
//!
//! **Responsibility:** offline-first data access and synchronization for the
//! shop app.
//!
//! This crate provides:
//! - A local SQLite mirror of the domain tables with scoped transactions
//! - Per-row sync state (the outbox) for changes not yet confirmed remotely
//! - A repository that reads from the remote store when online and from the
//!   mirror when offline, and always writes locally first
//! - Push/pull sync sessions with watermarks and a background worker
//!
//! The remote store stays the system of record; the mirror converges to it.

pub mod config;
pub mod connectivity;
pub mod engine;
pub mod entity;
pub mod error;
pub mod mirror;
pub mod orchestrator;
pub mod remote;
pub mod report;
pub mod repository;
pub mod source;
pub mod types;
pub mod worker;

pub use config::EngineConfig;
pub use connectivity::{ConnectivityMonitor, ConnectivityProvider, ConnectivityState, FixedConnectivity, HealthProbe};
pub use engine::MercatoEngine;
pub use error::{ConfigError, RemoteError, RepositoryError, StorageError, SyncError};
pub use mirror::{MirrorStore, MirrorTx};
pub use orchestrator::SyncOrchestrator;
pub use remote::{HttpRemoteStore, InMemoryRemoteStore, RemoteStore};
pub use report::{ActorScope, ReportAggregate, ReportRequest};
pub use repository::{NewCredit, NewSale, NewSaleItem, Repository, SaleReceipt};
pub use types::{
    ConflictPolicy, EntityKind, Payload, RecordRef, SyncOutcome, SyncSession, SyncSessionSummary, SyncState,
    SyncTrigger, SyncableRecord,
};
