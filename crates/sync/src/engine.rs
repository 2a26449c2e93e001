//! UI-facing facade over the whole engine.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::FixedOffset;
use mercato_core::PeriodKind;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::connectivity::{ConnectivityMonitor, ConnectivityState, HealthProbe};
use crate::entity::RowQuery;
use crate::error::{RepositoryError, StorageError, SyncError};
use crate::mirror::MirrorStore;
use crate::orchestrator::SyncOrchestrator;
use crate::remote::{HttpRemoteStore, RemoteStore};
use crate::report::{ActorScope, ReportAggregate, ReportRequest};
use crate::repository::{NewSale, Repository, SaleReceipt};
use crate::source::RowView;
use crate::types::{ConflictPolicy, EntityKind, Payload, RecordRef, SyncSession, SyncSessionSummary, SyncableRecord};
use crate::worker::{SyncWorker, WorkerHandle};

/// Running engine: mirror, repository, orchestrator, background worker and
/// (when opened from config) the health probe.
pub struct MercatoEngine {
    monitor: ConnectivityMonitor,
    mirror: MirrorStore,
    repository: Repository,
    orchestrator: SyncOrchestrator,
    worker: WorkerHandle,
    probe: Option<JoinHandle<()>>,
    offset: FixedOffset,
}

impl MercatoEngine {
    /// Open the mirror and the HTTP remote described by `config`, then start
    /// the health probe and the background worker.
    pub async fn open(config: EngineConfig) -> anyhow::Result<Self> {
        config.validate().context("invalid engine configuration")?;
        let path = config.mirror_path()?;
        let mirror = MirrorStore::open(&path)
            .await
            .with_context(|| format!("failed to open mirror at {}", path.display()))?;

        if mirror.needs_rebuild().await {
            let preserved = mirror.rebuild().await.context("failed to rebuild mirror")?;
            tracing::warn!(preserved, "mirror schema was incompatible and has been rebuilt");
        }

        let remote = HttpRemoteStore::new(config.api_url.clone(), config.request_timeout())
            .context("failed to build remote client")?
            .with_token(config.auth_token.clone())
            .with_retries(config.push_retries, Duration::from_millis(500));

        let monitor = ConnectivityMonitor::default();
        let probe = HealthProbe::new(
            &config.api_url,
            config.probe_interval(),
            config.request_timeout(),
            monitor.clone(),
        );

        let mut engine = Self::from_parts(mirror, Arc::new(remote), monitor, &config);
        engine.probe = Some(probe.spawn());

        tracing::info!(api_url = %config.api_url, mirror = %path.display(), "engine started");
        Ok(engine)
    }

    /// Assemble an engine from existing parts. No health probe is started;
    /// connectivity is whatever `monitor` is told.
    pub fn from_parts(
        mirror: MirrorStore,
        remote: Arc<dyn RemoteStore>,
        monitor: ConnectivityMonitor,
        config: &EngineConfig,
    ) -> Self {
        let nudge = Arc::new(Notify::new());
        let offset = config.utc_offset();

        let repository = Repository::new(mirror.clone(), Arc::clone(&remote), offset, Arc::clone(&nudge));
        let orchestrator = SyncOrchestrator::new(
            mirror.clone(),
            remote,
            Arc::new(monitor.clone()),
            config.tombstone_retention(),
        );
        let worker = SyncWorker::new(orchestrator.clone(), monitor.clone(), config.sync_interval(), nudge).start();

        Self {
            monitor,
            mirror,
            repository,
            orchestrator,
            worker,
            probe: None,
            offset,
        }
    }

    pub fn connectivity(&self) -> ConnectivityState {
        self.monitor.state()
    }

    pub fn monitor(&self) -> &ConnectivityMonitor {
        &self.monitor
    }

    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    pub async fn get_report(&self, request: ReportRequest) -> Result<ReportAggregate, RepositoryError> {
        self.repository.get_report(&self.monitor, request).await
    }

    /// Report for the period containing today.
    pub async fn current_report(&self, period: PeriodKind, scope: ActorScope) -> Result<ReportAggregate, RepositoryError> {
        self.get_report(ReportRequest::current(period, scope, self.offset)).await
    }

    pub async fn list(&self, query: RowQuery) -> Result<Vec<RowView>, RepositoryError> {
        self.repository.list(&self.monitor, query).await
    }

    pub async fn get(&self, record: RecordRef) -> Result<Option<RowView>, RepositoryError> {
        self.repository.get(&self.monitor, record).await
    }

    pub async fn write(&self, kind: EntityKind, payload: Payload) -> Result<RecordRef, RepositoryError> {
        self.repository.write(&self.monitor, kind, payload).await
    }

    pub async fn record_sale(&self, sale: NewSale) -> Result<SaleReceipt, RepositoryError> {
        self.repository.record_sale(&self.monitor, sale).await
    }

    pub async fn update(&self, record: RecordRef, patch: Payload) -> Result<SyncableRecord, RepositoryError> {
        self.repository.update(&self.monitor, record, patch).await
    }

    pub async fn delete(&self, record: RecordRef) -> Result<(), RepositoryError> {
        self.repository.delete(&self.monitor, record).await
    }

    pub async fn pending_count(&self) -> Result<u64, RepositoryError> {
        self.repository.pending_count().await
    }

    pub async fn conflicts(&self) -> Result<Vec<SyncableRecord>, RepositoryError> {
        self.repository.conflicts().await
    }

    pub async fn requeue_conflict(&self, record: RecordRef) -> Result<SyncableRecord, RepositoryError> {
        self.repository.requeue_conflict(&self.monitor, record).await
    }

    pub async fn set_conflict_policy(&self, kind: EntityKind, policy: ConflictPolicy) -> Result<(), StorageError> {
        self.mirror
            .with_transaction(move |tx| Box::pin(async move { tx.set_conflict_policy(kind, policy).await }))
            .await
    }

    pub async fn recent_sessions(&self, limit: u32) -> Result<Vec<SyncSession>, StorageError> {
        self.mirror
            .with_transaction(move |tx| Box::pin(async move { tx.recent_sessions(limit).await }))
            .await
    }

    pub async fn clear_cache(&self) -> Result<u64, StorageError> {
        self.mirror.clear_cache().await
    }

    /// Whether a sync session is running. Never blocks.
    pub fn syncing(&self) -> bool {
        self.orchestrator.is_syncing()
    }

    pub async fn manual_sync(&self) -> Result<SyncSessionSummary, SyncError> {
        self.orchestrator.manual_sync().await
    }

    pub fn on_connectivity_changed<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(ConnectivityState) + Send + Sync + 'static,
    {
        self.monitor.on_change(callback)
    }

    pub fn notify_foreground(&self) {
        self.worker.notify_foreground();
    }

    /// Stop the probe and the worker; an in-flight session finishes first.
    pub async fn shutdown(self) {
        if let Some(probe) = self.probe {
            probe.abort();
        }
        self.worker.shutdown().await;
        tracing::info!("engine stopped");
    }
}
