//! Push/pull sync sessions with single-flight execution.
//!
//! A session pushes pending rows table by table in dependency order, then
//! pulls every table from its watermark. Pending rows that were synced before
//! are first reconciled against remote changes under the table's conflict
//! policy, so a stale local edit never overwrites a newer remote one.
//! Per-record failures are recorded in the session and never abort it; only
//! storage failures do.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use crate::connectivity::ConnectivityProvider;
use crate::entity::push_levels;
use crate::error::{RemoteError, StorageError, SyncError};
use crate::mirror::{MergeOutcome, MirrorStore};
use crate::remote::{RemoteRow, RemoteStore, RemoteUpsert};
use crate::types::{
    EntityKind, Payload, RecordRef, SessionError, SyncOutcome, SyncSession, SyncState, SyncTrigger, now_micros,
};

/// Runs sync sessions; cheap to clone.
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    mirror: MirrorStore,
    remote: Arc<dyn RemoteStore>,
    conn: Arc<dyn ConnectivityProvider>,
    /// Held for the whole session.
    gate: Mutex<()>,
    syncing: AtomicBool,
    last_session: StdMutex<Option<SyncSession>>,
    tombstone_retention: Duration,
}

/// Outcome of pushing one table.
#[derive(Debug, Default)]
struct TablePush {
    pushed: u64,
    /// Remote rows merged while reconciling before the push.
    pulled: u64,
    deferred: u64,
    interrupted: bool,
    errors: Vec<SessionError>,
}

/// Clears the `syncing` flag however the session ends.
struct SyncingFlag<'a>(&'a AtomicBool);

impl Drop for SyncingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SyncOrchestrator {
    pub fn new(
        mirror: MirrorStore,
        remote: Arc<dyn RemoteStore>,
        conn: Arc<dyn ConnectivityProvider>,
        tombstone_retention: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                mirror,
                remote,
                conn,
                gate: Mutex::new(()),
                syncing: AtomicBool::new(false),
                last_session: StdMutex::new(None),
                tombstone_retention,
            }),
        }
    }

    /// Whether a session is running right now. Never blocks.
    pub fn is_syncing(&self) -> bool {
        self.inner.syncing.load(Ordering::SeqCst)
    }

    pub fn last_session(&self) -> Option<SyncSession> {
        self.inner.last_session.lock().ok().and_then(|s| s.clone())
    }

    /// Run a session for `trigger`.
    ///
    /// A manual trigger waits for an in-flight session and then runs its own;
    /// any other trigger is skipped while a session is running.
    pub async fn run(&self, trigger: SyncTrigger) -> Result<SyncOutcome, SyncError> {
        let _gate = match trigger {
            SyncTrigger::Manual => self.inner.gate.lock().await,
            _ => match self.inner.gate.try_lock() {
                Ok(gate) => gate,
                Err(_) => {
                    tracing::debug!(trigger = trigger.as_str(), "sync already running, skipping trigger");
                    return Ok(SyncOutcome::Skipped);
                }
            },
        };

        self.inner.syncing.store(true, Ordering::SeqCst);
        let _flag = SyncingFlag(&self.inner.syncing);

        self.run_session(trigger).await.map(SyncOutcome::Completed)
    }

    /// User-initiated sync; always runs its own session.
    pub async fn manual_sync(&self) -> Result<SyncSession, SyncError> {
        match self.run(SyncTrigger::Manual).await? {
            SyncOutcome::Completed(session) => Ok(session),
            SyncOutcome::Skipped => Err(SyncError::AlreadyRunning),
        }
    }

    fn reachable(&self) -> bool {
        self.inner.conn.snapshot().reachable
    }

    async fn run_session(&self, trigger: SyncTrigger) -> Result<SyncSession, SyncError> {
        if !self.reachable() {
            return Err(SyncError::Offline);
        }

        let mut session = SyncSession::start(trigger);
        tracing::info!(session = %session.id, trigger = trigger.as_str(), "sync session started");

        self.push(&mut session).await?;
        if !session.interrupted {
            self.pull(&mut session).await?;
        }
        session.complete();

        let cutoff = now_micros() - self.inner.tombstone_retention;
        let logged = session.clone();
        let purged = self
            .inner
            .mirror
            .with_transaction(move |tx| {
                Box::pin(async move {
                    let purged = tx.purge_tombstones(cutoff).await?;
                    tx.record_session(&logged).await?;
                    Ok::<_, StorageError>(purged)
                })
            })
            .await?;

        tracing::info!(
            session = %session.id,
            pushed = session.records_pushed,
            pulled = session.records_pulled,
            deferred = session.records_deferred,
            errors = session.errors.len(),
            interrupted = session.interrupted,
            purged,
            "sync session finished"
        );

        if let Ok(mut last) = self.inner.last_session.lock() {
            *last = Some(session.clone());
        }
        Ok(session)
    }

    async fn push(&self, session: &mut SyncSession) -> Result<(), SyncError> {
        for level in push_levels() {
            let mut tasks = JoinSet::new();
            for kind in level {
                let this = self.clone();
                tasks.spawn(async move { this.push_table(kind).await });
            }

            while let Some(joined) = tasks.join_next().await {
                let table = joined.map_err(|e| SyncError::Task(e.to_string()))??;
                session.records_pushed += table.pushed;
                session.records_pulled += table.pulled;
                session.records_deferred += table.deferred;
                session.interrupted |= table.interrupted;
                session.errors.extend(table.errors);
            }

            if session.interrupted {
                tracing::warn!(session = %session.id, "connectivity lost during push, stopping session");
                break;
            }
        }
        Ok(())
    }

    /// Push one table's pending rows in mutation order.
    async fn push_table(&self, kind: EntityKind) -> Result<TablePush, StorageError> {
        let mut out = TablePush::default();
        if !self.reachable() {
            out.interrupted = true;
            return Ok(out);
        }

        let mirror = &self.inner.mirror;
        let mut pending = mirror
            .with_transaction(move |tx| Box::pin(async move { tx.pending(kind).await }))
            .await?;

        // Rows the remote has seen may have changed there since.
        if pending.iter().any(|r| r.remote_updated_at.is_some()) {
            match self.fetch_since_watermark(kind).await? {
                Ok(rows) => {
                    if let Some(outcome) = self.commit_batch(kind, rows).await? {
                        out.pulled += outcome.applied;
                        out.errors.extend(outcome.errors);
                    }
                    pending = mirror
                        .with_transaction(move |tx| Box::pin(async move { tx.pending(kind).await }))
                        .await?;
                }
                Err(RemoteError::Transient(reason)) => {
                    tracing::warn!(table = %kind, %reason, "transient failure reconciling before push");
                    self.inner.conn.report_unreachable();
                    out.interrupted = true;
                    return Ok(out);
                }
                Err(RemoteError::Rejected(reason)) => {
                    tracing::warn!(table = %kind, %reason, "reconcile refused, holding back edits of synced rows");
                    let before = pending.len();
                    pending.retain(|r| r.remote_updated_at.is_none());
                    out.deferred += (before - pending.len()) as u64;
                }
            }
        }

        for record in pending {
            let record_ref = record.record_ref();

            if !record.deleted && self.parent_unconfirmed(&record.payload, kind).await? {
                tracing::debug!(record = %record_ref, "parent not synced yet, deferring");
                out.deferred += 1;
                continue;
            }

            match self.inner.remote.upsert(kind, RemoteUpsert::from(&record)).await {
                Ok(ack) => {
                    let read_at = record.local_mutated_at;
                    let applied = mirror
                        .with_transaction(move |tx| {
                            Box::pin(async move { tx.mark_synced(record_ref, read_at, ack.updated_at).await })
                        })
                        .await?;
                    if applied {
                        out.pushed += 1;
                        tracing::debug!(record = %record_ref, "pushed");
                    } else {
                        tracing::debug!(record = %record_ref, "changed while pushing, left pending");
                    }
                }
                Err(RemoteError::Transient(reason)) => {
                    tracing::warn!(table = %kind, record = %record_ref, %reason, "transient push failure");
                    self.inner.conn.report_unreachable();
                    out.interrupted = true;
                    break;
                }
                Err(RemoteError::Rejected(reason)) => {
                    tracing::warn!(record = %record_ref, %reason, "push rejected, marking conflict");
                    mirror
                        .with_transaction(move |tx| Box::pin(async move { tx.mark_conflict(record_ref).await }))
                        .await?;
                    out.errors.push(SessionError {
                        record: record_ref,
                        reason,
                    });
                }
            }
        }

        Ok(out)
    }

    /// True when a row this payload references exists locally but is not synced.
    async fn parent_unconfirmed(&self, payload: &Payload, kind: EntityKind) -> Result<bool, StorageError> {
        let parents = kind.spec().referenced_ids(payload);
        if parents.is_empty() {
            return Ok(false);
        }

        self.inner
            .mirror
            .with_transaction(move |tx| {
                Box::pin(async move {
                    for (target, id) in parents {
                        match tx.sync_state_of(RecordRef::new(target, id)).await? {
                            Some(SyncState::Synced) | None => {}
                            Some(_) => return Ok(true),
                        }
                    }
                    Ok(false)
                })
            })
            .await
    }

    async fn pull(&self, session: &mut SyncSession) -> Result<(), SyncError> {
        if !self.reachable() {
            session.interrupted = true;
            return Ok(());
        }

        let watermarks = self
            .inner
            .mirror
            .with_transaction(|tx| {
                Box::pin(async move {
                    let mut marks = Vec::with_capacity(EntityKind::ALL.len());
                    for kind in EntityKind::ALL {
                        marks.push((kind, tx.watermark(kind).await?));
                    }
                    Ok::<_, StorageError>(marks)
                })
            })
            .await?;

        let mut fetches = JoinSet::new();
        for (kind, since) in watermarks {
            let remote = Arc::clone(&self.inner.remote);
            fetches.spawn(async move { (kind, remote.fetch_updated_since(kind, since).await) });
        }

        let mut fetched: Vec<(EntityKind, Result<Vec<RemoteRow>, RemoteError>)> = Vec::new();
        while let Some(joined) = fetches.join_next().await {
            fetched.push(joined.map_err(|e| SyncError::Task(e.to_string()))?);
        }
        // Commit parents before children.
        fetched.sort_by_key(|(kind, _)| *kind);

        for (kind, result) in fetched {
            let rows = match result {
                Ok(rows) => rows,
                Err(err) => {
                    tracing::warn!(table = %kind, error = %err, "pull failed for table");
                    if err.is_transient() {
                        self.inner.conn.report_unreachable();
                        session.interrupted = true;
                    }
                    continue;
                }
            };
            if let Some(outcome) = self.commit_batch(kind, rows).await? {
                session.records_pulled += outcome.applied;
                session.errors.extend(outcome.errors);
            }
        }

        Ok(())
    }

    /// Remote changes of one table after its current watermark.
    async fn fetch_since_watermark(
        &self,
        kind: EntityKind,
    ) -> Result<Result<Vec<RemoteRow>, RemoteError>, StorageError> {
        let since = self
            .inner
            .mirror
            .with_transaction(move |tx| Box::pin(async move { tx.watermark(kind).await }))
            .await?;
        Ok(self.inner.remote.fetch_updated_since(kind, since).await)
    }

    /// Merge one fetched batch under the table's policy. `None` for an empty batch.
    async fn commit_batch(&self, kind: EntityKind, rows: Vec<RemoteRow>) -> Result<Option<MergeOutcome>, StorageError> {
        let Some(high) = rows.iter().map(|r| r.updated_at).max() else {
            return Ok(None);
        };

        // The watermark commits with the batch or not at all.
        let outcome = self
            .inner
            .mirror
            .with_transaction(move |tx| {
                Box::pin(async move {
                    let policy = tx.conflict_policy(kind).await?;
                    let outcome = tx.merge_remote(kind, &rows, policy).await?;
                    tx.advance_watermark(kind, high).await?;
                    Ok::<_, StorageError>(outcome)
                })
            })
            .await?;

        tracing::debug!(table = %kind, applied = outcome.applied, kept_local = outcome.kept_local, "merged remote batch");
        Ok(Some(outcome))
    }
}
