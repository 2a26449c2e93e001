mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{Harness, at, expense, obj, sale_of};
use mercato_core::RecordId;
use mercato_sync::entity::{Entity, Product, RowQuery};
use mercato_sync::remote::{RemoteAck, RemoteRow, RemoteUpsert};
use mercato_sync::{
    ConflictPolicy, ConnectivityState, EntityKind, FixedConnectivity, InMemoryRemoteStore, MirrorStore, RecordRef,
    RemoteError, RemoteStore, SyncError, SyncOutcome, SyncState, SyncTrigger,
};
use serde_json::json;

#[tokio::test]
async fn second_sync_without_changes_writes_nothing() {
    let h = Harness::online().await;
    let products = h.seed_products(&[(100, 40)]).await;
    h.repo
        .record_sale(&FixedConnectivity::OFFLINE, sale_of(None, at(10, 0), &[(&products[0], 2)]))
        .await
        .unwrap();

    let first = h.orchestrator.manual_sync().await.unwrap();
    assert_eq!(first.records_pushed, 2);
    let calls = h.remote.upsert_calls();

    let second = h.orchestrator.manual_sync().await.unwrap();
    assert_eq!(second.records_pushed, 0);
    assert_eq!(second.records_pulled, 0);
    assert_eq!(h.remote.upsert_calls(), calls);
    assert_eq!(h.remote.rows(EntityKind::Sale).len(), 1);
    assert_eq!(h.remote.rows(EntityKind::SaleItem).len(), 1);
}

#[tokio::test]
async fn children_reach_the_remote_after_their_parents() {
    let h = Harness::online().await;
    let offline = FixedConnectivity::OFFLINE;

    // A product made on this device, then sold before any sync.
    let product = Product {
        id: RecordId::new(),
        sku: "TEA-1".to_string(),
        name: "Tea".to_string(),
        price_cents: 150,
        cost_cents: 60,
        stock_quantity: 10,
        created_at: at(7, 0),
    };
    h.repo
        .write(&offline, EntityKind::Product, product.to_payload().unwrap())
        .await
        .unwrap();

    let mut receipts = Vec::new();
    for minute in 0..2 {
        receipts.push(
            h.repo
                .record_sale(&offline, sale_of(None, at(10, minute), &[(&product, 1), (&product, 3)]))
                .await
                .unwrap(),
        );
    }

    let session = h.orchestrator.manual_sync().await.unwrap();
    assert!(session.is_clean(), "unexpected session problems: {session:?}");

    let log = h.remote.write_log();
    let position = |r: RecordRef| log.iter().position(|l| *l == r).expect("record was pushed");
    let product_at = position(RecordRef::new(EntityKind::Product, product.id));
    for receipt in &receipts {
        let sale_at = position(receipt.sale);
        for item in &receipt.items {
            let item_at = position(*item);
            assert!(sale_at < item_at, "item {item} pushed before its sale");
            assert!(product_at < item_at, "item {item} pushed before its product");
        }
    }
}

#[tokio::test]
async fn rejected_record_does_not_block_the_others() {
    let h = Harness::online().await;
    let products = h.seed_products(&[(500, 300)]).await;
    let offline = FixedConnectivity::OFFLINE;

    let refused = h
        .repo
        .record_sale(&offline, sale_of(None, at(9, 0), &[(&products[0], 1), (&products[0], 2)]))
        .await
        .unwrap();
    let accepted = h
        .repo
        .record_sale(&offline, sale_of(None, at(9, 5), &[(&products[0], 1)]))
        .await
        .unwrap();
    h.remote.reject(refused.sale.id);

    let session = h.orchestrator.manual_sync().await.unwrap();
    assert!(!session.interrupted);
    assert_eq!(session.errors.len(), 1);
    assert_eq!(session.errors[0].record, refused.sale);
    // The refused sale's items wait for it.
    assert_eq!(session.records_deferred, 2);
    assert_eq!(session.records_pushed, 2);

    assert!(h.remote.row(EntityKind::Sale, accepted.sale.id).is_some());
    assert!(h.remote.row(EntityKind::Sale, refused.sale.id).is_none());

    let conflicts = h.repo.conflicts().await.unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].record_ref(), refused.sale);
    assert_eq!(h.repo.pending_count().await.unwrap(), 2);

    // A requeued conflict goes back into the outbox.
    h.repo.requeue_conflict(&offline, refused.sale).await.unwrap();
    let state = h
        .mirror
        .with_transaction(move |tx| Box::pin(async move { tx.sync_state_of(refused.sale).await }))
        .await
        .unwrap();
    assert_eq!(state, Some(SyncState::PendingUpdate));
}

#[tokio::test]
async fn watermarks_only_move_forward() {
    let h = Harness::online().await;
    assert_eq!(h.watermark(EntityKind::Expense).await, None);

    let first = h
        .remote
        .put_remote(
            EntityKind::Expense,
            obj(json!({ "category": "rent", "amount_cents": 100, "incurred_at": "2024-06-03T08:00:00Z", "staff_id": null })),
        )
        .unwrap();
    h.orchestrator.manual_sync().await.unwrap();
    let w1 = h.watermark(EntityKind::Expense).await.unwrap();
    assert_eq!(w1, first.updated_at);

    // Nothing new: the watermark stays put.
    let idle = h.orchestrator.manual_sync().await.unwrap();
    assert_eq!(idle.records_pulled, 0);
    assert_eq!(h.watermark(EntityKind::Expense).await, Some(w1));

    let second = h
        .remote
        .put_remote(
            EntityKind::Expense,
            obj(json!({ "category": "water", "amount_cents": 40, "incurred_at": "2024-06-03T09:00:00Z", "staff_id": null })),
        )
        .unwrap();
    let session = h.orchestrator.manual_sync().await.unwrap();
    assert_eq!(session.records_pulled, 1);
    let w2 = h.watermark(EntityKind::Expense).await.unwrap();
    assert_eq!(w2, second.updated_at);
    assert!(w2 > w1);

    let rolled_back = h
        .mirror
        .with_transaction(move |tx| Box::pin(async move { tx.advance_watermark(EntityKind::Expense, w1).await }))
        .await
        .unwrap();
    assert_eq!(rolled_back, w2);
}

#[tokio::test]
async fn pull_brings_in_other_devices_changes() {
    let h = Harness::online().await;
    let record = h
        .repo
        .write(&FixedConnectivity::OFFLINE, EntityKind::Expense, expense(250, at(12, 0), None))
        .await
        .unwrap();
    h.orchestrator.manual_sync().await.unwrap();

    // Another device edits the same row.
    let edited = h
        .remote
        .put_remote(
            EntityKind::Expense,
            obj(json!({
                "id": record.id.to_string(),
                "category": "supplies",
                "amount_cents": 275,
                "incurred_at": "2024-06-03T12:00:00Z",
                "staff_id": null,
            })),
        )
        .unwrap();

    let session = h.orchestrator.manual_sync().await.unwrap();
    assert_eq!(session.records_pulled, 1);

    let local = h.repo.get(&FixedConnectivity::OFFLINE, record).await.unwrap().unwrap();
    assert_eq!(local.payload["amount_cents"], json!(275));
    let stored = h
        .mirror
        .with_transaction(move |tx| Box::pin(async move { tx.get(record).await }))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.sync_state, SyncState::Synced);
    assert_eq!(stored.remote_updated_at, Some(edited.updated_at));
}

/// A pending local edit newer than the remote one, reconciled through an online read.
async fn reconcile_pending_edit(policy: ConflictPolicy) -> i64 {
    let h = Harness::online().await;
    let offline = FixedConnectivity::OFFLINE;
    let record = h
        .repo
        .write(&offline, EntityKind::Expense, expense(100, at(12, 0), None))
        .await
        .unwrap();
    h.orchestrator.manual_sync().await.unwrap();

    h.mirror
        .with_transaction(move |tx| Box::pin(async move { tx.set_conflict_policy(EntityKind::Expense, policy).await }))
        .await
        .unwrap();

    h.remote
        .put_remote(
            EntityKind::Expense,
            obj(json!({
                "id": record.id.to_string(),
                "category": "supplies",
                "amount_cents": 999,
                "incurred_at": "2024-06-03T12:00:00Z",
                "staff_id": null,
            })),
        )
        .unwrap();
    tokio::time::sleep(Duration::from_millis(2)).await;
    h.repo
        .update(&offline, record, obj(json!({ "amount_cents": 555 })))
        .await
        .unwrap();

    h.repo.get(&FixedConnectivity::ONLINE, record).await.unwrap();

    let local = h
        .mirror
        .with_transaction(move |tx| Box::pin(async move { tx.get(record).await }))
        .await
        .unwrap()
        .unwrap();
    local.payload["amount_cents"].as_i64().unwrap()
}

#[tokio::test]
async fn last_writer_wins_keeps_a_newer_local_edit() {
    assert_eq!(reconcile_pending_edit(ConflictPolicy::LastWriterWins).await, 555);
}

#[tokio::test]
async fn remote_wins_overrides_pending_rows() {
    assert_eq!(reconcile_pending_edit(ConflictPolicy::RemoteWins).await, 999);
}

/// Local and remote edits of one synced row, ordered by `remote_edits_last`,
/// then settled by a sync session. Returns the amount on (remote, local).
async fn sync_concurrent_edits(policy: ConflictPolicy, remote_edits_last: bool) -> (i64, i64) {
    let h = Harness::online().await;
    let offline = FixedConnectivity::OFFLINE;
    let record = h
        .repo
        .write(&offline, EntityKind::Expense, expense(100, at(12, 0), None))
        .await
        .unwrap();
    h.orchestrator.manual_sync().await.unwrap();
    h.mirror
        .with_transaction(move |tx| Box::pin(async move { tx.set_conflict_policy(EntityKind::Expense, policy).await }))
        .await
        .unwrap();

    let remote_edit = || {
        h.remote
            .put_remote(
                EntityKind::Expense,
                obj(json!({
                    "id": record.id.to_string(),
                    "category": "supplies",
                    "amount_cents": 999,
                    "incurred_at": "2024-06-03T12:00:00Z",
                    "staff_id": null,
                })),
            )
            .unwrap()
    };

    if !remote_edits_last {
        remote_edit();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    h.repo
        .update(&offline, record, obj(json!({ "amount_cents": 555 })))
        .await
        .unwrap();
    if remote_edits_last {
        tokio::time::sleep(Duration::from_millis(5)).await;
        remote_edit();
    }

    let session = h.orchestrator.manual_sync().await.unwrap();
    assert!(session.is_clean(), "unexpected session problems: {session:?}");
    assert_eq!(h.repo.pending_count().await.unwrap(), 0);

    let remote = h.remote.row(EntityKind::Expense, record.id).unwrap();
    let local = h
        .mirror
        .with_transaction(move |tx| Box::pin(async move { tx.get(record).await }))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(local.sync_state, SyncState::Synced);
    (
        remote.payload["amount_cents"].as_i64().unwrap(),
        local.payload["amount_cents"].as_i64().unwrap(),
    )
}

#[tokio::test]
async fn sync_keeps_a_newer_remote_edit_under_last_writer_wins() {
    assert_eq!(sync_concurrent_edits(ConflictPolicy::LastWriterWins, true).await, (999, 999));
}

#[tokio::test]
async fn sync_pushes_a_newer_local_edit_under_last_writer_wins() {
    assert_eq!(sync_concurrent_edits(ConflictPolicy::LastWriterWins, false).await, (555, 555));
}

#[tokio::test]
async fn sync_keeps_the_remote_edit_under_remote_wins() {
    assert_eq!(sync_concurrent_edits(ConflictPolicy::RemoteWins, true).await, (999, 999));
    assert_eq!(sync_concurrent_edits(ConflictPolicy::RemoteWins, false).await, (999, 999));
}

#[tokio::test]
async fn interrupted_session_keeps_committed_work() {
    let h = Harness::online().await;
    for minute in 0..5 {
        h.repo
            .write(&FixedConnectivity::OFFLINE, EntityKind::Expense, expense(10, at(13, minute), None))
            .await
            .unwrap();
    }

    h.remote.fail_after_upserts(2);
    let session = h.orchestrator.manual_sync().await.unwrap();
    assert!(session.interrupted);
    assert_eq!(session.records_pushed, 2);
    assert_eq!(h.repo.pending_count().await.unwrap(), 3);
    assert_eq!(h.monitor.state(), ConnectivityState::Offline);

    let err = h.orchestrator.manual_sync().await.unwrap_err();
    assert!(matches!(err, SyncError::Offline));

    h.go_online();
    let resumed = h.orchestrator.manual_sync().await.unwrap();
    assert!(resumed.is_clean(), "unexpected session problems: {resumed:?}");
    assert_eq!(resumed.records_pushed, 3);
    assert_eq!(h.repo.pending_count().await.unwrap(), 0);
    assert_eq!(h.remote.rows(EntityKind::Expense).len(), 5);

    let logged = h
        .mirror
        .with_transaction(|tx| Box::pin(async move { tx.recent_sessions(10).await }))
        .await
        .unwrap();
    assert_eq!(logged.len(), 2);
    assert_eq!(logged.iter().filter(|s| s.interrupted).count(), 1);
}

/// Delays every upsert so a session stays in flight.
struct SlowRemote {
    inner: Arc<InMemoryRemoteStore>,
    delay: Duration,
}

#[async_trait]
impl RemoteStore for SlowRemote {
    async fn upsert(&self, kind: EntityKind, row: RemoteUpsert) -> Result<RemoteAck, RemoteError> {
        tokio::time::sleep(self.delay).await;
        self.inner.upsert(kind, row).await
    }

    async fn fetch_updated_since(
        &self,
        kind: EntityKind,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemoteRow>, RemoteError> {
        self.inner.fetch_updated_since(kind, since).await
    }

    async fn query(&self, query: &RowQuery) -> Result<Vec<RemoteRow>, RemoteError> {
        self.inner.query(query).await
    }
}

#[tokio::test]
async fn background_triggers_are_skipped_while_syncing() {
    let mirror = MirrorStore::open_in_memory().await.unwrap();
    let remote = Arc::new(InMemoryRemoteStore::new());
    let slow = Arc::new(SlowRemote {
        inner: Arc::clone(&remote),
        delay: Duration::from_millis(100),
    });
    let h = Harness::with_remote(mirror, remote, slow);

    for minute in 0..3 {
        h.repo
            .write(&FixedConnectivity::OFFLINE, EntityKind::Expense, expense(10, at(15, minute), None))
            .await
            .unwrap();
    }

    let running = {
        let orchestrator = h.orchestrator.clone();
        tokio::spawn(async move { orchestrator.run(SyncTrigger::Periodic).await })
    };
    for _ in 0..100 {
        if h.orchestrator.is_syncing() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(h.orchestrator.is_syncing());

    assert!(matches!(h.orchestrator.run(SyncTrigger::AfterWrite).await, Ok(SyncOutcome::Skipped)));
    assert!(matches!(h.orchestrator.run(SyncTrigger::Reconnect).await, Ok(SyncOutcome::Skipped)));

    // A manual sync waits for the running session, then runs its own.
    let manual = h.orchestrator.manual_sync().await.unwrap();
    assert_eq!(manual.trigger, SyncTrigger::Manual);
    assert_eq!(manual.records_pushed, 0);

    match running.await.unwrap().unwrap() {
        SyncOutcome::Completed(session) => assert_eq!(session.records_pushed, 3),
        SyncOutcome::Skipped => panic!("first session should have run"),
    }
    assert!(!h.orchestrator.is_syncing());
    assert_eq!(h.remote.rows(EntityKind::Expense).len(), 3);
}

#[tokio::test]
async fn sync_refuses_to_start_offline() {
    let h = Harness::online().await;
    h.go_offline();
    let err = h.orchestrator.manual_sync().await.unwrap_err();
    assert!(matches!(err, SyncError::Offline));
    assert!(h.orchestrator.last_session().is_none());
}
