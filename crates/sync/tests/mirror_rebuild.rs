mod common;

use std::sync::Arc;

use common::{Harness, at, expense, obj};
use mercato_sync::entity::RowQuery;
use mercato_sync::{
    EntityKind, FixedConnectivity, InMemoryRemoteStore, MirrorStore, RecordRef, StorageError, SyncState,
};
use serde_json::json;
use sqlx::sqlite::SqliteConnectOptions;

async fn set_schema_version(path: &std::path::Path, version: &str) {
    let pool = sqlx::SqlitePool::connect_with(SqliteConnectOptions::new().filename(path))
        .await
        .unwrap();
    sqlx::query("UPDATE mirror_meta SET value = ?1 WHERE key = 'schema_version'")
        .bind(version)
        .execute(&pool)
        .await
        .unwrap();
    pool.close().await;
}

#[tokio::test]
async fn reopening_a_file_keeps_everything() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("mirror.db");

    let record = {
        let mirror = MirrorStore::open(&path).await.unwrap();
        let h = Harness::with_mirror(mirror, Arc::new(InMemoryRemoteStore::new()));
        h.repo
            .write(&FixedConnectivity::OFFLINE, EntityKind::Expense, expense(70, at(9, 0), None))
            .await
            .unwrap()
    };

    let mirror = MirrorStore::open(&path).await.unwrap();
    assert!(!mirror.needs_rebuild().await);
    let stored = mirror
        .with_transaction(move |tx| Box::pin(async move { tx.get(record).await }))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.sync_state, SyncState::PendingCreate);
}

#[tokio::test]
async fn rebuild_preserves_outbox_rows() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mirror.db");

    let (pending, synced, conflict) = {
        let mirror = MirrorStore::open(&path).await.unwrap();
        let h = Harness::with_mirror(mirror, Arc::new(InMemoryRemoteStore::new()));
        let offline = FixedConnectivity::OFFLINE;

        let synced = h
            .repo
            .write(&offline, EntityKind::Expense, expense(10, at(8, 0), None))
            .await
            .unwrap();
        let conflict = h
            .repo
            .write(&offline, EntityKind::Expense, expense(20, at(8, 30), None))
            .await
            .unwrap();
        h.remote.reject(conflict.id);
        h.orchestrator.manual_sync().await.unwrap();

        let pending = h
            .repo
            .write(&offline, EntityKind::Expense, expense(30, at(9, 0), None))
            .await
            .unwrap();
        h.repo
            .update(&offline, pending, obj(json!({ "description": "edited offline" })))
            .await
            .unwrap();
        (pending, synced, conflict)
    };

    // A build from the future wrote this file.
    set_schema_version(&path, "99").await;

    let mirror = MirrorStore::open(&path).await.unwrap();
    assert!(mirror.needs_rebuild().await);
    let err = mirror
        .with_transaction(|tx| Box::pin(async move { tx.pending_count().await }))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::RebuildRequired { found: 99, .. }));

    assert_eq!(mirror.rebuild().await.unwrap(), 2);
    assert!(!mirror.needs_rebuild().await);

    let (kept_pending, kept_conflict, dropped_synced, watermark) = mirror
        .with_transaction(move |tx| {
            Box::pin(async move {
                Ok::<_, StorageError>((
                    tx.fetch(pending).await?,
                    tx.fetch(conflict).await?,
                    tx.fetch(synced).await?,
                    tx.watermark(EntityKind::Expense).await?,
                ))
            })
        })
        .await
        .unwrap();

    let kept_pending = kept_pending.expect("pending row preserved");
    assert_eq!(kept_pending.sync_state, SyncState::PendingCreate);
    assert_eq!(kept_pending.payload["description"], json!("edited offline"));
    assert_eq!(kept_conflict.expect("conflict row preserved").sync_state, SyncState::Conflict);
    assert!(dropped_synced.is_none());
    assert_eq!(watermark, None);

    // The mirror is usable again and the preserved rows still push.
    let remote = Arc::new(InMemoryRemoteStore::new());
    let h = Harness::with_mirror(mirror, Arc::clone(&remote));
    let session = h.orchestrator.manual_sync().await.unwrap();
    assert_eq!(session.records_pushed, 1);
    assert!(remote.row(EntityKind::Expense, pending.id).is_some());
    assert_eq!(
        h.repo
            .list(&FixedConnectivity::OFFLINE, RowQuery::all(EntityKind::Expense))
            .await
            .unwrap()
            .len(),
        2
    );
    assert_eq!(h.repo.conflicts().await.unwrap()[0].record_ref(), RecordRef::new(EntityKind::Expense, conflict.id));
}

#[tokio::test]
async fn clear_cache_waits_for_the_outbox() {
    let h = Harness::online().await;
    let record = h
        .repo
        .write(&FixedConnectivity::OFFLINE, EntityKind::Expense, expense(10, at(8, 0), None))
        .await
        .unwrap();

    let err = h.mirror.clear_cache().await.unwrap_err();
    assert!(matches!(err, StorageError::UnsyncedChanges(1)));

    h.orchestrator.manual_sync().await.unwrap();
    assert_eq!(h.mirror.clear_cache().await.unwrap(), 1);
    assert!(h.repo.get(&FixedConnectivity::OFFLINE, record).await.unwrap().is_none());
    assert_eq!(h.watermark(EntityKind::Expense).await, None);

    // The next pull brings the row back.
    h.orchestrator.manual_sync().await.unwrap();
    assert!(h.repo.get(&FixedConnectivity::OFFLINE, record).await.unwrap().is_some());
}
