#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Duration, FixedOffset, TimeZone, Utc};
use mercato_core::RecordId;
use mercato_sync::entity::{Entity, Expense, Product};
use mercato_sync::{
    ConnectivityMonitor, ConnectivityState, EntityKind, InMemoryRemoteStore, MirrorStore, NewSale, NewSaleItem,
    Payload, RemoteStore, Repository, SyncOrchestrator,
};
use serde_json::Value;
use tokio::sync::Notify;

pub fn utc() -> FixedOffset {
    FixedOffset::east_opt(0).unwrap()
}

/// 2024-06-03 (a Monday) at `hour:minute` UTC.
pub fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 3, hour, minute, 0).unwrap()
}

pub fn obj(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

pub struct Harness {
    pub mirror: MirrorStore,
    pub remote: Arc<InMemoryRemoteStore>,
    pub monitor: ConnectivityMonitor,
    pub repo: Repository,
    pub orchestrator: SyncOrchestrator,
}

impl Harness {
    pub async fn online() -> Self {
        let mirror = MirrorStore::open_in_memory().await.unwrap();
        Self::with_mirror(mirror, Arc::new(InMemoryRemoteStore::new()))
    }

    pub fn with_mirror(mirror: MirrorStore, remote: Arc<InMemoryRemoteStore>) -> Self {
        Self::with_remote(mirror, remote.clone(), remote)
    }

    /// `backend` is what the engine talks to; `remote` is kept for inspection.
    pub fn with_remote(mirror: MirrorStore, remote: Arc<InMemoryRemoteStore>, backend: Arc<dyn RemoteStore>) -> Self {
        let monitor = ConnectivityMonitor::new(ConnectivityState::Online);
        let repo = Repository::new(mirror.clone(), Arc::clone(&backend), utc(), Arc::new(Notify::new()));
        let orchestrator = SyncOrchestrator::new(
            mirror.clone(),
            backend,
            Arc::new(monitor.clone()),
            Duration::days(7),
        );
        Self {
            mirror,
            remote,
            monitor,
            repo,
            orchestrator,
        }
    }

    pub fn go_offline(&self) {
        self.remote.set_reachable(false);
        self.monitor.set_reachable(false);
    }

    pub fn go_online(&self) {
        self.remote.set_reachable(true);
        self.monitor.set_reachable(true);
    }

    /// Products created on another device, pulled into the mirror.
    pub async fn seed_products(&self, prices: &[(i64, i64)]) -> Vec<Product> {
        let products: Vec<Product> = prices
            .iter()
            .enumerate()
            .map(|(i, (price_cents, cost_cents))| Product {
                id: RecordId::new(),
                sku: format!("SKU-{i}"),
                name: format!("Product {i}"),
                price_cents: *price_cents,
                cost_cents: *cost_cents,
                stock_quantity: 100,
                created_at: at(8, 0),
            })
            .collect();

        for product in &products {
            self.remote
                .put_remote(EntityKind::Product, product.to_payload().unwrap())
                .unwrap();
        }
        let session = self.orchestrator.manual_sync().await.unwrap();
        assert!(session.records_pulled >= products.len() as u64);
        products
    }

    pub async fn watermark(&self, kind: EntityKind) -> Option<DateTime<Utc>> {
        self.mirror
            .with_transaction(move |tx| Box::pin(async move { tx.watermark(kind).await }))
            .await
            .unwrap()
    }
}

pub fn sale_of(staff: Option<RecordId>, sold_at: DateTime<Utc>, items: &[(&Product, i64)]) -> NewSale {
    NewSale {
        staff_id: staff,
        customer_name: None,
        sold_at: Some(sold_at),
        items: items
            .iter()
            .map(|(product, quantity)| NewSaleItem {
                product_id: product.id,
                quantity: *quantity,
                unit_price_cents: None,
            })
            .collect(),
        credit: None,
    }
}

pub fn expense(amount_cents: i64, incurred_at: DateTime<Utc>, staff: Option<RecordId>) -> Payload {
    Expense {
        id: RecordId::new(),
        category: "supplies".to_string(),
        description: None,
        amount_cents,
        incurred_at,
        staff_id: staff,
    }
    .to_payload()
    .unwrap()
}
