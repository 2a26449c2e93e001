//! Dual-path repository: one connectivity snapshot per call decides whether
//! a read is answered by the remote store or by the mirror. Writes always go
//! to the mirror first.

use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Utc};
use mercato_core::{DomainError, RecordId};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::connectivity::{ConnectivityProvider, ConnectivitySnapshot};
use crate::entity::{CustomerDebt, Entity, Product, RowQuery, Sale, SaleItem};
use crate::error::{RepositoryError, StorageError};
use crate::mirror::{MirrorStore, MirrorTx};
use crate::remote::RemoteStore;
use crate::report::{ReportAggregate, ReportRequest, build_report};
use crate::source::{DataSource, LocalSource, RemoteSource, RowView};
use crate::types::{EntityKind, Payload, RecordRef, SyncableRecord, now_micros};

/// One line of a sale being recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSaleItem {
    pub product_id: RecordId,
    pub quantity: i64,
    /// Defaults to the product's current price.
    #[serde(default)]
    pub unit_price_cents: Option<i64>,
}

/// Part of a sale paid on credit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCredit {
    pub customer_name: String,
    pub amount_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSale {
    pub staff_id: Option<RecordId>,
    #[serde(default)]
    pub customer_name: Option<String>,
    /// Defaults to now.
    #[serde(default)]
    pub sold_at: Option<DateTime<Utc>>,
    pub items: Vec<NewSaleItem>,
    #[serde(default)]
    pub credit: Option<NewCredit>,
}

/// What `record_sale` stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleReceipt {
    pub sale: RecordRef,
    pub items: Vec<RecordRef>,
    pub debt: Option<RecordRef>,
    pub total_cents: i64,
}

#[derive(Clone)]
pub struct Repository {
    mirror: MirrorStore,
    remote: Arc<dyn RemoteStore>,
    offset: FixedOffset,
    nudge: Arc<Notify>,
}

impl Repository {
    pub fn new(mirror: MirrorStore, remote: Arc<dyn RemoteStore>, offset: FixedOffset, nudge: Arc<Notify>) -> Self {
        Self {
            mirror,
            remote,
            offset,
            nudge,
        }
    }

    pub fn mirror(&self) -> &MirrorStore {
        &self.mirror
    }

    /// Pick the read path from exactly one snapshot.
    async fn with_source<T, F>(&self, conn: &dyn ConnectivityProvider, read: F) -> Result<T, RepositoryError>
    where
        F: for<'s> FnOnce(&'s dyn DataSource) -> crate::mirror::TxFuture<'s, Result<T, RepositoryError>>,
    {
        if conn.snapshot().reachable {
            let source = RemoteSource::new(self.remote.as_ref(), &self.mirror, conn);
            read(&source).await
        } else {
            let source = LocalSource::new(self.mirror.clone());
            read(&source).await
        }
    }

    pub async fn get_report(
        &self,
        conn: &dyn ConnectivityProvider,
        request: ReportRequest,
    ) -> Result<ReportAggregate, RepositoryError> {
        let offset = self.offset;
        self.with_source(conn, move |source| {
            Box::pin(async move { build_report(source, &request, offset).await })
        })
        .await
    }

    pub async fn list(&self, conn: &dyn ConnectivityProvider, query: RowQuery) -> Result<Vec<RowView>, RepositoryError> {
        self.with_source(conn, move |source| Box::pin(async move { source.rows(&query).await }))
            .await
    }

    pub async fn get(&self, conn: &dyn ConnectivityProvider, record: RecordRef) -> Result<Option<RowView>, RepositoryError> {
        let rows = self
            .list(conn, RowQuery::all(record.kind).with_ids(vec![record.id]))
            .await?;
        Ok(rows.into_iter().next())
    }

    /// Store a new record locally; returns its client-assigned key.
    pub async fn write(
        &self,
        conn: &dyn ConnectivityProvider,
        kind: EntityKind,
        payload: Payload,
    ) -> Result<RecordRef, RepositoryError> {
        let snapshot = conn.snapshot();
        let record = self
            .mirror
            .with_transaction(move |tx| Box::pin(async move { tx.insert(kind, payload).await }))
            .await?;
        self.after_write(snapshot);
        Ok(record.record_ref())
    }

    /// Store several new records atomically.
    pub async fn write_batch(
        &self,
        conn: &dyn ConnectivityProvider,
        rows: Vec<(EntityKind, Payload)>,
    ) -> Result<Vec<RecordRef>, RepositoryError> {
        let snapshot = conn.snapshot();
        let refs = self
            .mirror
            .with_transaction(move |tx| {
                Box::pin(async move {
                    let mut refs = Vec::with_capacity(rows.len());
                    for (kind, payload) in rows {
                        refs.push(tx.insert(kind, payload).await?.record_ref());
                    }
                    Ok::<_, StorageError>(refs)
                })
            })
            .await?;
        self.after_write(snapshot);
        Ok(refs)
    }

    /// Record a sale header, its line items and an optional credit debt in one
    /// transaction. Totals are computed from the items.
    pub async fn record_sale(&self, conn: &dyn ConnectivityProvider, sale: NewSale) -> Result<SaleReceipt, RepositoryError> {
        let snapshot = conn.snapshot();
        if sale.items.is_empty() {
            return Err(DomainError::validation("a sale needs at least one item").into());
        }

        let receipt = self
            .mirror
            .with_transaction(move |tx| Box::pin(async move { insert_sale(tx, sale).await }))
            .await?;

        tracing::info!(sale = %receipt.sale, items = receipt.items.len(), total_cents = receipt.total_cents, "recorded sale");
        self.after_write(snapshot);
        Ok(receipt)
    }

    pub async fn update(
        &self,
        conn: &dyn ConnectivityProvider,
        record: RecordRef,
        patch: Payload,
    ) -> Result<SyncableRecord, RepositoryError> {
        let snapshot = conn.snapshot();
        let updated = self
            .mirror
            .with_transaction(move |tx| Box::pin(async move { tx.update_payload(record, patch).await }))
            .await?;
        self.after_write(snapshot);
        Ok(updated)
    }

    pub async fn delete(&self, conn: &dyn ConnectivityProvider, record: RecordRef) -> Result<(), RepositoryError> {
        let snapshot = conn.snapshot();
        self.mirror
            .with_transaction(move |tx| Box::pin(async move { tx.soft_delete(record).await }))
            .await?;
        self.after_write(snapshot);
        Ok(())
    }

    pub async fn pending_count(&self) -> Result<u64, RepositoryError> {
        Ok(self
            .mirror
            .with_transaction(|tx| Box::pin(async move { tx.pending_count().await }))
            .await?)
    }

    pub async fn conflicts(&self) -> Result<Vec<SyncableRecord>, RepositoryError> {
        Ok(self
            .mirror
            .with_transaction(|tx| Box::pin(async move { tx.conflicts().await }))
            .await?)
    }

    pub async fn requeue_conflict(
        &self,
        conn: &dyn ConnectivityProvider,
        record: RecordRef,
    ) -> Result<SyncableRecord, RepositoryError> {
        let snapshot = conn.snapshot();
        let requeued = self
            .mirror
            .with_transaction(move |tx| Box::pin(async move { tx.requeue_conflict(record).await }))
            .await?;
        self.after_write(snapshot);
        Ok(requeued)
    }

    /// Ask the worker to push; never waits on the remote.
    fn after_write(&self, snapshot: ConnectivitySnapshot) {
        if snapshot.reachable {
            self.nudge.notify_one();
        }
    }
}

async fn insert_sale(tx: &mut MirrorTx, sale: NewSale) -> Result<SaleReceipt, StorageError> {
    let sale_id = RecordId::new();
    let sold_at = sale.sold_at.unwrap_or_else(now_micros);

    // Header first so a failing line rolls everything back with it.
    let header = Sale {
        id: sale_id,
        staff_id: sale.staff_id,
        customer_name: sale.customer_name.clone(),
        sold_at,
        total_cents: 0,
    };
    let header_ref = tx.insert(EntityKind::Sale, header.to_payload()?).await?.record_ref();

    let mut items = Vec::with_capacity(sale.items.len());
    let mut total_cents = 0i64;
    for line in &sale.items {
        if line.quantity <= 0 {
            return Err(DomainError::validation(format!("quantity must be positive, got {}", line.quantity)).into());
        }

        let product_ref = RecordRef::new(EntityKind::Product, line.product_id);
        let product_row = tx.get(product_ref).await?.ok_or(StorageError::NotFound(product_ref))?;
        let product = Product::from_payload(&product_row.payload)?;

        let unit_price_cents = line.unit_price_cents.unwrap_or(product.price_cents);
        if unit_price_cents < 0 {
            return Err(DomainError::validation("unit price cannot be negative").into());
        }
        let line_total_cents = unit_price_cents
            .checked_mul(line.quantity)
            .ok_or_else(|| DomainError::out_of_range(format!("line total of {} x {unit_price_cents}", line.quantity)))?;
        total_cents = total_cents
            .checked_add(line_total_cents)
            .ok_or_else(|| DomainError::out_of_range("sale total"))?;

        let item = SaleItem {
            id: RecordId::new(),
            sale_id,
            product_id: line.product_id,
            sold_at,
            staff_id: sale.staff_id,
            quantity: line.quantity,
            unit_price_cents,
            unit_cost_cents: product.cost_cents,
            line_total_cents,
        };
        items.push(tx.insert(EntityKind::SaleItem, item.to_payload()?).await?.record_ref());
    }

    let mut total_patch = Payload::new();
    total_patch.insert("total_cents".into(), total_cents.into());
    tx.update_payload(header_ref, total_patch).await?;

    let debt = match &sale.credit {
        Some(credit) => {
            if credit.amount_cents <= 0 || credit.amount_cents > total_cents {
                return Err(DomainError::validation(format!(
                    "credit of {} must be positive and at most the sale total {total_cents}",
                    credit.amount_cents
                ))
                .into());
            }
            let debt = CustomerDebt {
                id: RecordId::new(),
                customer_name: credit.customer_name.clone(),
                sale_id: Some(sale_id),
                amount_cents: credit.amount_cents,
                paid_cents: 0,
                recorded_at: sold_at,
                staff_id: sale.staff_id,
            };
            Some(tx.insert(EntityKind::CustomerDebt, debt.to_payload()?).await?.record_ref())
        }
        None => None,
    };

    Ok(SaleReceipt {
        sale: header_ref,
        items,
        debt,
        total_cents,
    })
}
