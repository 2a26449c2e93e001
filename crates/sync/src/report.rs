//! Period reports, computed the same way on both read paths.

use chrono::{FixedOffset, NaiveDate, Utc};
use mercato_core::{DomainError, DomainResult, PeriodKind, RecordId, TimeRange, period_range};
use serde::{Deserialize, Serialize};

use crate::entity::{CustomerDebt, Entity, Expense, RowQuery, Sale, SaleItem, SaleReturn};
use crate::error::RepositoryError;
use crate::source::{DataSource, RowView};
use crate::types::EntityKind;

/// Whose activity a report covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "scope", content = "staff_id")]
pub enum ActorScope {
    #[default]
    All,
    Staff(RecordId),
}

impl ActorScope {
    pub fn actor(&self) -> Option<RecordId> {
        match self {
            ActorScope::All => None,
            ActorScope::Staff(id) => Some(*id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRequest {
    pub period: PeriodKind,
    /// Any local calendar date inside the wanted period.
    pub anchor: NaiveDate,
    #[serde(default)]
    pub scope: ActorScope,
}

impl ReportRequest {
    /// The period containing today, as seen at `offset`.
    pub fn current(period: PeriodKind, scope: ActorScope, offset: FixedOffset) -> Self {
        Self {
            period,
            anchor: Utc::now().with_timezone(&offset).date_naive(),
            scope,
        }
    }

    pub fn range(&self, offset: FixedOffset) -> DomainResult<TimeRange> {
        period_range(self.period, self.anchor, offset)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportAggregate {
    pub period: PeriodKind,
    pub range: TimeRange,
    pub scope: ActorScope,
    pub sales_count: u64,
    pub items_sold: i64,
    pub gross_sales_cents: i64,
    pub cost_of_goods_cents: i64,
    pub returns_cents: i64,
    pub expenses_cents: i64,
    /// Gross sales minus returns.
    pub net_sales_cents: i64,
    /// Net sales minus cost of goods.
    pub gross_profit_cents: i64,
    /// Gross profit minus expenses.
    pub net_profit_cents: i64,
    pub debt_issued_cents: i64,
}

/// Rows a report is computed from, already filtered to one range and scope.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportInputs {
    pub sales: Vec<RowView>,
    pub items: Vec<RowView>,
    pub returns: Vec<RowView>,
    pub expenses: Vec<RowView>,
    pub debts: Vec<RowView>,
}

/// Fold report inputs into totals.
pub fn aggregate(request: &ReportRequest, range: TimeRange, inputs: &ReportInputs) -> DomainResult<ReportAggregate> {
    let mut report = ReportAggregate {
        period: request.period,
        range,
        scope: request.scope,
        sales_count: 0,
        items_sold: 0,
        gross_sales_cents: 0,
        cost_of_goods_cents: 0,
        returns_cents: 0,
        expenses_cents: 0,
        net_sales_cents: 0,
        gross_profit_cents: 0,
        net_profit_cents: 0,
        debt_issued_cents: 0,
    };

    for row in &inputs.sales {
        let sale = Sale::from_payload(&row.payload)?;
        report.sales_count += 1;
        report.gross_sales_cents = add(report.gross_sales_cents, sale.total_cents, "gross sales")?;
    }
    for row in &inputs.items {
        let item = SaleItem::from_payload(&row.payload)?;
        let cost = item
            .quantity
            .checked_mul(item.unit_cost_cents)
            .ok_or_else(|| DomainError::out_of_range("cost of goods"))?;
        report.items_sold = add(report.items_sold, item.quantity, "items sold")?;
        report.cost_of_goods_cents = add(report.cost_of_goods_cents, cost, "cost of goods")?;
    }
    for row in &inputs.returns {
        let amount = SaleReturn::from_payload(&row.payload)?.amount_cents;
        report.returns_cents = add(report.returns_cents, amount, "returns")?;
    }
    for row in &inputs.expenses {
        let amount = Expense::from_payload(&row.payload)?.amount_cents;
        report.expenses_cents = add(report.expenses_cents, amount, "expenses")?;
    }
    for row in &inputs.debts {
        let amount = CustomerDebt::from_payload(&row.payload)?.amount_cents;
        report.debt_issued_cents = add(report.debt_issued_cents, amount, "debt issued")?;
    }

    report.net_sales_cents = sub(report.gross_sales_cents, report.returns_cents, "net sales")?;
    report.gross_profit_cents = sub(report.net_sales_cents, report.cost_of_goods_cents, "gross profit")?;
    report.net_profit_cents = sub(report.gross_profit_cents, report.expenses_cents, "net profit")?;

    Ok(report)
}

fn add(total: i64, amount: i64, what: &str) -> DomainResult<i64> {
    total.checked_add(amount).ok_or_else(|| DomainError::out_of_range(what))
}

fn sub(total: i64, amount: i64, what: &str) -> DomainResult<i64> {
    total.checked_sub(amount).ok_or_else(|| DomainError::out_of_range(what))
}

/// Build a report from whichever path `source` is.
pub async fn build_report(
    source: &dyn DataSource,
    request: &ReportRequest,
    offset: FixedOffset,
) -> Result<ReportAggregate, RepositoryError> {
    let range = request.range(offset)?;
    let filter = |kind: EntityKind| RowQuery::all(kind).occurred_in(range).by_actor(request.scope.actor());

    let queries = [
        EntityKind::Sale,
        EntityKind::SaleItem,
        EntityKind::SaleReturn,
        EntityKind::Expense,
        EntityKind::CustomerDebt,
    ]
    .map(filter);

    // One read so the tables agree with each other.
    let mut results = source.rows_many(&queries).await?.into_iter();
    let mut next = || results.next().unwrap_or_default();
    let inputs = ReportInputs {
        sales: next(),
        items: next(),
        returns: next(),
        expenses: next(),
        debts: next(),
    };

    Ok(aggregate(request, range, &inputs)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::{Value, json};

    fn row(kind: EntityKind, value: Value) -> RowView {
        let payload = match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        };
        let id = payload["id"].as_str().unwrap().parse().unwrap();
        RowView { kind, id, payload }
    }

    #[test]
    fn totals_follow_the_profit_chain() {
        let sale_id = RecordId::new();
        let request = ReportRequest {
            period: PeriodKind::Day,
            anchor: NaiveDate::from_ymd_opt(2024, 6, 3).unwrap(),
            scope: ActorScope::All,
        };
        let range = request.range(FixedOffset::east_opt(0).unwrap()).unwrap();

        let inputs = ReportInputs {
            sales: vec![row(
                EntityKind::Sale,
                json!({ "id": sale_id.to_string(), "staff_id": null, "sold_at": "2024-06-03T10:00:00Z", "total_cents": 1000 }),
            )],
            items: vec![row(
                EntityKind::SaleItem,
                json!({
                    "id": RecordId::new().to_string(),
                    "sale_id": sale_id.to_string(),
                    "product_id": RecordId::new().to_string(),
                    "sold_at": "2024-06-03T10:00:00Z",
                    "staff_id": null,
                    "quantity": 4,
                    "unit_price_cents": 250,
                    "unit_cost_cents": 100,
                    "line_total_cents": 1000,
                }),
            )],
            returns: vec![row(
                EntityKind::SaleReturn,
                json!({ "id": RecordId::new().to_string(), "sale_id": sale_id.to_string(), "amount_cents": 250, "returned_at": "2024-06-03T11:00:00Z", "staff_id": null }),
            )],
            expenses: vec![row(
                EntityKind::Expense,
                json!({ "id": RecordId::new().to_string(), "category": "fuel", "amount_cents": 150, "incurred_at": "2024-06-03T12:00:00Z", "staff_id": null }),
            )],
            debts: vec![row(
                EntityKind::CustomerDebt,
                json!({ "id": RecordId::new().to_string(), "customer_name": "Juma", "amount_cents": 300, "recorded_at": "2024-06-03T10:00:00Z", "staff_id": null }),
            )],
        };

        let report = aggregate(&request, range, &inputs).unwrap();
        assert_eq!(report.sales_count, 1);
        assert_eq!(report.items_sold, 4);
        assert_eq!(report.cost_of_goods_cents, 400);
        assert_eq!(report.net_sales_cents, 750);
        assert_eq!(report.gross_profit_cents, 350);
        assert_eq!(report.net_profit_cents, 200);
        assert_eq!(report.debt_issued_cents, 300);
        assert_eq!(report.range.start, Utc.with_ymd_and_hms(2024, 6, 3, 0, 0, 0).unwrap());
    }

    #[test]
    fn overflowing_totals_are_an_error() {
        let request = ReportRequest {
            period: PeriodKind::Day,
            anchor: NaiveDate::from_ymd_opt(2024, 6, 3).unwrap(),
            scope: ActorScope::All,
        };
        let range = request.range(FixedOffset::east_opt(0).unwrap()).unwrap();
        let expense = |amount: i64| {
            row(
                EntityKind::Expense,
                json!({ "id": RecordId::new().to_string(), "category": "rent", "amount_cents": amount, "incurred_at": "2024-06-03T12:00:00Z", "staff_id": null }),
            )
        };
        let inputs = ReportInputs {
            expenses: vec![expense(i64::MAX), expense(1)],
            ..ReportInputs::default()
        };

        let err = aggregate(&request, range, &inputs).unwrap_err();
        assert!(matches!(err, DomainError::OutOfRange(_)));
    }

    #[test]
    fn empty_inputs_give_a_zero_report() {
        let request = ReportRequest::current(PeriodKind::Week, ActorScope::All, FixedOffset::east_opt(0).unwrap());
        let range = request.range(FixedOffset::east_opt(0).unwrap()).unwrap();
        let report = aggregate(&request, range, &ReportInputs::default()).unwrap();
        assert_eq!(report.sales_count, 0);
        assert_eq!(report.net_profit_cents, 0);
    }
}
