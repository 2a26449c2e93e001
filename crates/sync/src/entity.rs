//! Domain entities mirrored on the device and their table metadata.
//!
//! Every table shares one column layout. [`TableSpec`] names the payload
//! fields that feed the queryable columns (timestamp, amount, actor, parent)
//! and declares which tables must be pushed before it. The projection is the
//! single definition both the mirror and the remote filters use, so the two
//! read paths cannot disagree about what a row means.

use chrono::{DateTime, Utc};
use mercato_core::{DomainError, DomainResult, RecordId, TimeRange};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{EntityKind, Payload};

/// A foreign key carried in the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reference {
    pub field: &'static str,
    pub target: EntityKind,
    pub required: bool,
}

/// Static description of one mirrored table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSpec {
    pub kind: EntityKind,
    pub occurred_at_field: Option<&'static str>,
    pub amount_field: Option<&'static str>,
    pub actor_field: Option<&'static str>,
    /// Foreign keys; the first one is the parent used for `parent_id` lookups.
    pub references: &'static [Reference],
    /// Tables whose pending rows must be pushed first.
    pub depends_on: &'static [EntityKind],
}

const SALE_ITEM_REFS: &[Reference] = &[
    Reference { field: "sale_id", target: EntityKind::Sale, required: true },
    Reference { field: "product_id", target: EntityKind::Product, required: true },
];
const DEBT_REFS: &[Reference] = &[Reference { field: "sale_id", target: EntityKind::Sale, required: false }];
const RETURN_REFS: &[Reference] = &[Reference { field: "sale_id", target: EntityKind::Sale, required: true }];

const STAFF: TableSpec = TableSpec {
    kind: EntityKind::Staff,
    occurred_at_field: Some("joined_at"),
    amount_field: None,
    actor_field: None,
    references: &[],
    depends_on: &[],
};
const PRODUCT: TableSpec = TableSpec {
    kind: EntityKind::Product,
    occurred_at_field: Some("created_at"),
    amount_field: Some("price_cents"),
    actor_field: None,
    references: &[],
    depends_on: &[],
};
const SALE: TableSpec = TableSpec {
    kind: EntityKind::Sale,
    occurred_at_field: Some("sold_at"),
    amount_field: Some("total_cents"),
    actor_field: Some("staff_id"),
    references: &[],
    depends_on: &[],
};
const SALE_ITEM: TableSpec = TableSpec {
    kind: EntityKind::SaleItem,
    occurred_at_field: Some("sold_at"),
    amount_field: Some("line_total_cents"),
    actor_field: Some("staff_id"),
    references: SALE_ITEM_REFS,
    depends_on: &[EntityKind::Sale, EntityKind::Product],
};
const CUSTOMER_DEBT: TableSpec = TableSpec {
    kind: EntityKind::CustomerDebt,
    occurred_at_field: Some("recorded_at"),
    amount_field: Some("amount_cents"),
    actor_field: Some("staff_id"),
    references: DEBT_REFS,
    depends_on: &[EntityKind::Sale],
};
const EXPENSE: TableSpec = TableSpec {
    kind: EntityKind::Expense,
    occurred_at_field: Some("incurred_at"),
    amount_field: Some("amount_cents"),
    actor_field: Some("staff_id"),
    references: &[],
    depends_on: &[],
};
const SALE_RETURN: TableSpec = TableSpec {
    kind: EntityKind::SaleReturn,
    occurred_at_field: Some("returned_at"),
    amount_field: Some("amount_cents"),
    actor_field: Some("staff_id"),
    references: RETURN_REFS,
    depends_on: &[EntityKind::Sale],
};
const PURCHASE_ORDER: TableSpec = TableSpec {
    kind: EntityKind::PurchaseOrder,
    occurred_at_field: Some("ordered_at"),
    amount_field: Some("total_cents"),
    actor_field: Some("staff_id"),
    references: &[],
    depends_on: &[],
};

impl EntityKind {
    pub fn spec(&self) -> &'static TableSpec {
        match self {
            EntityKind::Staff => &STAFF,
            EntityKind::Product => &PRODUCT,
            EntityKind::Sale => &SALE,
            EntityKind::SaleItem => &SALE_ITEM,
            EntityKind::CustomerDebt => &CUSTOMER_DEBT,
            EntityKind::Expense => &EXPENSE,
            EntityKind::SaleReturn => &SALE_RETURN,
            EntityKind::PurchaseOrder => &PURCHASE_ORDER,
        }
    }
}

/// Tables grouped into dependency levels.
///
/// Every table appears after all tables it depends on; tables within one level
/// are independent of each other.
pub fn push_levels() -> Vec<Vec<EntityKind>> {
    let mut placed: Vec<EntityKind> = Vec::new();
    let mut levels = Vec::new();

    while placed.len() < EntityKind::ALL.len() {
        let level: Vec<EntityKind> = EntityKind::ALL
            .into_iter()
            .filter(|k| !placed.contains(k))
            .filter(|k| k.spec().depends_on.iter().all(|d| placed.contains(d)))
            .collect();
        if level.is_empty() {
            // Only reachable with a cycle in the static table specs.
            break;
        }
        placed.extend(level.iter().copied());
        levels.push(level);
    }

    levels
}

/// Queryable columns derived from a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Projection {
    pub occurred_at: Option<DateTime<Utc>>,
    pub amount_cents: i64,
    pub actor_id: Option<RecordId>,
    pub parent_id: Option<RecordId>,
}

impl TableSpec {
    /// Extract and validate the queryable columns of `payload`.
    pub fn project(&self, payload: &Payload) -> DomainResult<Projection> {
        let occurred_at = match self.occurred_at_field {
            Some(field) => Some(required_field::<DateTime<Utc>>(self.kind, payload, field)?),
            None => None,
        };
        let amount_cents = match self.amount_field {
            Some(field) => required_field::<i64>(self.kind, payload, field)?,
            None => 0,
        };
        let actor_id = match self.actor_field {
            Some(field) => optional_field::<RecordId>(self.kind, payload, field)?,
            None => None,
        };

        let mut parent_id = None;
        for (idx, reference) in self.references.iter().enumerate() {
            let value = if reference.required {
                Some(required_field::<RecordId>(self.kind, payload, reference.field)?)
            } else {
                optional_field::<RecordId>(self.kind, payload, reference.field)?
            };
            if idx == 0 {
                parent_id = value;
            }
        }

        Ok(Projection {
            occurred_at,
            amount_cents,
            actor_id,
            parent_id,
        })
    }

    /// Foreign keys present in `payload`, as `(target table, id)` pairs.
    pub fn referenced_ids(&self, payload: &Payload) -> Vec<(EntityKind, RecordId)> {
        self.references
            .iter()
            .filter_map(|r| {
                let id = payload.get(r.field)?.as_str()?.parse::<RecordId>().ok()?;
                Some((r.target, id))
            })
            .collect()
    }
}

fn required_field<T: DeserializeOwned>(kind: EntityKind, payload: &Payload, field: &str) -> DomainResult<T> {
    optional_field(kind, payload, field)?
        .ok_or_else(|| DomainError::missing_field(kind.to_string(), field))
}

fn optional_field<T: DeserializeOwned>(kind: EntityKind, payload: &Payload, field: &str) -> DomainResult<Option<T>> {
    match payload.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|e| DomainError::validation(format!("{kind}: invalid field '{field}': {e}"))),
    }
}

/// Row filter understood by both the mirror and the remote store.
///
/// Soft-deleted rows never match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowQuery {
    pub kind: EntityKind,
    pub occurred_in: Option<TimeRange>,
    pub actor: Option<RecordId>,
    pub parent_ids: Option<Vec<RecordId>>,
    pub ids: Option<Vec<RecordId>>,
}

impl RowQuery {
    pub fn all(kind: EntityKind) -> Self {
        Self {
            kind,
            occurred_in: None,
            actor: None,
            parent_ids: None,
            ids: None,
        }
    }

    pub fn occurred_in(mut self, range: TimeRange) -> Self {
        self.occurred_in = Some(range);
        self
    }

    pub fn by_actor(mut self, actor: Option<RecordId>) -> Self {
        self.actor = actor;
        self
    }

    pub fn with_parents(mut self, parents: Vec<RecordId>) -> Self {
        self.parent_ids = Some(parents);
        self
    }

    pub fn with_ids(mut self, ids: Vec<RecordId>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// True when an id/parent list was given but is empty.
    pub fn is_empty_selection(&self) -> bool {
        matches!(&self.parent_ids, Some(p) if p.is_empty()) || matches!(&self.ids, Some(i) if i.is_empty())
    }

    pub fn matches(&self, id: RecordId, projection: &Projection) -> bool {
        if let Some(range) = &self.occurred_in {
            match projection.occurred_at {
                Some(at) if range.contains(at) => {}
                _ => return false,
            }
        }
        if let Some(actor) = self.actor {
            if projection.actor_id != Some(actor) {
                return false;
            }
        }
        if let Some(parents) = &self.parent_ids {
            match projection.parent_id {
                Some(parent) if parents.contains(&parent) => {}
                _ => return false,
            }
        }
        if let Some(ids) = &self.ids {
            if !ids.contains(&id) {
                return false;
            }
        }
        true
    }
}

/// A typed view over a mirrored payload.
pub trait Entity: Serialize + DeserializeOwned {
    const KIND: EntityKind;

    fn id(&self) -> RecordId;

    fn to_payload(&self) -> DomainResult<Payload> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(DomainError::invariant(format!("{} did not serialize to an object", Self::KIND))),
            Err(e) => Err(DomainError::validation(format!("{}: {e}", Self::KIND))),
        }
    }

    fn from_payload(payload: &Payload) -> DomainResult<Self> {
        serde_json::from_value(Value::Object(payload.clone()))
            .map_err(|e| DomainError::validation(format!("{}: {e}", Self::KIND)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Staff {
    pub id: RecordId,
    pub name: String,
    pub role: String,
    pub joined_at: DateTime<Utc>,
    #[serde(default = "default_true")]
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: RecordId,
    pub sku: String,
    pub name: String,
    /// Prices in smallest currency unit (e.g., cents).
    pub price_cents: i64,
    pub cost_cents: i64,
    #[serde(default)]
    pub stock_quantity: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sale {
    pub id: RecordId,
    pub staff_id: Option<RecordId>,
    #[serde(default)]
    pub customer_name: Option<String>,
    pub sold_at: DateTime<Utc>,
    pub total_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleItem {
    pub id: RecordId,
    pub sale_id: RecordId,
    pub product_id: RecordId,
    /// Copied from the sale header so items filter by period and actor alone.
    pub sold_at: DateTime<Utc>,
    pub staff_id: Option<RecordId>,
    pub quantity: i64,
    pub unit_price_cents: i64,
    pub unit_cost_cents: i64,
    pub line_total_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerDebt {
    pub id: RecordId,
    pub customer_name: String,
    #[serde(default)]
    pub sale_id: Option<RecordId>,
    pub amount_cents: i64,
    #[serde(default)]
    pub paid_cents: i64,
    pub recorded_at: DateTime<Utc>,
    pub staff_id: Option<RecordId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expense {
    pub id: RecordId,
    pub category: String,
    #[serde(default)]
    pub description: Option<String>,
    pub amount_cents: i64,
    pub incurred_at: DateTime<Utc>,
    pub staff_id: Option<RecordId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleReturn {
    pub id: RecordId,
    pub sale_id: RecordId,
    pub amount_cents: i64,
    #[serde(default)]
    pub reason: Option<String>,
    pub returned_at: DateTime<Utc>,
    pub staff_id: Option<RecordId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseOrder {
    pub id: RecordId,
    pub supplier: String,
    pub total_cents: i64,
    pub ordered_at: DateTime<Utc>,
    pub staff_id: Option<RecordId>,
    #[serde(default = "default_po_status")]
    pub status: String,
}

fn default_true() -> bool {
    true
}

fn default_po_status() -> String {
    "open".to_string()
}

macro_rules! impl_entity {
    ($t:ty, $kind:expr) => {
        impl Entity for $t {
            const KIND: EntityKind = $kind;

            fn id(&self) -> RecordId {
                self.id
            }
        }
    };
}

impl_entity!(Staff, EntityKind::Staff);
impl_entity!(Product, EntityKind::Product);
impl_entity!(Sale, EntityKind::Sale);
impl_entity!(SaleItem, EntityKind::SaleItem);
impl_entity!(CustomerDebt, EntityKind::CustomerDebt);
impl_entity!(Expense, EntityKind::Expense);
impl_entity!(SaleReturn, EntityKind::SaleReturn);
impl_entity!(PurchaseOrder, EntityKind::PurchaseOrder);
