use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use mercato_core::RecordId;
use serde_json::Value;

use super::{RemoteAck, RemoteRow, RemoteStore, RemoteUpsert};
use crate::entity::RowQuery;
use crate::error::RemoteError;
use crate::types::{EntityKind, Payload, RecordRef, now_micros};

/// In-memory remote store.
///
/// Intended for tests/dev. Enforces foreign keys the way the relational
/// backend does and can simulate outages, rejections and edits made by other
/// devices.
#[derive(Debug, Default)]
pub struct InMemoryRemoteStore {
    state: Mutex<State>,
    unreachable: AtomicBool,
    fail_fetch: AtomicBool,
    upsert_calls: AtomicU64,
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<EntityKind, BTreeMap<RecordId, RemoteRow>>,
    clock: Option<DateTime<Utc>>,
    rejected: HashSet<RecordId>,
    /// Remaining upserts before the store goes unreachable.
    upserts_until_outage: Option<u64>,
    /// Effective writes in acceptance order.
    write_log: Vec<RecordRef>,
}

impl State {
    /// Server clock; strictly increasing.
    fn tick(&mut self) -> DateTime<Utc> {
        let now = now_micros();
        let next = match self.clock {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.clock = Some(next);
        next
    }

    fn is_live(&self, kind: EntityKind, id: RecordId) -> bool {
        self.tables
            .get(&kind)
            .and_then(|t| t.get(&id))
            .is_some_and(|row| !row.deleted)
    }
}

impl InMemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, RemoteError> {
        self.state
            .lock()
            .map_err(|_| RemoteError::Transient("lock poisoned".to_string()))
    }

    fn check_reachable(&self) -> Result<(), RemoteError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(RemoteError::Transient("connection refused".to_string()));
        }
        Ok(())
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    /// Go unreachable after `n` more upsert calls.
    pub fn fail_after_upserts(&self, n: u64) {
        if let Ok(mut state) = self.state.lock() {
            state.upserts_until_outage = Some(n);
        }
    }

    /// Refuse every upsert of `id`.
    pub fn reject(&self, id: RecordId) {
        if let Ok(mut state) = self.state.lock() {
            state.rejected.insert(id);
        }
    }

    pub fn set_fail_fetch(&self, fail: bool) {
        self.fail_fetch.store(fail, Ordering::SeqCst);
    }

    /// Upsert calls received, including replays and refused ones.
    pub fn upsert_calls(&self) -> u64 {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    /// Rows that actually changed, in the order they were accepted.
    pub fn write_log(&self) -> Vec<RecordRef> {
        self.state.lock().map(|s| s.write_log.clone()).unwrap_or_default()
    }

    /// Visible rows of one table.
    pub fn rows(&self, kind: EntityKind) -> Vec<RemoteRow> {
        self.state
            .lock()
            .map(|s| {
                s.tables
                    .get(&kind)
                    .map(|t| t.values().filter(|r| !r.deleted).cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    pub fn row(&self, kind: EntityKind, id: RecordId) -> Option<RemoteRow> {
        self.state.lock().ok()?.tables.get(&kind)?.get(&id).cloned()
    }

    /// Write a row as another device would, bypassing the call counters.
    pub fn put_remote(&self, kind: EntityKind, mut payload: Payload) -> Option<RemoteRow> {
        let mut state = self.state.lock().ok()?;
        let id = match payload.get("id").and_then(Value::as_str) {
            Some(raw) => raw.parse::<RecordId>().ok()?,
            None => {
                let id = RecordId::new();
                payload.insert("id".into(), Value::String(id.to_string()));
                id
            }
        };

        let row = RemoteRow {
            id,
            payload,
            deleted: false,
            updated_at: state.tick(),
        };
        state.tables.entry(kind).or_default().insert(id, row.clone());
        Some(row)
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    async fn upsert(&self, kind: EntityKind, row: RemoteUpsert) -> Result<RemoteAck, RemoteError> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;

        let mut state = self.state()?;
        if let Some(remaining) = state.upserts_until_outage {
            if remaining == 0 {
                self.unreachable.store(true, Ordering::SeqCst);
                state.upserts_until_outage = None;
                return Err(RemoteError::Transient("connection reset".to_string()));
            }
            state.upserts_until_outage = Some(remaining - 1);
        }

        if state.rejected.contains(&row.id) {
            return Err(RemoteError::Rejected(format!("{kind}/{}: refused by server", row.id)));
        }

        let spec = kind.spec();
        if !row.deleted {
            spec.project(&row.payload)
                .map_err(|e| RemoteError::Rejected(e.to_string()))?;
            for (target, parent) in spec.referenced_ids(&row.payload) {
                if !state.is_live(target, parent) {
                    return Err(RemoteError::Rejected(format!(
                        "{kind}/{}: foreign key {target}/{parent} does not exist",
                        row.id
                    )));
                }
            }
        }

        if let Some(existing) = state.tables.get(&kind).and_then(|t| t.get(&row.id)) {
            if existing.payload == row.payload && existing.deleted == row.deleted {
                return Ok(RemoteAck {
                    id: row.id,
                    updated_at: existing.updated_at,
                });
            }
        }

        let updated_at = state.tick();
        state.tables.entry(kind).or_default().insert(
            row.id,
            RemoteRow {
                id: row.id,
                payload: row.payload,
                deleted: row.deleted,
                updated_at,
            },
        );
        state.write_log.push(RecordRef::new(kind, row.id));

        Ok(RemoteAck { id: row.id, updated_at })
    }

    async fn fetch_updated_since(
        &self,
        kind: EntityKind,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemoteRow>, RemoteError> {
        self.check_reachable()?;
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(RemoteError::Transient("fetch timed out".to_string()));
        }

        let state = self.state()?;
        let mut rows: Vec<RemoteRow> = state
            .tables
            .get(&kind)
            .map(|t| {
                t.values()
                    .filter(|r| since.is_none_or(|s| r.updated_at > s))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by_key(|r| (r.updated_at, r.id));
        Ok(rows)
    }

    async fn query(&self, query: &RowQuery) -> Result<Vec<RemoteRow>, RemoteError> {
        self.check_reachable()?;

        let state = self.state()?;
        let spec = query.kind.spec();
        let mut matched: Vec<(Option<DateTime<Utc>>, RemoteRow)> = state
            .tables
            .get(&query.kind)
            .map(|t| {
                t.values()
                    .filter(|r| !r.deleted)
                    .filter_map(|r| {
                        let projection = spec.project(&r.payload).ok()?;
                        query
                            .matches(r.id, &projection)
                            .then(|| (projection.occurred_at, r.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        matched.sort_by_key(|(at, r)| (*at, r.id));
        Ok(matched.into_iter().map(|(_, r)| r).collect())
    }
}
