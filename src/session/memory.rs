use std::{
    cmp::Ordering,
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use serde_json::Value;

use super::{
    PersistenceSession,
    identity::{IdentityMap, PendingWrite, key_of},
};
use crate::{
    Error, Result,
    entity::{Entity, EntityMetadata},
    filter::total_order,
    metrics,
    query::{Query, QueryPlan},
};

static NULL_VALUE: Value = Value::Null;

#[derive(Clone, Debug)]
struct Row {
    id: Value,
    doc: Value,
}

#[derive(Debug, Default)]
struct Tables {
    tables: HashMap<String, BTreeMap<String, Row>>,
    writes_before_failure: Option<usize>,
}

/// Shared in-process backend. Clones see the same tables.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session<E: Entity>(&self) -> MemorySession<E> {
        MemorySession::new(self.clone())
    }

    /// Let `writes` more row writes succeed, then fail every following write with
    /// [`Error::Backend`].
    pub fn fail_writes_after(&self, writes: usize) {
        self.lock().writes_before_failure = Some(writes);
    }

    pub fn clear_fault(&self) {
        self.lock().writes_before_failure = None;
    }

    /// Committed rows in `table`.
    pub fn row_count(&self, table: &str) -> usize {
        self.lock().tables.get(table).map_or(0, BTreeMap::len)
    }

    /// Committed document for `id` in `table`.
    pub fn document(&self, table: &str, id: &Value) -> Option<Value> {
        self.lock()
            .tables
            .get(table)
            .and_then(|rows| rows.get(&key_of(id)))
            .map(|row| row.doc.clone())
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

type Overlay = BTreeMap<String, Option<Row>>;

/// Session over a [`MemoryStore`]. Writes made inside a transaction stay in a private
/// overlay until commit.
pub struct MemorySession<E: Entity> {
    store: MemoryStore,
    table: String,
    metadata: EntityMetadata<E>,
    identity: IdentityMap<E>,
    overlay: Option<Overlay>,
}

impl<E: Entity> MemorySession<E> {
    pub fn new(store: MemoryStore) -> Self {
        let metadata = E::metadata();
        Self {
            store,
            table: metadata.entity_name().to_string(),
            metadata,
            identity: IdentityMap::default(),
            overlay: None,
        }
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    fn row(&self, key: &str) -> Option<Row> {
        if let Some(staged) = self.overlay.as_ref().and_then(|o| o.get(key)) {
            return staged.clone();
        }
        self.store
            .lock()
            .tables
            .get(&self.table)
            .and_then(|rows| rows.get(key))
            .cloned()
    }

    fn visible_rows(&self) -> Vec<Row> {
        let mut rows = self
            .store
            .lock()
            .tables
            .get(&self.table)
            .cloned()
            .unwrap_or_default();
        if let Some(overlay) = &self.overlay {
            for (key, staged) in overlay {
                match staged {
                    Some(row) => rows.insert(key.clone(), row.clone()),
                    None => rows.remove(key),
                };
            }
        }
        rows.into_values().collect()
    }

    fn evaluate(&self, plan: &QueryPlan) -> Vec<Row> {
        let mut rows: Vec<Row> = self
            .visible_rows()
            .into_iter()
            .filter(|row| {
                plan.filter
                    .as_ref()
                    .is_none_or(|f| f.matches(|field: &str| row.doc.get(field)))
            })
            .collect();

        if let Some(sort) = &plan.sort {
            rows.sort_by(|a, b| {
                for key in sort.keys() {
                    let left = a.doc.get(&key.field).unwrap_or(&NULL_VALUE);
                    let right = b.doc.get(&key.field).unwrap_or(&NULL_VALUE);
                    let mut ord = total_order(left, right);
                    if key.ascending == plan.reverse {
                        ord = ord.reverse();
                    }
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            });
        }
        rows
    }

    fn consume_write_budget(&self) -> Result<()> {
        let mut tables = self.store.lock();
        match tables.writes_before_failure {
            Some(0) => Err(Error::Backend(format!(
                "write to `{}` rejected by injected fault",
                self.table
            ))),
            Some(n) => {
                tables.writes_before_failure = Some(n - 1);
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn put(&mut self, key: String, row: Option<Row>) {
        match self.overlay.as_mut() {
            Some(overlay) => {
                overlay.insert(key, row);
            }
            None => apply_row(&mut self.store.lock(), &self.table, key, row),
        }
    }

    fn apply(&mut self, write: PendingWrite) -> Result<()> {
        self.consume_write_budget()?;
        match write {
            PendingWrite::Insert { id, doc } => {
                let key = key_of(&id);
                if self.row(&key).is_some() {
                    return Err(Error::Backend(format!(
                        "duplicate key {key} in `{}`",
                        self.table
                    )));
                }
                self.put(key, Some(Row { id, doc }));
            }
            PendingWrite::Update { id, doc } => {
                let key = key_of(&id);
                if self.row(&key).is_none() {
                    return Err(Error::Backend(format!(
                        "no row {key} in `{}` to update",
                        self.table
                    )));
                }
                self.put(key, Some(Row { id, doc }));
            }
            PendingWrite::Delete { id } => {
                self.put(key_of(&id), None);
            }
        }
        metrics::record_entity_write();
        Ok(())
    }
}

fn apply_row(tables: &mut Tables, table: &str, key: String, row: Option<Row>) {
    let rows = tables.tables.entry(table.to_string()).or_default();
    match row {
        Some(row) => {
            rows.insert(key, row);
        }
        None => {
            rows.remove(&key);
        }
    }
}

fn window<T>(items: Vec<T>, query: &Query) -> Vec<T> {
    let skip = query.offset().unwrap_or(0) as usize;
    let take = query.limit().map_or(usize::MAX, |max| max as usize);
    items.into_iter().skip(skip).take(take).collect()
}

#[async_trait]
impl<E: Entity> PersistenceSession<E> for MemorySession<E> {
    async fn count(&mut self, query: &Query) -> Result<u64> {
        Ok(self.evaluate(query.plan()).len() as u64)
    }

    async fn identifiers(&mut self, query: &Query) -> Result<Vec<Value>> {
        let ids = self
            .evaluate(query.plan())
            .into_iter()
            .map(|row| row.id)
            .collect();
        Ok(window(ids, query))
    }

    async fn load(&mut self, id: &Value) -> Result<bool> {
        if let Some(present) = self.identity.unwritten(id)? {
            return Ok(present);
        }
        let Some(row) = self.row(&key_of(id)) else {
            self.identity.forget(id);
            return Ok(false);
        };
        let entity: E = serde_json::from_value(row.doc)?;
        self.identity.attach_clean(row.id, entity)?;
        metrics::record_entity_read();
        Ok(true)
    }

    fn managed(&self, id: &Value) -> Option<&E> {
        self.identity.get(id)
    }

    fn managed_mut(&mut self, id: &Value) -> Option<&mut E> {
        self.identity.get_mut(id)
    }

    fn take_managed(&mut self, id: &Value) -> Option<E> {
        self.identity.take(id)
    }

    fn persist(&mut self, entity: E) -> Result<Value> {
        let id = self.metadata.identifier_value(&entity)?;
        if self.identity.tracks(&id) {
            return Err(Error::contract(format!(
                "`{}` {id} is already managed by this session",
                self.table
            )));
        }
        self.identity.attach_new(id.clone(), entity);
        Ok(id)
    }

    async fn merge(&mut self, entity: E) -> Result<Value> {
        let id = self.metadata.identifier_value(&entity)?;
        let Some(entity) = self.identity.replace(&id, entity) else {
            return Ok(id);
        };
        if self.load(&id).await? {
            if let Some(managed) = self.identity.get_mut(&id) {
                *managed = entity;
            }
        } else {
            self.identity.attach_new(id.clone(), entity);
        }
        Ok(id)
    }

    fn remove(&mut self, id: &Value) -> Result<()> {
        self.identity.mark_removed(id);
        Ok(())
    }

    /// Writes that land are recorded one by one; the instance behind a rejected write is
    /// evicted so the next read sees the backend's copy.
    async fn flush(&mut self) -> Result<()> {
        for write in self.identity.pending()? {
            if let Err(err) = self.apply(write.clone()) {
                self.identity.forget(write.id());
                return Err(err);
            }
            self.identity.mark_written(&write);
        }
        Ok(())
    }

    fn clear(&mut self) {
        self.identity.clear();
    }

    async fn begin(&mut self) -> Result<()> {
        if self.overlay.is_some() {
            return Err(Error::TransactionState("transaction already active"));
        }
        self.overlay = Some(Overlay::new());
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let overlay = self
            .overlay
            .take()
            .ok_or(Error::TransactionState("no active transaction to commit"))?;
        let mut tables = self.store.lock();
        for (key, row) in overlay {
            apply_row(&mut tables, &self.table, key, row);
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.overlay
            .take()
            .ok_or(Error::TransactionState("no active transaction to roll back"))?;
        self.identity.clear();
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.overlay.is_some()
    }
}
