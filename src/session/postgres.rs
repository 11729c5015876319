use std::fmt::Write as _;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction, types::Json};

use super::{
    PersistenceSession,
    identity::{IdentityMap, PendingWrite},
};
use crate::{
    Error, Result,
    entity::{Entity, EntityMetadata},
    metrics,
    query::Query,
};

/// Table names are used unquoted, so only plain identifiers are accepted.
pub(crate) fn validate_table_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::contract(format!("`{name}` is not usable as a table name")))
    }
}

pub(crate) async fn create_table(pool: &PgPool, name: &str) -> Result<()> {
    validate_table_name(name)?;
    let ddl =
        format!("create table if not exists {name} (id jsonb primary key, doc jsonb not null)");
    sqlx::query(&ddl).execute(pool).await?;
    Ok(())
}

/// Positional SQL for `query`, with its paging window appended.
fn positional(query: &Query) -> Result<(String, Vec<Value>)> {
    let (mut sql, values) = query.rendered().to_positional()?;
    // Postgres takes bigint here; anything past i64::MAX means "no limit" anyway
    if let Some(limit) = query.limit().filter(|&limit| limit < i64::MAX as u64) {
        let _ = write!(sql, " limit {limit}");
    }
    if let Some(offset) = query.offset() {
        let _ = write!(sql, " offset {}", offset.min(i64::MAX as u64));
    }
    Ok((sql, values))
}

/// Session over one Postgres table per entity: `id jsonb primary key, doc jsonb`.
pub struct PgSession<E: Entity> {
    pool: PgPool,
    table: String,
    metadata: EntityMetadata<E>,
    identity: IdentityMap<E>,
    tx: Option<Transaction<'static, Postgres>>,
}

impl<E: Entity> PgSession<E> {
    pub fn new(pool: PgPool) -> Result<Self> {
        let metadata = E::metadata();
        validate_table_name(metadata.entity_name())?;
        Ok(Self {
            pool,
            table: metadata.entity_name().to_string(),
            metadata,
            identity: IdentityMap::default(),
            tx: None,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub async fn ensure_table(&self) -> Result<()> {
        create_table(&self.pool, &self.table).await
    }

    async fn apply(&mut self, write: PendingWrite) -> Result<()> {
        let (sql, id, doc) = match write {
            PendingWrite::Insert { id, doc } => (
                format!("insert into {} (id, doc) values ($1, $2)", self.table),
                id,
                Some(doc),
            ),
            PendingWrite::Update { id, doc } => (
                format!("update {} set doc = $2 where id = $1", self.table),
                id,
                Some(doc),
            ),
            PendingWrite::Delete { id } => {
                (format!("delete from {} where id = $1", self.table), id, None)
            }
        };
        let mut q = sqlx::query(&sql).bind(Json(id));
        if let Some(doc) = doc {
            q = q.bind(Json(doc));
        }
        match self.tx.as_mut() {
            Some(tx) => q.execute(&mut **tx).await?,
            None => q.execute(&self.pool).await?,
        };
        metrics::record_entity_write();
        Ok(())
    }
}

#[async_trait]
impl<E: Entity> PersistenceSession<E> for PgSession<E> {
    async fn count(&mut self, query: &Query) -> Result<u64> {
        let (sql, values) = query.rendered().to_positional()?;
        let mut q = sqlx::query_scalar::<_, i64>(&sql);
        for value in values {
            q = q.bind(Json(value));
        }
        let count = match self.tx.as_mut() {
            Some(tx) => q.fetch_one(&mut **tx).await?,
            None => q.fetch_one(&self.pool).await?,
        };
        Ok(count.max(0) as u64)
    }

    async fn identifiers(&mut self, query: &Query) -> Result<Vec<Value>> {
        let (sql, values) = positional(query)?;
        let mut q = sqlx::query_scalar::<_, Json<Value>>(&sql);
        for value in values {
            q = q.bind(Json(value));
        }
        let rows = match self.tx.as_mut() {
            Some(tx) => q.fetch_all(&mut **tx).await?,
            None => q.fetch_all(&self.pool).await?,
        };
        Ok(rows.into_iter().map(|Json(id)| id).collect())
    }

    async fn load(&mut self, id: &Value) -> Result<bool> {
        if let Some(present) = self.identity.unwritten(id)? {
            return Ok(present);
        }
        let sql = format!("select doc from {} where id = $1", self.table);
        let q = sqlx::query_scalar::<_, Json<Value>>(&sql).bind(Json(id.clone()));
        let row = match self.tx.as_mut() {
            Some(tx) => q.fetch_optional(&mut **tx).await?,
            None => q.fetch_optional(&self.pool).await?,
        };
        let Some(Json(doc)) = row else {
            self.identity.forget(id);
            return Ok(false);
        };
        let entity: E = serde_json::from_value(doc)?;
        self.identity.attach_clean(id.clone(), entity)?;
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

    async fn flush(&mut self) -> Result<()> {
        for write in self.identity.pending()? {
            if let Err(err) = self.apply(write.clone()).await {
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
        if self.tx.is_some() {
            return Err(Error::TransactionState("transaction already active"));
        }
        self.tx = Some(self.pool.begin().await?);
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let tx = self
            .tx
            .take()
            .ok_or(Error::TransactionState("no active transaction to commit"))?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        let tx = self
            .tx
            .take()
            .ok_or(Error::TransactionState("no active transaction to roll back"))?;
        self.identity.clear();
        tx.rollback().await?;
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.tx.is_some()
    }

    /// The identifier maps to the `id` column; every other field is read from the
    /// document, with JSON `null` folded into SQL `NULL` so null ordering matches.
    fn qualify(&self, alias: &str, field: &str) -> String {
        if field == self.metadata.identifier() {
            format!("{alias}.id")
        } else {
            format!(
                "nullif({alias}.doc -> '{}', 'null'::jsonb)",
                field.replace('\'', "''")
            )
        }
    }
}
