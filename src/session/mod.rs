//! Persistence sessions: query execution, an identity map of managed instances and a
//! transaction boundary.

use async_trait::async_trait;
use serde_json::Value;

use crate::{Result, entity::Entity, query::Query};

mod identity;
pub mod memory;
pub mod postgres;

pub use memory::{MemorySession, MemoryStore};
pub use postgres::PgSession;

/// Backend session owned by one provider.
///
/// Identifiers cross this boundary as their serialized `Value`. Reads through
/// [`count`](Self::count) and [`identifiers`](Self::identifiers) always hit the backend;
/// [`load`](Self::load) reuses an instance that is already managed.
#[async_trait]
pub trait PersistenceSession<E: Entity>: Send {
    async fn count(&mut self, query: &Query) -> Result<u64>;

    /// Identifier column of every row the query returns, in order.
    async fn identifiers(&mut self, query: &Query) -> Result<Vec<Value>>;

    /// Make the entity with `id` managed, re-reading the backend unless the managed
    /// instance has unwritten changes. Returns `false` when it does not exist.
    async fn load(&mut self, id: &Value) -> Result<bool>;

    fn managed(&self, id: &Value) -> Option<&E>;

    fn managed_mut(&mut self, id: &Value) -> Option<&mut E>;

    /// Stop managing `id` and hand the instance to the caller.
    fn take_managed(&mut self, id: &Value) -> Option<E>;

    /// Manage a new instance. It is inserted on the next flush.
    fn persist(&mut self, entity: E) -> Result<Value>;

    /// Copy `entity` onto the managed instance with the same identifier, loading it
    /// first. An identifier the backend does not know is persisted instead.
    async fn merge(&mut self, entity: E) -> Result<Value>;

    /// Stage removal of a managed instance.
    fn remove(&mut self, id: &Value) -> Result<()>;

    /// Write every pending change to the backend. On failure the instance whose write
    /// was rejected is no longer managed.
    async fn flush(&mut self) -> Result<()>;

    /// Forget every managed instance without writing anything.
    fn clear(&mut self);

    async fn begin(&mut self) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;

    fn is_active(&self) -> bool;

    /// Backend expression for a logical field under `alias`.
    fn qualify(&self, alias: &str, field: &str) -> String {
        format!("{alias}.{field}")
    }
}
