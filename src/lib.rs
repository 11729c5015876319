//! Rillview: filtered, sorted, detached entity access for list and grid views.

extern crate self as rillview;

pub mod detach;
pub mod entity;
mod error;
pub mod filter;
pub mod metrics;
pub mod provider;
pub mod query;
pub mod session;
pub mod store;
pub mod testing;

pub use entity::{Detacher, Entity, EntityMetadata, IdentifierKind};
pub use entity_derive::Entity;
pub use error::{Error, Result, WithContext};
pub use filter::{CompareOp, Filter};
pub use provider::{EntityProvider, ProviderConfig};
pub use query::{QueryBuilder, RenderedQuery, SortBy, SortSpec};
pub use session::{MemorySession, MemoryStore, PersistenceSession, PgSession};
pub use store::Store;

pub mod prelude {
    pub use crate::{
        Entity, EntityProvider, Filter, MemoryStore, PersistenceSession, ProviderConfig, Result,
        SortSpec, Store,
    };
}
