//! Helpers for exercising providers without a database.

use crate::{
    Result,
    entity::Entity,
    provider::{EntityProvider, ProviderConfig},
    session::{MemorySession, MemoryStore},
};

pub type MemoryProvider<E> = EntityProvider<E, MemorySession<E>>;

/// Provider over a fresh session of `store`.
pub fn memory_provider<E: Entity>(
    store: &MemoryStore,
    transactions_handled: bool,
) -> Result<MemoryProvider<E>> {
    EntityProvider::new(
        store.session(),
        ProviderConfig::default().transactions_handled(transactions_handled),
    )
}

/// Insert `entities` through a throwaway provider so later sessions start cold.
pub async fn seed<E: Entity>(
    store: &MemoryStore,
    entities: impl IntoIterator<Item = E>,
) -> Result<()> {
    let mut provider = memory_provider::<E>(store, true)?;
    for entity in entities {
        provider.add_entity(entity).await?;
    }
    Ok(())
}
