use serde_json::Value;

use crate::{
    entity::{Detacher, Entity, EntityMetadata},
    metrics,
    session::PersistenceSession,
};

/// Caller-owned copy of the managed instance with identifier `id`.
///
/// Never fails: when the entity has no deep copy, the instance is taken out of the
/// session and the session forgets everything else it manages too.
pub fn detach<E, S>(session: &mut S, metadata: &EntityMetadata<E>, id: &Value) -> Option<E>
where
    E: Entity,
    S: PersistenceSession<E> + ?Sized,
{
    match metadata.detacher() {
        Detacher::DeepCopy(copy) => session.managed(id).map(|managed| copy(managed)),
        Detacher::InvalidateSession => {
            let entity = session.take_managed(id)?;
            session.clear();
            tracing::warn!(
                entity = metadata.entity_name(),
                id = %id,
                "no deep copy available, cleared the session to detach"
            );
            metrics::record_detach_fallback();
            Some(entity)
        }
    }
}
