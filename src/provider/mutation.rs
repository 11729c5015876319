use serde_json::Value;
use tracing::{instrument, warn};

use super::EntityProvider;
use crate::{
    Error, Result, detach::detach, entity::Entity, metrics, session::PersistenceSession,
};

impl<E: Entity, S: PersistenceSession<E>> EntityProvider<E, S> {
    /// Persist a new entity and return a detached copy of what was stored.
    #[instrument(skip_all, fields(entity = %self.metadata.entity_name()))]
    pub async fn add_entity(&mut self, entity: E) -> Result<E> {
        let began = self.begin_if_handled().await?;
        let result = self.add_in_session(entity).await;
        self.finish(began, result).await
    }

    /// Copy `entity` onto the stored one with the same identifier, inserting it when the
    /// identifier is unknown.
    #[instrument(skip_all, fields(entity = %self.metadata.entity_name()))]
    pub async fn update_entity(&mut self, entity: E) -> Result<E> {
        let began = self.begin_if_handled().await?;
        let result = self.update_in_session(entity).await;
        self.finish(began, result).await
    }

    /// Delete the entity with `id`. Unknown identifiers are ignored.
    #[instrument(skip_all, fields(entity = %self.metadata.entity_name()))]
    pub async fn remove_entity(&mut self, id: &E::Id) -> Result<()> {
        let id = self.id_value(id)?;
        let began = self.begin_if_handled().await?;
        let result = self.remove_in_session(&id).await;
        self.finish(began, result).await
    }

    /// Set one property of a stored entity. Unknown identifiers are ignored; unknown
    /// property names are rejected before anything is touched.
    #[instrument(skip_all, fields(entity = %self.metadata.entity_name(), property = property))]
    pub async fn update_entity_property(
        &mut self,
        id: &E::Id,
        property: &str,
        value: Value,
    ) -> Result<()> {
        if !self.metadata.has_property(property) {
            return Err(Error::UnknownProperty {
                entity: self.metadata.entity_name().to_string(),
                property: property.to_string(),
            });
        }
        let id = self.id_value(id)?;
        let began = self.begin_if_handled().await?;
        let result = self.set_in_session(&id, property, value).await;
        self.finish(began, result).await
    }

    async fn add_in_session(&mut self, entity: E) -> Result<E> {
        let id = self.session.persist(entity)?;
        self.session.flush().await?;
        self.detached(&id)
    }

    async fn update_in_session(&mut self, entity: E) -> Result<E> {
        let id = self.session.merge(entity).await?;
        self.session.flush().await?;
        self.detached(&id)
    }

    async fn remove_in_session(&mut self, id: &Value) -> Result<()> {
        if !self.session.load(id).await? {
            return Ok(());
        }
        self.session.remove(id)?;
        self.session.flush().await
    }

    async fn set_in_session(&mut self, id: &Value, property: &str, value: Value) -> Result<()> {
        if !self.session.load(id).await? {
            return Ok(());
        }
        if let Some(managed) = self.session.managed_mut(id) {
            self.metadata.set_property(managed, property, value)?;
        }
        self.session.flush().await
    }

    fn detached(&mut self, id: &Value) -> Result<E> {
        detach(&mut self.session, &self.metadata, id).ok_or_else(|| Error::EntityNotFound {
            entity: self.metadata.entity_name().to_string(),
            id: id.to_string(),
        })
    }

    async fn begin_if_handled(&mut self) -> Result<bool> {
        if !self.config.transactions_handled {
            return Ok(false);
        }
        self.session.begin().await?;
        Ok(true)
    }

    /// Commit a transaction opened by [`begin_if_handled`](Self::begin_if_handled), or
    /// roll it back and hand back the original error.
    async fn finish<T>(&mut self, began: bool, result: Result<T>) -> Result<T> {
        if !began {
            return result;
        }
        match result {
            Ok(value) => match self.session.commit().await {
                Ok(()) => Ok(value),
                Err(err) => {
                    self.roll_back_quietly().await;
                    Err(err)
                }
            },
            Err(err) => {
                self.roll_back_quietly().await;
                Err(err)
            }
        }
    }

    async fn roll_back_quietly(&mut self) {
        metrics::record_rollback();
        if !self.session.is_active() {
            self.session.clear();
            return;
        }
        if let Err(err) = self.session.rollback().await {
            warn!(
                entity = self.metadata.entity_name(),
                error = %err,
                "rollback failed after mutation error"
            );
            self.session.clear();
        }
    }
}
