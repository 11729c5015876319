//! Per-type accessor tables for entities handled by a provider.

use std::{collections::BTreeMap, fmt};

use serde::{Serialize, de::DeserializeOwned};
pub use serde_json::Value;

use crate::{Error, Result};

/// A persistable entity type.
///
/// Usually derived with `#[derive(Entity)]`; a hand-written impl only has to return its
/// [`EntityMetadata`].
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    type Id: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync;

    fn metadata() -> EntityMetadata<Self>;
}

pub type Getter<E> = fn(&E) -> Result<Value>;
pub type Setter<E> = fn(&mut E, Value) -> Result<()>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdentifierKind {
    Simple,
    /// Composite key spread over several fields. Providers refuse these.
    Embedded,
}

/// How a managed entity is turned into a caller-owned value.
pub enum Detacher<E> {
    /// Copy the managed instance field by field.
    DeepCopy(fn(&E) -> E),
    /// Take the instance out of the session and clear the session's identity map.
    InvalidateSession,
}

impl<E> Clone for Detacher<E> {
    fn clone(&self) -> Self {
        match self {
            Detacher::DeepCopy(copy) => Detacher::DeepCopy(*copy),
            Detacher::InvalidateSession => Detacher::InvalidateSession,
        }
    }
}

impl<E> fmt::Debug for Detacher<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Detacher::DeepCopy(_) => f.write_str("DeepCopy"),
            Detacher::InvalidateSession => f.write_str("InvalidateSession"),
        }
    }
}

struct Accessor<E> {
    get: Getter<E>,
    set: Setter<E>,
}

impl<E> Clone for Accessor<E> {
    fn clone(&self) -> Self {
        Self {
            get: self.get,
            set: self.set,
        }
    }
}

pub struct EntityMetadata<E> {
    name: String,
    identifier: String,
    identifier_kind: IdentifierKind,
    properties: BTreeMap<String, Accessor<E>>,
    detacher: Detacher<E>,
}

impl<E> Clone for EntityMetadata<E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            identifier: self.identifier.clone(),
            identifier_kind: self.identifier_kind,
            properties: self.properties.clone(),
            detacher: self.detacher.clone(),
        }
    }
}

impl<E> fmt::Debug for EntityMetadata<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityMetadata")
            .field("name", &self.name)
            .field("identifier", &self.identifier)
            .field("identifier_kind", &self.identifier_kind)
            .field("properties", &self.properties.keys().collect::<Vec<_>>())
            .field("detacher", &self.detacher)
            .finish()
    }
}

impl<E> EntityMetadata<E> {
    pub fn builder(
        name: impl Into<String>,
        identifier: impl Into<String>,
        detacher: Detacher<E>,
    ) -> EntityMetadataBuilder<E> {
        EntityMetadataBuilder {
            inner: EntityMetadata {
                name: name.into(),
                identifier: identifier.into(),
                identifier_kind: IdentifierKind::Simple,
                properties: BTreeMap::new(),
                detacher,
            },
        }
    }

    pub fn entity_name(&self) -> &str {
        &self.name
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn identifier_kind(&self) -> IdentifierKind {
        self.identifier_kind
    }

    pub fn detacher(&self) -> &Detacher<E> {
        &self.detacher
    }

    pub fn has_property(&self, name: &str) -> bool {
        self.properties.contains_key(name)
    }

    pub fn property_names(&self) -> impl Iterator<Item = &str> {
        self.properties.keys().map(String::as_str)
    }

    pub fn get_property(&self, entity: &E, name: &str) -> Result<Value> {
        let accessor = self.accessor(name)?;
        (accessor.get)(entity)
    }

    pub fn set_property(&self, entity: &mut E, name: &str, value: Value) -> Result<()> {
        let accessor = self.accessor(name)?;
        (accessor.set)(entity, value)
    }

    /// Identifier value of `entity` as stored by sessions.
    pub fn identifier_value(&self, entity: &E) -> Result<Value> {
        self.get_property(entity, &self.identifier)
    }

    fn accessor(&self, name: &str) -> Result<&Accessor<E>> {
        self.properties
            .get(name)
            .ok_or_else(|| Error::UnknownProperty {
                entity: self.name.clone(),
                property: name.to_string(),
            })
    }
}

pub struct EntityMetadataBuilder<E> {
    inner: EntityMetadata<E>,
}

impl<E> EntityMetadataBuilder<E> {
    pub fn property(mut self, name: impl Into<String>, get: Getter<E>, set: Setter<E>) -> Self {
        self.inner
            .properties
            .insert(name.into(), Accessor { get, set });
        self
    }

    pub fn embedded_identifier(mut self) -> Self {
        self.inner.identifier_kind = IdentifierKind::Embedded;
        self
    }

    pub fn build(self) -> EntityMetadata<E> {
        self.inner
    }
}

/// Getter helper used by derived accessors.
pub fn to_property<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

/// Setter helper used by derived accessors.
pub fn from_property<T: DeserializeOwned>(value: Value) -> Result<T> {
    Ok(serde_json::from_value(value)?)
}
