use serde_json::Value;
use tracing::instrument;

use super::EntityProvider;
use crate::{
    Error, Result,
    entity::Entity,
    filter::Filter,
    query::{Projection, SortBy, SortSpec},
    session::PersistenceSession,
};

/// Restriction selecting rows strictly after the anchor in the order given by `keys`
/// (walked in reverse when `backwards`), where `values` are the anchor's sort values.
///
/// Built as `OR_{i = n-1..0} (AND_{j<i} key_j == v_j AND key_i beyond v_i)`. Nulls sort
/// after every other value when ascending, so "beyond" and "equal" are null-aware.
/// Returns `None` when no row can follow the anchor.
pub fn limiting_filter(keys: &[SortBy], values: &[Value], backwards: bool) -> Option<Filter> {
    let mut clauses = Vec::with_capacity(keys.len());
    for i in (0..keys.len().min(values.len())).rev() {
        let key = &keys[i];
        let Some(beyond) = beyond(&key.field, &values[i], key.ascending != backwards) else {
            continue;
        };
        let mut terms: Vec<Filter> = keys[..i]
            .iter()
            .zip(values)
            .map(|(k, v)| equal(&k.field, v))
            .collect();
        terms.push(beyond);
        clauses.push(collapse(terms, Filter::And));
    }
    if clauses.is_empty() {
        None
    } else {
        Some(collapse(clauses, Filter::Or))
    }
}

fn equal(field: &str, value: &Value) -> Filter {
    if value.is_null() {
        Filter::is_null(field)
    } else {
        Filter::eq(field, value.clone())
    }
}

/// Values that come after `value` in ascending order (`after`) or before it.
fn beyond(field: &str, value: &Value, after: bool) -> Option<Filter> {
    match (after, value.is_null()) {
        (true, true) => None,
        (true, false) => Some(Filter::Or(vec![
            Filter::gt(field, value.clone()),
            Filter::is_null(field),
        ])),
        (false, true) => Some(Filter::is_not_null(field)),
        (false, false) => Some(Filter::lt(field, value.clone())),
    }
}

fn collapse(mut filters: Vec<Filter>, join: fn(Vec<Filter>) -> Filter) -> Filter {
    if filters.len() == 1 {
        filters.remove(0)
    } else {
        join(filters)
    }
}

impl<E: Entity, S: PersistenceSession<E>> EntityProvider<E, S> {
    /// Identifier immediately after (`backwards == false`) or before `id` in the
    /// filtered, sorted collection, without loading the collection.
    #[instrument(skip_all, fields(entity = %self.metadata.entity_name(), backwards = backwards))]
    pub async fn get_sibling(
        &mut self,
        id: &E::Id,
        filter: Option<&Filter>,
        sort: &SortSpec,
        backwards: bool,
    ) -> Result<Option<E::Id>> {
        let identifier = self.metadata.identifier().to_string();
        let sort = sort.with_identifier(&identifier);
        let anchor = self.id_value(id)?;

        let limiting = if sort.len() == 1 {
            Some(if backwards {
                Filter::lt(identifier.as_str(), anchor)
            } else {
                Filter::gt(identifier.as_str(), anchor)
            })
        } else {
            let values = self.anchor_values(&anchor, &sort).await?;
            limiting_filter(sort.keys(), &values, backwards)
        };
        let Some(limiting) = limiting else {
            return Ok(None);
        };

        let restriction = match filter {
            Some(filter) => filter.clone().conjoin(limiting),
            None => limiting,
        };
        let query = self
            .query(Projection::Identifier, Some(&restriction), Some(&sort), backwards)?
            .max_results(1);
        Ok(self.run_identifiers(&query).await?.into_iter().next())
    }

    async fn anchor_values(&mut self, anchor: &Value, sort: &SortSpec) -> Result<Vec<Value>> {
        let entity_name = self.metadata.entity_name().to_string();
        let not_found = || Error::EntityNotFound {
            entity: entity_name.clone(),
            id: anchor.to_string(),
        };
        if !self.session.load(anchor).await? {
            return Err(not_found());
        }
        let entity = self.session.managed(anchor).ok_or_else(not_found)?;
        sort.keys()
            .iter()
            .map(|key| self.metadata.get_property(entity, &key.field))
            .collect()
    }
}
