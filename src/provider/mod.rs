//! Entity access facade: counts, lookups, paging and sibling navigation over one
//! persistence session.

use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::{
    Error, Result,
    detach::detach,
    entity::{Entity, EntityMetadata, IdentifierKind},
    filter::Filter,
    metrics,
    query::{Projection, Query, QueryBuilder, QueryPlan, SortSpec},
    session::PersistenceSession,
};

mod mutation;
mod sibling;

pub use sibling::limiting_filter;

#[derive(Clone, Debug)]
pub struct ProviderConfig {
    /// Wrap every mutation in its own begin/commit, rolling back on failure.
    pub transactions_handled: bool,
    /// Alias the entity is bound to in rendered queries.
    pub alias: String,
    pub slow_query_threshold: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            transactions_handled: false,
            alias: "obj".into(),
            slow_query_threshold: Duration::from_millis(500),
        }
    }
}

impl ProviderConfig {
    pub fn transactions_handled(mut self, handled: bool) -> Self {
        self.transactions_handled = handled;
        self
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = alias.into();
        self
    }

    pub fn slow_query_threshold(mut self, threshold: Duration) -> Self {
        self.slow_query_threshold = threshold;
        self
    }
}

/// Read and write access to one entity type through exactly one session.
///
/// Every returned entity is detached: mutating it never changes what the session
/// tracks. Identifiers are always the final sort key, so orderings are total.
pub struct EntityProvider<E: Entity, S: PersistenceSession<E>> {
    session: S,
    metadata: EntityMetadata<E>,
    config: ProviderConfig,
}

impl<E: Entity, S: PersistenceSession<E>> EntityProvider<E, S> {
    pub fn new(session: S, config: ProviderConfig) -> Result<Self> {
        let metadata = E::metadata();
        if metadata.identifier_kind() == IdentifierKind::Embedded {
            return Err(Error::UnsupportedIdentifier {
                entity: metadata.entity_name().to_string(),
            });
        }
        if !metadata.has_property(metadata.identifier()) {
            return Err(Error::contract(format!(
                "`{}` has no accessor for its identifier `{}`",
                metadata.entity_name(),
                metadata.identifier()
            )));
        }
        let alias_ok = config
            .alias
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && config
                .alias
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !alias_ok {
            return Err(Error::contract(format!(
                "query alias `{}` is not an identifier",
                config.alias
            )));
        }
        Ok(Self {
            session,
            metadata,
            config,
        })
    }

    pub fn metadata(&self) -> &EntityMetadata<E> {
        &self.metadata
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut S {
        &mut self.session
    }

    pub fn into_session(self) -> S {
        self.session
    }

    /// `true` iff exactly one row matches `id = :id AND filter`.
    #[instrument(skip_all, fields(entity = %self.metadata.entity_name()))]
    pub async fn contains_entity(&mut self, id: &E::Id, filter: Option<&Filter>) -> Result<bool> {
        let by_id = Filter::eq(self.metadata.identifier(), self.id_value(id)?);
        let restriction = match filter {
            Some(filter) => by_id.conjoin(filter.clone()),
            None => by_id,
        };
        let query = self.query(Projection::Count, Some(&restriction), None, false)?;
        Ok(self.run_count(&query).await? == 1)
    }

    #[instrument(skip_all, fields(entity = %self.metadata.entity_name()))]
    pub async fn get_entity(&mut self, id: &E::Id) -> Result<Option<E>> {
        let id = self.id_value(id)?;
        if !self.session.load(&id).await? {
            return Ok(None);
        }
        Ok(detach(&mut self.session, &self.metadata, &id))
    }

    #[instrument(skip_all, fields(entity = %self.metadata.entity_name()))]
    pub async fn get_entity_count(&mut self, filter: Option<&Filter>) -> Result<u64> {
        let query = self.query(Projection::Count, filter, None, false)?;
        self.run_count(&query).await
    }

    /// Identifier at zero-based `index` of the filtered, sorted collection.
    #[instrument(skip_all, fields(entity = %self.metadata.entity_name(), index = index))]
    pub async fn get_identifier_at(
        &mut self,
        filter: Option<&Filter>,
        sort: &SortSpec,
        index: u64,
    ) -> Result<Option<E::Id>> {
        let ids = self.get_identifiers(filter, sort, index, 1).await?;
        Ok(ids.into_iter().next())
    }

    /// Up to `max` identifiers starting at `first`, in one round-trip.
    pub async fn get_identifiers(
        &mut self,
        filter: Option<&Filter>,
        sort: &SortSpec,
        first: u64,
        max: u64,
    ) -> Result<Vec<E::Id>> {
        let sort = sort.with_identifier(self.metadata.identifier());
        let query = self
            .query(Projection::Identifier, filter, Some(&sort), false)?
            .first_result(first)
            .max_results(max);
        self.run_identifiers(&query).await
    }

    pub async fn get_first_identifier(
        &mut self,
        filter: Option<&Filter>,
        sort: &SortSpec,
    ) -> Result<Option<E::Id>> {
        self.end_identifier(filter, sort, false).await
    }

    pub async fn get_last_identifier(
        &mut self,
        filter: Option<&Filter>,
        sort: &SortSpec,
    ) -> Result<Option<E::Id>> {
        self.end_identifier(filter, sort, true).await
    }

    pub async fn get_next_identifier(
        &mut self,
        id: &E::Id,
        filter: Option<&Filter>,
        sort: &SortSpec,
    ) -> Result<Option<E::Id>> {
        self.get_sibling(id, filter, sort, false).await
    }

    pub async fn get_previous_identifier(
        &mut self,
        id: &E::Id,
        filter: Option<&Filter>,
        sort: &SortSpec,
    ) -> Result<Option<E::Id>> {
        self.get_sibling(id, filter, sort, true).await
    }

    #[instrument(skip_all, fields(entity = %self.metadata.entity_name(), reverse = reverse))]
    async fn end_identifier(
        &mut self,
        filter: Option<&Filter>,
        sort: &SortSpec,
        reverse: bool,
    ) -> Result<Option<E::Id>> {
        let sort = sort.with_identifier(self.metadata.identifier());
        let query = self
            .query(Projection::Identifier, filter, Some(&sort), reverse)?
            .max_results(1);
        Ok(self.run_identifiers(&query).await?.into_iter().next())
    }

    fn id_value(&self, id: &E::Id) -> Result<Value> {
        Ok(serde_json::to_value(id)?)
    }

    fn query(
        &self,
        projection: Projection,
        filter: Option<&Filter>,
        sort: Option<&SortSpec>,
        reverse: bool,
    ) -> Result<Query> {
        let alias = self.config.alias.as_str();
        let select = match projection {
            Projection::Count => format!("count({alias})"),
            Projection::Identifier => self.session.qualify(alias, self.metadata.identifier()),
        };
        let session = &self.session;
        let qualify = |field: &str| session.qualify(alias, field);
        let rendered = QueryBuilder::new(self.metadata.entity_name(), alias).build(
            &select,
            filter,
            sort,
            reverse,
            Some(&qualify),
        )?;
        debug!(query = %rendered, bindings = rendered.bindings().len(), "rendered query");
        Ok(Query::new(
            rendered,
            QueryPlan {
                projection,
                filter: filter.cloned(),
                sort: sort.cloned(),
                reverse,
            },
        ))
    }

    async fn run_count(&mut self, query: &Query) -> Result<u64> {
        let start = Instant::now();
        let count = self.session.count(query).await?;
        self.observe(start, query);
        Ok(count)
    }

    async fn run_identifiers(&mut self, query: &Query) -> Result<Vec<E::Id>> {
        let start = Instant::now();
        let ids = self.session.identifiers(query).await?;
        self.observe(start, query);
        ids.into_iter()
            .map(|id| serde_json::from_value(id).map_err(Into::into))
            .collect()
    }

    fn observe(&self, start: Instant, query: &Query) {
        let elapsed = start.elapsed();
        metrics::record_query_duration(elapsed);
        if elapsed > self.config.slow_query_threshold {
            metrics::record_slow_query();
            warn!(
                target: "rillview::slow_query",
                elapsed_ms = elapsed.as_millis() as u64,
                sql = %query.rendered(),
                "slow entity query"
            );
        }
    }
}
