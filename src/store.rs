use crate::{
    Result, WithContext,
    entity::Entity,
    provider::{EntityProvider, ProviderConfig},
    session::{PgSession, postgres::create_table},
};
use sqlx::{
    PgPool,
    postgres::{PgConnectOptions, PgPoolOptions},
};
use std::str::FromStr;
use std::time::Duration;

/// Connection pool that hands out Postgres-backed sessions and providers.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
    slow_query_threshold: Duration,
}

impl Store {
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPool::connect(url).await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            slow_query_threshold: ProviderConfig::default().slow_query_threshold,
        }
    }

    pub fn builder(url: impl Into<String>) -> StoreBuilder {
        StoreBuilder::new(url)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// A fresh session with an empty identity map.
    pub fn session<E: Entity>(&self) -> Result<PgSession<E>> {
        PgSession::new(self.pool.clone())
    }

    /// A provider over a fresh session, inheriting the store's slow query threshold.
    pub fn provider<E: Entity>(
        &self,
        transactions_handled: bool,
    ) -> Result<EntityProvider<E, PgSession<E>>> {
        let config = ProviderConfig::default()
            .transactions_handled(transactions_handled)
            .slow_query_threshold(self.slow_query_threshold);
        EntityProvider::new(self.session()?, config)
    }

    pub fn provider_with<E: Entity>(
        &self,
        config: ProviderConfig,
    ) -> Result<EntityProvider<E, PgSession<E>>> {
        EntityProvider::new(self.session()?, config)
    }

    /// Create the table backing `E` if it does not exist yet.
    pub async fn ensure_table<E: Entity>(&self) -> Result<()> {
        self.ensure_table_named(E::metadata().entity_name()).await
    }

    pub async fn ensure_table_named(&self, name: &str) -> Result<()> {
        create_table(&self.pool, name)
            .await
            .context(format!("creating table `{name}`"))
    }

    /// Lightweight liveness check for the connection pool.
    pub async fn pool_health(&self) -> crate::Result<PoolHealth> {
        let one: i32 = sqlx::query_scalar("select 1").fetch_one(&self.pool).await?;
        Ok(PoolHealth { ok: one == 1 })
    }
}

pub struct StoreBuilder {
    url: String,
    max_connections: Option<u32>,
    connect_timeout: Option<Duration>,
    prepared_statement_cache_size: Option<usize>,
    slow_query_threshold: Option<Duration>,
}

impl StoreBuilder {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: None,
            connect_timeout: None,
            prepared_statement_cache_size: None,
            slow_query_threshold: None,
        }
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = Some(max.max(1));
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Hint for prepared statement cache size. Actual behavior depends on driver.
    pub fn prepared_statement_cache_size(mut self, size: usize) -> Self {
        self.prepared_statement_cache_size = Some(size.max(1));
        self
    }

    /// Queries slower than this are logged on the `rillview::slow_query` target.
    pub fn slow_query_threshold(mut self, threshold: Duration) -> Self {
        self.slow_query_threshold = Some(threshold);
        self
    }

    pub async fn build(self) -> Result<Store> {
        let mut opts = PgPoolOptions::new();
        if let Some(max) = self.max_connections {
            opts = opts.max_connections(max);
        }
        if let Some(t) = self.connect_timeout {
            opts = opts.acquire_timeout(t);
        }
        let pool = if let Some(cap) = self.prepared_statement_cache_size {
            let connect_opts = PgConnectOptions::from_str(&self.url)
                .map_err(|e| sqlx::Error::Configuration(Box::new(e)))?
                .statement_cache_capacity(cap);
            opts.connect_with(connect_opts).await?
        } else {
            opts.connect(&self.url).await?
        };
        let mut store = Store::from_pool(pool);
        if let Some(threshold) = self.slow_query_threshold {
            store.slow_query_threshold = threshold;
        }
        Ok(store)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct PoolHealth {
    pub ok: bool,
}
