//! Named DB connection pools keyed by `db_alias`, each backed by one real
//! driver behind the same [`molt_db::Pool`]. `AnyPool` also
//! carries a `Fake` variant wrapping [`molt_db::connection::fake::FakeConnection`]
//! so the cooperative dispatcher's integration tests exercise the exact
//! same dispatch path a live Postgres/SQLite alias would, without a
//! database running in CI.

use std::collections::HashMap;
use std::time::Instant;

use molt_db::connection::fake::FakeConnection;
use molt_db::{CancelToken, EncodedResult, PgConnection, Pool, SqliteConnection};
use thiserror::Error;

use crate::capabilities::CapabilitySet;
use crate::handlers::{self, DbExecRequest, DbQueryRequest, HandlerError};

#[derive(Clone)]
pub enum AnyPool {
    Postgres(Pool<PgConnection>),
    Sqlite(Pool<SqliteConnection>),
    Fake(Pool<FakeConnection>),
}

#[derive(Debug, Error)]
pub enum DbPoolsError {
    #[error("unknown db_alias '{0}'")]
    UnknownAlias(String),
}

/// The reconciled set of pools a worker process was started with, one per
/// configured `db_alias`. Built once at startup and shared read-only
/// across all dispatched requests.
#[derive(Clone, Default)]
pub struct DbPools {
    pools: HashMap<String, AnyPool>,
}

impl DbPools {
    pub fn new() -> Self {
        Self { pools: HashMap::new() }
    }

    pub fn insert(&mut self, alias: impl Into<String>, pool: AnyPool) {
        self.pools.insert(alias.into(), pool);
    }

    fn get(&self, alias: &str) -> Result<&AnyPool, DbPoolsError> {
        self.pools.get(alias).ok_or_else(|| DbPoolsError::UnknownAlias(alias.to_string()))
    }

    pub async fn query(
        &self,
        request: &DbQueryRequest,
        capabilities: &CapabilitySet,
        cancel: &CancelToken,
        deadline: Option<Instant>,
    ) -> Result<EncodedResult, HandlerError> {
        let pool = self
            .get(&request.db_alias)
            .map_err(|err| HandlerError::InvalidInput(err.to_string()))?;
        match pool {
            AnyPool::Postgres(pool) => handlers::db_query(request, pool, capabilities, cancel, deadline).await,
            AnyPool::Sqlite(pool) => handlers::db_query(request, pool, capabilities, cancel, deadline).await,
            AnyPool::Fake(pool) => handlers::db_query(request, pool, capabilities, cancel, deadline).await,
        }
    }

    pub async fn exec(
        &self,
        request: &DbExecRequest,
        capabilities: &CapabilitySet,
        cancel: &CancelToken,
        deadline: Option<Instant>,
    ) -> Result<EncodedResult, HandlerError> {
        let pool = self
            .get(&request.db_alias)
            .map_err(|err| HandlerError::InvalidInput(err.to_string()))?;
        match pool {
            AnyPool::Postgres(pool) => handlers::db_exec(request, pool, capabilities, cancel, deadline).await,
            AnyPool::Sqlite(pool) => handlers::db_exec(request, pool, capabilities, cancel, deadline).await,
            AnyPool::Fake(pool) => handlers::db_exec(request, pool, capabilities, cancel, deadline).await,
        }
    }

    /// `(pool_in_flight, pool_waiters, pool_idle)` for the per-request
    /// metrics gauges, or `None` if the alias isn't configured.
    pub async fn gauges(&self, alias: &str) -> Option<(usize, usize, usize)> {
        match self.pools.get(alias)? {
            AnyPool::Postgres(pool) => Some((pool.in_flight(), pool.waiters(), pool.idle_count().await)),
            AnyPool::Sqlite(pool) => Some((pool.in_flight(), pool.waiters(), pool.idle_count().await)),
            AnyPool::Fake(pool) => Some((pool.in_flight(), pool.waiters(), pool.idle_count().await)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use molt_db::PoolConfig;

    #[tokio::test]
    async fn unknown_alias_is_invalid_input() {
        let pools = DbPools::new();
        let request = DbQueryRequest {
            db_alias: "missing".to_string(),
            sql: "select 1".to_string(),
            params: molt_db::ParamsPayload::default(),
            max_rows: 10,
            result_format: "json".to_string(),
            allow_write: false,
            tag: None,
        };
        let caps = CapabilitySet::empty().with(crate::capabilities::Capability::DbRead);
        let cancel = CancelToken::new();
        let err = pools.query(&request, &caps, &cancel, None).await.unwrap_err();
        assert!(matches!(err, HandlerError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn fake_pool_serves_a_query_through_the_same_dispatch_path() {
        let mut pools = DbPools::new();
        let pool = Pool::new(PoolConfig::default(), || async {
            let mut conn = FakeConnection::default();
            conn.tables.insert("select 1".to_string(), vec![vec![molt_db::Value::I64(1)]]);
            Ok(conn)
        });
        pools.insert("primary", AnyPool::Fake(pool));

        let request = DbQueryRequest {
            db_alias: "primary".to_string(),
            sql: "select 1".to_string(),
            params: molt_db::ParamsPayload::default(),
            max_rows: 10,
            result_format: "json".to_string(),
            allow_write: false,
            tag: None,
        };
        let caps = CapabilitySet::empty().with(crate::capabilities::Capability::DbRead);
        let cancel = CancelToken::new();
        let encoded = pools.query(&request, &caps, &cancel, None).await.unwrap();
        assert_eq!(encoded.row_count, 1);
        let result: molt_db::QueryResult = serde_json::from_slice(&encoded.bytes).unwrap();
        assert_eq!(result.rows, vec![vec![molt_db::Value::I64(1)]]);
    }
}
