//! The `DbConnection` trait and its two backends: Postgres (via
//! `tokio-postgres`, optionally over `rustls`) and SQLite (via `rusqlite`,
//! bridged onto the async world with `spawn_blocking` since SQLite has no
//! async driver).

use std::fs::File;
use std::io::BufReader;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use lru::LruCache;
use rustls::{ClientConfig, RootCertStore};
use tokio_postgres::types::{ToSql, Type as PgType};
use tokio_postgres::{Client as PgClient, NoTls};
use tracing::debug;

use crate::cancel::CancelToken;
use crate::config::PoolConfig;
use crate::error::DbError;
use crate::value::{Param, ParamType, QueryResult, Value};

/// A protocol-level cancel handle: issuing `cancel()` asks the server (not
/// just the local client) to abort the in-flight query.
#[async_trait]
pub trait ProtocolCancelHandle: Send + Sync {
    async fn cancel(&self) -> Result<(), DbError>;
}

/// Backend-agnostic connection surface the pool manages and handlers use.
#[async_trait]
pub trait DbConnection: Send {
    async fn query(
        &mut self,
        sql: &str,
        params: &[Param],
        max_rows: usize,
        cancel: &CancelToken,
    ) -> Result<QueryResult, DbError>;

    async fn exec(
        &mut self,
        sql: &str,
        params: &[Param],
        cancel: &CancelToken,
    ) -> Result<QueryResult, DbError>;

    async fn health_check(&mut self) -> bool;

    fn cancel_handle(&self) -> Option<Arc<dyn ProtocolCancelHandle>>;
}

/// Per-connection prepared-statement cache, keyed by SQL text plus the
/// canonicalized (sorted-by-name) parameter type signature.
pub(crate) type StatementCacheKey = (String, Vec<ParamType>);

fn statement_cache_key(sql: &str, params: &[Param]) -> StatementCacheKey {
    (sql.to_string(), params.iter().map(|p| p.type_).collect())
}

// ---------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------

/// `tokio_postgres::Client::cancel_token()` snapshot; issuing `cancel()`
/// opens a new short-lived connection to send the server CancelRequest.
struct PgCancel(tokio_postgres::CancelToken, Option<Arc<RootCertStore>>);

#[async_trait]
impl ProtocolCancelHandle for PgCancel {
    async fn cancel(&self) -> Result<(), DbError> {
        let result = if let Some(roots) = &self.1 {
            let mut config = ClientConfig::builder()
                .with_root_certificates((**roots).clone())
                .with_no_client_auth();
            config.key_log = Arc::new(rustls::KeyLogFile::new());
            let connector = tokio_postgres_rustls::MakeRustlsConnect::new(config);
            self.0.cancel_query(connector).await
        } else {
            self.0.cancel_query(NoTls).await
        };
        result.map_err(DbError::from)
    }
}

pub struct PgConnection {
    client: PgClient,
    cancel_token: tokio_postgres::CancelToken,
    tls_roots: Option<Arc<RootCertStore>>,
    statement_cache: LruCache<StatementCacheKey, tokio_postgres::Statement>,
}

impl PgConnection {
    pub async fn connect(dsn: &str, config: &PoolConfig) -> Result<Self, DbError> {
        let cache_size = std::num::NonZeroUsize::new(config.statement_cache_size.max(1)).unwrap();

        if let Some(cert_path) = &config.tls_root_cert_path {
            let roots = Arc::new(load_root_store(cert_path)?);
            let mut tls_config = ClientConfig::builder()
                .with_root_certificates((*roots).clone())
                .with_no_client_auth();
            tls_config.key_log = Arc::new(rustls::KeyLogFile::new());
            let connector = tokio_postgres_rustls::MakeRustlsConnect::new(tls_config);
            let (client, connection) = tokio::time::timeout(
                config.connect_timeout,
                tokio_postgres::connect(dsn, connector),
            )
            .await
            .map_err(|_| DbError::Timeout)?
            .map_err(DbError::from)?;
            let cancel_token = client.cancel_token();
            tokio::spawn(async move {
                if let Err(err) = connection.await {
                    debug!(error = %err, "postgres connection task ended");
                }
            });
            Ok(Self {
                client,
                cancel_token,
                tls_roots: Some(roots),
                statement_cache: LruCache::new(cache_size),
            })
        } else {
            let (client, connection) = tokio::time::timeout(
                config.connect_timeout,
                tokio_postgres::connect(dsn, NoTls),
            )
            .await
            .map_err(|_| DbError::Timeout)?
            .map_err(DbError::from)?;
            let cancel_token = client.cancel_token();
            tokio::spawn(async move {
                if let Err(err) = connection.await {
                    debug!(error = %err, "postgres connection task ended");
                }
            });
            Ok(Self {
                client,
                cancel_token,
                tls_roots: None,
                statement_cache: LruCache::new(cache_size),
            })
        }
    }

    async fn prepare_cached(&mut self, sql: &str, params: &[Param]) -> Result<tokio_postgres::Statement, DbError> {
        let key = statement_cache_key(sql, params);
        if let Some(stmt) = self.statement_cache.get(&key) {
            return Ok(stmt.clone());
        }
        let stmt = self.client.prepare(sql).await.map_err(DbError::from)?;
        self.statement_cache.put(key, stmt.clone());
        Ok(stmt)
    }
}

fn load_root_store(cert_path: &str) -> Result<RootCertStore, DbError> {
    let file = File::open(cert_path).map_err(|err| {
        DbError::Internal(format!("failed to open tls_root_cert_path {cert_path}: {err}"))
    })?;
    let mut reader = BufReader::new(file);
    let mut store = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert.map_err(|err| DbError::internal(err))?;
        store
            .add(cert)
            .map_err(|err| DbError::Internal(format!("invalid root cert: {err}")))?;
    }
    Ok(store)
}

fn value_to_sql(value: &Value) -> Box<dyn ToSql + Sync> {
    match value {
        Value::Null => Box::new(Option::<bool>::None),
        Value::Bool(b) => Box::new(*b),
        Value::I64(i) => Box::new(*i),
        Value::F64(f) => Box::new(*f),
        Value::Text(s) => Box::new(s.clone()),
        Value::Bytes(b) => Box::new(b.clone()),
    }
}

fn row_to_values(row: &tokio_postgres::Row) -> Vec<Value> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(idx, col)| match *col.type_() {
            PgType::BOOL => row
                .get::<_, Option<bool>>(idx)
                .map(Value::Bool)
                .unwrap_or(Value::Null),
            PgType::INT2 | PgType::INT4 | PgType::INT8 => row
                .get::<_, Option<i64>>(idx)
                .map(Value::I64)
                .unwrap_or(Value::Null),
            PgType::FLOAT4 | PgType::FLOAT8 => row
                .get::<_, Option<f64>>(idx)
                .map(Value::F64)
                .unwrap_or(Value::Null),
            PgType::BYTEA => row
                .get::<_, Option<Vec<u8>>>(idx)
                .map(Value::Bytes)
                .unwrap_or(Value::Null),
            _ => row
                .get::<_, Option<String>>(idx)
                .map(Value::Text)
                .unwrap_or(Value::Null),
        })
        .collect()
}

#[async_trait]
impl DbConnection for PgConnection {
    async fn query(
        &mut self,
        sql: &str,
        params: &[Param],
        max_rows: usize,
        cancel: &CancelToken,
    ) -> Result<QueryResult, DbError> {
        let stmt = self.prepare_cached(sql, params).await?;
        let bound: Vec<Box<dyn ToSql + Sync>> = params.iter().map(|p| value_to_sql(&p.value)).collect();
        let refs: Vec<&(dyn ToSql + Sync)> = bound.iter().map(|b| b.as_ref()).collect();

        if cancel.is_cancelled() {
            return Err(DbError::Cancelled);
        }
        let rows = self.client.query(&stmt, &refs).await.map_err(DbError::from)?;

        let columns = stmt.columns().iter().map(|c| c.name().to_string()).collect();
        let total = rows.len();
        let rows: Vec<Vec<Value>> = rows.iter().take(max_rows).map(row_to_values).collect();
        Ok(QueryResult {
            columns,
            rows,
            rows_affected: total as u64,
        })
    }

    async fn exec(
        &mut self,
        sql: &str,
        params: &[Param],
        cancel: &CancelToken,
    ) -> Result<QueryResult, DbError> {
        let stmt = self.prepare_cached(sql, params).await?;
        let bound: Vec<Box<dyn ToSql + Sync>> = params.iter().map(|p| value_to_sql(&p.value)).collect();
        let refs: Vec<&(dyn ToSql + Sync)> = bound.iter().map(|b| b.as_ref()).collect();

        if cancel.is_cancelled() {
            return Err(DbError::Cancelled);
        }
        let affected = self.client.execute(&stmt, &refs).await.map_err(DbError::from)?;
        Ok(QueryResult {
            columns: Vec::new(),
            rows: Vec::new(),
            rows_affected: affected,
        })
    }

    async fn health_check(&mut self) -> bool {
        self.client.simple_query("SELECT 1").await.is_ok()
    }

    fn cancel_handle(&self) -> Option<Arc<dyn ProtocolCancelHandle>> {
        Some(Arc::new(PgCancel(self.cancel_token.clone(), self.tls_roots.clone())))
    }
}

// ---------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------

struct SqliteCancel(Arc<Mutex<Option<rusqlite::InterruptHandle>>>);

#[async_trait]
impl ProtocolCancelHandle for SqliteCancel {
    async fn cancel(&self) -> Result<(), DbError> {
        if let Some(handle) = self.0.lock().unwrap().as_ref() {
            handle.interrupt();
        }
        Ok(())
    }
}

/// SQLite connections have no async driver; every operation is shipped to a
/// `spawn_blocking` task and the `rusqlite::Connection` itself stays on that
/// blocking thread, the common pattern for bridging blocking C FFI drivers
/// into async Rust.
pub struct SqliteConnection {
    conn: Arc<Mutex<rusqlite::Connection>>,
    interrupt: Arc<Mutex<Option<rusqlite::InterruptHandle>>>,
}

impl SqliteConnection {
    pub async fn open(path: &str) -> Result<Self, DbError> {
        Self::open_with_mode(path, false).await
    }

    /// `read_only` maps to the external `MOLT_SQLITE_READONLY` flag — a
    /// read-only connection still needs `SQLITE_OPEN_URI` off and `CREATE`
    /// off so a missing file fails to open rather than silently creating
    /// one.
    pub async fn open_with_mode(path: &str, read_only: bool) -> Result<Self, DbError> {
        let path = path.to_string();
        let conn = tokio::task::spawn_blocking(move || {
            if read_only {
                rusqlite::Connection::open_with_flags(
                    path,
                    rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
                )
            } else {
                rusqlite::Connection::open(path)
            }
        })
        .await
        .map_err(|err| DbError::internal(err))?
        .map_err(DbError::from)?;
        let interrupt = conn.get_interrupt_handle();
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            interrupt: Arc::new(Mutex::new(Some(interrupt))),
        })
    }
}

fn value_to_sqlite(value: &Value) -> rusqlite::types::Value {
    match value {
        Value::Null => rusqlite::types::Value::Null,
        Value::Bool(b) => rusqlite::types::Value::Integer(*b as i64),
        Value::I64(i) => rusqlite::types::Value::Integer(*i),
        Value::F64(f) => rusqlite::types::Value::Real(*f),
        Value::Text(s) => rusqlite::types::Value::Text(s.clone()),
        Value::Bytes(b) => rusqlite::types::Value::Blob(b.clone()),
    }
}

fn sqlite_value_to_value(value: rusqlite::types::ValueRef<'_>) -> Value {
    match value {
        rusqlite::types::ValueRef::Null => Value::Null,
        rusqlite::types::ValueRef::Integer(i) => Value::I64(i),
        rusqlite::types::ValueRef::Real(f) => Value::F64(f),
        rusqlite::types::ValueRef::Text(t) => {
            Value::Text(String::from_utf8_lossy(t).into_owned())
        }
        rusqlite::types::ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
    }
}

#[async_trait]
impl DbConnection for SqliteConnection {
    async fn query(
        &mut self,
        sql: &str,
        params: &[Param],
        max_rows: usize,
        cancel: &CancelToken,
    ) -> Result<QueryResult, DbError> {
        if cancel.is_cancelled() {
            return Err(DbError::Cancelled);
        }
        let conn = self.conn.clone();
        let sql = sql.to_string();
        let bound: Vec<rusqlite::types::Value> = params.iter().map(|p| value_to_sqlite(&p.value)).collect();

        tokio::task::spawn_blocking(move || -> Result<QueryResult, DbError> {
            let conn = conn.lock().unwrap();
            let mut stmt = conn.prepare_cached(&sql)?;
            let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
            let col_count = columns.len();
            let params_ref: Vec<&dyn rusqlite::ToSql> =
                bound.iter().map(|v| v as &dyn rusqlite::ToSql).collect();
            let mut rows = stmt.query(params_ref.as_slice())?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                if out.len() >= max_rows {
                    break;
                }
                let values = (0..col_count)
                    .map(|idx| sqlite_value_to_value(row.get_ref(idx)?))
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                out.push(values);
            }
            Ok(QueryResult {
                columns,
                rows: out,
                rows_affected: 0,
            })
        })
        .await
        .map_err(|err| DbError::internal(err))?
    }

    async fn exec(
        &mut self,
        sql: &str,
        params: &[Param],
        cancel: &CancelToken,
    ) -> Result<QueryResult, DbError> {
        if cancel.is_cancelled() {
            return Err(DbError::Cancelled);
        }
        let conn = self.conn.clone();
        let sql = sql.to_string();
        let bound: Vec<rusqlite::types::Value> = params.iter().map(|p| value_to_sqlite(&p.value)).collect();

        tokio::task::spawn_blocking(move || -> Result<QueryResult, DbError> {
            let conn = conn.lock().unwrap();
            let params_ref: Vec<&dyn rusqlite::ToSql> =
                bound.iter().map(|v| v as &dyn rusqlite::ToSql).collect();
            let affected = conn.execute(&sql, params_ref.as_slice())?;
            Ok(QueryResult {
                columns: Vec::new(),
                rows: Vec::new(),
                rows_affected: affected as u64,
            })
        })
        .await
        .map_err(|err| DbError::internal(err))?
    }

    async fn health_check(&mut self) -> bool {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || conn.lock().unwrap().execute_batch("SELECT 1"))
            .await
            .map(|res| res.is_ok())
            .unwrap_or(false)
    }

    fn cancel_handle(&self) -> Option<Arc<dyn ProtocolCancelHandle>> {
        Some(Arc::new(SqliteCancel(self.interrupt.clone())))
    }
}

/// An in-memory connection used by tests (in this crate and downstream, in
/// `molt-worker`'s integration tests) so DB-latency and cancellation-race
/// scenarios never need a live Postgres/SQLite instance.
pub mod fake {
    use super::*;
    use std::collections::HashMap;

    /// An in-process stand-in for a real driver, used both by unit tests and
    /// by the worker binary's `--db-alias-fake` demo mode (configurable base
    /// latency, per-row decode cost, and per-row CPU iterations), so
    /// scenarios needing DB latency or cancellation races don't require a
    /// live Postgres/SQLite instance.
    #[derive(Default)]
    pub struct FakeConnection {
        pub tables: HashMap<String, Vec<Vec<Value>>>,
        pub fail_next: bool,
        pub delay: Option<std::time::Duration>,
        /// Per-row decode cost, applied once per returned row as a single
        /// batched sleep.
        pub decode_us_per_row: u64,
        /// Per-row busy-spin iterations simulating CPU-bound decode work;
        /// burns real cycles rather than sleeping so it shows up under a
        /// profiler the way a real decode loop would.
        pub cpu_iters_per_row: u64,
        /// Params received by the most recent `query`/`exec` call, for
        /// tests asserting bind order survives the `molt_db::query` layer.
        pub last_params: std::sync::Mutex<Option<Vec<Param>>>,
    }

    #[async_trait]
    impl DbConnection for FakeConnection {
        async fn query(
            &mut self,
            sql: &str,
            params: &[Param],
            max_rows: usize,
            cancel: &CancelToken,
        ) -> Result<QueryResult, DbError> {
            *self.last_params.lock().unwrap() = Some(params.to_vec());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if cancel.is_cancelled() {
                return Err(DbError::Cancelled);
            }
            if self.fail_next {
                self.fail_next = false;
                return Err(DbError::Internal("injected failure".to_string()));
            }
            let rows = self.tables.get(sql).cloned().unwrap_or_default();
            let total = rows.len();
            let rows: Vec<Vec<Value>> = rows.into_iter().take(max_rows).collect();

            if self.decode_us_per_row > 0 {
                let total_us = self.decode_us_per_row.saturating_mul(rows.len() as u64);
                tokio::time::sleep(std::time::Duration::from_micros(total_us)).await;
            }
            if self.cpu_iters_per_row > 0 {
                let mut acc = 0u64;
                for _ in 0..self.cpu_iters_per_row.saturating_mul(rows.len() as u64) {
                    acc = acc.wrapping_add(1);
                }
                std::hint::black_box(acc);
            }

            Ok(QueryResult {
                columns: vec!["value".to_string()],
                rows,
                rows_affected: total as u64,
            })
        }

        async fn exec(
            &mut self,
            _sql: &str,
            params: &[Param],
            cancel: &CancelToken,
        ) -> Result<QueryResult, DbError> {
            *self.last_params.lock().unwrap() = Some(params.to_vec());
            if cancel.is_cancelled() {
                return Err(DbError::Cancelled);
            }
            Ok(QueryResult {
                columns: Vec::new(),
                rows: Vec::new(),
                rows_affected: 1,
            })
        }

        async fn health_check(&mut self) -> bool {
            true
        }

        fn cancel_handle(&self) -> Option<Arc<dyn ProtocolCancelHandle>> {
            None
        }
    }
}
