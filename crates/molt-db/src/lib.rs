//! Async connection pooling and the query surface the Molt worker's
//! `db_query`/`db_exec` entries dispatch into. Hand-rolled pool (not a
//! `bb8`/`deadpool` wrapper, see [`pool`]) over two backends: Postgres via
//! `tokio-postgres` and SQLite via `rusqlite` bridged onto `spawn_blocking`.

pub mod cancel;
pub mod config;
pub mod connection;
pub mod error;
pub mod pool;
pub mod query;
pub mod value;

pub use cancel::CancelToken;
pub use config::PoolConfig;
pub use connection::{fake, DbConnection, PgConnection, ProtocolCancelHandle, SqliteConnection};
pub use error::DbError;
pub use pool::{Pool, PoolGuard};
pub use query::{bind_params, exec_encoded, query_encoded, resolve_params, EncodedResult, ResultFormat};
pub use value::{canonicalize_params, Param, ParamInput, ParamMode, ParamType, ParamsPayload, QueryResult, Value};
