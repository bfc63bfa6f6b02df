//! The built-in demo fixtures (`health`, `list`, `compute`, `offload_table`)
//! plus the two DB-backed entries (`db_query`, `db_exec`), all polling the
//! cooperative [`molt_db::CancelToken`] this crate shares with the DB
//! subsystem at their documented yield points.

use std::time::{Duration, Instant};

use molt_db::{exec_encoded, query_encoded, resolve_params, CancelToken, DbConnection, EncodedResult, ParamsPayload, Pool, ResultFormat};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capabilities::{Capability, CapabilitySet};

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("pool busy: no connection available within max_wait_ms")]
    Busy,
    #[error("request timed out")]
    Timeout,
    #[error("request cancelled")]
    Cancelled,
    #[error("internal error: {0}")]
    Internal(String),
    #[error("capability not granted: {0}")]
    CapabilityDenied(String),
}

/// A single yield-point check: cancellation first, then deadline. Every
/// handler loop calls this at the documented cadence (every row for
/// `list`, every 1024 elements for `compute`, once before work starts for
/// `offload_table`/`health`) instead of relying on preemption.
fn check_yield_point(cancel: &CancelToken, deadline: Option<Instant>) -> Result<(), HandlerError> {
    if cancel.is_cancelled() {
        return Err(HandlerError::Cancelled);
    }
    if let Some(deadline) = deadline {
        if Instant::now() > deadline {
            return Err(HandlerError::Timeout);
        }
    }
    Ok(())
}

#[derive(Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
}

pub fn health(cancel: &CancelToken, deadline: Option<Instant>) -> Result<HealthResponse, HandlerError> {
    check_yield_point(cancel, deadline)?;
    Ok(HealthResponse { ok: true })
}

#[derive(Deserialize)]
pub struct ListRequest {
    pub user_id: i64,
    pub q: Option<String>,
    pub status: Option<String>,
    pub limit: Option<u32>,
    pub cursor: Option<String>,
}

#[derive(Serialize)]
pub struct ItemRow {
    pub id: i64,
    pub created_at: String,
    pub status: String,
    pub title: String,
    pub score: f64,
    pub unread: bool,
}

#[derive(Serialize)]
pub struct CountSummary {
    pub open: u32,
    pub closed: u32,
}

#[derive(Serialize)]
pub struct ListResponse {
    pub items: Vec<ItemRow>,
    pub next_cursor: Option<String>,
    pub counts: CountSummary,
}

/// Deterministic synthetic paginated listing: the derivation
/// (`base = user_id.abs()*1000 + len(q)+len(status)+len(cursor)`) is
/// reproducible across worker versions/runs, which is what makes it
/// useful as a contract fixture rather than a toy.
pub fn list(
    request: &ListRequest,
    cancel: &CancelToken,
    deadline: Option<Instant>,
) -> Result<ListResponse, HandlerError> {
    check_yield_point(cancel, deadline)?;

    let limit = request.limit.unwrap_or(50).min(500) as usize;
    let q_len = request.q.as_ref().map(|q| q.len()).unwrap_or(0) as i64;
    let status_len = request.status.as_ref().map(|s| s.len()).unwrap_or(0) as i64;
    let cursor_len = request.cursor.as_ref().map(|c| c.len()).unwrap_or(0) as i64;
    let base = request.user_id.abs() * 1000 + q_len + status_len + cursor_len;

    let mut items = Vec::with_capacity(limit);
    let mut open = 0u32;
    let mut closed = 0u32;
    for idx in 0..limit {
        check_yield_point(cancel, deadline)?;
        let id = base + idx as i64;
        let is_open = idx % 2 == 0;
        let status = if is_open { "open" } else { "closed" };
        if is_open {
            open += 1;
        } else {
            closed += 1;
        }
        items.push(ItemRow {
            id,
            created_at: format!("2026-01-{:02}T00:00:{:02}Z", (idx % 28) + 1, idx % 60),
            status: status.to_string(),
            title: format!("Item {id}"),
            score: (idx % 100) as f64 / 100.0,
            unread: idx % 3 == 0,
        });
    }

    let next_cursor = if items.len() == limit {
        Some(format!("{}:{}", request.user_id, limit))
    } else {
        None
    };

    Ok(ListResponse {
        items,
        next_cursor,
        counts: CountSummary { open, closed },
    })
}

#[derive(Deserialize)]
pub struct ComputeRequest {
    pub values: Vec<f64>,
    pub scale: Option<f64>,
    pub offset: Option<f64>,
}

#[derive(Serialize)]
pub struct ComputeResponse {
    pub count: usize,
    pub sum: f64,
    pub scaled: Vec<f64>,
}

/// Vectorized `value*scale+offset` with a running sum, checking the
/// cancel/timeout yield points every 1024 elements.
pub fn compute(
    request: &ComputeRequest,
    cancel: &CancelToken,
    deadline: Option<Instant>,
) -> Result<ComputeResponse, HandlerError> {
    let scale = request.scale.unwrap_or(1.0);
    let offset = request.offset.unwrap_or(0.0);
    let mut scaled = Vec::with_capacity(request.values.len());
    let mut sum = 0.0f64;
    for (idx, value) in request.values.iter().enumerate() {
        if idx % 1024 == 0 {
            check_yield_point(cancel, deadline)?;
        }
        let val = value * scale + offset;
        sum += val;
        scaled.push(val);
    }
    Ok(ComputeResponse {
        count: scaled.len(),
        sum,
        scaled,
    })
}

#[derive(Deserialize)]
pub struct OffloadTableRequest {
    pub rows: usize,
}

#[derive(Serialize)]
pub struct OffloadTableResponse {
    pub rows: usize,
    pub sample: Vec<std::collections::HashMap<String, i64>>,
}

/// Bounded-row synthetic table sample, capped at 50,000 rows with up to
/// 8 sample rows actually materialized.
pub fn offload_table(
    request: &OffloadTableRequest,
    cancel: &CancelToken,
    deadline: Option<Instant>,
) -> Result<OffloadTableResponse, HandlerError> {
    check_yield_point(cancel, deadline)?;
    let rows = request.rows.min(50_000);
    let mut sample = Vec::with_capacity(rows.min(8));
    for i in 0..rows.min(8) {
        let mut row = std::collections::HashMap::new();
        row.insert("id".to_string(), i as i64);
        row.insert("value".to_string(), (i % 7) as i64);
        sample.push(row);
    }
    Ok(OffloadTableResponse { rows, sample })
}

/// Timeout converted to an absolute deadline once, at dispatch time.
pub fn deadline_from_timeout_ms(timeout_ms: u32, started: Instant) -> Option<Instant> {
    if timeout_ms == 0 {
        None
    } else {
        Some(started + Duration::from_millis(timeout_ms as u64))
    }
}

#[derive(Deserialize)]
pub struct DbQueryRequest {
    #[serde(default = "default_db_alias")]
    pub db_alias: String,
    pub sql: String,
    #[serde(default)]
    pub params: ParamsPayload,
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,
    #[serde(default = "default_result_format")]
    pub result_format: String,
    /// Present on the shared DB payload shape but meaningless for a read —
    /// `db_query` never checks it.
    #[serde(default)]
    pub allow_write: bool,
    #[serde(default)]
    pub tag: Option<String>,
}

fn default_db_alias() -> String {
    "default".to_string()
}

fn default_max_rows() -> usize {
    1000
}

fn default_result_format() -> String {
    "json".to_string()
}

#[derive(Deserialize)]
pub struct DbExecRequest {
    #[serde(default = "default_db_alias")]
    pub db_alias: String,
    pub sql: String,
    #[serde(default)]
    pub params: ParamsPayload,
    #[serde(default = "default_result_format")]
    pub result_format: String,
    #[serde(default)]
    pub allow_write: bool,
    #[serde(default)]
    pub tag: Option<String>,
}

/// Runs a read-only query against the named pool. Requires `Capability::DbRead`.
pub async fn db_query<C: DbConnection + 'static>(
    request: &DbQueryRequest,
    pool: &Pool<C>,
    capabilities: &CapabilitySet,
    cancel: &CancelToken,
    deadline: Option<Instant>,
) -> Result<EncodedResult, HandlerError> {
    capabilities
        .require(Capability::DbRead)
        .map_err(|err| HandlerError::CapabilityDenied(err.to_string()))?;
    let format = ResultFormat::parse(&request.result_format)
        .ok_or_else(|| HandlerError::InvalidInput(format!("unknown result_format '{}'", request.result_format)))?;
    let params = resolve_params(request.params.clone()).map_err(map_db_error)?;
    query_encoded(pool, &request.sql, params, request.max_rows, cancel, format, deadline)
        .await
        .map_err(map_db_error)
}

/// Runs a write statement against the named pool. Requires `allow_write:
/// true` on the request payload in addition to the operator-granted
/// `Capability::DbWrite`.
pub async fn db_exec<C: DbConnection + 'static>(
    request: &DbExecRequest,
    pool: &Pool<C>,
    capabilities: &CapabilitySet,
    cancel: &CancelToken,
    deadline: Option<Instant>,
) -> Result<EncodedResult, HandlerError> {
    if !request.allow_write {
        return Err(HandlerError::InvalidInput(
            "db_exec requires allow_write=true".to_string(),
        ));
    }
    capabilities
        .require(Capability::DbWrite)
        .map_err(|err| HandlerError::CapabilityDenied(err.to_string()))?;
    let format = ResultFormat::parse(&request.result_format)
        .ok_or_else(|| HandlerError::InvalidInput(format!("unknown result_format '{}'", request.result_format)))?;
    let params = resolve_params(request.params.clone()).map_err(map_db_error)?;
    exec_encoded(pool, &request.sql, params, cancel, format, deadline)
        .await
        .map_err(map_db_error)
}

fn map_db_error(err: molt_db::DbError) -> HandlerError {
    match err {
        molt_db::DbError::InvalidInput(msg) => HandlerError::InvalidInput(msg),
        molt_db::DbError::Busy => HandlerError::Busy,
        molt_db::DbError::Timeout => HandlerError::Timeout,
        molt_db::DbError::Cancelled => HandlerError::Cancelled,
        molt_db::DbError::Internal(msg) => HandlerError::Internal(msg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_is_deterministic_across_calls() {
        let request = ListRequest {
            user_id: 7,
            q: None,
            status: None,
            limit: Some(5),
            cursor: None,
        };
        let cancel = CancelToken::new();
        let first = list(&request, &cancel, None).unwrap();
        let second = list(&request, &cancel, None).unwrap();
        assert_eq!(first.items.len(), second.items.len());
        assert_eq!(first.items[0].id, second.items[0].id);
        assert_eq!(first.counts.open + first.counts.closed, 5);
    }

    #[test]
    fn list_honors_cancellation() {
        let request = ListRequest {
            user_id: 1,
            q: None,
            status: None,
            limit: Some(10),
            cursor: None,
        };
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = list(&request, &cancel, None).unwrap_err();
        assert!(matches!(err, HandlerError::Cancelled));
    }

    #[test]
    fn compute_sums_scaled_values() {
        let request = ComputeRequest {
            values: vec![1.0, 2.0, 3.0],
            scale: Some(2.0),
            offset: Some(1.0),
        };
        let cancel = CancelToken::new();
        let response = compute(&request, &cancel, None).unwrap();
        assert_eq!(response.scaled, vec![3.0, 5.0, 7.0]);
        assert_eq!(response.sum, 15.0);
    }

    #[test]
    fn offload_table_caps_rows_and_sample() {
        let request = OffloadTableRequest { rows: 1_000_000 };
        let cancel = CancelToken::new();
        let response = offload_table(&request, &cancel, None).unwrap();
        assert_eq!(response.rows, 50_000);
        assert_eq!(response.sample.len(), 8);
    }

    #[tokio::test]
    async fn db_query_is_denied_without_capability() {
        let pool = Pool::new(molt_db::PoolConfig::default(), || async {
            Ok(molt_db::connection::fake::FakeConnection::default())
        });
        let request = DbQueryRequest {
            db_alias: "primary".to_string(),
            sql: "select 1".to_string(),
            params: molt_db::ParamsPayload::default(),
            max_rows: 10,
            result_format: "json".to_string(),
            allow_write: false,
            tag: None,
        };
        let caps = CapabilitySet::empty();
        let cancel = CancelToken::new();
        let err = db_query(&request, &pool, &caps, &cancel, None).await.unwrap_err();
        assert!(matches!(err, HandlerError::CapabilityDenied(_)));
    }
}
