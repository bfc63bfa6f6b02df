//! High-level query/exec helpers combining a [`Pool`] and [`DbConnection`],
//! used directly by the worker's `db_query`/`db_exec` entries.

use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::connection::DbConnection;
use crate::error::DbError;
use crate::pool::{Pool, PoolGuard};
use crate::value::{canonicalize_params, Param, ParamMode, ParamsPayload, QueryResult};

/// How often an in-flight query/exec is re-polled against the cancel
/// token and deadline while racing the driver future — same cadence as
/// the pool's own acquire-side poll.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How long a protocol-level cancel is given to actually unstick the
/// in-flight future before the connection is simply discarded: a cancel is
/// attempted first, and only falls back to closing the connection outright
/// if that protocol-level attempt doesn't land in time.
const CANCEL_GRACE: Duration = Duration::from_millis(500);

/// The result encoding a caller wants rows decoded into. `ArrowIpc` is
/// accepted here but not implemented — unlike the payload-level `codec`
/// field, whose minimum set is msgpack+json, `arrow_ipc` stays reserved
/// for row-level results too.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResultFormat {
    Json,
    Msgpack,
    ArrowIpc,
}

impl ResultFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "json" => Some(Self::Json),
            "msgpack" => Some(Self::Msgpack),
            "arrow_ipc" => Some(Self::ArrowIpc),
            _ => None,
        }
    }
}

/// Resolves a wire [`ParamsPayload`] (`params: {mode: positional|named,
/// values}`) into the bind-ordered [`Param`] list the drivers consume.
///
/// - `Positional`: bind order is wire order; every value must omit
///   `name` (an ambiguous mix is rejected as `InvalidInput`). Values are
///   assigned synthetic positional names (`$1`, `$2`, ...) purely so the
///   statement cache key and duplicate-name logic downstream stay
///   type-agnostic to the mode.
/// - `Named`: every value must carry `name`, then [`bind_params`]
///   canonicalizes (sorts) and rejects duplicates as usual.
pub fn resolve_params(payload: ParamsPayload) -> Result<Vec<Param>, DbError> {
    match payload.mode {
        ParamMode::Positional => payload
            .values
            .into_iter()
            .enumerate()
            .map(|(idx, input)| {
                if input.name.is_some() {
                    return Err(DbError::InvalidInput(
                        "positional params must not carry a name".to_string(),
                    ));
                }
                Ok(Param { name: format!("${}", idx + 1), type_: input.type_, value: input.value })
            })
            .collect(),
        ParamMode::Named => {
            let named = payload
                .values
                .into_iter()
                .map(|input| {
                    let name = input.name.ok_or_else(|| {
                        DbError::InvalidInput("named params require a name on every value".to_string())
                    })?;
                    Ok(Param { name, type_: input.type_, value: input.value })
                })
                .collect::<Result<Vec<_>, DbError>>()?;
            bind_params(named)
        }
    }
}

/// Validates and sorts bound parameters. Rejects a parameter list where a
/// name appears twice — an ambiguous bind the dispatcher should reject as
/// `InvalidInput` before it ever reaches a driver.
pub fn bind_params(params: Vec<Param>) -> Result<Vec<Param>, DbError> {
    let sorted = canonicalize_params(params);
    for pair in sorted.windows(2) {
        if pair[0].name == pair[1].name {
            return Err(DbError::InvalidInput(format!(
                "duplicate bound parameter name '{}'",
                pair[0].name
            )));
        }
    }
    Ok(sorted)
}

/// A successfully encoded query/exec result plus the row count the caller
/// needs for the `db_row_count` metric — kept separate from the encoded
/// bytes since the count means "rows returned" for a query and "rows
/// affected" for an exec, and callers shouldn't have to decode the bytes
/// back out just to report it.
pub struct EncodedResult {
    pub bytes: Vec<u8>,
    pub row_count: u64,
}

/// Runs a read query through the pool and encodes the result in
/// `result_format`, returning raw bytes ready to place on the wire as the
/// handler's payload. `deadline` is the caller's own absolute deadline
/// (e.g. derived from the request's `timeout_ms`); it is combined with
/// the pool's own `query_timeout` and whichever is sooner wins.
pub async fn query_encoded<C: DbConnection + 'static>(
    pool: &Pool<C>,
    sql: &str,
    params: Vec<Param>,
    max_rows: usize,
    cancel: &CancelToken,
    result_format: ResultFormat,
    deadline: Option<Instant>,
) -> Result<EncodedResult, DbError> {
    let mut guard = pool.acquire(cancel).await?;
    let effective_deadline = tighter_deadline(deadline, pool.config().query_timeout);
    let cancel_handle = guard.cancel_handle();
    let result = race_cancellable(
        &mut guard,
        cancel,
        effective_deadline,
        cancel_handle,
        |conn| conn.query(sql, &params, max_rows, cancel),
    )
    .await?;
    let row_count = result.rows.len() as u64;
    let bytes = encode_result(&result, result_format)?;
    Ok(EncodedResult { bytes, row_count })
}

/// Runs a write statement through the pool and encodes `rows_affected`.
/// See [`query_encoded`] for the `deadline` semantics.
pub async fn exec_encoded<C: DbConnection + 'static>(
    pool: &Pool<C>,
    sql: &str,
    params: Vec<Param>,
    cancel: &CancelToken,
    result_format: ResultFormat,
    deadline: Option<Instant>,
) -> Result<EncodedResult, DbError> {
    let mut guard = pool.acquire(cancel).await?;
    let effective_deadline = tighter_deadline(deadline, pool.config().query_timeout);
    let cancel_handle = guard.cancel_handle();
    let result = race_cancellable(
        &mut guard,
        cancel,
        effective_deadline,
        cancel_handle,
        |conn| conn.exec(sql, &params, cancel),
    )
    .await?;
    let row_count = result.rows_affected;
    let bytes = encode_result(&result, result_format)?;
    Ok(EncodedResult { bytes, row_count })
}

fn tighter_deadline(caller: Option<Instant>, query_timeout: Duration) -> Instant {
    let from_timeout = Instant::now() + query_timeout;
    match caller {
        Some(caller) => caller.min(from_timeout),
        None => from_timeout,
    }
}

/// Races a query/exec future against the cancel token and `deadline`,
/// polling at [`CANCEL_POLL_INTERVAL`]. On trip, attempts a protocol-level
/// cancel (if the connection exposes one) and grace-races the same future
/// for [`CANCEL_GRACE`] before giving up; either way the connection is
/// invalidated rather than returned to the pool's idle queue, since its
/// state after an aborted in-flight operation can't be trusted.
///
/// `make_future` is called once, borrowing `guard` for the lifetime of
/// the returned future — taking a closure rather than the future
/// directly keeps the `&mut guard` borrow scoped so `cancel_handle` could
/// be read beforehand and `guard.invalidate()` can be called after.
async fn race_cancellable<C, F, Fut, T>(
    guard: &mut PoolGuard<C>,
    cancel: &CancelToken,
    deadline: Instant,
    cancel_handle: Option<std::sync::Arc<dyn crate::connection::ProtocolCancelHandle>>,
    make_future: F,
) -> Result<T, DbError>
where
    C: DbConnection + 'static,
    F: FnOnce(&mut C) -> Fut,
    // async_trait methods desugar to `Pin<Box<dyn Future + Send>>`, which
    // is always `Unpin` (moving a `Box` never moves its heap contents) —
    // that lets this stay a plain owned binding instead of needing
    // `tokio::pin!`, so the future can be dropped by value once the grace
    // race is over.
    Fut: std::future::Future<Output = Result<T, DbError>> + Unpin,
{
    let mut fut = make_future(&mut *guard);

    let trip = loop {
        if cancel.is_cancelled() {
            break DbError::Cancelled;
        }
        let now = Instant::now();
        if now >= deadline {
            break DbError::Timeout;
        }
        let tick = CANCEL_POLL_INTERVAL.min(deadline - now);
        match tokio::time::timeout(tick, &mut fut).await {
            Ok(result) => return result,
            Err(_) => continue,
        }
    };

    if let Some(handle) = cancel_handle {
        let _ = handle.cancel().await;
    }
    // Give the driver a bounded window to actually unwind after the
    // protocol cancel before abandoning the connection outright.
    let _ = tokio::time::timeout(CANCEL_GRACE, &mut fut).await;
    drop(fut);
    guard.invalidate();
    Err(trip)
}

fn encode_result(result: &QueryResult, format: ResultFormat) -> Result<Vec<u8>, DbError> {
    match format {
        ResultFormat::Json => serde_json::to_vec(result).map_err(DbError::internal),
        ResultFormat::Msgpack => rmp_serde::to_vec_named(result).map_err(DbError::internal),
        ResultFormat::ArrowIpc => Err(DbError::Internal(
            "result_format arrow_ipc not implemented".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::connection::fake::FakeConnection;
    use crate::value::{ParamInput, ParamType, Value};

    #[test]
    fn bind_params_sorts_and_rejects_duplicates() {
        let params = vec![
            Param { name: "b".into(), type_: ParamType::I64, value: Value::I64(2) },
            Param { name: "a".into(), type_: ParamType::I64, value: Value::I64(1) },
        ];
        let sorted = bind_params(params).unwrap();
        assert_eq!(sorted[0].name, "a");

        let dupes = vec![
            Param { name: "a".into(), type_: ParamType::I64, value: Value::I64(1) },
            Param { name: "a".into(), type_: ParamType::I64, value: Value::I64(2) },
        ];
        assert!(matches!(bind_params(dupes), Err(DbError::InvalidInput(_))));
    }

    #[test]
    fn resolve_params_positional_preserves_order_and_rejects_names() {
        let payload = ParamsPayload {
            mode: ParamMode::Positional,
            values: vec![
                ParamInput { name: None, type_: ParamType::I64, value: Value::I64(10) },
                ParamInput { name: None, type_: ParamType::I64, value: Value::I64(20) },
            ],
        };
        let resolved = resolve_params(payload).unwrap();
        assert_eq!(resolved[0].value, Value::I64(10));
        assert_eq!(resolved[1].value, Value::I64(20));

        let mixed = ParamsPayload {
            mode: ParamMode::Positional,
            values: vec![ParamInput { name: Some("oops".into()), type_: ParamType::I64, value: Value::I64(1) }],
        };
        assert!(matches!(resolve_params(mixed), Err(DbError::InvalidInput(_))));
    }

    #[test]
    fn resolve_params_named_requires_names_and_sorts() {
        let payload = ParamsPayload {
            mode: ParamMode::Named,
            values: vec![
                ParamInput { name: Some("b".into()), type_: ParamType::I64, value: Value::I64(2) },
                ParamInput { name: Some("a".into()), type_: ParamType::I64, value: Value::I64(1) },
            ],
        };
        let resolved = resolve_params(payload).unwrap();
        assert_eq!(resolved[0].name, "a");

        let missing_name = ParamsPayload {
            mode: ParamMode::Named,
            values: vec![ParamInput { name: None, type_: ParamType::I64, value: Value::I64(1) }],
        };
        assert!(matches!(resolve_params(missing_name), Err(DbError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn query_encoded_round_trips_through_json() {
        let pool = Pool::new(PoolConfig::default(), || async {
            let mut conn = FakeConnection::default();
            conn.tables.insert(
                "select 1".to_string(),
                vec![vec![Value::I64(1)]],
            );
            Ok(conn)
        });
        let cancel = CancelToken::new();
        let encoded = query_encoded(&pool, "select 1", vec![], 10, &cancel, ResultFormat::Json, None)
            .await
            .unwrap();
        assert_eq!(encoded.row_count, 1);
        let result: QueryResult = serde_json::from_slice(&encoded.bytes).unwrap();
        assert_eq!(result.rows, vec![vec![Value::I64(1)]]);
    }

    #[tokio::test]
    async fn arrow_ipc_result_format_is_rejected() {
        let pool = Pool::new(PoolConfig::default(), || async { Ok(FakeConnection::default()) });
        let cancel = CancelToken::new();
        let err = query_encoded(&pool, "select 1", vec![], 10, &cancel, ResultFormat::ArrowIpc, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Internal(_)));
    }

    #[tokio::test]
    async fn cancelling_an_in_flight_query_invalidates_the_connection() {
        let pool = Pool::new(PoolConfig::default(), || async {
            let mut conn = FakeConnection::default();
            conn.delay = Some(std::time::Duration::from_millis(300));
            Ok(conn)
        });
        let cancel = CancelToken::new();

        let pool2 = pool.clone();
        let cancel2 = cancel.clone();
        let query = tokio::spawn(async move {
            query_encoded(&pool2, "select 1", vec![], 10, &cancel2, ResultFormat::Json, None).await
        });

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        cancel.cancel();
        let err = query.await.unwrap().unwrap_err();
        assert!(matches!(err, DbError::Cancelled));

        // A cancelled fake connection (no protocol cancel handle) is
        // discarded rather than returned to the idle queue.
        assert_eq!(pool.idle_count().await, 0);
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn query_encoded_preserves_positional_bind_order_past_nine_params() {
        let mut config = PoolConfig::default();
        config.min_conns = 1;
        config.max_conns = 1;
        let pool = Pool::new(config, || async { Ok(FakeConnection::default()) });
        let cancel = CancelToken::new();

        let payload = ParamsPayload {
            mode: ParamMode::Positional,
            values: (1..=10)
                .map(|n| ParamInput { name: None, type_: ParamType::I64, value: Value::I64(n) })
                .collect(),
        };
        let params = resolve_params(payload).unwrap();
        assert_eq!(params[9].name, "$10");

        query_encoded(&pool, "select 1", params, 10, &cancel, ResultFormat::Json, None)
            .await
            .unwrap();

        // A lexical sort on synthetic names ($1, $10, $11, ..., $2, ...)
        // would have moved $10's value ahead of $2..$9; bind order must
        // stay the wire order resolve_params already established.
        let guard = pool.acquire(&cancel).await.unwrap();
        let last_params = guard.last_params.lock().unwrap().clone().unwrap();
        assert_eq!(last_params.len(), 10);
        for (idx, param) in last_params.iter().enumerate() {
            assert_eq!(param.name, format!("${}", idx + 1));
            assert_eq!(param.value, Value::I64(idx as i64 + 1));
        }
    }

    #[tokio::test]
    async fn query_timeout_trips_before_the_pool_config_default() {
        let mut config = PoolConfig::default();
        config.query_timeout = std::time::Duration::from_millis(30);
        let pool = Pool::new(config, || async {
            let mut conn = FakeConnection::default();
            conn.delay = Some(std::time::Duration::from_millis(300));
            Ok(conn)
        });
        let cancel = CancelToken::new();
        let err = query_encoded(&pool, "select 1", vec![], 10, &cancel, ResultFormat::Json, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Timeout));
    }
}
