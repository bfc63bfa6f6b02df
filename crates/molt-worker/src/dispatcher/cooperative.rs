//! The cooperative dispatcher runtime: every admitted request runs as a
//! `tokio::spawn`ed task on a single async reactor, picked at startup as
//! an alternative to the synchronous runtime for workloads that need
//! async DB drivers. Unlike the synchronous runtime's OS-thread pool,
//! concurrency here is bounded by a
//! [`tokio::sync::Semaphore`] sized to `max_queue`: `try_acquire_owned`
//! failing immediately maps to `Busy`, the same admission contract
//! `sync::SyncDispatcher::try_submit` gives the frame reader.

use std::sync::Arc;
use std::time::Instant;

use molt_wire::{decode_payload, encode_payload, RequestEnvelope, ResponseEnvelope, Status, WireCodec};
use tokio::sync::Semaphore;
use tracing::info_span;

use crate::capabilities::CapabilitySet;
use crate::db_pools::DbPools;
use crate::dispatcher::{elapsed_us, CancelRegistry, DispatcherConfig, Metrics};
use crate::handlers::{self, HandlerError};
use crate::registry::{DispatchError, ExportRegistry, ResolvedExport};

/// Cheap to clone (shares its `Arc`s); intended to be handed to a task
/// spawned per incoming frame.
#[derive(Clone)]
pub struct CooperativeDispatcher {
    admission: Arc<Semaphore>,
    max_queue: usize,
    registry: Arc<ExportRegistry>,
    db_pools: Arc<DbPools>,
    capabilities: Arc<CapabilitySet>,
    cancel_registry: CancelRegistry,
    default_timeout_ms: u32,
    max_rows_cap: Option<usize>,
}

impl CooperativeDispatcher {
    pub fn new(
        config: DispatcherConfig,
        registry: Arc<ExportRegistry>,
        db_pools: Arc<DbPools>,
        capabilities: Arc<CapabilitySet>,
        cancel_registry: CancelRegistry,
    ) -> Self {
        Self {
            admission: Arc::new(Semaphore::new(config.max_queue)),
            max_queue: config.max_queue,
            registry,
            db_pools,
            capabilities,
            cancel_registry,
            default_timeout_ms: config.default_timeout_ms,
            max_rows_cap: config.max_rows_cap,
        }
    }

    /// Admits and runs one request to completion, or returns `Busy`
    /// immediately if every admission slot is already in use. Callers
    /// typically `tokio::spawn` this so a slow request doesn't block the
    /// frame reader from admitting the next one.
    pub async fn dispatch(
        &self,
        envelope: RequestEnvelope,
        wire: WireCodec,
        queued_at: Instant,
    ) -> (WireCodec, ResponseEnvelope) {
        let request_id = envelope.request_id;
        let payload_bytes_len = envelope.payload.as_ref().map(|p| p.len()).unwrap_or(0) as u64;

        let _permit = match self.admission.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                let metrics = Metrics {
                    queue_us: elapsed_us(queued_at),
                    queue_depth: self.max_queue as u64,
                    payload_bytes: payload_bytes_len,
                    ..Metrics::default()
                };
                return (
                    wire,
                    ResponseEnvelope::error(request_id, Status::Busy, "dispatcher queue is full", Some(metrics.into_map())),
                );
            }
        };

        let queue_depth = (self.max_queue - self.admission.available_permits()) as u64;
        let response = self.handle_request(envelope, queue_depth, queued_at).await;
        (wire, response)
    }

    async fn handle_request(&self, envelope: RequestEnvelope, queue_depth: u64, queued_at: Instant) -> ResponseEnvelope {
        let request_id = envelope.request_id;
        let dispatch_start = Instant::now();
        let _span = info_span!("request", request_id, entry = %envelope.entry).entered();

        let mut metrics = Metrics {
            queue_us: elapsed_us(queued_at),
            queue_depth,
            payload_bytes: envelope.payload.as_ref().map(|p| p.len()).unwrap_or(0) as u64,
            ..Metrics::default()
        };

        let token = self.cancel_registry.register(request_id);
        if token.is_cancelled() {
            self.cancel_registry.unregister(request_id);
            return terminal(request_id, Status::Cancelled, "request cancelled", metrics);
        }

        let timeout_ms = if envelope.timeout_ms == 0 {
            self.default_timeout_ms
        } else {
            envelope.timeout_ms
        };
        let deadline = handlers::deadline_from_timeout_ms(timeout_ms, dispatch_start);

        let decode_start = Instant::now();
        let payload_bytes = match envelope.payload_bytes() {
            Ok(bytes) => bytes,
            Err(err) => {
                self.cancel_registry.unregister(request_id);
                return terminal(request_id, Status::InvalidInput, err.to_string(), metrics);
            }
        };
        metrics.decode_us = elapsed_us(decode_start);

        let exec_start = Instant::now();
        let result = self
            .dispatch_entry(&envelope.entry, &payload_bytes, &envelope.codec, &token, deadline, &mut metrics)
            .await;
        metrics.exec_us = elapsed_us(exec_start);
        metrics.handler_us = elapsed_us(dispatch_start);

        self.cancel_registry.unregister(request_id);

        match result {
            Ok(payload) => ResponseEnvelope::ok(request_id, payload, metrics.into_map()),
            Err((status, message)) => terminal(request_id, status, message, metrics),
        }
    }

    async fn dispatch_entry(
        &self,
        entry: &str,
        payload_bytes: &[u8],
        codec: &str,
        token: &molt_db::CancelToken,
        deadline: Option<Instant>,
        metrics: &mut Metrics,
    ) -> Result<Vec<u8>, (Status, String)> {
        let resolved = self.registry.resolve(entry).map_err(|err| match err {
            DispatchError::UnknownEntry(name) => (Status::InvalidInput, format!("unknown export {name}")),
            DispatchError::NotWired(name) => (
                Status::InternalError,
                format!("manifest and compiled set diverged: entry '{name}' is declared but not wired"),
            ),
        })?;

        let name = match resolved {
            ResolvedExport::Builtin(name) => name,
            ResolvedExport::Compiled(entry) => {
                return Err((
                    Status::InternalError,
                    format!("compiled entry '{}' has no handler linked into this binary", entry.name),
                ));
            }
        };

        match name {
            "health" => {
                let response = handlers::health(token, deadline).map_err(handler_err)?;
                encode(&response, codec)
            }
            "list" => {
                let request: handlers::ListRequest = decode_payload(payload_bytes, codec).map_err(invalid_input)?;
                let response = handlers::list(&request, token, deadline).map_err(handler_err)?;
                encode(&response, codec)
            }
            "compute" => {
                let request: handlers::ComputeRequest = decode_payload(payload_bytes, codec).map_err(invalid_input)?;
                let response = handlers::compute(&request, token, deadline).map_err(handler_err)?;
                encode(&response, codec)
            }
            "offload_table" => {
                let request: handlers::OffloadTableRequest =
                    decode_payload(payload_bytes, codec).map_err(invalid_input)?;
                let response = handlers::offload_table(&request, token, deadline).map_err(handler_err)?;
                encode(&response, codec)
            }
            "db_query" => {
                let mut request: handlers::DbQueryRequest =
                    decode_payload(payload_bytes, codec).map_err(invalid_input)?;
                if let Some(cap) = self.max_rows_cap {
                    request.max_rows = request.max_rows.min(cap);
                }
                if let Some((in_flight, waiters, idle)) = self.db_pools.gauges(&request.db_alias).await {
                    metrics.pool_in_flight = in_flight as u64;
                    metrics.pool_waiters = waiters as u64;
                    metrics.pool_idle = idle as u64;
                }
                let encoded = self
                    .db_pools
                    .query(&request, &self.capabilities, token, deadline)
                    .await
                    .map_err(handler_err)?;
                metrics.db_alias = Some(request.db_alias.clone());
                metrics.db_tag = request.tag.clone();
                metrics.db_row_count = Some(encoded.row_count);
                metrics.db_bytes_in = Some(payload_bytes.len() as u64);
                metrics.db_bytes_out = Some(encoded.bytes.len() as u64);
                metrics.db_result_format = Some(request.result_format.clone());
                Ok(encoded.bytes)
            }
            "db_exec" => {
                let request: handlers::DbExecRequest =
                    decode_payload(payload_bytes, codec).map_err(invalid_input)?;
                if let Some((in_flight, waiters, idle)) = self.db_pools.gauges(&request.db_alias).await {
                    metrics.pool_in_flight = in_flight as u64;
                    metrics.pool_waiters = waiters as u64;
                    metrics.pool_idle = idle as u64;
                }
                let encoded = self
                    .db_pools
                    .exec(&request, &self.capabilities, token, deadline)
                    .await
                    .map_err(handler_err)?;
                metrics.db_alias = Some(request.db_alias.clone());
                metrics.db_tag = request.tag.clone();
                metrics.db_row_count = Some(encoded.row_count);
                metrics.db_bytes_in = Some(payload_bytes.len() as u64);
                metrics.db_bytes_out = Some(encoded.bytes.len() as u64);
                metrics.db_result_format = Some(request.result_format.clone());
                Ok(encoded.bytes)
            }
            other => Err((Status::InternalError, format!("builtin entry '{other}' has no handler"))),
        }
    }
}

fn terminal(request_id: u64, status: Status, message: impl Into<String>, metrics: Metrics) -> ResponseEnvelope {
    ResponseEnvelope::error(request_id, status, message, Some(metrics.into_map()))
}

fn encode<T: serde::Serialize>(value: &T, codec: &str) -> Result<Vec<u8>, (Status, String)> {
    encode_payload(value, codec).map_err(|err| (Status::InternalError, err.to_string()))
}

fn invalid_input(err: molt_wire::EnvelopeError) -> (Status, String) {
    (Status::InvalidInput, err.to_string())
}

fn handler_err(err: HandlerError) -> (Status, String) {
    match err {
        HandlerError::InvalidInput(msg) => (Status::InvalidInput, msg),
        HandlerError::Timeout => (Status::Timeout, "request timed out".to_string()),
        HandlerError::Cancelled => (Status::Cancelled, "request cancelled".to_string()),
        HandlerError::Internal(msg) => (Status::InternalError, msg),
        HandlerError::CapabilityDenied(msg) => (Status::InvalidInput, msg),
        HandlerError::Busy => (Status::Busy, "pool busy: no connection available within max_wait_ms".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::Capability;
    use crate::db_pools::AnyPool;
    use molt_db::connection::fake::FakeConnection;
    use molt_db::{PoolConfig, Pool};
    use std::path::Path;

    fn test_registry() -> Arc<ExportRegistry> {
        let manifest = write_manifest(r#"{"abi_version": "1.0", "exports": []}"#);
        Arc::new(ExportRegistry::load(manifest.path(), None::<&Path>).unwrap())
    }

    fn write_manifest(contents: &str) -> tempfile::NamedTempFile {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn envelope(entry: &str, payload: Vec<u8>) -> RequestEnvelope {
        RequestEnvelope {
            request_id: 1,
            entry: entry.to_string(),
            timeout_ms: 0,
            codec: "json".to_string(),
            payload: Some(serde_bytes::ByteBuf::from(payload)),
            payload_b64: None,
        }
    }

    fn dispatcher(db_pools: DbPools, capabilities: CapabilitySet) -> CooperativeDispatcher {
        CooperativeDispatcher::new(
            DispatcherConfig::default(),
            test_registry(),
            Arc::new(db_pools),
            Arc::new(capabilities),
            CancelRegistry::new(),
        )
    }

    #[tokio::test]
    async fn happy_path_health_echo() {
        let dispatcher = dispatcher(DbPools::new(), CapabilitySet::empty());
        let (_, response) = dispatcher
            .dispatch(envelope("health", Vec::new()), WireCodec::Json, Instant::now())
            .await;
        assert!(matches!(response.status, Status::Ok));
    }

    #[tokio::test]
    async fn unknown_entry_is_invalid_input() {
        let dispatcher = dispatcher(DbPools::new(), CapabilitySet::empty());
        let (_, response) = dispatcher
            .dispatch(envelope("does_not_exist", Vec::new()), WireCodec::Json, Instant::now())
            .await;
        assert!(matches!(response.status, Status::InvalidInput));
    }

    #[tokio::test]
    async fn db_query_runs_through_a_fake_pool_with_capability_granted() {
        let mut pools = DbPools::new();
        let pool = Pool::new(PoolConfig::default(), || async {
            let mut conn = FakeConnection::default();
            conn.tables.insert("select 1".to_string(), vec![vec![molt_db::Value::I64(1)]]);
            Ok(conn)
        });
        pools.insert("primary", AnyPool::Fake(pool));
        let dispatcher = dispatcher(pools, CapabilitySet::empty().with(Capability::DbRead));

        let payload = encode_payload(
            &serde_json::json!({"db_alias": "primary", "sql": "select 1", "max_rows": 10}),
            "json",
        )
        .unwrap();
        let (_, response) = dispatcher
            .dispatch(envelope("db_query", payload), WireCodec::Json, Instant::now())
            .await;
        assert!(matches!(response.status, Status::Ok));
    }

    #[tokio::test]
    async fn db_write_without_capability_is_rejected() {
        let mut pools = DbPools::new();
        let pool = Pool::new(PoolConfig::default(), || async { Ok(FakeConnection::default()) });
        pools.insert("primary", AnyPool::Fake(pool));
        let dispatcher = dispatcher(pools, CapabilitySet::empty());

        let payload = encode_payload(
            &serde_json::json!({"db_alias": "primary", "sql": "delete from widgets"}),
            "json",
        )
        .unwrap();
        let (_, response) = dispatcher
            .dispatch(envelope("db_exec", payload), WireCodec::Json, Instant::now())
            .await;
        assert!(matches!(response.status, Status::InvalidInput));
    }

    #[tokio::test]
    async fn full_admission_queue_is_busy_without_executing() {
        let config = DispatcherConfig {
            max_queue: 1,
            ..DispatcherConfig::default()
        };
        let dispatcher = CooperativeDispatcher::new(
            config,
            test_registry(),
            Arc::new(DbPools::new()),
            Arc::new(CapabilitySet::empty()),
            CancelRegistry::new(),
        );

        let held = dispatcher.admission.clone().try_acquire_owned().unwrap();
        let (_, response) = dispatcher
            .dispatch(envelope("health", Vec::new()), WireCodec::Json, Instant::now())
            .await;
        assert!(matches!(response.status, Status::Busy));
        drop(held);
    }

    #[tokio::test]
    async fn cancel_in_flight_is_observed() {
        let dispatcher = dispatcher(DbPools::new(), CapabilitySet::empty());
        dispatcher.cancel_registry.cancel(1);
        let (_, response) = dispatcher
            .dispatch(envelope("health", Vec::new()), WireCodec::Json, Instant::now())
            .await;
        assert!(matches!(response.status, Status::Cancelled));
    }
}
