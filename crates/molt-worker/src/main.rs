//! The `molt-worker` binary: parses CLI flags and environment, builds the
//! export registry, DB pools, and the selected dispatcher runtime, then
//! serves framed requests over stdio or a Unix domain socket until
//! EOF/shutdown.

use std::io::{self, BufReader, BufWriter};
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use molt_db::connection::fake::FakeConnection;
use molt_db::{PgConnection, Pool, PoolConfig, SqliteConnection};
use molt_wire::{
    decode_request_frame, encode_response_frame, read_frame, write_frame, CancelRequest,
    WireCodec, CANCEL_ENTRY, DEFAULT_MAX_FRAME_BYTES,
};
use molt_worker::capabilities::CapabilitySet;
use molt_worker::db_pools::{AnyPool, DbPools};
use molt_worker::dispatcher::cooperative::CooperativeDispatcher;
use molt_worker::dispatcher::sync::{DispatchedResponse, QueuedRequest, SyncDispatcher};
use molt_worker::dispatcher::{CancelRegistry, DispatcherConfig, RuntimeKind};
use molt_worker::metrics_log::MetricsLogger;
use molt_worker::registry::ExportRegistry;

enum Transport {
    Stdio,
    Socket(PathBuf),
}

struct Config {
    transport: Transport,
    exports: PathBuf,
    compiled_exports: Option<PathBuf>,
    dispatcher: DispatcherConfig,
    max_frame_bytes: u32,
}

fn parse_args() -> Result<Config, String> {
    let mut transport = None;
    let mut exports = None;
    let mut compiled_exports = None;
    let mut dispatcher = DispatcherConfig::default();
    let mut max_frame_bytes = env_u32("MOLT_MAX_FRAME_BYTES").unwrap_or(DEFAULT_MAX_FRAME_BYTES);

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--stdio" => transport = Some(Transport::Stdio),
            "--socket" => {
                let path = args.next().ok_or("--socket requires a path")?;
                transport = Some(Transport::Socket(PathBuf::from(path)));
            }
            "--exports" => {
                exports = Some(PathBuf::from(args.next().ok_or("--exports requires a path")?));
            }
            "--compiled-exports" => {
                compiled_exports =
                    Some(PathBuf::from(args.next().ok_or("--compiled-exports requires a path")?));
            }
            "--threads" => {
                dispatcher.threads = args
                    .next()
                    .ok_or("--threads requires a value")?
                    .parse()
                    .map_err(|_| "invalid --threads value".to_string())?;
            }
            "--max-queue" => {
                dispatcher.max_queue = args
                    .next()
                    .ok_or("--max-queue requires a value")?
                    .parse()
                    .map_err(|_| "invalid --max-queue value".to_string())?;
            }
            "--runtime" => {
                let value = args.next().ok_or("--runtime requires sync|async")?;
                dispatcher.runtime = RuntimeKind::parse(&value)
                    .ok_or_else(|| format!("unknown --runtime value '{value}'"))?;
            }
            "--max-frame-bytes" => {
                max_frame_bytes = args
                    .next()
                    .ok_or("--max-frame-bytes requires a value")?
                    .parse()
                    .map_err(|_| "invalid --max-frame-bytes value".to_string())?;
            }
            other => return Err(format!("unrecognized argument '{other}'")),
        }
    }

    if let Some(cap) = env_usize("MOLT_MAX_ROWS") {
        dispatcher.max_rows_cap = Some(cap);
    }
    if let Some(timeout) = env_u32("MOLT_DEFAULT_TIMEOUT_MS") {
        dispatcher.default_timeout_ms = timeout;
    }

    Ok(Config {
        transport: transport.ok_or("one of --stdio or --socket PATH is required")?,
        exports: exports.ok_or("--exports PATH is required")?,
        compiled_exports,
        dispatcher,
        max_frame_bytes,
    })
}

fn env_u32(name: &str) -> Option<u32> {
    std::env::var(name).ok()?.parse().ok()
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok()?.parse().ok()
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.parse().ok()
}

/// Builds every configured [`DbPools`] alias from the environment:
/// `MOLT_SQLITE_PATH` wires a convenience `sqlite` alias;
/// `MOLT_DB_ALIASES` (comma-separated) wires one Postgres alias per name
/// via `MOLT_DB_<ALIAS>_DSN`, or an in-process fake alias (for demos and
/// the worker's own seed-scenario smoke tests) via `MOLT_DB_<ALIAS>_FAKE=1`.
async fn build_db_pools() -> DbPools {
    let mut pools = DbPools::new();

    if let Ok(path) = std::env::var("MOLT_SQLITE_PATH") {
        let read_only = std::env::var("MOLT_SQLITE_READONLY").as_deref() == Ok("1");
        let config = PoolConfig::from_env("sqlite");
        let pool = Pool::new(config, move || {
            let path = path.clone();
            async move { SqliteConnection::open_with_mode(&path, read_only).await }
        });
        pool.prewarm().await;
        pool.spawn_reaper();
        pools.insert("sqlite", AnyPool::Sqlite(pool));
    }

    let aliases = std::env::var("MOLT_DB_ALIASES").unwrap_or_default();
    for alias in aliases.split(',').map(str::trim).filter(|a| !a.is_empty()) {
        let upper = alias.to_uppercase();
        let config = PoolConfig::from_env(alias);

        if std::env::var(format!("MOLT_DB_{upper}_FAKE")).as_deref() == Ok("1") {
            let delay_ms = env_u64(&format!("MOLT_DB_{upper}_SIM_LATENCY_MS"));
            let decode_us = env_u64(&format!("MOLT_DB_{upper}_SIM_DECODE_US_PER_ROW")).unwrap_or(0);
            let cpu_iters = env_u64(&format!("MOLT_DB_{upper}_SIM_CPU_ITERS_PER_ROW")).unwrap_or(0);
            let pool = Pool::new(config, move || async move {
                Ok(FakeConnection {
                    delay: delay_ms.map(std::time::Duration::from_millis),
                    decode_us_per_row: decode_us,
                    cpu_iters_per_row: cpu_iters,
                    ..FakeConnection::default()
                })
            });
            pool.prewarm().await;
            pools.insert(alias, AnyPool::Fake(pool));
            continue;
        }

        let dsn = match std::env::var(format!("MOLT_DB_{upper}_DSN")) {
            Ok(dsn) => dsn,
            Err(_) => {
                tracing::warn!(alias, "MOLT_DB_ALIASES names an alias with no _DSN or _FAKE set; skipping");
                continue;
            }
        };
        let connect_config = config.clone();
        let pool = Pool::new(config, move || {
            let dsn = dsn.clone();
            let connect_config = connect_config.clone();
            async move { PgConnection::connect(&dsn, &connect_config).await }
        });
        pool.prewarm().await;
        pool.spawn_reaper();
        pools.insert(alias, AnyPool::Postgres(pool));
    }

    pools
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match parse_args() {
        Ok(config) => config,
        Err(message) => {
            eprintln!("molt-worker: {message}");
            return ExitCode::FAILURE;
        }
    };

    let registry = match ExportRegistry::load(&config.exports, config.compiled_exports.as_ref()) {
        Ok(registry) => Arc::new(registry),
        Err(err) => {
            eprintln!("molt-worker: failed to load manifest: {err}");
            return ExitCode::FAILURE;
        }
    };

    let capabilities = Arc::new(CapabilitySet::from_env());
    let db_pools = Arc::new(build_db_pools().await);
    let cancel_registry = CancelRegistry::new();
    let metrics_logger = MetricsLogger::from_env();

    let result = match config.transport {
        Transport::Stdio => {
            run_stdio(config.dispatcher, registry, db_pools, capabilities, cancel_registry, metrics_logger, config.max_frame_bytes).await
        }
        Transport::Socket(path) => run_socket(
            path,
            config.dispatcher,
            registry,
            db_pools,
            capabilities,
            cancel_registry,
            metrics_logger,
            config.max_frame_bytes,
        )
        .await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("molt-worker: {err}");
            ExitCode::FAILURE
        }
    }
}

/// Serves one connection (stdio, or a single accepted socket stream) under
/// the synchronous runtime: the calling thread owns frame I/O and only
/// ever reads, decodes, and submits frames — it never waits on a
/// response. A dedicated response-writer thread drains `response_rx` and
/// writes completions as they land. Without this split, a single
/// connection could never have more than one request in flight (the next
/// frame isn't read until the previous response returns), making
/// `--threads` concurrency and the queue-full `Busy` path both
/// unreachable over a real connection. `__cancel__` frames are
/// intercepted before ever reaching the queue.
fn run_sync_connection<R, W>(
    mut reader: R,
    writer: Arc<Mutex<W>>,
    dispatcher: SyncDispatcher,
    cancel_registry: CancelRegistry,
    metrics_logger: MetricsLogger,
    max_frame_bytes: u32,
) -> io::Result<()>
where
    R: io::Read,
    W: io::Write + Send + 'static,
{
    let response_rx = dispatcher.response_rx.clone();
    let response_writer = {
        let writer = writer.clone();
        std::thread::spawn(move || {
            while let Ok(DispatchedResponse { wire, response, entry }) = response_rx.recv() {
                if let Some(metrics) = &response.metrics {
                    metrics_logger.log(response.request_id, &entry, metrics);
                }
                write_response(&writer, wire, &response);
            }
        })
    };

    loop {
        let frame = match read_frame(&mut reader, max_frame_bytes) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(error = %err, "frame read error; closing connection");
                break;
            }
        };

        let (envelope, wire) = match decode_request_frame(&frame) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::warn!(error = %err, "failed to decode request envelope; dropping frame");
                continue;
            }
        };

        if envelope.entry == CANCEL_ENTRY {
            if let Ok(cancel) = molt_wire::decode_payload::<CancelRequest>(
                &envelope.payload_bytes().unwrap_or_default(),
                "json",
            )
            .or_else(|_| molt_wire::decode_payload::<CancelRequest>(
                &envelope.payload_bytes().unwrap_or_default(),
                "msgpack",
            )) {
                cancel_registry.cancel(cancel.request_id);
            }
            continue;
        }

        let queued_at = Instant::now();
        match dispatcher.try_submit(QueuedRequest { envelope, wire, queued_at }) {
            Ok(()) => {}
            Err(QueuedRequest { envelope, wire, .. }) => {
                let response = molt_wire::ResponseEnvelope::error(
                    envelope.request_id,
                    molt_wire::Status::Busy,
                    "dispatcher queue is full",
                    None,
                );
                write_response(&writer, wire, &response);
            }
        }
    }

    dispatcher.shutdown();
    let _ = response_writer.join();
    Ok(())
}

fn write_response<W: io::Write>(writer: &Arc<Mutex<W>>, wire: WireCodec, response: &molt_wire::ResponseEnvelope) {
    let bytes = match encode_response_frame(response, wire) {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::error!(error = %err, "failed to encode response envelope");
            return;
        }
    };
    let mut writer = writer.lock().unwrap();
    if let Err(err) = write_frame(&mut *writer, &bytes) {
        tracing::warn!(error = %err, "frame write error");
    }
}

async fn run_stdio(
    dispatcher_config: DispatcherConfig,
    registry: Arc<ExportRegistry>,
    db_pools: Arc<DbPools>,
    capabilities: Arc<CapabilitySet>,
    cancel_registry: CancelRegistry,
    metrics_logger: MetricsLogger,
    max_frame_bytes: u32,
) -> io::Result<()> {
    match dispatcher_config.runtime {
        RuntimeKind::Synchronous => {
            let dispatcher = SyncDispatcher::spawn(dispatcher_config, registry, cancel_registry.clone());
            let reader = BufReader::new(io::stdin());
            let writer = Arc::new(Mutex::new(BufWriter::new(io::stdout())));
            tokio::task::spawn_blocking(move || {
                run_sync_connection(reader, writer, dispatcher, cancel_registry, metrics_logger, max_frame_bytes)
            })
            .await
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?
        }
        RuntimeKind::Cooperative => {
            let dispatcher =
                CooperativeDispatcher::new(dispatcher_config, registry, db_pools, capabilities, cancel_registry.clone());
            run_cooperative_stdio(dispatcher, cancel_registry, metrics_logger, max_frame_bytes).await
        }
    }
}

async fn run_cooperative_stdio(
    dispatcher: CooperativeDispatcher,
    cancel_registry: CancelRegistry,
    metrics_logger: MetricsLogger,
    max_frame_bytes: u32,
) -> io::Result<()> {
    let mut reader = tokio::io::stdin();
    let writer = Arc::new(tokio::sync::Mutex::new(tokio::io::stdout()));

    loop {
        let frame = match molt_wire::read_frame_async(&mut reader, max_frame_bytes).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(error = %err, "frame read error; closing connection");
                break;
            }
        };

        if !dispatch_one_async(&frame, &dispatcher, &cancel_registry, &metrics_logger, &writer).await {
            continue;
        }
    }
    Ok(())
}

/// Decodes and serves one request frame on the cooperative runtime, writing
/// its response (or handling `__cancel__` inline). Returns `false` on a
/// decode failure (frame dropped, nothing written).
async fn dispatch_one_async(
    frame: &[u8],
    dispatcher: &CooperativeDispatcher,
    cancel_registry: &CancelRegistry,
    metrics_logger: &MetricsLogger,
    writer: &Arc<tokio::sync::Mutex<tokio::io::Stdout>>,
) -> bool {
    let (envelope, wire) = match decode_request_frame(frame) {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::warn!(error = %err, "failed to decode request envelope; dropping frame");
            return false;
        }
    };

    if envelope.entry == CANCEL_ENTRY {
        if let Ok(cancel) = molt_wire::decode_payload::<CancelRequest>(
            &envelope.payload_bytes().unwrap_or_default(),
            "json",
        )
        .or_else(|_| molt_wire::decode_payload::<CancelRequest>(
            &envelope.payload_bytes().unwrap_or_default(),
            "msgpack",
        )) {
            cancel_registry.cancel(cancel.request_id);
        }
        return true;
    }

    spawn_cooperative_dispatch(envelope, wire, dispatcher.clone(), writer.clone(), metrics_logger.clone());
    true
}

/// Dispatches one request on its own task and writes the response, the same
/// way under stdio and a socket connection. The actual handler call happens
/// on a nested `tokio::spawn` so a panicking handler can't take this task
/// (or the connection loop that called it) down with it: a panicked
/// `JoinHandle` is converted into an `InternalError` response instead of
/// silently dropping the request and leaving the client to hang until its
/// own client-side timeout.
fn spawn_cooperative_dispatch<W>(
    envelope: molt_wire::RequestEnvelope,
    wire: WireCodec,
    dispatcher: CooperativeDispatcher,
    writer: Arc<tokio::sync::Mutex<W>>,
    metrics_logger: MetricsLogger,
) where
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let entry = envelope.entry.clone();
    let request_id = envelope.request_id;
    tokio::spawn(async move {
        let queued_at = Instant::now();
        let handler_task = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.dispatch(envelope, wire, queued_at).await })
        };
        let (wire, response) = match handler_task.await {
            Ok(result) => result,
            Err(join_err) => {
                tracing::error!(error = %join_err, entry, "handler task panicked");
                (
                    wire,
                    molt_wire::ResponseEnvelope::error(
                        request_id,
                        molt_wire::Status::InternalError,
                        format!("handler panicked: {join_err}"),
                        None,
                    ),
                )
            }
        };
        if let Some(metrics) = &response.metrics {
            metrics_logger.log(response.request_id, &entry, metrics);
        }
        let bytes = match encode_response_frame(&response, wire) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::error!(error = %err, "failed to encode response envelope");
                return;
            }
        };
        let mut writer = writer.lock().await;
        if let Err(err) = molt_wire::write_frame_async(&mut *writer, &bytes).await {
            tracing::warn!(error = %err, "frame write error");
        }
    });
}

async fn run_socket(
    path: PathBuf,
    dispatcher_config: DispatcherConfig,
    registry: Arc<ExportRegistry>,
    db_pools: Arc<DbPools>,
    capabilities: Arc<CapabilitySet>,
    cancel_registry: CancelRegistry,
    metrics_logger: MetricsLogger,
    max_frame_bytes: u32,
) -> io::Result<()> {
    let _ = std::fs::remove_file(&path);

    match dispatcher_config.runtime {
        RuntimeKind::Synchronous => {
            let listener = UnixListener::bind(&path)?;
            loop {
                let (stream, _addr) = listener.accept()?;
                let dispatcher = SyncDispatcher::spawn(dispatcher_config.clone(), registry.clone(), cancel_registry.clone());
                let cancel_registry = cancel_registry.clone();
                let metrics_logger = metrics_logger.clone();
                let max_frame_bytes = max_frame_bytes;
                std::thread::spawn(move || {
                    let reader = stream.try_clone().expect("unix stream clone");
                    let writer = Arc::new(Mutex::new(stream));
                    if let Err(err) = run_sync_connection(reader, writer, dispatcher, cancel_registry, metrics_logger, max_frame_bytes) {
                        tracing::warn!(error = %err, "connection ended with an error");
                    }
                });
            }
        }
        RuntimeKind::Cooperative => {
            let listener = tokio::net::UnixListener::bind(&path)?;
            loop {
                let (stream, _addr) = listener.accept().await?;
                let dispatcher = CooperativeDispatcher::new(
                    dispatcher_config.clone(),
                    registry.clone(),
                    db_pools.clone(),
                    capabilities.clone(),
                    cancel_registry.clone(),
                );
                let cancel_registry = cancel_registry.clone();
                let metrics_logger = metrics_logger.clone();
                tokio::spawn(run_cooperative_socket_connection(stream, dispatcher, cancel_registry, metrics_logger, max_frame_bytes));
            }
        }
    }
}

async fn run_cooperative_socket_connection(
    stream: tokio::net::UnixStream,
    dispatcher: CooperativeDispatcher,
    cancel_registry: CancelRegistry,
    metrics_logger: MetricsLogger,
    max_frame_bytes: u32,
) {
    let (mut reader, writer) = tokio::io::split(stream);
    let writer = Arc::new(tokio::sync::Mutex::new(writer));

    loop {
        let frame = match molt_wire::read_frame_async(&mut reader, max_frame_bytes).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(error = %err, "frame read error; closing connection");
                break;
            }
        };

        let (envelope, wire) = match decode_request_frame(&frame) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::warn!(error = %err, "failed to decode request envelope; dropping frame");
                continue;
            }
        };

        if envelope.entry == CANCEL_ENTRY {
            if let Ok(cancel) = molt_wire::decode_payload::<CancelRequest>(
                &envelope.payload_bytes().unwrap_or_default(),
                "json",
            )
            .or_else(|_| molt_wire::decode_payload::<CancelRequest>(
                &envelope.payload_bytes().unwrap_or_default(),
                "msgpack",
            )) {
                cancel_registry.cancel(cancel.request_id);
            }
            continue;
        }

        spawn_cooperative_dispatch(envelope, wire, dispatcher.clone(), writer.clone(), metrics_logger.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use molt_wire::{decode_response_frame, encode_request_frame, RequestEnvelope};
    use std::io::{Cursor, Write as _};

    fn test_registry() -> Arc<ExportRegistry> {
        let mut manifest = tempfile::NamedTempFile::new().unwrap();
        manifest.write_all(br#"{"abi_version": "1.0", "exports": []}"#).unwrap();
        Arc::new(ExportRegistry::load(manifest.path(), None::<&std::path::Path>).unwrap())
    }

    fn request_frame(request_id: u64, entry: &str) -> Vec<u8> {
        let envelope = RequestEnvelope {
            request_id,
            entry: entry.to_string(),
            timeout_ms: 0,
            codec: "json".to_string(),
            payload: None,
            payload_b64: None,
        };
        let body = encode_request_frame(&envelope, WireCodec::Json).unwrap();
        let mut frame = Vec::new();
        write_frame(&mut frame, &body).unwrap();
        frame
    }

    /// Two frames are buffered up front and fed to `run_sync_connection` in
    /// one read before either response is written back, proving the reader
    /// doesn't block on `response_rx` between frames — the bug review
    /// comment #4 flagged, which made a second in-flight request over one
    /// connection unreachable.
    #[test]
    fn one_connection_answers_multiple_requests_without_reading_them_one_at_a_time() {
        let mut input = Vec::new();
        input.extend_from_slice(&request_frame(1, "health"));
        input.extend_from_slice(&request_frame(2, "health"));
        let reader = Cursor::new(input);
        let writer = Arc::new(Mutex::new(Vec::new()));

        let config = DispatcherConfig {
            threads: 1,
            max_queue: 4,
            ..DispatcherConfig::default()
        };
        let cancel_registry = CancelRegistry::new();
        let dispatcher = SyncDispatcher::spawn(config, test_registry(), cancel_registry.clone());

        run_sync_connection(
            reader,
            writer.clone(),
            dispatcher,
            cancel_registry,
            MetricsLogger::default(),
            DEFAULT_MAX_FRAME_BYTES,
        )
        .unwrap();

        let output = writer.lock().unwrap().clone();
        let mut cursor = Cursor::new(output);
        let mut request_ids = Vec::new();
        while let Some(bytes) = read_frame(&mut cursor, DEFAULT_MAX_FRAME_BYTES).unwrap() {
            let response = decode_response_frame(&bytes).unwrap();
            assert!(matches!(response.status, molt_wire::Status::Ok));
            request_ids.push(response.request_id);
        }
        assert_eq!(request_ids, vec![1, 2]);
    }
}
