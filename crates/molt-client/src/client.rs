//! The public offload client: give a host application a function-call-shaped
//! interface to a worker, with correct concurrency, timeouts, cancellation,
//! and restart. A thin public wrapper around one transport, with the
//! request/response plumbing done by internal `invoke_*` helpers the
//! callers never see directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use molt_wire::{Codec, MetricValue, RequestEnvelope, ResponseEnvelope, Status, WireCodec, CANCEL_ENTRY};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_bytes::ByteBuf;
use tokio::sync::{oneshot, Mutex};

use crate::error::ClientError;
use crate::transport::{Transport, WorkerTarget};

type BeforeSendHook = Arc<dyn Fn(&RequestEnvelope) + Send + Sync>;
type AfterRecvHook = Arc<dyn Fn(&ResponseEnvelope) + Send + Sync>;
type MetricsHook = Arc<dyn Fn(&HashMap<String, MetricValue>) + Send + Sync>;
type CancelCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Per-call knobs: timeout, idempotency, and wire codec for a single
/// `call(entry, payload)`.
#[derive(Clone)]
pub struct CallOptions {
    pub timeout_ms: u32,
    pub idempotent: bool,
    pub codec: Codec,
    /// Polled cooperatively while waiting for a response; once it returns
    /// `true` the client sends `__cancel__` and unblocks with `Cancelled`.
    pub cancel_check: Option<CancelCheck>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            idempotent: false,
            codec: Codec::Msgpack,
            cancel_check: None,
        }
    }
}

/// Builds a [`Client`]; split out from `Client` itself so construction reads
/// as a pipeline of optional knobs rather than a constructor with a long
/// positional parameter list.
pub struct ClientBuilder {
    target: WorkerTarget,
    max_frame_bytes: u32,
    wire: WireCodec,
    restart_grace_ms: u64,
    before_send: Option<BeforeSendHook>,
    after_recv: Option<AfterRecvHook>,
    metrics_hook: Option<MetricsHook>,
}

impl ClientBuilder {
    pub fn spawn(program: impl Into<std::ffi::OsString>, args: impl IntoIterator<Item = impl Into<std::ffi::OsString>>) -> Self {
        Self::new(WorkerTarget::spawn(program, args))
    }

    pub fn socket(path: impl Into<std::path::PathBuf>) -> Self {
        Self::new(WorkerTarget::socket(path))
    }

    fn new(target: WorkerTarget) -> Self {
        Self {
            target,
            max_frame_bytes: molt_wire::DEFAULT_MAX_FRAME_BYTES,
            wire: WireCodec::Msgpack,
            restart_grace_ms: 2_000,
            before_send: None,
            after_recv: None,
            metrics_hook: None,
        }
    }

    pub fn max_frame_bytes(mut self, n: u32) -> Self {
        self.max_frame_bytes = n;
        self
    }

    pub fn wire(mut self, wire: WireCodec) -> Self {
        self.wire = wire;
        self
    }

    /// How long `ensure_connected` waits for in-flight calls on the old
    /// transport to drain before tearing it down, once a client-side
    /// timeout has marked it for restart.
    pub fn restart_grace_ms(mut self, ms: u64) -> Self {
        self.restart_grace_ms = ms;
        self
    }

    pub fn before_send(mut self, hook: impl Fn(&RequestEnvelope) + Send + Sync + 'static) -> Self {
        self.before_send = Some(Arc::new(hook));
        self
    }

    pub fn after_recv(mut self, hook: impl Fn(&ResponseEnvelope) + Send + Sync + 'static) -> Self {
        self.after_recv = Some(Arc::new(hook));
        self
    }

    pub fn metrics_hook(mut self, hook: impl Fn(&HashMap<String, MetricValue>) + Send + Sync + 'static) -> Self {
        self.metrics_hook = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> Client {
        Client {
            target: self.target,
            max_frame_bytes: self.max_frame_bytes,
            wire: self.wire,
            restart_grace_ms: self.restart_grace_ms,
            next_id: AtomicU64::new(1),
            state: Mutex::new(None),
            restart_needed: AtomicBool::new(false),
            before_send: self.before_send,
            after_recv: self.after_recv,
            metrics_hook: self.metrics_hook,
        }
    }
}

/// A function-call-shaped handle onto one worker connection (spawned child
/// or attached Unix socket). Safe to share across tasks: every method takes
/// `&self`.
pub struct Client {
    target: WorkerTarget,
    max_frame_bytes: u32,
    wire: WireCodec,
    restart_grace_ms: u64,
    next_id: AtomicU64,
    state: Mutex<Option<Arc<Transport>>>,
    restart_needed: AtomicBool,
    before_send: Option<BeforeSendHook>,
    after_recv: Option<AfterRecvHook>,
    metrics_hook: Option<MetricsHook>,
}

impl Client {
    pub fn builder_spawn(
        program: impl Into<std::ffi::OsString>,
        args: impl IntoIterator<Item = impl Into<std::ffi::OsString>>,
    ) -> ClientBuilder {
        ClientBuilder::spawn(program, args)
    }

    pub fn builder_socket(path: impl Into<std::path::PathBuf>) -> ClientBuilder {
        ClientBuilder::socket(path)
    }

    /// Preflight: a `health` call that raises on failure.
    pub async fn ping(&self, timeout_ms: u32) -> Result<(), ClientError> {
        let _: serde_json::Value = self
            .call(
                "health",
                &serde_json::Value::Null,
                CallOptions { timeout_ms, ..CallOptions::default() },
            )
            .await?;
        Ok(())
    }

    pub async fn call<P: Serialize, R: DeserializeOwned>(
        &self,
        entry: &str,
        payload: &P,
        options: CallOptions,
    ) -> Result<R, ClientError> {
        let payload_bytes = molt_wire::encode_payload(payload, options.codec.as_str())?;

        let response = match self.call_once(entry, payload_bytes.clone(), options.codec, &options).await {
            Ok(response) => response,
            Err(ClientError::Timeout(_)) | Err(ClientError::WorkerUnavailable) if options.idempotent => {
                self.call_once(entry, payload_bytes, options.codec, &options).await?
            }
            Err(err) => return Err(err),
        };

        match response.status {
            Status::Ok => {
                let bytes = response.payload.map(ByteBuf::into_vec).unwrap_or_default();
                Ok(molt_wire::decode_payload(&bytes, options.codec.as_str())?)
            }
            other => Err(ClientError::Worker {
                status: other,
                message: response.error.unwrap_or_default(),
            }),
        }
    }

    /// Best-effort cancellation of a still-in-flight `request_id`. No-op if
    /// no transport is currently connected.
    pub async fn cancel(&self, request_id: u64) -> Result<(), ClientError> {
        let transport = { self.state.lock().await.clone() };
        match transport {
            Some(transport) => self.send_cancel(&transport, request_id),
            None => Ok(()),
        }
    }

    /// Tears down the current transport (killing a spawned child, if any).
    pub async fn close(&self) {
        *self.state.lock().await = None;
    }

    async fn call_once(
        &self,
        entry: &str,
        payload_bytes: Vec<u8>,
        codec: Codec,
        options: &CallOptions,
    ) -> Result<ResponseEnvelope, ClientError> {
        let transport = self.ensure_connected().await?;
        let request_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = RequestEnvelope {
            request_id,
            entry: entry.to_string(),
            timeout_ms: options.timeout_ms,
            codec: codec.as_str().to_string(),
            payload: Some(ByteBuf::from(payload_bytes)),
            payload_b64: None,
        };

        if let Some(hook) = &self.before_send {
            hook(&request);
        }

        let frame = molt_wire::encode_request_frame(&request, self.wire)?;
        let rx = transport.register(request_id).await;
        if let Err(err) = transport.send_frame(frame) {
            transport.unregister(request_id).await;
            return Err(err);
        }

        self.await_response(&transport, request_id, rx, options).await
    }

    async fn await_response(
        &self,
        transport: &Arc<Transport>,
        request_id: u64,
        mut rx: oneshot::Receiver<Result<ResponseEnvelope, ClientError>>,
        options: &CallOptions,
    ) -> Result<ResponseEnvelope, ClientError> {
        let timeout = Duration::from_millis(options.timeout_ms.max(1) as u64);
        let sleep = tokio::time::sleep(timeout);
        tokio::pin!(sleep);
        let mut poll = tokio::time::interval(Duration::from_millis(20));
        poll.tick().await;

        loop {
            tokio::select! {
                received = &mut rx => {
                    transport.unregister(request_id).await;
                    return match received {
                        Ok(Ok(response)) => {
                            if let Some(hook) = &self.after_recv {
                                hook(&response);
                            }
                            if let (Some(metrics), Some(hook)) = (&response.metrics, &self.metrics_hook) {
                                hook(metrics);
                            }
                            Ok(response)
                        }
                        Ok(Err(err)) => Err(err),
                        Err(_) => Err(ClientError::ChannelClosed),
                    };
                }
                _ = &mut sleep => {
                    let _ = self.send_cancel(transport, request_id);
                    self.restart_needed.store(true, Ordering::SeqCst);
                    transport.unregister(request_id).await;
                    return Err(ClientError::Timeout(timeout));
                }
                _ = poll.tick(), if options.cancel_check.is_some() => {
                    if (options.cancel_check.as_ref().unwrap())() {
                        let _ = self.send_cancel(transport, request_id);
                        transport.unregister(request_id).await;
                        return Err(ClientError::Cancelled);
                    }
                }
            }
        }
    }

    fn send_cancel(&self, transport: &Arc<Transport>, target_request_id: u64) -> Result<(), ClientError> {
        let cancel = molt_wire::CancelRequest { request_id: target_request_id };
        let bytes = molt_wire::encode_payload(&cancel, "msgpack")?;
        let envelope = RequestEnvelope {
            request_id: self.next_id.fetch_add(1, Ordering::SeqCst),
            entry: CANCEL_ENTRY.to_string(),
            timeout_ms: 0,
            codec: "msgpack".to_string(),
            payload: Some(ByteBuf::from(bytes)),
            payload_b64: None,
        };
        let frame = molt_wire::encode_request_frame(&envelope, self.wire)?;
        transport.send_frame(frame)
    }

    /// Returns the current transport, restarting it if the previous one
    /// died or was marked for restart by a client-side timeout. A restart
    /// waits up to `restart_grace_ms` for the old transport's in-flight
    /// calls to drain before tearing it down.
    async fn ensure_connected(&self) -> Result<Arc<Transport>, ClientError> {
        let mut state = self.state.lock().await;

        if let Some(transport) = state.clone() {
            let needs_restart = self.restart_needed.load(Ordering::SeqCst);
            if !transport.is_dead() && !needs_restart {
                return Ok(transport);
            }
            if needs_restart && !transport.is_dead() {
                let deadline = Instant::now() + Duration::from_millis(self.restart_grace_ms);
                while transport.in_flight_count().await > 0 && Instant::now() < deadline {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }
            *state = None;
            self.restart_needed.store(false, Ordering::SeqCst);
        }

        let transport = Arc::new(Transport::connect(&self.target, self.max_frame_bytes).await?);
        *state = Some(transport.clone());
        Ok(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_options_default_matches_spec_defaults() {
        let options = CallOptions::default();
        assert!(!options.idempotent);
        assert!(matches!(options.codec, Codec::Msgpack));
    }
}
