//! Shared dispatcher types used by both runtimes: request metrics,
//! configuration, and the per-request state machine.

pub mod cooperative;
pub mod sync;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use molt_db::CancelToken;
use molt_wire::{MetricValue, Status};

/// Picked once at worker startup and never changed afterward.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RuntimeKind {
    Synchronous,
    Cooperative,
}

impl RuntimeKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sync" => Some(Self::Synchronous),
            "async" | "cooperative" => Some(Self::Cooperative),
            _ => None,
        }
    }
}

/// Immutable dispatcher configuration, built once from CLI flags/env vars
/// and never mutated after startup.
#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    pub threads: usize,
    pub max_queue: usize,
    pub runtime: RuntimeKind,
    pub default_timeout_ms: u32,
    /// Global clamp on a DB request's `max_rows`, sourced from an
    /// environment variable and applied on top of whatever the request
    /// itself asked for.
    /// `None` means no extra clamp beyond the per-request field.
    pub max_rows_cap: Option<usize>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            threads: std::thread::available_parallelism().map(|c| c.get()).unwrap_or(4),
            max_queue: 64,
            runtime: RuntimeKind::Synchronous,
            default_timeout_ms: 30_000,
            max_rows_cap: None,
        }
    }
}

/// Per-request state machine: `Queued -> Running -> terminal`. Used only
/// for test assertions; the wire only ever observes the terminal `status`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RequestState {
    Queued,
    Running,
    Terminal(TerminalState),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TerminalState {
    Ok,
    InvalidInput,
    Busy,
    Timeout,
    Cancelled,
    InternalError,
}

impl TerminalState {
    pub fn status(self) -> Status {
        match self {
            TerminalState::Ok => Status::Ok,
            TerminalState::InvalidInput => Status::InvalidInput,
            TerminalState::Busy => Status::Busy,
            TerminalState::Timeout => Status::Timeout,
            TerminalState::Cancelled => Status::Cancelled,
            TerminalState::InternalError => Status::InternalError,
        }
    }
}

/// Per-request metrics, in microseconds (`queue_us`, `handler_us`,
/// `exec_us`, `decode_us`).
#[derive(Clone, Debug, Default)]
pub struct Metrics {
    pub queue_us: u64,
    pub decode_us: u64,
    pub exec_us: u64,
    pub handler_us: u64,
    pub queue_depth: u64,
    pub pool_in_flight: u64,
    pub pool_idle: u64,
    pub pool_waiters: u64,
    pub payload_bytes: u64,
    // DB-specific fields, only attached when a request actually
    // went through `molt_db` — `None` means "not a DB request", not "zero".
    pub db_alias: Option<String>,
    pub db_tag: Option<String>,
    pub db_row_count: Option<u64>,
    pub db_bytes_in: Option<u64>,
    pub db_bytes_out: Option<u64>,
    pub db_result_format: Option<String>,
}

impl Metrics {
    pub fn into_map(self) -> HashMap<String, MetricValue> {
        let mut map = HashMap::with_capacity(15);
        map.insert("queue_us".to_string(), self.queue_us.into());
        map.insert("decode_us".to_string(), self.decode_us.into());
        map.insert("exec_us".to_string(), self.exec_us.into());
        map.insert("handler_us".to_string(), self.handler_us.into());
        map.insert("queue_depth".to_string(), self.queue_depth.into());
        map.insert("pool_in_flight".to_string(), self.pool_in_flight.into());
        map.insert("pool_idle".to_string(), self.pool_idle.into());
        map.insert("pool_waiters".to_string(), self.pool_waiters.into());
        map.insert("payload_bytes".to_string(), self.payload_bytes.into());
        if let Some(alias) = self.db_alias {
            map.insert("db_alias".to_string(), alias.into());
        }
        if let Some(tag) = self.db_tag {
            map.insert("db_tag".to_string(), tag.into());
        }
        if let Some(row_count) = self.db_row_count {
            map.insert("db_row_count".to_string(), row_count.into());
        }
        if let Some(bytes_in) = self.db_bytes_in {
            map.insert("db_bytes_in".to_string(), bytes_in.into());
        }
        if let Some(bytes_out) = self.db_bytes_out {
            map.insert("db_bytes_out".to_string(), bytes_out.into());
        }
        if let Some(format) = self.db_result_format {
            map.insert("db_result_format".to_string(), format.into());
        }
        map
    }
}

pub(crate) fn elapsed_us(since: Instant) -> u64 {
    since.elapsed().as_micros().min(u128::from(u64::MAX)) as u64
}

/// Maps in-flight `request_id`s to their cooperative [`CancelToken`]. A
/// `__cancel__` frame may race ahead of the request actually being
/// dequeued, so a cancellation for an unknown id is remembered in
/// `pending_cancels` and applied the moment the request registers.
#[derive(Clone, Default)]
pub struct CancelRegistry {
    inner: Arc<Mutex<CancelRegistryState>>,
}

#[derive(Default)]
struct CancelRegistryState {
    tokens: HashMap<u64, CancelToken>,
    pending_cancels: HashSet<u64>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called when a request starts being tracked (at enqueue time, so a
    /// `__cancel__` racing ahead of dequeue still lands). Returns the
    /// token the handler should poll.
    pub fn register(&self, request_id: u64) -> CancelToken {
        let mut state = self.inner.lock().unwrap();
        let token = CancelToken::new();
        if state.pending_cancels.remove(&request_id) {
            token.cancel();
        }
        state.tokens.insert(request_id, token.clone());
        token
    }

    /// Transitions a request's token to cancelled. Idempotent — repeated
    /// `__cancel__` frames for the same id are no-ops.
    pub fn cancel(&self, request_id: u64) {
        let mut state = self.inner.lock().unwrap();
        if let Some(token) = state.tokens.get(&request_id) {
            token.cancel();
        } else {
            state.pending_cancels.insert(request_id);
        }
    }

    /// Releases bookkeeping once a response has been sent.
    pub fn unregister(&self, request_id: u64) {
        let mut state = self.inner.lock().unwrap();
        state.tokens.remove(&request_id);
        state.pending_cancels.remove(&request_id);
    }
}

#[cfg(test)]
mod registry_tests {
    use super::*;

    #[test]
    fn cancel_before_register_is_observed_on_register() {
        let registry = CancelRegistry::new();
        registry.cancel(7);
        let token = registry.register(7);
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancel_after_register_is_observed_immediately() {
        let registry = CancelRegistry::new();
        let token = registry.register(9);
        assert!(!token.is_cancelled());
        registry.cancel(9);
        assert!(token.is_cancelled());
    }

    #[test]
    fn repeated_cancel_is_idempotent() {
        let registry = CancelRegistry::new();
        registry.cancel(1);
        registry.cancel(1);
        let token = registry.register(1);
        assert!(token.is_cancelled());
    }
}
