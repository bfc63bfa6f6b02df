//! Errors surfaced by the offload client.

use std::io;
use std::time::Duration;

use molt_wire::Status;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("frame error: {0}")]
    Frame(#[from] molt_wire::FrameError),
    #[error("envelope error: {0}")]
    Envelope(#[from] molt_wire::EnvelopeError),
    #[error("worker is unavailable (process exited or connection closed)")]
    WorkerUnavailable,
    #[error("client-side timeout after {0:?}")]
    Timeout(Duration),
    #[error("request was cancelled")]
    Cancelled,
    #[error("worker returned {status:?}: {message}")]
    Worker { status: Status, message: String },
    #[error("transport channel closed unexpectedly")]
    ChannelClosed,
}
