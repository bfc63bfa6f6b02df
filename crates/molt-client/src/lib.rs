//! Offload client library: a host application depends on this crate to
//! spawn or attach to a `molt-worker`, then calls entries as if they were
//! local async functions, with client-side timeouts, cooperative
//! cancellation, and automatic restart after a worker crash or a timed-out
//! call. Mirrors `molt-wire`'s worker-side decode/encode pair with a
//! client-side encode/decode pair of its own.

pub mod client;
pub mod error;
pub mod outcome;
pub mod pool;
pub mod transport;

pub use client::{CallOptions, Client, ClientBuilder};
pub use error::ClientError;
pub use outcome::ResponseOutcome;
pub use pool::ClientPool;
pub use transport::WorkerTarget;
