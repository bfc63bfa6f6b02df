//! The Molt worker library: manifest/export registry, capability gating,
//! demo and DB handlers, and the two dispatcher runtimes. `main.rs` wires
//! these into the actual stdio/socket-serving binary.

pub mod capabilities;
pub mod db_pools;
pub mod dispatcher;
pub mod handlers;
pub mod metrics_log;
pub mod registry;

pub use capabilities::{Capability, CapabilitySet};
pub use db_pools::{AnyPool, DbPools};
pub use dispatcher::{cooperative::CooperativeDispatcher, sync::SyncDispatcher, CancelRegistry, DispatcherConfig, RuntimeKind};
pub use metrics_log::MetricsLogger;
pub use registry::ExportRegistry;
