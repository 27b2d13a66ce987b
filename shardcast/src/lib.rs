// Shardcast dispatcher
//
// Fans a job out to a fixed set of work units split across worker threads,
// fans the per-unit results back in by job id, and keeps going when a unit
// fails, panics or a worker is lost. Units reach shared state through
// proxies that degrade to local copies when the state server is gone.

pub mod logging;
pub mod pool;
pub mod shared;

// Re-export commonly used types
pub use pool::{
    Dispatcher, DispatcherBuilder, DispatcherConfig, DispatcherMetrics, DispatcherState,
    ManagerKind, ManagerSet, partition,
};
pub use shared::{ProxyConfig, SharedStateProxy};
pub use shardcast_api::*;
pub use shardcast_api_derive::*; // Re-export the WorkUnit derive
