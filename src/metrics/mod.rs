//! Prometheus metrics for the decoder pool.
//!
//! ```ignore
//! use nmt_pool::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! MetricsCollector::new().record_worker_death();
//! let text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{DispatchMode, MetricsCollector, RespawnOutcome};
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACQUIRE_WAIT, ALIVE_WORKERS, DISPATCH_TOTAL, REGISTRY, RESPAWNS_TOTAL, WORKER_DEATHS_TOTAL,
};
