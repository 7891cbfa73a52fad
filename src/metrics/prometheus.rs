//! Prometheus metrics registration and export.
//!
//! Metrics live in process-wide `OnceLock` statics. Until [`init_metrics`]
//! runs they are absent and every recording call is a no-op.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::sync::{Mutex, OnceLock, PoisonError};

/// Global Prometheus registry for all pool metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Workers currently alive across the pool.
pub static ALIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Worker relaunch attempts, labeled by outcome (`success`, `failure`, `exhausted`).
pub static RESPAWNS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Workers found dead on release.
pub static WORKER_DEATHS_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Splits dispatched, labeled by dispatch mode.
pub static DISPATCH_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Time spent waiting for an idle worker.
pub static ACQUIRE_WAIT: OnceLock<Histogram> = OnceLock::new();

static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Initialize all metrics and register them with the registry.
///
/// Idempotent: later calls keep the first set of metrics.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let _guard = INIT_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let alive_workers = Gauge::new("nmt_pool_alive_workers", "Decoder workers currently alive")?;

    let respawns_total = CounterVec::new(
        Opts::new("nmt_pool_respawns_total", "Worker relaunch attempts"),
        &["outcome"],
    )?;

    let worker_deaths_total = Counter::new(
        "nmt_pool_worker_deaths_total",
        "Decoder workers found dead on release",
    )?;

    let dispatch_total = CounterVec::new(
        Opts::new("nmt_pool_dispatch_total", "Translation splits dispatched"),
        &["mode"],
    )?;

    let acquire_wait = Histogram::with_opts(
        HistogramOpts::new(
            "nmt_pool_acquire_wait_seconds",
            "Time spent waiting for an idle decoder worker",
        )
        .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
    )?;

    registry.register(Box::new(alive_workers.clone()))?;
    registry.register(Box::new(respawns_total.clone()))?;
    registry.register(Box::new(worker_deaths_total.clone()))?;
    registry.register(Box::new(dispatch_total.clone()))?;
    registry.register(Box::new(acquire_wait.clone()))?;

    let _ = ALIVE_WORKERS.set(alive_workers);
    let _ = RESPAWNS_TOTAL.set(respawns_total);
    let _ = WORKER_DEATHS_TOTAL.set(worker_deaths_total);
    let _ = DISPATCH_TOTAL.set(dispatch_total);
    let _ = ACQUIRE_WAIT.set(acquire_wait);
    let _ = REGISTRY.set(registry);

    tracing::debug!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        let result = init_metrics();
        assert!(result.is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        if let Some(deaths) = WORKER_DEATHS_TOTAL.get() {
            deaths.inc();
        }

        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        assert!(metrics.contains("nmt_pool_worker_deaths_total"));
    }
}
