//! Service Metrics
//!
//! Prometheus collectors for the driver cache, discovery, sync dispatch and
//! coordination paths. Collectors are registered against an injected
//! [`Registry`] so tests and embedders control exposition.

use crate::error::{Error, Result};
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

/// Metric name prefix
const NAMESPACE: &str = "storage_array_manager";

/// Collectors shared by every component
#[derive(Debug, Clone)]
pub struct Metrics {
    /// Live driver sessions in the instance cache
    pub driver_instances: IntGauge,
    /// Driver sessions constructed (cached or one-shot)
    pub driver_constructions: IntCounter,
    /// Discovery attempts by outcome
    pub discoveries: IntCounterVec,
    /// Tasks handed to the dispatch channel, by task type
    pub dispatched_tasks: IntCounterVec,
    /// Post-registration or teardown steps that failed, by step
    pub best_effort_failures: IntCounterVec,
    /// Distributed lock acquisitions by outcome
    pub lock_acquisitions: IntCounterVec,
    /// Full sync attempts by outcome
    pub sync_runs: IntCounterVec,
}

impl Metrics {
    /// Create the collectors and register them with `registry`
    pub fn new(registry: &Registry) -> Result<Self> {
        let metrics = Self {
            driver_instances: IntGauge::with_opts(opts(
                "driver_instances",
                "Live driver sessions held in the instance cache",
            ))
            .map_err(prom_error)?,
            driver_constructions: IntCounter::with_opts(opts(
                "driver_constructions_total",
                "Driver sessions constructed",
            ))
            .map_err(prom_error)?,
            discoveries: IntCounterVec::new(
                opts("discoveries_total", "Discovery attempts by outcome"),
                &["outcome"],
            )
            .map_err(prom_error)?,
            dispatched_tasks: IntCounterVec::new(
                opts("dispatched_tasks_total", "Tasks sent to the dispatch channel"),
                &["task"],
            )
            .map_err(prom_error)?,
            best_effort_failures: IntCounterVec::new(
                opts(
                    "best_effort_failures_total",
                    "Isolated post-registration and teardown step failures",
                ),
                &["step"],
            )
            .map_err(prom_error)?,
            lock_acquisitions: IntCounterVec::new(
                opts("lock_acquisitions_total", "Distributed lock acquisitions"),
                &["outcome"],
            )
            .map_err(prom_error)?,
            sync_runs: IntCounterVec::new(
                opts("sync_runs_total", "Full sync attempts by outcome"),
                &["outcome"],
            )
            .map_err(prom_error)?,
        };

        registry
            .register(Box::new(metrics.driver_instances.clone()))
            .map_err(prom_error)?;
        registry
            .register(Box::new(metrics.driver_constructions.clone()))
            .map_err(prom_error)?;
        registry
            .register(Box::new(metrics.discoveries.clone()))
            .map_err(prom_error)?;
        registry
            .register(Box::new(metrics.dispatched_tasks.clone()))
            .map_err(prom_error)?;
        registry
            .register(Box::new(metrics.best_effort_failures.clone()))
            .map_err(prom_error)?;
        registry
            .register(Box::new(metrics.lock_acquisitions.clone()))
            .map_err(prom_error)?;
        registry
            .register(Box::new(metrics.sync_runs.clone()))
            .map_err(prom_error)?;

        Ok(metrics)
    }

    /// Record a failed best-effort step
    #[inline]
    pub fn record_step_failure(&self, step: &str) {
        self.best_effort_failures.with_label_values(&[step]).inc();
    }

    /// Record one dispatched task
    #[inline]
    pub fn record_dispatch(&self, task: &str) {
        self.dispatched_tasks.with_label_values(&[task]).inc();
    }
}

fn opts(name: &str, help: &str) -> Opts {
    Opts::new(name, help).namespace(NAMESPACE)
}

fn prom_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics registration failed: {}", e))
}

/// Collectors on a private registry, for tests
#[cfg(test)]
pub(crate) fn test_metrics() -> std::sync::Arc<Metrics> {
    std::sync::Arc::new(Metrics::new(&Registry::new()).unwrap())
}
