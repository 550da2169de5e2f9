//! Reconcile metrics
//!
//! Counters and histograms for reconcile passes. Exposed by the binary's
//! `/metrics` endpoint through the registry they are registered in.

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use std::time::Duration;

use crate::error::{Error, Result};

/// How a pass ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    Success,
    Requeued,
    Failed,
}

impl PassOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PassOutcome::Success => "success",
            PassOutcome::Requeued => "requeued",
            PassOutcome::Failed => "failed",
        }
    }
}

#[derive(Clone)]
pub struct Metrics {
    passes: IntCounterVec,
    subsystem_failures: IntCounterVec,
    duration: HistogramVec,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Metrics {
    /// Metrics not attached to any registry
    pub fn unregistered() -> Result<Self> {
        let passes = IntCounterVec::new(
            Opts::new(
                "cluster_engine_reconcile_total",
                "Reconcile passes by outcome",
            ),
            &["outcome"],
        )
        .map_err(metrics_error)?;

        let subsystem_failures = IntCounterVec::new(
            Opts::new(
                "cluster_engine_subsystem_failures_total",
                "Subsystem convergence failures",
            ),
            &["subsystem"],
        )
        .map_err(metrics_error)?;

        let duration = HistogramVec::new(
            HistogramOpts::new(
                "cluster_engine_reconcile_duration_seconds",
                "Duration of reconcile passes",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
            &["outcome"],
        )
        .map_err(metrics_error)?;

        Ok(Self {
            passes,
            subsystem_failures,
            duration,
        })
    }

    /// Metrics registered in `registry`
    pub fn register(registry: &Registry) -> Result<Self> {
        let metrics = Self::unregistered()?;
        registry
            .register(Box::new(metrics.passes.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(metrics.subsystem_failures.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(metrics.duration.clone()))
            .map_err(metrics_error)?;
        Ok(metrics)
    }

    pub fn record_pass(&self, outcome: PassOutcome, elapsed: Duration) {
        self.passes.with_label_values(&[outcome.as_str()]).inc();
        self.duration
            .with_label_values(&[outcome.as_str()])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_subsystem_failure(&self, subsystem: &str) {
        self.subsystem_failures.with_label_values(&[subsystem]).inc();
    }

    pub fn passes(&self, outcome: PassOutcome) -> u64 {
        self.passes.with_label_values(&[outcome.as_str()]).get()
    }

    pub fn subsystem_failures(&self, subsystem: &str) -> u64 {
        self.subsystem_failures.with_label_values(&[subsystem]).get()
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}
