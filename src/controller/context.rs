//! Reconcile context
//!
//! Everything a pass needs besides the object itself. Built once at startup
//! and shared by every pass through an `Arc`.

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use super::upgrade::LoggingUpgradeGate;
use super::{DEFAULT_DEADLINE, REQUEUE_PERIOD};
use crate::config::{EnvImageResolver, ProcessEnvironment};
use crate::converge::{Converger, TeardownPlan};
use crate::domain::{EnvironmentSourceRef, ImageResolverRef, ResourceStoreRef, UpgradeGateRef};
use crate::error::Result;
use crate::metrics::Metrics;
use crate::render::{BundleSource, TemplateRenderer};
use crate::toggle::{SubsystemDriver, SubsystemTable};

/// Shared state for reconcile passes
pub struct Context {
    pub store: ResourceStoreRef,
    pub images: ImageResolverRef,
    pub environment: EnvironmentSourceRef,
    pub upgrade_gate: UpgradeGateRef,
    pub table: SubsystemTable,
    pub teardown: TeardownPlan,
    pub driver: SubsystemDriver,
    pub metrics: Metrics,
    /// Upper bound on one pass
    pub deadline: Duration,
    /// Delay used for fixed-cadence requeues
    pub requeue_period: Duration,
    backoffs: Mutex<BTreeMap<String, ExponentialBackoff>>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("table", &self.table)
            .field("teardown", &self.teardown)
            .field("deadline", &self.deadline)
            .field("requeue_period", &self.requeue_period)
            .finish_non_exhaustive()
    }
}

impl Context {
    pub fn builder(store: ResourceStoreRef) -> ContextBuilder {
        ContextBuilder::new(store)
    }

    pub fn converger(&self) -> &Converger {
        self.driver.converger()
    }

    /// Next delay for an object whose passes keep failing transiently
    pub fn next_backoff(&self, name: &str) -> Duration {
        let mut backoffs = self.backoffs.lock();
        backoffs
            .entry(name.to_string())
            .or_insert_with(transient_backoff)
            .next_backoff()
            .unwrap_or(MAX_BACKOFF)
    }

    /// Forget the failure streak after a clean pass
    pub fn reset_backoff(&self, name: &str) {
        self.backoffs.lock().remove(name);
    }
}

const MAX_BACKOFF: Duration = Duration::from_secs(300);

fn transient_backoff() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_secs(1))
        .with_max_interval(MAX_BACKOFF)
        .with_max_elapsed_time(None)
        .build()
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    store: ResourceStoreRef,
    images: Option<ImageResolverRef>,
    environment: Option<EnvironmentSourceRef>,
    upgrade_gate: Option<UpgradeGateRef>,
    table: SubsystemTable,
    teardown: TeardownPlan,
    bundles: BundleSource,
    metrics: Option<Metrics>,
    field_manager: Option<String>,
    deadline: Duration,
    requeue_period: Duration,
}

impl ContextBuilder {
    fn new(store: ResourceStoreRef) -> Self {
        Self {
            store,
            images: None,
            environment: None,
            upgrade_gate: None,
            table: SubsystemTable::hub(),
            teardown: TeardownPlan::hub_default(),
            bundles: BundleSource::Embedded,
            metrics: None,
            field_manager: None,
            deadline: DEFAULT_DEADLINE,
            requeue_period: REQUEUE_PERIOD,
        }
    }

    pub fn images(mut self, images: ImageResolverRef) -> Self {
        self.images = Some(images);
        self
    }

    pub fn environment(mut self, environment: EnvironmentSourceRef) -> Self {
        self.environment = Some(environment);
        self
    }

    pub fn upgrade_gate(mut self, gate: UpgradeGateRef) -> Self {
        self.upgrade_gate = Some(gate);
        self
    }

    pub fn table(mut self, table: SubsystemTable) -> Self {
        self.table = table;
        self
    }

    pub fn teardown(mut self, plan: TeardownPlan) -> Self {
        self.teardown = plan;
        self
    }

    /// Load bundles from somewhere other than the embedded set
    pub fn bundles(mut self, bundles: BundleSource) -> Self {
        self.bundles = bundles;
        self
    }

    pub fn metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn field_manager(mut self, field_manager: impl Into<String>) -> Self {
        self.field_manager = Some(field_manager.into());
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn requeue_period(mut self, period: Duration) -> Self {
        self.requeue_period = period;
        self
    }

    pub fn build(self) -> Result<Context> {
        let mut converger = Converger::new(self.store.clone());
        if let Some(field_manager) = self.field_manager {
            converger = converger.with_field_manager(field_manager);
        }
        let driver = SubsystemDriver::new(
            Arc::new(TemplateRenderer::new()?),
            converger,
            self.bundles,
        );
        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => Metrics::unregistered()?,
        };

        Ok(Context {
            store: self.store,
            images: self
                .images
                .unwrap_or_else(|| Arc::new(EnvImageResolver::default())),
            environment: self
                .environment
                .unwrap_or_else(|| Arc::new(ProcessEnvironment::default())),
            upgrade_gate: self
                .upgrade_gate
                .unwrap_or_else(|| Arc::new(LoggingUpgradeGate)),
            table: self.table,
            teardown: self.teardown,
            driver,
            metrics,
            deadline: self.deadline,
            requeue_period: self.requeue_period,
            backoffs: Mutex::new(BTreeMap::new()),
        })
    }
}
