//! One reconcile pass
//!
//! A pass reads the ClusterEngine, walks the phases below in order, and
//! persists the resulting status once at the end. Any phase may stop the
//! pass early with a requeue directive.
//!
//! 1. fetch the object; gone means done
//! 2. start a fresh status tracker
//! 3. evaluate and publish upgrade eligibility
//! 4. hand hosted objects to the reduced path
//! 5. finalize objects being deleted
//! 6. record the finalizer before anything else is created
//! 7. apply defaults
//! 8. check platform compatibility
//! 9. create the target namespace
//! 10. check the pull secret
//! 11. resolve images
//! 12. stop on pause
//! 13. converge always-on subsystems, skipping those whose API is not served
//! 14. converge enabled subsystems, concurrently
//! 15. ensure the CA trust bundle
//! 16. remove disabled subsystems, concurrently
//! 17. requeue right away while an upgrade is in flight
//! 18. report success
//!
//! A pass that leaves the engine short of Available is retried after the
//! requeue period, whatever directive it ended with.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use kube::api::DynamicObject;
use kube::Resource;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info, instrument, warn};

use super::context::Context;
use super::{Requeue, FINALIZER_RETRY};
use crate::config::EnvironmentConfig;
use crate::converge::TeardownProgress;
use crate::crd::{ClusterEngine, EnginePhase, ENGINE_FINALIZER};
use crate::domain::{ResourceRef, UpgradeSignal};
use crate::error::{Error, Result};
use crate::render::{Values, MANAGED_BY_LABEL, MANAGED_BY_VALUE, NAME_LABEL};
use crate::status::tracker::{
    all_deployed, deploy_failed, paused_condition, precondition_failed, subsystem_failed,
    upgrade_blocked,
};
use crate::status::{compose, PassState, StatusTracker};
use crate::toggle::{decide, Decision, Outcome, Subsystem};
use crate::version::{platform_supported, same_minor, MIN_PLATFORM_VERSION};

/// Label asking the platform to inject its CA bundle into a ConfigMap
pub const INJECT_CA_BUNDLE_LABEL: &str = "config.openshift.io/inject-trusted-cabundle";

/// Key under which trust bundle failures are reported
const TRUST_BUNDLE: &str = "trusted-ca-bundle";

const NO_IMAGES_MESSAGE: &str = "No image references defined in deployment";

/// Run one pass for the named ClusterEngine
#[instrument(skip(ctx))]
pub async fn reconcile_pass(name: &str, ctx: &Context) -> Result<Requeue> {
    let engine = match ctx.store.get_engine(name).await {
        Ok(Some(engine)) => engine,
        Ok(None) => {
            debug!("ClusterEngine {} no longer exists", name);
            return Ok(Requeue::None);
        }
        Err(e) if e.is_not_found() => return Ok(Requeue::None),
        Err(e) => {
            warn!("Failed to fetch ClusterEngine {}: {}", name, e);
            return Ok(Requeue::After(ctx.requeue_period));
        }
    };

    let mut pass = Pass::new(ctx, engine);
    pass.check_upgrade().await;

    if pass.engine.is_hosted() {
        return pass.run_hosted().await;
    }
    pass.run().await
}

struct Pass<'a> {
    ctx: &'a Context,
    name: String,
    engine: ClusterEngine,
    env: EnvironmentConfig,
    tracker: StatusTracker,
    upgrade_blocked: bool,
}

impl<'a> Pass<'a> {
    fn new(ctx: &'a Context, engine: ClusterEngine) -> Self {
        Self {
            ctx,
            name: engine.metadata.name.clone().unwrap_or_default(),
            env: ctx.environment.load(),
            engine,
            tracker: StatusTracker::new(),
            upgrade_blocked: false,
        }
    }

    async fn run(&mut self) -> Result<Requeue> {
        if let Some(requested_at) = self.engine.deletion_requested_at() {
            return self.run_deletion(requested_at).await;
        }

        if let Some(requeue) = self.ensure_finalizer().await? {
            return Ok(requeue);
        }
        if let Some(requeue) = self.apply_defaults().await? {
            return Ok(requeue);
        }

        if !self.engine.ignores_platform_version() {
            match platform_supported(&self.env.platform_version) {
                Ok(true) => {}
                Ok(false) => {
                    let message = format!(
                        "Platform version {} is below the minimum supported version {}",
                        self.env.platform_version, MIN_PLATFORM_VERSION
                    );
                    return self.abort_precondition(message).await;
                }
                Err(e) => {
                    let message = format!("Unable to validate platform version: {}", e);
                    return self.abort_precondition(message).await;
                }
            }
        }

        if let Some(requeue) = self.ensure_namespace().await? {
            return Ok(requeue);
        }
        if let Some(requeue) = self.check_pull_secret().await? {
            return Ok(requeue);
        }

        let values = match self.resolve_values() {
            Ok(values) => values,
            Err(Error::Precondition(message)) => return self.abort_precondition(message).await,
            Err(e) => return Err(e),
        };

        if self.engine.is_paused() {
            info!("ClusterEngine {} is paused", self.name);
            self.tracker.add_condition(paused_condition(&self.name));
            return self.finish(PassState::Paused, Requeue::None).await;
        }

        let ctx = self.ctx;
        let mut awaiting_api = false;
        for subsystem in ctx.table.always_on() {
            if !self.api_served(subsystem).await? {
                awaiting_api = true;
                continue;
            }
            let outcome = ctx.driver.ensure_present(subsystem, &self.engine, &values).await;
            if let Some(reporter) = outcome.reporter {
                self.tracker.add_reporter(reporter);
            }
            if let Err(e) = outcome.result {
                ctx.metrics.record_subsystem_failure(subsystem.name);
                self.tracker
                    .add_condition(subsystem_failed(subsystem.name, e.to_string()));
                self.tracker
                    .add_condition(deploy_failed(&self.name, e.to_string()));
                return self.fail(e).await;
            }
        }

        let decisions: Vec<(&Subsystem, Decision)> = ctx
            .table
            .toggleable()
            .map(|subsystem| (subsystem, decide(subsystem, &self.engine)))
            .collect();
        let (enabled, disabled): (Vec<_>, Vec<_>) = decisions
            .into_iter()
            .partition(|(_, decision)| decision.is_enabled());

        let mut failures = BTreeMap::new();

        let outcomes = self.drive(&enabled, &values).await;
        self.collect(outcomes, &mut failures);

        if let Err(e) = self.ensure_trust_bundle().await {
            warn!("Failed to ensure trust bundle: {}", e);
            failures.insert(TRUST_BUNDLE, e);
        }

        let outcomes = self.drive(&disabled, &values).await;
        self.collect(outcomes, &mut failures);

        if !failures.is_empty() {
            return self.report_failures(failures).await;
        }

        let requeue = if self.upgrade_blocked {
            Requeue::Immediate
        } else if awaiting_api {
            Requeue::After(ctx.requeue_period)
        } else {
            Requeue::None
        };

        self.tracker.add_condition(all_deployed(&self.name));
        self.finish(PassState::Running, requeue).await
    }

    /// Hosted mode: no hub teardown and only hosted-capable subsystems
    async fn run_hosted(&mut self) -> Result<Requeue> {
        if self.engine.deletion_requested_at().is_some() {
            if self.engine.has_finalizer() {
                return self.remove_finalizer().await;
            }
            return Ok(Requeue::None);
        }

        if let Some(requeue) = self.ensure_finalizer().await? {
            return Ok(requeue);
        }
        if let Some(requeue) = self.apply_defaults().await? {
            return Ok(requeue);
        }

        let values = match self.resolve_values() {
            Ok(values) => values,
            Err(Error::Precondition(message)) => return self.abort_precondition(message).await,
            Err(e) => return Err(e),
        };

        if let Some(requeue) = self.ensure_namespace().await? {
            return Ok(requeue);
        }

        if self.engine.is_paused() {
            self.tracker.add_condition(paused_condition(&self.name));
            return self.finish(PassState::Paused, Requeue::None).await;
        }

        let ctx = self.ctx;
        let decisions: Vec<(&Subsystem, Decision)> = ctx
            .table
            .hosted()
            .map(|subsystem| (subsystem, decide(subsystem, &self.engine)))
            .collect();

        let mut failures = BTreeMap::new();
        let outcomes = self.drive(&decisions, &values).await;
        self.collect(outcomes, &mut failures);

        if !failures.is_empty() {
            return self.report_failures(failures).await;
        }

        self.tracker.add_condition(all_deployed(&self.name));
        self.finish(PassState::Running, Requeue::None).await
    }

    // =========================================================================
    // Phases
    // =========================================================================

    async fn check_upgrade(&mut self) {
        let operator_version = self.env.operator_version.clone();
        let current = self
            .engine
            .status
            .as_ref()
            .and_then(|status| status.current_version.clone())
            .unwrap_or_default();

        let signal = if current.is_empty() {
            UpgradeSignal::upgradeable()
        } else {
            match same_minor(&current, &operator_version) {
                Ok(true) => UpgradeSignal::upgradeable(),
                Ok(false) => UpgradeSignal::blocked(format!(
                    "Upgrade from {} to {} in progress",
                    current, operator_version
                )),
                Err(e) => UpgradeSignal::blocked(e.to_string()),
            }
        };

        if !signal.upgradeable {
            self.upgrade_blocked = true;
            self.tracker
                .add_condition(upgrade_blocked(&self.name, signal.message.clone()));
        }

        if let Err(e) = self.ctx.upgrade_gate.publish(&signal).await {
            warn!("Failed to publish upgrade gate signal: {}", e);
        }
    }

    async fn run_deletion(&mut self, requested_at: DateTime<Utc>) -> Result<Requeue> {
        if !self.engine.has_finalizer() {
            return Ok(Requeue::None);
        }

        match self.finalize(requested_at).await {
            Ok(()) => {
                info!("All subsystems finalized, removing finalizer");
                self.remove_finalizer().await
            }
            Err(e) => {
                info!("Finalization incomplete: {}", e);
                self.finish(PassState::Deleting, Requeue::After(FINALIZER_RETRY))
                    .await
            }
        }
    }

    /// Walk the teardown plan once
    async fn finalize(&mut self, requested_at: DateTime<Utc>) -> Result<()> {
        let progress = self
            .ctx
            .teardown
            .run(self.ctx.store.as_ref(), requested_at, Utc::now())
            .await?;

        match progress {
            TeardownProgress::Complete => Ok(()),
            TeardownProgress::Pending { condition, .. } => {
                let message = condition.message.clone();
                self.tracker.add_condition(condition);
                Err(Error::TeardownPending(message))
            }
        }
    }

    async fn remove_finalizer(&mut self) -> Result<Requeue> {
        let mut updated = self.engine.clone();
        if let Some(finalizers) = updated.metadata.finalizers.as_mut() {
            finalizers.retain(|f| f != ENGINE_FINALIZER);
        }
        self.write_engine(updated, Requeue::None).await
    }

    async fn ensure_finalizer(&mut self) -> Result<Option<Requeue>> {
        if self.engine.has_finalizer() {
            return Ok(None);
        }

        let mut updated = self.engine.clone();
        updated
            .metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(ENGINE_FINALIZER.to_string());
        info!("Adding finalizer to ClusterEngine {}", self.name);
        self.write_engine(updated, Requeue::Immediate).await.map(Some)
    }

    async fn apply_defaults(&mut self) -> Result<Option<Requeue>> {
        let mut updated = self.engine.clone();
        if !self.ctx.table.apply_defaults(&mut updated, &self.env) {
            return Ok(None);
        }

        info!("Setting defaults on ClusterEngine {}", self.name);
        self.write_engine(updated, Requeue::Immediate).await.map(Some)
    }

    /// Persist spec and metadata; a lost race is requeued
    async fn write_engine(&mut self, updated: ClusterEngine, requeue: Requeue) -> Result<Requeue> {
        match self.ctx.store.replace_engine(&updated).await {
            Ok(stored) => {
                self.engine = stored;
                Ok(requeue)
            }
            Err(e) if e.is_conflict() => {
                info!("ClusterEngine {} was modified, requeueing", self.name);
                Ok(Requeue::After(self.ctx.requeue_period))
            }
            Err(e) if e.is_not_found() => Ok(Requeue::None),
            Err(e) => Err(e),
        }
    }

    async fn ensure_namespace(&mut self) -> Result<Option<Requeue>> {
        let namespace = self.engine.target_namespace().to_string();
        let target = ResourceRef::cluster("v1", "Namespace", &namespace);
        if self.ctx.store.get(&target).await?.is_some() {
            return Ok(None);
        }

        let obj: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {
                "name": namespace,
                "labels": {
                    NAME_LABEL: self.name,
                    MANAGED_BY_LABEL: MANAGED_BY_VALUE,
                },
            },
        }))?;

        match self.ctx.store.create(&obj).await {
            Ok(_) => info!("Created namespace {}", namespace),
            Err(Error::AlreadyExists { .. }) => {}
            Err(e) => return Err(e),
        }
        Ok(Some(Requeue::Immediate))
    }

    async fn check_pull_secret(&mut self) -> Result<Option<Requeue>> {
        let secret = match self.engine.spec.image_pull_secret.as_deref() {
            Some(secret) if !secret.is_empty() => secret.to_string(),
            _ => return Ok(None),
        };

        let namespace = self.engine.target_namespace().to_string();
        let target = ResourceRef::namespaced("v1", "Secret", &namespace, &secret);
        if self.ctx.store.get(&target).await?.is_some() {
            return Ok(None);
        }

        let message = format!(
            "Could not find imagePullSecret {} in namespace {}",
            secret, namespace
        );
        warn!("{}", message);
        self.tracker
            .add_condition(precondition_failed(&self.name, message));
        let period = self.ctx.requeue_period;
        self.finish(PassState::Running, Requeue::After(period))
            .await
            .map(Some)
    }

    fn resolve_values(&self) -> Result<Values> {
        let images = self.ctx.images.resolve()?;
        if images.is_empty() {
            return Err(Error::Precondition(NO_IMAGES_MESSAGE.to_string()));
        }
        Ok(Values::build(&self.engine, &self.env, &images))
    }

    /// Whether the API a subsystem needs is served; a subsystem with no
    /// requirement always is
    async fn api_served(&self, subsystem: &Subsystem) -> Result<bool> {
        let Some(api) = subsystem.requires_api else {
            return Ok(true);
        };
        let served = self
            .ctx
            .store
            .api_installed(api.api_version, api.kind)
            .await?;
        if !served {
            info!(
                "{} API is not installed, waiting to install {}",
                api.kind, subsystem.name
            );
        }
        Ok(served)
    }

    async fn ensure_trust_bundle(&self) -> Result<()> {
        let namespace = self.engine.target_namespace();
        let name = &self.env.trust_bundle_name;
        let target = ResourceRef::namespaced("v1", "ConfigMap", namespace, name);
        if self.ctx.store.get(&target).await?.is_some() {
            return Ok(());
        }

        let mut obj: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": name,
                "namespace": namespace,
                "labels": {
                    INJECT_CA_BUNDLE_LABEL: "true",
                    NAME_LABEL: self.name,
                    MANAGED_BY_LABEL: MANAGED_BY_VALUE,
                },
            },
        }))?;
        if let Some(owner) = self.engine.controller_owner_ref(&()) {
            obj.metadata.owner_references = Some(vec![owner]);
        }

        match self.ctx.store.create(&obj).await {
            Ok(_) => {
                info!("Created trust bundle {}", target);
                Ok(())
            }
            Err(Error::AlreadyExists { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    // =========================================================================
    // Subsystems
    // =========================================================================

    /// Run every decision concurrently; outcomes keep the input order
    async fn drive(&self, decisions: &[(&Subsystem, Decision)], values: &Values) -> Vec<Outcome> {
        let driver = &self.ctx.driver;
        let engine = &self.engine;
        join_all(
            decisions
                .iter()
                .map(|(subsystem, decision)| driver.run(subsystem, decision, engine, values)),
        )
        .await
    }

    fn collect(&mut self, outcomes: Vec<Outcome>, failures: &mut BTreeMap<&'static str, Error>) {
        for outcome in outcomes {
            if let Some(reporter) = outcome.reporter {
                self.tracker.add_reporter(reporter);
            }
            if let Err(e) = outcome.result {
                failures.insert(outcome.subsystem, e);
            }
        }
    }

    async fn report_failures(&mut self, failures: BTreeMap<&'static str, Error>) -> Result<Requeue> {
        let mut messages = Vec::with_capacity(failures.len());
        for (subsystem, error) in &failures {
            self.ctx.metrics.record_subsystem_failure(subsystem);
            self.tracker
                .add_condition(subsystem_failed(subsystem, error.to_string()));
            messages.push(error.to_string());
        }

        let message = messages.join("; ");
        self.tracker
            .add_condition(deploy_failed(&self.name, message.clone()));
        self.fail(Error::Subsystems(message)).await
    }

    // =========================================================================
    // Status
    // =========================================================================

    async fn abort_precondition(&mut self, message: String) -> Result<Requeue> {
        warn!("Precondition failed for {}: {}", self.name, message);
        self.tracker.reset();
        self.tracker
            .add_condition(precondition_failed(&self.name, message.clone()));
        self.fail(Error::Precondition(message)).await
    }

    /// Persist status, then surface the pass-terminating error
    async fn fail(&mut self, error: Error) -> Result<Requeue> {
        self.finish(PassState::Running, Requeue::None).await?;
        Err(error)
    }

    /// Evaluate reporters, compose and persist the status, and settle the
    /// requeue directive
    async fn finish(&mut self, state: PassState, requeue: Requeue) -> Result<Requeue> {
        let conditions = self.tracker.evaluate(self.ctx.store.as_ref()).await;
        let status = compose(
            conditions,
            state,
            self.engine.status.as_ref(),
            &self.env.operator_version,
        );
        let phase = status.phase;

        let mut updated = self.engine.clone();
        updated.status = Some(status);
        match self.ctx.store.replace_engine_status(&updated).await {
            Ok(stored) => self.engine = stored,
            Err(e) if e.is_conflict() => {
                info!("Status of {} was modified concurrently, requeueing", self.name);
                return Ok(Requeue::After(self.ctx.requeue_period));
            }
            Err(e) if e.is_not_found() => return Ok(Requeue::None),
            Err(e) => return Err(e),
        }
        debug!("Persisted status of {}: {}", self.name, phase);

        let settled = phase == EnginePhase::Available || state == PassState::Paused;
        Ok(match requeue {
            Requeue::None | Requeue::Immediate if !settled => {
                Requeue::After(self.ctx.requeue_period)
            }
            other => other,
        })
    }
}
