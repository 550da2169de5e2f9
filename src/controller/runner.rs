//! Kube runtime wiring
//!
//! Adapts [`reconcile_pass`] to the kube-runtime controller: the pass runs
//! under the context's deadline, outcomes are counted, and errors are mapped
//! to requeue actions by [`error_policy`].

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind};
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Client, ResourceExt};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use super::context::Context;
use super::reconciler::reconcile_pass;
use super::Requeue;
use crate::crd::ClusterEngine;
use crate::error::{Error, ErrorAction, Result};
use crate::metrics::PassOutcome;
use crate::render::NAME_LABEL;

/// Watches are closed by the server before the client read timeout
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Controller entry point for one ClusterEngine
pub async fn reconcile(engine: Arc<ClusterEngine>, ctx: Arc<Context>) -> Result<Action> {
    let name = engine.name_any();
    let started = Instant::now();

    let result = match tokio::time::timeout(ctx.deadline, reconcile_pass(&name, &ctx)).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(ctx.deadline)),
    };

    let outcome = match &result {
        Ok(Requeue::None) => PassOutcome::Success,
        Ok(_) => PassOutcome::Requeued,
        Err(_) => PassOutcome::Failed,
    };
    ctx.metrics.record_pass(outcome, started.elapsed());

    let requeue = result?;
    ctx.reset_backoff(&name);
    Ok(requeue.into_action())
}

/// Map a failed pass to its requeue action
pub fn error_policy(engine: Arc<ClusterEngine>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = engine.name_any();
    match error.action() {
        ErrorAction::NoRequeue => {
            warn!("Reconcile of {} failed, waiting for a change: {}", name, error);
            Action::await_change()
        }
        ErrorAction::RequeueAfter(delay) => {
            warn!("Reconcile of {} failed, retrying in {:?}: {}", name, delay, error);
            Action::requeue(delay)
        }
        ErrorAction::RequeueWithBackoff => {
            let delay = ctx.next_backoff(&name);
            error!("Reconcile of {} failed, backing off {:?}: {}", name, delay, error);
            Action::requeue(delay)
        }
    }
}

/// ClusterManager objects carry the management label of their engine
fn cluster_manager_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("operator.open-cluster-management.io", "v1", "ClusterManager"),
        "clustermanagers",
    )
}

/// Map a labelled child object back to its ClusterEngine
fn owning_engine<K: ResourceExt>(obj: &K) -> Option<ObjectRef<ClusterEngine>> {
    obj.labels()
        .get(NAME_LABEL)
        .map(|name| ObjectRef::new(name))
}

/// Run the controller until a shutdown signal arrives
pub async fn run(client: Client, ctx: Arc<Context>) {
    let engines: Api<ClusterEngine> = Api::all(client.clone());
    let deployments: Api<Deployment> = Api::all(client.clone());
    let cm_resource = cluster_manager_resource();
    let cluster_managers: Api<DynamicObject> = Api::all_with(client, &cm_resource);

    let labelled = WatcherConfig::default()
        .labels(NAME_LABEL)
        .timeout(WATCH_TIMEOUT_SECS);

    info!("Starting ClusterEngine controller");

    Controller::new(engines, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
        .watches(deployments, labelled.clone(), |deployment| {
            owning_engine(&deployment)
        })
        .watches_with(cluster_managers, cm_resource, labelled, |cluster_manager| {
            owning_engine(&cluster_manager)
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => debug!("Reconciled {}: {:?}", obj.name, action),
                Err(e) => debug!("Reconcile dispatch error: {}", e),
            }
        })
        .await;

    info!("ClusterEngine controller stopped");
}
