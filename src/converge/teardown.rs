//! Ordered teardown
//!
//! Some artifacts have their own controllers that clean up after them, and
//! that cleanup races with namespace deletion if it is not waited for. The
//! plan lists them in dependency order; a pass walks the list and stops at
//! the first artifact that still exists. Nothing later in the list is
//! touched until every earlier artifact has been observed absent.
//!
//! Timeouts are measured from the engine's deletion timestamp, so a
//! restarted controller keeps counting where the previous one left off.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::crd::{Condition, ConditionStatus};
use crate::domain::{ResourceRef, ResourceStore};
use crate::error::{Error, Result};

pub const WAITING_FOR_RESOURCE_REASON: &str = "WaitingForResource";
pub const RESOURCE_STUCK_REASON: &str = "ResourceStuck";
pub const TERMINATING_CONDITION: &str = "Terminating";

/// What a pass does with a present artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownAction {
    /// Request deletion, then wait for it to disappear
    Delete,
    /// Only wait; another controller removes it
    WaitOnly,
}

/// One tracked artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownStep {
    pub artifact: ResourceRef,
    pub timeout: Duration,
    pub action: TeardownAction,
}

impl TeardownStep {
    pub fn delete(artifact: ResourceRef, timeout: Duration) -> Self {
        Self {
            artifact,
            timeout,
            action: TeardownAction::Delete,
        }
    }

    pub fn wait_only(artifact: ResourceRef, timeout: Duration) -> Self {
        Self {
            artifact,
            timeout,
            action: TeardownAction::WaitOnly,
        }
    }

    fn waiting_condition(&self) -> Condition {
        Condition::new(
            &self.artifact.name,
            &self.artifact.kind,
            TERMINATING_CONDITION,
            ConditionStatus::True,
            WAITING_FOR_RESOURCE_REASON,
            format!(
                "Waiting for {} {} to terminate.",
                self.artifact.kind,
                self.artifact.qualified_name()
            ),
        )
    }

    fn stuck_condition(&self) -> Condition {
        Condition::new(
            &self.artifact.name,
            &self.artifact.kind,
            TERMINATING_CONDITION,
            ConditionStatus::False,
            RESOURCE_STUCK_REASON,
            format!(
                "{} {} still exists.",
                self.artifact.kind,
                self.artifact.qualified_name()
            ),
        )
    }
}

/// Outcome of one teardown pass
#[derive(Debug, Clone, PartialEq)]
pub enum TeardownProgress {
    /// Every tracked artifact is absent
    Complete,
    /// An artifact is still present; nothing after it was touched
    Pending {
        artifact: ResourceRef,
        condition: Condition,
    },
}

impl TeardownProgress {
    pub fn is_complete(&self) -> bool {
        matches!(self, TeardownProgress::Complete)
    }
}

/// Dependency-ordered list of artifacts to remove before the finalizer goes
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TeardownPlan {
    steps: Vec<TeardownStep>,
}

impl TeardownPlan {
    pub fn new(steps: Vec<TeardownStep>) -> Self {
        Self { steps }
    }

    pub fn steps(&self) -> &[TeardownStep] {
        &self.steps
    }

    /// Hub artifacts, hosted addon first and the global set namespace last
    pub fn hub_default() -> Self {
        const MINUTE: u64 = 60;
        Self::new(vec![
            TeardownStep::delete(
                ResourceRef::namespaced(
                    "addon.open-cluster-management.io/v1alpha1",
                    "ManagedClusterAddOn",
                    "local-cluster",
                    "hypershift-addon",
                ),
                Duration::from_secs(3 * MINUTE),
            ),
            TeardownStep::delete(
                ResourceRef::cluster(
                    "cluster.open-cluster-management.io/v1",
                    "ManagedCluster",
                    "local-cluster",
                ),
                Duration::from_secs(10 * MINUTE),
            ),
            TeardownStep::delete(
                ResourceRef::cluster(
                    "operator.open-cluster-management.io/v1",
                    "ClusterManager",
                    "cluster-manager",
                ),
                Duration::from_secs(10 * MINUTE),
            ),
            TeardownStep::wait_only(
                ResourceRef::cluster("v1", "Namespace", "open-cluster-management-hub"),
                Duration::from_secs(10 * MINUTE),
            ),
            TeardownStep::delete(
                ResourceRef::cluster("v1", "Namespace", "open-cluster-management-global-set"),
                Duration::from_secs(10 * MINUTE),
            ),
        ])
    }

    /// Walk the plan once. Read and delete errors propagate.
    pub async fn run(
        &self,
        store: &dyn ResourceStore,
        deletion_requested_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<TeardownProgress> {
        let elapsed = (now - deletion_requested_at).to_std().unwrap_or_default();

        for step in &self.steps {
            let existing = match store.get(&step.artifact).await? {
                Some(existing) => existing,
                None => {
                    debug!("Teardown: {} is absent", step.artifact);
                    continue;
                }
            };

            if step.action == TeardownAction::Delete && existing.metadata.deletion_timestamp.is_none() {
                info!("Teardown: deleting {}", step.artifact);
                match store.delete(&step.artifact).await {
                    Ok(()) | Err(Error::NotFound { .. }) => {}
                    Err(e) => return Err(e),
                }
            }

            let condition = if elapsed < step.timeout {
                step.waiting_condition()
            } else {
                warn!(
                    "Teardown: {} still present {:?} after deletion was requested",
                    step.artifact, elapsed
                );
                step.stuck_condition()
            };

            return Ok(TeardownProgress::Pending {
                artifact: step.artifact.clone(),
                condition,
            });
        }

        Ok(TeardownProgress::Complete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStore, StoreOp};
    use assert_matches::assert_matches;
    use kube::api::DynamicObject;
    use serde_json::json;

    fn object(target: &ResourceRef) -> DynamicObject {
        let mut metadata = json!({"name": target.name});
        if let Some(ns) = &target.namespace {
            metadata["namespace"] = json!(ns);
        }
        serde_json::from_value(json!({
            "apiVersion": target.api_version,
            "kind": target.kind,
            "metadata": metadata
        }))
        .unwrap()
    }

    fn plan() -> TeardownPlan {
        TeardownPlan::hub_default()
    }

    fn minutes(n: i64) -> chrono::Duration {
        chrono::Duration::minutes(n)
    }

    #[tokio::test]
    async fn test_empty_store_completes() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let progress = plan().run(&store, now, now).await.unwrap();
        assert!(progress.is_complete());
        assert!(store.journal().is_empty());
    }

    #[tokio::test]
    async fn test_waiting_before_timeout() {
        let store = InMemoryStore::new();
        let addon = plan().steps()[0].artifact.clone();
        store.insert(object(&addon)).await.unwrap();
        store.add_finalizer(&addon, "addon.open-cluster-management.io/cleanup").await.unwrap();

        let now = Utc::now();
        let progress = plan().run(&store, now - minutes(1), now).await.unwrap();

        assert_matches!(progress, TeardownProgress::Pending { artifact, condition } => {
            assert_eq!(artifact, addon);
            assert_eq!(condition.reason, WAITING_FOR_RESOURCE_REASON);
            assert_eq!(condition.status, ConditionStatus::True);
            assert_eq!(
                condition.message,
                "Waiting for ManagedClusterAddOn local-cluster/hypershift-addon to terminate."
            );
        });
        assert_eq!(store.journal(), vec![StoreOp::Deleted(addon)]);
    }

    #[tokio::test]
    async fn test_stuck_after_timeout() {
        let store = InMemoryStore::new();
        let addon = plan().steps()[0].artifact.clone();
        store.insert(object(&addon)).await.unwrap();
        store.add_finalizer(&addon, "addon.open-cluster-management.io/cleanup").await.unwrap();

        let now = Utc::now();
        let progress = plan().run(&store, now - minutes(5), now).await.unwrap();

        assert_matches!(progress, TeardownProgress::Pending { condition, .. } => {
            assert_eq!(condition.reason, RESOURCE_STUCK_REASON);
            assert!(!condition.available);
            assert_eq!(condition.message, "ManagedClusterAddOn local-cluster/hypershift-addon still exists.");
        });
    }

    #[tokio::test]
    async fn test_terminating_artifact_is_not_deleted_again() {
        let store = InMemoryStore::new();
        let addon = plan().steps()[0].artifact.clone();
        store.insert(object(&addon)).await.unwrap();
        store.add_finalizer(&addon, "cleanup").await.unwrap();

        let now = Utc::now();
        plan().run(&store, now, now).await.unwrap();
        store.clear_journal();
        plan().run(&store, now, now).await.unwrap();

        assert!(store.journal().is_empty());
    }

    #[tokio::test]
    async fn test_later_artifacts_wait_for_earlier_ones() {
        let store = InMemoryStore::new();
        let cluster = plan().steps()[1].artifact.clone();
        let manager = plan().steps()[2].artifact.clone();
        for target in [&cluster, &manager] {
            store.insert(object(target)).await.unwrap();
            store.add_finalizer(target, "cleanup").await.unwrap();
        }

        let now = Utc::now();
        let progress = plan().run(&store, now, now).await.unwrap();
        assert_matches!(progress, TeardownProgress::Pending { artifact, .. } if artifact == cluster);
        assert_eq!(store.journal(), vec![StoreOp::Deleted(cluster.clone())]);

        store.clear_finalizers(&cluster).await.unwrap();
        let progress = plan().run(&store, now, now).await.unwrap();
        assert_matches!(progress, TeardownProgress::Pending { artifact, .. } if artifact == manager);
    }

    #[tokio::test]
    async fn test_wait_only_step_never_deletes() {
        let store = InMemoryStore::new();
        let hub_ns = plan().steps()[3].artifact.clone();
        store.insert(object(&hub_ns)).await.unwrap();

        let now = Utc::now();
        let progress = plan().run(&store, now, now).await.unwrap();

        assert!(!progress.is_complete());
        assert!(store.journal().is_empty());
        assert!(store.contains(&hub_ns).await);
    }

    #[tokio::test]
    async fn test_deleted_without_finalizer_continues_next_pass() {
        let store = InMemoryStore::new();
        let global_set = plan().steps()[4].artifact.clone();
        store.insert(object(&global_set)).await.unwrap();

        let now = Utc::now();
        let first = plan().run(&store, now, now).await.unwrap();
        assert!(!first.is_complete());

        let second = plan().run(&store, now, now).await.unwrap();
        assert!(second.is_complete());
    }

    #[tokio::test]
    async fn test_read_error_propagates() {
        let store = InMemoryStore::new();
        let addon = plan().steps()[0].artifact.clone();
        store.fail_reads_of(addon, "etcdserver: request timed out");

        let now = Utc::now();
        assert_matches!(plan().run(&store, now, now).await, Err(Error::Store(_)));
    }
}
