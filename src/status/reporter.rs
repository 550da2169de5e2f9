//! Status reporters
//!
//! A reporter is a stateless description of what to look at. Evaluating it
//! performs read-only queries against the resource store and yields one
//! [`Condition`]; evaluating twice against unchanged state yields the same
//! verdict.

use futures::future::{join_all, BoxFuture, FutureExt};
use kube::api::DynamicObject;
use serde_json::Value;

use crate::crd::{Condition, ConditionStatus};
use crate::domain::{ResourceRef, ResourceStore};
use crate::error::Result;

/// Kind recorded on subsystem-level conditions
pub const COMPONENT_KIND: &str = "Component";

pub const AVAILABLE_TYPE: &str = "Available";
pub const NOT_PRESENT_TYPE: &str = "NotPresent";
pub const UNINSTALLED_TYPE: &str = "Uninstalled";
pub const UNKNOWN_TYPE: &str = "Unknown";

pub const COMPONENTS_AVAILABLE_REASON: &str = "ComponentsAvailable";
pub const REQUIREMENTS_NOT_MET_REASON: &str = "RequirementsNotMet";
pub const RESOURCE_FOUND_REASON: &str = "ResourceFound";
pub const RESOURCE_NOT_FOUND_REASON: &str = "ResourceNotFound";
pub const COMPONENT_DISABLED_REASON: &str = "ComponentDisabled";
pub const RESOURCES_PRESENT_REASON: &str = "ResourcesPresent";
pub const DEPLOYMENT_AVAILABLE_REASON: &str = "DeploymentAvailable";
pub const FAILED_DEPLOYMENT_REASON: &str = "FailedDeployment";
pub const WAITING_FOR_RESOURCE_REASON: &str = "WaitingForResource";
pub const ERROR_CHECKING_STATUS_REASON: &str = "ErrorCheckingStatus";
pub const CLUSTER_MANAGER_APPLIED_REASON: &str = "ClusterManagerApplied";
pub const MANAGED_CLUSTER_JOINED_REASON: &str = "ManagedClusterJoined";

// =============================================================================
// Reporter
// =============================================================================

/// Health reporter over live cluster state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusReporter {
    /// Available when the resource exists
    Presence(ResourceRef),
    /// Available when the Deployment exists and reports itself available
    DeploymentReady(ResourceRef),
    /// Logical AND over children, relaying their messages
    Multi {
        name: String,
        children: Vec<StatusReporter>,
    },
    /// Available when none of the resources exist
    Disabled {
        name: String,
        resources: Vec<ResourceRef>,
        /// Message used instead of the default when nothing remains
        note: Option<String>,
    },
    /// Kind-specific lifecycle checks
    Custom(CustomCheck),
}

/// Domain-specific checks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CustomCheck {
    /// ClusterManager has an `Applied=True` condition
    ClusterManagerApplied(ResourceRef),
    /// ManagedCluster has a `ManagedClusterJoined=True` condition
    ManagedClusterJoined(ResourceRef),
}

impl CustomCheck {
    fn target(&self) -> &ResourceRef {
        match self {
            CustomCheck::ClusterManagerApplied(target) | CustomCheck::ManagedClusterJoined(target) => {
                target
            }
        }
    }
}

impl StatusReporter {
    /// Reporter for a rendered object, chosen by its kind
    pub fn for_object(obj: &DynamicObject) -> Result<Self> {
        let target = ResourceRef::from_object(obj)?;
        Ok(match target.kind.as_str() {
            "Deployment" => StatusReporter::DeploymentReady(target),
            "ClusterManager" => StatusReporter::Custom(CustomCheck::ClusterManagerApplied(target)),
            "ManagedCluster" => StatusReporter::Custom(CustomCheck::ManagedClusterJoined(target)),
            _ => StatusReporter::Presence(target),
        })
    }

    /// Reporter for an enabled subsystem
    pub fn enabled(name: impl Into<String>, objects: &[DynamicObject]) -> Result<Self> {
        Ok(StatusReporter::Multi {
            name: name.into(),
            children: objects.iter().map(Self::for_object).collect::<Result<_>>()?,
        })
    }

    /// Reporter asserting a disabled subsystem left nothing behind
    pub fn disabled(name: impl Into<String>, objects: &[DynamicObject]) -> Result<Self> {
        Ok(StatusReporter::Disabled {
            name: name.into(),
            resources: objects.iter().map(ResourceRef::from_object).collect::<Result<_>>()?,
            note: None,
        })
    }

    /// Replace the default "nothing present" message of a disabled reporter
    pub fn with_note(self, message: impl Into<String>) -> Self {
        match self {
            StatusReporter::Disabled {
                name, resources, ..
            } => StatusReporter::Disabled {
                name,
                resources,
                note: Some(message.into()),
            },
            other => other,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            StatusReporter::Presence(target) | StatusReporter::DeploymentReady(target) => &target.name,
            StatusReporter::Multi { name, .. } | StatusReporter::Disabled { name, .. } => name,
            StatusReporter::Custom(check) => &check.target().name,
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            StatusReporter::Presence(target) | StatusReporter::DeploymentReady(target) => &target.kind,
            StatusReporter::Multi { .. } | StatusReporter::Disabled { .. } => COMPONENT_KIND,
            StatusReporter::Custom(check) => &check.target().kind,
        }
    }

    /// Produce this reporter's verdict
    pub fn evaluate<'a>(&'a self, store: &'a dyn ResourceStore) -> BoxFuture<'a, Condition> {
        async move {
            match self {
                StatusReporter::Presence(target) => match store.get(target).await {
                    Ok(Some(_)) => found(target),
                    Ok(None) => missing(target),
                    Err(e) => unknown(self.name(), self.kind(), &e.to_string()),
                },
                StatusReporter::DeploymentReady(target) => match store.get(target).await {
                    Ok(Some(obj)) => deployment_verdict(target, &obj),
                    Ok(None) => missing(target),
                    Err(e) => unknown(self.name(), self.kind(), &e.to_string()),
                },
                StatusReporter::Custom(check) => {
                    let target = check.target();
                    match store.get(target).await {
                        Ok(Some(obj)) => custom_verdict(check, &obj),
                        Ok(None) => missing(target),
                        Err(e) => unknown(self.name(), self.kind(), &e.to_string()),
                    }
                }
                StatusReporter::Multi { name, children } => {
                    let verdicts = join_all(children.iter().map(|c| c.evaluate(store))).await;
                    fold_multi(name, &verdicts)
                }
                StatusReporter::Disabled {
                    name,
                    resources,
                    note,
                } => {
                    let mut remaining = Vec::new();
                    for target in resources {
                        match store.get(target).await {
                            Ok(Some(_)) => remaining.push(target.to_string()),
                            Ok(None) => {}
                            Err(e) => return unknown(name, COMPONENT_KIND, &e.to_string()),
                        }
                    }
                    disabled_verdict(name, &remaining, note.as_deref())
                }
            }
        }
        .boxed()
    }
}

// =============================================================================
// Verdicts
// =============================================================================

fn found(target: &ResourceRef) -> Condition {
    Condition::new(
        &target.name,
        &target.kind,
        AVAILABLE_TYPE,
        ConditionStatus::True,
        RESOURCE_FOUND_REASON,
        "",
    )
}

fn missing(target: &ResourceRef) -> Condition {
    Condition::new(
        &target.name,
        &target.kind,
        AVAILABLE_TYPE,
        ConditionStatus::False,
        RESOURCE_NOT_FOUND_REASON,
        format!("The following resources are missing: {}", target),
    )
}

fn unknown(name: &str, kind: &str, error: &str) -> Condition {
    Condition::new(
        name,
        kind,
        UNKNOWN_TYPE,
        ConditionStatus::Unknown,
        ERROR_CHECKING_STATUS_REASON,
        format!("Error getting resource: {}", error),
    )
}

/// Multi-status never invents a diagnostic, it only relays its children's
pub fn fold_multi(name: &str, children: &[Condition]) -> Condition {
    let unavailable: Vec<String> = children
        .iter()
        .filter(|c| !c.available)
        .map(|c| format!("{}/{} is not available: {}", c.kind, c.name, c.message))
        .collect();

    if unavailable.is_empty() {
        Condition::new(
            name,
            COMPONENT_KIND,
            AVAILABLE_TYPE,
            ConditionStatus::True,
            COMPONENTS_AVAILABLE_REASON,
            "",
        )
    } else {
        Condition::new(
            name,
            COMPONENT_KIND,
            AVAILABLE_TYPE,
            ConditionStatus::False,
            REQUIREMENTS_NOT_MET_REASON,
            unavailable.join("\n"),
        )
    }
}

fn disabled_verdict(name: &str, remaining: &[String], note: Option<&str>) -> Condition {
    if remaining.is_empty() {
        Condition::new(
            name,
            COMPONENT_KIND,
            NOT_PRESENT_TYPE,
            ConditionStatus::True,
            COMPONENT_DISABLED_REASON,
            note.unwrap_or("No resources present"),
        )
    } else {
        Condition::new(
            name,
            COMPONENT_KIND,
            UNINSTALLED_TYPE,
            ConditionStatus::False,
            RESOURCES_PRESENT_REASON,
            format!("The following resources remain: {}", remaining.join(" ")),
        )
    }
}

/// `status.conditions[type == condition_type]`
fn status_condition<'a>(obj: &'a DynamicObject, condition_type: &str) -> Option<&'a Value> {
    obj.data
        .get("status")
        .and_then(|s| s.get("conditions"))
        .and_then(Value::as_array)
        .and_then(|conditions| {
            conditions
                .iter()
                .find(|c| c.get("type").and_then(Value::as_str) == Some(condition_type))
        })
}

fn condition_is_true(condition: Option<&Value>) -> bool {
    condition
        .and_then(|c| c.get("status"))
        .and_then(Value::as_str)
        == Some("True")
}

fn condition_field<'a>(condition: &'a Value, field: &str) -> &'a str {
    condition.get(field).and_then(Value::as_str).unwrap_or_default()
}

fn deployment_verdict(target: &ResourceRef, obj: &DynamicObject) -> Condition {
    let verdict = |status: ConditionStatus, reason: &str, message: String| {
        Condition::new(&target.name, &target.kind, AVAILABLE_TYPE, status, reason, message)
    };

    if let Some(progressing) = status_condition(obj, "Progressing") {
        if condition_field(progressing, "reason") == "ProgressDeadlineExceeded" {
            return verdict(
                ConditionStatus::False,
                FAILED_DEPLOYMENT_REASON,
                condition_field(progressing, "message").to_string(),
            );
        }
    }

    let replica_failure = status_condition(obj, "ReplicaFailure");
    if condition_is_true(replica_failure) {
        let message = replica_failure
            .map(|c| condition_field(c, "message").to_string())
            .unwrap_or_default();
        return verdict(ConditionStatus::False, FAILED_DEPLOYMENT_REASON, message);
    }

    if condition_is_true(status_condition(obj, "Available")) {
        return verdict(ConditionStatus::True, DEPLOYMENT_AVAILABLE_REASON, String::new());
    }

    let replica_count = |value: Option<&Value>| value.and_then(Value::as_i64).unwrap_or(0);
    let desired = replica_count(obj.data.get("spec").and_then(|s| s.get("replicas")));
    let available = replica_count(obj.data.get("status").and_then(|s| s.get("availableReplicas")));
    verdict(
        ConditionStatus::False,
        WAITING_FOR_RESOURCE_REASON,
        format!("{}/{} replicas available", available, desired),
    )
}

fn custom_verdict(check: &CustomCheck, obj: &DynamicObject) -> Condition {
    let (condition_type, reason, waiting) = match check {
        CustomCheck::ClusterManagerApplied(target) => (
            "Applied",
            CLUSTER_MANAGER_APPLIED_REASON,
            format!("Waiting for ClusterManager {} to be applied", target.name),
        ),
        CustomCheck::ManagedClusterJoined(target) => (
            "ManagedClusterJoined",
            MANAGED_CLUSTER_JOINED_REASON,
            format!("Waiting for ManagedCluster {} to join", target.name),
        ),
    };
    let target = check.target();

    if condition_is_true(status_condition(obj, condition_type)) {
        Condition::new(
            &target.name,
            &target.kind,
            AVAILABLE_TYPE,
            ConditionStatus::True,
            reason,
            "",
        )
    } else {
        Condition::new(
            &target.name,
            &target.kind,
            AVAILABLE_TYPE,
            ConditionStatus::False,
            WAITING_FOR_RESOURCE_REASON,
            waiting,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use serde_json::json;

    fn deployment(name: &str) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": name, "namespace": "engine-ns"},
            "spec": {"replicas": 2}
        }))
        .unwrap()
    }

    fn namespace(name: &str) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {"name": name}
        }))
        .unwrap()
    }

    fn target(obj: &DynamicObject) -> ResourceRef {
        ResourceRef::from_object(obj).unwrap()
    }

    #[test]
    fn test_reporter_for_kind() {
        assert_eq!(
            StatusReporter::for_object(&deployment("d")).unwrap(),
            StatusReporter::DeploymentReady(target(&deployment("d")))
        );
        assert_eq!(
            StatusReporter::for_object(&namespace("ns")).unwrap(),
            StatusReporter::Presence(target(&namespace("ns")))
        );

        let cluster: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "cluster.open-cluster-management.io/v1",
            "kind": "ManagedCluster",
            "metadata": {"name": "local-cluster"}
        }))
        .unwrap();
        assert!(matches!(
            StatusReporter::for_object(&cluster).unwrap(),
            StatusReporter::Custom(CustomCheck::ManagedClusterJoined(_))
        ));
    }

    #[tokio::test]
    async fn test_presence() {
        let store = InMemoryStore::new();
        let reporter = StatusReporter::Presence(target(&namespace("test")));

        let condition = reporter.evaluate(&store).await;
        assert!(!condition.available);
        assert_eq!(
            condition.message,
            "The following resources are missing: <Namespace test>"
        );

        store.insert(namespace("test")).await.unwrap();
        let condition = reporter.evaluate(&store).await;
        assert!(condition.available);
        assert_eq!(condition.reason, RESOURCE_FOUND_REASON);
    }

    #[tokio::test]
    async fn test_deployment_readiness() {
        let store = InMemoryStore::new();
        let deploy = deployment("discovery-operator");
        let reporter = StatusReporter::DeploymentReady(target(&deploy));

        store.insert(deploy.clone()).await.unwrap();
        let condition = reporter.evaluate(&store).await;
        assert!(!condition.available);
        assert_eq!(condition.reason, WAITING_FOR_RESOURCE_REASON);
        assert_eq!(condition.message, "0/2 replicas available");

        store
            .set_status(
                &target(&deploy),
                json!({
                    "availableReplicas": 2,
                    "conditions": [{"type": "Available", "status": "True"}]
                }),
            )
            .await
            .unwrap();
        let condition = reporter.evaluate(&store).await;
        assert!(condition.available);

        store
            .set_status(
                &target(&deploy),
                json!({"conditions": [{
                    "type": "Progressing",
                    "status": "False",
                    "reason": "ProgressDeadlineExceeded",
                    "message": "ReplicaSet has timed out progressing."
                }]}),
            )
            .await
            .unwrap();
        let condition = reporter.evaluate(&store).await;
        assert_eq!(condition.reason, FAILED_DEPLOYMENT_REASON);
        assert_eq!(condition.message, "ReplicaSet has timed out progressing.");
    }

    #[tokio::test]
    async fn test_multi_relays_unavailable_children_in_order() {
        let store = InMemoryStore::new();
        store.insert(namespace("test")).await.unwrap();

        let reporter = StatusReporter::Multi {
            name: "testComponent".into(),
            children: vec![
                StatusReporter::Presence(target(&namespace("test"))),
                StatusReporter::Presence(target(&deployment("b"))),
                StatusReporter::Presence(target(&deployment("a"))),
            ],
        };

        let condition = reporter.evaluate(&store).await;
        assert!(!condition.available);
        assert_eq!(condition.kind, COMPONENT_KIND);
        assert_eq!(condition.reason, REQUIREMENTS_NOT_MET_REASON);
        assert_eq!(
            condition.message,
            "Deployment/b is not available: The following resources are missing: <Deployment engine-ns/b>\n\
             Deployment/a is not available: The following resources are missing: <Deployment engine-ns/a>"
        );
        assert!(!condition.message.contains("Namespace"));
    }

    #[tokio::test]
    async fn test_multi_all_available() {
        let store = InMemoryStore::new();
        store.insert(namespace("test")).await.unwrap();

        let reporter = StatusReporter::Multi {
            name: "testComponent".into(),
            children: vec![StatusReporter::Presence(target(&namespace("test")))],
        };

        let condition = reporter.evaluate(&store).await;
        assert!(condition.available);
        assert!(condition.message.is_empty());
        assert_eq!(condition.reason, COMPONENTS_AVAILABLE_REASON);
    }

    #[test]
    fn test_multi_and_law() {
        let child = |name: &str, available: bool| {
            Condition::new(
                name,
                "Deployment",
                AVAILABLE_TYPE,
                if available { ConditionStatus::True } else { ConditionStatus::False },
                "r",
                format!("{} message", name),
            )
        };

        let cases: Vec<Vec<bool>> = vec![
            vec![],
            vec![true],
            vec![false],
            vec![true, true, false],
            vec![false, true, false],
            vec![true, true, true],
        ];
        for case in cases {
            let children: Vec<Condition> = case
                .iter()
                .enumerate()
                .map(|(i, available)| child(&format!("child-{}", i), *available))
                .collect();
            let folded = fold_multi("component", &children);

            assert_eq!(folded.available, case.iter().all(|a| *a));
            for c in &children {
                assert_eq!(folded.message.contains(&c.name), !c.available);
            }
        }
    }

    #[tokio::test]
    async fn test_disabled() {
        let store = InMemoryStore::new();
        let objects = vec![deployment("discovery-operator"), namespace("test")];
        let reporter = StatusReporter::disabled("discovery", &objects).unwrap();

        let condition = reporter.evaluate(&store).await;
        assert!(condition.available);
        assert_eq!(condition.r#type, NOT_PRESENT_TYPE);
        assert_eq!(condition.message, "No resources present");

        for obj in &objects {
            store.insert(obj.clone()).await.unwrap();
        }
        let condition = reporter.evaluate(&store).await;
        assert!(!condition.available);
        assert_eq!(condition.reason, RESOURCES_PRESENT_REASON);
        assert_eq!(
            condition.message,
            "The following resources remain: <Deployment engine-ns/discovery-operator> <Namespace test>"
        );
    }

    #[tokio::test]
    async fn test_disabled_note() {
        let store = InMemoryStore::new();
        let reporter = StatusReporter::disabled("hypershift-local-hosting", &[])
            .unwrap()
            .with_note("Local hosting only available when hypershift is enabled");

        let condition = reporter.evaluate(&store).await;
        assert!(condition.available);
        assert_eq!(
            condition.message,
            "Local hosting only available when hypershift is enabled"
        );
    }

    #[tokio::test]
    async fn test_read_error_is_unknown() {
        let store = InMemoryStore::new();
        let deploy = deployment("discovery-operator");
        store.fail_reads_of(target(&deploy), "connection refused");

        let condition = StatusReporter::Presence(target(&deploy)).evaluate(&store).await;
        assert_eq!(condition.status, ConditionStatus::Unknown);
        assert_eq!(condition.reason, ERROR_CHECKING_STATUS_REASON);
        assert!(!condition.available);

        let condition = StatusReporter::disabled("discovery", &[deploy])
            .unwrap()
            .evaluate(&store)
            .await;
        assert_eq!(condition.status, ConditionStatus::Unknown);
        assert_eq!(condition.name, "discovery");
    }

    #[tokio::test]
    async fn test_custom_checks() {
        let store = InMemoryStore::new();
        let manager: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "operator.open-cluster-management.io/v1",
            "kind": "ClusterManager",
            "metadata": {"name": "cluster-manager"}
        }))
        .unwrap();
        store.insert(manager.clone()).await.unwrap();
        let reporter = StatusReporter::for_object(&manager).unwrap();

        let condition = reporter.evaluate(&store).await;
        assert!(!condition.available);
        assert_eq!(condition.message, "Waiting for ClusterManager cluster-manager to be applied");

        store
            .set_status(
                &target(&manager),
                json!({"conditions": [{"type": "Applied", "status": "True"}]}),
            )
            .await
            .unwrap();
        let condition = reporter.evaluate(&store).await;
        assert!(condition.available);
        assert_eq!(condition.reason, CLUSTER_MANAGER_APPLIED_REASON);
    }

    #[tokio::test]
    async fn test_evaluation_is_idempotent() {
        let store = InMemoryStore::new();
        store.insert(deployment("a")).await.unwrap();
        let reporter = StatusReporter::enabled("component", &[deployment("a"), deployment("b")]).unwrap();

        let first = reporter.evaluate(&store).await;
        let second = reporter.evaluate(&store).await;
        assert!(first.same_verdict(&second));
    }
}
