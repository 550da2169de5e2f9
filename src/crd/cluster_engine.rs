//! ClusterEngine CRD
//!
//! The single top-level desired-state object. It declares which optional
//! subsystems are enabled, where their workloads are placed, and which
//! namespace they land in.

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// API group shared by the CRD and the management labels/annotations
pub const API_GROUP: &str = "multicluster.billyronks.io";

/// apiVersion of the ClusterEngine resource
pub const API_VERSION: &str = "multicluster.billyronks.io/v1";

/// Finalizer marker recorded before any owned resource is created
pub const ENGINE_FINALIZER: &str = "finalizer.multicluster.billyronks.io";

/// Annotation that turns every pass into an explicit no-op
pub const PAUSE_ANNOTATION: &str = "multicluster.billyronks.io/pause";

/// Annotation selecting the delegated (hosted) execution mode
pub const DEPLOYMENT_MODE_ANNOTATION: &str = "multicluster.billyronks.io/deployment-mode";

/// Annotation skipping the platform-version compatibility check
pub const IGNORE_PLATFORM_VERSION_ANNOTATION: &str =
    "multicluster.billyronks.io/ignore-platform-version";

/// Default namespace for subsystem workloads
pub const DEFAULT_TARGET_NAMESPACE: &str = "multicluster-engine";

// =============================================================================
// ClusterEngine CRD
// =============================================================================

/// ClusterEngine declares the desired state of the whole platform.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "multicluster.billyronks.io",
    version = "v1",
    kind = "ClusterEngine",
    plural = "clusterengines",
    shortname = "ce",
    status = "ClusterEngineStatus",
    printcolumn = r#"{"name": "Namespace", "type": "string", "jsonPath": ".spec.targetNamespace"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Version", "type": "string", "jsonPath": ".status.currentVersion"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterEngineSpec {
    /// Namespace that receives namespaced subsystem resources
    #[serde(default)]
    pub target_namespace: String,

    /// Name of the pull secret expected in the target namespace
    #[serde(default)]
    pub image_pull_secret: Option<String>,

    /// Image pull policy stamped into rendered workloads
    #[serde(default)]
    pub image_pull_policy: Option<PullPolicy>,

    /// Node selector for rendered workloads
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,

    /// Tolerations for rendered workloads; defaults apply when empty
    #[serde(default)]
    pub tolerations: Vec<Toleration>,

    /// Availability tier, drives replica counts
    #[serde(default)]
    pub availability_config: Option<AvailabilityTier>,

    /// Per-subsystem enablement
    #[serde(default)]
    pub components: Vec<ComponentToggle>,
}

// =============================================================================
// Sub-Types
// =============================================================================

/// Enable/disable entry for one subsystem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentToggle {
    pub name: String,
    pub enabled: bool,
}

impl ComponentToggle {
    pub fn new(name: impl Into<String>, enabled: bool) -> Self {
        Self {
            name: name.into(),
            enabled,
        }
    }
}

/// Image pull policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum PullPolicy {
    Always,
    #[default]
    IfNotPresent,
    Never,
}

impl std::fmt::Display for PullPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PullPolicy::Always => write!(f, "Always"),
            PullPolicy::IfNotPresent => write!(f, "IfNotPresent"),
            PullPolicy::Never => write!(f, "Never"),
        }
    }
}

/// Availability tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum AvailabilityTier {
    #[default]
    High,
    Basic,
}

impl AvailabilityTier {
    /// Replica count rendered into workloads for this tier
    pub fn replica_count(&self) -> u32 {
        match self {
            AvailabilityTier::High => 2,
            AvailabilityTier::Basic => 1,
        }
    }
}

impl std::fmt::Display for AvailabilityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AvailabilityTier::High => write!(f, "High"),
            AvailabilityTier::Basic => write!(f, "Basic"),
        }
    }
}

/// Pod toleration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Toleration {
    #[serde(default)]
    pub key: String,
    #[serde(default = "default_toleration_operator")]
    pub operator: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub effect: Option<String>,
    #[serde(default)]
    pub toleration_seconds: Option<i64>,
}

impl Toleration {
    /// Tolerations applied when the spec declares none
    pub fn defaults() -> Vec<Toleration> {
        vec![
            Toleration {
                key: "dedicated".to_string(),
                operator: "Exists".to_string(),
                value: None,
                effect: Some("NoSchedule".to_string()),
                toleration_seconds: None,
            },
            Toleration {
                key: "node-role.kubernetes.io/infra".to_string(),
                operator: "Exists".to_string(),
                value: None,
                effect: Some("NoSchedule".to_string()),
                toleration_seconds: None,
            },
        ]
    }
}

// =============================================================================
// Status
// =============================================================================

/// ClusterEngine status
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterEngineStatus {
    /// Overall phase
    #[serde(default)]
    pub phase: EnginePhase,

    /// Ordered conditions, unique by (name, kind, type)
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Version the operator last fully converged
    #[serde(default)]
    pub current_version: Option<String>,

    /// Version the operator is converging towards
    #[serde(default)]
    pub desired_version: Option<String>,
}

impl ClusterEngineStatus {
    /// Find a condition by its key
    pub fn condition(&self, name: &str, kind: &str, r#type: &str) -> Option<&Condition> {
        self.conditions
            .iter()
            .find(|c| c.name == name && c.kind == kind && c.r#type == r#type)
    }
}

/// Engine phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum EnginePhase {
    Progressing,
    Available,
    Paused,
    Uninstalling,
    #[default]
    Unknown,
}

impl std::fmt::Display for EnginePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnginePhase::Progressing => write!(f, "Progressing"),
            EnginePhase::Available => write!(f, "Available"),
            EnginePhase::Paused => write!(f, "Paused"),
            EnginePhase::Uninstalling => write!(f, "Uninstalling"),
            EnginePhase::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Verdict of one reporter at one point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Name of the reported object
    pub name: String,
    /// Kind of the reported object
    pub kind: String,
    /// Type of condition
    pub r#type: String,
    /// Status: True, False, Unknown
    pub status: ConditionStatus,
    /// Whether the reported object is considered available
    #[serde(default)]
    pub available: bool,
    /// Machine-readable reason
    #[serde(default)]
    pub reason: String,
    /// Human-readable message
    #[serde(default)]
    pub message: String,
    /// Last time the condition was evaluated
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_update_time: Option<DateTime<Utc>>,
    /// Last time the status changed
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    pub fn new(
        name: impl Into<String>,
        kind: impl Into<String>,
        r#type: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            kind: kind.into(),
            r#type: r#type.into(),
            available: status == ConditionStatus::True,
            status,
            reason: reason.into(),
            message: message.into(),
            last_update_time: Some(now),
            last_transition_time: Some(now),
        }
    }

    /// Override the availability flag
    pub fn with_available(mut self, available: bool) -> Self {
        self.available = available;
        self
    }

    /// Replacement key
    pub fn key(&self) -> ConditionKey {
        ConditionKey {
            name: self.name.clone(),
            kind: self.kind.clone(),
            r#type: self.r#type.clone(),
        }
    }

    /// Equality that ignores timestamps
    pub fn same_verdict(&self, other: &Condition) -> bool {
        self.name == other.name
            && self.kind == other.kind
            && self.r#type == other.r#type
            && self.status == other.status
            && self.available == other.available
            && self.reason == other.reason
            && self.message == other.message
    }
}

/// (name, kind, type) identity of a condition
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConditionKey {
    pub name: String,
    pub kind: String,
    pub r#type: String,
}

/// Condition status values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConditionStatus::True => write!(f, "True"),
            ConditionStatus::False => write!(f, "False"),
            ConditionStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

// =============================================================================
// Default Value Functions
// =============================================================================

fn default_toleration_operator() -> String {
    "Equal".to_string()
}

// =============================================================================
// Helper Methods
// =============================================================================

impl ClusterEngine {
    fn annotation_is(&self, key: &str, value: &str) -> bool {
        self.annotations()
            .get(key)
            .map(|v| v.eq_ignore_ascii_case(value))
            .unwrap_or(false)
    }

    /// Paused objects are never converged
    pub fn is_paused(&self) -> bool {
        self.annotation_is(PAUSE_ANNOTATION, "true")
    }

    /// Hosted mode delegates to the reduced reconcile path
    pub fn is_hosted(&self) -> bool {
        self.annotation_is(DEPLOYMENT_MODE_ANNOTATION, "hosted")
    }

    pub fn ignores_platform_version(&self) -> bool {
        self.annotation_is(IGNORE_PLATFORM_VERSION_ANNOTATION, "true")
    }

    /// Deletion has been requested
    pub fn deletion_requested_at(&self) -> Option<DateTime<Utc>> {
        self.metadata.deletion_timestamp.as_ref().map(|t| t.0)
    }

    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == ENGINE_FINALIZER)
    }

    /// Toggle value for a subsystem, if one is declared
    pub fn toggle(&self, name: &str) -> Option<bool> {
        self.spec
            .components
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.enabled)
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.toggle(name).unwrap_or(false)
    }

    /// Enable or disable a subsystem, adding a toggle if none exists
    pub fn set_toggle(&mut self, name: &str, enabled: bool) {
        match self.spec.components.iter_mut().find(|c| c.name == name) {
            Some(existing) => existing.enabled = enabled,
            None => self
                .spec
                .components
                .push(ComponentToggle::new(name, enabled)),
        }
    }

    /// Namespace for namespaced subsystem resources
    pub fn target_namespace(&self) -> &str {
        if self.spec.target_namespace.is_empty() {
            DEFAULT_TARGET_NAMESPACE
        } else {
            &self.spec.target_namespace
        }
    }

    pub fn pull_policy(&self) -> PullPolicy {
        self.spec.image_pull_policy.unwrap_or_default()
    }

    pub fn availability(&self) -> AvailabilityTier {
        self.spec.availability_config.unwrap_or_default()
    }

    /// Declared tolerations, or the defaults when none are declared
    pub fn effective_tolerations(&self) -> Vec<Toleration> {
        if self.spec.tolerations.is_empty() {
            Toleration::defaults()
        } else {
            self.spec.tolerations.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    fn engine_with_annotations(annotations: &[(&str, &str)]) -> ClusterEngine {
        let mut engine = ClusterEngine::new("engine", ClusterEngineSpec::default());
        engine.metadata = ObjectMeta {
            name: Some("engine".to_string()),
            annotations: Some(
                annotations
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        };
        engine
    }

    #[test]
    fn test_annotations() {
        let engine = engine_with_annotations(&[
            (PAUSE_ANNOTATION, "True"),
            (DEPLOYMENT_MODE_ANNOTATION, "Hosted"),
        ]);
        assert!(engine.is_paused());
        assert!(engine.is_hosted());
        assert!(!engine.ignores_platform_version());

        let engine = engine_with_annotations(&[]);
        assert!(!engine.is_paused());
        assert!(!engine.is_hosted());
    }

    #[test]
    fn test_toggles() {
        let mut engine = ClusterEngine::new("engine", ClusterEngineSpec::default());
        assert_eq!(engine.toggle("discovery"), None);
        assert!(!engine.is_enabled("discovery"));

        engine.set_toggle("discovery", true);
        assert!(engine.is_enabled("discovery"));

        engine.set_toggle("discovery", false);
        assert_eq!(engine.spec.components.len(), 1);
        assert_eq!(engine.toggle("discovery"), Some(false));
    }

    #[test]
    fn test_spec_deserialization() {
        let spec: ClusterEngineSpec = serde_json::from_value(serde_json::json!({
            "targetNamespace": "engine-ns",
            "imagePullPolicy": "Always",
            "availabilityConfig": "Basic",
            "components": [{"name": "discovery", "enabled": true}]
        }))
        .unwrap();

        assert_eq!(spec.target_namespace, "engine-ns");
        assert_eq!(spec.image_pull_policy, Some(PullPolicy::Always));
        assert_eq!(spec.availability_config.unwrap().replica_count(), 1);
        assert_eq!(spec.components[0], ComponentToggle::new("discovery", true));
    }

    #[test]
    fn test_effective_tolerations() {
        let engine = ClusterEngine::new("engine", ClusterEngineSpec::default());
        assert_eq!(engine.effective_tolerations(), Toleration::defaults());
    }

    #[test]
    fn test_target_namespace_default() {
        let mut engine = ClusterEngine::new("engine", ClusterEngineSpec::default());
        assert_eq!(engine.target_namespace(), DEFAULT_TARGET_NAMESPACE);

        engine.spec.target_namespace = "engine-ns".to_string();
        assert_eq!(engine.target_namespace(), "engine-ns");
    }

    #[test]
    fn test_condition_same_verdict_ignores_timestamps() {
        let a = Condition::new("discovery", "Component", "Available", ConditionStatus::True, "r", "m");
        let mut b = a.clone();
        b.last_update_time = None;
        assert!(a.same_verdict(&b));
        assert!(a.available);

        b.message = "other".into();
        assert!(!a.same_verdict(&b));
    }
}
