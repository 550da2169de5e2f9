//! Shared fixtures for the integration suites

#![allow(dead_code)]

use cluster_engine_operator::config::{EnvironmentConfig, StaticEnvironment, StaticImageResolver};
use cluster_engine_operator::controller::{Context, RecordingUpgradeGate};
use cluster_engine_operator::crd::{ClusterEngine, ClusterEngineSpec, ComponentToggle, ENGINE_FINALIZER};
use cluster_engine_operator::domain::{ResourceRef, ResourceStore};
use cluster_engine_operator::store::InMemoryStore;
use cluster_engine_operator::toggle::SubsystemTable;
use kube::api::DynamicObject;
use kube::ResourceExt;
use serde_json::json;
use std::sync::Arc;

pub const ENGINE: &str = "engine";
pub const OPERATOR_VERSION: &str = "2.5.0";
pub const PLATFORM_VERSION: &str = "4.14.3";

/// Every image the embedded bundles reference
pub const IMAGES: &[(&str, &str)] = &[
    ("assisted-service-operator", "quay.io/stolostron/assisted-service-operator:2.5.0"),
    ("cluster-curator-controller", "quay.io/stolostron/cluster-curator-controller:2.5.0"),
    ("cluster-proxy", "quay.io/stolostron/cluster-proxy:2.5.0"),
    ("cluster-proxy-addon", "quay.io/stolostron/cluster-proxy-addon:2.5.0"),
    ("console-mce", "quay.io/stolostron/console-mce:2.5.0"),
    ("discovery-operator", "quay.io/stolostron/discovery-operator:2.5.0"),
    ("hypershift-addon-operator", "quay.io/stolostron/hypershift-addon-operator:2.5.0"),
    ("managed-serviceaccount", "quay.io/stolostron/managed-serviceaccount:2.5.0"),
    ("multicloud-manager", "quay.io/stolostron/multicloud-manager:2.5.0"),
    ("openshift-hive", "quay.io/stolostron/openshift-hive:2.5.0"),
    ("placement", "quay.io/stolostron/placement:2.5.0"),
    ("registration", "quay.io/stolostron/registration:2.5.0"),
    ("registration-operator", "quay.io/stolostron/registration-operator:2.5.0"),
    ("work", "quay.io/stolostron/work:2.5.0"),
];

pub fn environment() -> EnvironmentConfig {
    EnvironmentConfig {
        platform_version: PLATFORM_VERSION.to_string(),
        operator_version: OPERATOR_VERSION.to_string(),
        ingress_domain: "apps.hub.example.com".to_string(),
        ..Default::default()
    }
}

pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub gate: Arc<RecordingUpgradeGate>,
    pub ctx: Context,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_images(IMAGES)
    }

    pub fn with_images(images: &[(&str, &str)]) -> Self {
        let store = Arc::new(InMemoryStore::new());
        Self::on_store(store, images)
    }

    /// A fresh context over an existing store, as after a process restart
    pub fn on_store(store: Arc<InMemoryStore>, images: &[(&str, &str)]) -> Self {
        let gate = Arc::new(RecordingUpgradeGate::new());
        let ctx = Context::builder(store.clone())
            .images(Arc::new(StaticImageResolver::from_pairs(images.iter().copied())))
            .environment(Arc::new(StaticEnvironment(environment())))
            .upgrade_gate(gate.clone())
            .build()
            .unwrap();
        Self { store, gate, ctx }
    }

    pub async fn engine(&self) -> Option<ClusterEngine> {
        self.store.get_engine(ENGINE).await.unwrap()
    }

    pub async fn contains(&self, api_version: &str, kind: &str, namespace: Option<&str>, name: &str) -> bool {
        let target = match namespace {
            Some(ns) => ResourceRef::namespaced(api_version, kind, ns, name),
            None => ResourceRef::cluster(api_version, kind, name),
        };
        self.store.contains(&target).await
    }

    pub async fn seed_namespace(&self, name: &str) {
        self.store
            .insert(object(json!({
                "apiVersion": "v1",
                "kind": "Namespace",
                "metadata": {"name": name}
            })))
            .await
            .unwrap();
    }

    /// Report every rendered workload and hub object as ready
    pub async fn mark_ready(&self) {
        let kinds = [
            ("apps/v1", "Deployment", "Available"),
            ("operator.open-cluster-management.io/v1", "ClusterManager", "Applied"),
            ("cluster.open-cluster-management.io/v1", "ManagedCluster", "ManagedClusterJoined"),
        ];
        for (api_version, kind, condition) in kinds {
            for obj in self.store.list(api_version, kind, None, None).await.unwrap() {
                let target = ResourceRef::from_object(&obj).unwrap();
                self.store
                    .set_status(
                        &target,
                        json!({"conditions": [{"type": condition, "status": "True"}]}),
                    )
                    .await
                    .unwrap();
            }
        }
    }
}

pub fn object(value: serde_json::Value) -> DynamicObject {
    serde_json::from_value(value).unwrap()
}

pub fn toggles(pairs: &[(&str, bool)]) -> Vec<ComponentToggle> {
    pairs
        .iter()
        .map(|(name, enabled)| ComponentToggle::new(*name, *enabled))
        .collect()
}

/// An engine that already carries its finalizer and defaults, so a pass goes
/// straight to the preconditions
pub fn prepared_engine(spec: ClusterEngineSpec) -> ClusterEngine {
    let mut engine = ClusterEngine::new(ENGINE, spec);
    engine.finalizers_mut().push(ENGINE_FINALIZER.to_string());
    SubsystemTable::hub().apply_defaults(&mut engine, &environment());
    engine
}
