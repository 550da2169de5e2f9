//! Domain Ports - Core trait definitions for the engine operator
//!
//! These traits define the boundaries between the reconcile core and the
//! systems it drives. Adapters implement these traits to provide concrete
//! functionality: the kube-backed store in production and the in-memory
//! store in tests.

use crate::config::EnvironmentConfig;
use crate::crd::ClusterEngine;
use crate::domain::ResourceRef;
use crate::error::Result;
use async_trait::async_trait;
use kube::api::DynamicObject;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Logical image name → image address
pub type ImageTable = BTreeMap<String, String>;

// =============================================================================
// Resource Store Port
// =============================================================================

/// Port for reads and writes against the cluster's resource store
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Fetch an object; `None` when it does not exist
    async fn get(&self, target: &ResourceRef) -> Result<Option<DynamicObject>>;

    /// Create an object; fails with `AlreadyExists` when present
    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Forced declarative merge: every field in `obj` wins, others are kept
    async fn apply(&self, obj: &DynamicObject, field_manager: &str) -> Result<DynamicObject>;

    /// Request deletion; fails with `NotFound` when absent
    async fn delete(&self, target: &ResourceRef) -> Result<()>;

    /// List objects of a kind, optionally filtered by namespace and label selector
    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>>;

    /// Fetch the desired-state object
    async fn get_engine(&self, name: &str) -> Result<Option<ClusterEngine>>;

    /// Write spec and metadata; fails with `Conflict` on a stale resourceVersion
    async fn replace_engine(&self, engine: &ClusterEngine) -> Result<ClusterEngine>;

    /// Write the status subresource; fails with `Conflict` on a stale resourceVersion
    async fn replace_engine_status(&self, engine: &ClusterEngine) -> Result<ClusterEngine>;

    /// Whether the API server serves `kind` under `api_version`
    async fn api_installed(&self, api_version: &str, kind: &str) -> Result<bool>;
}

// =============================================================================
// Image Resolver Port
// =============================================================================

/// Port resolving the image reference table
pub trait ImageResolver: Send + Sync {
    /// Resolve all known images. An empty table is returned as-is; the caller
    /// decides that it is a failure.
    fn resolve(&self) -> Result<ImageTable>;
}

// =============================================================================
// Environment Port
// =============================================================================

/// Port for the environment-derived settings read once per pass
pub trait EnvironmentSource: Send + Sync {
    fn load(&self) -> EnvironmentConfig;
}

// =============================================================================
// Upgrade Gate Port
// =============================================================================

/// Upgrade eligibility published to the external package manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeSignal {
    pub upgradeable: bool,
    pub reason: String,
    pub message: String,
}

impl UpgradeSignal {
    pub fn upgradeable() -> Self {
        Self {
            upgradeable: true,
            reason: "Upgradeable".to_string(),
            message: String::new(),
        }
    }

    pub fn blocked(message: impl Into<String>) -> Self {
        Self {
            upgradeable: false,
            reason: "UpgradeInProgress".to_string(),
            message: message.into(),
        }
    }
}

/// Port receiving the upgrade gate signal
#[async_trait]
pub trait UpgradeGate: Send + Sync {
    async fn publish(&self, signal: &UpgradeSignal) -> Result<()>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ResourceStoreRef = Arc<dyn ResourceStore>;
pub type ImageResolverRef = Arc<dyn ImageResolver>;
pub type EnvironmentSourceRef = Arc<dyn EnvironmentSource>;
pub type UpgradeGateRef = Arc<dyn UpgradeGate>;
