//! Render context
//!
//! Everything a template may reference, flattened into one serializable
//! value. Built once per pass from the desired state, the environment, and
//! the resolved image table.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::config::EnvironmentConfig;
use crate::crd::{ClusterEngine, Toleration};
use crate::domain::ImageTable;

/// Organization name rendered into workload labels
pub const ORG: &str = "open-cluster-management";

/// Values visible to every template
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Values {
    /// Name of the owning ClusterEngine
    pub engine_name: String,
    pub org: String,
    /// Logical image name (snake_case) → image address
    pub images: ImageTable,
    pub pull_policy: String,
    /// Pull secret name, empty when none is configured
    pub pull_secret: String,
    pub namespace: String,
    pub node_selector: BTreeMap<String, String>,
    pub replica_count: u32,
    pub tolerations: Vec<Toleration>,
    /// Proxy variables, empty unless at least one is overridden
    pub proxy_configs: BTreeMap<String, String>,
    pub ocp_version: String,
    pub cluster_ingress_domain: String,
    pub hub_type: String,
    pub hosted: bool,
}

impl Values {
    pub fn build(engine: &ClusterEngine, env: &EnvironmentConfig, images: &ImageTable) -> Self {
        Self {
            engine_name: engine.metadata.name.clone().unwrap_or_default(),
            org: ORG.to_string(),
            images: normalize_images(images),
            pull_policy: engine.pull_policy().to_string(),
            pull_secret: engine.spec.image_pull_secret.clone().unwrap_or_default(),
            namespace: engine.target_namespace().to_string(),
            node_selector: engine.spec.node_selector.clone(),
            replica_count: engine.availability().replica_count(),
            tolerations: engine.effective_tolerations(),
            proxy_configs: env.proxy.clone(),
            ocp_version: env.platform_version.clone(),
            cluster_ingress_domain: env.ingress_domain.clone(),
            hub_type: env.hub_type.clone(),
            hosted: engine.is_hosted(),
        }
    }
}

/// Image keys are addressed as attributes in templates, so `discovery-operator`
/// and `DISCOVERY_OPERATOR` both become `discovery_operator`.
fn normalize_images(images: &ImageTable) -> ImageTable {
    images
        .iter()
        .map(|(name, image)| (name.to_lowercase().replace('-', "_"), image.clone()))
        .collect()
}
