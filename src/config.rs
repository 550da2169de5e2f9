//! Environment-derived configuration
//!
//! Settings the operator picks up from its own process environment: the
//! trust-bundle name, detected platform facts, proxy overrides, and the
//! image reference table. They are read once per reconcile pass and folded
//! into the render context; rendering never reads the environment itself.

use std::collections::BTreeMap;

use crate::domain::{EnvironmentSource, ImageResolver, ImageTable};
use crate::error::Result;

pub const TRUSTED_CA_BUNDLE_ENV: &str = "TRUSTED_CA_BUNDLE";
pub const DEFAULT_TRUSTED_CA_BUNDLE: &str = "trusted-ca-bundle";
pub const PLATFORM_VERSION_ENV: &str = "ACM_HUB_OCP_VERSION";
pub const INGRESS_DOMAIN_ENV: &str = "ACM_CLUSTER_INGRESS_DOMAIN";
pub const OPERATOR_VERSION_ENV: &str = "OPERATOR_VERSION";
pub const DEFAULT_OPERATOR_VERSION: &str = "9.9.9";
pub const HUB_TYPE_ENV: &str = "OPERATOR_MODE";
pub const DEFAULT_HUB_TYPE: &str = "mce";
pub const DEFAULT_IMAGE_PREFIX: &str = "OPERAND_IMAGE_";

/// Proxy variables, overridden as a unit
pub const PROXY_VARS: [&str; 3] = ["HTTP_PROXY", "HTTPS_PROXY", "NO_PROXY"];

// =============================================================================
// Environment Config
// =============================================================================

/// Settings derived from the operator's environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentConfig {
    /// Name of the CA trust bundle ConfigMap
    pub trust_bundle_name: String,
    /// Detected platform version, empty when unknown
    pub platform_version: String,
    /// Detected cluster ingress domain
    pub ingress_domain: String,
    /// HTTP(S)/NO_PROXY overrides; empty unless at least one is set
    pub proxy: BTreeMap<String, String>,
    /// Version this operator converges towards
    pub operator_version: String,
    /// Hub flavour rendered into templates
    pub hub_type: String,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            trust_bundle_name: DEFAULT_TRUSTED_CA_BUNDLE.to_string(),
            platform_version: String::new(),
            ingress_domain: String::new(),
            proxy: BTreeMap::new(),
            operator_version: DEFAULT_OPERATOR_VERSION.to_string(),
            hub_type: DEFAULT_HUB_TYPE.to_string(),
        }
    }
}

impl EnvironmentConfig {
    /// Build from a variable lookup function
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let proxy_values: Vec<(String, String)> = PROXY_VARS
            .iter()
            .map(|key| (key.to_string(), lookup(key).unwrap_or_default()))
            .collect();
        let proxy = if proxy_values.iter().any(|(_, v)| !v.is_empty()) {
            proxy_values.into_iter().collect()
        } else {
            BTreeMap::new()
        };

        Self {
            trust_bundle_name: non_empty(TRUSTED_CA_BUNDLE_ENV)
                .unwrap_or_else(|| DEFAULT_TRUSTED_CA_BUNDLE.to_string()),
            platform_version: non_empty(PLATFORM_VERSION_ENV).unwrap_or_default(),
            ingress_domain: non_empty(INGRESS_DOMAIN_ENV).unwrap_or_default(),
            proxy,
            operator_version: non_empty(OPERATOR_VERSION_ENV)
                .unwrap_or_else(|| DEFAULT_OPERATOR_VERSION.to_string()),
            hub_type: non_empty(HUB_TYPE_ENV).unwrap_or_else(|| DEFAULT_HUB_TYPE.to_string()),
        }
    }
}

/// Reads the process environment on every pass
#[derive(Debug, Clone, Default)]
pub struct ProcessEnvironment {
    operator_version: Option<String>,
}

impl ProcessEnvironment {
    /// Pin the operator version regardless of `OPERATOR_VERSION`
    pub fn with_operator_version(mut self, version: impl Into<String>) -> Self {
        self.operator_version = Some(version.into());
        self
    }
}

impl EnvironmentSource for ProcessEnvironment {
    fn load(&self) -> EnvironmentConfig {
        let mut config = EnvironmentConfig::from_lookup(|key| std::env::var(key).ok());
        if let Some(version) = &self.operator_version {
            config.operator_version = version.clone();
        }
        config
    }
}

/// Fixed configuration, used by tests and hosted deployments
#[derive(Debug, Clone, Default)]
pub struct StaticEnvironment(pub EnvironmentConfig);

impl EnvironmentSource for StaticEnvironment {
    fn load(&self) -> EnvironmentConfig {
        self.0.clone()
    }
}

// =============================================================================
// Image Resolution
// =============================================================================

/// Resolves images from `<prefix><NAME>` variables; `NAME` lower-cased
/// becomes the logical image name.
#[derive(Debug, Clone)]
pub struct EnvImageResolver {
    prefix: String,
}

impl EnvImageResolver {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Collect the table from an explicit set of variables
    pub fn collect<I>(&self, vars: I) -> ImageTable
    where
        I: IntoIterator<Item = (String, String)>,
    {
        vars.into_iter()
            .filter(|(_, value)| !value.is_empty())
            .filter_map(|(key, value)| {
                key.strip_prefix(&self.prefix)
                    .filter(|name| !name.is_empty())
                    .map(|name| (name.to_lowercase(), value))
            })
            .collect()
    }
}

impl Default for EnvImageResolver {
    fn default() -> Self {
        Self::new(DEFAULT_IMAGE_PREFIX)
    }
}

impl ImageResolver for EnvImageResolver {
    fn resolve(&self) -> Result<ImageTable> {
        Ok(self.collect(std::env::vars()))
    }
}

/// Fixed image table
#[derive(Debug, Clone, Default)]
pub struct StaticImageResolver(pub ImageTable);

impl StaticImageResolver {
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

impl ImageResolver for StaticImageResolver {
    fn resolve(&self) -> Result<ImageTable> {
        Ok(self.0.clone())
    }
}
