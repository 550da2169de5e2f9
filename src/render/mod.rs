//! Template Rendering
//!
//! Produces the concrete resources of a subsystem from its template bundle
//! and the per-pass render context:
//! - [`bundle`]: embedded and directory-backed template bundles
//! - [`values`]: the render context
//! - [`engine`]: strict minijinja rendering into `DynamicObject`s
//! - [`filters`]: custom template filters

pub mod bundle;
pub mod engine;
pub mod filters;
pub mod values;

pub use bundle::{BundleSource, Fragment, TemplateBundle};
pub use engine::TemplateRenderer;
pub use values::Values;

/// Label naming the owning ClusterEngine on every rendered object
pub const NAME_LABEL: &str = "multicluster.billyronks.io/name";

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "cluster-engine-operator";

/// Kinds whose namespace is always the target namespace
pub const NAMESPACED_KINDS: &[&str] = &[
    "ConfigMap",
    "Deployment",
    "Role",
    "RoleBinding",
    "Route",
    "Secret",
    "Service",
    "ServiceAccount",
];
