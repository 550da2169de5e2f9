//! Resource addressing
//!
//! A [`ResourceRef`] is the (group, version, kind, namespace, name) address
//! used by every store operation. Rendered resources are plain
//! [`DynamicObject`]s; the helpers here read their identity back out.

use kube::api::{ApiResource, DynamicObject};
use kube::core::GroupVersionKind;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Address of a single object in the resource store
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceRef {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceRef {
    /// Address a cluster-scoped object
    pub fn cluster(api_version: &str, kind: &str, name: &str) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            namespace: None,
            name: name.to_string(),
        }
    }

    /// Address a namespaced object
    pub fn namespaced(api_version: &str, kind: &str, namespace: &str, name: &str) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            namespace: Some(namespace.to_string()),
            name: name.to_string(),
        }
    }

    /// Read the address of a rendered or fetched object
    pub fn from_object(obj: &DynamicObject) -> Result<Self> {
        let types = obj.types.as_ref().ok_or_else(|| {
            Error::Internal("object is missing apiVersion/kind".to_string())
        })?;
        let name = obj.metadata.name.clone().ok_or_else(|| {
            Error::Internal(format!("{} object is missing metadata.name", types.kind))
        })?;
        Ok(Self {
            api_version: types.api_version.clone(),
            kind: types.kind.clone(),
            namespace: obj.metadata.namespace.clone(),
            name,
        })
    }

    pub fn group(&self) -> String {
        parse_api_version(&self.api_version).0
    }

    pub fn version(&self) -> String {
        parse_api_version(&self.api_version).1
    }

    pub fn gvk(&self) -> GroupVersionKind {
        let (group, version) = parse_api_version(&self.api_version);
        GroupVersionKind::gvk(&group, &version, &self.kind)
    }

    /// API resource descriptor for dynamic clients
    pub fn api_resource(&self) -> ApiResource {
        ApiResource::from_gvk_with_plural(&self.gvk(), &pluralize_kind(&self.kind))
    }

    /// `ns/name` for namespaced objects, `name` otherwise
    pub fn qualified_name(&self) -> String {
        match &self.namespace {
            Some(ns) if !ns.is_empty() => format!("{}/{}", ns, self.name),
            _ => self.name.clone(),
        }
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{} {}>", self.kind, self.qualified_name())
    }
}

/// Split an apiVersion into (group, version); the core group is empty
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Kinds whose plural is not derivable by the simple rules
const KIND_PLURALS: &[(&str, &str)] = &[
    ("endpoints", "endpoints"),
    ("ingress", "ingresses"),
    ("networkpolicy", "networkpolicies"),
    ("podsecuritypolicy", "podsecuritypolicies"),
];

/// Lower-case plural resource name for a kind
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();

    if let Some((_, plural)) = KIND_PLURALS.iter().find(|(singular, _)| *singular == lower) {
        return (*plural).to_string();
    }

    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

/// Address of the object, or a bare stand-in for error messages
pub fn describe(obj: &DynamicObject) -> String {
    ResourceRef::from_object(obj)
        .map(|r| r.to_string())
        .unwrap_or_else(|_| "<unnamed object>".to_string())
}
